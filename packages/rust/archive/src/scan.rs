//! Challenge tree discovery and marker-file checks.

use std::path::{Component, Path, PathBuf};

use ctfforge_shared::TaskInfo;
use tracing::debug;
use walkdir::WalkDir;

use crate::module_yml::category_from_module_yml;

pub const REHOST_FILE: &str = "REHOST.md";
pub const DESCRIPTION_FILE: &str = "DESCRIPTION.md";
pub const CHALLENGE_JSON: &str = "challenge.json";
pub const DOCKERFILE: &str = "Dockerfile";
pub const COMPOSE_FILE: &str = "docker-compose.yml";
pub const INIT_FILE: &str = ".init";

/// Names a SHA256 flag file may have, in lookup order.
pub const SHA256_FLAG_FILES: [&str; 3] = ["flag.sha256", ".flag.sha256", "flag.sha256.txt"];

// ---------------------------------------------------------------------------
// Marker files
// ---------------------------------------------------------------------------

/// A challenge directory carries both `REHOST.md` and `DESCRIPTION.md`.
pub fn is_task_directory(dir: &Path) -> bool {
    dir.join(REHOST_FILE).exists() && dir.join(DESCRIPTION_FILE).exists()
}

/// Any SHA256 flag file directly inside `dir`.
pub fn has_sha256_file(dir: &Path) -> bool {
    SHA256_FLAG_FILES.iter().any(|name| dir.join(name).exists())
}

/// Any file at any depth whose name contains `flagcheck` (case-insensitive).
pub fn has_flagcheck_file(dir: &Path) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .any(|e| {
            e.file_name()
                .to_string_lossy()
                .to_lowercase()
                .contains("flagcheck")
        })
}

/// `challenge.json` exists and its `compose` value is JSON `true`.
pub fn has_compose_enabled(dir: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(dir.join(CHALLENGE_JSON)) else {
        return false;
    };
    match serde_json::from_str::<serde_json::Value>(&content) {
        Ok(value) => value.get("compose") == Some(&serde_json::Value::Bool(true)),
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "unparseable challenge.json");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Walking
// ---------------------------------------------------------------------------

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// Every directory strictly below `base`, pruning hidden subtrees. Sorted.
pub fn walk_directories(base: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = WalkDir::new(base)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    dirs.sort();
    dirs
}

/// All challenge directories below `base`, sorted.
pub fn find_task_directories(base: &Path) -> Vec<PathBuf> {
    walk_directories(base)
        .into_iter()
        .filter(|dir| is_task_directory(dir))
        .collect()
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Where a challenge sits in the archive: `event/task` or `event/category/task`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLayout {
    pub event: String,
    pub category: Option<String>,
    pub task: String,
}

impl TaskLayout {
    /// Derive the layout of `dir` relative to `base`. Deeper nesting keeps the
    /// third component as the task. Returns `None` above the task level.
    pub fn from_path(base: &Path, dir: &Path) -> Option<Self> {
        let rel = dir.strip_prefix(base).ok()?;
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();

        match parts.as_slice() {
            [event, task] => Some(Self {
                event: event.clone(),
                category: None,
                task: task.clone(),
            }),
            [event, category, task, ..] => Some(Self {
                event: event.clone(),
                category: Some(category.clone()),
                task: task.clone(),
            }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Challenge text files
// ---------------------------------------------------------------------------

fn read_trimmed(path: &Path) -> String {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Prose of `DESCRIPTION.md` on one line, without headings or the author footer.
pub fn read_description(dir: &Path) -> String {
    let content = read_trimmed(&dir.join(DESCRIPTION_FILE));
    let mut kept = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.starts_with("---") || line.starts_with("**Author:**") {
            break;
        }
        if !line.is_empty() && !line.starts_with('#') {
            kept.push(line);
        }
    }
    kept.join(" ")
}

pub fn read_rehost_content(dir: &Path) -> String {
    read_trimmed(&dir.join(REHOST_FILE))
}

pub fn read_init_content(dir: &Path) -> String {
    read_trimmed(&dir.join(INIT_FILE))
}

/// Gather everything the forge needs about one challenge directory.
pub fn extract_task_info(base: &Path, dir: &Path) -> Option<TaskInfo> {
    let layout = TaskLayout::from_path(base, dir)?;
    Some(TaskInfo {
        task_name: layout.task,
        task_path: dir.to_path_buf(),
        ctf_name: layout.event,
        category: category_from_module_yml(dir),
        description: read_description(dir),
        rehost_content: read_rehost_content(dir),
        init_content: read_init_content(dir),
    })
}
