//! The Metadata Generator stage: scan an archive into a `ctf_archive*.json`
//! index, optionally filtered by marker files.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use ctfforge_archive::{
    CHALLENGE_JSON, TaskLayout, has_compose_enabled, has_flagcheck_file, has_sha256_file,
    is_task_directory, walk_directories,
};
use ctfforge_shared::{BENCHMARK_NAME, ChallengeIndex, CtfForgeError, IndexEntry, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::pool::map_blocking;

// ---------------------------------------------------------------------------
// Marker filter
// ---------------------------------------------------------------------------

/// Which challenges make it into the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerFilter {
    /// Keep only challenges with a SHA256 flag file.
    pub require_sha256: bool,
    /// Drop challenges with a SHA256 flag file.
    pub skip_sha256: bool,
    /// Drop challenges with a `flagcheck` file at any depth.
    pub skip_flagcheck: bool,
    /// Keep only challenges whose `challenge.json` has `"compose": true`.
    pub require_compose: bool,
}

impl MarkerFilter {
    pub fn validate(&self) -> Result<()> {
        if self.require_sha256 && self.skip_sha256 {
            return Err(CtfForgeError::validation(
                "--require-sha256 and --skip-sha256 are mutually exclusive",
            ));
        }
        Ok(())
    }

    /// Whether the directory is a challenge that passes every active filter.
    pub fn accepts(&self, dir: &Path) -> bool {
        if !is_task_directory(dir) {
            return false;
        }
        if self.skip_flagcheck && has_flagcheck_file(dir) {
            return false;
        }
        if self.require_compose && !has_compose_enabled(dir) {
            return false;
        }
        if self.require_sha256 {
            has_sha256_file(dir)
        } else if self.skip_sha256 {
            !has_sha256_file(dir)
        } else {
            true
        }
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.require_sha256 {
            parts.push("with SHA256 file");
        } else if self.skip_sha256 {
            parts.push("without SHA256 file");
        }
        if self.skip_flagcheck {
            parts.push("without flagcheck");
        }
        if self.require_compose {
            parts.push("with compose=true");
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Split every non-hidden directory below `base` into accepted and rejected,
/// checking at most `workers` directories at a time. Both lists are sorted.
#[instrument(skip_all, fields(base = %base.display(), workers = workers))]
pub async fn scan_directories(
    base: &Path,
    filter: MarkerFilter,
    workers: usize,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let dirs = walk_directories(base);
    info!(directories = dirs.len(), filter = %filter.describe(), "scanning archive");

    let checked = map_blocking(dirs, workers, move |dir: PathBuf| {
        let accepted = filter.accepts(&dir);
        (dir, accepted)
    })
    .await?;

    let (accepted, rejected): (Vec<_>, Vec<_>) = checked.into_iter().partition(|(_, ok)| *ok);
    let mut accepted: Vec<PathBuf> = accepted.into_iter().map(|(dir, _)| dir).collect();
    let mut rejected: Vec<PathBuf> = rejected.into_iter().map(|(dir, _)| dir).collect();
    accepted.sort();
    rejected.sort();
    debug!(accepted = accepted.len(), rejected = rejected.len(), "scan complete");
    Ok((accepted, rejected))
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

fn key_part(s: &str) -> String {
    s.replace(' ', "_").to_lowercase()
}

/// Index key `ca-{event}-{category}-{task}`, or `ca-{event}-{task}` without a
/// category. Spaces become `_`, brackets are dropped from the task.
pub fn index_key(event: &str, category: Option<&str>, task: &str) -> String {
    let task = key_part(&task.replace(['[', ']'], ""));
    let event = key_part(event);
    match category {
        Some(category) => format!("ca-{event}-{}-{task}", key_part(category)),
        None => format!("ca-{event}-{task}"),
    }
}

fn read_challenge_json(dir: &Path) -> Option<serde_json::Map<String, Value>> {
    let path = dir.join(CHALLENGE_JSON);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            warn!(path = %path.display(), "challenge.json is not an object");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable challenge.json");
            None
        }
    }
}

fn entry_for(base: &Path, dir: &Path) -> Option<(String, IndexEntry)> {
    let Some(layout) = TaskLayout::from_path(base, dir) else {
        warn!(dir = %dir.display(), "skipping directory with invalid structure");
        return None;
    };

    let (category, challenge) = match read_challenge_json(dir) {
        Some(json) => {
            let category = match json.get("category") {
                Some(value) => value.as_str().map(str::to_string),
                None => layout.category.clone(),
            };
            let challenge = match json.get("name") {
                Some(value) => value.as_str().map(str::to_string).unwrap_or_default(),
                None => layout.task.clone(),
            };
            (category, challenge)
        }
        None => (layout.category.clone(), layout.task.clone()),
    };

    let key = index_key(&layout.event, category.as_deref(), &layout.task);
    let entry = IndexEntry {
        benchmark: BENCHMARK_NAME.to_string(),
        event: layout.event,
        challenge,
        path: dir.to_string_lossy().into_owned(),
        category,
    };
    Some((key, entry))
}

/// Build the index of every accepted challenge below `base`.
#[instrument(skip_all, fields(base = %base.display()))]
pub async fn generate_index(
    base: &Path,
    filter: MarkerFilter,
    workers: usize,
) -> Result<ChallengeIndex> {
    filter.validate()?;
    if !base.is_dir() {
        return Err(CtfForgeError::validation(format!(
            "{} directory not found",
            base.display()
        )));
    }

    let (accepted, _) = scan_directories(base, filter, workers).await?;
    let index: ChallengeIndex = accepted
        .iter()
        .filter_map(|dir| entry_for(base, dir))
        .collect();
    info!(challenges = index.len(), "index generated");
    Ok(index)
}

/// Default output name for `filter`.
pub fn output_file_name(filter: &MarkerFilter) -> String {
    let mut name = String::from("ctf_archive");
    if filter.require_sha256 {
        name.push_str("_sha256");
    } else if filter.skip_sha256 {
        name.push_str("_no_sha256");
    }
    if filter.skip_flagcheck {
        name.push_str("_no_flagcheck");
    }
    if filter.require_compose {
        name.push_str("_compose");
    }
    name.push_str(".json");
    name
}

/// Summary figures of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub events: usize,
    pub categories: usize,
    pub total: usize,
}

impl IndexStats {
    pub fn of(index: &ChallengeIndex) -> Self {
        let events: BTreeSet<&str> = index.values().map(|e| e.event.as_str()).collect();
        let categories: BTreeSet<&str> = index
            .values()
            .filter_map(|e| e.category.as_deref())
            .collect();
        Self {
            events: events.len(),
            categories: categories.len(),
            total: index.len(),
        }
    }
}

/// Write `index` as indented JSON.
pub fn write_index(path: &Path, index: &ChallengeIndex) -> Result<()> {
    let json = serde_json::to_string_pretty(index)
        .map_err(|e| CtfForgeError::parse(format!("cannot serialize index: {e}")))?;
    std::fs::write(path, json).map_err(|e| CtfForgeError::io(path, e))
}

/// Load an index written by [`write_index`].
pub fn read_index(path: &Path) -> Result<ChallengeIndex> {
    let content = std::fs::read_to_string(path).map_err(|e| CtfForgeError::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| CtfForgeError::parse(format!("invalid index {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{temp_tree, write};

    fn challenge(root: &Path, rel: &str) -> PathBuf {
        write(root, &format!("{rel}/REHOST.md"), "rehost");
        write(root, &format!("{rel}/DESCRIPTION.md"), "desc");
        root.join(rel)
    }

    fn sample_archive(prefix: &str) -> PathBuf {
        let root = temp_tree(prefix);
        challenge(&root, "0ctf2017/diethard");
        let hashed = challenge(&root, "csaw/pwn/My Task [2]");
        write(&hashed, "flag.sha256", "abc");
        let checked = challenge(&root, "csaw/rev/crackme");
        write(&checked, "dist/flagCheck.py", "x");
        let hosted = challenge(&root, "csaw/web/portal");
        write(
            &hosted,
            "challenge.json",
            r#"{"name": "Portal ☕", "category": "web", "compose": true}"#,
        );
        write(&root, "csaw/notes/README.md", "not a challenge");
        challenge(&root, ".hidden/evt/task");
        root
    }

    #[test]
    fn keys() {
        assert_eq!(index_key("0ctf2017", None, "diethard"), "ca-0ctf2017-diethard");
        assert_eq!(index_key("Event", Some("pwn"), "My Task"), "ca-event-pwn-my_task");
        assert_eq!(
            index_key("csaw", Some("Binary Exploitation"), "[x] y"),
            "ca-csaw-binary_exploitation-x_y"
        );
    }

    #[test]
    fn output_names() {
        assert_eq!(output_file_name(&MarkerFilter::default()), "ctf_archive.json");
        let filter = MarkerFilter {
            require_sha256: true,
            skip_flagcheck: true,
            require_compose: true,
            ..MarkerFilter::default()
        };
        assert_eq!(output_file_name(&filter), "ctf_archive_sha256_no_flagcheck_compose.json");
        let skip = MarkerFilter {
            skip_sha256: true,
            ..MarkerFilter::default()
        };
        assert_eq!(output_file_name(&skip), "ctf_archive_no_sha256.json");
    }

    #[test]
    fn sha256_flags_are_exclusive() {
        let both = MarkerFilter {
            require_sha256: true,
            skip_sha256: true,
            ..MarkerFilter::default()
        };
        assert!(both.validate().is_err());
        assert!(MarkerFilter::default().validate().is_ok());
    }

    #[tokio::test]
    async fn indexes_challenges() {
        let root = sample_archive("cf-meta");
        let index = generate_index(&root, MarkerFilter::default(), 4).await.unwrap();
        let keys: Vec<&str> = index.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "ca-0ctf2017-diethard",
                "ca-csaw-pwn-my_task_2",
                "ca-csaw-rev-crackme",
                "ca-csaw-web-portal",
            ]
        );

        let portal = &index["ca-csaw-web-portal"];
        assert_eq!(portal.challenge, "Portal ☕");
        assert_eq!(portal.category.as_deref(), Some("web"));
        assert_eq!(portal.benchmark, "ctf-archive");
        assert!(index["ca-0ctf2017-diethard"].category.is_none());

        let stats = IndexStats::of(&index);
        assert_eq!(
            stats,
            IndexStats {
                events: 2,
                categories: 3,
                total: 4,
            }
        );

        let out = root.join("ctf_archive.json");
        write_index(&out, &index).unwrap();
        let written = std::fs::read_to_string(&out).unwrap();
        assert!(written.contains("Portal ☕"));
        assert_eq!(read_index(&out).unwrap(), index);

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn filters_by_markers() {
        let root = sample_archive("cf-meta-filter");
        let only = |filter: MarkerFilter| {
            let root = root.clone();
            async move {
                generate_index(&root, filter, 2)
                    .await
                    .unwrap()
                    .into_keys()
                    .collect::<Vec<_>>()
            }
        };

        let sha = only(MarkerFilter {
            require_sha256: true,
            ..MarkerFilter::default()
        })
        .await;
        assert_eq!(sha, vec!["ca-csaw-pwn-my_task_2"]);

        let no_check = only(MarkerFilter {
            skip_sha256: true,
            skip_flagcheck: true,
            ..MarkerFilter::default()
        })
        .await;
        assert_eq!(no_check, vec!["ca-0ctf2017-diethard", "ca-csaw-web-portal"]);

        let compose = only(MarkerFilter {
            require_compose: true,
            ..MarkerFilter::default()
        })
        .await;
        assert_eq!(compose, vec!["ca-csaw-web-portal"]);

        let (accepted, rejected) = scan_directories(&root, MarkerFilter::default(), 3)
            .await
            .unwrap();
        assert_eq!(accepted.len(), 4);
        assert!(rejected.contains(&root.join("csaw/notes")));
        assert!(!rejected.iter().any(|d| d.to_string_lossy().contains(".hidden")));

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn missing_base_is_an_error() {
        let missing = std::env::temp_dir().join("cf-meta-does-not-exist");
        let err = generate_index(&missing, MarkerFilter::default(), 1).await.unwrap_err();
        assert!(matches!(err, CtfForgeError::Validation { .. }));
    }
}
