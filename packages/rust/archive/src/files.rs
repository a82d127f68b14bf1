//! Task file inventory: which files a challenge ships and what they are.

use std::collections::HashSet;
use std::path::{Component, Path};

use walkdir::WalkDir;

use crate::scan::SHA256_FLAG_FILES;

/// Path components that are never part of a challenge's payload.
const EXCLUDED_COMPONENTS: [&str; 8] = [
    "REHOST.md",
    "DESCRIPTION.md",
    "README.md",
    ".git",
    "Dockerfile",
    "docker-compose.yml",
    "Users",
    "Cryptodome",
];

/// Entries shown by [`files_with_info`] before truncating.
const FILES_WITH_INFO_LIMIT: usize = 10;

const PATCHED_SUFFIX: &str = "_patched";

fn relative_components(rel: &Path) -> Vec<String> {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// All payload files below `dir` as `/`-separated relative paths, sorted.
pub fn list_task_files(dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let parts = relative_components(rel);
        if parts
            .iter()
            .any(|p| EXCLUDED_COMPONENTS.contains(&p.as_str()))
        {
            continue;
        }
        files.push(parts.join("/"));
    }

    let mut files = filter_out_patched_files(files);
    files.sort();
    files
}

/// Drop `x_patched` whenever `x` is present too.
pub fn filter_out_patched_files(files: Vec<String>) -> Vec<String> {
    let present: HashSet<String> = files.iter().cloned().collect();
    files
        .into_iter()
        .filter(|f| match f.strip_suffix(PATCHED_SUFFIX) {
            Some(original) => !present.contains(original),
            None => true,
        })
        .collect()
}

/// Trimmed content of the first SHA256 flag file in `dir`.
pub fn find_sha256_flag(dir: &Path) -> Option<String> {
    SHA256_FLAG_FILES.iter().find_map(|name| {
        let path = dir.join(name);
        if !path.is_file() {
            return None;
        }
        std::fs::read_to_string(&path)
            .ok()
            .map(|s| s.trim().to_string())
    })
}

/// Absolute path of the first file whose name contains `check`.
pub fn find_check_file(dir: &Path) -> Option<String> {
    WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            name != "Users" && name != "Cryptodome"
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .find(|e| {
            e.file_name()
                .to_string_lossy()
                .to_lowercase()
                .contains("check")
        })
        .map(|e| {
            std::path::absolute(e.path())
                .unwrap_or_else(|_| e.path().to_path_buf())
                .to_string_lossy()
                .into_owned()
        })
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

fn human_size(size: u64) -> String {
    if size > 1024 * 1024 {
        format!("{} MB", size / (1024 * 1024))
    } else if size > 1024 {
        format!("{} KB", size / 1024)
    } else {
        format!("{size} bytes")
    }
}

fn kind_from_extension(ext: &str) -> &'static str {
    match ext {
        "py" => "py script",
        "js" => "js script",
        "php" => "php script",
        "rb" => "rb script",
        "pl" => "pl script",
        "sh" => "sh script",
        "bat" => "bat script",
        "txt" | "md" | "rst" => "text file",
        "c" | "cpp" | "cc" | "cxx" | "h" | "hpp" => "C/C++ source",
        "java" => "Java source",
        "html" | "htm" => "HTML file",
        "css" => "CSS file",
        "json" => "JSON file",
        "xml" => "XML file",
        "sql" => "SQL file",
        "yml" | "yaml" => "YAML file",
        "zip" | "tar" | "gz" | "bz2" | "xz" | "7z" => "archive file",
        "jpg" | "jpeg" | "png" | "gif" | "bmp" | "svg" => "image file",
        "pdf" => "PDF file",
        "exe" | "dll" => "Windows executable",
        "so" => "shared library",
        "a" => "static library",
        "o" => "object file",
        _ => "unknown",
    }
}

/// One-line description: `"<kind>[ (executable)] - <size>"`.
pub fn describe_file(path: &Path) -> String {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return "missing file".into(),
    };
    if meta.is_dir() {
        return "directory".into();
    }

    let executable = is_executable(&meta);
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let kind = if executable && ext.is_empty() {
        "executable binary"
    } else {
        kind_from_extension(&ext)
    };
    let exec_flag = if executable { " (executable)" } else { "" };
    format!("{kind}{exec_flag} - {}", human_size(meta.len()))
}

/// Prompt-ready listing of the first files of a challenge with descriptions.
pub fn files_with_info(dir: &Path) -> String {
    let files = list_task_files(dir);
    if files.is_empty() {
        return "No files found".into();
    }

    let mut lines: Vec<String> = files
        .iter()
        .take(FILES_WITH_INFO_LIMIT)
        .map(|f| format!("  - {f}: {}", describe_file(&dir.join(f))))
        .collect();
    if files.len() > FILES_WITH_INFO_LIMIT {
        lines.push(format!(
            "  ... and {} more files",
            files.len() - FILES_WITH_INFO_LIMIT
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{temp_tree, write};

    #[test]
    fn lists_payload_files_only() {
        let root = temp_tree("cf-files");
        write(&root, "REHOST.md", "x");
        write(&root, "DESCRIPTION.md", "x");
        write(&root, "Dockerfile", "FROM ubuntu");
        write(&root, "vuln", "\x7fELF");
        write(&root, "vuln_patched", "\x7fELF");
        write(&root, "solver_patched", "x");
        write(&root, "src/main.c", "int main(){}");
        write(&root, ".git/config", "x");
        write(&root, "venv/Cryptodome/Cipher.py", "x");

        let files = list_task_files(&root);
        assert_eq!(files, vec!["solver_patched", "src/main.c", "vuln"]);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn patched_filtering() {
        let files = vec!["a".to_string(), "a_patched".into(), "b_patched".into()];
        assert_eq!(filter_out_patched_files(files), vec!["a", "b_patched"]);
    }

    #[test]
    fn sha256_and_check_files() {
        let root = temp_tree("cf-flagfiles");
        assert!(find_sha256_flag(&root).is_none());
        assert!(find_check_file(&root).is_none());

        write(&root, "flag.sha256.txt", "  deadbeef\n");
        write(&root, "tools/checker.py", "print()");
        assert_eq!(find_sha256_flag(&root).as_deref(), Some("deadbeef"));

        let check = find_check_file(&root).unwrap();
        assert!(Path::new(&check).is_absolute());
        assert!(check.ends_with("checker.py"));

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn describes_files() {
        let root = temp_tree("cf-describe");
        let script = write(&root, "solve.py", vec![b'#'; 2048]);
        assert_eq!(describe_file(&script), "py script - 2 KB");
        let notes = write(&root, "notes.txt", "hi");
        assert_eq!(describe_file(&notes), "text file - 2 bytes");
        assert_eq!(describe_file(&root.join("nope")), "missing file");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let bin = write(&root, "chall", vec![0u8; 10]);
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
            assert_eq!(describe_file(&bin), "executable binary (executable) - 10 bytes");
        }

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn files_with_info_truncates() {
        let root = temp_tree("cf-info-list");
        assert_eq!(files_with_info(&root), "No files found");
        for i in 0..12 {
            write(&root, &format!("data{i:02}.txt"), "x");
        }
        let listing = files_with_info(&root);
        assert_eq!(listing.lines().count(), 11);
        assert!(listing.starts_with("  - data00.txt: text file - 1 bytes"));
        assert!(listing.ends_with("  ... and 2 more files"));
        std::fs::remove_dir_all(&root).ok();
    }
}
