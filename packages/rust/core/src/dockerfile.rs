//! Dockerfile text tooling: cleanup, validation, and post-generation patches.
//!
//! Everything here works on the Dockerfile as plain text. Images are never
//! built; validation only checks what can be seen statically against the
//! list of files the challenge ships.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use ctfforge_archive::{ProvidedLibraries, ShebangIssue, list_task_files};
use ctfforge_shared::{CtfForgeError, Result};
use regex::Regex;
use tracing::{debug, info};

/// Instructions that may start a line of a Dockerfile.
const INSTRUCTIONS: [&str; 17] = [
    "FROM",
    "RUN",
    "COPY",
    "ADD",
    "WORKDIR",
    "ENV",
    "EXPOSE",
    "CMD",
    "ENTRYPOINT",
    "USER",
    "VOLUME",
    "LABEL",
    "ARG",
    "ONBUILD",
    "STOPSIGNAL",
    "HEALTHCHECK",
    "SHELL",
];

/// Packages the injected setup block already installs.
const COMPREHENSIVE_PACKAGES: [&str; 35] = [
    "socat",
    "libc6:i386",
    "libstdc++6:i386",
    "lib32gcc-s1",
    "lib32stdc++6",
    "libgcc1:i386",
    "libpam0g:i386",
    "libc6-dev-i386",
    "libncurses5:i386",
    "build-essential",
    "curl",
    "wget",
    "git",
    "gdb",
    "strace",
    "ltrace",
    "python3",
    "python3-pip",
    "python3-dev",
    "binutils",
    "nasm",
    "gcc-multilib",
    "g++-multilib",
    "patchelf",
    "netcat-openbsd",
    "vim",
    "nano",
    "tmux",
    "valgrind",
    "binwalk",
    "unzip",
    "zip",
    "p7zip-full",
    "file",
    "hexedit",
];

/// `:i386` variants of essential packages that break apt on amd64 images.
const CONFLICTING_PACKAGES: [&str; 4] = [
    "coreutils:i386",
    "bash:i386",
    "util-linux:i386",
    "base-files:i386",
];

/// Base images the generator is expected to use.
const KNOWN_BASE_IMAGES: [&str; 6] = ["ubuntu:", "python:", "node:", "php:", "nginx:", "apache:"];

/// Extensions that never need `chmod +x`.
const NON_EXECUTABLE_EXTENSIONS: [&str; 7] = [".py", ".js", ".php", ".html", ".css", ".txt", ".md"];

const WEB_EXTENSIONS: [&str; 4] = [".html", ".php", ".css", ".js"];

/// Issue text for COPY sources that match nothing. Generation keys off it.
pub const UNMATCHED_FILES_ISSUE: &str = "does not match any available files";

// ---------------------------------------------------------------------------
// Line helpers
// ---------------------------------------------------------------------------

/// The instruction keyword a line starts with, if it is one. Keywords are
/// matched regardless of case and returned uppercase.
fn instruction(line: &str) -> Option<&'static str> {
    let word = line.split_whitespace().next()?;
    INSTRUCTIONS
        .iter()
        .copied()
        .find(|i| i.eq_ignore_ascii_case(word))
}

fn is_instruction(line: &str, name: &str) -> bool {
    instruction(line.trim()) == Some(name)
}

fn is_copy_or_add(line: &str) -> bool {
    matches!(instruction(line.trim()), Some("COPY" | "ADD"))
}

/// Lines with a trailing backslash whose next non-blank line starts a new
/// instruction, paired with that instruction.
fn backslashes_before_instructions(lines: &[&str]) -> Vec<(usize, &'static str)> {
    let mut found = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if !line.trim_end().ends_with('\\') {
            continue;
        }
        let next = lines[i + 1..].iter().find(|l| !l.trim().is_empty());
        if let Some(cmd) = next.and_then(|l| instruction(l.trim())) {
            found.push((i, cmd));
        }
    }
    found
}

/// Index one past the end of the instruction starting at `start`,
/// following backslash continuations.
fn block_end(lines: &[&str], start: usize) -> usize {
    let mut end = start;
    while end < lines.len() && lines[end].trim_end().ends_with('\\') {
        end += 1;
    }
    (end + 1).min(lines.len())
}

/// Index one past the end of a heredoc opened on `lines[start]`, or of the
/// plain instruction when there is none.
fn heredoc_end(lines: &[&str], start: usize) -> usize {
    static MARKER: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"<<-?\s*['"]?([A-Za-z_][A-Za-z0-9_]*)['"]?"#).expect("valid regex")
    });
    let Some(marker) = MARKER
        .captures(lines[start])
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
    else {
        return block_end(lines, start);
    };
    lines[start + 1..]
        .iter()
        .position(|l| l.trim() == marker)
        .map(|offset| start + offset + 2)
        .unwrap_or_else(|| block_end(lines, start))
}

/// Insert `block` at line index `at`, or before the first CMD/ENTRYPOINT
/// when `at` is `None`, or at the end.
fn insert_block(lines: &[&str], at: Option<usize>, block: &str) -> String {
    let at = at.unwrap_or_else(|| {
        lines
            .iter()
            .position(|l| is_instruction(l, "CMD") || is_instruction(l, "ENTRYPOINT"))
            .unwrap_or(lines.len())
    });
    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 1);
    out.extend_from_slice(&lines[..at]);
    out.push(block.trim_end_matches('\n'));
    out.extend_from_slice(&lines[at..]);
    out.join("\n")
}

// ---------------------------------------------------------------------------
// Fences
// ---------------------------------------------------------------------------

/// Drop a surrounding Markdown code fence from a model reply.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().skip(1).collect();
    if lines.last().is_some_and(|l| l.trim().starts_with("```")) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// Like [`strip_code_fence`] for YAML replies, which sometimes fence inline.
pub fn strip_compose_fence(text: &str) -> String {
    let mut content = text.trim();
    for prefix in ["```yaml", "```yml", "```"] {
        if let Some(rest) = content.strip_prefix(prefix) {
            content = rest;
            break;
        }
    }
    content.strip_suffix("```").unwrap_or(content).trim().to_string()
}

// ---------------------------------------------------------------------------
// Fixes
// ---------------------------------------------------------------------------

/// Remove trailing backslashes that would glue a new instruction onto the
/// previous one. Returns the fixed text and one message per fix.
pub fn fix_trailing_backslashes(content: &str) -> (String, Vec<String>) {
    let lines: Vec<&str> = content.lines().collect();
    let broken = backslashes_before_instructions(&lines);
    if broken.is_empty() {
        return (content.to_string(), Vec::new());
    }

    let mut fixed: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    let mut fixes = Vec::new();
    for (i, cmd) in broken {
        let stripped = {
            let line = fixed[i].trim_end();
            line[..line.len() - 1].trim_end().to_string()
        };
        fixed[i] = stripped;
        fixes.push(format!(
            "Line {}: Removed problematic trailing backslash before {cmd} command",
            i + 1
        ));
    }
    (fixed.join("\n"), fixes)
}

/// Drop RUN blocks that duplicate or break the injected setup: enabling
/// i386 again, installing only packages it already has, or pulling in
/// conflicting `:i386` core packages. Bare `RUN` lines go too.
pub fn remove_duplicate_setup(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        if !is_instruction(lines[i], "RUN") {
            kept.push(lines[i]);
            i += 1;
            continue;
        }
        let end = block_end(&lines, i);
        let block = lines[i..end].join("\n");
        if block.trim() == "RUN" {
            i = end;
            continue;
        }
        if duplicates_setup(&block) {
            debug!(block = %block, "dropping duplicate setup block");
        } else {
            kept.extend_from_slice(&lines[i..end]);
        }
        i = end;
    }
    kept.join("\n")
}

fn duplicates_setup(block: &str) -> bool {
    if block.contains("dpkg --add-architecture i386") {
        return true;
    }
    let packages = installed_packages(block);
    if packages.iter().any(|p| CONFLICTING_PACKAGES.contains(&p.as_str())) {
        return true;
    }
    !packages.is_empty()
        && packages
            .iter()
            .all(|p| COMPREHENSIVE_PACKAGES.contains(&p.as_str()))
        && is_apt_only(block)
}

/// Packages named by `apt-get install` / `apt install` commands in a RUN block.
fn installed_packages(block: &str) -> Vec<String> {
    let flat = block.replace("\\\n", " ");
    let mut packages = Vec::new();
    for command in flat.split("&&").flat_map(|c| c.split(';')) {
        let words: Vec<&str> = command.split_whitespace().collect();
        let Some(pos) = words.iter().position(|w| *w == "install") else {
            continue;
        };
        if !words[..pos].iter().any(|w| *w == "apt-get" || *w == "apt") {
            continue;
        }
        packages.extend(
            words[pos + 1..]
                .iter()
                .filter(|w| !w.starts_with('-') && **w != "\\" && **w != "||" && **w != "true")
                .map(|w| w.trim_matches(|c| c == '(' || c == ')').to_string())
                .filter(|w| !w.is_empty()),
        );
    }
    packages
}

fn is_apt_only(block: &str) -> bool {
    let flat = block.replace("\\\n", " ");
    let body = flat.trim_start().strip_prefix("RUN").unwrap_or(&flat);
    body.split("&&").all(|command| {
        let command = command.trim().trim_start_matches('(');
        command.is_empty()
            || command.starts_with("apt-get")
            || command.starts_with("apt ")
            || command.starts_with("rm -rf /var/lib/apt")
    })
}

/// Point COPY/ADD sources that name no listed file at the file they most
/// likely mean. Returns the fixed text and one message per rewrite.
pub fn fix_copy_paths(content: &str, files: &[String]) -> (String, Vec<String>) {
    let mut fixes = Vec::new();
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 || !is_copy_or_add(line) || line.contains("--from=") {
                return line.to_string();
            }
            let source = parts[1];
            if source.starts_with('.')
                || source.starts_with('-')
                || source.starts_with('[')
                || source.ends_with('*')
                || files.iter().any(|f| f == source)
                || files
                    .iter()
                    .any(|f| f.starts_with(&format!("{}/", source.trim_end_matches('/'))))
            {
                return line.to_string();
            }
            let Some(candidate) = files
                .iter()
                .find(|f| f.ends_with(source))
                .or_else(|| files.iter().find(|f| f.contains(source)))
            else {
                return line.to_string();
            };
            let source_has_ext = Path::new(source).extension().is_some();
            let candidate_has_ext = Path::new(candidate).extension().is_some();
            if !source_has_ext && candidate_has_ext {
                return line.to_string();
            }
            fixes.push(format!("Fixed file path: {source} -> {candidate}"));
            let keyword_end = line.find(parts[0]).map_or(0, |i| i + parts[0].len());
            let (head, tail) = line.split_at(keyword_end);
            format!("{head}{}", tail.replacen(source, candidate, 1))
        })
        .collect();
    (lines.join("\n"), fixes)
}

/// Apply the automatic fixes, then validate what is left.
pub fn validate_and_fix(content: &str, files: &[String]) -> (String, Vec<String>) {
    let (content, backslash_fixes) = fix_trailing_backslashes(content);
    let (content, path_fixes) = fix_copy_paths(&content, files);
    for fix in backslash_fixes.iter().chain(&path_fixes) {
        debug!(fix = %fix, "dockerfile fixed");
    }
    let issues = validate(&content, files);
    (content, issues)
}

// ---------------------------------------------------------------------------
// COPY sources
// ---------------------------------------------------------------------------

/// Files of the challenge a COPY/ADD source refers to.
pub fn expand_source_pattern(pattern: &str, files: &[String]) -> Vec<String> {
    let pattern = pattern.trim_matches(|c| c == '"' || c == '\'');
    if matches!(pattern, "." | "./" | "*") {
        return files.to_vec();
    }
    let pattern = pattern.strip_prefix("./").unwrap_or(pattern);

    if pattern.ends_with('/') {
        return files.iter().filter(|f| f.starts_with(pattern)).cloned().collect();
    }
    if pattern.contains(['*', '?', '[']) {
        return match glob::Pattern::new(pattern) {
            Ok(glob) => files
                .iter()
                .filter(|f| glob.matches(f) || glob.matches(basename(f)))
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        };
    }
    if files.iter().any(|f| f == pattern) {
        return vec![pattern.to_string()];
    }
    let dir_prefix = format!("{pattern}/");
    let under_dir: Vec<String> = files
        .iter()
        .filter(|f| f.starts_with(&dir_prefix))
        .cloned()
        .collect();
    if !under_dir.is_empty() {
        return under_dir;
    }
    files
        .iter()
        .filter(|f| basename(f) == pattern)
        .cloned()
        .collect()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Source arguments of a COPY/ADD line, or `None` for other lines and
/// copies from build stages.
fn copy_arguments(line: &str) -> Option<Vec<String>> {
    let line = line.trim();
    if !is_copy_or_add(line) || line.contains("--from=") {
        return None;
    }
    let rest = line.split_once(char::is_whitespace)?.1.trim();
    if rest.starts_with('[') {
        let args: Vec<String> = serde_json::from_str(rest).ok()?;
        return Some(args);
    }

    let parts: Vec<&str> = rest.split_whitespace().collect();
    let mut args = Vec::new();
    let mut i = 0;
    while i < parts.len() {
        let part = parts[i];
        if part.starts_with("--") {
            i += if part.contains('=') { 1 } else { 2 };
            continue;
        }
        args.push(part.trim_matches(|c| c == '"' || c == '\'').to_string());
        i += 1;
    }
    Some(args)
}

/// First source of a COPY/ADD line that has a destination.
pub fn copy_source(line: &str) -> Option<String> {
    let args = copy_arguments(line)?;
    if args.len() < 2 {
        return None;
    }
    args.into_iter().next()
}

/// COPY/ADD sources that match none of `files`. `.` and `..` always match.
pub fn missing_copy_sources(content: &str, files: &[String]) -> Vec<String> {
    content
        .lines()
        .filter_map(copy_source)
        .filter(|source| !matches!(source.as_str(), "." | ".." | "./"))
        .filter(|source| expand_source_pattern(source, files).is_empty())
        .collect()
}

/// Challenge files the Dockerfile copies, in listing order.
pub fn used_files(content: &str, files: &[String]) -> Vec<String> {
    let mut used = HashSet::new();
    for args in content.lines().filter_map(copy_arguments) {
        let Some((_dest, sources)) = args.split_last() else {
            continue;
        };
        for source in sources {
            used.extend(expand_source_pattern(source, files));
        }
    }
    files.iter().filter(|f| used.contains(*f)).cloned().collect()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Statically check a generated Dockerfile. An empty result means valid.
pub fn validate(content: &str, files: &[String]) -> Vec<String> {
    if content.trim().is_empty() {
        return vec!["Empty Dockerfile generated".into()];
    }
    let lines: Vec<&str> = content.lines().collect();
    let lower = content.to_lowercase();
    let mut issues = Vec::new();

    for (i, _) in backslashes_before_instructions(&lines) {
        issues.push(format!(
            "Line {}: Trailing backslash before new Docker command will cause build failure",
            i + 1
        ));
    }

    let from_line = lines.iter().find(|l| is_instruction(l, "FROM"));
    match from_line {
        None => issues.push("Missing FROM instruction".into()),
        Some(line) => {
            let image = line.split_whitespace().nth(1).unwrap_or("");
            let image_lower = image.to_lowercase();
            if !KNOWN_BASE_IMAGES.iter().any(|k| image_lower.contains(k)) {
                issues.push(format!(
                    "Unusual base image '{image}' - consider ubuntu, python, node, php, nginx or apache"
                ));
            }
        }
    }
    if !lines.iter().any(|l| is_instruction(l, "EXPOSE")) {
        issues.push(
            "Missing EXPOSE instruction - challenge needs to be accessible over network".into(),
        );
    }
    if !lines
        .iter()
        .any(|l| is_instruction(l, "CMD") || is_instruction(l, "ENTRYPOINT"))
    {
        issues.push("Missing CMD or ENTRYPOINT - service won't start automatically".into());
    }

    for source in missing_copy_sources(content, files) {
        issues.push(format!("File pattern '{source}' {UNMATCHED_FILES_ISSUE}"));
    }

    if lines.iter().any(|l| {
        let l = l.to_lowercase();
        is_copy_or_add(&l.to_uppercase()) && (l.contains("flag.sha256") || l.contains("flagcheck"))
    }) {
        issues.push("Security issue: trying to copy flag.sha256 or flagcheck files".into());
    }

    if files.iter().any(|f| f.ends_with(".py")) && !lower.contains("python") {
        issues.push("Python files detected but no Python installation found".into());
    }
    let has_executables = files
        .iter()
        .any(|f| !NON_EXECUTABLE_EXTENSIONS.iter().any(|ext| f.ends_with(ext)));
    if has_executables && !lower.contains("chmod") {
        issues.push("Executable files detected but no chmod permissions set".into());
    }
    let has_web = files
        .iter()
        .any(|f| WEB_EXTENSIONS.iter().any(|ext| f.ends_with(ext)));
    if has_web && !["apache", "nginx", "httpd"].iter().any(|s| lower.contains(s)) {
        issues.push("Web files detected but no web server installation found".into());
    }

    issues
}

// ---------------------------------------------------------------------------
// Post-generation patches
// ---------------------------------------------------------------------------

/// Replace the first FROM with `base_image`, the build ENV lines and the
/// setup block. Prepends them when there is no FROM.
pub fn inject_base_image(content: &str, base_image: &str, setup: &str) -> String {
    let header = format!(
        "FROM {base_image}\nENV DEBIAN_FRONTEND=noninteractive\nENV LC_CTYPE=C.UTF-8\n{}",
        setup.trim_end()
    );
    let header = header.trim_end();
    let lines: Vec<&str> = content.lines().collect();
    match lines.iter().position(|l| is_instruction(l, "FROM")) {
        Some(i) => {
            let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 4);
            out.extend_from_slice(&lines[..i]);
            out.push(header);
            out.extend_from_slice(&lines[i + 1..]);
            out.join("\n")
        }
        None => format!("{header}\n{content}"),
    }
}

/// Insert `block` after the last instruction that puts files into
/// `/challenge`: a COPY/ADD, or a RUN writing a heredoc there.
pub fn insert_after_last_copy(content: &str, block: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let last = lines.iter().rposition(|l| {
        l.contains("/challenge")
            && (is_copy_or_add(l) || (is_instruction(l, "RUN") && l.contains("<<")))
    });
    insert_block(&lines, last.map(|i| heredoc_end(&lines, i)), block)
}

/// Insert `block` after the last instruction touching `/challenge` or
/// running patchelf, so interpreter patches land after library patches.
pub fn insert_after_last_patch(content: &str, block: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let last = lines.iter().rposition(|l| {
        (l.contains("/challenge") || l.contains("patchelf"))
            && (is_copy_or_add(l) || is_instruction(l, "RUN"))
    });
    insert_block(&lines, last.map(|i| heredoc_end(&lines, i)), block)
}

/// Put the flag into `/flag` right before the service is exposed.
pub fn append_flag(content: &str, flag: &str) -> String {
    let line = format!("RUN echo '{flag}' > /flag && chmod 444 /flag");
    let lines: Vec<&str> = content.lines().collect();
    let at = lines
        .iter()
        .position(|l| is_instruction(l, "EXPOSE") || is_instruction(l, "CMD"));
    insert_block(&lines, Some(at.unwrap_or(lines.len())), &line)
}

/// A commented RUN instruction chaining `commands` with `&&`.
pub fn render_run(comment: &str, commands: &[String]) -> String {
    format!("# {comment}\nRUN {}", commands.join(" && \\\n    "))
}

/// RUN block rewriting problematic shebangs to `/usr/bin/env` lookups.
pub fn shebang_fix_command(issues: &[ShebangIssue]) -> Option<String> {
    if issues.is_empty() {
        return None;
    }
    let commands: Vec<String> = issues
        .iter()
        .map(|issue| {
            format!(
                "sed -i '1s|^#!.*$|#!/usr/bin/env {}|' /challenge/{}",
                shebang_replacement(&issue.shebang),
                issue.file
            )
        })
        .collect();
    Some(render_run("Fix interpreter paths in shebangs", &commands))
}

fn shebang_replacement(shebang: &str) -> String {
    let interpreter = shebang
        .trim_start_matches("#!")
        .split_whitespace()
        .next()
        .unwrap_or("");
    let name = basename(interpreter);
    if name.starts_with("python") {
        "python3".into()
    } else if name.starts_with("node") {
        "node".into()
    } else if name.is_empty() {
        "sh".into()
    } else {
        name.to_string()
    }
}

/// patchelf commands that make `binaries` load the bundled libraries.
pub fn library_fix_commands(libs: &ProvidedLibraries, binaries: &[String]) -> Vec<String> {
    if libs.is_empty() {
        return Vec::new();
    }
    let mut commands = Vec::new();
    if let Some(linker) = &libs.dynamic_linker {
        commands.push(format!("chmod +x /challenge/{linker}"));
    }
    for binary in binaries {
        if let Some(linker) = &libs.dynamic_linker {
            commands.push(format!(
                "patchelf --set-interpreter /challenge/{linker} /challenge/{binary}"
            ));
        }
        commands.push(format!("patchelf --set-rpath . /challenge/{binary}"));
    }
    commands
}

/// patchelf commands replacing non-standard ELF interpreters.
pub fn interpreter_fix_commands(
    interpreters: &BTreeMap<String, String>,
    libs: &ProvidedLibraries,
) -> Vec<String> {
    interpreters
        .iter()
        .map(|(binary, interpreter)| {
            let target = match &libs.dynamic_linker {
                Some(linker) => format!("/challenge/{linker}"),
                None if interpreter.contains("ld-linux.so.2") => "/lib/ld-linux.so.2".into(),
                None => "/lib64/ld-linux-x86-64.so.2".into(),
            };
            format!("patchelf --set-interpreter {target} /challenge/{binary}")
        })
        .collect()
}

/// First `pwn.college{...}` flag that is not a placeholder.
pub fn parse_flag(content: &str) -> Option<String> {
    static FLAG: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)pwn\.college\{[^}]+\}").expect("valid regex"));
    FLAG.find_iter(content)
        .map(|m| m.as_str())
        .find(|flag| !flag.contains("..."))
        .map(String::from)
}

/// Fix an existing Dockerfile next to its challenge files. Returns whether
/// anything changed.
pub fn fix_dockerfile_in_place(path: &Path) -> Result<bool> {
    let content = std::fs::read_to_string(path).map_err(|e| CtfForgeError::io(path, e))?;
    let dir = path
        .parent()
        .ok_or_else(|| {
            CtfForgeError::validation(format!("{} has no parent directory", path.display()))
        })?;
    let files = list_task_files(dir);

    let (fixed, mut fixes) = fix_trailing_backslashes(&content);
    let (fixed, path_fixes) = fix_copy_paths(&fixed, &files);
    fixes.extend(path_fixes);
    if fixes.is_empty() {
        return Ok(false);
    }

    for fix in &fixes {
        info!(path = %path.display(), fix = %fix, "fixed Dockerfile");
    }
    let mut fixed = fixed;
    if content.ends_with('\n') {
        fixed.push('\n');
    }
    std::fs::write(path, fixed).map_err(|e| CtfForgeError::io(path, e))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{temp_tree, write};

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    const VALID: &str = "FROM ubuntu:20.04
RUN apt-get update && apt-get install -y socat python3
WORKDIR /challenge
COPY chall /challenge/
COPY server.py /challenge/
RUN chmod +x /challenge/chall
EXPOSE 1337
CMD [\"socat\", \"TCP-LISTEN:1337,reuseaddr,fork\", \"EXEC:/challenge/chall\"]";

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_fence("```dockerfile\nFROM x\nRUN y\n```"), "FROM x\nRUN y");
        assert_eq!(strip_code_fence("FROM x"), "FROM x");
        assert_eq!(strip_code_fence("```\nFROM x"), "FROM x");
        assert_eq!(strip_compose_fence("```yaml\nservices: {}\n```"), "services: {}");
    }

    #[test]
    fn removes_backslash_before_instruction() {
        let content = "RUN apt-get update && \\\n    apt-get install -y socat \\\n\nCMD [\"sh\"]";
        let (fixed, fixes) = fix_trailing_backslashes(content);
        assert_eq!(fixed, "RUN apt-get update && \\\n    apt-get install -y socat\n\nCMD [\"sh\"]");
        assert_eq!(
            fixes,
            vec!["Line 2: Removed problematic trailing backslash before CMD command"]
        );

        // Continuation into a shell command is not an instruction.
        let shell = "RUN echo a && \\\n    make";
        assert!(fix_trailing_backslashes(shell).1.is_empty());

        let lowercase = "run echo a \\\ncmd [\"sh\"]";
        assert_eq!(fix_trailing_backslashes(lowercase).0, "run echo a\ncmd [\"sh\"]");
    }

    #[test]
    fn validates_complete_dockerfile() {
        let issues = validate(VALID, &files(&["chall", "server.py"]));
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn instructions_match_in_any_case() {
        let lowercase = VALID.replacen("FROM", "from", 1).replace("EXPOSE", "expose");
        let issues = validate(&lowercase, &files(&["chall", "server.py"]));
        assert!(issues.is_empty(), "{issues:?}");
        assert_eq!(copy_source("copy chall /challenge/").as_deref(), Some("chall"));
    }

    #[test]
    fn reports_missing_pieces() {
        let content = "FROM alpine:3\nCOPY nothere /challenge/\nCOPY flag.sha256 /\nCMD [\"x\"]";
        let issues = validate(content, &files(&["chall", "index.html"]));
        let joined = issues.join("\n");
        assert!(joined.contains("Missing EXPOSE instruction"));
        assert!(joined.contains("Unusual base image 'alpine:3'"));
        assert!(joined.contains("File pattern 'nothere' does not match any available files"));
        assert!(joined.contains("Security issue"));
        assert!(joined.contains("no chmod permissions set"));
        assert!(joined.contains("no web server installation found"));
        assert!(!joined.contains("Missing CMD"));

        assert_eq!(validate("  \n", &[]), vec!["Empty Dockerfile generated"]);
    }

    #[test]
    fn copy_sources_and_patterns() {
        assert_eq!(copy_source("COPY --chown=ctf:ctf chall /challenge/").as_deref(), Some("chall"));
        assert_eq!(copy_source("COPY --chown ctf chall /challenge/").as_deref(), Some("chall"));
        assert_eq!(copy_source("COPY --from=build /out /challenge/"), None);
        assert_eq!(copy_source("COPY chall"), None);
        assert_eq!(copy_source("RUN cp a b"), None);
        assert_eq!(copy_source(r#"COPY ["my file", "/challenge/"]"#).as_deref(), Some("my file"));

        let all = files(&["chall", "lib/libc.so.6", "web/index.html", "web/app.js"]);
        assert_eq!(expand_source_pattern(".", &all).len(), 4);
        assert_eq!(expand_source_pattern("web/", &all), files(&["web/index.html", "web/app.js"]));
        assert_eq!(expand_source_pattern("*.html", &all), files(&["web/index.html"]));
        assert_eq!(expand_source_pattern("lib", &all), files(&["lib/libc.so.6"]));
        assert_eq!(expand_source_pattern("libc.so.6", &all), files(&["lib/libc.so.6"]));
        assert_eq!(expand_source_pattern("./chall", &all), files(&["chall"]));
        assert!(expand_source_pattern("missing", &all).is_empty());

        let content = "COPY . /challenge/\nCOPY .. /x\nCOPY ghost /challenge/\nADD lib/ /challenge/lib/";
        assert_eq!(missing_copy_sources(content, &all), vec!["ghost"]);
    }

    #[test]
    fn used_files_follow_every_source() {
        let all = files(&["a.py", "b.py", "chall", "notes.txt"]);
        let content = "COPY *.py chall /challenge/\nCOPY --from=base /x /y";
        assert_eq!(used_files(content, &all), files(&["a.py", "b.py", "chall"]));
    }

    #[test]
    fn drops_duplicate_setup() {
        let content = "FROM ubuntu:20.04
RUN dpkg --add-architecture i386 && \\
    apt-get update
RUN apt-get update && apt-get install -y socat gdb && rm -rf /var/lib/apt/lists/*
RUN apt-get install -y coreutils:i386 libfoo
RUN apt-get install -y redis-server
RUN apt-get install -y socat && useradd ctf
RUN
WORKDIR /challenge";
        let cleaned = remove_duplicate_setup(content);
        assert_eq!(
            cleaned,
            "FROM ubuntu:20.04
RUN apt-get install -y redis-server
RUN apt-get install -y socat && useradd ctf
WORKDIR /challenge"
        );
    }

    #[test]
    fn fixes_copy_paths() {
        let all = files(&["bin/vuln", "src/app.py", "static/style.css"]);
        let content = "COPY vuln /challenge/\nCOPY app.py /challenge/\nCOPY static /challenge/static\nCOPY ./x /y";
        let (fixed, fixes) = fix_copy_paths(content, &all);
        assert_eq!(
            fixed,
            "COPY bin/vuln /challenge/\nCOPY src/app.py /challenge/\nCOPY static /challenge/static\nCOPY ./x /y"
        );
        assert_eq!(fixes.len(), 2);
        assert_eq!(fixes[0], "Fixed file path: vuln -> bin/vuln");

        // An extension-less source never grows an extension.
        let (unchanged, none) = fix_copy_paths("COPY app /challenge/", &all);
        assert_eq!(unchanged, "COPY app /challenge/");
        assert!(none.is_empty());
    }

    #[test]
    fn injects_base_image() {
        let content = "# header\nFROM python:3.9\nCOPY a /challenge/";
        let out = inject_base_image(content, "ubuntu:18.04", "RUN setup");
        assert_eq!(
            out,
            "# header\nFROM ubuntu:18.04\nENV DEBIAN_FRONTEND=noninteractive\nENV LC_CTYPE=C.UTF-8\nRUN setup\nCOPY a /challenge/"
        );
        let injected = inject_base_image("COPY a b", "ubuntu:20.04", "");
        assert!(injected.starts_with("FROM ubuntu:20.04\n"));
    }

    #[test]
    fn inserts_after_last_copy() {
        let content = "FROM x\nCOPY a /challenge/\nRUN cat <<'EOF' > /challenge/run.sh\n#!/bin/sh\nexec ./a\nEOF\nEXPOSE 1337\nCMD [\"sh\"]";
        let out = insert_after_last_copy(content, "# fix\nRUN fix");
        assert_eq!(
            out,
            "FROM x\nCOPY a /challenge/\nRUN cat <<'EOF' > /challenge/run.sh\n#!/bin/sh\nexec ./a\nEOF\n# fix\nRUN fix\nEXPOSE 1337\nCMD [\"sh\"]"
        );

        let no_copy = insert_after_last_copy("FROM x\nCMD [\"sh\"]", "RUN fix");
        assert_eq!(no_copy, "FROM x\nRUN fix\nCMD [\"sh\"]");

        let patched = insert_after_last_patch(
            "COPY a /challenge/\nRUN patchelf --set-rpath . /challenge/a && \\\n    true\nCMD x",
            "RUN interp",
        );
        assert_eq!(
            patched,
            "COPY a /challenge/\nRUN patchelf --set-rpath . /challenge/a && \\\n    true\nRUN interp\nCMD x"
        );
    }

    #[test]
    fn builds_fix_commands() {
        let libs = ProvidedLibraries::detect(&files(&["ld-linux.so.2", "libc.so.6"]));
        let commands = library_fix_commands(&libs, &files(&["chall"]));
        assert_eq!(
            commands,
            vec![
                "chmod +x /challenge/ld-linux.so.2",
                "patchelf --set-interpreter /challenge/ld-linux.so.2 /challenge/chall",
                "patchelf --set-rpath . /challenge/chall",
            ]
        );
        let block = render_run("Use bundled libraries", &commands);
        assert!(block.starts_with("# Use bundled libraries\nRUN chmod +x"));
        assert!(block.contains(" && \\\n    patchelf --set-interpreter"));

        let mut interpreters = BTreeMap::new();
        interpreters.insert("chall".to_string(), "/nix/store/abc/ld-linux.so.2".to_string());
        assert_eq!(
            interpreter_fix_commands(&interpreters, &ProvidedLibraries::default()),
            vec!["patchelf --set-interpreter /lib/ld-linux.so.2 /challenge/chall"]
        );

        let shebangs = vec![
            ShebangIssue {
                file: "solve.py".into(),
                shebang: "#!/opt/pwn.college/python".into(),
            },
            ShebangIssue {
                file: "run".into(),
                shebang: "#!/usr/local/bin/node --harmony".into(),
            },
        ];
        let fix = shebang_fix_command(&shebangs).unwrap();
        assert!(fix.contains("sed -i '1s|^#!.*$|#!/usr/bin/env python3|' /challenge/solve.py"));
        assert!(fix.contains("#!/usr/bin/env node|' /challenge/run"));
        assert!(shebang_fix_command(&[]).is_none());
    }

    #[test]
    fn parses_real_flags_only() {
        assert_eq!(parse_flag("RUN echo 'pwn.college{...}' > /flag"), None);
        assert_eq!(
            parse_flag("RUN echo 'pwn.college{...}'\nRUN echo 'PWN.COLLEGE{heap_m4st3r}' > /flag").as_deref(),
            Some("PWN.COLLEGE{heap_m4st3r}")
        );
        assert_eq!(parse_flag("FROM ubuntu"), None);
    }

    #[test]
    fn appends_flag_before_expose() {
        let out = append_flag("FROM x\nEXPOSE 1337\nCMD y", "pwn.college{t}");
        assert_eq!(
            out,
            "FROM x\nRUN echo 'pwn.college{t}' > /flag && chmod 444 /flag\nEXPOSE 1337\nCMD y"
        );
    }

    #[test]
    fn fixes_file_on_disk() {
        let root = temp_tree("cf-fix-dockerfile");
        write(&root, "bin/chall", "x");
        let path = write(
            &root,
            "Dockerfile",
            "FROM ubuntu:20.04\nRUN apt-get update \\\nCOPY chall /challenge/\nCMD [\"sh\"]\n",
        );
        assert!(fix_dockerfile_in_place(&path).unwrap());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "FROM ubuntu:20.04\nRUN apt-get update\nCOPY bin/chall /challenge/\nCMD [\"sh\"]\n"
        );
        assert!(!fix_dockerfile_in_place(&path).unwrap());
        std::fs::remove_dir_all(&root).ok();
    }
}
