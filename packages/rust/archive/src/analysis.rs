//! Content analysis of challenge files: binaries vs scripts, ELF details,
//! bundled libraries, and hints the Dockerfile generator relies on.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

/// Bytes inspected when sniffing a file's type.
const SNIFF_LEN: usize = 1024;

/// Shebang files larger than this are not inspected.
const MAX_SHEBANG_FILE_SIZE: u64 = 1024 * 1024;

const BINARY_MAGIC: [&[u8]; 6] = [
    b"\x7fELF",
    b"MZ",
    b"\xca\xfe\xba\xbe",
    b"\x89PNG",
    b"\xff\xd8\xff",
    b"PK",
];

const PYTHON_HINTS: [&str; 32] = [
    "import ", "from ", "def ", "class ", "if __name__", "print(", "print ", "len(", "str(",
    "int(", "list(", "range(", "open(", "with open", "for ", "while ", "try:", "except:",
    "finally:", "else:", "elif ", "__init__", "self.", "return ", "yield ", "lambda ",
    "isinstance(", "hasattr(", "getattr(", "setattr(", "async def", "await ",
];
const NODE_HINTS: [&str; 5] = ["require(", "const ", "let ", "var ", "function("];
const PHP_HINTS: [&str; 4] = ["<?php", "echo ", "$_GET", "$_POST"];
const RUBY_HINTS: [&str; 4] = ["require ", "class ", "def ", "end"];
const PERL_HINTS: [&str; 4] = ["use ", "my $", "sub ", "print "];
const LUA_HINTS: [&str; 3] = ["function ", "local ", "require"];
const SHELL_HINTS: [&str; 5] = ["#!/bin/sh", "#!/bin/bash", "echo ", "if [", "for "];

// ---------------------------------------------------------------------------
// Executable kind
// ---------------------------------------------------------------------------

/// What a file would run as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutableKind {
    Binary,
    Python,
    Node,
    Php,
    Ruby,
    Perl,
    Lua,
    Shell,
}

impl ExecutableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Python => "python",
            Self::Node => "node",
            Self::Php => "php",
            Self::Ruby => "ruby",
            Self::Perl => "perl",
            Self::Lua => "lua",
            Self::Shell => "shell",
        }
    }

    pub fn is_script(&self) -> bool {
        !matches!(self, Self::Binary)
    }

    fn from_shebang(line: &str) -> Option<Self> {
        let line = line.to_lowercase();
        if line.contains("python") {
            Some(Self::Python)
        } else if line.contains("node") || line.contains("js") {
            Some(Self::Node)
        } else if line.contains("php") {
            Some(Self::Php)
        } else if line.contains("ruby") {
            Some(Self::Ruby)
        } else if line.contains("perl") {
            Some(Self::Perl)
        } else if line.contains("lua") {
            Some(Self::Lua)
        } else if ["bash", "sh", "zsh", "dash"].iter().any(|s| line.contains(s)) {
            Some(Self::Shell)
        } else {
            None
        }
    }

    fn from_hints(head: &str) -> Option<Self> {
        let has = |hints: &[&str]| hints.iter().any(|h| head.contains(h));
        if has(PYTHON_HINTS.as_slice()) {
            Some(Self::Python)
        } else if has(NODE_HINTS.as_slice()) {
            Some(Self::Node)
        } else if has(PHP_HINTS.as_slice()) {
            Some(Self::Php)
        } else if has(RUBY_HINTS.as_slice()) {
            Some(Self::Ruby)
        } else if has(PERL_HINTS.as_slice()) {
            Some(Self::Perl)
        } else if has(LUA_HINTS.as_slice()) {
            Some(Self::Lua)
        } else if has(SHELL_HINTS.as_slice()) {
            Some(Self::Shell)
        } else {
            None
        }
    }

    fn from_extension(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.ends_with(".py") {
            Self::Python
        } else if name.ends_with(".js") || name.ends_with(".mjs") {
            Self::Node
        } else if name.ends_with(".php") {
            Self::Php
        } else if name.ends_with(".rb") {
            Self::Ruby
        } else if name.ends_with(".pl") {
            Self::Perl
        } else if name.ends_with(".lua") {
            Self::Lua
        } else {
            Self::Shell
        }
    }
}

fn read_prefix(path: &Path, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    std::fs::File::open(path)?
        .take(len as u64)
        .read_to_end(&mut buf)?;
    Ok(buf)
}

/// Decode a byte prefix as UTF-8, tolerating a character cut at the end.
fn utf8_prefix(bytes: &[u8]) -> Option<&str> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Some(s),
        Err(e) if e.error_len().is_none() => std::str::from_utf8(&bytes[..e.valid_up_to()]).ok(),
        Err(_) => None,
    }
}

/// Classify a file as a native binary or a script of some language.
/// Anything unreadable counts as a binary.
pub fn analyze_executable(path: &Path) -> ExecutableKind {
    let Ok(head) = read_prefix(path, SNIFF_LEN) else {
        return ExecutableKind::Binary;
    };

    if BINARY_MAGIC.iter().any(|magic| head.starts_with(magic)) || head.contains(&0) {
        return ExecutableKind::Binary;
    }
    let printable = head
        .iter()
        .filter(|b| (32..=126).contains(*b) || matches!(**b, 9 | 10 | 13))
        .count();
    if !head.is_empty() && printable * 10 < head.len() * 7 {
        return ExecutableKind::Binary;
    }

    let Some(text) = utf8_prefix(&head) else {
        return ExecutableKind::Binary;
    };
    let lines: Vec<&str> = text.lines().take(10).map(str::trim).collect();
    if let Some(first) = lines.first().filter(|l| l.starts_with("#!")) {
        if let Some(kind) = ExecutableKind::from_shebang(first) {
            return kind;
        }
    }
    if let Some(kind) = ExecutableKind::from_hints(&lines.join("\n").to_lowercase()) {
        return kind;
    }

    let total = text.chars().count();
    let readable = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .count();
    if total > 0 && readable * 10 > total * 8 {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return ExecutableKind::from_extension(&name);
    }
    ExecutableKind::Binary
}

// ---------------------------------------------------------------------------
// ELF
// ---------------------------------------------------------------------------

/// `EI_CLASS` of an ELF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

pub fn detect_elf_class(path: &Path) -> Option<ElfClass> {
    let head = read_prefix(path, 64).ok()?;
    if !head.starts_with(b"\x7fELF") {
        return None;
    }
    match head.get(4)? {
        1 => Some(ElfClass::Elf32),
        2 => Some(ElfClass::Elf64),
        _ => None,
    }
}

fn read_uint(bytes: &[u8], offset: usize, width: usize, little: bool) -> Option<u64> {
    let slice = bytes.get(offset..offset.checked_add(width)?)?;
    let mut value = 0u64;
    if little {
        for (i, b) in slice.iter().enumerate() {
            value |= (*b as u64) << (8 * i);
        }
    } else {
        for b in slice {
            value = (value << 8) | *b as u64;
        }
    }
    Some(value)
}

const PT_INTERP: u64 = 3;

/// Program interpreter (`PT_INTERP`) requested by an ELF executable.
pub fn elf_interpreter(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    if !bytes.starts_with(b"\x7fELF") {
        return None;
    }
    let is64 = match bytes.get(4)? {
        1 => false,
        2 => true,
        _ => return None,
    };
    let little = *bytes.get(5)? == 1;

    // (phoff offset, phoff width, phentsize offset, phnum offset)
    let (phoff_at, word, phentsize_at, phnum_at) = if is64 {
        (0x20, 8, 0x36, 0x38)
    } else {
        (0x1c, 4, 0x2a, 0x2c)
    };
    let phoff = read_uint(&bytes, phoff_at, word, little)? as usize;
    let phentsize = read_uint(&bytes, phentsize_at, 2, little)? as usize;
    let phnum = read_uint(&bytes, phnum_at, 2, little)? as usize;

    for i in 0..phnum {
        let header = phoff.checked_add(i.checked_mul(phentsize)?)?;
        if read_uint(&bytes, header, 4, little)? != PT_INTERP {
            continue;
        }
        let (offset, size) = if is64 {
            (
                read_uint(&bytes, header + 8, 8, little)?,
                read_uint(&bytes, header + 32, 8, little)?,
            )
        } else {
            (
                read_uint(&bytes, header + 4, 4, little)?,
                read_uint(&bytes, header + 16, 4, little)?,
            )
        };
        let start = offset as usize;
        let raw = bytes.get(start..start.checked_add(size as usize)?)?;
        let raw = raw.split(|b| *b == 0).next().unwrap_or(raw);
        return Some(String::from_utf8_lossy(raw).into_owned());
    }
    None
}

/// Target architecture of the challenge container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Bits32,
    Bits64,
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bits32 => f.write_str("32"),
            Self::Bits64 => f.write_str("64"),
        }
    }
}

/// Pick the container architecture from the ELF binaries in `files`.
///
/// Any 32-bit binary wins (those need i386 support); otherwise the 64-bit
/// binaries. Without ELF binaries the result is `(Bits64, [])`.
pub fn binary_architecture(dir: &Path, files: &[String]) -> (Architecture, Vec<String>) {
    let mut bits32 = Vec::new();
    let mut bits64 = Vec::new();
    for file in files {
        let path = dir.join(file);
        if analyze_executable(&path) != ExecutableKind::Binary {
            continue;
        }
        match detect_elf_class(&path) {
            Some(ElfClass::Elf32) => bits32.push(file.clone()),
            Some(ElfClass::Elf64) => bits64.push(file.clone()),
            None => {}
        }
    }

    if !bits32.is_empty() {
        (Architecture::Bits32, bits32)
    } else {
        (Architecture::Bits64, bits64)
    }
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// A Python script that looks like a network service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonServer {
    pub port: Option<u16>,
    pub source: String,
}

/// Detect Python scripts that serve over the network and the port they bind.
pub fn analyze_python_server(path: &Path) -> Option<PythonServer> {
    static PORT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
        [
            r"(?i)port\s*=\s*(\d+)",
            r"(?i)listen\(\s*(\d+)\)",
            r"(?i)bind\(\s*\([^,]+,\s*(\d+)\s*\)\s*\)",
            r"(?i)host,\s*port\s*=\s*[^,]+,\s*(\d+)",
            r"(?i)server_address\s*=\s*\([^,]+,\s*(\d+)\s*\)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
    });

    let bytes = std::fs::read(path).ok()?;
    let source = String::from_utf8_lossy(&bytes).into_owned();
    let is_server = ["socketserver", "socket", "threading", "asyncio"]
        .iter()
        .any(|kw| source.contains(kw));
    if !is_server {
        return None;
    }

    let port = PORT_PATTERNS.iter().find_map(|re| {
        re.captures(&source)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    });
    Some(PythonServer { port, source })
}

fn first_line(path: &Path) -> Option<String> {
    let head = read_prefix(path, 4096).ok()?;
    let text = String::from_utf8_lossy(&head);
    text.lines().next().map(|l| l.trim().to_string())
}

/// Any Python among `files` (extension, content, or shebang).
pub fn detect_python_files(dir: &Path, files: &[String]) -> bool {
    files.iter().any(|file| {
        let path = dir.join(file);
        file.to_lowercase().ends_with(".py")
            || analyze_executable(&path) == ExecutableKind::Python
            || first_line(&path)
                .is_some_and(|l| l.starts_with("#!") && l.to_lowercase().contains("python"))
    })
}

/// Any Node.js among `files` (extension, manifest, content, or shebang).
pub fn detect_node_files(dir: &Path, files: &[String]) -> bool {
    const MANIFESTS: [&str; 4] = ["package.json", "package-lock.json", ".nvmrc", "yarn.lock"];
    files.iter().any(|file| {
        let lower = file.to_lowercase();
        let path = dir.join(file);
        lower.ends_with(".js")
            || lower.ends_with(".mjs")
            || lower.ends_with(".ts")
            || MANIFESTS.contains(&lower.as_str())
            || analyze_executable(&path) == ExecutableKind::Node
            || first_line(&path)
                .is_some_and(|l| l.starts_with("#!") && l.to_lowercase().contains("node"))
    })
}

/// A script whose shebang points at an interpreter the container won't have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShebangIssue {
    pub file: String,
    pub shebang: String,
}

const PROBLEMATIC_SHEBANGS: [&str; 3] = [
    "/opt/pwn.college/",
    "/usr/local/bin/python",
    "/usr/local/bin/node",
];

pub fn detect_problematic_shebangs(dir: &Path, files: &[String]) -> Vec<ShebangIssue> {
    files
        .iter()
        .filter_map(|file| {
            let path = dir.join(file);
            let size = std::fs::metadata(&path).ok()?.len();
            if size >= MAX_SHEBANG_FILE_SIZE {
                return None;
            }
            let line = first_line(&path)?;
            (line.starts_with("#!") && PROBLEMATIC_SHEBANGS.iter().any(|p| line.contains(p)))
                .then(|| ShebangIssue {
                    file: file.clone(),
                    shebang: line,
                })
        })
        .collect()
}

const STANDARD_INTERPRETERS: [&str; 4] = [
    "/lib/ld-linux.so.2",
    "/lib32/ld-linux.so.2",
    "/lib64/ld-linux-x86-64.so.2",
    "/lib/ld-linux-x86-64.so.2",
];

/// Binaries whose `PT_INTERP` points into a build host path (nix store, ...).
pub fn detect_custom_interpreters(dir: &Path, files: &[String]) -> BTreeMap<String, String> {
    const HOST_PREFIXES: [&str; 3] = ["/nix/store/", "/opt/pwn.college/", "/usr/local/"];
    let mut found = BTreeMap::new();
    for file in files {
        let path = dir.join(file);
        if analyze_executable(&path) != ExecutableKind::Binary {
            continue;
        }
        let Some(interp) = elf_interpreter(&path) else {
            continue;
        };
        if !STANDARD_INTERPRETERS.contains(&interp.as_str())
            && HOST_PREFIXES.iter().any(|p| interp.contains(p))
        {
            debug!(file, interpreter = %interp, "custom interpreter");
            found.insert(file.clone(), interp);
        }
    }
    found
}

// ---------------------------------------------------------------------------
// Provided libraries and base image
// ---------------------------------------------------------------------------

/// Shared libraries shipped with the challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvidedLibraries {
    /// `ld-linux*.so.2` style loader.
    pub dynamic_linker: Option<String>,
    /// `libc.so.6`.
    pub libc: Option<String>,
    /// Other `lib*.so`, keyed by library stem (`libssl`).
    pub others: BTreeMap<String, String>,
}

impl ProvidedLibraries {
    pub fn detect(files: &[String]) -> Self {
        let mut libs = Self::default();
        for file in files {
            let name = file.rsplit('/').next().unwrap_or(file).to_lowercase();
            if name.ends_with(".so.2") {
                libs.dynamic_linker = Some(file.clone());
            }
            if name == "libc.so.6" {
                libs.libc = Some(file.clone());
            }
            if name.starts_with("lib") && name.ends_with(".so") {
                let stem = name.split('.').next().unwrap_or(&name).to_string();
                libs.others.insert(stem, file.clone());
            }
        }
        libs
    }

    pub fn is_empty(&self) -> bool {
        self.dynamic_linker.is_none() && self.libc.is_none() && self.others.is_empty()
    }

    /// `(label, path)` pairs for prompts.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(l) = &self.dynamic_linker {
            out.push(("DYNAMIC_LINKER".to_string(), l.clone()));
        }
        if let Some(l) = &self.libc {
            out.push(("LIBC".to_string(), l.clone()));
        }
        for (stem, path) in &self.others {
            out.push((stem.to_uppercase(), path.clone()));
        }
        out
    }
}

/// A glibc release number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GlibcVersion {
    pub major: u32,
    pub minor: u32,
}

impl std::fmt::Display for GlibcVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// glibc version of a shipped `libc.so.6`, from its release banner or else
/// the highest `GLIBC_x.y` symbol version it defines.
pub fn detect_glibc_version(libc: &Path) -> Option<GlibcVersion> {
    static BANNER_RE: LazyLock<regex::bytes::Regex> = LazyLock::new(|| {
        regex::bytes::Regex::new(r"GNU C Library[^\n\x00]*?release version (\d+)\.(\d+)")
            .expect("valid regex")
    });
    static SYMVER_RE: LazyLock<regex::bytes::Regex> = LazyLock::new(|| {
        regex::bytes::Regex::new(r"GLIBC_(\d+)\.(\d+)").expect("valid regex")
    });

    let bytes = std::fs::read(libc).ok()?;
    let parse = |caps: regex::bytes::Captures<'_>| -> Option<GlibcVersion> {
        let major = std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?.parse().ok()?;
        let minor = std::str::from_utf8(caps.get(2)?.as_bytes()).ok()?.parse().ok()?;
        Some(GlibcVersion { major, minor })
    };

    if let Some(version) = BANNER_RE.captures(&bytes).and_then(parse) {
        return Some(version);
    }
    SYMVER_RE.captures_iter(&bytes).filter_map(parse).max()
}

const DEFAULT_BASE_IMAGE: &str = "ubuntu:20.04";

fn base_image_for_glibc(version: GlibcVersion) -> &'static str {
    match (version.major, version.minor) {
        (2, 23 | 24) => "ubuntu:16.04",
        (2, 25) => "ubuntu:17.04",
        (2, 26..=28) => "ubuntu:18.04",
        (2, 29) => "ubuntu:19.04",
        (2, 30..=32) => "ubuntu:20.04",
        (2, 33) => "ubuntu:21.04",
        (2, 34) => "ubuntu:21.10",
        (2, 35..=37) => "ubuntu:22.04",
        (2, 38) => "ubuntu:23.04",
        (2, minor) if minor <= 23 => "ubuntu:16.04",
        _ => "ubuntu:22.04",
    }
}

/// Base image whose system glibc matches a shipped libc, else `ubuntu:20.04`.
pub fn select_base_image(dir: &Path, libs: &ProvidedLibraries) -> String {
    let Some(libc) = &libs.libc else {
        return DEFAULT_BASE_IMAGE.into();
    };
    match detect_glibc_version(&dir.join(libc)) {
        Some(version) => base_image_for_glibc(version).into(),
        None => {
            debug!(libc, "could not detect glibc version, using default base image");
            DEFAULT_BASE_IMAGE.into()
        }
    }
}
