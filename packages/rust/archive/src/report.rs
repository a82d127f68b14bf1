//! Human-readable file analysis that goes into the Dockerfile prompt.

use std::path::Path;

use crate::analysis::{
    Architecture, ElfClass, ExecutableKind, ProvidedLibraries, analyze_executable,
    analyze_python_server, binary_architecture, detect_elf_class,
};
use crate::files::describe_file;

/// Script bodies longer than this are cut in the report.
const MAX_INLINE_SOURCE: usize = 2000;

const SCRIPT_EXTENSIONS: [&str; 6] = [".py", ".js", ".php", ".rb", ".pl", ".sh"];
const WEB_EXTENSIONS: [&str; 5] = [".html", ".htm", ".css", ".js", ".php"];
const CONFIG_EXTENSIONS: [&str; 6] = [".conf", ".cfg", ".ini", ".yml", ".yaml", ".json"];
const LIBRARY_EXTENSIONS: [&str; 3] = [".so", ".dll", ".a"];
const ARCHIVE_EXTENSIONS: [&str; 10] = [
    ".zip", ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".rar", ".7z",
];

#[derive(Default)]
struct Buckets {
    executables: Vec<String>,
    binaries: Vec<String>,
    scripts: Vec<String>,
    web: Vec<String>,
    config: Vec<String>,
    libraries: Vec<String>,
    archives: Vec<String>,
    data: Vec<String>,
    library_hints: Vec<String>,
    sources: Vec<(String, String)>,
}

fn ends_with_any(name: &str, exts: &[&str]) -> bool {
    exts.iter().any(|e| name.ends_with(e))
}

fn truncated(source: &str) -> String {
    if source.chars().count() > MAX_INLINE_SOURCE {
        let cut: String = source.chars().take(MAX_INLINE_SOURCE).collect();
        format!("{cut}\n... [truncated]")
    } else {
        source.to_string()
    }
}

fn read_lossy(path: &Path) -> String {
    std::fs::read(path)
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_else(|e| format!("Error reading file: {e}"))
}

fn library_hint(file: &str) -> Option<String> {
    let name = file.rsplit('/').next().unwrap_or(file).to_lowercase();
    let hint = if name.contains("pam") {
        "PAM library - may need libpam0g:i386 for 32-bit or libpam0g for 64-bit"
    } else if name.contains("ssl") || name.contains("crypto") {
        "SSL/Crypto library - may need libssl-dev"
    } else if name.contains("mysql") {
        "MySQL library - may need libmysqlclient-dev"
    } else if name.contains("sqlite") {
        "SQLite library - may need libsqlite3-dev"
    } else if name.contains("ld-linux") {
        "custom dynamic linker - MUST use patchelf to set the interpreter path"
    } else if name == "libc.so.6" {
        "custom libc - MUST use patchelf to set the library path"
    } else {
        return None;
    };
    Some(format!("{file}: {hint}"))
}

fn push_script(b: &mut Buckets, file: &str, path: &Path, entry: String, python: bool) {
    if python {
        if let Some(server) = analyze_python_server(path) {
            let port = server
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "UNKNOWN".into());
            let entry = format!("{entry} - PYTHON SERVER on port {port}");
            b.scripts.push(entry.clone());
            b.executables.push(entry);
            b.sources.push((
                file.to_string(),
                format!(
                    "--- PYTHON SERVER SCRIPT (listens on port {port}) ---\n{}",
                    truncated(&server.source)
                ),
            ));
            return;
        }
    }
    b.sources.push((file.to_string(), truncated(&read_lossy(path))));
    b.scripts.push(entry.clone());
    b.executables.push(entry);
}

fn classify(dir: &Path, files: &[String]) -> Buckets {
    let mut b = Buckets::default();
    for file in files {
        let path = dir.join(file);
        let info = describe_file(&path);
        let name = file.to_lowercase();

        if info.contains("executable") || name.ends_with(".bin") || name.ends_with(".out") {
            let kind = analyze_executable(&path);
            if kind.is_script() {
                let entry = format!("{file} ({info}) - detected as {} script", kind.as_str());
                push_script(&mut b, file, &path, entry, kind == ExecutableKind::Python);
            } else {
                let arch = match detect_elf_class(&path) {
                    Some(ElfClass::Elf32) => " - 32-bit binary",
                    Some(ElfClass::Elf64) => " - 64-bit binary",
                    None => " - binary executable",
                };
                b.executables.push(format!("{file} ({info}){arch}"));
                b.binaries.push(file.clone());
            }
        } else if ends_with_any(&name, &SCRIPT_EXTENSIONS) {
            let entry = format!("{file} ({info}) - script file");
            push_script(&mut b, file, &path, entry, name.ends_with(".py"));
        } else if ends_with_any(&name, &WEB_EXTENSIONS) {
            b.web.push(format!("{file} ({info})"));
        } else if ends_with_any(&name, &CONFIG_EXTENSIONS) {
            b.config.push(format!("{file} ({info})"));
        } else if ends_with_any(&name, &LIBRARY_EXTENSIONS)
            || name.contains(".so.")
            || name.contains("ld-linux")
        {
            let base = name.rsplit('/').next().unwrap_or(&name);
            let note = if base.contains("ld-linux") {
                " - DYNAMIC LINKER".to_string()
            } else if base == "libc.so.6" {
                " - LIBC LIBRARY".to_string()
            } else if base.starts_with("lib") {
                format!(" - SHARED LIBRARY ({})", base.split('.').next().unwrap_or(base))
            } else {
                String::new()
            };
            b.libraries.push(format!("{file} ({info}){note}"));
            b.library_hints.extend(library_hint(file));
        } else if ends_with_any(&name, &ARCHIVE_EXTENSIONS) {
            b.archives.push(format!("{file} ({info})"));
        } else {
            b.data.push(format!("{file} ({info})"));
        }
    }
    b
}

fn section(out: &mut Vec<String>, title: &str, items: &[String], shown: usize) {
    if items.is_empty() {
        return;
    }
    out.push(format!("\n{title} ({}):", items.len()));
    out.extend(items.iter().take(shown).map(|i| format!("  - {i}")));
    if items.len() > shown {
        out.push(format!("  ... and {} more", items.len() - shown));
    }
}

/// Classify the challenge files and spell out what the container needs.
pub fn file_analysis(dir: &Path, files: &[String]) -> String {
    if files.is_empty() {
        return "No files available for analysis.".into();
    }

    let libs = ProvidedLibraries::detect(files);
    let (arch, arch_binaries) = binary_architecture(dir, files);
    let b = classify(dir, files);

    let mut out = vec![format!("Total files: {}", files.len())];

    if !arch_binaries.is_empty() {
        out.push("\nBINARY ARCHITECTURE ANALYSIS:".into());
        out.push(format!("  - Detected architecture: {arch}-bit"));
        for bin in &arch_binaries {
            out.push(format!("    * {bin}: {arch}-bit"));
        }
        match arch {
            Architecture::Bits32 => {
                out.push("  - 32-bit binaries need i386 compatibility packages".into());
                out.push("  - Use RUN dpkg --add-architecture i386 && apt-get update".into());
            }
            Architecture::Bits64 => {
                out.push("  - 64-bit binaries: standard amd64 packages should work".into());
            }
        }
    }

    if !libs.is_empty() {
        out.push(format!("\nCUSTOM LIBRARIES DETECTED ({}):", libs.entries().len()));
        for (label, path) in libs.entries() {
            out.push(format!("  - {label}: {path}"));
        }
        out.push("  -> Binaries MUST be patched with patchelf to use these libraries".into());
    }

    section(&mut out, "EXECUTABLE FILES", &b.executables, 5);
    if let Some(example) = b.binaries.first() {
        let example = example.rsplit('/').next().unwrap_or(example);
        out.push("  - Wrap binaries in a run.sh script for stability:".into());
        out.push(format!(
            "    RUN echo '#!/bin/sh\\n/challenge/{example}' > /challenge/run.sh && chmod +x /challenge/run.sh"
        ));
        out.push(
            "    CMD [\"socat\", \"TCP-LISTEN:1337,reuseaddr,fork\", \"EXEC:/challenge/run.sh,stderr\"]"
                .into(),
        );
        if let Some(linker) = &libs.dynamic_linker {
            out.push(format!(
                "    MANDATORY: patchelf --set-interpreter ./{linker} /challenge/{example}"
            ));
        }
        if !libs.is_empty() {
            out.push(format!("    MANDATORY: patchelf --set-rpath . /challenge/{example}"));
        }
    }
    section(&mut out, "SCRIPT FILES", &b.scripts, 5);
    section(&mut out, "WEB FILES", &b.web, 5);
    if !b.web.is_empty() {
        out.push("  -> Install a web server (apache2, nginx) and copy to /var/www/html/".into());
    }
    section(&mut out, "ARCHIVE FILES", &b.archives, usize::MAX);
    section(&mut out, "CONFIG FILES", &b.config, 3);
    section(&mut out, "LIBRARY FILES", &b.libraries, 5);
    section(&mut out, "DATA/OTHER FILES", &b.data, 3);

    if !b.library_hints.is_empty() {
        out.push("\nLIBRARY DEPENDENCIES DETECTED:".into());
        out.extend(b.library_hints.iter().map(|h| format!("  - {h}")));
    }

    if !b.sources.is_empty() {
        out.push("\nFILE CONTENTS ANALYSIS:".into());
        for (file, source) in &b.sources {
            out.push(format!("\n=== {file} ==="));
            out.push(source.clone());
            out.push(format!("=== End of {file} ==="));
        }
    }

    out.join("\n")
}
