//! Environment setup blocks and hand-written fallback Dockerfiles.

use std::fmt;

use ctfforge_archive::{Architecture, ProvidedLibraries, binary_architecture, select_base_image};
use ctfforge_shared::TaskInfo;

/// Files that are never copied into a fallback image.
const NEVER_COPIED: [&str; 2] = ["Dockerfile", "docker-compose.yml"];

const SOCAT_CMD: &str =
    r#"CMD ["socat", "TCP-LISTEN:1337,reuseaddr,fork", "EXEC:/challenge/run.sh,stderr"]"#;

// ---------------------------------------------------------------------------
// Ubuntu release
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UbuntuVersion {
    pub major: u32,
    pub minor: u32,
}

impl UbuntuVersion {
    pub const DEFAULT: Self = Self {
        major: 20,
        minor: 4,
    };
}

impl fmt::Display for UbuntuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.major, self.minor)
    }
}

/// Release of an `ubuntu:X.Y` image. Anything else counts as 20.04.
pub fn ubuntu_version(base_image: &str) -> UbuntuVersion {
    let Some((_, tag)) = base_image.split_once("ubuntu:") else {
        return UbuntuVersion::DEFAULT;
    };
    let mut parts = tag.split(['.', '-']);
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => UbuntuVersion { major, minor },
        _ => UbuntuVersion::DEFAULT,
    }
}

// ---------------------------------------------------------------------------
// Package lists
// ---------------------------------------------------------------------------

const BASE_PACKAGES: &[&str] = &[
    "build-essential",
    "ca-certificates",
    "curl",
    "sudo",
    "wget",
    "unzip",
];

const DEV_PACKAGES: &[&str] = &[
    "autoconf",
    "bc",
    "bison",
    "clang",
    "cmake",
    "cpio",
    "flex",
    "g++-multilib",
    "gcc-multilib",
    "git",
    "libedit-dev",
    "libelf-dev",
    "libffi-dev",
    "libglib2.0-dev",
    "libgmp-dev",
    "libpcap-dev",
    "libseccomp-dev",
    "libssl-dev",
    "libtool-bin",
    "llvm",
    "man-db",
    "manpages-dev",
    "nasm",
    "python3-dev",
    "python3-pip",
    "squashfs-tools",
];

const I386_DEV_PACKAGES: &[&str] = &[
    "libc6-dev-i386",
    "libc6:i386",
    "libncurses5:i386",
    "libstdc++6:i386",
];

const TOOL_PACKAGES: &[&str] = &[
    "binutils",
    "binwalk",
    "bsdmainutils",
    "bsdutils",
    "debianutils",
    "diffutils",
    "ed",
    "elfutils",
    "ethtool",
    "exiftool",
    "expect",
    "figlet",
    "findutils",
    "gdb",
    "gdb-multiarch",
    "hexedit",
    "iproute2",
    "iptables",
    "iputils-ping",
    "john",
    "jq",
    "keyutils",
    "kmod",
    "less",
    "ltrace",
    "nano",
    "net-tools",
    "netcat-openbsd",
    "nmap",
    "openssh-server",
    "p7zip-full",
    "parallel",
    "patchelf",
    "pcaputils",
    "pcre2-utils",
    "strace",
    "tmux",
    "valgrind",
    "vim",
    "wireshark",
    "zip",
    "zsh",
    "xz-utils",
    "libxml2-dev",
    "libxslt-dev",
    "socat",
    "sqlite3",
];

const I386_RUNTIME_PACKAGES: &[&str] =
    &["lib32gcc-s1", "lib32stdc++6", "libgcc1:i386", "libpam0g:i386"];

/// apt packages of the setup block, grouped as they are installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLists {
    pub base: Vec<&'static str>,
    pub dev: Vec<&'static str>,
    pub tools: Vec<&'static str>,
    pub version_specific: Vec<&'static str>,
    pub python: Vec<&'static str>,
    pub java: Vec<&'static str>,
}

impl PackageLists {
    pub fn for_version(version: UbuntuVersion, arch: Architecture) -> Self {
        let mut dev = DEV_PACKAGES.to_vec();
        if arch == Architecture::Bits32 {
            dev.extend_from_slice(I386_DEV_PACKAGES);
        }
        let (version_specific, python, java): (&[&str], &[&str], &str) = if version.major >= 20 {
            (
                &["python-is-python3", "ipython3", "python3-ipdb", "python3-magic"],
                &["python-is-python3"],
                "openjdk-17-jdk",
            )
        } else if version.major >= 18 {
            (&["ipython3", "python3-ipdb", "python3-magic"], &[], "openjdk-11-jdk")
        } else {
            (&["ipython", "python3-magic"], &[], "openjdk-8-jdk")
        };

        Self {
            base: BASE_PACKAGES.to_vec(),
            dev,
            tools: TOOL_PACKAGES.to_vec(),
            version_specific: version_specific.to_vec(),
            python: python.to_vec(),
            java: vec![java],
        }
    }

    /// Every package once, in install order.
    pub fn install_order(&self, has_python: bool) -> Vec<&'static str> {
        let mut groups = vec![&self.base, &self.dev, &self.tools, &self.version_specific];
        if has_python {
            groups.push(&self.python);
        }
        groups.push(&self.java);

        let mut seen = std::collections::HashSet::new();
        groups
            .into_iter()
            .flatten()
            .copied()
            .filter(|p| seen.insert(*p))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Setup block
// ---------------------------------------------------------------------------

fn python_commands(version: UbuntuVersion) -> String {
    const LIBRARIES: &str =
        "flask requests pycryptodome pycryptodomex argon2-cffi psutil tqdm construct lxml";
    let pip = if version.major >= 23 {
        "python3 -m pip install --break-system-packages"
    } else {
        "python3 -m pip install"
    };
    let install = if version.major >= 20 {
        format!(
            "RUN {pip} --upgrade pip && \\\n    {pip} {LIBRARIES} && \\\n    ({pip} git+https://github.com/Gallopsled/pwntools.git@dev || true)"
        )
    } else if version.major >= 18 {
        format!(
            "RUN {pip} --upgrade 'pip<21.0' && \\\n    {pip} {LIBRARIES} && \\\n    ({pip} git+https://github.com/Gallopsled/pwntools.git@dev || true)"
        )
    } else {
        "RUN (curl -sSL https://bootstrap.pypa.io/pip/3.5/get-pip.py -o /tmp/get-pip.py && \\\n    python3 /tmp/get-pip.py && rm -f /tmp/get-pip.py && \\\n    python3 -m pip install requests pycryptodome) || true".to_string()
    };
    format!(
        "{install}\nRUN ln -sf /usr/bin/python3 /usr/bin/python && \\\n    (ln -sf /usr/bin/pip3 /usr/bin/pip || true)"
    )
}

fn node_commands(version: UbuntuVersion) -> &'static str {
    if version.major >= 20 {
        "RUN apt-get update && apt-get install --no-install-recommends -yqq nodejs npm"
    } else if version.major >= 18 {
        "RUN curl -fsSL https://deb.nodesource.com/setup_16.x | bash - && \\\n    apt-get install -yqq nodejs"
    } else {
        "RUN (curl -fsSL https://deb.nodesource.com/setup_14.x | bash - && apt-get install -yqq nodejs) || \\\n    (apt-get update && apt-get install -yqq nodejs npm)"
    }
}

/// `stdbuf32`: run a 32-bit program with unbuffered stdio, ignoring the
/// `stdbuf`-style flags in front of it.
const STDBUF32: &str = r#"RUN printf '%s\n' '#!/bin/sh' \
        'while [ "${1#-}" != "$1" ]; do shift; done' \
        'export GLIBC_TUNABLES=glibc.stdio.unbuffered=1' \
        'exec "$@"' > /usr/local/bin/stdbuf32 && \
    chmod +x /usr/local/bin/stdbuf32"#;

/// Setup block placed right after `FROM`: the package set matching the
/// image's release, plus 32-bit, Python and Node.js extras as needed.
pub fn adaptive_setup(
    base_image: &str,
    arch: Architecture,
    has_python: bool,
    has_node: bool,
) -> String {
    let version = ubuntu_version(base_image);
    let packages = PackageLists::for_version(version, arch).install_order(has_python);
    let mut blocks = vec![format!("# Challenge environment for Ubuntu {version} ({arch}-bit)")];

    if arch == Architecture::Bits32 {
        blocks.push(
            "RUN --mount=type=cache,target=/var/cache/apt,sharing=locked \\\n    dpkg --add-architecture i386 && \\\n    apt-get update"
                .into(),
        );
    }

    let package_lines: Vec<String> = packages.iter().map(|p| format!("        {p}")).collect();
    blocks.push(format!(
        "RUN apt-get update && apt-get install --no-install-recommends -yqq \\\n{}",
        package_lines.join(" \\\n")
    ));

    if has_python {
        blocks.push(python_commands(version));
    }
    if has_node {
        blocks.push(node_commands(version).into());
    }
    if arch == Architecture::Bits32 {
        blocks.push(format!(
            "RUN apt-get install --no-install-recommends -yqq {} || true",
            I386_RUNTIME_PACKAGES.join(" ")
        ));
        blocks.push(STDBUF32.into());
    }
    blocks.join("\n")
}

// ---------------------------------------------------------------------------
// Fallback Dockerfiles
// ---------------------------------------------------------------------------

fn echo_script(lines: &[String]) -> Vec<String> {
    let mut commands = Vec::with_capacity(lines.len() + 1);
    for (i, line) in lines.iter().enumerate() {
        let redirect = if i == 0 { ">" } else { ">>" };
        commands.push(format!("echo '{line}' {redirect} /challenge/run.sh"));
    }
    commands.push("chmod +x /challenge/run.sh".into());
    commands
}

fn run_chain(commands: &[String]) -> String {
    format!("RUN {}", commands.join(" && \\\n    "))
}

/// First executable binary of the challenge that is not a library.
fn main_binary(task: &TaskInfo, files: &[String]) -> Option<String> {
    let (_, binaries) = binary_architecture(&task.task_path, files);
    binaries.into_iter().find(|b| !b.contains(".so"))
}

/// `COPY` of one file into `/challenge`. Names with whitespace use the JSON
/// array form.
fn copy_into_challenge(file: &str) -> String {
    if !file.contains(char::is_whitespace) {
        return format!("COPY {file} /challenge/{file}");
    }
    let quoted = file.replace('\\', "\\\\").replace('"', "\\\"");
    format!(r#"COPY ["{quoted}", "/challenge/{quoted}"]"#)
}

/// Dockerfile that hosts the challenge's main binary against its bundled
/// libraries without any model help.
pub fn fallback_dockerfile(task: &TaskInfo, files: &[String], libs: &ProvidedLibraries) -> String {
    let base_image = select_base_image(&task.task_path, libs);
    let mut out = vec![
        format!("FROM {base_image}"),
        "ENV DEBIAN_FRONTEND=noninteractive".into(),
        "ENV LC_CTYPE=C.UTF-8".into(),
    ];

    let mut packages = BASE_PACKAGES.to_vec();
    packages.extend(["python3", "socat", "patchelf", "gdb", "strace"]);
    let mut install = vec!["apt-get update".to_string()];
    install.extend(
        packages
            .iter()
            .map(|p| format!("(apt-get install -y --no-install-recommends {p} || true)")),
    );
    install.push("rm -rf /var/lib/apt/lists/*".into());
    out.push(run_chain(&install));
    out.push("RUN ln -sf /usr/bin/python3 /usr/bin/python || true".into());

    out.push("WORKDIR /challenge".into());
    for file in files
        .iter()
        .filter(|f| !f.starts_with('.') && !NEVER_COPIED.contains(&f.as_str()))
    {
        out.push(copy_into_challenge(file));
    }
    out.push("RUN chmod +x /challenge/* 2>/dev/null || true".into());

    let script = match main_binary(task, files) {
        Some(binary) => {
            out.push("ENV LD_LIBRARY_PATH=/challenge".into());
            let mut lines = vec!["#!/bin/sh".to_string(), "cd /challenge".to_string()];
            if let Some(linker) = &libs.dynamic_linker {
                lines.push(format!("if ./{linker} --list ./{binary} >/dev/null 2>&1; then"));
                lines.push(format!("  exec ./{linker} --library-path /challenge ./{binary}"));
                lines.push("fi".into());
            }
            lines.push(format!("LD_LIBRARY_PATH=/challenge exec ./{binary}"));
            lines
        }
        None => generic_script(),
    };
    out.push(run_chain(&echo_script(&script)));

    out.push("EXPOSE 1337".into());
    out.push(SOCAT_CMD.into());
    out.join("\n")
}

fn generic_script() -> Vec<String> {
    vec![
        "#!/bin/sh".into(),
        "cd /challenge".into(),
        "echo \"Challenge is ready for interaction\"".into(),
        "exec cat".into(),
    ]
}

/// Smallest Dockerfile that still serves the challenge directory.
pub fn minimal_dockerfile() -> String {
    [
        "FROM ubuntu:20.04".to_string(),
        "ENV DEBIAN_FRONTEND=noninteractive".into(),
        "RUN apt-get update && \\\n    apt-get install -y --no-install-recommends socat python3 && \\\n    rm -rf /var/lib/apt/lists/*".into(),
        "WORKDIR /challenge".into(),
        "COPY . /challenge/".into(),
        "RUN chmod +x /challenge/* 2>/dev/null || true".into(),
        run_chain(&echo_script(&generic_script())),
        "EXPOSE 1337".into(),
        SOCAT_CMD.into(),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dockerfile::validate;
    use crate::testutil::{temp_tree, write};

    fn elf(class: u8) -> Vec<u8> {
        let mut bytes = vec![0x7f, b'E', b'L', b'F', class, 1, 1];
        bytes.resize(64, 0);
        bytes
    }

    fn task_at(dir: &std::path::Path) -> TaskInfo {
        TaskInfo {
            task_name: "babyrop".into(),
            task_path: dir.to_path_buf(),
            ctf_name: "evt".into(),
            category: None,
            description: String::new(),
            rehost_content: String::new(),
            init_content: String::new(),
        }
    }

    #[test]
    fn parses_ubuntu_versions() {
        assert_eq!(ubuntu_version("ubuntu:18.04"), UbuntuVersion { major: 18, minor: 4 });
        assert_eq!(ubuntu_version("ubuntu:16.04"), UbuntuVersion { major: 16, minor: 4 });
        assert_eq!(ubuntu_version("python:3.9"), UbuntuVersion::DEFAULT);
        assert_eq!(ubuntu_version("ubuntu:latest"), UbuntuVersion::DEFAULT);
        assert_eq!(UbuntuVersion::DEFAULT.to_string(), "20.04");
    }

    #[test]
    fn package_lists_follow_release() {
        let focal = PackageLists::for_version(UbuntuVersion::DEFAULT, Architecture::Bits64);
        assert!(focal.version_specific.contains(&"python-is-python3"));
        assert_eq!(focal.java, vec!["openjdk-17-jdk"]);
        assert!(!focal.dev.contains(&"libc6:i386"));

        let xenial =
            PackageLists::for_version(UbuntuVersion { major: 16, minor: 4 }, Architecture::Bits32);
        assert_eq!(xenial.java, vec!["openjdk-8-jdk"]);
        assert!(xenial.version_specific.contains(&"ipython"));
        assert!(xenial.dev.contains(&"libc6:i386"));

        let order = focal.install_order(true);
        assert_eq!(order[0], "build-essential");
        assert_eq!(
            order.iter().filter(|p| **p == "python-is-python3").count(),
            1
        );
        assert_eq!(order.last(), Some(&"openjdk-17-jdk"));
    }

    #[test]
    fn setup_block_shape() {
        let setup = adaptive_setup("ubuntu:20.04", Architecture::Bits64, false, false);
        assert!(setup.starts_with("# Challenge environment for Ubuntu 20.04 (64-bit)\n"));
        assert!(setup.contains(
            "RUN apt-get update && apt-get install --no-install-recommends -yqq \\\n        build-essential \\\n"
        ));
        assert!(setup.ends_with("        openjdk-17-jdk"));
        assert!(!setup.contains("i386"));
        assert!(!setup.contains("pip install"));

        let i386 = adaptive_setup("ubuntu:18.04", Architecture::Bits32, true, true);
        assert!(i386.contains("dpkg --add-architecture i386"));
        assert!(i386.contains("'pip<21.0'"));
        assert!(i386.contains("setup_16.x"));
        assert!(i386.contains("/usr/local/bin/stdbuf32"));
        assert!(i386.contains("libpam0g:i386"));
    }

    #[test]
    fn minimal_dockerfile_is_valid() {
        let content = minimal_dockerfile();
        assert!(content.starts_with("FROM ubuntu:20.04\n"));
        assert!(content.contains("echo 'exec cat' >> /challenge/run.sh"));
        assert!(validate(&content, &["chall".to_string()]).is_empty());
    }

    #[test]
    fn fallback_runs_binary_through_bundled_linker() {
        let root = temp_tree("cf-fallback");
        write(&root, "chall", elf(1));
        write(&root, "ld-linux.so.2", elf(1));
        write(
            &root,
            "libc.so.6",
            b"GNU C Library (Ubuntu GLIBC 2.27-3ubuntu1) stable release version 2.27.\n",
        );
        let files = vec!["chall".to_string(), "ld-linux.so.2".into(), "libc.so.6".into()];
        let libs = ProvidedLibraries::detect(&files);

        let content = fallback_dockerfile(&task_at(&root), &files, &libs);
        assert!(content.starts_with("FROM ubuntu:18.04\n"));
        assert!(content.contains("COPY libc.so.6 /challenge/libc.so.6"));
        assert!(content.contains("ENV LD_LIBRARY_PATH=/challenge"));
        assert!(content.contains("exec ./ld-linux.so.2 --library-path /challenge ./chall"));
        assert!(content.contains("LD_LIBRARY_PATH=/challenge exec ./chall"));
        assert!(content.ends_with(SOCAT_CMD));
        assert!(validate(&content, &files).is_empty());

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn fallback_quotes_file_names_with_spaces() {
        let root = temp_tree("cf-fallback-spaces");
        write(&root, "chall", elf(2));
        write(&root, "libc.so.6", b"GNU C Library (Ubuntu GLIBC 2.31-0ubuntu9) stable release.\n");
        write(&root, "my notes.txt", "notes");
        let files = vec!["chall".to_string(), "libc.so.6".into(), "my notes.txt".into()];
        let libs = ProvidedLibraries::detect(&files);

        let content = fallback_dockerfile(&task_at(&root), &files, &libs);
        assert!(content.contains(r#"COPY ["my notes.txt", "/challenge/my notes.txt"]"#));
        assert!(content.contains("COPY chall /challenge/chall"));
        assert!(validate(&content, &files).is_empty());

        std::fs::remove_dir_all(&root).ok();
    }
}
