//! Prompt text for the three generated files.

use ctfforge_archive::{Architecture, ProvidedLibraries};
use ctfforge_shared::{Category, TaskInfo};

// ---------------------------------------------------------------------------
// Category guidelines
// ---------------------------------------------------------------------------

const WEB_GUIDELINES: &str = "
WEB CHALLENGES:
- Install a web server (apache2, nginx, or the framework's built-in server)
- Install the language runtime the files need (php, python3, node.js, ...)
- If using Python, install python3 and python-is-python3
- Copy web files to the served directory (/var/www/html for Apache)
- Expose port 80 or 8080 for HTTP access
- Example: COPY *.php /var/www/html/ && chmod 644 /var/www/html/*.php
- Start the server in the foreground, e.g. CMD [\"apache2ctl\", \"-D\", \"FOREGROUND\"]";

const PWN_GUIDELINES: &str = "
PWN CHALLENGES:
- Install socat for network service hosting.
- Host executables through a `run.sh` wrapper as described below.
- Expose port 1337 (standard for pwn challenges).
- 32-bit binaries may need extra libraries such as libc6:i386.";

const CRYPTO_GUIDELINES: &str = "
CRYPTO CHALLENGES:
- Copy Python scripts to /challenge/
- Install socat when hosting a crypto service
- Expose the service port (often 1337)
- Example: CMD [\"python3\", \"/challenge/crypto_server.py\"]
- Pin crypto library versions when the scripts depend on them";

const REV_GUIDELINES: &str = "
REVERSE ENGINEERING CHALLENGES:
- Copy binary files to /challenge/ and make them executable
- Install any runtime or library the binary needs
- If hosting a service, use socat on an appropriate port
- Example: COPY binary /challenge/ && chmod +x /challenge/binary";

const FORENSICS_GUIDELINES: &str = "
FORENSICS CHALLENGES:
- Copy evidence files to /challenge/
- Install analysis tools only if the challenge offers online analysis
- A web server is appropriate when evidence is served over HTTP
- Example: COPY evidence.* /challenge/";

const MISC_GUIDELINES: &str = "
MISCELLANEOUS CHALLENGES:
- Derive the service type from the available files
- Install the runtime the files need (python3 with python-is-python3, node.js, ...)
- Copy all necessary files to /challenge/ and set executable permissions
- Use port 1337 for general services
- Use socat for TCP services or a web server for web-based challenges";

const I386_GUIDELINES: &str = "

32-BIT SPECIFIC REQUIREMENTS:
**CRITICAL**: i386 architecture and 32-bit packages are ALREADY configured in the comprehensive setup.
- DO NOT add 'dpkg --add-architecture i386' commands
- DO NOT install socat, libc6:i386, libstdc++6:i386 or lib32gcc-s1 again
- DO NOT install coreutils:i386, it conflicts with the essential coreutils package
- Use the linux32 prefix for binary executions in CMD/ENTRYPOINT
- Already available: libc6:i386, libstdc++6:i386, lib32gcc-s1, lib32stdc++6, libgcc1:i386, libpam0g:i386, libc6-dev-i386, libncurses5:i386, socat
- Use the stdbuf32 wrapper for unbuffered 32-bit binaries
- Only add challenge-specific setup";

/// Dockerfile advice for a challenge category. Unknown categories get the
/// miscellaneous advice.
pub fn category_guidelines(category: Option<Category>) -> &'static str {
    match category {
        Some(Category::Web) => WEB_GUIDELINES,
        Some(Category::Pwn) => PWN_GUIDELINES,
        Some(Category::Crypto) => CRYPTO_GUIDELINES,
        Some(Category::Rev) => REV_GUIDELINES,
        Some(Category::Forensics) => FORENSICS_GUIDELINES,
        Some(Category::Misc) | None => MISC_GUIDELINES,
    }
}

// ---------------------------------------------------------------------------
// Dockerfile
// ---------------------------------------------------------------------------

const WRAPPER_64BIT: &str = r#"- **MANDATORY**: ALL executable files (binaries, scripts, etc.) MUST be wrapped with a run.sh script served through socat
- **MANDATORY**: Use `stdbuf -i0 -o0 -e0` in run.sh to disable buffering
- Create the wrapper with printf:
  ```
  RUN printf '#!/bin/bash\ncd /challenge\nexec stdbuf -i0 -o0 -e0 ./your_executable\n' > /challenge/run.sh && chmod +x /challenge/run.sh
  ```
- Python scripts: `exec stdbuf -i0 -o0 -e0 python3 ./script.py`
- Node.js scripts: `exec stdbuf -i0 -o0 -e0 node ./script.js`
- Shell scripts: `exec stdbuf -i0 -o0 -e0 /bin/bash ./script.sh`
- Always `cd /challenge` and `exec` inside run.sh, and chmod +x it
- Serve it with: `CMD ["socat", "TCP-LISTEN:1337,reuseaddr,fork", "EXEC:/challenge/run.sh"]`"#;

const WRAPPER_32BIT: &str = r#"- **MANDATORY**: ALL executable files (binaries, scripts, etc.) MUST be wrapped with a run.sh script served through socat
- **MANDATORY**: For 32-bit binaries use the custom stdbuf32 command to avoid an ELF class mismatch
- Create the wrapper with printf:
  ```
  RUN printf '#!/bin/bash\ncd /challenge\nexec stdbuf32 -i0 -o0 -e0 linux32 ./your_executable\n' > /challenge/run.sh && chmod +x /challenge/run.sh
  ```
- On library trouble, run the binary through the dynamic linker:
  ```
  RUN printf '#!/bin/sh\ncd /challenge\nexec /lib/ld-linux.so.2 --library-path /lib/i386-linux-gnu:/usr/lib/i386-linux-gnu:/challenge ./binary_name\n' > /challenge/run.sh && chmod +x /challenge/run.sh
  ```
- Scripts keep the regular stdbuf: `exec stdbuf -i0 -o0 -e0 python3 ./script.py`
- Always `cd /challenge` and `exec` inside run.sh, and chmod +x it
- Serve it with: `CMD ["socat", "TCP-LISTEN:1337,reuseaddr,fork", "EXEC:/challenge/run.sh"]`"#;

const SERVER_NOTE: &str = "Note that the challenge should be hosted on a server inside the docker container, so you need to consider making some CTF files part of the server (e.g., the server binary, the server script, its configuration file, or web files).";

const FLAG_RULES: &str = "IMPORTANT: This challenge does not have a flag.sha256 file, so you MUST generate a flag and place it in `/flag`.

**CRITICAL FLAG GENERATION RULES:**
1. If the file analysis shows a script's source, inspect it for constraints on the flag's length, format or content (e.g. `assert len(flag) % 16 == 1`).
2. The generated flag MUST satisfy all such constraints.
3. The flag must look like `pwn.college{...}`.
4. Write it with a command like `echo 'pwn.college{YOUR_VALID_FLAG_CONTENT}' > /flag`.
5. The flag content must be unique and relevant to the challenge. Never use placeholders like `...`.";

const DOCKERFILE_RULES: &str = r#"# GENERAL DOCKER PRACTICES:
1. A comprehensive package set is added automatically after FROM; only install what the challenge needs beyond it
2. Create a non-root user for services when possible, but DO NOT use `useradd`
3. Set file permissions for executables and sensitive files
4. Use WORKDIR /challenge and expose only the port the challenge needs
5. You MUST create the `run.sh` wrapper with printf or echo. NEVER use heredoc syntax (<< 'EOF'), Docker fails to parse it
6. If you run the `.init` content during the build, use `RUN ... || true`

# SECURITY:
- DO NOT copy flag.sha256 or flagcheck files into the image
- DO NOT copy any file that is not in the available files list
- The flag is stored in /flag with permissions 444 and is never served directly

# SHEBANGS:
- Problematic shebangs (like #!/opt/pwn.college/python) are fixed automatically

# CTF BEHAVIOR:
- The service must be reachable over the network and start automatically
- Programs must answer input immediately (stdbuf)
- Binaries that exit silently when run directly are normal; socat provides their stdin/stdout
- For libraries such as libpam install libpam0g:i386 (32-bit) or libpam0g (64-bit)

# PYTHON NETWORK SERVICES:
- If the file analysis reports a Python server on an internal port XXXX, start it in the background in run.sh and forward 1337 to it:
  ```
  RUN printf '#!/bin/sh\ncd /challenge\npython3 /challenge/server.py &\nsleep 1\nexec socat TCP-LISTEN:1337,reuseaddr,fork TCP:localhost:XXXX\n' > /challenge/run.sh && chmod +x /challenge/run.sh
  ```
- Use `CMD ["/challenge/run.sh"]` for such services and do not use socat EXEC for them

Respond with ONLY the Dockerfile content, no explanations."#;

/// Inputs of the Dockerfile prompt.
pub struct DockerfilePrompt<'a> {
    pub task: &'a TaskInfo,
    pub available_files: &'a [String],
    pub file_analysis: &'a str,
    pub has_sha256: bool,
    pub architecture: Architecture,
    pub libraries: &'a ProvidedLibraries,
    pub has_binaries: bool,
}

impl DockerfilePrompt<'_> {
    fn wrapper_section(&self) -> String {
        let mut section = match self.architecture {
            Architecture::Bits32 => WRAPPER_32BIT.to_string(),
            Architecture::Bits64 => WRAPPER_64BIT.to_string(),
        };
        if !self.libraries.is_empty() && self.has_binaries {
            let labels: Vec<String> = self
                .libraries
                .entries()
                .into_iter()
                .map(|(label, path)| format!("{label}={path}"))
                .collect();
            section.push_str(&format!(
                "\n\n# LIBRARY DEPENDENCY HANDLING:
- **CRITICAL**: Custom libraries shipped with the challenge: {}
- Copy every library file to /challenge/
- patchelf commands that set the interpreter (when a dynamic linker is shipped) and rpath `.` are added automatically after the last COPY
- Without this setup the binaries may segfault on the system libc",
                labels.join(", ")
            ));
        }
        section
    }

    fn flag_section(&self) -> String {
        if self.has_sha256 {
            SERVER_NOTE.to_string()
        } else {
            format!("{FLAG_RULES}\n\n{SERVER_NOTE}")
        }
    }

    pub fn render(&self) -> String {
        let mut guidelines = category_guidelines(self.task.category).to_string();
        if self.architecture == Architecture::Bits32 {
            guidelines.push_str(I386_GUIDELINES);
        }
        let category = self.task.category.map(|c| c.as_str()).unwrap_or("");

        format!(
            "Based on the following CTF challenge information, generate a Dockerfile that sets up a server environment for CTF players to interact with.

# Challenge Name:
{name}

# Challenge Category:
{category}

# Available Files:
{files}

# File Analysis:
{analysis}

# Challenge Description:
{description}

# REHOST.md Content:
{rehost}

# .init File Content:
{init}

If .init content is provided, it holds setup commands, paths or instructions for this challenge. Follow it when writing the Dockerfile.

{flag}

# CATEGORY-SPECIFIC GUIDELINES:
{guidelines}

# EXECUTABLE/SCRIPT WRAPPING REQUIREMENTS:
{wrapper}

{rules}",
            name = self.task.task_name,
            files = file_list(self.available_files),
            analysis = self.file_analysis,
            description = self.task.description,
            rehost = self.task.rehost_content,
            init = self.task.init_content,
            flag = self.flag_section(),
            wrapper = self.wrapper_section(),
            rules = DOCKERFILE_RULES,
        )
    }
}

pub fn dockerfile_system(base_image: &str) -> String {
    format!(
        "You are an expert at creating Dockerfiles for CTF challenges. Generate only the Dockerfile content, no explanations. Use {base_image} as the base image for better compatibility. Follow the guidelines and validation checklist carefully."
    )
}

pub fn feedback_system(base_image: &str) -> String {
    format!(
        "You are an expert at creating Dockerfiles for CTF challenges. The previous attempt tried to copy files that don't exist. ONLY use files from the provided available files list. Use {base_image} as the base image."
    )
}

/// Follow-up prompt after a Dockerfile copied files the challenge lacks.
pub fn feedback_prompt(
    missing: &[String],
    available_files: &[String],
    base_image: &str,
    original: &str,
) -> String {
    format!(
        "The previous Dockerfile tried to copy files that don't exist in the task folder:
Non-existing files: {missing}

Available files in the task folder are ONLY:
{available}

Generate a corrected Dockerfile that ONLY copies files from the list above.
Use {base_image} as the base image for compatibility.

Original prompt:
{original}",
        missing = file_list(missing),
        available = file_list(available_files),
    )
}

// ---------------------------------------------------------------------------
// docker-compose.yml
// ---------------------------------------------------------------------------

pub const COMPOSE_SYSTEM: &str = "You are an expert at creating docker-compose.yml files for CTF challenges. Generate only the docker-compose.yml content with meaningful aliases, no explanations.";

pub fn compose_prompt(task: &TaskInfo, available_files: &[String], dockerfile: &str) -> String {
    format!(
        "Based on the following CTF challenge information and generated Dockerfile, create a docker-compose.yml file with an appropriate ctfnet alias.

# Challenge Name:
{name}

# CTF Name:
{ctf}

# Available Files:
{files}

# Challenge Description:
{description}

Generated Dockerfile:
{dockerfile}

Requirements:
1. Use \"build: .\" to build from the local Dockerfile
2. Map the port the Dockerfile exposes
3. Join the external \"ctfnet\" network
4. Give the service a meaningful, DNS-compliant alias tied to this challenge, like challengename.ctf.io
5. Avoid generic names like \"web.chal.custom.io\"

Example aliases: showdown.csaw.io, cryptochallenge.picoctf.io, bufferoverflow.ctf.io

Respond with ONLY the docker-compose.yml content, no explanations.",
        name = task.task_name,
        ctf = task.ctf_name,
        files = file_list(available_files),
        description = task.description,
    )
}

// ---------------------------------------------------------------------------
// challenge.json
// ---------------------------------------------------------------------------

pub const CHALLENGE_JSON_SYSTEM: &str = "You are an expert at creating challenge.json files for CTF challenges. Generate only valid JSON, no explanations.";

pub fn challenge_json_prompt(
    task: &TaskInfo,
    files: &[String],
    compose: Option<&str>,
    server_needed: bool,
) -> String {
    let compose_section = match compose.filter(|c| server_needed && !c.trim().is_empty()) {
        Some(compose) => format!(
            "# Generated docker-compose.yml:
{compose}

Use the docker-compose.yml above to understand the server configuration and port mapping for this challenge."
        ),
        None => String::new(),
    };
    let files = file_list(files);
    let category = task.category.map(|c| c.as_str()).unwrap_or("");

    let mut prompt = format!(
        r#"Generate a challenge.json file for this CTF challenge following the exact schema.

Challenge Information:
# Name:
{name}

# Category:
{category}

# Files:
{files}

# CTF Challenge RAW Description:
{description}

# REHOST.md Content:
{rehost}

{compose_section}

REQUIRED JSON SCHEMA:
{{
    "name": "challenge name",
    "description": "human readable, self-contained challenge description for CTF players. The flag checker is NOT available, do NOT mention it",
    "files": ["list of files to upload for this challenge"],
    "box": "optional URL for external server challenge",
    "internal_port": "optional port for external server challenge",
    "compose": true if hosting the challenge requires a server, false otherwise,
    "flag": "flag for the challenge"
}}

RULES:
1. Use the exact challenge name: "{name}"
2. Use the exact files list: {files}
3. DO NOT generate the category field, it is set automatically
4. The flag should be a valid flag for the challenge
5. You MUST NOT mention the flagCheck in the description

OUTPUT: Return ONLY valid JSON matching the schema above. No explanations, no markdown, no extra text."#,
        name = task.task_name,
        description = task.description,
        rehost = task.rehost_content,
    );
    if server_needed {
        prompt.push_str("\n\nThe challenge is hosted on a server inside the docker container: you must specify `box`, `internal_port` (an integer) and `compose` in the challenge.json file.");
    }
    prompt
}

fn file_list(files: &[String]) -> String {
    serde_json::to_string(files).unwrap_or_else(|_| files.join(", "))
}
