//! Model-driven generation of `Dockerfile`, `docker-compose.yml` and
//! `challenge.json`.

use std::sync::LazyLock;

use ctfforge_archive::{
    Architecture, ProvidedLibraries, binary_architecture, detect_custom_interpreters,
    detect_node_files, detect_problematic_shebangs, detect_python_files, file_analysis,
    find_check_file, find_sha256_flag, has_sha256_file, select_base_image,
};
use ctfforge_llm::{ChatMessage, ChatModel, RetryPolicy, complete_with_retry};
use ctfforge_shared::{Category, ChallengeSpec, CtfForgeError, Result, TaskInfo};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::docker_setup::{adaptive_setup, fallback_dockerfile, minimal_dockerfile};
use crate::dockerfile::{
    UNMATCHED_FILES_ISSUE, append_flag, insert_after_last_copy, insert_after_last_patch,
    inject_base_image, interpreter_fix_commands, library_fix_commands, missing_copy_sources,
    parse_flag, remove_duplicate_setup, render_run, shebang_fix_command, strip_code_fence,
    strip_compose_fence, validate_and_fix,
};
use crate::prompts::{
    CHALLENGE_JSON_SYSTEM, COMPOSE_SYSTEM, DockerfilePrompt, challenge_json_prompt,
    compose_prompt, dockerfile_system, feedback_prompt, feedback_system,
};

/// Generate-and-validate rounds before settling for what we have.
pub const VALIDATION_ROUNDS: u32 = 5;

// ---------------------------------------------------------------------------
// Dockerfile context
// ---------------------------------------------------------------------------

/// Everything derived from a challenge's files before asking for a Dockerfile.
#[derive(Debug, Clone)]
pub struct DockerContext {
    pub available_files: Vec<String>,
    pub has_sha256: bool,
    pub architecture: Architecture,
    /// Executable ELF binaries, bundled libraries excluded.
    pub binaries: Vec<String>,
    pub libraries: ProvidedLibraries,
    pub base_image: String,
    pub setup: String,
    pub library_fix: Option<String>,
    pub interpreter_fix: Option<String>,
    pub shebang_fix: Option<String>,
    pub prompt: String,
}

impl DockerContext {
    pub fn build(task: &TaskInfo, available_files: Vec<String>) -> Self {
        let dir = task.task_path.as_path();
        let has_sha256 = has_sha256_file(dir);
        let (architecture, elf_files) = binary_architecture(dir, &available_files);
        let binaries: Vec<String> = elf_files
            .into_iter()
            .filter(|f| !f.contains(".so"))
            .collect();
        let libraries = ProvidedLibraries::detect(&available_files);
        let base_image = select_base_image(dir, &libraries);
        let setup = adaptive_setup(
            &base_image,
            architecture,
            detect_python_files(dir, &available_files),
            detect_node_files(dir, &available_files),
        );

        let library_commands = if binaries.is_empty() {
            Vec::new()
        } else {
            library_fix_commands(&libraries, &binaries)
        };
        let library_fix = (!library_commands.is_empty())
            .then(|| render_run("Load the bundled libraries", &library_commands));

        let interpreter_commands = interpreter_fix_commands(
            &detect_custom_interpreters(dir, &available_files),
            &libraries,
        );
        let interpreter_fix = (!interpreter_commands.is_empty())
            .then(|| render_run("Replace non-standard ELF interpreters", &interpreter_commands));

        let shebang_fix = shebang_fix_command(&detect_problematic_shebangs(dir, &available_files));

        let analysis = file_analysis(dir, &available_files);
        let prompt = DockerfilePrompt {
            task,
            available_files: &available_files,
            file_analysis: &analysis,
            has_sha256,
            architecture,
            libraries: &libraries,
            has_binaries: !binaries.is_empty(),
        }
        .render();

        debug!(
            task = %task.task_name,
            arch = %architecture,
            base_image = %base_image,
            binaries = binaries.len(),
            "dockerfile context ready"
        );

        Self {
            available_files,
            has_sha256,
            architecture,
            binaries,
            libraries,
            base_image,
            setup,
            library_fix,
            interpreter_fix,
            shebang_fix,
            prompt,
        }
    }

    /// Turn a raw model reply into the final Dockerfile text.
    pub fn assemble(&self, reply: &str) -> String {
        let body = remove_duplicate_setup(&strip_code_fence(reply));
        let mut content = inject_base_image(&body, &self.base_image, &self.setup);
        if let Some(fix) = &self.library_fix {
            content = insert_after_last_copy(&content, fix);
        }
        if let Some(fix) = &self.interpreter_fix {
            content = insert_after_last_patch(&content, fix);
        }
        if let Some(fix) = &self.shebang_fix {
            content = insert_after_last_copy(&content, fix);
        }
        content
    }
}

/// A Dockerfile ready to be written, with the flag it plants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedDockerfile {
    pub content: String,
    pub flag: Option<String>,
}

// ---------------------------------------------------------------------------
// Model calls
// ---------------------------------------------------------------------------

/// One model call inside a content-retry loop. Fatal errors propagate;
/// transient ones back off and yield `None`.
async fn attempt_completion(
    model: &dyn ChatModel,
    messages: &[ChatMessage],
    policy: &RetryPolicy,
    attempt: u32,
    attempts: u32,
) -> Result<Option<String>> {
    match model.complete(messages).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if !e.is_retryable() => Err(e.into()),
        Err(e) => {
            warn!(attempt, max = attempts, error = %e, "model call failed");
            if attempt < attempts {
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Dockerfile
// ---------------------------------------------------------------------------

/// Ask the model for a Dockerfile until one copies only existing files and,
/// without a SHA256 flag file, plants a real flag.
#[instrument(skip_all, fields(task = %task.task_name))]
pub async fn generate_dockerfile(
    model: &dyn ChatModel,
    task: &TaskInfo,
    ctx: &DockerContext,
    policy: &RetryPolicy,
) -> Result<GeneratedDockerfile> {
    let attempts = policy.max_retries.max(1);
    let mut messages = vec![
        ChatMessage::system(dockerfile_system(&ctx.base_image)),
        ChatMessage::user(ctx.prompt.clone()),
    ];
    let mut last_problem = String::from("no reply");

    for attempt in 1..=attempts {
        let reply = attempt_completion(model, &messages, policy, attempt, attempts).await?;
        let Some(reply) = reply else {
            last_problem = "model call failed".into();
            continue;
        };
        let content = ctx.assemble(&reply);

        let missing = missing_copy_sources(&content, &ctx.available_files);
        if !missing.is_empty() {
            warn!(attempt, missing = ?missing, "dockerfile copies files that do not exist");
            messages = vec![
                ChatMessage::system(feedback_system(&ctx.base_image)),
                ChatMessage::user(feedback_prompt(
                    &missing,
                    &ctx.available_files,
                    &ctx.base_image,
                    &ctx.prompt,
                )),
            ];
            last_problem = format!("copies missing files: {}", missing.join(", "));
            continue;
        }

        let flag = parse_flag(&content);
        if !ctx.has_sha256 && flag.is_none() {
            warn!(attempt, "dockerfile has no usable flag");
            last_problem = "no usable flag".into();
            continue;
        }

        info!(attempt, "dockerfile generated");
        return Ok(GeneratedDockerfile { content, flag });
    }

    Err(CtfForgeError::generation(format!(
        "no usable Dockerfile after {attempts} attempts: {last_problem}"
    )))
}

/// [`generate_dockerfile`], falling back to a hand-written Dockerfile.
pub async fn generate_dockerfile_with_fallback(
    model: &dyn ChatModel,
    task: &TaskInfo,
    ctx: &DockerContext,
    policy: &RetryPolicy,
) -> GeneratedDockerfile {
    match generate_dockerfile(model, task, ctx, policy).await {
        Ok(generated) => generated,
        Err(e) => {
            warn!(task = %task.task_name, error = %e, "using fallback Dockerfile");
            fallback_for(task, ctx)
        }
    }
}

fn fallback_for(task: &TaskInfo, ctx: &DockerContext) -> GeneratedDockerfile {
    let (content, kind) = if !ctx.libraries.is_empty() && !ctx.binaries.is_empty() {
        (
            fallback_dockerfile(task, &ctx.available_files, &ctx.libraries),
            "fallback",
        )
    } else {
        (minimal_dockerfile(), "minimal")
    };
    if ctx.has_sha256 {
        return GeneratedDockerfile { content, flag: None };
    }
    let flag = format!("pwn.college{{{}_{kind}_flag}}", task.task_name);
    GeneratedDockerfile {
        content: append_flag(&content, &flag),
        flag: Some(flag),
    }
}

/// Generate, fix and validate for up to [`VALIDATION_ROUNDS`] rounds.
///
/// A round is accepted when no issue is left, or when none of the remaining
/// issues is about COPY sources that match no file. When every round still
/// copies unmatched files the task fails with a `Validation` error.
pub async fn generate_valid_dockerfile(
    model: &dyn ChatModel,
    task: &TaskInfo,
    ctx: &DockerContext,
    policy: &RetryPolicy,
) -> Result<GeneratedDockerfile> {
    let mut last_issues = Vec::new();
    for round in 1..=VALIDATION_ROUNDS {
        let generated = generate_dockerfile_with_fallback(model, task, ctx, policy).await;
        let (content, issues) = validate_and_fix(&generated.content, &ctx.available_files);

        if !issues.iter().any(|i| i.contains(UNMATCHED_FILES_ISSUE)) {
            if !issues.is_empty() {
                warn!(
                    task = %task.task_name,
                    round,
                    issues = ?issues,
                    "accepting Dockerfile with issues"
                );
            }
            let flag = parse_flag(&content).or(generated.flag);
            return Ok(GeneratedDockerfile { content, flag });
        }
        warn!(task = %task.task_name, round, issues = ?issues, "Dockerfile failed validation");
        last_issues = issues;
    }

    Err(CtfForgeError::validation(format!(
        "no valid Dockerfile after {VALIDATION_ROUNDS} rounds: {}",
        last_issues.join("; ")
    )))
}

// ---------------------------------------------------------------------------
// docker-compose.yml
// ---------------------------------------------------------------------------

/// Ask for a compose file. Failures are logged and yield `None`.
#[instrument(skip_all, fields(task = %task.task_name))]
pub async fn generate_compose(
    model: &dyn ChatModel,
    task: &TaskInfo,
    dockerfile: &str,
    files: &[String],
    policy: &RetryPolicy,
) -> Option<String> {
    let messages = [
        ChatMessage::system(COMPOSE_SYSTEM),
        ChatMessage::user(compose_prompt(task, files, dockerfile)),
    ];
    match complete_with_retry(model, &messages, policy).await {
        Ok(reply) => {
            let content = strip_compose_fence(&reply);
            (!content.is_empty()).then_some(content)
        }
        Err(e) => {
            warn!(error = %e, "docker-compose.yml generation failed");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// challenge.json
// ---------------------------------------------------------------------------

/// Inputs of a `challenge.json` generation.
pub struct ChallengeRequest<'a> {
    pub task: &'a TaskInfo,
    /// Files players receive.
    pub files: &'a [String],
    pub compose: Option<&'a str>,
    pub server_needed: bool,
    /// Flag planted by the Dockerfile, if any.
    pub dockerfile_flag: Option<&'a str>,
}

/// Ask for `challenge.json` until the reply yields a complete document.
#[instrument(skip_all, fields(task = %request.task.task_name))]
pub async fn generate_challenge_json(
    model: &dyn ChatModel,
    request: &ChallengeRequest<'_>,
    policy: &RetryPolicy,
) -> Result<ChallengeSpec> {
    let task = request.task;
    let messages = [
        ChatMessage::system(CHALLENGE_JSON_SYSTEM),
        ChatMessage::user(challenge_json_prompt(
            task,
            request.files,
            request.compose,
            request.server_needed,
        )),
    ];
    let attempts = policy.max_retries.max(1);
    let mut last_problem = String::from("no reply");

    for attempt in 1..=attempts {
        let reply = attempt_completion(model, &messages, policy, attempt, attempts).await?;
        let Some(reply) = reply else {
            last_problem = "model call failed".into();
            continue;
        };
        match parse_challenge_reply(&reply, task.category, request.server_needed) {
            Ok(spec) => {
                info!(attempt, "challenge.json generated");
                return Ok(finalize_challenge(spec, task, request.dockerfile_flag));
            }
            Err(problem) => {
                warn!(attempt, problem = %problem, "unusable challenge.json reply");
                last_problem = problem;
            }
        }
    }

    Err(CtfForgeError::generation(format!(
        "no usable challenge.json after {attempts} attempts: {last_problem}"
    )))
}

/// The JSON object in a model reply: fenced lines from the first `{` line
/// to the last `}` line, else the outermost braces.
pub fn extract_json_object(text: &str) -> Option<String> {
    static OBJECT: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.iter().position(|l| l.trim_start().starts_with('{'));
    let end = lines.iter().rposition(|l| l.trim_end().ends_with('}'));
    if let (Some(start), Some(end)) = (start, end) {
        if start <= end {
            return Some(lines[start..=end].join("\n"));
        }
    }
    OBJECT.find(text).map(|m| m.as_str().to_string())
}

/// Pull the known fields out of almost-JSON by pattern.
pub fn salvage_fields(raw: &str) -> Option<Map<String, Value>> {
    static NAME: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#""name"\s*:\s*"([^"]*)""#).expect("valid regex"));
    static DESCRIPTION: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?s)"description"\s*:\s*"(.*?)"\s*,\s*""#).expect("valid regex")
    });
    static DESCRIPTION_LAST: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?s)"description"\s*:\s*"(.*)"\s*\}"#).expect("valid regex")
    });
    static FILES: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"(?s)"files"\s*:\s*\[(.*?)\]"#).expect("valid regex"));
    static QUOTED: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#""([^"]*)""#).expect("valid regex"));
    static BOX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#""box"\s*:\s*"([^"]*)""#).expect("valid regex"));
    static PORT: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#""internal_port"\s*:\s*"?(\d+)"?"#).expect("valid regex"));
    static COMPOSE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#""compose"\s*:\s*(true|false)"#).expect("valid regex"));
    static FLAG: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#""flag"\s*:\s*"([^"]*)""#).expect("valid regex"));

    let capture = |re: &Regex| re.captures(raw).and_then(|c| c.get(1)).map(|m| m.as_str());

    let name = capture(&NAME)?;
    let description = capture(&DESCRIPTION).or_else(|| capture(&DESCRIPTION_LAST))?;
    let mut fields = Map::new();
    fields.insert("name".into(), Value::from(name));
    fields.insert(
        "description".into(),
        Value::from(description.replace("\\\"", "\"").replace("\\n", "\n")),
    );
    if let Some(list) = capture(&FILES) {
        let files: Vec<Value> = QUOTED
            .captures_iter(list)
            .filter_map(|c| c.get(1))
            .map(|m| Value::from(m.as_str()))
            .collect();
        fields.insert("files".into(), Value::Array(files));
    }
    if let Some(url) = capture(&BOX) {
        fields.insert("box".into(), Value::from(url));
    }
    if let Some(port) = capture(&PORT).and_then(|p| p.parse::<u64>().ok()) {
        fields.insert("internal_port".into(), Value::from(port));
    }
    if let Some(compose) = capture(&COMPOSE) {
        fields.insert("compose".into(), Value::Bool(compose == "true"));
    }
    if let Some(flag) = capture(&FLAG) {
        fields.insert("flag".into(), Value::from(flag));
    }
    Some(fields)
}

/// Parse and normalize a `challenge.json` reply. The error names what was
/// wrong, for the retry log.
pub fn parse_challenge_reply(
    reply: &str,
    category: Option<Category>,
    server_needed: bool,
) -> std::result::Result<ChallengeSpec, String> {
    let raw = extract_json_object(reply).ok_or("no JSON object in reply")?;
    let mut fields = match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => map,
        _ => salvage_fields(&raw).ok_or("reply is not parseable JSON")?,
    };

    if server_needed {
        let has_box = fields
            .get("box")
            .and_then(Value::as_str)
            .is_some_and(|b| !b.trim().is_empty());
        if !has_box || !fields.contains_key("internal_port") || !fields.contains_key("compose") {
            return Err("missing box, internal_port or compose".into());
        }
        let port = coerce_port(&fields["internal_port"])
            .ok_or("internal_port is not a port number")?;
        fields.insert("internal_port".into(), Value::from(port));
        let compose = match &fields["compose"] {
            Value::Bool(b) => *b,
            Value::String(s) if s.eq_ignore_ascii_case("true") => true,
            Value::String(s) if s.eq_ignore_ascii_case("false") => false,
            _ => return Err("compose is not a boolean".into()),
        };
        fields.insert("compose".into(), Value::Bool(compose));
    } else {
        for key in ["box", "internal_port", "compose"] {
            fields.remove(key);
        }
    }

    let description = fields
        .get("description")
        .and_then(Value::as_str)
        .filter(|d| !d.trim().is_empty())
        .ok_or("missing description")?;
    if description.to_lowercase().contains("flagcheck") {
        return Err("description mentions the flag checker".into());
    }
    if !fields.get("name").is_some_and(Value::is_string) {
        return Err("missing name".into());
    }
    if !fields.get("files").is_some_and(Value::is_array) {
        return Err("missing files".into());
    }

    let category = category.unwrap_or(Category::Misc);
    fields.insert("category".into(), Value::from(category.as_str()));
    for key in ["sha256_flag", "flag_check"] {
        fields.remove(key);
    }
    if fields.get("flag").is_some_and(|f| !f.is_string()) {
        fields.remove("flag");
    }

    serde_json::from_value(Value::Object(fields)).map_err(|e| format!("schema mismatch: {e}"))
}

fn coerce_port(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Fill in the flag fields from the challenge directory.
fn finalize_challenge(
    mut spec: ChallengeSpec,
    task: &TaskInfo,
    dockerfile_flag: Option<&str>,
) -> ChallengeSpec {
    let dir = task.task_path.as_path();
    spec.sha256_flag = find_sha256_flag(dir);
    spec.flag_check = find_check_file(dir);
    if spec.sha256_flag.is_some() {
        spec.flag = Some(placeholder_flag(task).into());
    } else if let Some(flag) = dockerfile_flag {
        spec.flag = Some(flag.to_string());
    }
    spec
}

/// Flag shown when only its hash is known. Some events use their own prefix.
pub fn placeholder_flag(task: &TaskInfo) -> &'static str {
    let path = task.task_path.to_string_lossy().replace('\\', "/").to_lowercase();
    if path.contains("accessdeniedctf") {
        "accessdenied{...}"
    } else if path.contains("hsctf2020/mountains") || path.contains("hsctf2021/multidimensional") {
        "flag{...}"
    } else {
        "..."
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use ctfforge_llm::ModelError;

    use super::*;
    use crate::testutil::{ScriptedModel, temp_tree, write};

    fn instant(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: std::time::Duration::ZERO,
            max_delay: std::time::Duration::ZERO,
        }
    }

    fn task_at(dir: &Path, category: Option<Category>) -> TaskInfo {
        TaskInfo {
            task_name: "echoes".into(),
            task_path: dir.to_path_buf(),
            ctf_name: "evt".into(),
            category,
            description: "Talk to the echo service.".into(),
            rehost_content: String::new(),
            init_content: String::new(),
        }
    }

    const GOOD_DOCKERFILE: &str = "```dockerfile
FROM ubuntu:22.04
RUN apt-get update && apt-get install -y socat
WORKDIR /challenge
COPY echo.py /challenge/
RUN echo 'pwn.college{echo_chamber}' > /flag && chmod 444 /flag
RUN chmod +x /challenge/echo.py
EXPOSE 1337
CMD [\"socat\", \"TCP-LISTEN:1337,reuseaddr,fork\", \"EXEC:/challenge/run.sh\"]
```";

    fn echo_task() -> (std::path::PathBuf, TaskInfo, Vec<String>) {
        let root = temp_tree("cf-gen");
        write(&root, "echo.py", "import sys\nprint(sys.stdin.readline())\n");
        let task = task_at(&root, Some(Category::Misc));
        (root, task, vec!["echo.py".to_string()])
    }

    #[tokio::test]
    async fn generates_dockerfile_with_injected_setup() {
        let (root, task, files) = echo_task();
        let ctx = DockerContext::build(&task, files);
        assert_eq!(ctx.base_image, "ubuntu:20.04");
        assert_eq!(ctx.architecture, Architecture::Bits64);

        let model = ScriptedModel::new(vec![Ok(GOOD_DOCKERFILE.into())]);
        let generated = generate_dockerfile(&model, &task, &ctx, &instant(3)).await.unwrap();
        assert!(
            generated
                .content
                .starts_with("FROM ubuntu:20.04\nENV DEBIAN_FRONTEND=noninteractive\n")
        );
        assert!(generated.content.contains("python-is-python3"));
        assert!(!generated.content.contains("```"));
        assert_eq!(generated.flag.as_deref(), Some("pwn.college{echo_chamber}"));
        assert_eq!(model.calls(), 1);

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn missing_files_trigger_feedback_prompt() {
        let (root, task, files) = echo_task();
        let ctx = DockerContext::build(&task, files);
        let wrong = GOOD_DOCKERFILE.replace("COPY echo.py", "COPY server.py");
        let model = ScriptedModel::new(vec![Ok(wrong), Ok(GOOD_DOCKERFILE.into())]);

        let generated = generate_dockerfile(&model, &task, &ctx, &instant(3)).await.unwrap();
        assert!(generated.content.contains("COPY echo.py"));
        assert_eq!(model.calls(), 2);
        let feedback = model.user_prompt(1);
        assert!(feedback.contains(r#"Non-existing files: ["server.py"]"#));
        assert!(feedback.contains("Original prompt:"));

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn placeholder_flag_is_retried_then_fallback() {
        let (root, task, files) = echo_task();
        let ctx = DockerContext::build(&task, files);
        let placeholder = GOOD_DOCKERFILE.replace("echo_chamber", "...");
        let model = ScriptedModel::always(&placeholder);

        let err = generate_dockerfile(&model, &task, &ctx, &instant(2)).await.unwrap_err();
        assert!(err.to_string().contains("no usable flag"));
        assert_eq!(model.calls(), 2);

        let generated = generate_dockerfile_with_fallback(&model, &task, &ctx, &instant(2)).await;
        assert_eq!(generated.flag.as_deref(), Some("pwn.college{echoes_minimal_flag}"));
        assert!(generated.content.contains("RUN echo 'pwn.college{echoes_minimal_flag}' > /flag"));

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn fatal_model_errors_stop_retries() {
        let (root, task, files) = echo_task();
        let ctx = DockerContext::build(&task, files);
        let model = ScriptedModel::new(vec![Err(ModelError::Status {
            status: 400,
            body: "unknown provider".into(),
        })]);
        let err = generate_dockerfile(&model, &task, &ctx, &instant(5)).await.unwrap_err();
        assert!(matches!(err, CtfForgeError::Model(_)));
        assert_eq!(model.calls(), 1);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn valid_dockerfile_round_accepts_fixable_output() {
        let (root, task, files) = echo_task();
        let ctx = DockerContext::build(&task, files);
        let broken = GOOD_DOCKERFILE.replace(
            "RUN chmod +x /challenge/echo.py",
            "RUN chmod +x /challenge/echo.py \\",
        );
        let model = ScriptedModel::new(vec![Ok(broken)]);
        let generated = generate_valid_dockerfile(&model, &task, &ctx, &instant(3)).await.unwrap();
        assert!(generated.content.contains("RUN chmod +x /challenge/echo.py\nEXPOSE 1337"));
        assert_eq!(model.calls(), 1);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn unmatched_copy_sources_fail_after_last_round() {
        let root = temp_tree("cf-gen-unmatched");
        let mut elf = vec![0x7f, b'E', b'L', b'F', 2, 1, 1];
        elf.resize(64, 0);
        write(&root, "chall", elf);
        write(&root, "libc.so.6", "GNU C Library (Ubuntu GLIBC 2.31-0ubuntu9) stable release.\n");
        // Docker reads the brackets as a glob, so this name can never be copied.
        write(&root, "notes[1].txt", "notes");
        let task = task_at(&root, Some(Category::Pwn));
        let files = vec!["chall".to_string(), "libc.so.6".into(), "notes[1].txt".into()];
        let ctx = DockerContext::build(&task, files);
        let model = ScriptedModel::new(vec![]);

        let err = generate_valid_dockerfile(&model, &task, &ctx, &instant(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CtfForgeError::Validation { .. }));
        assert!(err.to_string().contains("'notes[1].txt' does not match any available files"));
        assert_eq!(model.calls(), VALIDATION_ROUNDS as usize);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn compose_failures_are_none() {
        let (root, task, files) = echo_task();
        let model = ScriptedModel::new(vec![Ok(
            "```yaml\nservices:\n  echoes:\n    build: .\n```".into(),
        )]);
        let compose = generate_compose(&model, &task, "FROM x", &files, &instant(1)).await;
        assert_eq!(compose.as_deref(), Some("services:\n  echoes:\n    build: ."));
        assert!(model.user_prompt(0).contains("ctfnet"));

        let failing = ScriptedModel::new(vec![]);
        assert!(generate_compose(&failing, &task, "FROM x", &files, &instant(2)).await.is_none());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn extracts_json_objects() {
        let fenced = "Here you go:\n```json\n{\n  \"name\": \"x\"\n}\n```";
        assert_eq!(extract_json_object(fenced).as_deref(), Some("{\n  \"name\": \"x\"\n}"));
        assert_eq!(
            extract_json_object("result: {\"a\": 1} done").as_deref(),
            Some("{\"a\": 1}")
        );
        assert!(extract_json_object("nothing here").is_none());
    }

    #[test]
    fn salvages_broken_json() {
        let raw = r#"{
  "name": "echoes",
  "description": "Say "hello" to the service",
  "files": ["echo.py", "notes.txt"],
  "box": "nc echoes.ctf.io 1337",
  "internal_port": "1337",
  "compose": true,
}"#;
        let fields = salvage_fields(raw).unwrap();
        assert_eq!(fields["name"], "echoes");
        assert_eq!(fields["description"], "Say \"hello\" to the service");
        assert_eq!(fields["files"], serde_json::json!(["echo.py", "notes.txt"]));
        assert_eq!(fields["internal_port"], 1337);
        assert_eq!(fields["compose"], true);
        assert!(salvage_fields(r#"{"files": []}"#).is_none());
    }

    #[test]
    fn normalizes_challenge_replies() {
        let hosted = r#"{"name": "echoes", "description": "Echo.", "files": ["echo.py"],
            "box": "nc echoes.ctf.io 1337", "internal_port": "1337", "compose": "true",
            "category": "web", "flag": "pwn.college{x}", "server_description": "socat"}"#;
        let spec = parse_challenge_reply(hosted, Some(Category::Pwn), true).unwrap();
        assert_eq!(spec.category, Some(Category::Pwn));
        assert_eq!(spec.internal_port, Some(1337));
        assert_eq!(spec.compose, Some(true));
        assert!(spec.extra.contains_key("server_description"));

        let offline = parse_challenge_reply(hosted, None, false).unwrap();
        assert_eq!(offline.category, Some(Category::Misc));
        assert!(offline.box_url.is_none());
        assert!(offline.internal_port.is_none());
        assert!(offline.compose.is_none());

        let no_box = r#"{"name": "e", "description": "d", "files": []}"#;
        assert!(parse_challenge_reply(no_box, None, true).unwrap_err().contains("missing box"));

        let leaky = r#"{"name": "e", "description": "Run the flagCheck binary", "files": []}"#;
        assert!(parse_challenge_reply(leaky, None, false).is_err());

        let bad_port = r#"{"name": "e", "description": "d", "files": [], "box": "b",
            "internal_port": "http", "compose": true}"#;
        assert!(parse_challenge_reply(bad_port, None, true).is_err());
    }

    #[tokio::test]
    async fn challenge_json_uses_flag_files() {
        let root = temp_tree("cf-challenge");
        let dir = root.join("accessdeniedctf2022/echoes");
        write(&dir, "flag.sha256", "abc123\n");
        write(&dir, "flagCheck", "bin");
        let task = task_at(&dir, None);

        let model = ScriptedModel::new(vec![
            Ok("not json at all".into()),
            Ok(r#"{"name": "echoes", "description": "Echo.", "files": [], "flag": "pwn.college{x}"}"#.into()),
        ]);
        let request = ChallengeRequest {
            task: &task,
            files: &[],
            compose: None,
            server_needed: false,
            dockerfile_flag: Some("pwn.college{ignored}"),
        };
        let spec = generate_challenge_json(&model, &request, &instant(3)).await.unwrap();
        assert_eq!(model.calls(), 2);
        assert_eq!(spec.sha256_flag.as_deref(), Some("abc123"));
        assert_eq!(spec.flag.as_deref(), Some("accessdenied{...}"));
        assert!(spec.flag_check.unwrap().ends_with("flagCheck"));
        assert_eq!(spec.category, Some(Category::Misc));

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn challenge_json_takes_dockerfile_flag() {
        let (root, task, _files) = echo_task();
        let model = ScriptedModel::always(
            r#"{"name": "echoes", "description": "Echo.", "files": ["echo.py"], "box": "nc echoes.ctf.io 1337", "internal_port": 1337, "compose": true, "flag": "made up"}"#,
        );
        let request = ChallengeRequest {
            task: &task,
            files: &["echo.py".to_string()],
            compose: Some("services: {}"),
            server_needed: true,
            dockerfile_flag: Some("pwn.college{echo_chamber}"),
        };
        let spec = generate_challenge_json(&model, &request, &instant(3)).await.unwrap();
        assert_eq!(spec.flag.as_deref(), Some("pwn.college{echo_chamber}"));
        assert!(spec.sha256_flag.is_none());
        assert_eq!(spec.box_url.as_deref(), Some("nc echoes.ctf.io 1337"));
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn placeholder_flags_per_event() {
        let task = |p: &str| task_at(Path::new(p), None);
        assert_eq!(placeholder_flag(&task("a/hsctf2020/mountains")), "flag{...}");
        assert_eq!(placeholder_flag(&task("a/AccessDeniedCTF2022/x")), "accessdenied{...}");
        assert_eq!(placeholder_flag(&task("a/other/x")), "...");
    }
}
