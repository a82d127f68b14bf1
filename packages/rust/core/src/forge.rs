//! The Challenge Forge stage: fill in `challenge.json`, `Dockerfile` and
//! `docker-compose.yml` for every challenge of an archive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ctfforge_archive::{
    CHALLENGE_JSON, COMPOSE_FILE, DOCKERFILE, INIT_FILE, extract_task_info, find_check_file,
    find_task_directories, has_sha256_file, list_task_files,
};
use ctfforge_llm::{ChatModel, RetryPolicy};
use ctfforge_shared::{CtfForgeError, Result, TaskInfo};
use rand::seq::IndexedRandom;
use tokio::sync::{Semaphore, mpsc};
use tracing::{error, info, instrument, warn};
use walkdir::WalkDir;

use crate::dockerfile::parse_flag;
use crate::generation::{
    ChallengeRequest, DockerContext, generate_challenge_json, generate_compose,
    generate_valid_dockerfile,
};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Settings of one forge run.
#[derive(Debug, Clone)]
pub struct ForgeOptions {
    /// Archive processed in place.
    pub archive_dir: PathBuf,
    /// Pristine archive copied to `archive_dir` before processing.
    pub template_dir: Option<PathBuf>,
    pub max_tasks: Option<usize>,
    /// Case-insensitive substring of the event name.
    pub filter_ctf: Option<String>,
    /// Case-insensitive substring of the category.
    pub filter_category: Option<String>,
    pub no_docker_compose: bool,
    /// Model retry budget; `retry.max_retries` is `--max_retries`.
    pub retry: RetryPolicy,
    pub workers: usize,
    pub skip_existing: bool,
    pub overwrite: bool,
    pub demo: bool,
}

impl Default for ForgeOptions {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("ctf-archive"),
            template_dir: None,
            max_tasks: None,
            filter_ctf: None,
            filter_category: None,
            no_docker_compose: false,
            retry: RetryPolicy::default(),
            workers: 32,
            skip_existing: true,
            overwrite: false,
            demo: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Callbacks for reporting forge progress.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a worker picks up a task.
    fn task_started(&self, task: &str);
    /// Called when a task ends, with the running count.
    fn task_finished(&self, task: &str, outcome: &TaskOutcome, completed: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, summary: &ForgeSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn task_started(&self, _task: &str) {}
    fn task_finished(
        &self,
        _task: &str,
        _outcome: &TaskOutcome,
        _completed: usize,
        _total: usize,
    ) {
    }
    fn done(&self, _summary: &ForgeSummary) {}
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What happened to one challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Names of the files written.
    Generated(Vec<String>),
    Skipped(String),
    Failed(String),
}

/// Counts of a forge run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForgeSummary {
    pub total: usize,
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// `(task, reason)` for every failure.
    pub failures: Vec<(String, String)>,
}

impl ForgeSummary {
    fn record(&mut self, task: &str, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Generated(_) => self.generated += 1,
            TaskOutcome::Skipped(_) => self.skipped += 1,
            TaskOutcome::Failed(reason) => {
                self.failed += 1;
                self.failures.push((task.to_string(), reason.clone()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Archive and task selection
// ---------------------------------------------------------------------------

/// Copy the template archive into place when one is configured.
///
/// An existing archive is kept unless `overwrite` is set, in which case it is
/// replaced by a fresh copy.
pub fn prepare_archive(opts: &ForgeOptions) -> Result<()> {
    let archive = &opts.archive_dir;
    let Some(template) = &opts.template_dir else {
        if !archive.is_dir() {
            return Err(CtfForgeError::validation(format!(
                "archive directory {} does not exist",
                archive.display()
            )));
        }
        return Ok(());
    };
    if !template.is_dir() {
        return Err(CtfForgeError::validation(format!(
            "template directory {} does not exist",
            template.display()
        )));
    }
    if same_path(template, archive) {
        return Ok(());
    }

    if archive.exists() {
        if !opts.overwrite {
            info!(archive = %archive.display(), "using existing archive");
            return Ok(());
        }
        info!(archive = %archive.display(), "replacing archive with a fresh copy");
        std::fs::remove_dir_all(archive).map_err(|e| CtfForgeError::io(archive, e))?;
    }
    let copied = copy_tree(template, archive)?;
    info!(
        template = %template.display(),
        archive = %archive.display(),
        files = copied,
        "copied template"
    );
    Ok(())
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| CtfForgeError::io(src, e.into()))?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| CtfForgeError::io(&target, e))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target).map_err(|e| CtfForgeError::io(&target, e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Every challenge of the archive.
pub fn discover_tasks(archive_dir: &Path) -> Vec<TaskInfo> {
    find_task_directories(archive_dir)
        .iter()
        .filter_map(|dir| extract_task_info(archive_dir, dir))
        .collect()
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Apply the filters of `opts`. Demo mode picks one random task instead.
pub fn select_tasks(tasks: Vec<TaskInfo>, opts: &ForgeOptions) -> Vec<TaskInfo> {
    if opts.demo {
        return tasks.choose(&mut rand::rng()).cloned().into_iter().collect();
    }

    let mut selected: Vec<TaskInfo> = tasks
        .into_iter()
        .filter(|t| {
            opts.filter_ctf
                .as_deref()
                .is_none_or(|f| contains_ignore_case(&t.ctf_name, f))
        })
        .filter(|t| {
            opts.filter_category.as_deref().is_none_or(|f| {
                t.category
                    .is_some_and(|c| contains_ignore_case(c.as_str(), f))
            })
        })
        .collect();
    if let Some(max) = opts.max_tasks {
        selected.truncate(max);
    }
    if opts.skip_existing && !opts.overwrite {
        selected.retain(|t| !t.task_path.join(CHALLENGE_JSON).exists());
    }
    selected
}

// ---------------------------------------------------------------------------
// Per-task planning
// ---------------------------------------------------------------------------

/// Which files a task still needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputPlan {
    pub challenge_json: bool,
    pub dockerfile: bool,
    pub compose: bool,
}

impl OutputPlan {
    pub fn all() -> Self {
        Self {
            challenge_json: true,
            dockerfile: true,
            compose: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.challenge_json || self.dockerfile || self.compose)
    }
}

/// Decide what to generate for the challenge at `dir`.
///
/// A challenge with all three files, or with only `challenge.json`, is
/// complete. Otherwise the missing files are generated; `overwrite`
/// regenerates everything.
pub fn plan_outputs(dir: &Path, overwrite: bool) -> OutputPlan {
    if overwrite {
        return OutputPlan::all();
    }
    let json = dir.join(CHALLENGE_JSON).is_file();
    let dockerfile = dir.join(DOCKERFILE).is_file();
    let compose = dir.join(COMPOSE_FILE).is_file();
    if (json && dockerfile && compose) || (json && !dockerfile && !compose) {
        return OutputPlan::default();
    }
    OutputPlan {
        challenge_json: !json,
        dockerfile: !dockerfile,
        compose: !compose,
    }
}

/// Delete previously generated files: the three outputs at the top level
/// and any `docker-compose` file anywhere below `dir`. Returns what was
/// removed.
pub fn cleanup_generated_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(CtfForgeError::validation(format!(
            "not a directory: {}",
            dir.display()
        )));
    }
    let mut targets: Vec<PathBuf> = [CHALLENGE_JSON, DOCKERFILE, COMPOSE_FILE]
        .iter()
        .map(|name| dir.join(name))
        .collect();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file()
            && entry.file_name().to_string_lossy().contains("docker-compose")
        {
            targets.push(entry.into_path());
        }
    }
    targets.sort();
    targets.dedup();

    let mut removed = Vec::new();
    for path in targets {
        if path.is_file() {
            std::fs::remove_file(&path).map_err(|e| CtfForgeError::io(&path, e))?;
            removed.push(path);
        }
    }
    Ok(removed)
}

/// Whether the challenge must run as a network service.
///
/// Challenges checked offline (a SHA256 flag file or a checker script) or
/// that bring their own flag do not.
pub fn server_needed(task: &TaskInfo) -> bool {
    let dir = task.task_path.as_path();
    !(task.rehost_content.to_lowercase().contains("own custom flag")
        || has_sha256_file(dir)
        || find_check_file(dir).is_some())
}

/// Files offered to the Dockerfile generator.
fn dockerfile_files(files: &[String]) -> Vec<String> {
    files
        .iter()
        .filter(|f| !f.to_lowercase().contains("flagcheck"))
        .filter(|f| *f != DOCKERFILE && *f != COMPOSE_FILE)
        .cloned()
        .collect()
}

/// Files players receive through `challenge.json`.
fn challenge_files(files: &[String]) -> Vec<String> {
    files
        .iter()
        .filter(|f| {
            let lower = f.to_lowercase();
            !lower.contains("flagcheck")
                && !lower.contains(".sha256")
                && !matches!(f.as_str(), DOCKERFILE | COMPOSE_FILE | CHALLENGE_JSON)
                && !f.ends_with(INIT_FILE)
        })
        .cloned()
        .collect()
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    let mut content = content.to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }
    std::fs::write(path, content).map_err(|e| CtfForgeError::io(path, e))
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

/// Generate the missing files of one challenge. Errors become
/// [`TaskOutcome::Failed`].
#[instrument(skip_all, fields(ctf = %task.ctf_name, task = %task.task_name))]
pub async fn process_task(
    model: &dyn ChatModel,
    task: &TaskInfo,
    opts: &ForgeOptions,
) -> TaskOutcome {
    match try_process_task(model, task, opts).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "task failed");
            TaskOutcome::Failed(e.to_string())
        }
    }
}

async fn try_process_task(
    model: &dyn ChatModel,
    task: &TaskInfo,
    opts: &ForgeOptions,
) -> Result<TaskOutcome> {
    let dir = task.task_path.as_path();
    if opts.overwrite {
        let removed = cleanup_generated_files(dir)?;
        if !removed.is_empty() {
            info!(removed = removed.len(), "removed previously generated files");
        }
    }
    let plan = plan_outputs(dir, opts.overwrite);
    if plan.is_empty() {
        return Ok(TaskOutcome::Skipped("already complete".into()));
    }

    let files = list_task_files(dir);
    let needs_server = server_needed(task);
    let mut written = Vec::new();

    let dockerfile_path = dir.join(DOCKERFILE);
    let mut dockerfile = None;
    let mut flag = None;
    if needs_server && plan.dockerfile {
        let ctx = DockerContext::build(task, dockerfile_files(&files));
        let generated = generate_valid_dockerfile(model, task, &ctx, &opts.retry).await?;
        write_file(&dockerfile_path, &generated.content)?;
        written.push(DOCKERFILE.to_string());
        flag = generated.flag;
        dockerfile = Some(generated.content);
    } else if dockerfile_path.is_file() {
        let content = std::fs::read_to_string(&dockerfile_path)
            .map_err(|e| CtfForgeError::io(&dockerfile_path, e))?;
        flag = parse_flag(&content);
        dockerfile = Some(content);
    }

    let compose_path = dir.join(COMPOSE_FILE);
    let mut compose = None;
    if needs_server && plan.compose && !opts.no_docker_compose {
        if let Some(dockerfile) = &dockerfile {
            let generated = generate_compose(model, task, dockerfile, &files, &opts.retry).await;
            if let Some(content) = generated {
                write_file(&compose_path, &content)?;
                written.push(COMPOSE_FILE.to_string());
                compose = Some(content);
            }
        }
    } else if compose_path.is_file() {
        compose = std::fs::read_to_string(&compose_path).ok();
    }

    if plan.challenge_json {
        let player_files = challenge_files(&files);
        let request = ChallengeRequest {
            task,
            files: &player_files,
            compose: compose.as_deref(),
            server_needed: needs_server,
            dockerfile_flag: flag.as_deref(),
        };
        let spec = generate_challenge_json(model, &request, &opts.retry).await?;
        let json = serde_json::to_string_pretty(&spec)
            .map_err(|e| CtfForgeError::parse(format!("cannot serialize challenge.json: {e}")))?;
        write_file(&dir.join(CHALLENGE_JSON), &json)?;
        written.push(CHALLENGE_JSON.to_string());
    }

    if written.is_empty() {
        return Ok(TaskOutcome::Skipped("nothing to generate".into()));
    }
    info!(files = ?written, "task generated");
    Ok(TaskOutcome::Generated(written))
}

fn task_label(task: &TaskInfo) -> String {
    format!("{}/{}", task.ctf_name, task.task_name)
}

enum WorkerEvent {
    Started(String),
    Finished(String, TaskOutcome),
}

/// Process `tasks`, sequentially for one worker or in demo mode, otherwise
/// with at most `opts.workers` tasks in flight.
#[instrument(skip_all, fields(tasks = tasks.len(), workers = opts.workers))]
pub async fn run_forge(
    model: Arc<dyn ChatModel>,
    tasks: Vec<TaskInfo>,
    opts: &ForgeOptions,
    progress: &dyn ProgressReporter,
) -> ForgeSummary {
    let total = tasks.len();
    let mut summary = ForgeSummary {
        total,
        ..ForgeSummary::default()
    };
    progress.phase(&format!("Processing {total} challenges"));

    if opts.workers <= 1 || opts.demo {
        for (i, task) in tasks.iter().enumerate() {
            let label = task_label(task);
            progress.task_started(&label);
            let outcome = process_task(model.as_ref(), task, opts).await;
            summary.record(&label, &outcome);
            progress.task_finished(&label, &outcome, i + 1, total);
        }
        progress.done(&summary);
        return summary;
    }

    let semaphore = Arc::new(Semaphore::new(opts.workers));
    let shared_opts = Arc::new(opts.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    for task in tasks {
        let sem = semaphore.clone();
        let model = model.clone();
        let opts = shared_opts.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            let label = task_label(&task);
            let _ = tx.send(WorkerEvent::Started(label.clone()));
            let outcome = process_task(model.as_ref(), &task, &opts).await;
            let _ = tx.send(WorkerEvent::Finished(label, outcome));
        });
    }
    drop(tx);

    let mut completed = 0;
    while let Some(event) = rx.recv().await {
        match event {
            WorkerEvent::Started(label) => progress.task_started(&label),
            WorkerEvent::Finished(label, outcome) => {
                completed += 1;
                summary.record(&label, &outcome);
                progress.task_finished(&label, &outcome, completed, total);
            }
        }
    }
    if completed < total {
        warn!(lost = total - completed, "worker tasks ended without a result");
        for _ in completed..total {
            summary.record("<unknown>", &TaskOutcome::Failed("worker panicked".into()));
        }
    }

    progress.done(&summary);
    summary
}
