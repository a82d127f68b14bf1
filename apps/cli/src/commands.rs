//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use ctfforge_core::dockerfile::fix_dockerfile_in_place;
use ctfforge_core::forge::{
    ForgeOptions, ForgeSummary, ProgressReporter, TaskOutcome, discover_tasks, prepare_archive,
    run_forge, select_tasks,
};
use ctfforge_core::metadata::{
    IndexStats, MarkerFilter, generate_index, output_file_name, read_index, write_index,
};
use ctfforge_core::writeups::{
    MappingOptions, MatchMode, load_writeups, map_writeups, unmatched_tasks, write_report,
};
use ctfforge_llm::{ChatModel, OpenAiCompatClient, RetryPolicy};
use ctfforge_shared::{
    AppConfig, ModelSettings, init_config, load_config, validate_api_key,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// CTF Forge: build runnable CTF challenges and map writeups onto them.
#[derive(Parser)]
#[command(
    name = "ctfforge",
    version,
    about = "Generate challenge files for a CTF archive, index it, and map writeups onto it.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Generate challenge.json, Dockerfile and docker-compose.yml for each challenge.
    Forge(ForgeArgs),

    /// Build the ctf_archive*.json index of an archive.
    Metadata(MetadataArgs),

    /// Map writeups from a JSONL dataset onto an index.
    Writeups(WriteupsArgs),

    /// Repair trailing backslashes and COPY paths of an existing Dockerfile.
    FixDockerfile {
        /// Dockerfile, or a challenge directory containing one.
        path: PathBuf,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Options of `forge`. Flag names follow the dataset tooling conventions.
#[derive(Args)]
pub(crate) struct ForgeArgs {
    /// Archive to process in place.
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Pristine archive copied to --path before processing.
    #[arg(long)]
    pub template: Option<PathBuf>,

    /// Maximum number of tasks to process.
    #[arg(long = "max_tasks")]
    pub max_tasks: Option<usize>,

    /// Only events whose name contains this text (case-insensitive).
    #[arg(long = "filter_ctf")]
    pub filter_ctf: Option<String>,

    /// Only categories containing this text (case-insensitive).
    #[arg(long = "filter_category")]
    pub filter_category: Option<String>,

    /// Skip generating docker-compose.yml files.
    #[arg(long = "no_docker_compose")]
    pub no_docker_compose: bool,

    /// Model identifier (defaults to [model].default_model).
    #[arg(long)]
    pub model: Option<String>,

    /// Attempts per generated file.
    #[arg(long = "max_retries")]
    pub max_retries: Option<u32>,

    /// Challenges processed concurrently.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Skip tasks that already have challenge.json.
    #[arg(
        long = "skip_existing",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true"
    )]
    pub skip_existing: bool,

    /// Regenerate every file, and recopy the template when one is given.
    #[arg(long)]
    pub overwrite: bool,

    /// Process one random task sequentially with debug logging.
    #[arg(long)]
    pub demo: bool,

    /// Base URL of the OpenAI-compatible API.
    #[arg(long = "api-base", env = "CTFFORGE_API_BASE")]
    pub api_base: Option<String>,
}

/// Options of `metadata`.
#[derive(Args)]
pub(crate) struct MetadataArgs {
    /// Archive to scan.
    #[arg(long)]
    pub folder: Option<PathBuf>,

    /// Only challenges with a SHA256 flag file.
    #[arg(long, conflicts_with = "skip_sha256")]
    pub require_sha256: bool,

    /// Skip challenges with a SHA256 flag file.
    #[arg(long)]
    pub skip_sha256: bool,

    /// Skip challenges with a flagcheck file.
    #[arg(long)]
    pub skip_flagcheck: bool,

    /// Only challenges whose challenge.json sets compose to true.
    #[arg(long)]
    pub require_compose: bool,

    /// Directories checked concurrently.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Output file (defaults to a name derived from the filters).
    #[arg(long)]
    pub output: Option<PathBuf>,
}

/// Options of `writeups`.
#[derive(Args)]
pub(crate) struct WriteupsArgs {
    /// Writeups dataset, one JSON object per line.
    #[arg(long, default_value = "writeups.jsonl")]
    pub jsonl_file: PathBuf,

    /// Challenge index produced by `metadata`.
    #[arg(long, default_value = "ctf_archive.json")]
    pub json_file: PathBuf,

    #[arg(long, default_value = "task_writeup_mapping.json")]
    pub output_file: PathBuf,

    /// Minimum combined score (defaults to [writeups].min_threshold).
    #[arg(long)]
    pub min_threshold: Option<f64>,

    #[arg(long)]
    pub workers: Option<usize>,

    /// Writeups to read, 0 for all.
    #[arg(long, default_value_t = 0)]
    pub limit: usize,

    /// Score combination.
    #[arg(long, value_enum, default_value = "strict")]
    pub mode: ModeArg,
}

/// Writeup scoring mode.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum ModeArg {
    Strict,
    Weighted,
}

impl From<ModeArg> for MatchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Strict => MatchMode::Strict,
            ModeArg::Weighted => MatchMode::Weighted,
        }
    }
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. `forge --demo` logs at debug level.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let demo = matches!(&cli.command, Command::Forge(args) if args.demo);
    let filter = match cli.verbose.max(u8::from(demo)) {
        0 => "ctfforge=info",
        1 => "ctfforge=debug",
        _ => "ctfforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let verbose = cli.verbose > 0;
    match cli.command {
        Command::Forge(args) => cmd_forge(args).await,
        Command::Metadata(args) => cmd_metadata(args).await,
        Command::Writeups(args) => cmd_writeups(args, verbose).await,
        Command::FixDockerfile { path } => cmd_fix_dockerfile(&path),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// forge
// ---------------------------------------------------------------------------

fn forge_options(args: &ForgeArgs, config: &AppConfig) -> ForgeOptions {
    let max_retries = args.max_retries.unwrap_or(config.defaults.max_retries);
    ForgeOptions {
        archive_dir: args
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.defaults.archive_dir)),
        template_dir: args.template.clone(),
        max_tasks: args.max_tasks,
        filter_ctf: args.filter_ctf.clone(),
        filter_category: args.filter_category.clone(),
        no_docker_compose: args.no_docker_compose,
        retry: RetryPolicy::with_max_retries(max_retries),
        workers: args.workers.unwrap_or(config.defaults.workers).max(1),
        skip_existing: args.skip_existing,
        overwrite: args.overwrite,
        demo: args.demo,
    }
}

async fn cmd_forge(args: ForgeArgs) -> Result<()> {
    let config = load_config()?;
    if let Err(e) = validate_api_key(&config) {
        warn!(error = %e, "sending model requests without an API key");
    }

    let mut settings = ModelSettings::from(&config);
    if let Some(model) = &args.model {
        settings.model = model.clone();
    }
    if let Some(api_base) = &args.api_base {
        settings.api_base = api_base.clone();
    }
    let opts = forge_options(&args, &config);

    prepare_archive(&opts)?;
    let tasks = discover_tasks(&opts.archive_dir);
    let found = tasks.len();
    let selected = select_tasks(tasks, &opts);
    info!(
        archive = %opts.archive_dir.display(),
        found,
        selected = selected.len(),
        model = %settings.model,
        workers = opts.workers,
        "starting forge"
    );
    if selected.is_empty() {
        println!("No tasks to process ({found} found in {}).", opts.archive_dir.display());
        return Ok(());
    }

    let model: Arc<dyn ChatModel> = Arc::new(OpenAiCompatClient::new(settings)?);
    let reporter = CliProgress::new(selected.len());
    let summary = run_forge(model, selected, &opts, &reporter).await;

    println!();
    println!("  Forge complete!");
    println!("  Tasks:     {}", summary.total);
    println!("  Generated: {}", summary.generated);
    println!("  Skipped:   {}", summary.skipped);
    println!("  Failed:    {}", summary.failed);
    if !summary.failures.is_empty() {
        println!();
        println!("  Failures:");
        for (task, reason) in summary.failures.iter().take(10) {
            println!("    {task}: {reason}");
        }
        if summary.failures.len() > 10 {
            println!("    ... and {} more", summary.failures.len() - 10);
        }
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        bar.set_style(style);
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn task_started(&self, task: &str) {
        self.bar.set_message(format!("Processing {task}"));
    }

    fn task_finished(&self, task: &str, outcome: &TaskOutcome, completed: usize, _total: usize) {
        self.bar.set_position(completed as u64);
        let status = match outcome {
            TaskOutcome::Generated(files) => format!("generated {}", files.join(", ")),
            TaskOutcome::Skipped(reason) => format!("skipped ({reason})"),
            TaskOutcome::Failed(_) => "failed".to_string(),
        };
        self.bar.set_message(format!("{task}: {status}"));
    }

    fn done(&self, _summary: &ForgeSummary) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// metadata
// ---------------------------------------------------------------------------

async fn cmd_metadata(args: MetadataArgs) -> Result<()> {
    let config = load_config()?;
    let filter = MarkerFilter {
        require_sha256: args.require_sha256,
        skip_sha256: args.skip_sha256,
        skip_flagcheck: args.skip_flagcheck,
        require_compose: args.require_compose,
    };
    filter.validate()?;

    let folder = args
        .folder
        .unwrap_or_else(|| PathBuf::from(&config.defaults.archive_dir));
    let workers = args.workers.unwrap_or(config.defaults.workers);
    info!(folder = %folder.display(), workers, "generating index");

    let index = generate_index(&folder, filter, workers).await?;
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(output_file_name(&filter)));
    write_index(&output, &index)?;

    println!();
    println!("  Generated {} with {} challenges", output.display(), index.len());
    if !index.is_empty() {
        println!();
        println!("  Sample entries:");
        for (key, entry) in index.iter().take(3) {
            println!("    {key}: {} ({})", entry.challenge, entry.path);
        }
    }
    let stats = IndexStats::of(&index);
    println!();
    println!("  Events:     {}", stats.events);
    println!("  Categories: {}", stats.categories);
    println!("  Total:      {}", stats.total);
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// writeups
// ---------------------------------------------------------------------------

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

async fn cmd_writeups(args: WriteupsArgs, verbose: bool) -> Result<()> {
    let config = load_config()?;
    let index = read_index(&args.json_file)?;
    let records = load_writeups(&args.jsonl_file, args.limit)?;
    let opts = MappingOptions {
        min_threshold: args.min_threshold.unwrap_or(config.writeups.min_threshold),
        workers: args.workers.unwrap_or(config.defaults.workers).max(1),
        mode: args.mode.into(),
    };
    info!(
        tasks = index.len(),
        writeups = records.len(),
        threshold = opts.min_threshold,
        mode = ?opts.mode,
        "mapping writeups"
    );

    let report = map_writeups(records, &index, &opts).await?;
    write_report(&args.output_file, &report)?;

    let summary = &report.summary;
    println!();
    println!("  Writeups processed: {}", summary.total_writeups_processed);
    println!(
        "  Matched:            {} ({})",
        summary.matched_writeups,
        percent(summary.writeup_match_rate)
    );
    println!("  Tasks in archive:   {}", summary.total_tasks_in_archive);
    println!(
        "  Tasks with writeups: {} ({})",
        summary.tasks_with_writeups,
        percent(summary.task_coverage_rate)
    );
    println!("  Saved to {}", args.output_file.display());

    let top = report.top_tasks(10);
    if !top.is_empty() {
        println!();
        println!("  Top tasks by writeups:");
        for (i, (_, task)) in top.iter().enumerate() {
            println!(
                "  {:2}. {} - {} writeups",
                i + 1,
                task.ctf_task_info.path,
                task.writeups.len()
            );
        }
    }

    if let Some(dist) = report.distribution() {
        println!();
        println!("  Writeups per task:");
        println!("    Average: {:.1}", dist.average);
        println!("    Range:   {} - {}", dist.min, dist.max);
        println!("    Tasks with 1 writeup:   {}", dist.single);
        println!("    Tasks with 2+ writeups: {}", dist.multiple);
    }

    if verbose {
        let unmatched = unmatched_tasks(&index, &report);
        println!();
        println!("  Tasks without writeups ({}):", unmatched.len());
        for key in unmatched.iter().take(20) {
            if let Some(entry) = index.get(*key) {
                println!("    {}", entry.path);
            }
        }
        if unmatched.len() > 20 {
            println!("    ... and {} more", unmatched.len() - 20);
        }
    } else if summary.matched_writeups > 0 {
        println!();
        println!("  Example matches:");
        let examples = top
            .iter()
            .take(5)
            .flat_map(|(_, task)| {
                task.writeups
                    .iter()
                    .take(2)
                    .map(move |w| (w, &task.ctf_task_info.path))
            })
            .take(5);
        for (writeup, path) in examples {
            println!(
                "    {} -> {} (score: {:.3})",
                writeup.writeup_path, path, writeup.match_score
            );
        }
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// fix-dockerfile
// ---------------------------------------------------------------------------

fn cmd_fix_dockerfile(path: &Path) -> Result<()> {
    let file = if path.is_dir() {
        path.join("Dockerfile")
    } else {
        path.to_path_buf()
    };
    if !file.is_file() {
        return Err(eyre!("no Dockerfile at '{}'", file.display()));
    }

    if fix_dockerfile_in_place(&file)? {
        println!("Fixed {}", file.display());
    } else {
        println!("{} needed no changes", file.display());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
