//! Application configuration for CTF Forge.
//!
//! User config lives at `~/.ctfforge/ctfforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CtfForgeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "ctfforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".ctfforge";

// ---------------------------------------------------------------------------
// Config structs (matching ctfforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Chat-completions endpoint settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Writeup mapper settings.
    #[serde(default)]
    pub writeups: WriteupsConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Challenge archive processed by `forge` and scanned by `metadata`.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,

    /// Parallel workers for every stage.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Attempts per model-generated file.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            archive_dir: default_archive_dir(),
            workers: default_workers(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_archive_dir() -> String {
    "ctf-archive".into()
}
fn default_workers() -> usize {
    32
}
fn default_max_retries() -> u32 {
    10
}

/// `[model]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible API (`/chat/completions` is appended).
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used when `--model` is not given.
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_base() -> String {
    "http://localhost:4000/v1".into()
}
fn default_api_key_env() -> String {
    "CTFFORGE_API_KEY".into()
}
fn default_model() -> String {
    "deepseek-v3-0324".into()
}
fn default_temperature() -> f32 {
    0.6
}
fn default_top_p() -> f32 {
    0.95
}
fn default_timeout_secs() -> u64 {
    300
}

/// `[writeups]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteupsConfig {
    /// Minimum combined score for a writeup to be mapped to a challenge.
    #[serde(default = "default_min_threshold")]
    pub min_threshold: f64,
}

impl Default for WriteupsConfig {
    fn default() -> Self {
        Self {
            min_threshold: default_min_threshold(),
        }
    }
}

fn default_min_threshold() -> f64 {
    0.9
}

// ---------------------------------------------------------------------------
// Model settings (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime model settings, merged from config file and CLI flags.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Base URL of the chat-completions API.
    pub api_base: String,
    /// Bearer token, if any.
    pub api_key: Option<String>,
    /// Model identifier sent with each request.
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub timeout: Duration,
}

impl From<&AppConfig> for ModelSettings {
    fn from(config: &AppConfig) -> Self {
        let api_key = std::env::var(&config.model.api_key_env)
            .ok()
            .filter(|key| !key.is_empty());
        Self {
            api_base: config.model.api_base.clone(),
            api_key,
            model: config.model.default_model.clone(),
            temperature: config.model.temperature,
            top_p: config.model.top_p,
            timeout: Duration::from_secs(config.model.timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.ctfforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CtfForgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.ctfforge/ctfforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CtfForgeError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CtfForgeError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CtfForgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CtfForgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CtfForgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the model API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.model.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(CtfForgeError::config(format!(
            "model API key not found. Set the {var_name} environment variable \
             (or change [model].api_key_env in the config file)."
        ))),
    }
}
