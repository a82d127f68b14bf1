//! Shared types, error model, and configuration for CTF Forge.
//!
//! This crate is the foundation depended on by all other CTF Forge crates.
//! It provides:
//! - [`CtfForgeError`]: the unified error type
//! - Domain types ([`TaskInfo`], [`ChallengeSpec`], [`IndexEntry`], [`MappingReport`])
//! - Configuration ([`AppConfig`], [`ModelSettings`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, ModelConfig, ModelSettings, WriteupsConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{CtfForgeError, Result};
pub use types::{
    BENCHMARK_NAME, Category, ChallengeIndex, ChallengeSpec, IndexEntry, MappedTask,
    MappingReport, MappingSummary, TaskInfo, WriteupDistribution, WriteupMatch, WriteupRecord,
};
