//! Error types for CTF Forge.
//!
//! Library crates use [`CtfForgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all CTF Forge operations.
#[derive(Debug, thiserror::Error)]
pub enum CtfForgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// JSON/YAML/JSONL parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Language model call failed (transport, status, or empty response).
    #[error("model error: {0}")]
    Model(String),

    /// The model never produced usable output within the retry budget.
    #[error("generation error: {message}")]
    Generation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid input (bad flag combination, missing directory, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CtfForgeError>;

impl CtfForgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a generation error from any displayable message.
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CtfForgeError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = CtfForgeError::validation("--require-sha256 conflicts with --skip-sha256");
        assert!(err.to_string().contains("--require-sha256"));

        let err = CtfForgeError::generation("no valid Dockerfile after 3 attempts");
        assert!(err.to_string().starts_with("generation error:"));
    }

    #[test]
    fn io_error_keeps_path() {
        let err = CtfForgeError::io(
            "/tmp/missing/challenge.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let text = err.to_string();
        assert!(text.contains("challenge.json"));
        assert!(text.contains("gone"));
    }
}
