use ctfforge_shared::CtfForgeError;

/// Why a chat-completions call failed.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("prompt exceeds the model context window: {0}")]
    ContextTooLong(String),

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("could not decode model response: {0}")]
    Decode(String),
}

impl ModelError {
    /// Build the error for a non-success status, recognizing context overflows.
    pub(crate) fn from_status(status: u16, body: String) -> Self {
        let lower = body.to_lowercase();
        let context_overflow = [
            "context length",
            "context_length",
            "maximum context",
            "too many tokens",
        ]
        .iter()
        .any(|needle| lower.contains(needle));
        if context_overflow && (400..500).contains(&status) {
            Self::ContextTooLong(body)
        } else {
            Self::Status { status, body }
        }
    }

    /// Whether another attempt could succeed.
    ///
    /// Transport failures, timeouts, rate limits, server errors and empty
    /// completions are transient. Other client errors (bad request, unknown
    /// model or provider) and context overflows are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::EmptyResponse => true,
            Self::Status { status, .. } => matches!(*status, 408 | 429) || *status >= 500,
            Self::ContextTooLong(_) | Self::Decode(_) => false,
        }
    }
}

impl From<ModelError> for CtfForgeError {
    fn from(err: ModelError) -> Self {
        CtfForgeError::Model(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert!(ModelError::from_status(429, "slow down".into()).is_retryable());
        assert!(ModelError::from_status(408, String::new()).is_retryable());
        assert!(ModelError::from_status(503, "overloaded".into()).is_retryable());
        assert!(!ModelError::from_status(400, "bad request".into()).is_retryable());
        assert!(!ModelError::from_status(404, "model not found".into()).is_retryable());
        assert!(ModelError::EmptyResponse.is_retryable());
    }

    #[test]
    fn detects_context_overflow() {
        let err = ModelError::from_status(
            400,
            r#"{"error": {"code": "context_length_exceeded"}}"#.into(),
        );
        assert!(matches!(err, ModelError::ContextTooLong(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn converts_to_model_error() {
        let err: CtfForgeError = ModelError::EmptyResponse.into();
        assert!(matches!(err, CtfForgeError::Model(_)));
        assert_eq!(err.to_string(), "model error: model returned an empty response");
    }
}
