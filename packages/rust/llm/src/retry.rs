use std::time::Duration;

use tracing::warn;

use crate::client::{ChatMessage, ChatModel};
use crate::error::ModelError;

/// How often and how patiently a model call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Backoff after the given 1-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Call `model`, retrying transient failures with exponential backoff.
///
/// Fatal errors are returned at once. After `policy.max_retries` attempts
/// the last error is returned.
pub async fn complete_with_retry(
    model: &dyn ChatModel,
    messages: &[ChatMessage],
    policy: &RetryPolicy,
) -> Result<String, ModelError> {
    let attempts = policy.max_retries.max(1);
    let mut attempt = 1;
    loop {
        match model.complete(messages).await {
            Ok(text) => return Ok(text),
            Err(e) if !e.is_retryable() || attempt >= attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    model = model.model_id(),
                    attempt,
                    max = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "model call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, ModelError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, ModelError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ChatModel for Scripted {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, ModelError> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ModelError::EmptyResponse))
        }

        fn model_id(&self) -> &str {
            "scripted"
        }
    }

    fn instant(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let model = Scripted::new(vec![
            Err(ModelError::EmptyResponse),
            Err(ModelError::Status {
                status: 502,
                body: "bad gateway".into(),
            }),
            Ok("done".into()),
        ]);
        let reply = complete_with_retry(&model, &[], &instant(5)).await.unwrap();
        assert_eq!(reply, "done");
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn fatal_errors_stop_immediately() {
        let model = Scripted::new(vec![
            Err(ModelError::Status {
                status: 400,
                body: "unknown provider".into(),
            }),
            Ok("never".into()),
        ]);
        let err = complete_with_retry(&model, &[], &instant(5)).await.unwrap_err();
        assert!(matches!(err, ModelError::Status { status: 400, .. }));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let model = Scripted::new(vec![]);
        let err = complete_with_retry(&model, &[], &instant(3)).await.unwrap_err();
        assert!(matches!(err, ModelError::EmptyResponse));
        assert_eq!(model.calls(), 3);
    }
}
