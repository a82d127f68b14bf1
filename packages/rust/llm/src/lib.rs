//! Chat-completions client used by the forge.
//!
//! The generators only see the [`ChatModel`] trait. [`OpenAiCompatClient`]
//! talks to any OpenAI-compatible `/chat/completions` endpoint (a LiteLLM
//! proxy by default), and [`complete_with_retry`] wraps a model call with
//! exponential backoff that stops early on errors retrying cannot fix.

mod client;
mod error;
mod retry;

pub use client::{ChatMessage, ChatModel, OpenAiCompatClient};
pub use error::ModelError;
pub use retry::{RetryPolicy, complete_with_retry};
