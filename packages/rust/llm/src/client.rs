use std::time::Instant;

use async_trait::async_trait;
use ctfforge_shared::{CtfForgeError, ModelSettings, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ModelError;

/// User-Agent string for model requests.
const USER_AGENT: &str = concat!("ctfforge/", env!("CARGO_PKG_VERSION"));

/// One message of a chat-completions conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Anything that turns a conversation into a completion.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> std::result::Result<String, ModelError>;

    /// Identifier reported in logs.
    fn model_id(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatClient {
    client: Client,
    settings: ModelSettings,
}

impl OpenAiCompatClient {
    pub fn new(settings: ModelSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| CtfForgeError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.api_base.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> std::result::Result<String, ModelError> {
        let started = Instant::now();
        let body = ChatCompletionRequest {
            model: &self.settings.model,
            messages,
            temperature: self.settings.temperature,
            top_p: self.settings.top_p,
        };

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.settings.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status.as_u16(), body));
        }

        let text = response.text().await?;
        let parsed: ChatCompletionResponse =
            serde_json::from_str(&text).map_err(|e| ModelError::Decode(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ModelError::EmptyResponse)?;

        debug!(
            model = %self.settings.model,
            latency_ms = started.elapsed().as_millis() as u64,
            chars = content.len(),
            "completion received"
        );
        Ok(content)
    }

    fn model_id(&self) -> &str {
        &self.settings.model
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(api_base: String, api_key: Option<&str>) -> ModelSettings {
        ModelSettings {
            api_base,
            api_key: api_key.map(String::from),
            model: "deepseek-v3-0324".into(),
            temperature: 0.6,
            top_p: 0.95,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn message_helpers() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").content, "u");
    }

    #[tokio::test]
    async fn posts_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "deepseek-v3-0324",
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cmpl-1",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "FROM ubuntu:20.04"}}]
            })))
            .mount(&server)
            .await;

        let client =
            OpenAiCompatClient::new(settings(format!("{}/v1/", server.uri()), Some("sk-test")))
                .unwrap();
        let reply = client.complete(&[ChatMessage::user("hello")]).await.unwrap();
        assert_eq!(reply, "FROM ubuntu:20.04");
        assert_eq!(client.model_id(), "deepseek-v3-0324");
    }

    #[tokio::test]
    async fn maps_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new(settings(server.uri(), None)).unwrap();
        let err = client.complete(&[ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, ModelError::Status { status: 429, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn empty_choices_are_empty_responses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new(settings(server.uri(), None)).unwrap();
        let err = client.complete(&[ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, ModelError::EmptyResponse));
    }
}
