use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use ctfforge_llm::{ChatMessage, ChatModel, ModelError};

/// Fresh directory under the system temp dir.
pub fn temp_tree(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::now_v7()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Write `content` to `root/rel`, creating parent directories.
pub fn write(root: &Path, rel: &str, content: impl AsRef<[u8]>) -> PathBuf {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    path
}

/// Chat model that replays canned replies and records every prompt.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ModelError>>>,
    fallback: Option<String>,
    pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, ModelError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Replies `text` to every call.
    pub fn always(text: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Some(text.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// User message of the `n`-th call.
    pub fn user_prompt(&self, n: usize) -> String {
        self.prompts.lock().unwrap()[n]
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        match &self.fallback {
            Some(text) => Ok(text.clone()),
            None => Err(ModelError::EmptyResponse),
        }
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}
