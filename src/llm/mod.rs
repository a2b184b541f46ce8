//! Model client module for talking to language models.
//!
//! The executor only sees the [`ModelClient`] trait. [`OpenAiCompatibleClient`]
//! speaks the OpenAI chat completions protocol (blocking and SSE streaming).

mod error;
mod openai;
#[cfg(test)]
pub(crate) mod scripted;

pub use error::{classify_http_status, ModelError, ModelErrorKind, RetryConfig};
pub use openai::OpenAiCompatibleClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::stream::StreamSink;
use crate::task::TokenUsage;

/// Separator placed between turns when a conversation is flattened to one prompt.
pub const TURN_SEPARATOR: &str = "\n\n---\n\n";

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// A single model invocation.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    /// Non-system turns joined with [`TURN_SEPARATOR`].
    pub fn flattened_prompt(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(TURN_SEPARATOR)
    }
}

/// Result of a model call.
#[derive(Debug, Clone, Default)]
pub struct ChatCompletion {
    /// Full response text, also when it was streamed
    pub content: String,
    /// Token usage, if the backend reported it
    pub usage: Option<TokenUsage>,
}

/// Trait for model clients.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run one chat exchange.
    ///
    /// When `sink` is given, partial text is forwarded to it as it arrives.
    /// Implementations must return promptly with [`ModelErrorKind::Cancelled`]
    /// once `cancel` fires.
    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        sink: Option<&dyn StreamSink>,
    ) -> Result<ChatCompletion, ModelError>;
}
