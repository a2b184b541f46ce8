//! Core Task type: conversation history, engine output, artifacts.
//!
//! # Invariants
//! - `output` is append-only (no API edits or removes an output message)
//! - `error.is_some()` only when `state == Failed`
//! - `state` only moves along the edges of [`TaskState::can_transition_to`]

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{InvalidTransition, TaskState};

/// Identifier of a task. Either supplied by the caller or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a fresh random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// A2A peers call this role `agent`
    #[serde(alias = "agent")]
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Where a file part points to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileRef {
    /// External file addressed by URI
    Uri {
        uri: String,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// Artifact produced by an earlier execution
    Artifact {
        #[serde(rename = "artifactId")]
        artifact_id: String,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

/// One fragment of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    File {
        file: FileRef,
    },
    Data {
        #[serde(rename = "mimeType", default = "default_data_mime_type")]
        mime_type: String,
        data: serde_json::Value,
    },
    /// Any part kind this runtime does not understand
    #[serde(other)]
    Unknown,
}

fn default_data_mime_type() -> String {
    "application/json".to_string()
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn file_uri(uri: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Part::File {
            file: FileRef::Uri {
                uri: uri.into(),
                mime_type: Some(mime_type.into()),
            },
        }
    }

    pub fn artifact_ref(artifact_id: impl Into<String>) -> Self {
        Part::File {
            file: FileRef::Artifact {
                artifact_id: artifact_id.into(),
                mime_type: None,
            },
        }
    }

    pub fn data(mime_type: impl Into<String>, data: serde_json::Value) -> Self {
        Part::Data {
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// A message exchanged within a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "messageId", default = "new_message_id")]
    pub message_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            message_id: new_message_id(),
            role,
            parts,
        }
    }

    /// Create a user message with a single text part.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    /// Create an assistant message with a single text part.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Part::text(text)])
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Byte payload produced by a completed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub filename: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Artifact {
    /// Plain-text artifact.
    pub fn text(filename: impl Into<String>, text: &str) -> Self {
        Self {
            mime_type: "text/plain".to_string(),
            filename: filename.into(),
            data: text.as_bytes().to_vec(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Aggregate token usage over every model call of a task.
///
/// # Invariants
/// - `total_tokens == prompt_tokens + completion_tokens` (enforced in constructor)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Component-wise sum.
    pub fn add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage::new(
            self.prompt_tokens.saturating_add(other.prompt_tokens),
            self.completion_tokens
                .saturating_add(other.completion_tokens),
        )
    }
}

/// A unit of conversational work tracked from submission to a terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    state: TaskState,
    /// Conversation so far, owned by the caller
    history: Vec<Message>,
    /// Messages produced by the engine
    output: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    artifacts: BTreeMap<String, Artifact>,
    #[serde(default)]
    usage: TokenUsage,
    created_at: String,
    updated_at: String,
}

impl Task {
    /// Create a submitted task with the given input history.
    pub fn new(id: TaskId, history: Vec<Message>) -> Self {
        let now = now_string();
        Self {
            id,
            state: TaskState::Submitted,
            history,
            output: Vec::new(),
            error: None,
            artifacts: BTreeMap::new(),
            usage: TokenUsage::default(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn output(&self) -> &[Message] {
        &self.output
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn artifacts(&self) -> &BTreeMap<String, Artifact> {
        &self.artifacts
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn updated_at(&self) -> &str {
        &self.updated_at
    }

    /// Append a message to the input history (caller side).
    pub fn push_input(&mut self, message: Message) {
        self.history.push(message);
        self.touch();
    }

    /// Append an engine-produced message.
    pub fn push_output(&mut self, message: Message) {
        self.output.push(message);
        self.touch();
    }

    /// Store an artifact under `artifact_id`. Existing artifacts are never replaced.
    ///
    /// Returns `false` if the ID is already taken.
    pub fn insert_artifact(&mut self, artifact_id: String, artifact: Artifact) -> bool {
        if self.artifacts.contains_key(&artifact_id) {
            return false;
        }
        self.artifacts.insert(artifact_id, artifact);
        self.touch();
        true
    }

    pub fn record_usage(&mut self, usage: &TokenUsage) {
        self.usage = self.usage.add(usage);
        self.touch();
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: TaskState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Transition to `Failed` and record the error text.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(TaskState::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = now_string();
    }
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}
