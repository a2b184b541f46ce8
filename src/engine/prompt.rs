//! Turns a task's message history into the text sent to the model.

use thiserror::Error;
use url::Url;

use crate::llm::{ChatMessage, ChatRole, TURN_SEPARATOR};
use crate::task::{FileRef, Message, Part, Role};

const DEFAULT_FILE_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("task history contains no user message")]
    NoUserMessage,

    #[error("task history contains no usable content")]
    EmptyPrompt,

    #[error("invalid file URI `{uri}`: {reason}")]
    InvalidFileUri { uri: String, reason: String },
}

/// Render the user and assistant turns of `messages`, one chat message per
/// turn that contributes content.
pub fn render_turns(messages: &[Message]) -> Result<Vec<ChatMessage>, ValidationError> {
    if !messages.iter().any(|m| m.role == Role::User) {
        return Err(ValidationError::NoUserMessage);
    }

    let mut turns = Vec::new();
    for message in messages {
        let role = match message.role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
            Role::System => continue,
        };

        let mut rendered = Vec::with_capacity(message.parts.len());
        for part in &message.parts {
            if let Some(text) = render_part(part)? {
                rendered.push(text);
            }
        }
        if !rendered.is_empty() {
            turns.push(ChatMessage::new(role, rendered.join("\n")));
        }
    }

    if turns.is_empty() {
        return Err(ValidationError::EmptyPrompt);
    }
    Ok(turns)
}

/// The whole history as one prompt string.
pub fn assemble_prompt(messages: &[Message]) -> Result<String, ValidationError> {
    let turns = render_turns(messages)?;
    Ok(turns
        .iter()
        .map(|t| t.content.as_str())
        .collect::<Vec<_>>()
        .join(TURN_SEPARATOR))
}

fn render_part(part: &Part) -> Result<Option<String>, ValidationError> {
    let rendered = match part {
        Part::Text { text } if text.is_empty() => return Ok(None),
        Part::Text { text } => text.clone(),
        Part::File {
            file: FileRef::Uri { uri, mime_type },
        } => {
            validate_file_uri(uri)?;
            format!(
                "[file: {} ({})]",
                uri,
                mime_type.as_deref().unwrap_or(DEFAULT_FILE_MIME)
            )
        }
        Part::File {
            file:
                FileRef::Artifact {
                    artifact_id,
                    mime_type,
                },
        } => format!(
            "[artifact: {} ({})]",
            artifact_id,
            mime_type.as_deref().unwrap_or(DEFAULT_FILE_MIME)
        ),
        Part::Data { mime_type, .. } => format!("[data: {}]", mime_type),
        Part::Unknown => return Ok(None),
    };
    Ok(Some(rendered))
}

/// Only local `file://` URIs are accepted.
fn validate_file_uri(uri: &str) -> Result<(), ValidationError> {
    let parsed = Url::parse(uri).map_err(|e| ValidationError::InvalidFileUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.scheme() != "file" {
        return Err(ValidationError::InvalidFileUri {
            uri: uri.to_string(),
            reason: format!("unsupported scheme `{}`", parsed.scheme()),
        });
    }
    Ok(())
}
