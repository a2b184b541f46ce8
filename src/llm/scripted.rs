//! Test double that replays canned model replies.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ChatCompletion, ChatRequest, ModelClient, ModelError};
use crate::stream::{StreamEvent, StreamSink};
use crate::task::TokenUsage;

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Error(ModelError),
    /// Block until the call's token is cancelled
    WaitForCancel,
}

#[derive(Default)]
pub struct ScriptedModelClient {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModelClient {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn texts<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(texts.into_iter().map(|t| ScriptedReply::Text(t.to_string())))
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        sink: Option<&dyn StreamSink>,
    ) -> Result<ChatCompletion, ModelError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front();

        match reply {
            Some(ScriptedReply::Text(text)) => {
                if let Some(sink) = sink {
                    // Two deltas so tests see incremental output
                    let mid = text.char_indices().nth(text.chars().count() / 2).map_or(0, |(i, _)| i);
                    for part in [&text[..mid], &text[mid..]] {
                        if !part.is_empty() {
                            sink.send(StreamEvent::Delta(part.to_string())).await;
                        }
                    }
                }
                Ok(ChatCompletion {
                    usage: Some(TokenUsage::new(10, text.split_whitespace().count() as u64)),
                    content: text,
                })
            }
            Some(ScriptedReply::Error(error)) => Err(error),
            Some(ScriptedReply::WaitForCancel) | None => {
                cancel.cancelled().await;
                Err(ModelError::cancelled())
            }
        }
    }
}
