//! Streaming events emitted while a task executes.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::task::TaskState;

/// One event on a task's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Partial model output
    Delta(String),
    /// The task moved to `status`
    State {
        status: TaskState,
        error: Option<String>,
    },
}

#[derive(Serialize)]
struct StatePayload<'a> {
    status: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl StreamEvent {
    pub fn state(status: TaskState) -> Self {
        StreamEvent::State {
            status,
            error: None,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::Delta(_) => "delta",
            StreamEvent::State { .. } => "state",
        }
    }

    /// Event payload as sent on the wire: raw text for deltas, JSON for state.
    pub fn data(&self) -> String {
        match self {
            StreamEvent::Delta(text) => text.clone(),
            StreamEvent::State { status, error } => {
                let payload = StatePayload {
                    status: *status,
                    error: error.as_deref(),
                };
                serde_json::to_string(&payload)
                    .unwrap_or_else(|_| format!("{{\"status\":\"{}\"}}", status))
            }
        }
    }
}

/// Receiver of stream events.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn send(&self, event: StreamEvent);
}

/// Sink that forwards events into an mpsc channel.
///
/// A dropped receiver is not an error: the execution keeps running and
/// events are discarded.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiving end.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl StreamSink for ChannelSink {
    async fn send(&self, event: StreamEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("Stream receiver dropped, discarding event");
        }
    }
}
