//! OpenAI-compatible chat completions client with retry for transient errors
//! and SSE streaming.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::error::{ModelError, RetryConfig};
use super::{ChatCompletion, ChatMessage, ChatRequest, ModelClient};
use crate::stream::{StreamEvent, StreamSink};
use crate::task::TokenUsage;

/// Client for any server implementing `POST {base}/chat/completions`.
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    api_key: String,
    retry_config: RetryConfig,
}

impl OpenAiCompatibleClient {
    /// Create a client with the default retry configuration.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, ModelError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            retry_config: RetryConfig::default(),
        })
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Parse Retry-After header (seconds form) if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    async fn send(&self, body: &CompletionRequest<'_>) -> Result<reqwest::Response, ModelError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = Self::parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        Err(ModelError::from_status(status.as_u16(), text, retry_after))
    }

    /// Execute a single non-streaming request.
    async fn execute_request(
        &self,
        body: &CompletionRequest<'_>,
    ) -> Result<ChatCompletion, ModelError> {
        let text = self.send(body).await?.text().await?;
        let parsed: CompletionResponse = serde_json::from_str(&text).map_err(|e| {
            ModelError::parse_error(format!("Failed to parse response: {}, body: {}", e, text))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::parse_error("No choices in response".to_string()))?;

        Ok(ChatCompletion {
            content: choice.message.content.unwrap_or_default(),
            usage: parsed.usage.map(TokenUsage::from),
        })
    }

    /// Execute a request, retrying transient errors with backoff.
    async fn execute_with_retry(
        &self,
        body: &CompletionRequest<'_>,
    ) -> Result<ChatCompletion, ModelError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            let error = match self.execute_request(body).await {
                Ok(completion) => {
                    if attempt > 0 {
                        tracing::info!(
                            attempts = attempt + 1,
                            elapsed = ?start.elapsed(),
                            "Model request succeeded after retry"
                        );
                    }
                    return Ok(completion);
                }
                Err(error) => error,
            };

            if !self.retry_config.should_retry(&error, attempt) {
                tracing::error!(attempts = attempt + 1, error = %error, "Model request failed");
                return Err(error);
            }

            let remaining = self
                .retry_config
                .max_retry_duration
                .saturating_sub(start.elapsed());
            if remaining.is_zero() {
                tracing::warn!(error = %error, "Retry budget exhausted");
                return Err(error);
            }

            let delay = error.suggested_delay(attempt).min(remaining);
            tracing::warn!(
                attempt = attempt + 1,
                kind = %error.kind,
                delay = ?delay,
                "Model request failed, retrying: {}",
                error.message
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Execute a streaming request, forwarding content deltas to `sink`.
    async fn execute_streaming(
        &self,
        body: &CompletionRequest<'_>,
        sink: &dyn StreamSink,
    ) -> Result<ChatCompletion, ModelError> {
        let response = self.send(body).await?;
        let mut bytes = Box::pin(response.bytes_stream());
        let mut lines = SseLineBuffer::default();
        let mut content = String::new();
        let mut usage = None;

        'stream: while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                match parse_sse_line(&line)? {
                    Some(SseData::Done) => break 'stream,
                    Some(SseData::Chunk(chunk)) => {
                        if let Some(u) = chunk.usage {
                            usage = Some(TokenUsage::from(u));
                        }
                        let delta = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta.content)
                            .unwrap_or_default();
                        if !delta.is_empty() {
                            content.push_str(&delta);
                            sink.send(StreamEvent::Delta(delta)).await;
                        }
                    }
                    None => {}
                }
            }
        }

        Ok(ChatCompletion { content, usage })
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        sink: Option<&dyn StreamSink>,
    ) -> Result<ChatCompletion, ModelError> {
        let body = CompletionRequest {
            model: &request.model,
            messages: &request.messages,
            stream: sink.is_some(),
            stream_options: sink.map(|_| StreamOptions {
                include_usage: true,
            }),
        };

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            stream = body.stream,
            "Sending chat completion request"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ModelError::cancelled()),
            result = async {
                match sink {
                    Some(sink) => self.execute_streaming(&body, sink).await,
                    None => self.execute_with_retry(&body).await,
                }
            } => result,
        }
    }
}

/// Splits a byte stream into complete lines, carrying partial lines over.
#[derive(Default)]
struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

enum SseData {
    Done,
    Chunk(StreamChunk),
}

/// Interpret one SSE line. Non-`data:` lines (comments, `event:`) are ignored.
fn parse_sse_line(line: &str) -> Result<Option<SseData>, ModelError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Some(SseData::Done));
    }

    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| ModelError::parse_error(format!("Invalid stream chunk: {}: {}", e, data)))?;
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(ModelError::server_error(500, message));
    }
    let chunk: StreamChunk = serde_json::from_value(value)
        .map_err(|e| ModelError::parse_error(format!("Invalid stream chunk: {}", e)))?;
    Ok(Some(SseData::Chunk(chunk)))
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        TokenUsage::new(u.prompt_tokens, u.completion_tokens)
    }
}
