//! Configuration management for the A2A runtime.
//!
//! Configuration can be set via environment variables:
//! - `MODEL_API_KEY` - Required. API key for the model backend.
//! - `MODEL_BASE_URL` - Optional. OpenAI-compatible base URL. Defaults to `https://api.openai.com/v1`.
//! - `DEFAULT_MODEL` - Optional. Model identifier. Defaults to `gpt-4o-mini`.
//! - `SYSTEM_PROMPT` - Optional. System message prepended to every request.
//! - `MAX_CONTEXT_TOKENS` - Optional. Prompt token budget, `0` for unlimited. Defaults to `0`.
//! - `STREAM_OUTPUT` - Optional. Stream model output as it arrives. Defaults to `true`.
//! - `REQUEST_TIMEOUT_SECS` - Optional. Per-request timeout. Defaults to `300`.
//! - `MODEL_MAX_RETRIES` - Optional. Retries for transient model errors. Defaults to `3`.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::engine::{ExecutorSettings, INPUT_REQUIRED_MARKER};
use crate::llm::RetryConfig;
use crate::util::parse_bool;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,

    /// Base URL of the OpenAI-compatible API
    pub base_url: String,

    pub default_model: String,

    pub system_prompt: String,

    /// Prompt token budget (0 = unlimited)
    pub max_context_tokens: usize,

    /// Use the streaming entry point
    pub stream_output: bool,

    pub request_timeout: Duration,

    pub max_retries: u32,
}

/// Built-in system prompt explaining the input marker to the model.
pub fn default_system_prompt() -> String {
    format!(
        "You are a helpful agent working on a task for a user. \
         If you cannot finish without more information, ask one concise question \
         and end your reply with {}.",
        INPUT_REQUIRED_MARKER
    )
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `MODEL_API_KEY` is not set and
    /// `ConfigError::InvalidValue` for unparseable numbers or booleans.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = lookup("MODEL_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("MODEL_API_KEY".to_string()))?;

        let base_url = lookup("MODEL_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        url::Url::parse(&base_url)
            .map_err(|e| ConfigError::InvalidValue("MODEL_BASE_URL".to_string(), e.to_string()))?;

        let default_model = lookup("DEFAULT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let system_prompt = lookup("SYSTEM_PROMPT").unwrap_or_else(default_system_prompt);

        let max_context_tokens = parse_var(&lookup, "MAX_CONTEXT_TOKENS", 0usize)?;
        let request_timeout_secs = parse_var(&lookup, "REQUEST_TIMEOUT_SECS", 300u64)?;
        let max_retries = parse_var(&lookup, "MODEL_MAX_RETRIES", 3u32)?;

        let stream_output = match lookup("STREAM_OUTPUT") {
            Some(value) => parse_bool(&value)
                .ok_or_else(|| ConfigError::InvalidValue("STREAM_OUTPUT".to_string(), value))?,
            None => true,
        };

        Ok(Self {
            api_key,
            base_url,
            default_model,
            system_prompt,
            max_context_tokens,
            stream_output,
            request_timeout: Duration::from_secs(request_timeout_secs),
            max_retries,
        })
    }

    /// Config with defaults for everything but the key and model.
    pub fn new(api_key: String, default_model: String) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model,
            system_prompt: default_system_prompt(),
            max_context_tokens: 0,
            stream_output: true,
            request_timeout: Duration::from_secs(300),
            max_retries: 3,
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            model: self.default_model.clone(),
            system_prompt: self.system_prompt.clone(),
            max_context_tokens: self.max_context_tokens,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            ..RetryConfig::default()
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}
