//! Provider abstraction.
//!
//! Every backend is reached through [`LlmProvider`]: one blocking completion
//! call, one streaming call whose event sequence always ends in exactly one
//! terminal event, a credentials precondition check and static metadata.
//! Backend failures are normalized into [`LlmError`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use deckhand_core::domain::organization::ProviderId;

pub mod anthropic;
pub mod bedrock;
pub mod factory;
pub mod scripted;
pub mod sse;
pub mod stream;

pub use anthropic::AnthropicProvider;
pub use bedrock::BedrockProvider;
pub use factory::{ConfiguredProviderFactory, ProviderFactory};
pub use scripted::ScriptedProvider;
pub use stream::{CompletionStream, StreamEvent};

pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop_sequences: Option<Vec<String>>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self { max_tokens: DEFAULT_MAX_TOKENS, temperature: DEFAULT_TEMPERATURE, stop_sequences: None }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
    StopSequence,
}

impl StopReason {
    /// Maps a backend stop reason. Anything unrecognized counts as `EndTurn`.
    pub fn from_backend(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("max_tokens") | Some("length") => Self::MaxTokens,
            Some("stop_sequence") => Self::StopSequence,
            _ => Self::EndTurn,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProviderMetadata {
    pub name: String,
    pub model: String,
    pub supports_streaming: bool,
    pub supports_system_prompt: bool,
    pub max_context_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Normalized provider failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("{provider_id} rate limited the request")]
    RateLimited { provider_id: ProviderId, retry_after_ms: Option<u64> },
    #[error("{provider_id} rejected the credentials: {message}")]
    Authentication { provider_id: ProviderId, message: String },
    #[error("{provider_id} request failed: {message}")]
    Provider { provider_id: ProviderId, message: String, code: Option<String>, retryable: bool },
}

const RATE_LIMIT_PHRASES: &[&str] =
    &["rate limit", "rate_limit", "too many requests", "throttl", "quota exceeded"];

const AUTH_PHRASES: &[&str] = &[
    "unauthorized",
    "authentication",
    "invalid api key",
    "invalid x-api-key",
    "access denied",
    "accessdenied",
    "permission",
    "security token",
    "not authorized",
    "credential",
];

impl LlmError {
    /// Builds an error from a backend message that carried no usable status,
    /// classifying it by wording.
    pub fn classify(
        provider_id: ProviderId,
        message: impl Into<String>,
        code: Option<String>,
        retryable: bool,
    ) -> Self {
        let message = message.into();
        let haystack = format!("{} {}", code.as_deref().unwrap_or_default(), message).to_lowercase();

        if RATE_LIMIT_PHRASES.iter().any(|phrase| haystack.contains(phrase)) {
            return Self::RateLimited { provider_id, retry_after_ms: None };
        }
        if AUTH_PHRASES.iter().any(|phrase| haystack.contains(phrase)) {
            return Self::Authentication { provider_id, message };
        }
        Self::Provider { provider_id, message, code, retryable }
    }

    pub fn provider_id(&self) -> ProviderId {
        match self {
            Self::RateLimited { provider_id, .. }
            | Self::Authentication { provider_id, .. }
            | Self::Provider { provider_id, .. } => *provider_id,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Authentication { .. } => false,
            Self::Provider { retryable, .. } => *retryable,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_ms: Some(ms), .. } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Authentication { .. } => "authentication",
            Self::Provider { retryable: true, .. } => "provider_transient",
            Self::Provider { retryable: false, .. } => "provider",
        }
    }
}

/// Parses a `Retry-After` header value given in seconds.
pub(crate) fn retry_after_header_ms(value: Option<&str>) -> Option<u64> {
    let seconds = value?.trim().parse::<f64>().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| (seconds * 1000.0).round() as u64)
}

/// Status-code based mapping shared by the HTTP providers.
pub(crate) fn error_for_status(
    provider_id: ProviderId,
    status: u16,
    message: String,
    code: Option<String>,
    retry_after_ms: Option<u64>,
) -> LlmError {
    match status {
        429 => LlmError::RateLimited { provider_id, retry_after_ms },
        401 | 403 => LlmError::Authentication { provider_id, message },
        408 | 500..=599 => LlmError::classify(provider_id, message, code, true),
        _ => LlmError::classify(provider_id, message, code, false),
    }
}

pub(crate) fn transport_error(provider_id: ProviderId, error: &reqwest::Error) -> LlmError {
    LlmError::Provider {
        provider_id,
        message: format!("request failed: {error}"),
        code: None,
        retryable: error.is_timeout() || error.is_connect(),
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    fn metadata(&self) -> ProviderMetadata;

    /// Credentials precondition. Never touches the network.
    fn is_available(&self) -> bool;

    async fn generate_completion(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError>;

    /// The returned stream must be drained before the next call on the same
    /// handle. Dropping it is the only way to cancel.
    async fn stream_completion(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> CompletionStream;
}
