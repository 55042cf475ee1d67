//! Direct Messages API backend.

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use deckhand_core::config::AnthropicConfig;
use deckhand_core::domain::organization::ProviderId;

use super::sse::messages_sse_events;
use super::stream::{error_for_type, RawError};
use super::{
    error_for_status, retry_after_header_ms, transport_error, ChatMessage, Completion,
    CompletionOptions, CompletionStream, LlmError, LlmProvider, ProviderMetadata, StopReason, Usage,
};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
pub(crate) struct MessagesRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) anthropic_version: Option<&'static str>,
    #[serde(skip_serializing_if = "is_blank")]
    pub(crate) system: &'a str,
    pub(crate) messages: &'a [ChatMessage],
    pub(crate) max_tokens: u32,
    pub(crate) temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) stop_sequences: Option<&'a [String]>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub(crate) stream: bool,
}

fn is_blank(value: &&str) -> bool {
    value.trim().is_empty()
}

impl<'a> MessagesRequest<'a> {
    pub(crate) fn new(
        system: &'a str,
        messages: &'a [ChatMessage],
        options: &'a CompletionOptions,
    ) -> Self {
        Self {
            model: None,
            anthropic_version: None,
            system,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stop_sequences: options.stop_sequences.as_deref(),
            stream: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

impl MessagesResponse {
    pub(crate) fn into_completion(self) -> Completion {
        let content = self
            .content
            .into_iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text)
            .collect::<String>();
        Completion {
            content,
            usage: self.usage,
            stop_reason: StopReason::from_backend(self.stop_reason.as_deref()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: RawError,
}

pub struct AnthropicProvider {
    config: AnthropicConfig,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    async fn send(&self, request: &MessagesRequest<'_>) -> Result<reqwest::Response, LlmError> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .map(|key| key.expose_secret().trim())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| LlmError::Authentication {
                provider_id: ProviderId::Anthropic,
                message: "no API key is configured".to_string(),
            })?;

        debug!(
            event_name = "llm.request.sent",
            provider = %ProviderId::Anthropic,
            model = %self.config.model,
            stream = request.stream,
            "sending messages request"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|error| transport_error(ProviderId::Anthropic, &error))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after_ms = retry_after_header_ms(
            response.headers().get(RETRY_AFTER).and_then(|value| value.to_str().ok()),
        );
        let body = response.text().await.unwrap_or_default();
        let error = error_from_body(status.as_u16(), &body, retry_after_ms);
        warn!(
            event_name = "llm.request.failed",
            provider = %ProviderId::Anthropic,
            status = status.as_u16(),
            error_class = error.error_class(),
            "messages request failed"
        );
        Err(error)
    }
}

fn error_from_body(status: u16, body: &str, retry_after_ms: Option<u64>) -> LlmError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) if !matches!(status, 401 | 403 | 429) && envelope.error.error_type.is_some() => {
            let error_type = envelope.error.error_type;
            let mapped =
                error_for_type(ProviderId::Anthropic, error_type.as_deref(), envelope.error.message);
            match mapped {
                // The body type wins, but a 5xx stays retryable.
                LlmError::Provider { provider_id, message, code, retryable } => LlmError::Provider {
                    provider_id,
                    message,
                    code,
                    retryable: retryable || status >= 500,
                },
                other => other,
            }
        }
        Ok(envelope) => error_for_status(
            ProviderId::Anthropic,
            status,
            envelope.error.message,
            envelope.error.error_type,
            retry_after_ms,
        ),
        Err(_) => {
            let message = if body.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                body.chars().take(512).collect()
            };
            error_for_status(ProviderId::Anthropic, status, message, None, retry_after_ms)
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: "Anthropic".to_string(),
            model: self.config.model.clone(),
            supports_streaming: true,
            supports_system_prompt: true,
            max_context_tokens: self.config.max_context_tokens,
            region: None,
        }
    }

    fn is_available(&self) -> bool {
        self.config.has_credentials()
    }

    async fn generate_completion(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let mut request = MessagesRequest::new(system_prompt, messages, options);
        request.model = Some(&self.config.model);

        let response = self.send(&request).await?;
        let parsed: MessagesResponse = response.json().await.map_err(|error| LlmError::Provider {
            provider_id: ProviderId::Anthropic,
            message: format!("unreadable messages response: {error}"),
            code: None,
            retryable: false,
        })?;
        Ok(parsed.into_completion())
    }

    async fn stream_completion(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> CompletionStream {
        let mut request = MessagesRequest::new(system_prompt, messages, options);
        request.model = Some(&self.config.model);
        request.stream = true;

        match self.send(&request).await {
            Ok(response) => CompletionStream::new(
                ProviderId::Anthropic,
                messages_sse_events(ProviderId::Anthropic, response.bytes_stream()),
            ),
            Err(error) => CompletionStream::failed(error),
        }
    }
}
