//! Streaming completion contract.
//!
//! [`CompletionStream`] wraps whatever a backend produces and enforces the
//! event grammar: one `MessageStart`, any number of `ContentDelta`, then one
//! terminal `MessageStop` or `Error`. Nothing is yielded after the terminal
//! event, and a backend stream that ends early is closed with an `Error`.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use deckhand_core::domain::organization::ProviderId;

use super::{Completion, LlmError, StopReason, Usage};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    MessageStart,
    ContentDelta { content: String },
    MessageStop { usage: Usage, stop_reason: StopReason },
    Error { error: LlmError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MessageStop { .. } | Self::Error { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Streaming,
    Finished,
}

pub struct CompletionStream {
    provider_id: ProviderId,
    inner: Pin<Box<dyn Stream<Item = StreamEvent> + Send>>,
    phase: Phase,
}

impl CompletionStream {
    pub fn new<S>(provider_id: ProviderId, events: S) -> Self
    where
        S: Stream<Item = StreamEvent> + Send + 'static,
    {
        Self { provider_id, inner: Box::pin(events), phase: Phase::NotStarted }
    }

    /// A stream that fails before producing any content.
    pub fn failed(error: LlmError) -> Self {
        let provider_id = error.provider_id();
        Self::new(provider_id, stream::iter([StreamEvent::Error { error }]))
    }

    pub fn provider_id(&self) -> ProviderId {
        self.provider_id
    }

    /// Drains the stream into a single completion.
    pub async fn collect_completion(mut self) -> Result<Completion, LlmError> {
        let mut content = String::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::MessageStart => {}
                StreamEvent::ContentDelta { content: delta } => content.push_str(&delta),
                StreamEvent::MessageStop { usage, stop_reason } => {
                    return Ok(Completion { content, usage, stop_reason });
                }
                StreamEvent::Error { error } => return Err(error),
            }
        }
        Err(truncated(self.provider_id))
    }
}

fn truncated(provider_id: ProviderId) -> LlmError {
    LlmError::Provider {
        provider_id,
        message: "stream ended before message_stop".to_string(),
        code: None,
        retryable: true,
    }
}

impl Stream for CompletionStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.phase {
            Phase::Finished => return Poll::Ready(None),
            Phase::NotStarted => {
                self.phase = Phase::Streaming;
                return Poll::Ready(Some(StreamEvent::MessageStart));
            }
            Phase::Streaming => {}
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(StreamEvent::MessageStart)) => continue,
                Poll::Ready(Some(StreamEvent::ContentDelta { content })) if content.is_empty() => {
                    continue
                }
                Poll::Ready(Some(event)) => {
                    if event.is_terminal() {
                        self.phase = Phase::Finished;
                    }
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(None) => {
                    self.phase = Phase::Finished;
                    let provider_id = self.provider_id;
                    return Poll::Ready(Some(StreamEvent::Error { error: truncated(provider_id) }));
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    delta: Option<RawDelta>,
    #[serde(default)]
    usage: Option<RawUsage>,
    #[serde(default)]
    error: Option<RawError>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
struct RawDelta {
    #[serde(rename = "type", default)]
    delta_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawError {
    #[serde(rename = "type", default)]
    pub(crate) error_type: Option<String>,
    #[serde(default)]
    pub(crate) message: String,
}

/// Decodes Messages-API stream events. Both the direct API (SSE `data:`
/// payloads) and the cloud runtime (event-stream `chunk` payloads) carry
/// this format.
#[derive(Debug)]
pub(crate) struct MessagesEventDecoder {
    provider_id: ProviderId,
    usage: Usage,
    stop_reason: Option<String>,
}

impl MessagesEventDecoder {
    pub(crate) fn new(provider_id: ProviderId) -> Self {
        Self { provider_id, usage: Usage::default(), stop_reason: None }
    }

    pub(crate) fn decode(&mut self, payload: &str) -> Option<StreamEvent> {
        let raw: RawEvent = match serde_json::from_str(payload) {
            Ok(raw) => raw,
            Err(error) => {
                return Some(StreamEvent::Error {
                    error: LlmError::Provider {
                        provider_id: self.provider_id,
                        message: format!("malformed stream event: {error}"),
                        code: None,
                        retryable: false,
                    },
                });
            }
        };

        match raw.event_type.as_str() {
            "message_start" => {
                if let Some(usage) = raw.message.and_then(|message| message.usage) {
                    self.usage.input_tokens = usage.input_tokens.unwrap_or_default();
                    self.usage.output_tokens = usage.output_tokens.unwrap_or_default();
                }
                Some(StreamEvent::MessageStart)
            }
            "content_block_delta" => {
                let delta = raw.delta?;
                if delta.delta_type.as_deref().unwrap_or("text_delta") != "text_delta" {
                    return None;
                }
                delta.text.map(|content| StreamEvent::ContentDelta { content })
            }
            "message_delta" => {
                if let Some(stop_reason) = raw.delta.and_then(|delta| delta.stop_reason) {
                    self.stop_reason = Some(stop_reason);
                }
                if let Some(output_tokens) = raw.usage.and_then(|usage| usage.output_tokens) {
                    self.usage.output_tokens = output_tokens;
                }
                None
            }
            "message_stop" => Some(StreamEvent::MessageStop {
                usage: self.usage,
                stop_reason: StopReason::from_backend(self.stop_reason.as_deref()),
            }),
            "error" => {
                let error = raw.error.unwrap_or(RawError {
                    error_type: None,
                    message: "stream reported an error".to_string(),
                });
                Some(StreamEvent::Error {
                    error: error_for_type(self.provider_id, error.error_type.as_deref(), error.message),
                })
            }
            _ => None,
        }
    }
}

/// Maps a Messages-API error `type`.
pub(crate) fn error_for_type(
    provider_id: ProviderId,
    error_type: Option<&str>,
    message: String,
) -> LlmError {
    match error_type {
        Some("rate_limit_error") => LlmError::RateLimited { provider_id, retry_after_ms: None },
        Some("authentication_error") | Some("permission_error") => {
            LlmError::Authentication { provider_id, message }
        }
        Some(code @ ("overloaded_error" | "api_error" | "timeout_error")) => {
            LlmError::classify(provider_id, message, Some(code.to_string()), true)
        }
        other => LlmError::classify(provider_id, message, other.map(str::to_string), false),
    }
}
