//! Deterministic provider that replays queued responses. Used by tests and
//! by local runs without backend credentials.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::Mutex;

use deckhand_core::domain::organization::ProviderId;

use super::{
    ChatMessage, Completion, CompletionOptions, CompletionStream, LlmError, LlmProvider,
    ProviderMetadata, StopReason, StreamEvent, Usage,
};

const STREAM_CHUNK_CHARS: usize = 24;

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub options: CompletionOptions,
}

pub struct ScriptedProvider {
    id: ProviderId,
    max_context_tokens: u32,
    available: AtomicBool,
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            max_context_tokens: 200_000,
            available: AtomicBool::new(true),
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_context_tokens(mut self, max_context_tokens: u32) -> Self {
        self.max_context_tokens = max_context_tokens;
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn push_response(&self, content: impl Into<String>) {
        self.responses.lock().await.push_back(Ok(content.into()));
    }

    pub async fn push_error(&self, error: LlmError) {
        self.responses.lock().await.push_back(Err(error));
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.responses.lock().await.len()
    }

    async fn next_response(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        self.calls.lock().await.push(RecordedCall {
            system_prompt: system_prompt.to_string(),
            messages: messages.to_vec(),
            options: options.clone(),
        });

        let next = self.responses.lock().await.pop_front().unwrap_or_else(|| {
            Err(LlmError::Provider {
                provider_id: self.id,
                message: "no scripted response left".to_string(),
                code: None,
                retryable: false,
            })
        })?;

        let prompt_chars = system_prompt.len() + messages.iter().map(|m| m.content.len()).sum::<usize>();
        Ok(Completion {
            usage: Usage {
                input_tokens: u32::try_from(prompt_chars.div_ceil(4)).unwrap_or(u32::MAX),
                output_tokens: u32::try_from(next.len().div_ceil(4)).unwrap_or(u32::MAX),
            },
            content: next,
            stop_reason: StopReason::EndTurn,
        })
    }
}

fn chunk_chars(content: &str) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    chars.chunks(STREAM_CHUNK_CHARS).map(|chunk| chunk.iter().collect()).collect()
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: format!("scripted {}", self.id),
            model: "scripted".to_string(),
            supports_streaming: true,
            supports_system_prompt: true,
            max_context_tokens: self.max_context_tokens,
            region: None,
        }
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn generate_completion(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        self.next_response(system_prompt, messages, options).await
    }

    async fn stream_completion(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> CompletionStream {
        match self.next_response(system_prompt, messages, options).await {
            Ok(completion) => {
                let mut events: Vec<StreamEvent> = vec![StreamEvent::MessageStart];
                events.extend(
                    chunk_chars(&completion.content)
                        .into_iter()
                        .map(|content| StreamEvent::ContentDelta { content }),
                );
                events.push(StreamEvent::MessageStop {
                    usage: completion.usage,
                    stop_reason: completion.stop_reason,
                });
                CompletionStream::new(self.id, stream::iter(events))
            }
            Err(error) => CompletionStream::failed(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use deckhand_core::domain::organization::ProviderId;

    use super::ScriptedProvider;
    use crate::llm::{ChatMessage, CompletionOptions, LlmError, LlmProvider, StreamEvent};

    #[tokio::test]
    async fn replays_queue_in_order_and_records_calls() {
        let provider = ScriptedProvider::new(ProviderId::Anthropic);
        provider.push_response("first").await;
        provider
            .push_error(LlmError::RateLimited { provider_id: ProviderId::Anthropic, retry_after_ms: None })
            .await;

        let options = CompletionOptions::default();
        let first = provider
            .generate_completion("sys", &[ChatMessage::user("one")], &options)
            .await
            .expect("first");
        assert_eq!(first.content, "first");

        let second = provider.generate_completion("sys", &[ChatMessage::user("two")], &options).await;
        assert!(matches!(second, Err(LlmError::RateLimited { .. })));

        let exhausted = provider.generate_completion("sys", &[], &options).await;
        assert!(matches!(exhausted, Err(LlmError::Provider { retryable: false, .. })));

        let calls = provider.calls().await;
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].messages[0].content, "two");
    }

    #[tokio::test]
    async fn streams_content_in_chunks() {
        let provider = ScriptedProvider::new(ProviderId::Bedrock);
        let content = "ünïcode ".repeat(10);
        provider.push_response(content.clone()).await;

        let events: Vec<_> = provider
            .stream_completion("", &[ChatMessage::user("go")], &CompletionOptions::default())
            .await
            .collect()
            .await;

        assert_eq!(events.first(), Some(&StreamEvent::MessageStart));
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop { .. })));
        let streamed: String = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ContentDelta { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, content);
        assert!(events.len() > 3);
    }
}
