//! Line buffering for `text/event-stream` response bodies.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use deckhand_core::domain::organization::ProviderId;

use super::stream::{MessagesEventDecoder, StreamEvent};
use super::transport_error;

/// Accumulates raw body chunks and yields complete `data:` payloads.
///
/// Network chunks do not line up with event boundaries: one chunk may hold
/// several events and a payload may be split across chunks, including in the
/// middle of a multi-byte character. Bytes are buffered until a newline.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Drains a trailing line that arrived without a newline.
    pub fn flush(&mut self) -> Vec<String> {
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line).into_iter().collect()
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\n', '\r']);
    // `event:`, `id:`, `retry:` and `:` comments carry nothing the Messages
    // payload does not already repeat.
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    (!data.trim().is_empty() && data.trim() != "[DONE]").then(|| data.to_string())
}

/// Turns a Messages-API SSE body into stream events.
pub(crate) fn messages_sse_events<S>(
    provider_id: ProviderId,
    body: S,
) -> impl Stream<Item = StreamEvent> + Send + 'static
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut lines = SseLineBuffer::new();
        let mut decoder = MessagesEventDecoder::new(provider_id);

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for payload in lines.feed(&bytes) {
                        if let Some(event) = decoder.decode(&payload) {
                            let terminal = event.is_terminal();
                            yield event;
                            if terminal {
                                return;
                            }
                        }
                    }
                }
                Err(error) => {
                    yield StreamEvent::Error { error: transport_error(provider_id, &error) };
                    return;
                }
            }
        }

        for payload in lines.flush() {
            if let Some(event) = decoder.decode(&payload) {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }
        }
    }
}
