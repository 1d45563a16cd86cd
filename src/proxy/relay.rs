//! Response relay.
//!
//! Copies the upstream response to the client and derives the call's token
//! count from the same bytes:
//!
//! - **non-200**: status, headers and body are copied through; nothing is
//!   tokenized or recorded.
//! - **200, plain**: the body is buffered, `usage.total_tokens` is read from
//!   it (0 when upstream reports no usage), and the original bytes are sent.
//! - **200, event stream**: every upstream line is handed to the client
//!   before the next one is read. `data:` payloads are reassembled into
//!   messages and each delta is tokenized on top of the prompt's own count
//!   until the `[DONE]` sentinel.
//!
//! Once the upstream status has been sent it cannot change, so a failure in
//! the middle of a stream aborts the client body instead of producing an
//! error response.

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;

use super::upstream::client_headers;
use super::{DecodedRequest, ProxyError};
use crate::store::{ModelId, ProjectId, SqliteStore};
use crate::tokenizer::Tokenizer;

/// Payload of the message that ends an event stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

type BodyChunk = Result<Bytes, io::Error>;

/// Delivery side of a call.
///
/// The head (status and headers) goes out exactly once through a oneshot;
/// streamed bodies follow through a channel with room for a single chunk so
/// nothing queues up between upstream and the client. A dropped receiver
/// means the client went away; writes then become no-ops and the caller
/// keeps metering.
pub(crate) struct ClientSink {
    head: Option<oneshot::Sender<Response>>,
    body: Option<mpsc::Sender<BodyChunk>>,
    connected: bool,
}

impl ClientSink {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let sink = Self {
            head: Some(tx),
            body: None,
            connected: true,
        };
        (sink, rx)
    }

    /// Send a complete response. Ignored once a head has been sent.
    pub(crate) fn respond(&mut self, response: Response) {
        if let Some(head) = self.head.take() {
            if head.send(response).is_err() {
                self.disconnected();
            }
        }
    }

    /// Send `status` and `headers` and open a streamed body.
    pub(crate) fn start(&mut self, status: StatusCode, headers: HeaderMap) {
        let (tx, rx) = mpsc::channel::<BodyChunk>(1);
        let body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        }));

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        self.body = Some(tx);
        self.respond(response);
    }

    /// Hand one chunk to the client. Returns `false` once the client is gone.
    pub(crate) async fn write(&mut self, chunk: Bytes) -> bool {
        if !self.connected {
            return false;
        }
        let Some(body) = &self.body else {
            return false;
        };
        if body.send(Ok(chunk)).await.is_err() {
            self.disconnected();
        }
        self.connected
    }

    /// End the call with `err`: an error response if nothing was sent yet,
    /// otherwise an aborted body.
    pub(crate) async fn fail(&mut self, err: ProxyError) {
        if self.head.is_some() {
            self.respond(err.into_response());
            return;
        }
        if let Some(body) = self.body.take() {
            if self.connected {
                let _ = body.send(Err(io::Error::other(err.to_string()))).await;
            }
        }
    }

    fn disconnected(&mut self) {
        if self.connected {
            tracing::warn!("Client disconnected, continuing to meter upstream response");
        }
        self.connected = false;
    }
}

/// Records the final token count of a call.
#[derive(Debug, Clone)]
pub(crate) struct Meter {
    store: SqliteStore,
    model_id: ModelId,
    project_id: ProjectId,
}

impl Meter {
    pub(crate) fn new(store: SqliteStore, model_id: ModelId, project_id: ProjectId) -> Self {
        Self {
            store,
            model_id,
            project_id,
        }
    }

    /// Best effort: a failed write is logged, the client never sees it.
    async fn commit(&self, tokens: u64) {
        match self
            .store
            .record_usage(self.model_id, self.project_id, tokens)
            .await
        {
            Ok(()) => tracing::info!(tokens, "Usage recorded"),
            Err(e) => tracing::error!(tokens, "Failed to save usage: {}", e),
        }
    }
}

/// Relay `response` to the client, recording usage on success.
///
/// On `Err` the caller reports the failure through the sink.
pub(crate) async fn relay(
    response: reqwest::Response,
    request: &DecodedRequest,
    tokenizer: Arc<dyn Tokenizer>,
    sink: &mut ClientSink,
    meter: &Meter,
) -> Result<(), ProxyError> {
    let status = response.status();
    let headers = client_headers(response.headers());

    if status != StatusCode::OK {
        sink.start(status, headers);
        copy_body(response, sink).await?;
        tracing::info!(%status, "Error response relayed");
        return Ok(());
    }

    if request.stream {
        // Prompt tokens are known before the first delta arrives
        let prompt_tokens = request.prompt_tokens(tokenizer.as_ref());
        tracing::info!(prompt_tokens, "Tokenized prompt");

        sink.start(status, headers);
        let tokens = relay_event_stream(response, tokenizer.as_ref(), prompt_tokens, sink).await?;
        tracing::info!(tokens, "SSE response read");
        meter.commit(tokens).await;
    } else {
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Gateway(format!("failed to read response: {e}")))?;
        let tokens = total_tokens(&body)?;
        tracing::info!(tokens, "200 response read");
        meter.commit(tokens).await;

        let mut reply = Response::new(Body::from(body));
        *reply.status_mut() = status;
        *reply.headers_mut() = headers;
        sink.respond(reply);
    }

    Ok(())
}

async fn copy_body(response: reqwest::Response, sink: &mut ClientSink) -> Result<(), ProxyError> {
    let mut body = Box::pin(response.bytes_stream());
    while let Some(chunk) = body.next().await {
        let chunk =
            chunk.map_err(|e| ProxyError::Gateway(format!("failed to read response: {e}")))?;
        if !sink.write(chunk).await {
            break;
        }
    }
    Ok(())
}

async fn relay_event_stream(
    response: reqwest::Response,
    tokenizer: &dyn Tokenizer,
    prompt_tokens: u64,
    sink: &mut ClientSink,
) -> Result<u64, ProxyError> {
    let body = Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other)));
    let mut reader = StreamReader::new(body);
    let mut accumulator = SseAccumulator::default();
    let mut tokens = prompt_tokens;
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| ProxyError::Gateway(format!("failed to read response: {e}")))?;
        if read == 0 {
            return Err(ProxyError::Gateway(format!(
                "upstream closed the stream before {DONE_SENTINEL}"
            )));
        }

        sink.write(Bytes::copy_from_slice(&line)).await;

        let text = std::str::from_utf8(&line)
            .map_err(|e| ProxyError::Gateway(format!("invalid UTF-8 in event stream: {e}")))?;
        match accumulator.push_line(text) {
            Some(SseMessage::Done) => return Ok(tokens),
            Some(SseMessage::Data(payload)) => tokens += delta_tokens(&payload, tokenizer)?,
            None => {},
        }
    }
}

/// A complete event-stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseMessage {
    /// The end-of-stream sentinel
    Done,
    /// Concatenated `data:` payload
    Data(String),
}

/// Reassembles event-stream lines into messages.
///
/// ```
/// use gpt_meter::proxy::{SseAccumulator, SseMessage};
///
/// let mut acc = SseAccumulator::default();
/// assert_eq!(acc.push_line("data: {\"a\":1}\n"), None);
/// assert_eq!(acc.push_line("\n"), Some(SseMessage::Data("{\"a\":1}".into())));
/// assert_eq!(acc.push_line("data: [DONE]\n"), None);
/// assert_eq!(acc.push_line("\n"), Some(SseMessage::Done));
/// ```
#[derive(Debug, Default)]
pub struct SseAccumulator {
    message: String,
}

impl SseAccumulator {
    /// Feed one line (with or without its line ending).
    ///
    /// Returns a message when `line` terminates one. Messages without any
    /// `data:` payload (keep-alive comments) are skipped.
    pub fn push_line(&mut self, line: &str) -> Option<SseMessage> {
        let line = line.trim_end_matches(['\n', '\r']);

        if line.is_empty() {
            let message = std::mem::take(&mut self.message);
            return match message.as_str() {
                "" => None,
                DONE_SENTINEL => Some(SseMessage::Done),
                _ => Some(SseMessage::Data(message)),
            };
        }

        if let Some(payload) = line.strip_prefix(DATA_PREFIX) {
            self.message.push_str(payload.trim());
        }
        None
    }
}

#[derive(Deserialize)]
struct PlainBody {
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    total_tokens: u64,
}

fn total_tokens(body: &[u8]) -> Result<u64, ProxyError> {
    serde_json::from_slice::<PlainBody>(body)
        .map(|b| b.usage.total_tokens)
        .map_err(|e| ProxyError::Gateway(format!("failed to parse response: {e}")))
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
    // Legacy completions stream `text` instead of a delta
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

impl StreamChoice {
    fn content(&self) -> &str {
        self.delta
            .as_ref()
            .and_then(|d| d.content.as_deref())
            .or(self.text.as_deref())
            .unwrap_or_default()
    }
}

fn delta_tokens(payload: &str, tokenizer: &dyn Tokenizer) -> Result<u64, ProxyError> {
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| ProxyError::Gateway(format!("failed to unmarshal response: {e}")))?;

    match chunk.choices.as_slice() {
        [choice] => Ok(tokenizer.count(choice.content()) as u64),
        choices => Err(ProxyError::Gateway(format!(
            "{} choices in response, expected exactly 1",
            choices.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WordCount;

    impl Tokenizer for WordCount {
        fn count(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    #[test]
    fn test_accumulator_joins_multiline_data() {
        let mut acc = SseAccumulator::default();
        assert_eq!(acc.push_line("event: completion\n"), None);
        assert_eq!(acc.push_line("data: {\"choices\":\n"), None);
        assert_eq!(acc.push_line("data:[]}\r\n"), None);
        assert_eq!(
            acc.push_line("\r\n"),
            Some(SseMessage::Data("{\"choices\":[]}".to_string()))
        );
    }

    #[test]
    fn test_accumulator_skips_keepalives() {
        let mut acc = SseAccumulator::default();
        assert_eq!(acc.push_line(": keep-alive\n"), None);
        assert_eq!(acc.push_line("\n"), None);
        assert_eq!(acc.push_line("\n"), None);
        assert_eq!(acc.push_line("data:  [DONE]  \n"), None);
        assert_eq!(acc.push_line("\n"), Some(SseMessage::Done));
    }

    #[test]
    fn test_total_tokens() {
        let body = br#"{"id":"x","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#;
        assert_eq!(total_tokens(body).unwrap(), 7);

        assert!(matches!(total_tokens(b"<html>"), Err(ProxyError::Gateway(_))));
        assert!(matches!(total_tokens(b"[1,2]"), Err(ProxyError::Gateway(_))));
    }

    #[test]
    fn test_total_tokens_missing_usage_is_zero() {
        assert_eq!(total_tokens(b"{}").unwrap(), 0);
        assert_eq!(total_tokens(br#"{"id":"x","choices":[]}"#).unwrap(), 0);
        assert_eq!(total_tokens(br#"{"usage":{"prompt_tokens":2}}"#).unwrap(), 0);

        let wrong_type = br#"{"usage":{"total_tokens":"seven"}}"#;
        assert!(matches!(total_tokens(wrong_type), Err(ProxyError::Gateway(_))));
    }

    #[test]
    fn test_delta_tokens() {
        let chat = r#"{"choices":[{"index":0,"delta":{"content":"hello there world"}}]}"#;
        assert_eq!(delta_tokens(chat, &WordCount).unwrap(), 3);

        let role_only = r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(delta_tokens(role_only, &WordCount).unwrap(), 0);

        let legacy = r#"{"choices":[{"index":0,"text":"once upon"}]}"#;
        assert_eq!(delta_tokens(legacy, &WordCount).unwrap(), 2);
    }

    #[test]
    fn test_delta_tokens_requires_exactly_one_choice() {
        let none = r#"{"choices":[]}"#;
        assert!(matches!(delta_tokens(none, &WordCount), Err(ProxyError::Gateway(_))));

        let two = r#"{"choices":[{"delta":{"content":"a"}},{"delta":{"content":"b"}}]}"#;
        assert!(matches!(delta_tokens(two, &WordCount), Err(ProxyError::Gateway(_))));

        assert!(matches!(delta_tokens("not json", &WordCount), Err(ProxyError::Gateway(_))));
    }

    #[tokio::test]
    async fn test_sink_sends_head_once() {
        let (mut sink, rx) = ClientSink::new();
        sink.start(StatusCode::ACCEPTED, HeaderMap::new());
        sink.respond(ProxyError::Unauthorized.into_response());

        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_sink_fail_before_head_sends_error_response() {
        let (mut sink, rx) = ClientSink::new();
        sink.fail(ProxyError::Gateway("boom".into())).await;

        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_sink_write_after_client_gone() {
        let (mut sink, rx) = ClientSink::new();
        sink.start(StatusCode::OK, HeaderMap::new());
        drop(rx.await.unwrap());

        assert!(!sink.write(Bytes::from_static(b"data: x\n")).await);
        assert!(!sink.write(Bytes::from_static(b"\n")).await);
    }
}
