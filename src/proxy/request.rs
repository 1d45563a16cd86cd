//! Inbound request decoding.
//!
//! The raw body is never rewritten: decoding only extracts what metering
//! needs (model, streaming flag, prompt text) and the original bytes are
//! forwarded as received.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ProxyError;
use crate::tokenizer::Tokenizer;

/// Request shape accepted by a deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// `/v1/chat/completions` with a message list
    #[default]
    Chat,
    /// Legacy `/v1/completions` with a single prompt
    Completion,
}

impl RequestKind {
    /// Endpoint path, identical on the proxy and upstream.
    pub fn path(&self) -> &'static str {
        match self {
            Self::Chat => "/v1/chat/completions",
            Self::Completion => "/v1/completions",
        }
    }

    /// Decode a raw body of this kind.
    pub fn decode(&self, body: &[u8]) -> Result<DecodedRequest, ProxyError> {
        match self {
            Self::Chat => DecodedRequest::from_body::<ChatRequest>(body),
            Self::Completion => DecodedRequest::from_body::<CompletionRequest>(body),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Completion => write!(f, "completion"),
        }
    }
}

impl FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "completion" | "completions" | "prompt" => Ok(Self::Completion),
            _ => Err(format!("Unknown request kind: {}", s)),
        }
    }
}

/// What metering needs to know about a request body.
pub trait RequestShape: DeserializeOwned {
    /// Requested model name.
    fn model(&self) -> &str;

    /// Whether the caller asked for an event stream.
    fn stream(&self) -> bool;

    /// Prompt text whose tokens are billed to the call, in request order.
    fn prompt_fragments(&self) -> Vec<&str>;
}

/// Chat-style request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// Model name
    pub model: String,
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
    /// Streaming flag
    #[serde(default)]
    pub stream: Option<bool>,
}

/// One chat message. Only the content is metered.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    /// Text or content parts; absent for tool-call-only messages
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// Message content, either plain text or a list of parts.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text
    Text(String),
    /// Multi-part content; non-text parts carry no `text`
    Parts(Vec<ContentPart>),
}

/// One part of a multi-part message.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    /// Text of a `text` part
    #[serde(default)]
    pub text: Option<String>,
}

impl RequestShape for ChatRequest {
    fn model(&self) -> &str {
        &self.model
    }

    fn stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    fn prompt_fragments(&self) -> Vec<&str> {
        let mut fragments = Vec::with_capacity(self.messages.len());
        for message in &self.messages {
            match &message.content {
                Some(MessageContent::Text(text)) => fragments.push(text.as_str()),
                Some(MessageContent::Parts(parts)) => {
                    fragments.extend(parts.iter().filter_map(|p| p.text.as_deref()));
                },
                None => {},
            }
        }
        fragments
    }
}

/// Legacy completion request body.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    /// Model name
    pub model: String,
    /// Prompt text
    pub prompt: Prompt,
    /// Text appended after the completion
    #[serde(default)]
    pub suffix: Option<String>,
    /// Streaming flag
    #[serde(default)]
    pub stream: Option<bool>,
}

/// Completion prompt, a single string or a batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    /// One prompt
    Text(String),
    /// Several prompts
    Batch(Vec<String>),
}

impl RequestShape for CompletionRequest {
    fn model(&self) -> &str {
        &self.model
    }

    fn stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    fn prompt_fragments(&self) -> Vec<&str> {
        let mut fragments: Vec<&str> = match &self.prompt {
            Prompt::Text(text) => vec![text.as_str()],
            Prompt::Batch(texts) => texts.iter().map(String::as_str).collect(),
        };
        fragments.extend(self.suffix.as_deref());
        fragments
    }
}

/// Normalized view of an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    /// Requested model name
    pub model: String,
    /// Streaming flag
    pub stream: bool,
    /// Prompt fragments to tokenize
    pub prompt: Vec<String>,
}

impl DecodedRequest {
    /// Decode `body` as shape `T`.
    pub fn from_body<T: RequestShape>(body: &[u8]) -> Result<Self, ProxyError> {
        let request: T = serde_json::from_slice(body)
            .map_err(|e| ProxyError::BadRequest(format!("failed to parse request body: {e}")))?;

        Ok(Self {
            model: request.model().to_string(),
            stream: request.stream(),
            prompt: request
                .prompt_fragments()
                .into_iter()
                .map(str::to_string)
                .collect(),
        })
    }

    /// Tokens billed for the prompt itself.
    pub fn prompt_tokens(&self, tokenizer: &dyn Tokenizer) -> u64 {
        self.prompt.iter().map(|p| tokenizer.count(p) as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CharCount;

    impl Tokenizer for CharCount {
        fn count(&self, text: &str) -> usize {
            text.chars().count()
        }
    }

    #[test]
    fn test_request_kind_parsing() {
        assert_eq!("chat".parse::<RequestKind>().unwrap(), RequestKind::Chat);
        assert_eq!(
            "Completion".parse::<RequestKind>().unwrap(),
            RequestKind::Completion
        );
        assert!("embeddings".parse::<RequestKind>().is_err());
        assert_eq!(RequestKind::Completion.to_string(), "completion");
    }

    #[test]
    fn test_decode_chat() {
        let body = br#"{"model":"gpt-x","messages":[{"role":"system","content":"be brief"},{"role":"user","content":"hi"}],"stream":true}"#;
        let decoded = RequestKind::Chat.decode(body).unwrap();

        assert_eq!(decoded.model, "gpt-x");
        assert!(decoded.stream);
        assert_eq!(decoded.prompt, vec!["be brief", "hi"]);
        assert_eq!(decoded.prompt_tokens(&CharCount), 10);
    }

    #[test]
    fn test_decode_chat_content_variants() {
        let body = br#"{
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this?"},
                    {"type": "image_url", "image_url": {"url": "https://example.com/a.png"}}
                ]},
                {"role": "assistant", "content": null, "tool_calls": []},
                {"role": "tool", "content": "42"}
            ]
        }"#;
        let decoded = RequestKind::Chat.decode(body).unwrap();

        assert!(!decoded.stream);
        assert_eq!(decoded.prompt, vec!["what is this?", "42"]);
    }

    #[test]
    fn test_decode_chat_null_stream_is_false() {
        let body = br#"{"model":"gpt-4","messages":[],"stream":null}"#;
        assert!(!RequestKind::Chat.decode(body).unwrap().stream);
    }

    #[test]
    fn test_decode_completion() {
        let body = br#"{"model":"text-davinci-003","prompt":"Once upon","suffix":"the end","stream":false}"#;
        let decoded = RequestKind::Completion.decode(body).unwrap();

        assert_eq!(decoded.model, "text-davinci-003");
        assert_eq!(decoded.prompt, vec!["Once upon", "the end"]);

        let batch = br#"{"model":"davinci","prompt":["a","b"]}"#;
        let decoded = RequestKind::Completion.decode(batch).unwrap();
        assert_eq!(decoded.prompt, vec!["a", "b"]);
    }

    #[test]
    fn test_decode_rejects_malformed_and_mismatched_bodies() {
        let not_json = RequestKind::Chat.decode(b"{not json");
        assert!(matches!(not_json, Err(ProxyError::BadRequest(_))));

        let no_model = RequestKind::Chat.decode(br#"{"messages":[]}"#);
        assert!(matches!(no_model, Err(ProxyError::BadRequest(_))));

        // A chat body sent to a completion deployment has no prompt
        let wrong_shape =
            RequestKind::Completion.decode(br#"{"model":"gpt-4","messages":[]}"#);
        assert!(matches!(wrong_shape, Err(ProxyError::BadRequest(_))));
    }
}
