//! Provider clients: one implementation per backend, all emitting the shared
//! [`StreamEvent`] protocol.
//!
//! Each backend module has three parts:
//! - a request builder rendering conversation history into the native schema
//! - a pure frame translator (native SSE / NDJSON frame → events)
//! - the HTTP transport, shared here via [`sse_event_stream`] and
//!   [`ndjson_event_stream`]

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod responses;
pub mod scripted;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::conversation::{Conversation, Message};
use crate::event::StreamEvent;
use crate::{RelayError, Result};

pub use anthropic::AnthropicClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiChatClient;
pub use responses::OpenAiResponsesClient;
pub use scripted::{ScriptedProvider, ScriptedTurn};

/// Lazy sequence of normalized events for one provider call
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Tool description exposed to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }

    /// Token budget used by backends that only accept budgets
    pub fn budget_tokens(&self) -> u32 {
        match self {
            ReasoningEffort::Low => 2_048,
            ReasoningEffort::Medium => 8_192,
            ReasoningEffort::High => 24_576,
        }
    }
}

/// Extended reasoning request: either a qualitative effort or a token budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reasoning {
    Effort(ReasoningEffort),
    BudgetTokens(u32),
}

impl Reasoning {
    pub fn budget_tokens(&self) -> u32 {
        match self {
            Reasoning::Effort(e) => e.budget_tokens(),
            Reasoning::BudgetTokens(b) => *b,
        }
    }

    pub fn effort(&self) -> ReasoningEffort {
        match self {
            Reasoning::Effort(e) => *e,
            Reasoning::BudgetTokens(b) if *b <= 4_096 => ReasoningEffort::Low,
            Reasoning::BudgetTokens(b) if *b <= 16_384 => ReasoningEffort::Medium,
            Reasoning::BudgetTokens(_) => ReasoningEffort::High,
        }
    }
}

/// Per-call request options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            system: String::new(),
            tools: Vec::new(),
            max_tokens: 8_192,
            reasoning: None,
        }
    }
}

/// Conversation snapshot handed to a provider for one call
#[derive(Debug, Clone)]
pub struct ConversationRequest {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

/// Contract shared by every backend
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Backend name, e.g. "anthropic"
    fn name(&self) -> &str;

    /// Whether the backend is configured well enough to be called
    fn is_available(&self) -> bool;

    /// Start one streaming call. Connection-level failures are returned
    /// directly; failures while streaming surface as stream items.
    async fn stream_message(
        &self,
        request: &ConversationRequest,
        options: &RequestOptions,
    ) -> Result<EventStream>;
}

/// Synchronous native-frame → event translation, one frame at a time
pub trait FrameTranslator: Send {
    /// Translate one frame. `event` is the SSE event name (empty for NDJSON
    /// or unnamed SSE frames).
    fn translate(&mut self, event: &str, data: &str) -> Result<Vec<StreamEvent>>;

    /// True once the terminal event has been produced
    fn finished(&self) -> bool;

    /// Called when the transport closes before `finished()`
    fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        Err(RelayError::ProviderProtocol(
            "stream closed before response completed".into(),
        ))
    }
}

pub(crate) fn http_client(request_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(request_timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub(crate) fn map_send_error(provider: &str, e: reqwest::Error) -> RelayError {
    RelayError::ProviderUnavailable(format!("{provider} request failed: {e}"))
}

/// Map non-success HTTP statuses onto the provider error taxonomy
pub(crate) async fn check_status(
    provider: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let msg = format!("{provider} error: status={} body={}", status, body);
    Err(match status.as_u16() {
        429 => RelayError::ProviderRateLimited(msg),
        401 | 403 | 404 | 408 | 500..=599 => RelayError::ProviderUnavailable(msg),
        _ => RelayError::Provider(msg),
    })
}

/// Drive an SSE response through a translator
pub(crate) fn sse_event_stream<T>(
    provider: &'static str,
    response: reqwest::Response,
    idle_timeout: Duration,
    mut translator: T,
) -> EventStream
where
    T: FrameTranslator + 'static,
{
    let stream = async_stream::try_stream! {
        let mut frames = response.bytes_stream().eventsource();
        loop {
            let next = tokio::time::timeout(idle_timeout, frames.next())
                .await
                .map_err(|_| RelayError::ProviderUnavailable(format!(
                    "{provider} idle timeout waiting for SSE"
                )))?;
            let frame = match next {
                None => break,
                Some(frame) => frame.map_err(|e| {
                    RelayError::ProviderProtocol(format!("{provider} SSE error: {e}"))
                })?,
            };
            trace!(target: "provider", provider, event = %frame.event, data = %frame.data, "SSE frame");
            for event in translator.translate(&frame.event, &frame.data)? {
                yield event;
            }
            if translator.finished() {
                break;
            }
        }
        if !translator.finished() {
            debug!(target: "provider", provider, "SSE stream closed early");
            for event in translator.finish()? {
                yield event;
            }
        }
    };
    boxed_stream(stream)
}

/// Drive a newline-delimited JSON response through a translator
pub(crate) fn ndjson_event_stream<T>(
    provider: &'static str,
    response: reqwest::Response,
    idle_timeout: Duration,
    mut translator: T,
) -> EventStream
where
    T: FrameTranslator + 'static,
{
    let stream = async_stream::try_stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        'outer: loop {
            let next = tokio::time::timeout(idle_timeout, bytes.next())
                .await
                .map_err(|_| RelayError::ProviderUnavailable(format!(
                    "{provider} idle timeout waiting for NDJSON"
                )))?;
            let chunk = match next {
                None => break,
                Some(chunk) => chunk.map_err(|e| {
                    RelayError::ProviderUnavailable(format!("{provider} read error: {e}"))
                })?,
            };
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                for event in translator.translate("", line)? {
                    yield event;
                }
                if translator.finished() {
                    break 'outer;
                }
            }
        }
        if !translator.finished() {
            let rest = String::from_utf8_lossy(&buffer).trim().to_string();
            if !rest.is_empty() {
                for event in translator.translate("", &rest)? {
                    yield event;
                }
            }
        }
        if !translator.finished() {
            for event in translator.finish()? {
                yield event;
            }
        }
    };
    boxed_stream(stream)
}

/// Box a stream, pinning its item type to the crate result
pub(crate) fn boxed_stream<S>(stream: S) -> EventStream
where
    S: Stream<Item = Result<StreamEvent>> + Send + 'static,
{
    Box::pin(stream)
}

/// Parse a frame payload, mapping failures to protocol errors
pub(crate) fn parse_frame<T: serde::de::DeserializeOwned>(
    provider: &str,
    data: &str,
) -> Result<T> {
    serde_json::from_str(data).map_err(|e| {
        RelayError::ProviderProtocol(format!("{provider} frame parsing error: {e}, data: {data}"))
    })
}

/// Move every key of `value` not listed in `known` into a metadata map
pub(crate) fn unknown_fields(value: &Value, known: &[&str]) -> crate::event::Metadata {
    let mut extras = crate::event::Metadata::new();
    if let Value::Object(map) = value {
        for (k, v) in map {
            if !known.contains(&k.as_str()) && !v.is_null() {
                extras.insert(k.clone(), v.clone());
            }
        }
    }
    extras
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn budget_maps_to_effort() {
        assert_eq!(Reasoning::BudgetTokens(1024).effort(), ReasoningEffort::Low);
        assert_eq!(
            Reasoning::BudgetTokens(32_000).effort(),
            ReasoningEffort::High
        );
        assert_eq!(Reasoning::Effort(ReasoningEffort::Medium).budget_tokens(), 8_192);
    }

    #[test]
    fn unknown_fields_skips_known_and_null() {
        let v = json!({"type": "text", "text": "", "citations": [1], "extra": null});
        let extras = unknown_fields(&v, &["type", "text"]);
        assert_eq!(extras.len(), 1);
        assert_eq!(extras["citations"], json!([1]));
    }
}
