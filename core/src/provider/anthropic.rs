//! Anthropic Messages API (SSE) client

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, trace};

use super::{
    check_status, http_client, map_send_error, parse_frame, sse_event_stream, unknown_fields,
    ConversationRequest, EventStream, FrameTranslator, ProviderClient, RequestOptions,
};
use crate::config::ProviderSettings;
use crate::conversation::{ContentBlock, Message, MessageContent, MessageRole, StopReason};
use crate::event::{Metadata, StreamEvent, UsageUpdate};
use crate::{RelayError, Result};

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    idle_timeout: Duration,
}

impl AnthropicClient {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            http: http_client(Duration::from_millis(settings.request_timeout_ms)),
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            default_model: settings.model.clone(),
            idle_timeout: Duration::from_millis(settings.idle_timeout_ms),
        }
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn is_available(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| !k.is_empty()) && !self.base_url.is_empty()
    }

    async fn stream_message(
        &self,
        request: &ConversationRequest,
        options: &RequestOptions,
    ) -> Result<EventStream> {
        let Some(api_key) = self.api_key.as_deref().filter(|k| !k.is_empty()) else {
            return Err(RelayError::ProviderUnavailable(
                "anthropic api key not configured".into(),
            ));
        };
        let model = if request.conversation.model.is_empty() {
            self.default_model.as_str()
        } else {
            request.conversation.model.as_str()
        };
        let body = build_request_body(model, &request.messages, options);
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        info!(target: "provider", provider = PROVIDER, %model, messages = request.messages.len(), "Starting stream");

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(PROVIDER, e))?;
        let resp = check_status(PROVIDER, resp).await?;
        Ok(sse_event_stream(
            PROVIDER,
            resp,
            self.idle_timeout,
            AnthropicTranslator::new(),
        ))
    }
}

/// Render history and options into a Messages API request
pub fn build_request_body(model: &str, messages: &[Message], options: &RequestOptions) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": options.max_tokens,
        "stream": true,
        "messages": messages.iter().map(render_message).collect::<Vec<_>>(),
    });
    if !options.system.is_empty() {
        body["system"] = json!(options.system);
    }
    if !options.tools.is_empty() {
        body["tools"] = options
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
    }
    if let Some(reasoning) = options.reasoning {
        match thinking_budget(reasoning.budget_tokens(), options.max_tokens) {
            Some(budget) => {
                body["thinking"] = json!({
                    "type": "enabled",
                    "budget_tokens": budget,
                });
            }
            None => debug!(
                target: "provider",
                provider = PROVIDER,
                max_tokens = options.max_tokens,
                "max_tokens too small for extended thinking; sending without it"
            ),
        }
    }
    body
}

/// Smallest budget the Messages API accepts for extended thinking
const MIN_THINKING_BUDGET: u32 = 1_024;

/// The budget must stay strictly below `max_tokens`
fn thinking_budget(requested: u32, max_tokens: u32) -> Option<u32> {
    let budget = requested.min(max_tokens.saturating_sub(1));
    (budget >= MIN_THINKING_BUDGET).then_some(budget)
}

fn render_message(message: &Message) -> Value {
    let role = match message.role {
        MessageRole::Assistant => "assistant",
        // Tool results travel as user content
        MessageRole::User | MessageRole::Tool => "user",
    };
    let content = match &message.content {
        MessageContent::Text(t) => json!(t),
        MessageContent::Blocks(blocks) => blocks.iter().map(render_block).collect(),
    };
    json!({ "role": role, "content": content })
}

fn render_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Reasoning { text, signature } if text.is_empty() => json!({
            "type": "redacted_thinking",
            "data": signature.clone().unwrap_or_default(),
        }),
        ContentBlock::Reasoning { text, signature } => json!({
            "type": "thinking",
            "thinking": text,
            "signature": signature.clone().unwrap_or_default(),
        }),
        ContentBlock::ToolInvocation {
            id,
            name,
            arguments,
        } => json!({"type": "tool_use", "id": id, "name": name, "input": arguments}),
        ContentBlock::ToolResult {
            tool_call_id,
            output,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_call_id,
            "content": output,
            "is_error": is_error,
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Thinking,
    Text,
    ToolUse,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: Value,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: Value,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    index: usize,
    delta: Value,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStop {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaBody,
    usage: Option<UsageUpdate>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseError {
    error: SseErrorBody,
}

#[derive(Debug, Deserialize)]
struct SseErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// Anthropic SSE frames → stream events. Block indices are passed through.
#[derive(Debug, Default)]
pub struct AnthropicTranslator {
    kinds: HashMap<usize, BlockKind>,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl AnthropicTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn on_block_start(&mut self, start: ContentBlockStart) -> Vec<StreamEvent> {
        let index = start.index;
        let block = start.content_block;
        let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");
        let mut out = Vec::new();
        match block_type {
            "thinking" => {
                self.kinds.insert(index, BlockKind::Thinking);
                out.push(StreamEvent::ThinkingStart {
                    block_index: index,
                    metadata: unknown_fields(&block, &["type", "thinking", "signature"]),
                });
                if let Some(t) = block.get("thinking").and_then(Value::as_str) {
                    if !t.is_empty() {
                        out.push(StreamEvent::thinking_delta(index, t));
                    }
                }
            }
            "redacted_thinking" => {
                self.kinds.insert(index, BlockKind::Thinking);
                out.push(StreamEvent::ThinkingStart {
                    block_index: index,
                    metadata: unknown_fields(&block, &["type", "data"]),
                });
                if let Some(data) = block.get("data").and_then(Value::as_str) {
                    out.push(StreamEvent::ThinkingSignature {
                        block_index: index,
                        content: data.to_string(),
                    });
                }
            }
            "tool_use" | "server_tool_use" => {
                self.kinds.insert(index, BlockKind::ToolUse);
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                out.push(StreamEvent::ToolUseStart {
                    block_index: index,
                    tool_call_id: id.to_string(),
                    tool_name: name.to_string(),
                    metadata: unknown_fields(&block, &["type", "id", "name", "input"]),
                });
            }
            other => {
                // Plain text, plus any block type we do not model: keep the raw
                // block in metadata so nothing is lost.
                self.kinds.insert(index, BlockKind::Text);
                let mut metadata = unknown_fields(&block, &["type", "text"]);
                if other != "text" {
                    metadata.insert("block_type".into(), json!(other));
                }
                out.push(StreamEvent::TextStart {
                    block_index: index,
                    metadata,
                });
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    if !t.is_empty() {
                        out.push(StreamEvent::text_delta(index, t));
                    }
                }
            }
        }
        out
    }

    fn on_block_delta(&mut self, delta: ContentBlockDelta) -> Result<Vec<StreamEvent>> {
        let index = delta.index;
        let d = &delta.delta;
        let field = |name: &str| {
            d.get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let event = match d.get("type").and_then(Value::as_str).unwrap_or("") {
            "text_delta" => StreamEvent::text_delta(index, field("text")),
            "thinking_delta" => StreamEvent::thinking_delta(index, field("thinking")),
            "signature_delta" => StreamEvent::ThinkingSignature {
                block_index: index,
                content: field("signature"),
            },
            "input_json_delta" => StreamEvent::tool_use_delta(index, field("partial_json")),
            other => {
                debug!(target: "provider", provider = PROVIDER, delta_type = other, "Ignoring unsupported delta");
                return Ok(Vec::new());
            }
        };
        Ok(vec![event])
    }

    fn on_block_stop(&mut self, stop: ContentBlockStop) -> Result<Vec<StreamEvent>> {
        let index = stop.index;
        let kind = self.kinds.get(&index).copied().ok_or_else(|| {
            RelayError::ProviderProtocol(format!("content_block_stop for unknown block {index}"))
        })?;
        Ok(vec![match kind {
            BlockKind::Thinking => StreamEvent::ThinkingStop { block_index: index },
            BlockKind::Text => StreamEvent::TextStop { block_index: index },
            BlockKind::ToolUse => StreamEvent::ToolUseStop { block_index: index },
        }])
    }
}

impl FrameTranslator for AnthropicTranslator {
    fn translate(&mut self, event: &str, data: &str) -> Result<Vec<StreamEvent>> {
        match event {
            "message_start" => {
                let start: MessageStart = parse_frame(PROVIDER, data)?;
                let usage: Option<UsageUpdate> = start
                    .message
                    .get("usage")
                    .cloned()
                    .and_then(|u| serde_json::from_value(u).ok());
                Ok(usage
                    .filter(|u| !u.is_empty())
                    .map(StreamEvent::Usage)
                    .into_iter()
                    .collect())
            }
            "content_block_start" => Ok(self.on_block_start(parse_frame(PROVIDER, data)?)),
            "content_block_delta" => self.on_block_delta(parse_frame(PROVIDER, data)?),
            "content_block_stop" => self.on_block_stop(parse_frame(PROVIDER, data)?),
            "message_delta" => {
                let delta: MessageDelta = parse_frame(PROVIDER, data)?;
                if let Some(reason) = delta.delta.stop_reason {
                    self.stop_reason = Some(StopReason::parse(&reason));
                }
                Ok(delta
                    .usage
                    .filter(|u| !u.is_empty())
                    .map(StreamEvent::Usage)
                    .into_iter()
                    .collect())
            }
            "message_stop" => {
                self.finished = true;
                let reason = self.stop_reason.take().unwrap_or(StopReason::EndTurn);
                Ok(vec![StreamEvent::done(reason)])
            }
            "error" => {
                self.finished = true;
                let err: SseError = parse_frame(PROVIDER, data)?;
                let mut metadata = Metadata::new();
                match err.error.kind.as_str() {
                    "rate_limit_error" => {
                        metadata.insert("kind".into(), json!("rate_limited"));
                    }
                    "overloaded_error" => {
                        metadata.insert("kind".into(), json!("overloaded"));
                    }
                    _ => {}
                }
                metadata.insert("error_type".into(), json!(err.error.kind));
                Ok(vec![StreamEvent::Error {
                    message: err.error.message,
                    metadata,
                }])
            }
            "ping" => Ok(Vec::new()),
            other => {
                trace!(target: "provider", provider = PROVIDER, event = other, "Ignoring SSE event");
                Ok(Vec::new())
            }
        }
    }

    fn finished(&self) -> bool {
        self.finished
    }
}
