//! OpenAI Chat Completions (SSE) client.
//!
//! Chat Completions has no block structure, so block indices are synthesized:
//! each run of reasoning or text deltas and each `tool_calls[i]` entry gets
//! the next free index.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{
    check_status, http_client, map_send_error, parse_frame, sse_event_stream, unknown_fields,
    ConversationRequest, EventStream, FrameTranslator, ProviderClient, RequestOptions,
};
use crate::config::ProviderSettings;
use crate::conversation::{ContentBlock, Message, MessageContent, MessageRole, StopReason};
use crate::event::{Metadata, StreamEvent, UsageUpdate};
use crate::{RelayError, Result};

const PROVIDER: &str = "openai";

pub struct OpenAiChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    idle_timeout: Duration,
}

impl OpenAiChatClient {
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
impl ProviderClient for OpenAiChatClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn is_available(&self) -> bool {
        // OpenAI-compatible local servers accept unauthenticated requests
        !self.base_url.is_empty()
    }

    async fn stream_message(
        &self,
        request: &ConversationRequest,
        options: &RequestOptions,
    ) -> Result<EventStream> {
        if !self.is_available() {
            return Err(RelayError::ProviderUnavailable(
                "openai base url not configured".into(),
            ));
        }
        let model = if request.conversation.model.is_empty() {
            self.default_model.as_str()
        } else {
            request.conversation.model.as_str()
        };
        let body = build_request_body(model, &request.messages, options);
        let url = format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        info!(target: "provider", provider = PROVIDER, %model, messages = request.messages.len(), "Starting stream");

        let mut req = self
            .http
            .post(&url)
            .header("content-type", "application/json");
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.bearer_auth(key);
        }
        let resp = req
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(PROVIDER, e))?;
        let resp = check_status(PROVIDER, resp).await?;
        Ok(sse_event_stream(
            PROVIDER,
            resp,
            self.idle_timeout,
            OpenAiChatTranslator::new(),
        ))
    }
}

/// Render history and options into a Chat Completions request
pub fn build_request_body(model: &str, messages: &[Message], options: &RequestOptions) -> Value {
    let mut out = Vec::new();
    if !options.system.is_empty() {
        out.push(json!({"role": "system", "content": options.system}));
    }
    for m in messages {
        render_message(m, &mut out);
    }
    let mut body = json!({
        "model": model,
        "messages": out,
        "stream": true,
        "stream_options": {"include_usage": true},
        "max_tokens": options.max_tokens,
    });
    if !options.tools.is_empty() {
        body["tools"] = options
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
    }
    if let Some(reasoning) = options.reasoning {
        body["reasoning_effort"] = json!(reasoning.effort().as_str());
    }
    body
}

fn render_message(message: &Message, out: &mut Vec<Value>) {
    match (&message.role, &message.content) {
        (MessageRole::User, content) => {
            out.push(json!({"role": "user", "content": content.text()}));
        }
        (MessageRole::Assistant, MessageContent::Text(t)) => {
            out.push(json!({"role": "assistant", "content": t}));
        }
        (MessageRole::Assistant, MessageContent::Blocks(blocks)) => {
            let text = message.content.text();
            let tool_calls: Vec<Value> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolInvocation {
                        id,
                        name,
                        arguments,
                    } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": arguments.to_string()},
                    })),
                    _ => None,
                })
                .collect();
            let mut msg = json!({
                "role": "assistant",
                "content": if text.is_empty() { Value::Null } else { json!(text) },
            });
            if !tool_calls.is_empty() {
                msg["tool_calls"] = json!(tool_calls);
            }
            out.push(msg);
        }
        (MessageRole::Tool, content) => {
            for block in content.blocks() {
                if let ContentBlock::ToolResult {
                    tool_call_id,
                    output,
                    ..
                } = block
                {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_call_id,
                        "content": output,
                    }));
                }
            }
        }
    }
}

/// Chat Completions chunks → stream events
#[derive(Debug, Default)]
pub struct OpenAiChatTranslator {
    next_index: usize,
    open_thinking: Option<usize>,
    open_text: Option<usize>,
    /// OpenAI tool call index → open block index
    open_tools: BTreeMap<u64, usize>,
    saw_tool_calls: bool,
    finish_reason: Option<StopReason>,
    response_metadata: Metadata,
    finished: bool,
}

impl OpenAiChatTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> usize {
        let i = self.next_index;
        self.next_index += 1;
        i
    }

    fn close_thinking(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(i) = self.open_thinking.take() {
            out.push(StreamEvent::ThinkingStop { block_index: i });
        }
    }

    fn close_text(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(i) = self.open_text.take() {
            out.push(StreamEvent::TextStop { block_index: i });
        }
    }

    fn close_all(&mut self, out: &mut Vec<StreamEvent>) {
        self.close_thinking(out);
        self.close_text(out);
        let tools = std::mem::take(&mut self.open_tools);
        let mut indices: Vec<usize> = tools.into_values().collect();
        indices.sort_unstable();
        for i in indices {
            out.push(StreamEvent::ToolUseStop { block_index: i });
        }
    }

    fn done(&mut self, out: &mut Vec<StreamEvent>) {
        self.close_all(out);
        let stop_reason = match self.finish_reason.take() {
            Some(r) => r,
            None if self.saw_tool_calls => StopReason::ToolUse,
            None => StopReason::EndTurn,
        };
        out.push(StreamEvent::Done {
            stop_reason,
            metadata: std::mem::take(&mut self.response_metadata),
        });
        self.finished = true;
    }

    fn on_delta(&mut self, delta: &Value, out: &mut Vec<StreamEvent>) {
        let reasoning = delta
            .get("reasoning_content")
            .or_else(|| delta.get("reasoning"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if !reasoning.is_empty() {
            self.close_text(out);
            let i = match self.open_thinking {
                Some(i) => i,
                None => {
                    let i = self.allocate();
                    self.open_thinking = Some(i);
                    out.push(StreamEvent::thinking_start(i));
                    i
                }
            };
            out.push(StreamEvent::thinking_delta(i, reasoning));
        }

        let content = delta.get("content").and_then(Value::as_str).unwrap_or("");
        if !content.is_empty() {
            self.close_thinking(out);
            let i = match self.open_text {
                Some(i) => i,
                None => {
                    let i = self.allocate();
                    self.open_text = Some(i);
                    out.push(StreamEvent::text_start(i));
                    i
                }
            };
            out.push(StreamEvent::text_delta(i, content));
        }

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            self.close_thinking(out);
            self.close_text(out);
            for (pos, call) in calls.iter().enumerate() {
                let oa_index = call
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(pos as u64);
                let function = call.get("function");
                let block = match self.open_tools.get(&oa_index) {
                    Some(i) => *i,
                    None => {
                        let i = self.allocate();
                        self.open_tools.insert(oa_index, i);
                        self.saw_tool_calls = true;
                        let id = call
                            .get("id")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("call_{oa_index}"));
                        let name = function
                            .and_then(|f| f.get("name"))
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        out.push(StreamEvent::tool_use_start(i, id, name));
                        i
                    }
                };
                let args = function
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if !args.is_empty() {
                    out.push(StreamEvent::tool_use_delta(block, args));
                }
            }
        }
    }
}

impl FrameTranslator for OpenAiChatTranslator {
    fn translate(&mut self, _event: &str, data: &str) -> Result<Vec<StreamEvent>> {
        let mut out = Vec::new();
        if data.trim() == "[DONE]" {
            self.done(&mut out);
            return Ok(out);
        }
        let chunk: Value = parse_frame(PROVIDER, data)?;

        if let Some(err) = chunk.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            let mut metadata = unknown_fields(err, &["message"]);
            if err.get("code").and_then(Value::as_str) == Some("rate_limit_exceeded") {
                metadata.insert("kind".into(), json!("rate_limited"));
            }
            self.finished = true;
            out.push(StreamEvent::Error { message, metadata });
            return Ok(out);
        }

        if self.response_metadata.is_empty() {
            self.response_metadata = unknown_fields(&chunk, &["choices", "usage", "object", "created"]);
        }

        if let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        {
            if let Some(delta) = choice.get("delta") {
                self.on_delta(delta, &mut out);
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                self.close_all(&mut out);
                self.finish_reason = Some(StopReason::parse(reason));
            }
        }

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            let cached = usage
                .get("prompt_tokens_details")
                .and_then(|d| d.get("cached_tokens"))
                .and_then(Value::as_u64);
            out.push(StreamEvent::Usage(UsageUpdate {
                input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
                output_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
                cache_creation_input_tokens: None,
                cache_read_input_tokens: cached,
            }));
        }
        Ok(out)
    }

    fn finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        // Some compatible servers close the stream without `[DONE]`
        if self.finish_reason.is_some() {
            let mut out = Vec::new();
            self.done(&mut out);
            return Ok(out);
        }
        Err(RelayError::ProviderProtocol(
            "openai stream closed before finish_reason".into(),
        ))
    }
}
