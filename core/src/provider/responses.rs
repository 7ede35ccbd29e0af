//! OpenAI Responses API (SSE) client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    check_status, http_client, map_send_error, parse_frame, sse_event_stream,
    ConversationRequest, EventStream, FrameTranslator, ProviderClient, RequestOptions,
};
use crate::config::ProviderSettings;
use crate::conversation::{ContentBlock, Message, MessageContent, MessageRole, StopReason};
use crate::event::{Metadata, StreamEvent, UsageUpdate};
use crate::{RelayError, Result};

const PROVIDER: &str = "openai_responses";

pub struct OpenAiResponsesClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    idle_timeout: Duration,
}

impl OpenAiResponsesClient {
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
impl ProviderClient for OpenAiResponsesClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn is_available(&self) -> bool {
        !self.base_url.is_empty() && self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn stream_message(
        &self,
        request: &ConversationRequest,
        options: &RequestOptions,
    ) -> Result<EventStream> {
        let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) else {
            return Err(RelayError::ProviderUnavailable(
                "openai api key not configured".into(),
            ));
        };
        let model = if request.conversation.model.is_empty() {
            self.default_model.as_str()
        } else {
            request.conversation.model.as_str()
        };
        let body = build_request_body(model, &request.messages, options);
        let url = format!("{}/responses", self.base_url.trim_end_matches('/'));
        info!(target: "provider", provider = PROVIDER, %model, messages = request.messages.len(), "Starting stream");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(key)
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
            ResponsesTranslator::new(),
        ))
    }
}

/// Render history and options into a Responses API request
pub fn build_request_body(model: &str, messages: &[Message], options: &RequestOptions) -> Value {
    let mut input = Vec::new();
    for m in messages {
        render_message(m, &mut input);
    }
    let mut body = json!({
        "model": model,
        "input": input,
        "stream": true,
        "store": false,
        "max_output_tokens": options.max_tokens,
    });
    if !options.system.is_empty() {
        body["instructions"] = json!(options.system);
    }
    if !options.tools.is_empty() {
        body["tools"] = options
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                })
            })
            .collect();
    }
    if let Some(reasoning) = options.reasoning {
        body["reasoning"] = json!({
            "effort": reasoning.effort().as_str(),
            "summary": "auto",
        });
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
            if !text.is_empty() {
                out.push(json!({"role": "assistant", "content": text}));
            }
            for block in blocks {
                if let ContentBlock::ToolInvocation {
                    id,
                    name,
                    arguments,
                } = block
                {
                    out.push(json!({
                        "type": "function_call",
                        "call_id": id,
                        "name": name,
                        "arguments": arguments.to_string(),
                    }));
                }
            }
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
                        "type": "function_call_output",
                        "call_id": tool_call_id,
                        "output": output,
                    }));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Text,
    Reasoning,
    FunctionCall,
}

/// Responses API events → stream events. Block indices are the
/// response's `output_index`.
#[derive(Debug, Default)]
pub struct ResponsesTranslator {
    open: HashMap<usize, ItemKind>,
    saw_function_call: bool,
    response_metadata: Metadata,
    finished: bool,
}

impl ResponsesTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn output_index(frame: &Value) -> Result<usize> {
        frame
            .get("output_index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .ok_or_else(|| {
                RelayError::ProviderProtocol(format!("{PROVIDER} frame missing output_index"))
            })
    }

    fn delta(frame: &Value) -> &str {
        frame.get("delta").and_then(Value::as_str).unwrap_or("")
    }

    fn on_item_added(&mut self, frame: &Value) -> Result<Vec<StreamEvent>> {
        let index = Self::output_index(frame)?;
        let item = frame.get("item").cloned().unwrap_or(Value::Null);
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
        let event = match item_type {
            "message" => {
                self.open.insert(index, ItemKind::Text);
                StreamEvent::text_start(index)
            }
            "reasoning" => {
                self.open.insert(index, ItemKind::Reasoning);
                StreamEvent::thinking_start(index)
            }
            "function_call" => {
                self.open.insert(index, ItemKind::FunctionCall);
                self.saw_function_call = true;
                let call_id = item
                    .get("call_id")
                    .or_else(|| item.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let name = item.get("name").and_then(Value::as_str).unwrap_or_default();
                StreamEvent::tool_use_start(index, call_id, name)
            }
            other => {
                debug!(target: "provider", provider = PROVIDER, item_type = other, "Ignoring output item");
                return Ok(Vec::new());
            }
        };
        Ok(vec![event])
    }

    fn on_item_done(&mut self, frame: &Value) -> Result<Vec<StreamEvent>> {
        let index = Self::output_index(frame)?;
        let Some(kind) = self.open.remove(&index) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        match kind {
            ItemKind::Text => out.push(StreamEvent::TextStop { block_index: index }),
            ItemKind::Reasoning => {
                if let Some(sig) = frame
                    .get("item")
                    .and_then(|i| i.get("encrypted_content"))
                    .and_then(Value::as_str)
                {
                    out.push(StreamEvent::ThinkingSignature {
                        block_index: index,
                        content: sig.to_string(),
                    });
                }
                out.push(StreamEvent::ThinkingStop { block_index: index });
            }
            ItemKind::FunctionCall => out.push(StreamEvent::ToolUseStop { block_index: index }),
        }
        Ok(out)
    }

    fn on_delta(&self, frame: &Value, expected: ItemKind) -> Result<Vec<StreamEvent>> {
        let index = Self::output_index(frame)?;
        let delta = Self::delta(frame);
        if delta.is_empty() || self.open.get(&index) != Some(&expected) {
            return Ok(Vec::new());
        }
        Ok(vec![match expected {
            ItemKind::Text => StreamEvent::text_delta(index, delta),
            ItemKind::Reasoning => StreamEvent::thinking_delta(index, delta),
            ItemKind::FunctionCall => StreamEvent::tool_use_delta(index, delta),
        }])
    }

    fn close_open(&mut self, out: &mut Vec<StreamEvent>) {
        let mut open: Vec<(usize, ItemKind)> = self.open.drain().collect();
        open.sort_by_key(|(i, _)| *i);
        for (block_index, kind) in open {
            out.push(match kind {
                ItemKind::Text => StreamEvent::TextStop { block_index },
                ItemKind::Reasoning => StreamEvent::ThinkingStop { block_index },
                ItemKind::FunctionCall => StreamEvent::ToolUseStop { block_index },
            });
        }
    }

    fn on_completed(&mut self, frame: &Value) -> Vec<StreamEvent> {
        let response = frame.get("response").cloned().unwrap_or(Value::Null);
        let mut out = Vec::new();
        self.close_open(&mut out);

        if let Some(usage) = response.get("usage").filter(|u| !u.is_null()) {
            out.push(StreamEvent::Usage(UsageUpdate {
                input_tokens: usage.get("input_tokens").and_then(Value::as_u64),
                output_tokens: usage.get("output_tokens").and_then(Value::as_u64),
                cache_creation_input_tokens: None,
                cache_read_input_tokens: usage
                    .get("input_tokens_details")
                    .and_then(|d| d.get("cached_tokens"))
                    .and_then(Value::as_u64),
            }));
        }

        let status = response.get("status").and_then(Value::as_str).unwrap_or("completed");
        let stop_reason = if status == "incomplete" {
            let reason = response
                .get("incomplete_details")
                .and_then(|d| d.get("reason"))
                .and_then(Value::as_str)
                .unwrap_or("incomplete");
            StopReason::parse(reason)
        } else if self.saw_function_call {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };

        let mut metadata = std::mem::take(&mut self.response_metadata);
        if let Some(id) = response.get("id").and_then(Value::as_str) {
            metadata.insert("response_id".into(), json!(id));
        }
        self.finished = true;
        out.push(StreamEvent::Done {
            stop_reason,
            metadata,
        });
        out
    }

    fn on_error(&mut self, error: &Value) -> Vec<StreamEvent> {
        self.finished = true;
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let mut metadata = Metadata::new();
        if let Some(code) = error.get("code").and_then(Value::as_str) {
            if code == "rate_limit_exceeded" {
                metadata.insert("kind".into(), json!("rate_limited"));
            } else if code == "server_error" || code == "overloaded" {
                metadata.insert("kind".into(), json!("unavailable"));
            }
            metadata.insert("code".into(), json!(code));
        }
        vec![StreamEvent::Error { message, metadata }]
    }
}

impl FrameTranslator for ResponsesTranslator {
    fn translate(&mut self, event: &str, data: &str) -> Result<Vec<StreamEvent>> {
        let frame: Value = parse_frame(PROVIDER, data)?;
        let kind = frame
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(event)
            .to_string();
        match kind.as_str() {
            "response.created" | "response.in_progress" => {
                if let Some(model) = frame
                    .get("response")
                    .and_then(|r| r.get("model"))
                    .and_then(Value::as_str)
                {
                    self.response_metadata.insert("model".into(), json!(model));
                }
                Ok(Vec::new())
            }
            "response.output_item.added" => self.on_item_added(&frame),
            "response.output_item.done" => self.on_item_done(&frame),
            "response.output_text.delta" => self.on_delta(&frame, ItemKind::Text),
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                self.on_delta(&frame, ItemKind::Reasoning)
            }
            "response.function_call_arguments.delta" => {
                self.on_delta(&frame, ItemKind::FunctionCall)
            }
            "response.completed" | "response.incomplete" => Ok(self.on_completed(&frame)),
            "response.failed" => {
                let error = frame
                    .get("response")
                    .and_then(|r| r.get("error"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(self.on_error(&error))
            }
            "error" => Ok(self.on_error(&frame)),
            other => {
                debug!(target: "provider", provider = PROVIDER, event = other, "Unhandled Responses event");
                Ok(Vec::new())
            }
        }
    }

    fn finished(&self) -> bool {
        self.finished
    }
}
