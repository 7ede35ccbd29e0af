//! Ollama `/api/chat` client (newline-delimited JSON).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{
    check_status, http_client, map_send_error, ndjson_event_stream, parse_frame,
    ConversationRequest, EventStream, FrameTranslator, ProviderClient, RequestOptions,
};
use crate::config::ProviderSettings;
use crate::conversation::{ContentBlock, Message, MessageRole, StopReason};
use crate::event::{Metadata, StreamEvent, UsageUpdate};
use crate::{RelayError, Result};

const PROVIDER: &str = "ollama";

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    default_model: String,
    idle_timeout: Duration,
}

impl OllamaClient {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            http: http_client(Duration::from_millis(settings.request_timeout_ms)),
            base_url: settings.base_url.clone(),
            default_model: settings.model.clone(),
            idle_timeout: Duration::from_millis(settings.idle_timeout_ms),
        }
    }
}

#[async_trait]
impl ProviderClient for OllamaClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn is_available(&self) -> bool {
        !self.base_url.is_empty()
    }

    async fn stream_message(
        &self,
        request: &ConversationRequest,
        options: &RequestOptions,
    ) -> Result<EventStream> {
        if !self.is_available() {
            return Err(RelayError::ProviderUnavailable(
                "ollama base url not configured".into(),
            ));
        }
        let model = if request.conversation.model.is_empty() {
            self.default_model.as_str()
        } else {
            request.conversation.model.as_str()
        };
        let body = build_request_body(model, &request.messages, options);
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        info!(target: "provider", provider = PROVIDER, %model, messages = request.messages.len(), "Starting stream");

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(PROVIDER, e))?;
        let resp = check_status(PROVIDER, resp).await?;
        Ok(ndjson_event_stream(
            PROVIDER,
            resp,
            self.idle_timeout,
            OllamaTranslator::new(),
        ))
    }
}

/// Render history and options into an Ollama chat request
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
        "options": {"num_predict": options.max_tokens},
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
    if options.reasoning.is_some() {
        body["think"] = json!(true);
    }
    body
}

fn render_message(message: &Message, out: &mut Vec<Value>) {
    match message.role {
        MessageRole::User => {
            out.push(json!({"role": "user", "content": message.content.text()}));
        }
        MessageRole::Assistant => {
            let blocks = message.content.blocks();
            let thinking: String = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Reasoning { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            let tool_calls: Vec<Value> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolInvocation {
                        name, arguments, ..
                    } => Some(json!({"function": {"name": name, "arguments": arguments}})),
                    _ => None,
                })
                .collect();
            let mut msg = json!({"role": "assistant", "content": message.content.text()});
            if !thinking.is_empty() {
                msg["thinking"] = json!(thinking);
            }
            if !tool_calls.is_empty() {
                msg["tool_calls"] = json!(tool_calls);
            }
            out.push(msg);
        }
        MessageRole::Tool => {
            for block in message.content.blocks() {
                if let ContentBlock::ToolResult { output, .. } = block {
                    out.push(json!({"role": "tool", "content": output}));
                }
            }
        }
    }
}

/// Ollama chat lines → stream events. Tool calls arrive complete, so each
/// becomes a start/delta/stop triple.
#[derive(Debug, Default)]
pub struct OllamaTranslator {
    next_index: usize,
    open_thinking: Option<usize>,
    open_text: Option<usize>,
    saw_tool_calls: bool,
    finished: bool,
}

impl OllamaTranslator {
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
}

impl FrameTranslator for OllamaTranslator {
    fn translate(&mut self, _event: &str, data: &str) -> Result<Vec<StreamEvent>> {
        let line: Value = parse_frame(PROVIDER, data)?;
        let mut out = Vec::new();

        if let Some(err) = line.get("error").and_then(Value::as_str) {
            self.finished = true;
            out.push(StreamEvent::error(err));
            return Ok(out);
        }

        if let Some(message) = line.get("message") {
            let thinking = message.get("thinking").and_then(Value::as_str).unwrap_or("");
            if !thinking.is_empty() {
                self.close_text(&mut out);
                let i = match self.open_thinking {
                    Some(i) => i,
                    None => {
                        let i = self.allocate();
                        self.open_thinking = Some(i);
                        out.push(StreamEvent::thinking_start(i));
                        i
                    }
                };
                out.push(StreamEvent::thinking_delta(i, thinking));
            }

            let content = message.get("content").and_then(Value::as_str).unwrap_or("");
            if !content.is_empty() {
                self.close_thinking(&mut out);
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

            if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
                self.close_thinking(&mut out);
                self.close_text(&mut out);
                for call in calls {
                    let function = call.get("function").cloned().unwrap_or(Value::Null);
                    let name = function
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let arguments = match function.get("arguments") {
                        Some(Value::String(s)) => s.clone(),
                        Some(v) if !v.is_null() => v.to_string(),
                        _ => String::new(),
                    };
                    let id = format!("call_{}", uuid::Uuid::new_v4().simple());
                    let i = self.allocate();
                    self.saw_tool_calls = true;
                    out.push(StreamEvent::tool_use_start(i, id, name));
                    if !arguments.is_empty() {
                        out.push(StreamEvent::tool_use_delta(i, arguments));
                    }
                    out.push(StreamEvent::ToolUseStop { block_index: i });
                }
            }
        }

        if line.get("done").and_then(Value::as_bool) == Some(true) {
            self.close_thinking(&mut out);
            self.close_text(&mut out);
            let usage = UsageUpdate {
                input_tokens: line.get("prompt_eval_count").and_then(Value::as_u64),
                output_tokens: line.get("eval_count").and_then(Value::as_u64),
                ..Default::default()
            };
            if !usage.is_empty() {
                out.push(StreamEvent::Usage(usage));
            }
            let stop_reason = if self.saw_tool_calls {
                StopReason::ToolUse
            } else {
                line.get("done_reason")
                    .and_then(Value::as_str)
                    .map(StopReason::parse)
                    .unwrap_or(StopReason::EndTurn)
            };
            let mut metadata = Metadata::new();
            if let Some(model) = line.get("model").and_then(Value::as_str) {
                metadata.insert("model".into(), json!(model));
            }
            if let Some(d) = line.get("total_duration").and_then(Value::as_u64) {
                metadata.insert("total_duration_ns".into(), json!(d));
            }
            self.finished = true;
            out.push(StreamEvent::Done {
                stop_reason,
                metadata,
            });
        }
        Ok(out)
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_arguments_pass_through() {
        let mut t = OllamaTranslator::new();
        let out = t
            .translate(
                "",
                r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"read_file","arguments":"{\"path\":\"a\"}"}}]},"done":false}"#,
            )
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[1], StreamEvent::tool_use_delta(0, r#"{"path":"a"}"#));
        assert_eq!(out[2], StreamEvent::ToolUseStop { block_index: 0 });
    }

    #[test]
    fn done_without_counts_skips_usage() {
        let mut t = OllamaTranslator::new();
        let out = t.translate("", r#"{"done":true}"#).unwrap();
        assert_eq!(out, vec![StreamEvent::done(StopReason::EndTurn)]);
    }
}
