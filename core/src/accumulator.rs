//! Turn accumulator: folds one provider call's event sequence into content
//! blocks, pending tool calls, token usage and the stop reason.
//!
//! Blocks are kept in an index-ordered map while streaming, so the final block
//! list follows the provider's block numbering even when `_start` events
//! arrive interleaved.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::conversation::{ContentBlock, StopReason, TokenUsage};
use crate::event::{Metadata, StreamEvent, UsageUpdate};
use crate::{RelayError, Result};

/// A tool call requested by the backend, awaiting execution
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    /// Set when the streamed argument JSON could not be parsed; `arguments`
    /// is then an empty object.
    pub argument_error: Option<String>,
}

/// Result of folding one complete provider call
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutput {
    pub content_blocks: Vec<ContentBlock>,
    pub pending_tool_calls: Vec<PendingToolCall>,
    pub usage: TokenUsage,
    pub stop_reason: StopReason,
    /// Extras attached to the `done` event
    pub metadata: Metadata,
}

impl TurnOutput {
    /// Whether the orchestrator must run a tool round before the next turn
    pub fn requires_tools(&self) -> bool {
        self.stop_reason == StopReason::ToolUse && !self.pending_tool_calls.is_empty()
    }
}

#[derive(Debug)]
enum BlockBuilder {
    Reasoning {
        text: String,
        signature: Option<String>,
        open: bool,
    },
    Text {
        text: String,
        open: bool,
    },
    ToolUse {
        id: String,
        name: String,
        input_json: String,
        parsed: Option<(Value, Option<String>)>,
        open: bool,
    },
}

impl BlockBuilder {
    fn kind(&self) -> &'static str {
        match self {
            BlockBuilder::Reasoning { .. } => "thinking",
            BlockBuilder::Text { .. } => "text",
            BlockBuilder::ToolUse { .. } => "tool_use",
        }
    }

    fn is_open(&self) -> bool {
        match self {
            BlockBuilder::Reasoning { open, .. }
            | BlockBuilder::Text { open, .. }
            | BlockBuilder::ToolUse { open, .. } => *open,
        }
    }

    fn close(&mut self) {
        match self {
            BlockBuilder::Reasoning { open, .. } | BlockBuilder::Text { open, .. } => {
                *open = false;
            }
            BlockBuilder::ToolUse {
                input_json,
                parsed,
                open,
                ..
            } => {
                *open = false;
                if parsed.is_none() {
                    *parsed = Some(parse_tool_arguments(input_json));
                }
            }
        }
    }
}

/// Parse concatenated `tool_use_delta` fragments. Malformed or non-object
/// input yields `{}` together with a description of the problem.
pub fn parse_tool_arguments(raw: &str) -> (Value, Option<String>) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (Value::Object(Default::default()), None);
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(v @ Value::Object(_)) => (v, None),
        Ok(other) => (
            Value::Object(Default::default()),
            Some(format!(
                "tool arguments must be a JSON object, got: {}",
                other
            )),
        ),
        Err(e) => (
            Value::Object(Default::default()),
            Some(format!("malformed tool arguments JSON: {e}")),
        ),
    }
}

/// Pure fold over a provider call's events
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    blocks: BTreeMap<usize, BlockBuilder>,
    usage: UsageUpdate,
    stop_reason: Option<StopReason>,
    done_metadata: Metadata,
    failure: Option<(String, Metadata)>,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `done` or `error` has been folded
    pub fn is_terminal(&self) -> bool {
        self.stop_reason.is_some() || self.failure.is_some()
    }

    /// Usage accumulated so far, with unset counters at their defaults
    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.usage.input_tokens.unwrap_or(0),
            output_tokens: self.usage.output_tokens.unwrap_or(0),
            cache_creation_input_tokens: self.usage.cache_creation_input_tokens,
            cache_read_input_tokens: self.usage.cache_read_input_tokens,
        }
    }

    /// Fold one event. Protocol violations abort the turn.
    pub fn fold(&mut self, event: &StreamEvent) -> Result<()> {
        if self.is_terminal() {
            return Err(RelayError::ProviderProtocol(format!(
                "{:?} event received after the turn ended",
                event.event_type()
            )));
        }

        match event {
            StreamEvent::ThinkingStart { block_index, .. } => self.open(
                *block_index,
                BlockBuilder::Reasoning {
                    text: String::new(),
                    signature: None,
                    open: true,
                },
            ),
            StreamEvent::ThinkingDelta {
                block_index,
                content,
            } => match self.open_block(*block_index, "thinking")? {
                BlockBuilder::Reasoning { text, .. } => {
                    text.push_str(content);
                    Ok(())
                }
                other => Err(kind_mismatch(*block_index, "thinking", other)),
            },
            StreamEvent::ThinkingSignature {
                block_index,
                content,
            } => match self.open_block(*block_index, "thinking")? {
                BlockBuilder::Reasoning { signature, .. } => {
                    signature.get_or_insert_with(String::new).push_str(content);
                    Ok(())
                }
                other => Err(kind_mismatch(*block_index, "thinking", other)),
            },
            StreamEvent::TextStart { block_index, .. } => self.open(
                *block_index,
                BlockBuilder::Text {
                    text: String::new(),
                    open: true,
                },
            ),
            StreamEvent::TextDelta {
                block_index,
                content,
            } => match self.open_block(*block_index, "text")? {
                BlockBuilder::Text { text, .. } => {
                    text.push_str(content);
                    Ok(())
                }
                other => Err(kind_mismatch(*block_index, "text", other)),
            },
            StreamEvent::ToolUseStart {
                block_index,
                tool_call_id,
                tool_name,
                ..
            } => self.open(
                *block_index,
                BlockBuilder::ToolUse {
                    id: tool_call_id.clone(),
                    name: tool_name.clone(),
                    input_json: String::new(),
                    parsed: None,
                    open: true,
                },
            ),
            StreamEvent::ToolUseDelta {
                block_index,
                content,
            } => match self.open_block(*block_index, "tool_use")? {
                BlockBuilder::ToolUse { input_json, .. } => {
                    input_json.push_str(content);
                    Ok(())
                }
                other => Err(kind_mismatch(*block_index, "tool_use", other)),
            },
            StreamEvent::ThinkingStop { block_index } => self.stop(*block_index, "thinking"),
            StreamEvent::TextStop { block_index } => self.stop(*block_index, "text"),
            StreamEvent::ToolUseStop { block_index } => self.stop(*block_index, "tool_use"),
            StreamEvent::Usage(update) => {
                // Per counter, last value wins
                if update.input_tokens.is_some() {
                    self.usage.input_tokens = update.input_tokens;
                }
                if update.output_tokens.is_some() {
                    self.usage.output_tokens = update.output_tokens;
                }
                if update.cache_creation_input_tokens.is_some() {
                    self.usage.cache_creation_input_tokens = update.cache_creation_input_tokens;
                }
                if update.cache_read_input_tokens.is_some() {
                    self.usage.cache_read_input_tokens = update.cache_read_input_tokens;
                }
                Ok(())
            }
            StreamEvent::Done {
                stop_reason,
                metadata,
            } => {
                self.stop_reason = Some(stop_reason.clone());
                self.done_metadata = metadata.clone();
                Ok(())
            }
            StreamEvent::Error { message, metadata } => {
                self.failure = Some((message.clone(), metadata.clone()));
                Ok(())
            }
            StreamEvent::ToolResult { tool_call_id, .. } => Err(RelayError::ProviderProtocol(
                format!("provider emitted tool_result for {tool_call_id}"),
            )),
        }
    }

    /// Densify blocks by ascending index and produce the turn output.
    pub fn finish(mut self) -> Result<TurnOutput> {
        if let Some((message, metadata)) = self.failure.take() {
            return Err(classify_stream_error(message, &metadata));
        }
        let usage = self.usage();
        let stop_reason = self.stop_reason.take().ok_or_else(|| {
            RelayError::ProviderProtocol("stream ended before a done event".into())
        })?;

        let mut content_blocks = Vec::with_capacity(self.blocks.len());
        let mut pending_tool_calls = Vec::new();
        for (index, mut block) in self.blocks {
            if block.is_open() {
                warn!(target: "accumulator", block_index = index, kind = block.kind(), "Block still open at done; finalizing");
                block.close();
            }
            match block {
                BlockBuilder::Reasoning {
                    text, signature, ..
                } => content_blocks.push(ContentBlock::Reasoning { text, signature }),
                BlockBuilder::Text { text, .. } => content_blocks.push(ContentBlock::Text { text }),
                BlockBuilder::ToolUse {
                    id,
                    name,
                    input_json,
                    parsed,
                    ..
                } => {
                    let (arguments, argument_error) =
                        parsed.unwrap_or_else(|| parse_tool_arguments(&input_json));
                    if let Some(err) = &argument_error {
                        warn!(target: "accumulator", tool = %name, call_id = %id, error = %err, "Tool arguments replaced with empty object");
                    }
                    content_blocks.push(ContentBlock::ToolInvocation {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    });
                    pending_tool_calls.push(PendingToolCall {
                        id,
                        name,
                        arguments,
                        argument_error,
                    });
                }
            }
        }

        Ok(TurnOutput {
            content_blocks,
            pending_tool_calls,
            usage,
            stop_reason,
            metadata: self.done_metadata,
        })
    }

    fn open(&mut self, index: usize, block: BlockBuilder) -> Result<()> {
        if let Some(existing) = self.blocks.get(&index) {
            return Err(RelayError::ProviderProtocol(format!(
                "block index {index} reused ({} already started)",
                existing.kind()
            )));
        }
        self.blocks.insert(index, block);
        Ok(())
    }

    fn open_block(&mut self, index: usize, expected: &str) -> Result<&mut BlockBuilder> {
        match self.blocks.get_mut(&index) {
            Some(block) if block.is_open() => Ok(block),
            Some(block) => Err(RelayError::ProviderProtocol(format!(
                "{expected} event for closed {} block {index}",
                block.kind()
            ))),
            None => Err(RelayError::ProviderProtocol(format!(
                "{expected} event for unknown block {index}"
            ))),
        }
    }

    fn stop(&mut self, index: usize, expected: &str) -> Result<()> {
        let block = self.open_block(index, expected)?;
        if block.kind() != expected {
            return Err(kind_mismatch(index, expected, block));
        }
        block.close();
        Ok(())
    }
}

fn kind_mismatch(index: usize, expected: &str, found: &BlockBuilder) -> RelayError {
    RelayError::ProviderProtocol(format!(
        "{expected} event for {} block {index}",
        found.kind()
    ))
}

/// Map an `error` event onto the provider error taxonomy
pub fn classify_stream_error(message: String, metadata: &Metadata) -> RelayError {
    let kind = metadata.get("kind").and_then(Value::as_str).unwrap_or("");
    match kind {
        "rate_limited" => RelayError::ProviderRateLimited(message),
        "unavailable" | "overloaded" => RelayError::ProviderUnavailable(message),
        "protocol" => RelayError::ProviderProtocol(message),
        _ => RelayError::Provider(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_tool_input_is_an_empty_object() {
        assert_eq!(parse_tool_arguments("  "), (json!({}), None));
    }

    #[test]
    fn non_object_tool_input_is_rejected() {
        let (args, err) = parse_tool_arguments("[1,2]");
        assert_eq!(args, json!({}));
        assert!(err.unwrap().contains("JSON object"));
    }

    #[test]
    fn error_kinds_are_classified() {
        let mut m = Metadata::new();
        m.insert("kind".into(), json!("rate_limited"));
        assert!(matches!(
            classify_stream_error("slow down".into(), &m),
            RelayError::ProviderRateLimited(_)
        ));
        assert!(matches!(
            classify_stream_error("boom".into(), &Metadata::new()),
            RelayError::Provider(_)
        ));
    }
}
