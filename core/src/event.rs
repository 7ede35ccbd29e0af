//! Normalized stream event protocol.
//!
//! Every provider client translates its native stream into [`StreamEvent`]s.
//! On the wire (broker frames, logs) events are flattened into [`WireEvent`]:
//! `{type, block_index?, content?, metadata?}`.

use crate::conversation::StopReason;
use crate::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Free-form backend extras carried alongside an event
pub type Metadata = serde_json::Map<String, Value>;

/// Token counters reported mid-stream. Absent counters leave the accumulated
/// value untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

impl UsageUpdate {
    pub fn tokens(input: u64, output: u64) -> Self {
        Self {
            input_tokens: Some(input),
            output_tokens: Some(output),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.cache_creation_input_tokens.is_none()
            && self.cache_read_input_tokens.is_none()
    }
}

/// One normalized event emitted by a provider client (or, for `ToolResult`,
/// by the orchestrator itself).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireEvent", try_from = "WireEvent")]
pub enum StreamEvent {
    ThinkingStart {
        block_index: usize,
        metadata: Metadata,
    },
    ThinkingDelta {
        block_index: usize,
        content: String,
    },
    ThinkingSignature {
        block_index: usize,
        content: String,
    },
    ThinkingStop {
        block_index: usize,
    },
    TextStart {
        block_index: usize,
        metadata: Metadata,
    },
    TextDelta {
        block_index: usize,
        content: String,
    },
    TextStop {
        block_index: usize,
    },
    ToolUseStart {
        block_index: usize,
        tool_call_id: String,
        tool_name: String,
        metadata: Metadata,
    },
    ToolUseDelta {
        block_index: usize,
        content: String,
    },
    ToolUseStop {
        block_index: usize,
    },
    Usage(UsageUpdate),
    Done {
        stop_reason: StopReason,
        metadata: Metadata,
    },
    Error {
        message: String,
        metadata: Metadata,
    },
    ToolResult {
        tool_call_id: String,
        output: String,
        is_error: bool,
    },
}

impl StreamEvent {
    pub fn thinking_start(block_index: usize) -> Self {
        StreamEvent::ThinkingStart {
            block_index,
            metadata: Metadata::new(),
        }
    }

    pub fn thinking_delta(block_index: usize, content: impl Into<String>) -> Self {
        StreamEvent::ThinkingDelta {
            block_index,
            content: content.into(),
        }
    }

    pub fn text_start(block_index: usize) -> Self {
        StreamEvent::TextStart {
            block_index,
            metadata: Metadata::new(),
        }
    }

    pub fn text_delta(block_index: usize, content: impl Into<String>) -> Self {
        StreamEvent::TextDelta {
            block_index,
            content: content.into(),
        }
    }

    pub fn tool_use_start(
        block_index: usize,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        StreamEvent::ToolUseStart {
            block_index,
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn tool_use_delta(block_index: usize, content: impl Into<String>) -> Self {
        StreamEvent::ToolUseDelta {
            block_index,
            content: content.into(),
        }
    }

    pub fn done(stop_reason: StopReason) -> Self {
        StreamEvent::Done {
            stop_reason,
            metadata: Metadata::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            metadata: Metadata::new(),
        }
    }

    /// Error event tagged with a failure kind (`rate_limited`, `unavailable`, ...)
    pub fn error_with_kind(message: impl Into<String>, kind: &str) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("kind".into(), Value::String(kind.to_string()));
        StreamEvent::Error {
            message: message.into(),
            metadata,
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            StreamEvent::ThinkingStart { .. } => EventType::ThinkingStart,
            StreamEvent::ThinkingDelta { .. } => EventType::ThinkingDelta,
            StreamEvent::ThinkingSignature { .. } => EventType::ThinkingSignature,
            StreamEvent::ThinkingStop { .. } => EventType::ThinkingStop,
            StreamEvent::TextStart { .. } => EventType::TextStart,
            StreamEvent::TextDelta { .. } => EventType::TextDelta,
            StreamEvent::TextStop { .. } => EventType::TextStop,
            StreamEvent::ToolUseStart { .. } => EventType::ToolUseStart,
            StreamEvent::ToolUseDelta { .. } => EventType::ToolUseDelta,
            StreamEvent::ToolUseStop { .. } => EventType::ToolUseStop,
            StreamEvent::Usage(_) => EventType::Usage,
            StreamEvent::Done { .. } => EventType::Done,
            StreamEvent::Error { .. } => EventType::Error,
            StreamEvent::ToolResult { .. } => EventType::ToolResult,
        }
    }

    pub fn block_index(&self) -> Option<usize> {
        match self {
            StreamEvent::ThinkingStart { block_index, .. }
            | StreamEvent::ThinkingDelta { block_index, .. }
            | StreamEvent::ThinkingSignature { block_index, .. }
            | StreamEvent::ThinkingStop { block_index }
            | StreamEvent::TextStart { block_index, .. }
            | StreamEvent::TextDelta { block_index, .. }
            | StreamEvent::TextStop { block_index }
            | StreamEvent::ToolUseStart { block_index, .. }
            | StreamEvent::ToolUseDelta { block_index, .. }
            | StreamEvent::ToolUseStop { block_index } => Some(*block_index),
            StreamEvent::Usage(_)
            | StreamEvent::Done { .. }
            | StreamEvent::Error { .. }
            | StreamEvent::ToolResult { .. } => None,
        }
    }

    /// `done` and `error` end a provider turn
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// Event type vocabulary shared by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ThinkingStart,
    ThinkingDelta,
    ThinkingSignature,
    ThinkingStop,
    TextStart,
    TextDelta,
    TextStop,
    ToolUseStart,
    ToolUseDelta,
    ToolUseStop,
    Usage,
    Done,
    Error,
    ToolResult,
}

/// Flat wire representation consumed by real-time transports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl WireEvent {
    fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            block_index: None,
            content: None,
            metadata: None,
        }
    }

    fn at(mut self, block_index: usize) -> Self {
        self.block_index = Some(block_index);
        self
    }

    fn with_content(mut self, content: String) -> Self {
        self.content = Some(content);
        self
    }

    fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = if metadata.is_empty() {
            None
        } else {
            Some(metadata)
        };
        self
    }
}

impl From<StreamEvent> for WireEvent {
    fn from(event: StreamEvent) -> Self {
        let ty = event.event_type();
        match event {
            StreamEvent::ThinkingStart {
                block_index,
                metadata,
            }
            | StreamEvent::TextStart {
                block_index,
                metadata,
            } => WireEvent::new(ty).at(block_index).with_metadata(metadata),
            StreamEvent::ThinkingDelta {
                block_index,
                content,
            }
            | StreamEvent::ThinkingSignature {
                block_index,
                content,
            }
            | StreamEvent::TextDelta {
                block_index,
                content,
            }
            | StreamEvent::ToolUseDelta {
                block_index,
                content,
            } => WireEvent::new(ty).at(block_index).with_content(content),
            StreamEvent::ThinkingStop { block_index }
            | StreamEvent::TextStop { block_index }
            | StreamEvent::ToolUseStop { block_index } => WireEvent::new(ty).at(block_index),
            StreamEvent::ToolUseStart {
                block_index,
                tool_call_id,
                tool_name,
                mut metadata,
            } => {
                metadata.insert("tool_call_id".into(), Value::String(tool_call_id));
                metadata.insert("tool_name".into(), Value::String(tool_name));
                WireEvent::new(ty).at(block_index).with_metadata(metadata)
            }
            StreamEvent::Usage(usage) => {
                let metadata = match serde_json::to_value(usage) {
                    Ok(Value::Object(map)) => map,
                    _ => Metadata::new(),
                };
                WireEvent::new(ty).with_metadata(metadata)
            }
            StreamEvent::Done {
                stop_reason,
                mut metadata,
            } => {
                metadata.insert("stop_reason".into(), Value::String(stop_reason.into()));
                WireEvent::new(ty).with_metadata(metadata)
            }
            StreamEvent::Error { message, metadata } => WireEvent::new(ty)
                .with_content(message)
                .with_metadata(metadata),
            StreamEvent::ToolResult {
                tool_call_id,
                output,
                is_error,
            } => {
                let mut metadata = Metadata::new();
                metadata.insert("tool_call_id".into(), Value::String(tool_call_id));
                metadata.insert("is_error".into(), json!(is_error));
                WireEvent::new(ty)
                    .with_content(output)
                    .with_metadata(metadata)
            }
        }
    }
}

impl TryFrom<WireEvent> for StreamEvent {
    type Error = RelayError;

    fn try_from(wire: WireEvent) -> Result<Self, RelayError> {
        let ty = wire.event_type;
        let mut metadata = wire.metadata.unwrap_or_default();
        let index = || {
            wire.block_index.ok_or_else(|| {
                RelayError::ProviderProtocol(format!("{ty:?} event without block_index"))
            })
        };
        let content = || wire.content.clone().unwrap_or_default();

        let event = match ty {
            EventType::ThinkingStart => StreamEvent::ThinkingStart {
                block_index: index()?,
                metadata,
            },
            EventType::ThinkingDelta => StreamEvent::ThinkingDelta {
                block_index: index()?,
                content: content(),
            },
            EventType::ThinkingSignature => StreamEvent::ThinkingSignature {
                block_index: index()?,
                content: content(),
            },
            EventType::ThinkingStop => StreamEvent::ThinkingStop {
                block_index: index()?,
            },
            EventType::TextStart => StreamEvent::TextStart {
                block_index: index()?,
                metadata,
            },
            EventType::TextDelta => StreamEvent::TextDelta {
                block_index: index()?,
                content: content(),
            },
            EventType::TextStop => StreamEvent::TextStop {
                block_index: index()?,
            },
            EventType::ToolUseStart => {
                let tool_call_id = take_string(&mut metadata, "tool_call_id")?;
                let tool_name = take_string(&mut metadata, "tool_name")?;
                StreamEvent::ToolUseStart {
                    block_index: index()?,
                    tool_call_id,
                    tool_name,
                    metadata,
                }
            }
            EventType::ToolUseDelta => StreamEvent::ToolUseDelta {
                block_index: index()?,
                content: content(),
            },
            EventType::ToolUseStop => StreamEvent::ToolUseStop {
                block_index: index()?,
            },
            EventType::Usage => {
                StreamEvent::Usage(serde_json::from_value(Value::Object(metadata))?)
            }
            EventType::Done => {
                let stop_reason = StopReason::parse(&take_string(&mut metadata, "stop_reason")?);
                StreamEvent::Done {
                    stop_reason,
                    metadata,
                }
            }
            EventType::Error => StreamEvent::Error {
                message: content(),
                metadata,
            },
            EventType::ToolResult => {
                let tool_call_id = take_string(&mut metadata, "tool_call_id")?;
                let is_error = metadata
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                StreamEvent::ToolResult {
                    tool_call_id,
                    output: content(),
                    is_error,
                }
            }
        };
        Ok(event)
    }
}

fn take_string(metadata: &mut Metadata, key: &str) -> Result<String, RelayError> {
    match metadata.remove(key) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(RelayError::ProviderProtocol(format!(
            "missing '{key}' in event metadata"
        ))),
    }
}
