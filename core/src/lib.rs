// Relay Core Library
// Streaming conversation orchestrator runtime

pub mod accumulator;
pub mod broker;
pub mod config;
pub mod conversation;
pub mod event;
pub mod orchestrator;
pub mod provider;
pub mod store;
pub mod telemetry;
pub mod tools;

// Export core types
pub use accumulator::{PendingToolCall, TurnAccumulator, TurnOutput};
pub use broker::{BrokerFrame, BrokerStats, EventBusBroker, FramePayload, StreamBroker};
pub use config::{OrchestratorConfig, ProviderKind, ProviderSettings, RelayConfig, ToolsConfig};
pub use conversation::{
    ContentBlock, Conversation, ConversationStatus, Message, MessageContent, MessageRole,
    StopReason, TokenUsage,
};
pub use event::{Metadata, StreamEvent, UsageUpdate, WireEvent};
pub use orchestrator::{Orchestrator, RunOutcome, TurnTicket};
pub use provider::{
    AnthropicClient, ConversationRequest, EventStream, OllamaClient, OpenAiChatClient,
    OpenAiResponsesClient, ProviderClient, Reasoning, ReasoningEffort, RequestOptions,
    ScriptedProvider, ScriptedTurn, ToolSchema,
};
pub use store::{ConversationStore, InMemoryStore, NewMessage};
pub use telemetry::{init_tracing, RunStats, RunStatsSnapshot};
pub use tools::{ExecutionContext, Tool, ToolError, ToolExecutor, ToolOutcome, ToolRegistry};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider protocol error: {0}")]
    ProviderProtocol(String),

    #[error("Provider rate limited: {0}")]
    ProviderRateLimited(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Turn limit exceeded after {max_turns} turns")]
    TurnLimitExceeded { max_turns: u32 },

    #[error("Run timed out after {timeout_ms}ms")]
    StreamTimeout { timeout_ms: u64 },

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Stable machine-readable kind, used in failure terminals and logs
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::ProviderUnavailable(_) => "provider_unavailable",
            RelayError::ProviderProtocol(_) => "provider_protocol_error",
            RelayError::ProviderRateLimited(_) => "provider_rate_limited",
            RelayError::Provider(_) => "provider_error",
            RelayError::TurnLimitExceeded { .. } => "turn_limit_exceeded",
            RelayError::StreamTimeout { .. } => "stream_timeout",
            RelayError::ConversationNotFound(_) => "conversation_not_found",
            RelayError::Broker(_) => "broker_error",
            RelayError::Storage(_) => "storage_error",
            RelayError::Config(_) => "config_error",
            RelayError::Io(_) => "io_error",
            RelayError::Serialization(_) => "serialization_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
