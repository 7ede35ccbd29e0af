//! Tool execution boundary.
//!
//! The orchestrator only sees [`ToolExecutor`]; [`ToolRegistry`] is the
//! bundled implementation backed by named [`Tool`]s.

pub mod error;
pub mod native;
pub mod registry;
pub mod traits;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::ToolSchema;

// Re-export common types
pub use error::{ToolError, ToolResult};
pub use registry::ToolRegistry;
pub use traits::Tool;

/// Where and for whom a tool call runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub working_directory: PathBuf,
    pub conversation_id: String,
}

/// Result of one tool call as seen by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub output: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tool descriptions offered to the backend
    fn schemas(&self) -> Vec<ToolSchema>;

    /// Run one tool. Failures are reported in the outcome, never returned.
    async fn execute(&self, name: &str, arguments: Value, ctx: &ExecutionContext) -> ToolOutcome;
}
