use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ToolError {
    /// Short label used as a metric attribute
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "not_found",
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::ExecutionFailed(_) => "execution_failed",
            ToolError::PermissionDenied(_) => "permission_denied",
            ToolError::Timeout(_) => "timeout",
            ToolError::Internal(_) => "internal",
        }
    }
}

pub type ToolResult<T> = Result<T, ToolError>;
