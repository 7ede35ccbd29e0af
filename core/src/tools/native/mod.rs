pub mod filesystem;

use std::sync::Arc;

pub use filesystem::{resolve_in_workspace, ListDirTool, ReadFileTool, WriteFileTool};

use super::ToolRegistry;

/// Register the working-directory file tools
pub async fn register_filesystem_tools(registry: &ToolRegistry) {
    registry.register(Arc::new(ListDirTool::new())).await;
    registry.register(Arc::new(ReadFileTool::new())).await;
    registry.register(Arc::new(WriteFileTool::new())).await;
}
