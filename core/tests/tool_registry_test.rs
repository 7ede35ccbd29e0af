use async_trait::async_trait;
use relay_core::tools::native::register_filesystem_tools;
use relay_core::tools::ToolResult;
use relay_core::{ExecutionContext, Tool, ToolError, ToolExecutor, ToolRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn ctx() -> ExecutionContext {
    ExecutionContext {
        working_directory: std::env::temp_dir(),
        conversation_id: "conv-tools".to_string(),
    }
}

// Echoes the `text` argument back as a plain string
struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> String {
        "echo".to_string()
    }

    fn description(&self) -> String {
        "Echo text".to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"text": {"type": "string"}}})
    }

    async fn call(&self, arguments: Value, _ctx: &ExecutionContext) -> ToolResult<Value> {
        Ok(arguments["text"].clone())
    }
}

// Never finishes within the registry timeout
struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> String {
        "slow".to_string()
    }

    fn description(&self) -> String {
        "Sleeps".to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    async fn call(&self, _arguments: Value, _ctx: &ExecutionContext) -> ToolResult<Value> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(json!({"slept": true}))
    }
}

// Always fails
struct BrokenTool;

#[async_trait]
impl Tool for BrokenTool {
    fn name(&self) -> String {
        "broken".to_string()
    }

    fn description(&self) -> String {
        "Fails".to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    async fn call(&self, _arguments: Value, _ctx: &ExecutionContext) -> ToolResult<Value> {
        Err(ToolError::ExecutionFailed("disk on fire".to_string()))
    }
}

#[tokio::test]
async fn test_registry_register_and_replace() {
    let registry = ToolRegistry::new();
    assert!(registry.is_empty());

    registry.register(Arc::new(EchoTool)).await;
    registry.register(Arc::new(EchoTool)).await;
    assert_eq!(registry.len(), 1);
    assert!(registry.get("echo").is_some());
    assert!(registry.get("missing").is_none());
}

#[tokio::test]
async fn test_execute_renders_string_and_json_output() {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool)).await;

    let outcome = registry
        .execute("echo", json!({"text": "plain"}), &ctx())
        .await;
    assert!(!outcome.is_error);
    assert_eq!(outcome.output, "plain");

    let outcome = registry.execute("echo", json!({"text": 42}), &ctx()).await;
    assert_eq!(outcome.output, "42");
}

#[tokio::test]
async fn test_execute_unknown_tool_is_error_outcome() {
    let registry = ToolRegistry::new();
    let outcome = registry.execute("nope", json!({}), &ctx()).await;
    assert!(outcome.is_error);
    assert_eq!(outcome.output, "Tool not found: nope");
}

#[tokio::test]
async fn test_execute_failure_is_error_outcome() {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(BrokenTool)).await;
    let outcome = registry.execute("broken", json!({}), &ctx()).await;
    assert!(outcome.is_error);
    assert!(outcome.output.contains("disk on fire"));
}

#[tokio::test]
async fn test_call_times_out() {
    let registry = ToolRegistry::new().with_timeout(Duration::from_millis(20));
    registry.register(Arc::new(SlowTool)).await;

    let result = registry.call("slow", json!({}), &ctx()).await;
    assert!(matches!(result, Err(ToolError::Timeout(20))));

    let outcome = registry.execute("slow", json!({}), &ctx()).await;
    assert!(outcome.is_error);
    assert_eq!(outcome.output, "Timed out after 20ms");
}

#[tokio::test]
async fn test_schemas_sorted_by_name() {
    let registry = ToolRegistry::new();
    register_filesystem_tools(&registry).await;
    registry.register(Arc::new(EchoTool)).await;

    let names: Vec<String> = registry.schemas().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["echo", "list_dir", "read_file", "write_file"]);

    let read = registry
        .schemas()
        .into_iter()
        .find(|s| s.name == "read_file")
        .unwrap();
    assert_eq!(read.input_schema["required"], json!(["path"]));
}
