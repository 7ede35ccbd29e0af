use relay_core::{ScriptedProvider, StopReason, StreamEvent, UsageUpdate};
use serde_json::json;

/// Canned backend for running the demo without network access.
///
/// Prompts mentioning "list" or "files" get a `list_dir` round trip first so
/// the tool path can be exercised offline.
pub fn echo_provider(prompt: &str) -> ScriptedProvider {
    let words = prompt.split_whitespace().count() as u64;
    let wants_listing = {
        let p = prompt.to_ascii_lowercase();
        p.contains("list") || p.contains("files")
    };

    let mut turns = Vec::new();
    if wants_listing {
        turns.push(vec![
            StreamEvent::text_start(0),
            StreamEvent::text_delta(0, "Let me look at the working directory."),
            StreamEvent::TextStop { block_index: 0 },
            StreamEvent::tool_use_start(1, "call_offline_1", "list_dir"),
            StreamEvent::tool_use_delta(1, json!({"path": "."}).to_string()),
            StreamEvent::ToolUseStop { block_index: 1 },
            StreamEvent::Usage(UsageUpdate::tokens(words, 12)),
            StreamEvent::done(StopReason::ToolUse),
        ]);
    }
    turns.push(vec![
        StreamEvent::thinking_start(0),
        StreamEvent::thinking_delta(0, "Offline mode: echoing the prompt."),
        StreamEvent::ThinkingStop { block_index: 0 },
        StreamEvent::text_start(1),
        StreamEvent::text_delta(1, "(offline) You said: "),
        StreamEvent::text_delta(1, prompt),
        StreamEvent::TextStop { block_index: 1 },
        StreamEvent::Usage(UsageUpdate::tokens(words, words + 4)),
        StreamEvent::done(StopReason::EndTurn),
    ]);
    ScriptedProvider::new(turns).with_name("offline")
}
