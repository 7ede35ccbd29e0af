use relay_core::event::EventType;
use relay_core::{Metadata, StopReason, StreamEvent, UsageUpdate, WireEvent};
use relay_core::Result;
use serde_json::json;

fn sample_events() -> Vec<StreamEvent> {
    let mut extras = Metadata::new();
    extras.insert("citations".into(), json!([{"url": "https://example.com"}]));
    vec![
        StreamEvent::thinking_start(0),
        StreamEvent::thinking_delta(0, "let me think"),
        StreamEvent::ThinkingSignature {
            block_index: 0,
            content: "sig==".into(),
        },
        StreamEvent::ThinkingStop { block_index: 0 },
        StreamEvent::TextStart {
            block_index: 1,
            metadata: extras,
        },
        StreamEvent::text_delta(1, "hello"),
        StreamEvent::TextStop { block_index: 1 },
        StreamEvent::tool_use_start(2, "call_1", "list_dir"),
        StreamEvent::tool_use_delta(2, "{\"path\":"),
        StreamEvent::ToolUseStop { block_index: 2 },
        StreamEvent::Usage(UsageUpdate {
            input_tokens: Some(12),
            output_tokens: None,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: Some(4),
        }),
        StreamEvent::done(StopReason::ToolUse),
        StreamEvent::Done {
            stop_reason: StopReason::Other("pause_turn".into()),
            metadata: Metadata::new(),
        },
        StreamEvent::error_with_kind("slow down", "rate_limited"),
        StreamEvent::ToolResult {
            tool_call_id: "call_1".into(),
            output: "a.txt\nb.txt".into(),
            is_error: false,
        },
    ]
}

#[test]
fn every_event_survives_the_wire() -> Result<()> {
    for event in sample_events() {
        let encoded = serde_json::to_string(&event)?;
        let decoded: StreamEvent = serde_json::from_str(&encoded)?;
        assert_eq!(decoded, event, "wire form was {encoded}");
    }
    Ok(())
}

#[test]
fn tool_use_start_carries_ids_in_metadata() -> Result<()> {
    let value = serde_json::to_value(StreamEvent::tool_use_start(3, "toolu_9", "read_file"))?;
    assert_eq!(
        value,
        json!({
            "type": "tool_use_start",
            "block_index": 3,
            "metadata": {"tool_call_id": "toolu_9", "tool_name": "read_file"}
        })
    );
    Ok(())
}

#[test]
fn usage_and_done_are_flat_metadata() -> Result<()> {
    let usage = serde_json::to_value(StreamEvent::Usage(UsageUpdate::tokens(5, 7)))?;
    assert_eq!(
        usage,
        json!({"type": "usage", "metadata": {"input_tokens": 5, "output_tokens": 7}})
    );

    let done = serde_json::to_value(StreamEvent::done(StopReason::EndTurn))?;
    assert_eq!(
        done,
        json!({"type": "done", "metadata": {"stop_reason": "end_turn"}})
    );
    Ok(())
}

#[test]
fn block_events_without_index_are_rejected() {
    let raw = json!({"type": "text_delta", "content": "orphan"});
    let parsed: std::result::Result<StreamEvent, _> = serde_json::from_value(raw);
    assert!(parsed.is_err());

    let missing_name = json!({
        "type": "tool_use_start",
        "block_index": 0,
        "metadata": {"tool_call_id": "x"}
    });
    assert!(serde_json::from_value::<StreamEvent>(missing_name).is_err());
}

#[test]
fn event_helpers_report_type_and_terminality() -> Result<()> {
    let wire: WireEvent = serde_json::from_value(json!({"type": "thinking_stop", "block_index": 4}))?;
    assert_eq!(wire.event_type, EventType::ThinkingStop);

    let event = StreamEvent::try_from(wire)?;
    assert_eq!(event.block_index(), Some(4));
    assert!(!event.is_terminal());
    assert!(StreamEvent::done(StopReason::EndTurn).is_terminal());
    assert!(StreamEvent::error("boom").is_terminal());
    assert_eq!(StreamEvent::error("boom").block_index(), None);
    Ok(())
}
