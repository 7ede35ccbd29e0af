//! Frame-level tests for the backend translators, folded through the
//! accumulator the way the orchestrator consumes them.

use relay_core::provider::anthropic::{self, AnthropicTranslator};
use relay_core::provider::ollama::{self, OllamaTranslator};
use relay_core::provider::openai::{self, OpenAiChatTranslator};
use relay_core::provider::responses::{self, ResponsesTranslator};
use relay_core::provider::FrameTranslator;
use relay_core::{
    ContentBlock, Conversation, Message, MessageContent, MessageRole, Reasoning, ReasoningEffort,
    RelayError, RequestOptions, Result, StopReason, StreamEvent, ToolSchema, TurnAccumulator,
};
use serde_json::json;

fn run_frames<T: FrameTranslator>(
    translator: &mut T,
    frames: &[(&str, serde_json::Value)],
) -> Result<Vec<StreamEvent>> {
    let mut events = Vec::new();
    for (name, data) in frames {
        events.extend(translator.translate(name, &data.to_string())?);
    }
    Ok(events)
}

fn fold(events: &[StreamEvent]) -> Result<relay_core::TurnOutput> {
    let mut acc = TurnAccumulator::new();
    for e in events {
        acc.fold(e)?;
    }
    acc.finish()
}

fn history() -> Vec<Message> {
    let conv = Conversation::new("test", "m", "/tmp");
    let msg = |seq, role, content| Message {
        id: format!("m{seq}"),
        conversation_id: conv.id.clone(),
        sequence: seq,
        role,
        content,
        usage: None,
        stop_reason: None,
        created_at: conv.created_at,
    };
    vec![
        msg(1, MessageRole::User, MessageContent::Text("list files".into())),
        msg(
            2,
            MessageRole::Assistant,
            MessageContent::Blocks(vec![
                ContentBlock::Reasoning {
                    text: "need a listing".into(),
                    signature: Some("sig".into()),
                },
                ContentBlock::text("Checking."),
                ContentBlock::ToolInvocation {
                    id: "call_1".into(),
                    name: "list_dir".into(),
                    arguments: json!({"path": "."}),
                },
            ]),
        ),
        msg(
            3,
            MessageRole::Tool,
            MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_call_id: "call_1".into(),
                output: "a.txt".into(),
                is_error: false,
            }]),
        ),
    ]
}

fn options() -> RequestOptions {
    RequestOptions {
        system: "be brief".into(),
        tools: vec![ToolSchema {
            name: "list_dir".into(),
            description: "List files".into(),
            input_schema: json!({"type": "object"}),
        }],
        max_tokens: 4096,
        reasoning: Some(Reasoning::Effort(ReasoningEffort::Low)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Anthropic
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn anthropic_tool_use_turn() -> Result<()> {
    let mut t = AnthropicTranslator::new();
    let events = run_frames(
        &mut t,
        &[
            ("message_start", json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": 25, "output_tokens": 1}}})),
            ("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking", "thinking": ""}})),
            ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "list it"}})),
            ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "EqQB"}})),
            ("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
            ("ping", json!({"type": "ping"})),
            ("content_block_start", json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "list_dir", "input": {}}})),
            ("content_block_delta", json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"path\": "}})),
            ("content_block_delta", json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\".\"}"}})),
            ("content_block_stop", json!({"type": "content_block_stop", "index": 1})),
            ("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 40}})),
            ("message_stop", json!({"type": "message_stop"})),
        ],
    )?;
    assert!(t.finished());

    let output = fold(&events)?;
    assert_eq!(output.stop_reason, StopReason::ToolUse);
    assert_eq!(output.usage.input_tokens, 25);
    assert_eq!(output.usage.output_tokens, 40);
    assert_eq!(
        output.content_blocks[0],
        ContentBlock::Reasoning {
            text: "list it".into(),
            signature: Some("EqQB".into())
        }
    );
    assert_eq!(output.pending_tool_calls[0].id, "toolu_1");
    assert_eq!(output.pending_tool_calls[0].arguments, json!({"path": "."}));
    Ok(())
}

#[test]
fn anthropic_error_frame_carries_kind() -> Result<()> {
    let mut t = AnthropicTranslator::new();
    let events = run_frames(
        &mut t,
        &[(
            "error",
            json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
        )],
    )?;
    assert!(t.finished());
    assert!(matches!(
        fold(&events),
        Err(RelayError::ProviderUnavailable(msg)) if msg == "Overloaded"
    ));
    Ok(())
}

#[test]
fn anthropic_unknown_block_keeps_metadata() -> Result<()> {
    let mut t = AnthropicTranslator::new();
    let events = run_frames(
        &mut t,
        &[(
            "content_block_start",
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "web_search_tool_result", "tool_use_id": "srv_1"}}),
        )],
    )?;
    match &events[0] {
        StreamEvent::TextStart { metadata, .. } => {
            assert_eq!(metadata["block_type"], json!("web_search_tool_result"));
            assert_eq!(metadata["tool_use_id"], json!("srv_1"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    Ok(())
}

#[test]
fn anthropic_malformed_frame_is_protocol_error() {
    let mut t = AnthropicTranslator::new();
    let result = t.translate("content_block_delta", "{not json");
    assert!(matches!(result, Err(RelayError::ProviderProtocol(_))));
}

#[test]
fn anthropic_request_renders_history() {
    let body = anthropic::build_request_body("claude", &history(), &options());
    assert_eq!(body["system"], json!("be brief"));
    assert_eq!(body["stream"], json!(true));
    assert_eq!(body["thinking"]["type"], json!("enabled"));
    assert_eq!(body["tools"][0]["input_schema"], json!({"type": "object"}));

    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["content"][0]["type"], json!("thinking"));
    assert_eq!(messages[1]["content"][2]["type"], json!("tool_use"));
    assert_eq!(messages[2]["role"], json!("user"));
    assert_eq!(messages[2]["content"][0]["type"], json!("tool_result"));
    assert_eq!(messages[2]["content"][0]["tool_use_id"], json!("call_1"));
}

#[test]
fn anthropic_thinking_budget_stays_below_max_tokens() {
    for effort in [
        ReasoningEffort::Low,
        ReasoningEffort::Medium,
        ReasoningEffort::High,
    ] {
        let opts = RequestOptions {
            reasoning: Some(Reasoning::Effort(effort)),
            ..RequestOptions::default()
        };
        let body = anthropic::build_request_body("claude", &[], &opts);
        let budget = body["thinking"]["budget_tokens"].as_u64().unwrap();
        let max_tokens = body["max_tokens"].as_u64().unwrap();
        assert!(budget < max_tokens, "{effort:?}: {budget} >= {max_tokens}");
        assert!(budget >= 1024);
    }

    // Too little room for the minimum budget: thinking is left out
    let opts = RequestOptions {
        max_tokens: 512,
        reasoning: Some(Reasoning::BudgetTokens(4096)),
        ..RequestOptions::default()
    };
    let body = anthropic::build_request_body("claude", &[], &opts);
    assert!(body.get("thinking").is_none());
    assert_eq!(body["max_tokens"], json!(512));
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI Chat Completions
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn openai_chat_synthesizes_block_indices() -> Result<()> {
    let mut t = OpenAiChatTranslator::new();
    let chunk = |delta: serde_json::Value, finish: serde_json::Value| {
        json!({"id": "chatcmpl-1", "model": "gpt", "system_fingerprint": "fp_1", "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]})
    };
    let events = run_frames(
        &mut t,
        &[
            ("", chunk(json!({"role": "assistant", "reasoning_content": "hmm"}), json!(null))),
            ("", chunk(json!({"content": "Let me look."}), json!(null))),
            ("", chunk(json!({"tool_calls": [{"index": 0, "id": "call_x", "type": "function", "function": {"name": "list_dir", "arguments": ""}}]}), json!(null))),
            ("", chunk(json!({"tool_calls": [{"index": 0, "function": {"arguments": "{\"path\":\".\"}"}}]}), json!(null))),
            ("", chunk(json!({}), json!("tool_calls"))),
            ("", json!({"id": "chatcmpl-1", "choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 3}})),
        ],
    )?;
    let mut tail = t.translate("", "[DONE]")?;
    assert!(t.finished());

    let done_metadata = match tail.last() {
        Some(StreamEvent::Done { metadata, .. }) => metadata.clone(),
        other => panic!("expected done, got {other:?}"),
    };
    assert_eq!(done_metadata["system_fingerprint"], json!("fp_1"));

    let mut all = events;
    all.append(&mut tail);
    let output = fold(&all)?;
    assert_eq!(output.stop_reason, StopReason::ToolUse);
    assert_eq!(output.content_blocks.len(), 3);
    assert!(matches!(output.content_blocks[0], ContentBlock::Reasoning { .. }));
    assert_eq!(output.content_blocks[1], ContentBlock::text("Let me look."));
    assert_eq!(output.pending_tool_calls[0].id, "call_x");
    assert_eq!(output.pending_tool_calls[0].arguments, json!({"path": "."}));
    assert_eq!(output.usage.input_tokens, 9);
    assert_eq!(output.usage.output_tokens, 3);
    Ok(())
}

#[test]
fn openai_chat_without_done_marker_still_finishes() -> Result<()> {
    let mut t = OpenAiChatTranslator::new();
    let mut events = run_frames(
        &mut t,
        &[
            ("", json!({"choices": [{"index": 0, "delta": {"content": "hi"}, "finish_reason": null}]})),
            ("", json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "length"}]})),
        ],
    )?;
    events.extend(t.finish()?);
    let output = fold(&events)?;
    assert_eq!(output.stop_reason, StopReason::MaxTokens);

    let mut cut = OpenAiChatTranslator::new();
    run_frames(
        &mut cut,
        &[("", json!({"choices": [{"index": 0, "delta": {"content": "hi"}, "finish_reason": null}]}))],
    )?;
    assert!(matches!(cut.finish(), Err(RelayError::ProviderProtocol(_))));
    Ok(())
}

#[test]
fn openai_chat_request_uses_tool_role() {
    let body = openai::build_request_body("gpt", &history(), &options());
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages[0]["role"], json!("system"));
    assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], json!("list_dir"));
    assert_eq!(
        messages[2]["tool_calls"][0]["function"]["arguments"],
        json!("{\"path\":\".\"}")
    );
    assert_eq!(messages[3]["role"], json!("tool"));
    assert_eq!(messages[3]["tool_call_id"], json!("call_1"));
    assert_eq!(body["stream_options"]["include_usage"], json!(true));
    assert_eq!(body["reasoning_effort"], json!("low"));
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI Responses
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn responses_function_call_turn() -> Result<()> {
    let mut t = ResponsesTranslator::new();
    let frame = |v: serde_json::Value| {
        let name = v["type"].as_str().unwrap_or_default().to_string();
        (name, v)
    };
    let frames = vec![
        frame(json!({"type": "response.created", "response": {"id": "resp_1", "model": "gpt-5"}})),
        frame(json!({"type": "response.output_item.added", "output_index": 0, "item": {"type": "reasoning", "id": "rs_1"}})),
        frame(json!({"type": "response.reasoning_summary_text.delta", "output_index": 0, "delta": "thinking"})),
        frame(json!({"type": "response.output_item.done", "output_index": 0, "item": {"type": "reasoning", "encrypted_content": "enc"}})),
        frame(json!({"type": "response.output_item.added", "output_index": 1, "item": {"type": "function_call", "call_id": "call_r", "name": "read_file"}})),
        frame(json!({"type": "response.function_call_arguments.delta", "output_index": 1, "delta": "{\"path\":\"a.txt\"}"})),
        frame(json!({"type": "response.output_item.done", "output_index": 1, "item": {"type": "function_call"}})),
        frame(json!({"type": "response.completed", "response": {"id": "resp_1", "status": "completed", "usage": {"input_tokens": 30, "output_tokens": 8}}})),
    ];
    let borrowed: Vec<(&str, serde_json::Value)> =
        frames.iter().map(|(n, v)| (n.as_str(), v.clone())).collect();
    let events = run_frames(&mut t, &borrowed)?;
    assert!(t.finished());

    match events.last() {
        Some(StreamEvent::Done { metadata, .. }) => {
            assert_eq!(metadata["response_id"], json!("resp_1"))
        }
        other => panic!("expected done, got {other:?}"),
    }
    let output = fold(&events)?;
    assert_eq!(output.stop_reason, StopReason::ToolUse);
    assert_eq!(
        output.content_blocks[0],
        ContentBlock::Reasoning {
            text: "thinking".into(),
            signature: Some("enc".into())
        }
    );
    assert_eq!(output.pending_tool_calls[0].id, "call_r");
    assert_eq!(output.usage.input_tokens, 30);
    Ok(())
}

#[test]
fn responses_incomplete_maps_to_max_tokens() -> Result<()> {
    let mut t = ResponsesTranslator::new();
    let events = run_frames(
        &mut t,
        &[
            ("", json!({"type": "response.output_item.added", "output_index": 0, "item": {"type": "message"}})),
            ("", json!({"type": "response.output_text.delta", "output_index": 0, "delta": "partial"})),
            ("", json!({"type": "response.incomplete", "response": {"status": "incomplete", "incomplete_details": {"reason": "max_output_tokens"}}})),
        ],
    )?;
    let output = fold(&events)?;
    assert_eq!(output.stop_reason, StopReason::MaxTokens);
    assert_eq!(output.content_blocks, vec![ContentBlock::text("partial")]);
    Ok(())
}

#[test]
fn responses_failure_is_rate_limited() -> Result<()> {
    let mut t = ResponsesTranslator::new();
    let events = run_frames(
        &mut t,
        &[(
            "",
            json!({"type": "response.failed", "response": {"error": {"code": "rate_limit_exceeded", "message": "Too many requests"}}}),
        )],
    )?;
    assert!(t.finished());
    assert!(matches!(fold(&events), Err(RelayError::ProviderRateLimited(_))));
    Ok(())
}

#[test]
fn responses_request_uses_function_call_items() {
    let body = responses::build_request_body("gpt", &history(), &options());
    let input = body["input"].as_array().unwrap();
    assert_eq!(body["instructions"], json!("be brief"));
    assert!(input.iter().any(|i| i["type"] == json!("function_call") && i["call_id"] == json!("call_1")));
    assert!(input.iter().any(|i| i["type"] == json!("function_call_output") && i["output"] == json!("a.txt")));
    assert_eq!(body["tools"][0]["name"], json!("list_dir"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Ollama
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn ollama_tool_calls_become_triples() -> Result<()> {
    let mut t = OllamaTranslator::new();
    let events = run_frames(
        &mut t,
        &[
            ("", json!({"model": "llama3.1", "message": {"role": "assistant", "content": "", "thinking": "look"}, "done": false})),
            ("", json!({"model": "llama3.1", "message": {"role": "assistant", "content": "", "tool_calls": [{"function": {"name": "list_dir", "arguments": {"path": "src"}}}]}, "done": false})),
            ("", json!({"model": "llama3.1", "message": {"role": "assistant", "content": ""}, "done": true, "done_reason": "stop", "prompt_eval_count": 17, "eval_count": 6})),
        ],
    )?;
    assert!(t.finished());

    let output = fold(&events)?;
    assert_eq!(output.stop_reason, StopReason::ToolUse);
    assert_eq!(output.usage.input_tokens, 17);
    assert_eq!(output.usage.output_tokens, 6);
    let call = &output.pending_tool_calls[0];
    assert!(call.id.starts_with("call_"));
    assert_eq!(call.name, "list_dir");
    assert_eq!(call.arguments, json!({"path": "src"}));
    Ok(())
}

#[test]
fn ollama_text_turn_and_error_line() -> Result<()> {
    let mut t = OllamaTranslator::new();
    let events = run_frames(
        &mut t,
        &[
            ("", json!({"message": {"role": "assistant", "content": "Hel"}, "done": false})),
            ("", json!({"message": {"role": "assistant", "content": "lo"}, "done": false})),
            ("", json!({"message": {"role": "assistant", "content": ""}, "done": true, "done_reason": "length"})),
        ],
    )?;
    let output = fold(&events)?;
    assert_eq!(output.content_blocks, vec![ContentBlock::text("Hello")]);
    assert_eq!(output.stop_reason, StopReason::MaxTokens);

    let mut failing = OllamaTranslator::new();
    let events = run_frames(&mut failing, &[("", json!({"error": "model not found"}))])?;
    assert!(failing.finished());
    assert!(matches!(fold(&events), Err(RelayError::Provider(_))));
    Ok(())
}

#[test]
fn ollama_request_sends_thinking_and_tools() {
    let body = ollama::build_request_body("llama3.1", &history(), &options());
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages[2]["thinking"], json!("need a listing"));
    assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], json!({"path": "."}));
    assert_eq!(messages[3]["role"], json!("tool"));
    assert_eq!(body["think"], json!(true));
    assert_eq!(body["options"]["num_predict"], json!(4096));
}
