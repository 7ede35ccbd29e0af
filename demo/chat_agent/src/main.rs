mod offline;

use relay_core::tools::native::register_filesystem_tools;
use relay_core::{
    init_tracing, AnthropicClient, BrokerFrame, Conversation, ConversationStore, EventBusBroker,
    FramePayload, InMemoryStore, OllamaClient, OpenAiChatClient, OpenAiResponsesClient,
    Orchestrator, ProviderClient, ProviderKind, ProviderSettings, RelayConfig, StreamEvent,
    ToolRegistry, TurnTicket,
};
use std::io::Write;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

fn build_provider(settings: &ProviderSettings, prompt: &str) -> Arc<dyn ProviderClient> {
    match settings.kind {
        ProviderKind::Anthropic => Arc::new(AnthropicClient::new(settings)),
        ProviderKind::Openai => Arc::new(OpenAiChatClient::new(settings)),
        ProviderKind::OpenaiResponses => Arc::new(OpenAiResponsesClient::new(settings)),
        ProviderKind::Ollama => Arc::new(OllamaClient::new(settings)),
        ProviderKind::Scripted => Arc::new(offline::echo_provider(prompt)),
    }
}

/// Print frames as they arrive until the stream terminates
async fn render_frames(mut rx: mpsc::Receiver<BrokerFrame>) {
    let mut stdout = std::io::stdout();
    while let Some(frame) = rx.recv().await {
        match &frame.payload {
            FramePayload::StreamStart { metadata } => {
                info!(target: "chat_agent", ?metadata, "Stream started");
            }
            FramePayload::Event { event } => match event {
                StreamEvent::ThinkingDelta { content, .. } => {
                    eprint!("{content}");
                }
                StreamEvent::ThinkingStop { .. } => eprintln!(),
                StreamEvent::TextDelta { content, .. } => {
                    print!("{content}");
                    let _ = stdout.flush();
                }
                StreamEvent::TextStop { .. } => println!(),
                StreamEvent::ToolUseStart { tool_name, .. } => {
                    println!("[tool] {tool_name}");
                }
                StreamEvent::ToolResult {
                    output, is_error, ..
                } => {
                    let label = if *is_error { "tool error" } else { "tool result" };
                    let preview: String = output.chars().take(400).collect();
                    println!("[{label}] {preview}");
                }
                StreamEvent::Usage(usage) => {
                    info!(target: "chat_agent", ?usage, "Usage");
                }
                StreamEvent::Error { message, .. } => {
                    error!(target: "chat_agent", %message, "Provider error");
                }
                _ => {}
            },
            FramePayload::StreamComplete => {
                info!(target: "chat_agent", "Stream complete");
                break;
            }
            FramePayload::StreamFailed { reason } => {
                error!(target: "chat_agent", %reason, "Stream failed");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info,relay_core=info,chat_agent=info");

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        eprintln!("usage: chat_agent <prompt>");
        std::process::exit(2);
    }

    // Defaults + env + optional TOML overlay
    let cfg = RelayConfig::load();
    let provider = build_provider(&cfg.provider, &prompt);
    if !provider.is_available() {
        warn!(target: "chat_agent", provider = provider.name(), "Provider is not fully configured; the first call will likely fail");
    }
    info!(target: "chat_agent", provider = provider.name(), model = %cfg.provider.model, "Starting chat agent");

    let registry = ToolRegistry::new().with_timeout(cfg.tools.timeout());
    register_filesystem_tools(&registry).await;

    let broker = Arc::new(EventBusBroker::new());
    let store = Arc::new(InMemoryStore::new());
    let workdir = std::fs::canonicalize(&cfg.tools.working_directory)?;
    let conversation = store
        .create_conversation(Conversation::new(
            provider.name(),
            cfg.provider.model.clone(),
            workdir,
        ))
        .await?;

    let orchestrator = Arc::new(Orchestrator::new(
        provider,
        Arc::new(registry),
        broker.clone(),
        store.clone(),
        cfg.orchestrator.clone(),
    ));

    let (_sub_id, rx) = broker.subscribe(&conversation.id).await?;
    let printer = tokio::spawn(render_frames(rx));

    let handle = match orchestrator
        .start_conversation_turn(&conversation.id, Some(prompt), None)
        .await?
    {
        TurnTicket::Started(handle) => handle,
        TurnTicket::AlreadyProcessing => {
            warn!(target: "chat_agent", "Conversation already processing");
            return Ok(());
        }
    };

    tokio::select! {
        result = handle => {
            match result? {
                Ok(outcome) => info!(target: "chat_agent", ?outcome, "Run finished"),
                Err(e) => error!(target: "chat_agent", kind = e.kind(), error = %e, "Run failed"),
            }
        }
        _ = signal::ctrl_c() => {
            info!(target: "chat_agent", "Shutting down...");
            printer.abort();
            return Ok(());
        }
    }

    let _ = printer.await;
    let stats = orchestrator.stats();
    info!(target: "chat_agent", stats = %serde_json::to_string(&stats)?, "Run stats");
    Ok(())
}
