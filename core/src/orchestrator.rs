//! Drives one conversation run: bounded provider/tool turn loop with a
//! per-conversation processing claim and a whole-run timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::accumulator::{PendingToolCall, TurnAccumulator, TurnOutput};
use crate::broker::StreamBroker;
use crate::config::OrchestratorConfig;
use crate::conversation::{ContentBlock, ConversationStatus, MessageRole, TokenUsage};
use crate::event::{Metadata, StreamEvent};
use crate::provider::{ConversationRequest, ProviderClient, RequestOptions};
use crate::store::{ConversationStore, NewMessage};
use crate::telemetry::{RunStats, RunStatsSnapshot};
use crate::tools::{ExecutionContext, ToolExecutor, ToolOutcome};
use crate::{RelayError, Result};

/// How a run ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { turns: u32, usage: TokenUsage },
    /// Another run already held the conversation
    Skipped,
}

/// Result of asking for a background run
#[derive(Debug)]
pub enum TurnTicket {
    Started(JoinHandle<Result<RunOutcome>>),
    AlreadyProcessing,
}

impl TurnTicket {
    pub fn is_started(&self) -> bool {
        matches!(self, TurnTicket::Started(_))
    }
}

pub struct Orchestrator {
    provider: Arc<dyn ProviderClient>,
    tools: Arc<dyn ToolExecutor>,
    broker: Arc<dyn StreamBroker>,
    store: Arc<dyn ConversationStore>,
    config: OrchestratorConfig,
    stats: RunStats,

    // OpenTelemetry metrics
    runs_counter: Counter<u64>,
    turns_counter: Counter<u64>,
    tool_calls_counter: Counter<u64>,
    failures_counter: Counter<u64>,
    run_latency: Histogram<f64>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        tools: Arc<dyn ToolExecutor>,
        broker: Arc<dyn StreamBroker>,
        store: Arc<dyn ConversationStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let meter = global::meter("relay.orchestrator");

        let runs_counter = meter
            .u64_counter("relay.orchestrator.runs_total")
            .with_description("Total number of orchestrator runs")
            .init();

        let turns_counter = meter
            .u64_counter("relay.orchestrator.turns_total")
            .with_description("Total number of provider turns")
            .init();

        let tool_calls_counter = meter
            .u64_counter("relay.orchestrator.tool_calls_total")
            .with_description("Total number of tool calls")
            .init();

        let failures_counter = meter
            .u64_counter("relay.orchestrator.failures_total")
            .with_description("Total number of failed runs")
            .init();

        let run_latency = meter
            .f64_histogram("relay.orchestrator.run_latency_ms")
            .with_description("Run wall-clock latency in milliseconds")
            .init();

        Self {
            provider,
            tools,
            broker,
            store,
            config,
            stats: RunStats::new(),
            runs_counter,
            turns_counter,
            tool_calls_counter,
            failures_counter,
            run_latency,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn stats(&self) -> RunStatsSnapshot {
        self.stats.snapshot()
    }

    /// Claim the conversation and run it to a terminal state on the caller's
    /// task. Returns `Skipped` when another run holds the claim.
    pub async fn run(
        &self,
        conversation_id: &str,
        prompt: Option<String>,
        options: Option<RequestOptions>,
    ) -> Result<RunOutcome> {
        let Some(claimed_at) = self.claim(conversation_id).await? else {
            return Ok(RunOutcome::Skipped);
        };
        self.run_claimed(conversation_id, claimed_at, prompt, options)
            .await
    }

    /// Claim the conversation now and run it on a background task. A second
    /// call while the first run is active is a no-op.
    pub async fn start_conversation_turn(
        self: &Arc<Self>,
        conversation_id: &str,
        prompt: Option<String>,
        options: Option<RequestOptions>,
    ) -> Result<TurnTicket> {
        let Some(claimed_at) = self.claim(conversation_id).await? else {
            return Ok(TurnTicket::AlreadyProcessing);
        };
        let this = Arc::clone(self);
        let id = conversation_id.to_string();
        let handle = tokio::spawn(async move {
            this.run_claimed(&id, claimed_at, prompt, options).await
        });
        Ok(TurnTicket::Started(handle))
    }

    /// Fail conversations left in `processing` for longer than `max_age`
    /// (e.g. after a crash). `max_age` should exceed the run timeout.
    pub async fn sweep_stale_runs(&self, max_age: Duration) -> Result<Vec<String>> {
        let max_age_chrono = chrono::Duration::from_std(max_age)
            .map_err(|e| RelayError::Config(format!("invalid max_age: {e}")))?;
        let cutoff = Utc::now() - max_age_chrono;
        let stale = self.store.stale_processing(cutoff).await?;

        let mut reclaimed = Vec::with_capacity(stale.len());
        for (id, claimed_at) in stale {
            let reason = format!(
                "stale_run: processing claim older than {}s reclaimed",
                max_age.as_secs()
            );
            warn!(target: "orchestrator", conversation = %id, %claimed_at, "Reclaiming stale run");
            if !self
                .store
                .finish_processing(
                    &id,
                    claimed_at,
                    ConversationStatus::Failed,
                    Some(reason.clone()),
                )
                .await?
            {
                // Finished or re-claimed since the scan
                continue;
            }
            if let Err(e) = self.broker.fail_stream(&id, &reason).await {
                warn!(target: "orchestrator", conversation = %id, error = %e, "Failed to publish stale-run failure");
            }
            self.failures_counter
                .add(1, &[KeyValue::new("kind", "stale_run")]);
            reclaimed.push(id);
        }
        Ok(reclaimed)
    }

    /// Returns the claim's start time, the token needed to finish it
    async fn claim(&self, conversation_id: &str) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        if self.store.try_begin_processing(conversation_id, now).await? {
            return Ok(Some(now));
        }
        info!(target: "orchestrator", conversation = %conversation_id, "Conversation already processing; skipping");
        self.stats.run_skipped();
        Ok(None)
    }

    /// Drive an already-claimed run and record its terminal state
    #[tracing::instrument(name = "orchestrator.run", skip(self, prompt, options), fields(conversation = %conversation_id, provider = %self.provider.name()))]
    async fn run_claimed(
        &self,
        conversation_id: &str,
        claimed_at: DateTime<Utc>,
        prompt: Option<String>,
        options: Option<RequestOptions>,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        self.stats.run_started();
        self.runs_counter
            .add(1, &[KeyValue::new("provider", self.provider.name().to_string())]);

        let timeout_ms = self.config.run_timeout_ms;
        let result = match tokio::time::timeout(
            self.config.run_timeout(),
            self.drive(conversation_id, prompt, options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RelayError::StreamTimeout { timeout_ms }),
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.run_latency.record(elapsed_ms, &[]);

        match result {
            Ok(outcome) => {
                match self
                    .store
                    .finish_processing(
                        conversation_id,
                        claimed_at,
                        ConversationStatus::Completed,
                        None,
                    )
                    .await
                {
                    Ok(true) => {
                        if let Err(e) = self.broker.complete_stream(conversation_id).await {
                            warn!(target: "orchestrator", conversation = %conversation_id, error = %e, "Failed to publish completion");
                        }
                    }
                    Ok(false) => {
                        warn!(target: "orchestrator", conversation = %conversation_id, "Claim was reclaimed while running; leaving status to its new owner");
                    }
                    Err(err) => {
                        self.fail_run(conversation_id, claimed_at, &err).await;
                        return Err(err);
                    }
                }
                self.stats.run_completed();
                info!(target: "orchestrator", conversation = %conversation_id, latency_ms = %elapsed_ms, ?outcome, "Run completed");
                Ok(outcome)
            }
            Err(err) => {
                self.fail_run(conversation_id, claimed_at, &err).await;
                Err(err)
            }
        }
    }

    async fn fail_run(&self, conversation_id: &str, claimed_at: DateTime<Utc>, err: &RelayError) {
        warn!(target: "orchestrator", conversation = %conversation_id, kind = err.kind(), error = %err, "Run failed");
        self.stats.run_failed();
        self.failures_counter
            .add(1, &[KeyValue::new("kind", err.kind())]);

        match self
            .store
            .finish_processing(
                conversation_id,
                claimed_at,
                ConversationStatus::Failed,
                Some(err.to_string()),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // The sweep already failed this claim and published the terminal
                warn!(target: "orchestrator", conversation = %conversation_id, "Claim was reclaimed while running; not publishing failure");
                return;
            }
            Err(e) => {
                warn!(target: "orchestrator", conversation = %conversation_id, error = %e, "Failed to record failure");
            }
        }
        let reason = format!("{}: {}", err.kind(), err);
        if let Err(e) = self.broker.fail_stream(conversation_id, &reason).await {
            warn!(target: "orchestrator", conversation = %conversation_id, error = %e, "Failed to publish failure");
        }
    }

    /// The bounded turn loop
    async fn drive(
        &self,
        conversation_id: &str,
        prompt: Option<String>,
        options: Option<RequestOptions>,
    ) -> Result<RunOutcome> {
        let conversation = self.store.get_conversation(conversation_id).await?;

        let mut metadata = Metadata::new();
        metadata.insert("provider".into(), json!(self.provider.name()));
        metadata.insert("model".into(), json!(conversation.model));
        metadata.insert("turn_number".into(), json!(conversation.turn_number));
        self.broker.start_stream(conversation_id, metadata).await?;
        self.close_dangling_invocations(conversation_id).await?;

        if let Some(text) = prompt {
            self.store
                .append_message(NewMessage::user(conversation_id, text))
                .await?;
        }

        let mut options = options.unwrap_or_else(|| self.config.request_options());
        if options.tools.is_empty() {
            options.tools = self.tools.schemas();
        }
        let ctx = ExecutionContext {
            working_directory: conversation.working_directory.clone(),
            conversation_id: conversation_id.to_string(),
        };

        let max_turns = self.config.max_turns.max(1);
        let mut usage = TokenUsage::default();
        let mut turn = 0u32;
        loop {
            turn += 1;
            let output = self.stream_turn(conversation_id, &options).await?;

            self.store
                .append_message(NewMessage::assistant(
                    conversation_id,
                    output.content_blocks.clone(),
                    output.usage,
                    output.stop_reason.clone(),
                ))
                .await?;
            self.store.record_turn(conversation_id, &output.usage).await?;
            usage.add(&output.usage);
            self.stats
                .turn(output.usage.input_tokens, output.usage.output_tokens);
            self.turns_counter.add(
                1,
                &[KeyValue::new("stop_reason", output.stop_reason.to_string())],
            );
            info!(
                target: "orchestrator",
                conversation = %conversation_id,
                turn,
                stop_reason = %output.stop_reason,
                blocks = output.content_blocks.len(),
                tool_calls = output.pending_tool_calls.len(),
                "Turn finished"
            );

            if !output.requires_tools() {
                if !output.pending_tool_calls.is_empty() {
                    let ids: Vec<String> = output
                        .pending_tool_calls
                        .iter()
                        .map(|c| c.id.clone())
                        .collect();
                    let reason = format!(
                        "Tool call not executed: turn ended with {}",
                        output.stop_reason
                    );
                    self.record_unexecuted(conversation_id, &ids, &reason)
                        .await?;
                }
                return Ok(RunOutcome::Completed { turns: turn, usage });
            }

            let results = self
                .execute_tools(conversation_id, &output.pending_tool_calls, &ctx)
                .await?;
            self.store
                .append_message(NewMessage::tool_results(conversation_id, results))
                .await?;

            if turn >= max_turns {
                return Err(RelayError::TurnLimitExceeded { max_turns });
            }
        }
    }

    /// A run that died between persisting an assistant turn and its tool
    /// results leaves invocations without results; answer them before the
    /// history goes back to a provider.
    async fn close_dangling_invocations(&self, conversation_id: &str) -> Result<()> {
        let messages = self.store.list_messages(conversation_id).await?;
        let ids: Vec<String> = match messages.last() {
            Some(last) if last.role == MessageRole::Assistant => last
                .tool_invocations()
                .into_iter()
                .map(|(id, _, _)| id.to_string())
                .collect(),
            _ => return Ok(()),
        };
        if ids.is_empty() {
            return Ok(());
        }
        warn!(target: "orchestrator", conversation = %conversation_id, calls = ids.len(), "Closing tool invocations left by an interrupted run");
        self.record_unexecuted(
            conversation_id,
            &ids,
            "Tool call not executed: the previous run ended before it ran",
        )
        .await
    }

    /// Persist an error result for each invocation that will never run
    async fn record_unexecuted(
        &self,
        conversation_id: &str,
        call_ids: &[String],
        reason: &str,
    ) -> Result<()> {
        let mut results = Vec::with_capacity(call_ids.len());
        for id in call_ids {
            self.broker
                .append_event(
                    conversation_id,
                    &StreamEvent::ToolResult {
                        tool_call_id: id.clone(),
                        output: reason.to_string(),
                        is_error: true,
                    },
                )
                .await?;
            results.push(ContentBlock::ToolResult {
                tool_call_id: id.clone(),
                output: reason.to_string(),
                is_error: true,
            });
        }
        self.store
            .append_message(NewMessage::tool_results(conversation_id, results))
            .await?;
        Ok(())
    }

    /// One provider call folded into a turn output. Events are published
    /// only after they pass validation.
    async fn stream_turn(
        &self,
        conversation_id: &str,
        options: &RequestOptions,
    ) -> Result<TurnOutput> {
        let request = ConversationRequest {
            conversation: self.store.get_conversation(conversation_id).await?,
            messages: self.store.list_messages(conversation_id).await?,
        };
        debug!(target: "orchestrator", conversation = %conversation_id, messages = request.messages.len(), "Calling provider");

        let mut stream = self.provider.stream_message(&request, options).await?;
        let mut acc = TurnAccumulator::new();
        while let Some(item) = stream.next().await {
            let event = item?;
            acc.fold(&event)?;
            self.broker.append_event(conversation_id, &event).await?;
            if acc.is_terminal() {
                break;
            }
        }
        acc.finish()
    }

    /// Run pending calls sequentially in emission order
    async fn execute_tools(
        &self,
        conversation_id: &str,
        calls: &[PendingToolCall],
        ctx: &ExecutionContext,
    ) -> Result<Vec<ContentBlock>> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let started = Instant::now();
            let outcome = match &call.argument_error {
                Some(err) => ToolOutcome::error(format!("Invalid tool arguments: {err}")),
                None => {
                    self.tools
                        .execute(&call.name, call.arguments.clone(), ctx)
                        .await
                }
            };
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;

            self.stats.tool_call(outcome.is_error);
            self.tool_calls_counter.add(
                1,
                &[
                    KeyValue::new("tool_name", call.name.clone()),
                    KeyValue::new("status", if outcome.is_error { "error" } else { "success" }),
                ],
            );
            info!(target: "orchestrator", tool = %call.name, is_error = outcome.is_error, latency_ms = %elapsed, "Tool invocation finished");

            self.broker
                .append_event(
                    conversation_id,
                    &StreamEvent::ToolResult {
                        tool_call_id: call.id.clone(),
                        output: outcome.output.clone(),
                        is_error: outcome.is_error,
                    },
                )
                .await?;
            results.push(ContentBlock::ToolResult {
                tool_call_id: call.id.clone(),
                output: outcome.output,
                is_error: outcome.is_error,
            });
        }
        Ok(results)
    }
}
