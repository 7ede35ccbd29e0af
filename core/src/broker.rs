// Stream broker: fans conversation events out to live subscribers
use crate::event::{Metadata, StreamEvent};
use crate::{RelayError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, info, warn};

/// Publisher side used by the orchestrator
#[async_trait]
pub trait StreamBroker: Send + Sync {
    async fn start_stream(&self, conversation_id: &str, metadata: Metadata) -> Result<()>;
    async fn append_event(&self, conversation_id: &str, event: &StreamEvent) -> Result<()>;
    async fn complete_stream(&self, conversation_id: &str) -> Result<()>;
    async fn fail_stream(&self, conversation_id: &str, reason: &str) -> Result<()>;
}

/// Frame delivered to subscribers. Sequence numbers are monotonic per
/// conversation across streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerFrame {
    pub conversation_id: String,
    pub sequence: u64,
    #[serde(flatten)]
    pub payload: FramePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum FramePayload {
    StreamStart { metadata: Metadata },
    /// Serialized as a `WireEvent`
    Event { event: StreamEvent },
    StreamComplete,
    StreamFailed { reason: String },
}

impl BrokerFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            FramePayload::StreamComplete | FramePayload::StreamFailed { .. }
        )
    }

    pub fn event(&self) -> Option<&StreamEvent> {
        match &self.payload {
            FramePayload::Event { event } => Some(event),
            _ => None,
        }
    }
}

/// Per-conversation broker statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub dropped_frames: u64,
    pub active_subscriptions: usize,
    pub replay_size: usize,
}

#[derive(Debug, Clone)]
struct Subscription {
    id: String,
    sender: mpsc::Sender<BrokerFrame>,
}

#[derive(Debug, Default)]
struct Topic {
    active: bool,
    next_sequence: u64,
    // Frames of the current (or most recent) stream, replayed to late joiners
    replay: Vec<BrokerFrame>,
    subscriptions: Vec<Subscription>,
    stats: BrokerStats,
}

/// In-process broker: one topic per conversation, bounded mpsc subscriptions
pub struct EventBusBroker {
    topics: Arc<DashMap<String, Topic>>,
    channel_capacity: usize,
    replay_capacity: usize,
    send_timeout: Duration,
}

impl Default for EventBusBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBusBroker {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            channel_capacity: 1024,
            replay_capacity: 10_000,
            send_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity;
        self
    }

    /// How long a full subscriber may block delivery before the frame is
    /// dropped for it
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Subscribe to a conversation. Frames of the current stream published
    /// before the call are replayed first.
    pub async fn subscribe(
        &self,
        conversation_id: &str,
    ) -> Result<(String, mpsc::Receiver<BrokerFrame>)> {
        let subscription_id = format!("sub_{}_{}", conversation_id, uuid::Uuid::new_v4());
        let mut topic = self.topics.entry(conversation_id.to_string()).or_default();
        let cap = self.channel_capacity.max(topic.replay.len() + 1);
        let (tx, rx) = mpsc::channel(cap);

        // Capacity covers the replay, so try_send cannot fail on a fresh channel
        let replayed = topic
            .replay
            .iter()
            .filter(|frame| tx.try_send((*frame).clone()).is_ok())
            .count();
        topic.stats.total_delivered += replayed as u64;
        topic.subscriptions.push(Subscription {
            id: subscription_id.clone(),
            sender: tx,
        });
        topic.stats.active_subscriptions = topic.subscriptions.len();
        drop(topic);

        info!(target: "broker", subscription = %subscription_id, conversation = %conversation_id, replayed, "Created subscription");
        Ok((subscription_id, rx))
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        for mut entry in self.topics.iter_mut() {
            let topic = entry.value_mut();
            topic.subscriptions.retain(|s| s.id != subscription_id);
            topic.stats.active_subscriptions = topic.subscriptions.len();
        }
        info!(target: "broker", subscription = %subscription_id, "Unsubscribed");
        Ok(())
    }

    pub fn stats(&self, conversation_id: &str) -> Option<BrokerStats> {
        self.topics.get(conversation_id).map(|t| {
            let mut stats = t.stats.clone();
            stats.replay_size = t.replay.len();
            stats
        })
    }

    /// Whether a stream is currently open for the conversation
    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.topics
            .get(conversation_id)
            .map(|t| t.active)
            .unwrap_or(false)
    }

    /// Sequence the frame and record it for replay, then deliver outside the
    /// map guard.
    async fn publish(
        &self,
        conversation_id: &str,
        payload: FramePayload,
        require_active: bool,
    ) -> Result<u64> {
        let (frame, targets) = {
            let mut topic = self.topics.entry(conversation_id.to_string()).or_default();
            let starting = matches!(payload, FramePayload::StreamStart { .. });
            if require_active && !topic.active {
                return Err(RelayError::Broker(format!(
                    "no active stream for conversation {conversation_id}"
                )));
            }
            if starting {
                if topic.active {
                    warn!(target: "broker", conversation = %conversation_id, "Restarting stream that was never terminated");
                }
                topic.replay.clear();
                topic.active = true;
            }
            let frame = BrokerFrame {
                conversation_id: conversation_id.to_string(),
                sequence: topic.next_sequence,
                payload,
            };
            topic.next_sequence += 1;
            if frame.is_terminal() {
                topic.active = false;
            }
            if topic.replay.len() >= self.replay_capacity {
                // Keep the start frame, drop the oldest one after it
                let idx = usize::from(topic.replay.len() > 1);
                if idx < topic.replay.len() {
                    topic.replay.remove(idx);
                }
            }
            if self.replay_capacity > 0 {
                topic.replay.push(frame.clone());
            }
            topic.stats.total_published += 1;
            (frame, topic.subscriptions.clone())
        };

        debug!(target: "broker", conversation = %conversation_id, sequence = frame.sequence, subscribers = targets.len(), "Publishing frame");

        let mut delivered = 0u64;
        let mut dropped = 0u64;
        let mut closed = Vec::new();
        for sub in &targets {
            match sub.sender.send_timeout(frame.clone(), self.send_timeout).await {
                Ok(()) => delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    dropped += 1;
                    warn!(target: "broker", subscription = %sub.id, "Subscriber queue full; dropped frame");
                }
                Err(SendTimeoutError::Closed(_)) => closed.push(sub.id.clone()),
            }
        }

        if let Some(mut topic) = self.topics.get_mut(conversation_id) {
            topic.stats.total_delivered += delivered;
            topic.stats.dropped_frames += dropped;
            if !closed.is_empty() {
                topic.subscriptions.retain(|s| !closed.contains(&s.id));
                topic.stats.active_subscriptions = topic.subscriptions.len();
                debug!(target: "broker", conversation = %conversation_id, pruned = closed.len(), "Pruned closed subscribers");
            }
        }
        Ok(delivered)
    }
}

#[async_trait]
impl StreamBroker for EventBusBroker {
    async fn start_stream(&self, conversation_id: &str, metadata: Metadata) -> Result<()> {
        info!(target: "broker", conversation = %conversation_id, "Stream started");
        self.publish(conversation_id, FramePayload::StreamStart { metadata }, false)
            .await
            .map(|_| ())
    }

    async fn append_event(&self, conversation_id: &str, event: &StreamEvent) -> Result<()> {
        self.publish(
            conversation_id,
            FramePayload::Event {
                event: event.clone(),
            },
            true,
        )
        .await
        .map(|_| ())
    }

    async fn complete_stream(&self, conversation_id: &str) -> Result<()> {
        info!(target: "broker", conversation = %conversation_id, "Stream completed");
        self.publish(conversation_id, FramePayload::StreamComplete, true)
            .await
            .map(|_| ())
    }

    async fn fail_stream(&self, conversation_id: &str, reason: &str) -> Result<()> {
        // Always delivered: stale-run reclaim fails streams this process never started
        warn!(target: "broker", conversation = %conversation_id, %reason, "Stream failed");
        self.publish(
            conversation_id,
            FramePayload::StreamFailed {
                reason: reason.to_string(),
            },
            false,
        )
        .await
        .map(|_| ())
    }
}
