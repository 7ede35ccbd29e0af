//! In-process provider replaying canned turns. Used by the demo's offline
//! mode and by tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use tokio::sync::Mutex;

use super::{boxed_stream, ConversationRequest, EventStream, ProviderClient, RequestOptions};
use crate::event::StreamEvent;
use crate::{RelayError, Result};

/// One scripted provider call: the events to emit, or a connection failure
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    Events(Vec<StreamEvent>),
    Unavailable(String),
}

/// Replays queued turns in order. The last turn repeats once the queue is
/// down to one entry, so a single tool-use turn loops forever.
#[derive(Clone)]
pub struct ScriptedProvider {
    name: String,
    turns: Arc<Mutex<VecDeque<ScriptedTurn>>>,
    requests: Arc<Mutex<Vec<(ConversationRequest, RequestOptions)>>>,
    event_delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Vec<StreamEvent>>) -> Self {
        Self::from_turns(turns.into_iter().map(ScriptedTurn::Events).collect())
    }

    pub fn from_turns(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            name: "scripted".to_string(),
            turns: Arc::new(Mutex::new(turns.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
            event_delay: None,
        }
    }

    /// Sleep before each emitted event
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Requests received so far
    pub async fn requests(&self) -> Vec<(ConversationRequest, RequestOptions)> {
        self.requests.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    async fn next_turn(&self) -> Option<ScriptedTurn> {
        let mut turns = self.turns.lock().await;
        if turns.len() > 1 {
            turns.pop_front()
        } else {
            turns.front().cloned()
        }
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn stream_message(
        &self,
        request: &ConversationRequest,
        options: &RequestOptions,
    ) -> Result<EventStream> {
        self.requests
            .lock()
            .await
            .push((request.clone(), options.clone()));

        let events = match self.next_turn().await {
            Some(ScriptedTurn::Events(events)) => events,
            Some(ScriptedTurn::Unavailable(reason)) => {
                return Err(RelayError::ProviderUnavailable(reason))
            }
            None => {
                return Err(RelayError::ProviderUnavailable(
                    "scripted provider has no turns".into(),
                ))
            }
        };

        let delay = self.event_delay;
        let events = stream::iter(events).then(move |event| async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            Ok::<_, RelayError>(event)
        });
        Ok(boxed_stream(events))
    }
}
