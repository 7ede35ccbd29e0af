//! Persistence boundary for conversations and their messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::conversation::{
    ContentBlock, Conversation, ConversationStatus, Message, MessageContent, MessageRole,
    StopReason, TokenUsage,
};
use crate::{RelayError, Result};

/// Message to persist; id, sequence and timestamp are assigned by the store
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: MessageContent,
    pub usage: Option<TokenUsage>,
    pub stop_reason: Option<StopReason>,
}

impl NewMessage {
    pub fn user(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role: MessageRole::User,
            content: MessageContent::Text(text.into()),
            usage: None,
            stop_reason: None,
        }
    }

    pub fn assistant(
        conversation_id: impl Into<String>,
        blocks: Vec<ContentBlock>,
        usage: TokenUsage,
        stop_reason: StopReason,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role: MessageRole::Assistant,
            content: MessageContent::Blocks(blocks),
            usage: Some(usage),
            stop_reason: Some(stop_reason),
        }
    }

    /// One `tool` message carrying every result of a turn
    pub fn tool_results(conversation_id: impl Into<String>, results: Vec<ContentBlock>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role: MessageRole::Tool,
            content: MessageContent::Blocks(results),
            usage: None,
            stop_reason: None,
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation>;

    async fn get_conversation(&self, id: &str) -> Result<Conversation>;

    /// Atomically move the conversation into `processing`. Returns false when
    /// it is already processing.
    async fn try_begin_processing(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Leave `processing` with a terminal status. Only the holder of the
    /// claim started at `claimed_at` may finish it; returns false and writes
    /// nothing when the claim has since been released or taken over.
    async fn finish_processing(
        &self,
        id: &str,
        claimed_at: DateTime<Utc>,
        status: ConversationStatus,
        error: Option<String>,
    ) -> Result<bool>;

    /// Persist a message, assigning the next sequence number
    async fn append_message(&self, message: NewMessage) -> Result<Message>;

    /// Messages in sequence order
    async fn list_messages(&self, id: &str) -> Result<Vec<Message>>;

    /// Add one turn's usage and bump the turn counter
    async fn record_turn(&self, id: &str, usage: &TokenUsage) -> Result<Conversation>;

    /// Conversations stuck in `processing` since before `older_than`, with
    /// the start of their claim
    async fn stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>>;
}

/// Process-local store
#[derive(Clone, Default)]
pub struct InMemoryStore {
    conversations: Arc<DashMap<String, Conversation>>,
    messages: Arc<DashMap<String, Vec<Message>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(id: &str) -> RelayError {
        RelayError::ConversationNotFound(id.to_string())
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation> {
        if self.conversations.contains_key(&conversation.id) {
            return Err(RelayError::Storage(format!(
                "conversation {} already exists",
                conversation.id
            )));
        }
        self.messages.insert(conversation.id.clone(), Vec::new());
        self.conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation> {
        self.conversations
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn try_begin_processing(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        // The shard write lock makes check-and-set atomic per conversation
        let mut conv = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| Self::not_found(id))?;
        if conv.status.is_processing() {
            debug!(target: "store", conversation = %id, "Claim rejected; already processing");
            return Ok(false);
        }
        conv.status = ConversationStatus::Processing;
        conv.processing_started_at = Some(now);
        conv.last_error = None;
        conv.updated_at = now;
        Ok(true)
    }

    async fn finish_processing(
        &self,
        id: &str,
        claimed_at: DateTime<Utc>,
        status: ConversationStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let mut conv = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| Self::not_found(id))?;
        if !conv.status.is_processing() || conv.processing_started_at != Some(claimed_at) {
            debug!(target: "store", conversation = %id, %claimed_at, "Finish rejected; claim no longer held");
            return Ok(false);
        }
        conv.status = status;
        conv.processing_started_at = None;
        conv.last_error = error;
        conv.updated_at = Utc::now();
        Ok(true)
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message> {
        if !self.conversations.contains_key(&message.conversation_id) {
            return Err(Self::not_found(&message.conversation_id));
        }
        let mut log = self
            .messages
            .entry(message.conversation_id.clone())
            .or_default();
        let sequence = log.last().map(|m| m.sequence + 1).unwrap_or(1);
        let stored = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: message.conversation_id,
            sequence,
            role: message.role,
            content: message.content,
            usage: message.usage,
            stop_reason: message.stop_reason,
            created_at: Utc::now(),
        };
        log.push(stored.clone());
        Ok(stored)
    }

    async fn list_messages(&self, id: &str) -> Result<Vec<Message>> {
        if !self.conversations.contains_key(id) {
            return Err(Self::not_found(id));
        }
        Ok(self.messages.get(id).map(|m| m.clone()).unwrap_or_default())
    }

    async fn record_turn(&self, id: &str, usage: &TokenUsage) -> Result<Conversation> {
        let mut conv = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| Self::not_found(id))?;
        conv.usage.add(usage);
        conv.turn_number += 1;
        conv.updated_at = Utc::now();
        Ok(conv.clone())
    }

    async fn stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        // Claims always carry a start time
        Ok(self
            .conversations
            .iter()
            .filter(|c| c.status.is_processing())
            .filter_map(|c| {
                c.processing_started_at
                    .filter(|started| *started < older_than)
                    .map(|started| (c.id.clone(), started))
            })
            .collect())
    }
}
