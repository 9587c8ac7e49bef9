//! Storage collaborator contract.
//!
//! The core touches persistence exactly twice per session: one history
//! read while building and one write while finalizing (or when a
//! cancelled session leaves partial text behind). Everything else about
//! storage — schemas, timestamps, tenancy — belongs to the implementor.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use palaver_common::{ConversationId, Result};
use tokio::sync::Mutex;

use crate::message::{Message, Usage};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Ordered history of a conversation, oldest first.
    async fn load_history(&self, conversation: &ConversationId) -> Result<Vec<Message>>;

    /// Persist the finished assistant message with its usage.
    async fn persist_final_message(
        &self,
        conversation: &ConversationId,
        message: &Message,
        usage: &Usage,
    ) -> Result<()>;

    /// Persist a partial assistant message left behind by a cancelled
    /// generation. Implementors should mark it incomplete.
    async fn persist_incomplete_message(
        &self,
        conversation: &ConversationId,
        message: &Message,
        usage: &Usage,
    ) -> Result<()>;
}

/// A stored assistant message with its bookkeeping.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message: Message,
    pub usage: Usage,
    pub complete: bool,
    pub stored_at: DateTime<Utc>,
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryStore {
    history: Mutex<HashMap<ConversationId, Vec<Message>>>,
    stored: Mutex<HashMap<ConversationId, Vec<StoredMessage>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a conversation's history wholesale.
    pub async fn seed_history(&self, conversation: ConversationId, messages: Vec<Message>) {
        self.history.lock().await.insert(conversation, messages);
    }

    /// Messages persisted by finished or cancelled sessions.
    pub async fn stored_messages(&self, conversation: &ConversationId) -> Vec<StoredMessage> {
        self.stored
            .lock()
            .await
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    async fn push(&self, conversation: &ConversationId, message: &Message, usage: &Usage, complete: bool) {
        self.stored
            .lock()
            .await
            .entry(conversation.clone())
            .or_default()
            .push(StoredMessage {
                message: message.clone(),
                usage: *usage,
                complete,
                stored_at: Utc::now(),
            });
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn load_history(&self, conversation: &ConversationId) -> Result<Vec<Message>> {
        Ok(self
            .history
            .lock()
            .await
            .get(conversation)
            .cloned()
            .unwrap_or_default())
    }

    async fn persist_final_message(
        &self,
        conversation: &ConversationId,
        message: &Message,
        usage: &Usage,
    ) -> Result<()> {
        self.push(conversation, message, usage, true).await;
        Ok(())
    }

    async fn persist_incomplete_message(
        &self,
        conversation: &ConversationId,
        message: &Message,
        usage: &Usage,
    ) -> Result<()> {
        self.push(conversation, message, usage, false).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_history_loads_back() {
        let store = InMemoryStore::new();
        let conversation = ConversationId::from("conv-1");
        store
            .seed_history(conversation.clone(), vec![Message::user("hello")])
            .await;
        let history = store.load_history(&conversation).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text_content(), "hello");
    }

    #[tokio::test]
    async fn complete_flag_distinguishes_final_from_partial() {
        let store = InMemoryStore::new();
        let conversation = ConversationId::from("conv-1");
        let usage = Usage::default();

        store
            .persist_final_message(&conversation, &Message::assistant("done"), &usage)
            .await
            .unwrap();
        store
            .persist_incomplete_message(&conversation, &Message::assistant("part"), &usage)
            .await
            .unwrap();

        let stored = store.stored_messages(&conversation).await;
        assert_eq!(stored.len(), 2);
        assert!(stored[0].complete);
        assert!(!stored[1].complete);
    }
}
