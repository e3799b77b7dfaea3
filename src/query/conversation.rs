//! Conversation threads: lazy creation, bounded history, turn persistence.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::{Conversation, ConversationMessage, SharedStore};
use crate::util::derive_title;

/// Characters of the first query kept as a conversation title.
const TITLE_CHARS: usize = 60;

/// Upper bound for a full history listing.
const MAX_LISTED_MESSAGES: usize = 500;

#[derive(Clone)]
pub struct ConversationManager {
    store: SharedStore,
    history_messages: usize,
}

impl ConversationManager {
    pub fn new(store: SharedStore, history_messages: usize) -> Self {
        Self {
            store,
            history_messages,
        }
    }

    /// Load a conversation the caller owns.
    pub async fn load_owned(&self, user_id: &str, id: Uuid) -> AppResult<Conversation> {
        let conversation = self
            .store
            .get_conversation(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("conversation {}", id)))?;
        if conversation.owner_id != user_id {
            return Err(AppError::not_authorized(format!(
                "conversation {} belongs to another user",
                id
            )));
        }
        Ok(conversation)
    }

    /// The bounded context window for a conversation, oldest first.
    pub async fn history(&self, conversation_id: Uuid) -> AppResult<Vec<ConversationMessage>> {
        Ok(self
            .store
            .recent_messages(conversation_id, self.history_messages)
            .await?)
    }

    /// Every message of a conversation the caller owns.
    pub async fn messages(&self, user_id: &str, id: Uuid) -> AppResult<Vec<ConversationMessage>> {
        self.load_owned(user_id, id).await?;
        Ok(self.store.recent_messages(id, MAX_LISTED_MESSAGES).await?)
    }

    /// Return `existing`, or create a conversation titled after `query`.
    pub async fn ensure(
        &self,
        existing: Option<Conversation>,
        owner_id: &str,
        workspace_id: Uuid,
        query: &str,
    ) -> AppResult<Conversation> {
        if let Some(conversation) = existing {
            return Ok(conversation);
        }
        let conversation = Conversation::new(
            owner_id,
            workspace_id,
            Some(derive_title(query, TITLE_CHARS)),
        );
        self.store.create_conversation(&conversation).await?;
        tracing::debug!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    /// Persist a question and its answer, then bump `updated_at`.
    pub async fn record_exchange(
        &self,
        conversation_id: Uuid,
        query: &str,
        answer: &str,
        answered_by: Uuid,
    ) -> AppResult<()> {
        self.store
            .append_message(&ConversationMessage::user(conversation_id, query))
            .await?;
        self.store
            .append_message(&ConversationMessage::agent(conversation_id, answered_by, answer))
            .await?;
        self.store
            .touch_conversation(conversation_id, Utc::now())
            .await?;
        Ok(())
    }

    pub async fn append_user(&self, conversation_id: Uuid, content: &str) -> AppResult<()> {
        self.store
            .append_message(&ConversationMessage::user(conversation_id, content))
            .await?;
        self.store
            .touch_conversation(conversation_id, Utc::now())
            .await?;
        Ok(())
    }

    pub async fn append_agent(
        &self,
        conversation_id: Uuid,
        sender: Uuid,
        content: &str,
    ) -> AppResult<()> {
        self.store
            .append_message(&ConversationMessage::agent(conversation_id, sender, content))
            .await?;
        self.store
            .touch_conversation(conversation_id, Utc::now())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::{InMemoryStore, MessageRole};

    #[tokio::test]
    async fn lazily_created_conversation_is_titled_from_query() {
        let manager = ConversationManager::new(Arc::new(InMemoryStore::new()), 6);
        let ws = Uuid::new_v4();
        let query = "What   were the top five products by revenue in the third quarter of 2023?";
        let conversation = manager.ensure(None, "alice", ws, query).await.unwrap();
        let title = conversation.title.unwrap();
        assert!(title.starts_with("What were the top five products"));
        assert!(title.ends_with("..."));

        let loaded = manager.load_owned("alice", conversation.id).await.unwrap();
        assert_eq!(loaded.workspace_id, ws);
    }

    #[tokio::test]
    async fn history_is_bounded_and_chronological() {
        let manager = ConversationManager::new(Arc::new(InMemoryStore::new()), 4);
        let agent = Uuid::new_v4();
        let conversation = manager.ensure(None, "alice", agent, "q0").await.unwrap();
        for i in 0..5 {
            manager
                .record_exchange(conversation.id, &format!("q{}", i), &format!("a{}", i), agent)
                .await
                .unwrap();
        }

        let history = manager.history(conversation.id).await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q3", "a3", "q4", "a4"]);
        assert_eq!(history[1].role, MessageRole::Agent);
        assert_eq!(history[1].sender_workspace_id, Some(agent));

        assert_eq!(manager.messages("alice", conversation.id).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn other_users_cannot_read_a_conversation() {
        let manager = ConversationManager::new(Arc::new(InMemoryStore::new()), 6);
        let conversation = manager.ensure(None, "alice", Uuid::new_v4(), "hi").await.unwrap();
        let err = manager.messages("bob", conversation.id).await.unwrap_err();
        assert_eq!(err.code(), "not_authorized");
        let err = manager.load_owned("alice", Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
