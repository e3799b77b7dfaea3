//! In-memory store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    rank_chunks, sort_pending, AgentWorkspace, ChunkStore, CollaborationStore, CollaborationTask,
    Conversation, ConversationMessage, ConversationStore, DocumentChunk, FollowRelationship,
    FollowStatus, RetrievedChunk, SourceFileSummary, StoreError, TaskTransition, WorkspaceStore,
};

#[derive(Clone)]
pub struct InMemoryStore {
    workspaces: Arc<RwLock<Vec<AgentWorkspace>>>,
    chunks: Arc<RwLock<Vec<DocumentChunk>>>,
    conversations: Arc<RwLock<HashMap<Uuid, Conversation>>>,
    messages: Arc<RwLock<Vec<ConversationMessage>>>,
    follows: Arc<RwLock<HashMap<(Uuid, Uuid), FollowRelationship>>>,
    tasks: Arc<RwLock<HashMap<Uuid, CollaborationTask>>>,
    similarity_enabled: bool,
    search_failure: Option<String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            workspaces: Arc::new(RwLock::new(Vec::new())),
            chunks: Arc::new(RwLock::new(Vec::new())),
            conversations: Arc::new(RwLock::new(HashMap::new())),
            messages: Arc::new(RwLock::new(Vec::new())),
            follows: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            similarity_enabled: true,
            search_failure: None,
        }
    }

    /// A store whose similarity search reports [`StoreError::Unsupported`].
    pub fn without_similarity() -> Self {
        Self {
            similarity_enabled: false,
            ..Self::new()
        }
    }

    /// A store that advertises similarity search but fails every search with
    /// [`StoreError::Backend`].
    pub fn with_failing_search(message: impl Into<String>) -> Self {
        Self {
            search_failure: Some(message.into()),
            ..Self::new()
        }
    }

    #[cfg(test)]
    pub async fn conversation_count(&self) -> usize {
        self.conversations.read().await.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkspaceStore for InMemoryStore {
    async fn get_workspace(&self, id: Uuid) -> Result<Option<AgentWorkspace>, StoreError> {
        Ok(self
            .workspaces
            .read()
            .await
            .iter()
            .find(|w| w.id == id)
            .cloned())
    }

    async fn get_workspace_by_owner(
        &self,
        owner_id: &str,
    ) -> Result<Option<AgentWorkspace>, StoreError> {
        Ok(self
            .workspaces
            .read()
            .await
            .iter()
            .filter(|w| w.owner_id == owner_id)
            .min_by_key(|w| w.created_at)
            .cloned())
    }

    async fn create_workspace(&self, workspace: &AgentWorkspace) -> Result<(), StoreError> {
        let mut workspaces = self.workspaces.write().await;
        if workspaces.iter().any(|w| w.id == workspace.id) {
            return Err(StoreError::Conflict(format!(
                "workspace {} already exists",
                workspace.id
            )));
        }
        workspaces.push(workspace.clone());
        Ok(())
    }

    async fn update_workspace(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<AgentWorkspace>, StoreError> {
        let mut workspaces = self.workspaces.write().await;
        let Some(workspace) = workspaces.iter_mut().find(|w| w.id == id) else {
            return Ok(None);
        };
        if let Some(name) = name {
            workspace.name = name.to_string();
        }
        if let Some(description) = description {
            workspace.description = Some(description.to_string());
        }
        Ok(Some(workspace.clone()))
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    fn supports_similarity(&self) -> bool {
        self.similarity_enabled
    }

    async fn insert_chunks(&self, chunks: &[DocumentChunk]) -> Result<usize, StoreError> {
        let mut stored = self.chunks.write().await;
        let mut inserted = 0;
        for chunk in chunks {
            if stored.iter().any(|c| c.id == chunk.id) {
                continue;
            }
            stored.push(chunk.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn count_chunks(&self, workspace_id: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .chunks
            .read()
            .await
            .iter()
            .filter(|c| c.workspace_id == workspace_id)
            .count())
    }

    async fn count_chunks_for_source(
        &self,
        workspace_id: Uuid,
        source_file_name: &str,
    ) -> Result<usize, StoreError> {
        Ok(self
            .chunks
            .read()
            .await
            .iter()
            .filter(|c| c.workspace_id == workspace_id && c.source_file_name == source_file_name)
            .count())
    }

    async fn search_chunks(
        &self,
        workspace_id: Uuid,
        query_embedding: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError> {
        if !self.similarity_enabled {
            return Err(StoreError::Unsupported("similarity search"));
        }
        if let Some(message) = &self.search_failure {
            return Err(StoreError::Backend(message.clone()));
        }
        let chunks = self.chunks.read().await;
        Ok(rank_chunks(
            chunks.iter().filter(|c| c.workspace_id == workspace_id),
            query_embedding,
            threshold,
            limit,
        ))
    }

    async fn recent_chunks(
        &self,
        workspace_id: Uuid,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError> {
        let chunks = self.chunks.read().await;
        // Insertion order breaks created_at ties
        let mut owned: Vec<(usize, &DocumentChunk)> = chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.workspace_id == workspace_id)
            .collect();
        owned.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
        Ok(owned
            .into_iter()
            .take(limit)
            .map(|(_, c)| RetrievedChunk::from_chunk(c, 0.0))
            .collect())
    }

    async fn delete_chunks_by_source(
        &self,
        workspace_id: Uuid,
        source_file_name: &str,
    ) -> Result<usize, StoreError> {
        let mut chunks = self.chunks.write().await;
        let before = chunks.len();
        chunks.retain(|c| {
            !(c.workspace_id == workspace_id && c.source_file_name == source_file_name)
        });
        Ok(before - chunks.len())
    }

    async fn list_sources(
        &self,
        workspace_id: Uuid,
    ) -> Result<Vec<SourceFileSummary>, StoreError> {
        let chunks = self.chunks.read().await;
        let mut by_source: HashMap<&str, SourceFileSummary> = HashMap::new();
        for chunk in chunks.iter().filter(|c| c.workspace_id == workspace_id) {
            let entry = by_source
                .entry(chunk.source_file_name.as_str())
                .or_insert_with(|| SourceFileSummary {
                    source_file_name: chunk.source_file_name.clone(),
                    chunk_count: 0,
                    last_ingested_at: chunk.created_at,
                });
            entry.chunk_count += 1;
            if chunk.created_at > entry.last_ingested_at {
                entry.last_ingested_at = chunk.created_at;
            }
        }
        let mut sources: Vec<_> = by_source.into_values().collect();
        sources.sort_by(|a, b| a.source_file_name.cmp(&b.source_file_name));
        Ok(sources)
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.conversations
            .write()
            .await
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.read().await.get(&id).cloned())
    }

    async fn touch_conversation(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", id)))?;
        conversation.updated_at = at;
        Ok(())
    }

    async fn append_message(&self, message: &ConversationMessage) -> Result<(), StoreError> {
        if !self
            .conversations
            .read()
            .await
            .contains_key(&message.conversation_id)
        {
            return Err(StoreError::NotFound(format!(
                "conversation {}",
                message.conversation_id
            )));
        }
        self.messages.write().await.push(message.clone());
        Ok(())
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        let messages = self.messages.read().await;
        let thread: Vec<&ConversationMessage> = messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .collect();
        let skip = thread.len().saturating_sub(limit);
        Ok(thread.into_iter().skip(skip).cloned().collect())
    }
}

#[async_trait]
impl CollaborationStore for InMemoryStore {
    async fn upsert_follow(&self, follow: &FollowRelationship) -> Result<(), StoreError> {
        self.follows
            .write()
            .await
            .insert((follow.requester_id, follow.target_id), follow.clone());
        Ok(())
    }

    async fn get_follow(
        &self,
        requester_id: Uuid,
        target_id: Uuid,
    ) -> Result<Option<FollowRelationship>, StoreError> {
        Ok(self
            .follows
            .read()
            .await
            .get(&(requester_id, target_id))
            .cloned())
    }

    async fn set_follow_status(
        &self,
        requester_id: Uuid,
        target_id: Uuid,
        status: FollowStatus,
    ) -> Result<Option<FollowRelationship>, StoreError> {
        let mut follows = self.follows.write().await;
        let Some(follow) = follows.get_mut(&(requester_id, target_id)) else {
            return Ok(None);
        };
        follow.status = status;
        follow.updated_at = Utc::now();
        Ok(Some(follow.clone()))
    }

    async fn list_follows_by_requester(
        &self,
        requester_id: Uuid,
    ) -> Result<Vec<FollowRelationship>, StoreError> {
        let mut follows: Vec<_> = self
            .follows
            .read()
            .await
            .values()
            .filter(|f| f.requester_id == requester_id)
            .cloned()
            .collect();
        follows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(follows)
    }

    async fn list_follows_by_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<FollowRelationship>, StoreError> {
        let mut follows: Vec<_> = self
            .follows
            .read()
            .await
            .values()
            .filter(|f| f.target_id == target_id)
            .cloned()
            .collect();
        follows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(follows)
    }

    async fn create_task(&self, task: &CollaborationTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<CollaborationTask>, StoreError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list_tasks_by_requester(
        &self,
        requester_id: Uuid,
    ) -> Result<Vec<CollaborationTask>, StoreError> {
        let mut tasks: Vec<_> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.requester_id == requester_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn list_tasks_by_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<CollaborationTask>, StoreError> {
        let mut tasks: Vec<_> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.target_id == target_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn list_pending_tasks(
        &self,
        target_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<CollaborationTask>, StoreError> {
        let mut tasks: Vec<_> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == super::TaskStatus::Pending)
            .filter(|t| target_id.map_or(true, |id| t.target_id == id))
            .cloned()
            .collect();
        sort_pending(&mut tasks);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn list_unsurfaced_tasks(&self) -> Result<Vec<CollaborationTask>, StoreError> {
        let mut tasks: Vec<_> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status.is_unsurfaced())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn transition_task(
        &self,
        id: Uuid,
        transition: &TaskTransition,
    ) -> Result<Option<CollaborationTask>, StoreError> {
        if !transition.from.can_transition_to(transition.to) {
            return Err(StoreError::Conflict(format!(
                "illegal task transition {} -> {}",
                transition.from, transition.to
            )));
        }
        // Single write lock makes the check-and-set atomic
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
        if task.status != transition.from {
            return Ok(None);
        }
        transition.apply(task);
        Ok(Some(task.clone()))
    }
}
