//! Persistence with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database, cosine similarity computed in-process
//! - `supabase`: PostgREST tables plus the `match_document_chunks` RPC

#[cfg(test)]
mod contract;
mod memory;
mod sqlite;
mod supabase;
mod types;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use supabase::SupabaseStore;
pub use types::*;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::StoreConfig;

/// Errors surfaced by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The backend cannot perform this operation (e.g. native similarity)
    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(format!("sqlite: {}", e))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Backend(format!("http: {}", e))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("json: {}", e))
    }
}

/// Agent workspace records.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn get_workspace(&self, id: Uuid) -> Result<Option<AgentWorkspace>, StoreError>;

    /// The first workspace created by `owner_id`, if any.
    async fn get_workspace_by_owner(
        &self,
        owner_id: &str,
    ) -> Result<Option<AgentWorkspace>, StoreError>;

    async fn create_workspace(&self, workspace: &AgentWorkspace) -> Result<(), StoreError>;

    /// Update the mutable fields. `None` leaves a field unchanged.
    async fn update_workspace(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<AgentWorkspace>, StoreError>;
}

/// Document chunks and their embeddings.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Whether [`ChunkStore::search_chunks`] is backed by a native similarity function.
    fn supports_similarity(&self) -> bool {
        true
    }

    /// Insert chunks, ignoring ids that already exist. Returns rows written.
    async fn insert_chunks(&self, chunks: &[DocumentChunk]) -> Result<usize, StoreError>;

    async fn count_chunks(&self, workspace_id: Uuid) -> Result<usize, StoreError>;

    async fn count_chunks_for_source(
        &self,
        workspace_id: Uuid,
        source_file_name: &str,
    ) -> Result<usize, StoreError>;

    /// Top `limit` chunks with similarity `>= threshold`, best first.
    async fn search_chunks(
        &self,
        workspace_id: Uuid,
        query_embedding: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError>;

    /// Most recently created chunks. `similarity` is left at zero.
    async fn recent_chunks(
        &self,
        workspace_id: Uuid,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError>;

    /// Delete every chunk of one source file. Returns rows removed.
    async fn delete_chunks_by_source(
        &self,
        workspace_id: Uuid,
        source_file_name: &str,
    ) -> Result<usize, StoreError>;

    async fn list_sources(&self, workspace_id: Uuid)
        -> Result<Vec<SourceFileSummary>, StoreError>;
}

/// Conversation threads and their messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    async fn touch_conversation(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn append_message(&self, message: &ConversationMessage) -> Result<(), StoreError>;

    /// The last `limit` messages, oldest first.
    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, StoreError>;
}

/// Follow relationships and collaboration tasks.
#[async_trait]
pub trait CollaborationStore: Send + Sync {
    /// Insert or replace the relationship for `(requester_id, target_id)`.
    async fn upsert_follow(&self, follow: &FollowRelationship) -> Result<(), StoreError>;

    async fn get_follow(
        &self,
        requester_id: Uuid,
        target_id: Uuid,
    ) -> Result<Option<FollowRelationship>, StoreError>;

    async fn set_follow_status(
        &self,
        requester_id: Uuid,
        target_id: Uuid,
        status: FollowStatus,
    ) -> Result<Option<FollowRelationship>, StoreError>;

    async fn list_follows_by_requester(
        &self,
        requester_id: Uuid,
    ) -> Result<Vec<FollowRelationship>, StoreError>;

    async fn list_follows_by_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<FollowRelationship>, StoreError>;

    async fn create_task(&self, task: &CollaborationTask) -> Result<(), StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<CollaborationTask>, StoreError>;

    /// Newest first.
    async fn list_tasks_by_requester(
        &self,
        requester_id: Uuid,
    ) -> Result<Vec<CollaborationTask>, StoreError>;

    /// Newest first.
    async fn list_tasks_by_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<CollaborationTask>, StoreError>;

    /// Pending tasks in processing order (see [`sort_pending`]).
    async fn list_pending_tasks(
        &self,
        target_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<CollaborationTask>, StoreError>;

    /// Tasks in [`TaskStatus::UNSURFACED`], oldest first.
    async fn list_unsurfaced_tasks(&self) -> Result<Vec<CollaborationTask>, StoreError>;

    /// Compare-and-set status change.
    ///
    /// Returns the updated task, or `None` when the task is no longer in
    /// `transition.from` (another writer won). Illegal transitions are a
    /// [`StoreError::Conflict`].
    async fn transition_task(
        &self,
        id: Uuid,
        transition: &TaskTransition,
    ) -> Result<Option<CollaborationTask>, StoreError>;
}

/// Every store capability the application needs.
pub trait Store: WorkspaceStore + ChunkStore + ConversationStore + CollaborationStore {}

impl<T> Store for T where T: WorkspaceStore + ChunkStore + ConversationStore + CollaborationStore {}

pub type SharedStore = Arc<dyn Store>;

/// Store backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    Memory,
    #[default]
    Sqlite,
    Supabase,
}

impl std::str::FromStr for StoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StoreType::Memory),
            "sqlite" => Ok(StoreType::Sqlite),
            "supabase" => Ok(StoreType::Supabase),
            other => Err(format!("unknown store backend: {}", other)),
        }
    }
}

impl std::fmt::Display for StoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreType::Memory => write!(f, "memory"),
            StoreType::Sqlite => write!(f, "sqlite"),
            StoreType::Supabase => write!(f, "supabase"),
        }
    }
}

/// Create a store based on type.
pub async fn create_store(config: &StoreConfig) -> Result<SharedStore, StoreError> {
    match config.backend {
        StoreType::Memory => Ok(Arc::new(InMemoryStore::new())),
        StoreType::Sqlite => {
            let store = SqliteStore::open(config.data_dir.join("mindop.db")).await?;
            Ok(Arc::new(store))
        }
        StoreType::Supabase => {
            let url = config
                .supabase_url
                .clone()
                .ok_or_else(|| StoreError::Backend("SUPABASE_URL is not set".to_string()))?;
            let key = config.supabase_service_role_key.clone().ok_or_else(|| {
                StoreError::Backend("SUPABASE_SERVICE_ROLE_KEY is not set".to_string())
            })?;
            Ok(Arc::new(SupabaseStore::new(url, key)))
        }
    }
}

/// Cosine similarity in `[-1, 1]`; zero for mismatched or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Rank chunks against a query vector, best first.
pub(crate) fn rank_chunks<'a>(
    chunks: impl Iterator<Item = &'a DocumentChunk>,
    query_embedding: &[f32],
    threshold: f64,
    limit: usize,
) -> Vec<RetrievedChunk> {
    let mut scored: Vec<RetrievedChunk> = chunks
        .map(|chunk| {
            let similarity = cosine_similarity(&chunk.embedding, query_embedding);
            RetrievedChunk::from_chunk(chunk, similarity)
        })
        .filter(|hit| hit.similarity >= threshold)
        .collect();
    scored.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn store_type_parsing() {
        assert_eq!("memory".parse::<StoreType>().unwrap(), StoreType::Memory);
        assert_eq!(" SQLite ".parse::<StoreType>().unwrap(), StoreType::Sqlite);
        assert_eq!("supabase".parse::<StoreType>().unwrap(), StoreType::Supabase);
        assert!("postgres".parse::<StoreType>().is_err());
        assert_eq!(StoreType::default(), StoreType::Sqlite);
    }
}
