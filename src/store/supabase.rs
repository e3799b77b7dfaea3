//! Supabase store over PostgREST.
//!
//! Similarity search runs in Postgres through the `match_document_chunks`
//! RPC (pgvector). Task transitions are conditional PATCHes filtered on the
//! expected current status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

use super::{
    AgentWorkspace, ChunkMetadata, ChunkStore, CollaborationStore, CollaborationTask, Conversation,
    ConversationMessage, ConversationStore, DocumentChunk, FollowRelationship, FollowStatus,
    RetrievedChunk, SourceFileSummary, StoreError, TaskStatus, TaskTransition, WorkspaceStore,
};

const WORKSPACES: &str = "mindops";
const CHUNKS: &str = "mindop_document_chunks";
const CONVERSATIONS: &str = "conversations";
const MESSAGES: &str = "conversation_messages";
const FOLLOWS: &str = "follow_relationships";
const TASKS: &str = "mindop_collaboration_tasks";

const CHUNK_SELECT: &str = "id,workspace_id,content,source_file_name,created_at,metadata";

/// Supabase client implementing every store trait.
pub struct SupabaseStore {
    client: Client,
    url: String,
    service_role_key: String,
}

/// Chunk row without its embedding column.
#[derive(Debug, Deserialize)]
struct ChunkRow {
    id: Uuid,
    workspace_id: Uuid,
    content: String,
    source_file_name: String,
    created_at: DateTime<Utc>,
    metadata: Option<ChunkMetadata>,
    #[serde(default)]
    similarity: Option<f64>,
}

impl From<ChunkRow> for RetrievedChunk {
    fn from(row: ChunkRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            content: row.content,
            source_file_name: row.source_file_name,
            created_at: row.created_at,
            metadata: row.metadata,
            similarity: row.similarity.unwrap_or(0.0),
        }
    }
}

impl SupabaseStore {
    pub fn new(url: impl Into<String>, service_role_key: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            service_role_key: service_role_key.into(),
        }
    }

    /// Get the PostgREST URL.
    fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.url)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url(), path))
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
    }

    /// Send a request and decode a JSON body, mapping non-2xx to errors.
    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, StoreError> {
        let resp = request.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(StoreError::Backend(format!(
                "Failed to {}: {} - {}",
                what, status, text
            )));
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn send_empty(&self, request: RequestBuilder, what: &str) -> Result<(), StoreError> {
        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(StoreError::Backend(format!(
                "Failed to {}: {} - {}",
                what, status, text
            )));
        }
        Ok(())
    }

    /// Row count for a filter using `Prefer: count=exact`.
    async fn count(&self, path: &str, what: &str) -> Result<usize, StoreError> {
        let resp = self
            .request(Method::HEAD, path)
            .header("Prefer", "count=exact")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(StoreError::Backend(format!(
                "Failed to count {}: {}",
                what,
                resp.status()
            )));
        }
        resp.headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| StoreError::Backend(format!("No row count returned for {}", what)))
    }
}

/// Format an embedding as a pgvector literal.
fn vector_literal(embedding: &[f32]) -> String {
    format!(
        "[{}]",
        embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
fn parse_content_range_total(header: &str) -> Option<usize> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

fn enc(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

#[async_trait]
impl WorkspaceStore for SupabaseStore {
    async fn get_workspace(&self, id: Uuid) -> Result<Option<AgentWorkspace>, StoreError> {
        let rows: Vec<AgentWorkspace> = self
            .send_json(
                self.request(Method::GET, &format!("{}?id=eq.{}", WORKSPACES, id)),
                "get workspace",
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn get_workspace_by_owner(
        &self,
        owner_id: &str,
    ) -> Result<Option<AgentWorkspace>, StoreError> {
        let rows: Vec<AgentWorkspace> = self
            .send_json(
                self.request(
                    Method::GET,
                    &format!(
                        "{}?owner_id=eq.{}&order=created_at.asc&limit=1",
                        WORKSPACES,
                        enc(owner_id)
                    ),
                ),
                "get workspace by owner",
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn create_workspace(&self, workspace: &AgentWorkspace) -> Result<(), StoreError> {
        self.send_empty(
            self.request(Method::POST, WORKSPACES).json(workspace),
            "create workspace",
        )
        .await
    }

    async fn update_workspace(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<AgentWorkspace>, StoreError> {
        let mut updates = serde_json::Map::new();
        if let Some(name) = name {
            updates.insert("name".into(), serde_json::json!(name));
        }
        if let Some(description) = description {
            updates.insert("description".into(), serde_json::json!(description));
        }
        if updates.is_empty() {
            return self.get_workspace(id).await;
        }
        let rows: Vec<AgentWorkspace> = self
            .send_json(
                self.request(Method::PATCH, &format!("{}?id=eq.{}", WORKSPACES, id))
                    .header("Prefer", "return=representation")
                    .json(&updates),
                "update workspace",
            )
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl ChunkStore for SupabaseStore {
    async fn insert_chunks(&self, chunks: &[DocumentChunk]) -> Result<usize, StoreError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let body: Vec<serde_json::Value> = chunks
            .iter()
            .map(|chunk| {
                serde_json::json!({
                    "id": chunk.id,
                    "workspace_id": chunk.workspace_id,
                    "content": chunk.content,
                    "embedding": vector_literal(&chunk.embedding),
                    "source_file_name": chunk.source_file_name,
                    "created_at": chunk.created_at,
                    "metadata": chunk.metadata,
                })
            })
            .collect();

        let inserted: Vec<serde_json::Value> = self
            .send_json(
                self.request(
                    Method::POST,
                    &format!("{}?on_conflict=id&select=id", CHUNKS),
                )
                .header("Prefer", "resolution=ignore-duplicates,return=representation")
                .json(&body),
                "insert chunks",
            )
            .await?;
        Ok(inserted.len())
    }

    async fn count_chunks(&self, workspace_id: Uuid) -> Result<usize, StoreError> {
        self.count(
            &format!("{}?workspace_id=eq.{}&select=id", CHUNKS, workspace_id),
            "chunks",
        )
        .await
    }

    async fn count_chunks_for_source(
        &self,
        workspace_id: Uuid,
        source_file_name: &str,
    ) -> Result<usize, StoreError> {
        self.count(
            &format!(
                "{}?workspace_id=eq.{}&source_file_name=eq.{}&select=id",
                CHUNKS,
                workspace_id,
                enc(source_file_name)
            ),
            "chunks",
        )
        .await
    }

    async fn search_chunks(
        &self,
        workspace_id: Uuid,
        query_embedding: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError> {
        let body = serde_json::json!({
            "query_embedding": vector_literal(query_embedding),
            "match_threshold": threshold,
            "match_count": limit,
            "filter_workspace_id": workspace_id,
        });

        let resp = self
            .request(Method::POST, "rpc/match_document_chunks")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;

        // Missing function: let the caller degrade to recency
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::Unsupported("match_document_chunks rpc"));
        }
        if !status.is_success() {
            return Err(StoreError::Backend(format!(
                "Failed to search chunks: {} - {}",
                status, text
            )));
        }

        let rows: Vec<ChunkRow> = serde_json::from_str(&text)?;
        Ok(rows.into_iter().map(RetrievedChunk::from).collect())
    }

    async fn recent_chunks(
        &self,
        workspace_id: Uuid,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError> {
        let rows: Vec<ChunkRow> = self
            .send_json(
                self.request(
                    Method::GET,
                    &format!(
                        "{}?workspace_id=eq.{}&select={}&order=created_at.desc&limit={}",
                        CHUNKS, workspace_id, CHUNK_SELECT, limit
                    ),
                ),
                "list recent chunks",
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| RetrievedChunk {
                similarity: 0.0,
                ..RetrievedChunk::from(row)
            })
            .collect())
    }

    async fn delete_chunks_by_source(
        &self,
        workspace_id: Uuid,
        source_file_name: &str,
    ) -> Result<usize, StoreError> {
        let deleted: Vec<serde_json::Value> = self
            .send_json(
                self.request(
                    Method::DELETE,
                    &format!(
                        "{}?workspace_id=eq.{}&source_file_name=eq.{}&select=id",
                        CHUNKS,
                        workspace_id,
                        enc(source_file_name)
                    ),
                )
                .header("Prefer", "return=representation"),
                "delete chunks",
            )
            .await?;
        Ok(deleted.len())
    }

    async fn list_sources(
        &self,
        workspace_id: Uuid,
    ) -> Result<Vec<SourceFileSummary>, StoreError> {
        #[derive(Deserialize)]
        struct SourceRow {
            source_file_name: String,
            created_at: DateTime<Utc>,
        }

        let rows: Vec<SourceRow> = self
            .send_json(
                self.request(
                    Method::GET,
                    &format!(
                        "{}?workspace_id=eq.{}&select=source_file_name,created_at&order=source_file_name.asc",
                        CHUNKS, workspace_id
                    ),
                ),
                "list sources",
            )
            .await?;

        let mut sources: Vec<SourceFileSummary> = Vec::new();
        for row in rows {
            match sources.last_mut() {
                Some(last) if last.source_file_name == row.source_file_name => {
                    last.chunk_count += 1;
                    if row.created_at > last.last_ingested_at {
                        last.last_ingested_at = row.created_at;
                    }
                }
                _ => sources.push(SourceFileSummary {
                    source_file_name: row.source_file_name,
                    chunk_count: 1,
                    last_ingested_at: row.created_at,
                }),
            }
        }
        Ok(sources)
    }
}

#[async_trait]
impl ConversationStore for SupabaseStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.send_empty(
            self.request(Method::POST, CONVERSATIONS).json(conversation),
            "create conversation",
        )
        .await
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let rows: Vec<Conversation> = self
            .send_json(
                self.request(Method::GET, &format!("{}?id=eq.{}", CONVERSATIONS, id)),
                "get conversation",
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn touch_conversation(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let rows: Vec<serde_json::Value> = self
            .send_json(
                self.request(
                    Method::PATCH,
                    &format!("{}?id=eq.{}&select=id", CONVERSATIONS, id),
                )
                .header("Prefer", "return=representation")
                .json(&serde_json::json!({ "updated_at": at })),
                "touch conversation",
            )
            .await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(format!("conversation {}", id)));
        }
        Ok(())
    }

    async fn append_message(&self, message: &ConversationMessage) -> Result<(), StoreError> {
        self.send_empty(
            self.request(Method::POST, MESSAGES).json(message),
            "append message",
        )
        .await
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        let mut rows: Vec<ConversationMessage> = self
            .send_json(
                self.request(
                    Method::GET,
                    &format!(
                        "{}?conversation_id=eq.{}&order=created_at.desc&limit={}",
                        MESSAGES, conversation_id, limit
                    ),
                ),
                "list messages",
            )
            .await?;
        rows.reverse();
        Ok(rows)
    }
}

#[async_trait]
impl CollaborationStore for SupabaseStore {
    async fn upsert_follow(&self, follow: &FollowRelationship) -> Result<(), StoreError> {
        self.send_empty(
            self.request(
                Method::POST,
                &format!("{}?on_conflict=requester_id,target_id", FOLLOWS),
            )
            .header("Prefer", "resolution=merge-duplicates")
            .json(follow),
            "upsert follow",
        )
        .await
    }

    async fn get_follow(
        &self,
        requester_id: Uuid,
        target_id: Uuid,
    ) -> Result<Option<FollowRelationship>, StoreError> {
        let rows: Vec<FollowRelationship> = self
            .send_json(
                self.request(
                    Method::GET,
                    &format!(
                        "{}?requester_id=eq.{}&target_id=eq.{}",
                        FOLLOWS, requester_id, target_id
                    ),
                ),
                "get follow",
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn set_follow_status(
        &self,
        requester_id: Uuid,
        target_id: Uuid,
        status: FollowStatus,
    ) -> Result<Option<FollowRelationship>, StoreError> {
        let rows: Vec<FollowRelationship> = self
            .send_json(
                self.request(
                    Method::PATCH,
                    &format!(
                        "{}?requester_id=eq.{}&target_id=eq.{}",
                        FOLLOWS, requester_id, target_id
                    ),
                )
                .header("Prefer", "return=representation")
                .json(&serde_json::json!({ "status": status, "updated_at": Utc::now() })),
                "update follow",
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list_follows_by_requester(
        &self,
        requester_id: Uuid,
    ) -> Result<Vec<FollowRelationship>, StoreError> {
        self.send_json(
            self.request(
                Method::GET,
                &format!(
                    "{}?requester_id=eq.{}&order=created_at.desc",
                    FOLLOWS, requester_id
                ),
            ),
            "list follows",
        )
        .await
    }

    async fn list_follows_by_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<FollowRelationship>, StoreError> {
        self.send_json(
            self.request(
                Method::GET,
                &format!("{}?target_id=eq.{}&order=created_at.desc", FOLLOWS, target_id),
            ),
            "list follows",
        )
        .await
    }

    async fn create_task(&self, task: &CollaborationTask) -> Result<(), StoreError> {
        self.send_empty(
            self.request(Method::POST, TASKS).json(task),
            "create task",
        )
        .await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<CollaborationTask>, StoreError> {
        let rows: Vec<CollaborationTask> = self
            .send_json(
                self.request(Method::GET, &format!("{}?id=eq.{}", TASKS, id)),
                "get task",
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list_tasks_by_requester(
        &self,
        requester_id: Uuid,
    ) -> Result<Vec<CollaborationTask>, StoreError> {
        self.send_json(
            self.request(
                Method::GET,
                &format!(
                    "{}?requester_id=eq.{}&order=created_at.desc",
                    TASKS, requester_id
                ),
            ),
            "list tasks",
        )
        .await
    }

    async fn list_tasks_by_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<CollaborationTask>, StoreError> {
        self.send_json(
            self.request(
                Method::GET,
                &format!("{}?target_id=eq.{}&order=created_at.desc", TASKS, target_id),
            ),
            "list tasks",
        )
        .await
    }

    async fn list_pending_tasks(
        &self,
        target_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<CollaborationTask>, StoreError> {
        let target_filter = target_id
            .map(|id| format!("&target_id=eq.{}", id))
            .unwrap_or_default();
        self.send_json(
            self.request(
                Method::GET,
                &format!(
                    "{}?status=eq.pending{}&order=priority.desc.nullslast,created_at.asc&limit={}",
                    TASKS, target_filter, limit
                ),
            ),
            "list pending tasks",
        )
        .await
    }

    async fn list_unsurfaced_tasks(&self) -> Result<Vec<CollaborationTask>, StoreError> {
        let statuses = TaskStatus::UNSURFACED
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",");
        self.send_json(
            self.request(
                Method::GET,
                &format!("{}?status=in.({})&order=created_at.asc", TASKS, statuses),
            ),
            "list unsurfaced tasks",
        )
        .await
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

        let mut updates = serde_json::json!({
            "status": transition.to,
            "updated_at": Utc::now(),
        });
        if let Some(response) = &transition.response {
            updates["response"] = serde_json::json!(response);
        }
        if let Some(error) = &transition.error_message {
            updates["error_message"] = serde_json::json!(error);
        }

        let rows: Vec<CollaborationTask> = self
            .send_json(
                self.request(
                    Method::PATCH,
                    &format!(
                        "{}?id=eq.{}&status=eq.{}",
                        TASKS,
                        id,
                        transition.from.as_str()
                    ),
                )
                .header("Prefer", "return=representation")
                .json(&updates),
                "transition task",
            )
            .await?;

        match rows.into_iter().next() {
            Some(task) => Ok(Some(task)),
            None => match self.get_task(id).await? {
                Some(_) => Ok(None),
                None => Err(StoreError::NotFound(format!("task {}", id))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_is_parsed() {
        assert_eq!(parse_content_range_total("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-24/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn vector_literal_matches_pgvector_format() {
        assert_eq!(vector_literal(&[0.5, -1.0, 0.0]), "[0.5,-1,0]");
        assert_eq!(vector_literal(&[]), "[]");
    }

    #[test]
    fn rest_url_strips_trailing_slash() {
        let store = SupabaseStore::new("https://abc.supabase.co/", "key");
        assert_eq!(store.rest_url(), "https://abc.supabase.co/rest/v1");
    }

    #[test]
    fn rpc_rows_decode_without_embedding() {
        let body = r#"[{
            "id": "8d3c5c8e-3f0b-4d7a-9d59-8f9b1c1f2a10",
            "workspace_id": "0f6a3c1e-8d2b-4a4e-9b71-2c1d5e6f7a8b",
            "content": "region: EMEA | revenue: 42",
            "source_file_name": "sales.csv",
            "created_at": "2024-05-01T10:00:00Z",
            "metadata": {"chunk_index": 0, "total_chunks": 1, "strategy": "recursive_v1"},
            "similarity": 0.83
        }]"#;
        let rows: Vec<ChunkRow> = serde_json::from_str(body).unwrap();
        let hit = RetrievedChunk::from(rows.into_iter().next().unwrap());
        assert_eq!(hit.source_file_name, "sales.csv");
        assert!((hit.similarity - 0.83).abs() < 1e-9);
        assert_eq!(hit.metadata.unwrap().total_chunks, 1);
    }
}
