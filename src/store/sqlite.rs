//! SQLite-backed store.
//!
//! Embeddings are stored as JSON arrays; similarity is computed in-process
//! over the workspace's rows.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    rank_chunks, AgentWorkspace, ChunkMetadata, ChunkStore, CollaborationStore, CollaborationTask,
    Conversation, ConversationMessage, ConversationStore, DocumentChunk, FollowRelationship,
    FollowStatus, RetrievedChunk, SourceFileSummary, StoreError, TaskStatus, TaskTransition,
    WorkspaceStore,
};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY NOT NULL,
    owner_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workspaces_owner ON workspaces(owner_id, created_at);

CREATE TABLE IF NOT EXISTS document_chunks (
    id TEXT PRIMARY KEY NOT NULL,
    workspace_id TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding TEXT NOT NULL,
    source_file_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_chunks_workspace ON document_chunks(workspace_id, created_at);
CREATE INDEX IF NOT EXISTS idx_chunks_source ON document_chunks(workspace_id, source_file_name);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY NOT NULL,
    owner_id TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    title TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_messages (
    id TEXT PRIMARY KEY NOT NULL,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    sender_workspace_id TEXT,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON conversation_messages(conversation_id, created_at);

CREATE TABLE IF NOT EXISTS follow_relationships (
    requester_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (requester_id, target_id)
);

CREATE INDEX IF NOT EXISTS idx_follows_target ON follow_relationships(target_id);

CREATE TABLE IF NOT EXISTS collaboration_tasks (
    id TEXT PRIMARY KEY NOT NULL,
    requester_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    query TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    response TEXT,
    error_message TEXT,
    priority INTEGER,
    requester_conversation_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_requester ON collaboration_tasks(requester_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_tasks_target ON collaboration_tasks(target_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON collaboration_tasks(status, created_at);
"#;

const TASK_COLUMNS: &str = "id, requester_id, target_id, query, status, response, error_message, \
     priority, requester_conversation_id, created_at, updated_at";

const CHUNK_COLUMNS: &str =
    "id, workspace_id, content, embedding, source_file_name, created_at, metadata";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open(db_path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Backend(format!("Failed to create data dir: {}", e)))?;
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            tracing::info!("Opened SQLite store at {}", db_path.display());
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("Task join error: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("Task join error: {}", e)))?
    }
}

fn ts(at: &DateTime<Utc>) -> String {
    // Fixed width so lexical order matches time order
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<AgentWorkspace> {
    Ok(AgentWorkspace {
        id: uuid_col(row, 0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_at: ts_col(row, 4)?,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<DocumentChunk> {
    let embedding: String = row.get(3)?;
    let metadata: Option<String> = row.get(6)?;
    Ok(DocumentChunk {
        id: uuid_col(row, 0)?,
        workspace_id: uuid_col(row, 1)?,
        content: row.get(2)?,
        embedding: serde_json::from_str(&embedding).map_err(|e| conversion_error(3, e))?,
        source_file_name: row.get(4)?,
        created_at: ts_col(row, 5)?,
        metadata: metadata
            .map(|m| serde_json::from_str::<ChunkMetadata>(&m))
            .transpose()
            .map_err(|e| conversion_error(6, e))?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_col(row, 0)?,
        owner_id: row.get(1)?,
        workspace_id: uuid_col(row, 2)?,
        title: row.get(3)?,
        created_at: ts_col(row, 4)?,
        updated_at: ts_col(row, 5)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationMessage> {
    Ok(ConversationMessage {
        id: uuid_col(row, 0)?,
        conversation_id: uuid_col(row, 1)?,
        role: parsed_col(row, 2)?,
        sender_workspace_id: opt_uuid_col(row, 3)?,
        content: row.get(4)?,
        created_at: ts_col(row, 5)?,
    })
}

fn follow_from_row(row: &Row<'_>) -> rusqlite::Result<FollowRelationship> {
    Ok(FollowRelationship {
        requester_id: uuid_col(row, 0)?,
        target_id: uuid_col(row, 1)?,
        status: parsed_col(row, 2)?,
        created_at: ts_col(row, 3)?,
        updated_at: ts_col(row, 4)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<CollaborationTask> {
    Ok(CollaborationTask {
        id: uuid_col(row, 0)?,
        requester_id: uuid_col(row, 1)?,
        target_id: uuid_col(row, 2)?,
        query: row.get(3)?,
        status: parsed_col(row, 4)?,
        response: row.get(5)?,
        error_message: row.get(6)?,
        priority: row.get(7)?,
        requester_conversation_id: opt_uuid_col(row, 8)?,
        created_at: ts_col(row, 9)?,
        updated_at: ts_col(row, 10)?,
    })
}

fn get_task_sync(conn: &Connection, id: Uuid) -> Result<Option<CollaborationTask>, StoreError> {
    let sql = format!("SELECT {} FROM collaboration_tasks WHERE id = ?1", TASK_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id.to_string()], task_from_row)
        .optional()?)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl WorkspaceStore for SqliteStore {
    async fn get_workspace(&self, id: Uuid) -> Result<Option<AgentWorkspace>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, owner_id, name, description, created_at FROM workspaces WHERE id = ?1",
                    params![id.to_string()],
                    workspace_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn get_workspace_by_owner(
        &self,
        owner_id: &str,
    ) -> Result<Option<AgentWorkspace>, StoreError> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, owner_id, name, description, created_at FROM workspaces \
                     WHERE owner_id = ?1 ORDER BY created_at ASC LIMIT 1",
                    params![owner_id],
                    workspace_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn create_workspace(&self, workspace: &AgentWorkspace) -> Result<(), StoreError> {
        let workspace = workspace.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO workspaces (id, owner_id, name, description, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    workspace.id.to_string(),
                    workspace.owner_id,
                    workspace.name,
                    workspace.description,
                    ts(&workspace.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_workspace(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<AgentWorkspace>, StoreError> {
        let name = name.map(str::to_string);
        let description = description.map(str::to_string);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE workspaces SET name = COALESCE(?1, name), \
                 description = COALESCE(?2, description) WHERE id = ?3",
                params![name, description, id.to_string()],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            Ok(conn
                .query_row(
                    "SELECT id, owner_id, name, description, created_at FROM workspaces WHERE id = ?1",
                    params![id.to_string()],
                    workspace_from_row,
                )
                .optional()?)
        })
        .await
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn insert_chunks(&self, chunks: &[DocumentChunk]) -> Result<usize, StoreError> {
        let chunks = chunks.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO document_chunks \
                     (id, workspace_id, content, embedding, source_file_name, created_at, metadata) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for chunk in &chunks {
                    let metadata = chunk
                        .metadata
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?;
                    inserted += stmt.execute(params![
                        chunk.id.to_string(),
                        chunk.workspace_id.to_string(),
                        chunk.content,
                        serde_json::to_string(&chunk.embedding)?,
                        chunk.source_file_name,
                        ts(&chunk.created_at),
                        metadata,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn count_chunks(&self, workspace_id: Uuid) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM document_chunks WHERE workspace_id = ?1",
                params![workspace_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn count_chunks_for_source(
        &self,
        workspace_id: Uuid,
        source_file_name: &str,
    ) -> Result<usize, StoreError> {
        let source = source_file_name.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM document_chunks WHERE workspace_id = ?1 AND source_file_name = ?2",
                params![workspace_id.to_string(), source],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn search_chunks(
        &self,
        workspace_id: Uuid,
        query_embedding: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError> {
        let query_embedding = query_embedding.to_vec();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM document_chunks WHERE workspace_id = ?1",
                CHUNK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let chunks = stmt
                .query_map(params![workspace_id.to_string()], chunk_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rank_chunks(chunks.iter(), &query_embedding, threshold, limit))
        })
        .await
    }

    async fn recent_chunks(
        &self,
        workspace_id: Uuid,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM document_chunks WHERE workspace_id = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                CHUNK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let chunks = stmt
                .query_map(
                    params![workspace_id.to_string(), sql_limit(limit)],
                    chunk_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(chunks
                .iter()
                .map(|c| RetrievedChunk::from_chunk(c, 0.0))
                .collect())
        })
        .await
    }

    async fn delete_chunks_by_source(
        &self,
        workspace_id: Uuid,
        source_file_name: &str,
    ) -> Result<usize, StoreError> {
        let source = source_file_name.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM document_chunks WHERE workspace_id = ?1 AND source_file_name = ?2",
                params![workspace_id.to_string(), source],
            )?)
        })
        .await
    }

    async fn list_sources(
        &self,
        workspace_id: Uuid,
    ) -> Result<Vec<SourceFileSummary>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT source_file_name, COUNT(*), MAX(created_at) FROM document_chunks \
                 WHERE workspace_id = ?1 GROUP BY source_file_name ORDER BY source_file_name",
            )?;
            let sources = stmt
                .query_map(params![workspace_id.to_string()], |row| {
                    let count: i64 = row.get(1)?;
                    Ok(SourceFileSummary {
                        source_file_name: row.get(0)?,
                        chunk_count: count as usize,
                        last_ingested_at: ts_col(row, 2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sources)
        })
        .await
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let conversation = conversation.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, owner_id, workspace_id, title, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    conversation.id.to_string(),
                    conversation.owner_id,
                    conversation.workspace_id.to_string(),
                    conversation.title,
                    ts(&conversation.created_at),
                    ts(&conversation.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, owner_id, workspace_id, title, created_at, updated_at \
                     FROM conversations WHERE id = ?1",
                    params![id.to_string()],
                    conversation_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn touch_conversation(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![ts(&at), id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("conversation {}", id)));
            }
            Ok(())
        })
        .await
    }

    async fn append_message(&self, message: &ConversationMessage) -> Result<(), StoreError> {
        let message = message.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversation_messages \
                 (id, conversation_id, role, sender_workspace_id, content, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.role.to_string(),
                    message.sender_workspace_id.map(|id| id.to_string()),
                    message.content,
                    ts(&message.created_at),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::NotFound(format!("conversation {}", message.conversation_id))
                }
                other => other.into(),
            })?;
            Ok(())
        })
        .await
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, sender_workspace_id, content, created_at \
                 FROM conversation_messages WHERE conversation_id = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )?;
            let mut messages = stmt
                .query_map(
                    params![conversation_id.to_string(), sql_limit(limit)],
                    message_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }
}

#[async_trait]
impl CollaborationStore for SqliteStore {
    async fn upsert_follow(&self, follow: &FollowRelationship) -> Result<(), StoreError> {
        let follow = follow.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO follow_relationships (requester_id, target_id, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(requester_id, target_id) DO UPDATE SET \
                 status = excluded.status, updated_at = excluded.updated_at",
                params![
                    follow.requester_id.to_string(),
                    follow.target_id.to_string(),
                    follow.status.to_string(),
                    ts(&follow.created_at),
                    ts(&follow.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_follow(
        &self,
        requester_id: Uuid,
        target_id: Uuid,
    ) -> Result<Option<FollowRelationship>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT requester_id, target_id, status, created_at, updated_at \
                     FROM follow_relationships WHERE requester_id = ?1 AND target_id = ?2",
                    params![requester_id.to_string(), target_id.to_string()],
                    follow_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn set_follow_status(
        &self,
        requester_id: Uuid,
        target_id: Uuid,
        status: FollowStatus,
    ) -> Result<Option<FollowRelationship>, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE follow_relationships SET status = ?1, updated_at = ?2 \
                 WHERE requester_id = ?3 AND target_id = ?4",
                params![
                    status.to_string(),
                    ts(&Utc::now()),
                    requester_id.to_string(),
                    target_id.to_string(),
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            Ok(conn
                .query_row(
                    "SELECT requester_id, target_id, status, created_at, updated_at \
                     FROM follow_relationships WHERE requester_id = ?1 AND target_id = ?2",
                    params![requester_id.to_string(), target_id.to_string()],
                    follow_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_follows_by_requester(
        &self,
        requester_id: Uuid,
    ) -> Result<Vec<FollowRelationship>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT requester_id, target_id, status, created_at, updated_at \
                 FROM follow_relationships WHERE requester_id = ?1 ORDER BY created_at DESC",
            )?;
            let follows = stmt
                .query_map(params![requester_id.to_string()], follow_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(follows)
        })
        .await
    }

    async fn list_follows_by_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<FollowRelationship>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT requester_id, target_id, status, created_at, updated_at \
                 FROM follow_relationships WHERE target_id = ?1 ORDER BY created_at DESC",
            )?;
            let follows = stmt
                .query_map(params![target_id.to_string()], follow_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(follows)
        })
        .await
    }

    async fn create_task(&self, task: &CollaborationTask) -> Result<(), StoreError> {
        let task = task.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO collaboration_tasks \
                 (id, requester_id, target_id, query, status, response, error_message, \
                  priority, requester_conversation_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.id.to_string(),
                    task.requester_id.to_string(),
                    task.target_id.to_string(),
                    task.query,
                    task.status.as_str(),
                    task.response,
                    task.error_message,
                    task.priority,
                    task.requester_conversation_id.map(|id| id.to_string()),
                    ts(&task.created_at),
                    ts(&task.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<CollaborationTask>, StoreError> {
        self.with_conn(move |conn| get_task_sync(conn, id)).await
    }

    async fn list_tasks_by_requester(
        &self,
        requester_id: Uuid,
    ) -> Result<Vec<CollaborationTask>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM collaboration_tasks WHERE requester_id = ?1 ORDER BY created_at DESC",
                TASK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(params![requester_id.to_string()], task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    async fn list_tasks_by_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<CollaborationTask>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM collaboration_tasks WHERE target_id = ?1 ORDER BY created_at DESC",
                TASK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(params![target_id.to_string()], task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    async fn list_pending_tasks(
        &self,
        target_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<CollaborationTask>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM collaboration_tasks \
                 WHERE status = 'pending' AND (?1 IS NULL OR target_id = ?1) \
                 ORDER BY priority IS NULL, priority DESC, created_at ASC LIMIT ?2",
                TASK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(
                    params![target_id.map(|id| id.to_string()), sql_limit(limit)],
                    task_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    async fn list_unsurfaced_tasks(&self) -> Result<Vec<CollaborationTask>, StoreError> {
        self.with_conn(move |conn| {
            let statuses = TaskStatus::UNSURFACED
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {} FROM collaboration_tasks WHERE status IN ({}) ORDER BY created_at ASC",
                TASK_COLUMNS, statuses
            );
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map([], task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
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
        let transition = transition.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE collaboration_tasks SET status = ?1, \
                 response = COALESCE(?2, response), \
                 error_message = COALESCE(?3, error_message), \
                 updated_at = ?4 \
                 WHERE id = ?5 AND status = ?6",
                params![
                    transition.to.as_str(),
                    transition.response,
                    transition.error_message,
                    ts(&Utc::now()),
                    id.to_string(),
                    transition.from.as_str(),
                ],
            )?;
            let task = get_task_sync(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
            if changed == 0 {
                return Ok(None);
            }
            Ok(Some(task))
        })
        .await
    }
}
