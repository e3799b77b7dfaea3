//! Persisted entities shared by every store backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user's named container for ingested data, queries, and collaboration
/// identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentWorkspace {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentWorkspace {
    /// Create a workspace owned by `owner_id`.
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            name: name.into(),
            description: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }
}

/// Version tag of the algorithm that produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    /// Hierarchical separators with token-estimated overlap
    #[default]
    RecursiveV1,
}

/// Structured metadata recorded by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub chunk_index: usize,
    pub total_chunks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_name: Option<String>,
    #[serde(default)]
    pub strategy: ChunkingStrategy,
}

/// A bounded segment of source text with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub content: String,
    pub embedding: Vec<f32>,
    pub source_file_name: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<ChunkMetadata>,
}

/// A chunk returned by retrieval, ranked by similarity (embedding omitted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub content: String,
    pub source_file_name: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<ChunkMetadata>,
    pub similarity: f64,
}

impl RetrievedChunk {
    pub fn from_chunk(chunk: &DocumentChunk, similarity: f64) -> Self {
        Self {
            id: chunk.id,
            workspace_id: chunk.workspace_id,
            content: chunk.content.clone(),
            source_file_name: chunk.source_file_name.clone(),
            created_at: chunk.created_at,
            metadata: chunk.metadata.clone(),
            similarity,
        }
    }
}

/// Chunk count per ingested source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFileSummary {
    pub source_file_name: String,
    pub chunk_count: usize,
    pub last_ingested_at: DateTime<Utc>,
}

/// A persisted conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub owner_id: String,
    pub workspace_id: Uuid,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(owner_id: impl Into<String>, workspace_id: Uuid, title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            workspace_id,
            title,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Who produced a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown message role: {}", other)),
        }
    }
}

/// One append-only turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    /// Always set for `Agent` messages
    pub sender_workspace_id: Option<Uuid>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn user(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::User,
            sender_workspace_id: None,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn agent(conversation_id: Uuid, sender: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::Agent,
            sender_workspace_id: Some(sender),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Approval state of a follow request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for FollowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for FollowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown follow status: {}", other)),
        }
    }
}

/// Directed link authorizing `requester_id` to query `target_id` once approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowRelationship {
    pub requester_id: Uuid,
    pub target_id: Uuid,
    pub status: FollowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FollowRelationship {
    pub fn pending(requester_id: Uuid, target_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            requester_id,
            target_id,
            status: FollowStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == FollowStatus::Approved
    }
}

/// Lifecycle of a collaboration task.
///
/// `Pending -> Processing -> Complete | Failed`, and `Complete -> Consumed`
/// once the requester has surfaced the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Complete,
    Failed,
    /// Requester-side marker: the answer was delivered
    #[serde(rename = "completed")]
    Consumed,
}

impl TaskStatus {
    /// Whether `self -> next` is a legal (forward-only) transition.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Complete)
                | (TaskStatus::Processing, TaskStatus::Failed)
                | (TaskStatus::Complete, TaskStatus::Consumed)
        )
    }

    /// Statuses whose outcome the requester has not been handed yet.
    /// Failed tasks are surfaced once by the poller watching them and stay
    /// `Failed`, so they are not listed.
    pub const UNSURFACED: [TaskStatus; 3] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Complete,
    ];

    pub fn is_unsurfaced(self) -> bool {
        Self::UNSURFACED.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Consumed => "completed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Consumed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// A queued cross-agent query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationTask {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub target_id: Uuid,
    pub query: String,
    pub status: TaskStatus,
    pub response: Option<String>,
    pub error_message: Option<String>,
    /// Higher runs first; `None` sorts after every explicit priority
    pub priority: Option<i32>,
    /// Requester conversation that receives the answer
    pub requester_conversation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollaborationTask {
    pub fn new(requester_id: Uuid, target_id: Uuid, query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            requester_id,
            target_id,
            query: query.into(),
            status: TaskStatus::Pending,
            response: None,
            error_message: None,
            priority: None,
            requester_conversation_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A conditional status change: applied only while the task is still `from`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub response: Option<String>,
    pub error_message: Option<String>,
}

impl TaskTransition {
    pub fn claim() -> Self {
        Self {
            from: TaskStatus::Pending,
            to: TaskStatus::Processing,
            response: None,
            error_message: None,
        }
    }

    pub fn complete(response: impl Into<String>) -> Self {
        Self {
            from: TaskStatus::Processing,
            to: TaskStatus::Complete,
            response: Some(response.into()),
            error_message: None,
        }
    }

    pub fn fail(error_message: impl Into<String>) -> Self {
        Self {
            from: TaskStatus::Processing,
            to: TaskStatus::Failed,
            response: None,
            error_message: Some(error_message.into()),
        }
    }

    pub fn consume() -> Self {
        Self {
            from: TaskStatus::Complete,
            to: TaskStatus::Consumed,
            response: None,
            error_message: None,
        }
    }

    /// Apply the transition's payload to an in-memory copy of the task.
    pub fn apply(&self, task: &mut CollaborationTask) {
        task.status = self.to;
        if let Some(response) = &self.response {
            task.response = Some(response.clone());
        }
        if let Some(error) = &self.error_message {
            task.error_message = Some(error.clone());
        }
        task.updated_at = Utc::now();
    }
}

/// Sort pending tasks: priority descending (unset last), then oldest first.
pub fn sort_pending(tasks: &mut [CollaborationTask]) {
    tasks.sort_by(|a, b| {
        let pa = a.priority.map(i64::from).unwrap_or(i64::MIN);
        let pb = b.priority.map(i64::from).unwrap_or(i64::MIN);
        pb.cmp(&pa).then(a.created_at.cmp(&b.created_at))
    });
}
