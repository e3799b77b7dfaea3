//! API request and response types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collab::{FollowListing, ProcessedTask, TaskView};
use crate::knowledge::{IngestReport, RetrievalStrategy};
use crate::store::{
    AgentWorkspace, CollaborationTask, ConversationMessage, FollowRelationship, SourceFileSummary,
    TaskStatus,
};

/// How a query is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// From the caller's own workspace
    #[default]
    Local,
    /// Inline from another workspace
    SyncCollaboration,
    /// Queued as a collaboration task
    AsyncTask,
}

/// Request to ask a question.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,

    #[serde(default)]
    pub mode: QueryMode,

    /// Caller's workspace (defaults to their own)
    pub mindop_id: Option<Uuid>,

    /// Workspace asked in collaboration modes
    pub target_mindop_id: Option<Uuid>,

    /// Continue an existing conversation
    pub conversation_id: Option<Uuid>,

    /// Task priority in `async_task` mode (higher runs first)
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResponse {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub collaboration_task_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalStrategy>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub mindop_id: Uuid,
    #[serde(flatten)]
    pub report: IngestReport,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentsQuery {
    pub mindop_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentsResponse {
    pub success: bool,
    pub mindop_id: Uuid,
    pub documents: Vec<SourceFileSummary>,
}

/// Request to delete every chunk of one source file.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteDocumentRequest {
    pub mindop_id: Uuid,
    pub source_csv_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteDocumentResponse {
    pub success: bool,
    pub deleted_chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceResponse {
    pub success: bool,
    pub mindop: AgentWorkspace,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateWorkspaceRequest {
    pub mindop_id: Option<Uuid>,
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FollowRequest {
    pub target_mindop_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct FollowResponse {
    pub success: bool,
    pub follow: FollowRelationship,
}

#[derive(Debug, Clone, Serialize)]
pub struct FollowsResponse {
    pub success: bool,
    #[serde(flatten)]
    pub follows: FollowListing,
}

/// Processing actions accepted by `/api/collaboration/process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ProcessCollaborationTask,
    ProcessPendingTasks,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessRequest {
    pub action_type: ActionType,
    pub collaboration_task_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessResponse {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub collaboration_task_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub processed: Vec<ProcessedTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TasksQuery {
    #[serde(default)]
    pub view: TaskView,
}

#[derive(Debug, Clone, Serialize)]
pub struct TasksResponse {
    pub success: bool,
    pub tasks: Vec<CollaborationTask>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesResponse {
    pub success: bool,
    pub conversation_id: Uuid,
    pub messages: Vec<ConversationMessage>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether the server is running in dev mode (auth disabled)
    pub dev_mode: bool,
    pub store: String,
}
