//! Query endpoint: local answers, inline collaboration, and queued tasks.

use std::sync::Arc;

use axum::extract::{Extension, Path, State};
use axum::Json;
use uuid::Uuid;

use crate::error::AppError;

use super::auth::AuthUser;
use super::error::{ApiError, ApiResult};
use super::routes::AppState;
use super::types::{MessagesResponse, QueryMode, QueryRequest, QueryResponse};

pub async fn query(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<QueryResponse> {
    let response = match req.mode {
        QueryMode::Local => {
            let answer = state
                .query
                .ask(&user.id, &req.query, req.mindop_id, req.conversation_id)
                .await?;
            QueryResponse {
                success: true,
                response: Some(answer.response),
                conversation_id: Some(answer.conversation_id),
                retrieval: Some(answer.retrieval),
                sources: answer.sources,
                ..Default::default()
            }
        }
        QueryMode::SyncCollaboration => {
            let target = require_target(&req)?;
            let answer = state
                .collab
                .ask_sync(&user.id, &req.query, target, req.conversation_id)
                .await?;
            QueryResponse {
                success: true,
                response: Some(answer.response),
                conversation_id: Some(answer.conversation_id),
                ..Default::default()
            }
        }
        QueryMode::AsyncTask => {
            let target = require_target(&req)?;
            let submitted = state
                .collab
                .submit_task(
                    &user.id,
                    &req.query,
                    target,
                    req.conversation_id,
                    req.priority,
                )
                .await?;
            QueryResponse {
                success: true,
                response: Some(
                    "Your question was sent. The answer will appear in this conversation."
                        .to_string(),
                ),
                conversation_id: Some(submitted.conversation_id),
                collaboration_task_id: Some(submitted.task.id),
                ..Default::default()
            }
        }
    };
    Ok(Json(response))
}

fn require_target(req: &QueryRequest) -> Result<Uuid, ApiError> {
    req.target_mindop_id.ok_or_else(|| {
        ApiError(AppError::validation(
            "target_mindop_id is required in collaboration modes",
        ))
    })
}

pub async fn conversation_messages(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<MessagesResponse> {
    let messages = state.query.conversations().messages(&user.id, id).await?;
    Ok(Json(MessagesResponse {
        success: true,
        conversation_id: id,
        messages,
    }))
}
