//! Follow management, task processing, and the requester event stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Extension, Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::collab::SurfacedResult;
use crate::error::AppError;

use super::auth::AuthUser;
use super::error::{ApiError, ApiResult};
use super::routes::AppState;
use super::types::{
    ActionType, FollowRequest, FollowResponse, FollowsResponse, ProcessRequest, ProcessResponse,
    TasksQuery, TasksResponse,
};

const KEEPALIVE_SECS: u64 = 15;

pub async fn request_follow(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<FollowRequest>,
) -> ApiResult<FollowResponse> {
    let follow = state
        .collab
        .request_follow(&user.id, req.target_mindop_id)
        .await?;
    Ok(Json(FollowResponse {
        success: true,
        follow,
    }))
}

pub async fn list_follows(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<FollowsResponse> {
    let follows = state.collab.list_follows(&user.id).await?;
    Ok(Json(FollowsResponse {
        success: true,
        follows,
    }))
}

pub async fn approve_follow(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(requester_id): Path<Uuid>,
) -> ApiResult<FollowResponse> {
    respond(&state, &user, requester_id, true).await
}

pub async fn reject_follow(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(requester_id): Path<Uuid>,
) -> ApiResult<FollowResponse> {
    respond(&state, &user, requester_id, false).await
}

async fn respond(
    state: &AppState,
    user: &AuthUser,
    requester_id: Uuid,
    approve: bool,
) -> ApiResult<FollowResponse> {
    let follow = state
        .collab
        .respond_to_follow(&user.id, requester_id, approve)
        .await?;
    Ok(Json(FollowResponse {
        success: true,
        follow,
    }))
}

/// Run one task, or one batch of the caller's pending tasks.
pub async fn process(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ProcessRequest>,
) -> ApiResult<ProcessResponse> {
    match req.action_type {
        ActionType::ProcessCollaborationTask => {
            let task_id = req.collaboration_task_id.ok_or_else(|| {
                ApiError(AppError::validation(
                    "collaboration_task_id is required for process_collaboration_task",
                ))
            })?;
            let task = state.collab.process_task(&user.id, task_id).await?;
            Ok(Json(ProcessResponse {
                success: true,
                collaboration_task_id: Some(task.id),
                status: Some(task.status),
                response: task.response,
                ..Default::default()
            }))
        }
        ActionType::ProcessPendingTasks => {
            let processed = state.collab.process_my_pending(&user.id).await?;
            Ok(Json(ProcessResponse {
                success: true,
                processed,
                ..Default::default()
            }))
        }
    }
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(q): Query<TasksQuery>,
) -> ApiResult<TasksResponse> {
    let tasks = state.collab.list_tasks(&user.id, q.view).await?;
    Ok(Json(TasksResponse {
        success: true,
        tasks,
    }))
}

fn surfaced_event(result: &SurfacedResult) -> Event {
    match Event::default().event(result.event_name()).json_data(result) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("Could not encode event for task {}: {}", result.task_id, e);
            Event::default().event("error").data("event encoding failed")
        }
    }
}

/// Stream answers to the caller's outstanding tasks via SSE.
pub async fn events(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let workspace = state.workspaces.get_or_create(&user.id).await?;
    let mut rx = state.collab.poller().subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(result) if result.requester_id == workspace.id => {
                    yield Ok(surfaced_event(&result));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    yield Ok(Event::default()
                        .event("error")
                        .data(format!("event stream lagged; {} events were dropped", skipped)));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(KEEPALIVE_SECS))
            .text("keepalive"),
    ))
}
