//! Knowledge base endpoints: uploads, source listing, and workspace settings.

use std::sync::Arc;

use axum::extract::{Extension, Multipart, Query, State};
use axum::Json;
use uuid::Uuid;

use crate::error::AppError;
use crate::knowledge::MAX_UPLOAD_BYTES;

use super::auth::AuthUser;
use super::error::ApiResult;
use super::routes::AppState;
use super::types::{
    DeleteDocumentRequest, DeleteDocumentResponse, DocumentsQuery, DocumentsResponse,
    IngestResponse, UpdateWorkspaceRequest, WorkspaceResponse,
};

struct Upload {
    file_name: String,
    bytes: Vec<u8>,
}

/// Read the `file` part (and optional `mindop_id` part) of an upload form.
async fn read_upload(multipart: &mut Multipart) -> Result<(Upload, Option<Uuid>), AppError> {
    let mut upload = None;
    let mut mindop_id = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("Malformed upload: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::validation("Upload is missing a file name"))?;
                let mut bytes = Vec::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| AppError::validation(format!("Malformed upload: {}", e)))?
                {
                    if bytes.len() + chunk.len() > MAX_UPLOAD_BYTES {
                        return Err(AppError::validation(format!(
                            "File too large (max {} bytes)",
                            MAX_UPLOAD_BYTES
                        )));
                    }
                    bytes.extend_from_slice(&chunk);
                }
                upload = Some(Upload { file_name, bytes });
            }
            Some("mindop_id") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| AppError::validation(format!("Malformed upload: {}", e)))?;
                let id = raw
                    .trim()
                    .parse::<Uuid>()
                    .map_err(|_| AppError::validation("mindop_id must be a UUID"))?;
                mindop_id = Some(id);
            }
            _ => {}
        }
    }

    let upload = upload.ok_or_else(|| AppError::validation("Missing `file` field"))?;
    Ok((upload, mindop_id))
}

/// Ingest an uploaded CSV/TSV/spreadsheet into the caller's workspace.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    mut multipart: Multipart,
) -> ApiResult<IngestResponse> {
    let (upload, mindop_id) = read_upload(&mut multipart).await?;
    let workspace = state.workspaces.resolve_owned(&user.id, mindop_id).await?;

    let report = state
        .ingestor
        .ingest(&workspace, &upload.file_name, &upload.bytes)
        .await?;

    Ok(Json(IngestResponse {
        success: true,
        mindop_id: workspace.id,
        report,
    }))
}

pub async fn list_documents(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(q): Query<DocumentsQuery>,
) -> ApiResult<DocumentsResponse> {
    let workspace = state.workspaces.resolve_owned(&user.id, q.mindop_id).await?;
    let documents = state.ingestor.list_sources(&workspace).await?;
    Ok(Json(DocumentsResponse {
        success: true,
        mindop_id: workspace.id,
        documents,
    }))
}

/// Delete every chunk of one source file. Only the owner may delete.
pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<DeleteDocumentRequest>,
) -> ApiResult<DeleteDocumentResponse> {
    let workspace = state
        .workspaces
        .require_owned(&user.id, req.mindop_id)
        .await?;
    let deleted_chunks = state
        .ingestor
        .delete_source(&workspace, &req.source_csv_name)
        .await?;
    Ok(Json(DeleteDocumentResponse {
        success: true,
        deleted_chunks,
    }))
}

pub async fn get_workspace(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<WorkspaceResponse> {
    let mindop = state.workspaces.get_or_create(&user.id).await?;
    Ok(Json(WorkspaceResponse {
        success: true,
        mindop,
    }))
}

pub async fn update_workspace(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<UpdateWorkspaceRequest>,
) -> ApiResult<WorkspaceResponse> {
    let id = match req.mindop_id {
        Some(id) => id,
        None => state.workspaces.get_or_create(&user.id).await?.id,
    };
    let mindop = state
        .workspaces
        .update(&user.id, id, req.name.as_deref(), req.description.as_deref())
        .await?;
    Ok(Json(WorkspaceResponse {
        success: true,
        mindop,
    }))
}
