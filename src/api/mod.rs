//! HTTP API.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check (public)
//! - `POST /api/query` - Ask a question (`local`, `sync_collaboration`, `async_task`)
//! - `GET /api/conversations/{id}/messages` - Conversation transcript
//! - `POST /api/ingest` - Upload a CSV/TSV/spreadsheet (multipart `file`)
//! - `GET /api/documents` - List ingested source files
//! - `DELETE /api/documents` - Delete one source file's chunks
//! - `GET /api/workspace` / `PATCH /api/workspace` - The caller's workspace
//! - `GET /api/follows` / `POST /api/follows` - List or request follows
//! - `POST /api/follows/{requester_id}/approve` - Approve a follow request
//! - `POST /api/follows/{requester_id}/reject` - Reject a follow request
//! - `POST /api/collaboration/process` - Process one task or a pending batch
//! - `GET /api/collaboration/tasks?view=` - List tasks
//! - `GET /api/collaboration/events` - SSE stream of answered tasks

mod auth;
mod collaboration;
mod error;
mod knowledge;
mod query;
mod routes;
pub mod types;

pub use auth::AuthUser;
pub use error::{status_for, ApiError};
pub use routes::{build_router, serve, AppState};
