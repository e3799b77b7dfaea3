//! Application error taxonomy shared by ingestion, query, and collaboration.

use thiserror::Error;
use uuid::Uuid;

use crate::llm::LlmError;
use crate::store::{StoreError, TaskStatus};

#[derive(Debug, Error)]
pub enum AppError {
    /// Rejected before any external call; nothing was written.
    #[error("{0}")]
    Validation(String),

    #[error("embedding failed: {0}")]
    Embedding(LlmError),

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("generation failed: {0}")]
    Generation(LlmError),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("task {task_id} is {status}, expected pending")]
    InvalidTaskState { task_id: Uuid, status: TaskStatus },

    #[error("The request took too long to complete after {0:?}. Please try again.")]
    Timeout(std::time::Duration),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Storage(StoreError),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn not_authorized(message: impl Into<String>) -> Self {
        AppError::NotAuthorized(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Embedding(_) => "embedding_error",
            AppError::Retrieval(_) => "retrieval_error",
            AppError::Generation(_) => "generation_error",
            AppError::NotAuthorized(_) => "not_authorized",
            AppError::InvalidTaskState { .. } => "invalid_task_state",
            AppError::Timeout(_) => "timeout",
            AppError::NotFound(_) => "not_found",
            AppError::Storage(_) => "storage_error",
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => AppError::NotFound(what),
            other => AppError::Storage(other),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_distinguish_the_taxonomy() {
        let embedding = AppError::Embedding(LlmError::rate_limited("busy".into(), None));
        let generation = AppError::Generation(LlmError::server_error(500, "down".into()));
        assert_eq!(embedding.code(), "embedding_error");
        assert_eq!(generation.code(), "generation_error");
        assert_ne!(embedding.code(), generation.code());
        assert_eq!(
            AppError::Timeout(std::time::Duration::from_secs(60)).code(),
            "timeout"
        );
    }

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err: AppError = StoreError::NotFound("task 1".into()).into();
        assert!(matches!(err, AppError::NotFound(_)));
        let err: AppError = StoreError::Backend("disk".into()).into();
        assert_eq!(err.code(), "storage_error");
    }

    #[test]
    fn invalid_state_message_names_the_status() {
        let err = AppError::InvalidTaskState {
            task_id: Uuid::nil(),
            status: TaskStatus::Complete,
        };
        assert!(err.to_string().contains("complete"));
    }
}
