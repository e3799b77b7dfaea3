//! Agent workspace resolution and ownership checks.

use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::{AgentWorkspace, SharedStore};

const DEFAULT_WORKSPACE_NAME: &str = "My MindOp";

#[derive(Clone)]
pub struct Workspaces {
    store: SharedStore,
}

impl Workspaces {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// The caller's workspace, created on first use.
    pub async fn get_or_create(&self, user_id: &str) -> AppResult<AgentWorkspace> {
        if let Some(existing) = self.store.get_workspace_by_owner(user_id).await? {
            return Ok(existing);
        }
        let workspace = AgentWorkspace::new(user_id, DEFAULT_WORKSPACE_NAME);
        self.store.create_workspace(&workspace).await?;
        tracing::info!("Created workspace {} for user {}", workspace.id, user_id);
        Ok(workspace)
    }

    /// A workspace the caller owns: the given id, or their default one.
    pub async fn resolve_owned(
        &self,
        user_id: &str,
        workspace_id: Option<Uuid>,
    ) -> AppResult<AgentWorkspace> {
        match workspace_id {
            Some(id) => self.require_owned(user_id, id).await,
            None => self.get_or_create(user_id).await,
        }
    }

    pub async fn get(&self, id: Uuid) -> AppResult<AgentWorkspace> {
        self.store
            .get_workspace(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("workspace {}", id)))
    }

    /// Load `id` and check that `user_id` owns it.
    pub async fn require_owned(&self, user_id: &str, id: Uuid) -> AppResult<AgentWorkspace> {
        let workspace = self.get(id).await?;
        if !workspace.is_owned_by(user_id) {
            return Err(AppError::not_authorized(format!(
                "workspace {} belongs to another user",
                id
            )));
        }
        Ok(workspace)
    }

    /// Rename or re-describe the caller's workspace.
    pub async fn update(
        &self,
        user_id: &str,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> AppResult<AgentWorkspace> {
        self.require_owned(user_id, id).await?;
        if let Some(name) = name {
            if name.trim().is_empty() {
                return Err(AppError::validation("Workspace name cannot be empty"));
            }
        }
        self.store
            .update_workspace(id, name.map(str::trim), description)
            .await?
            .ok_or_else(|| AppError::not_found(format!("workspace {}", id)))
    }
}
