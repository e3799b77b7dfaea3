//! Cross-agent collaboration: follow approval, synchronous answers, and the
//! queued task lifecycle `pending -> processing -> complete | failed`.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::poller::TaskPoller;
use crate::error::{AppError, AppResult};
use crate::query::{validate_query, QueryEngine};
use crate::store::{
    AgentWorkspace, CollaborationTask, FollowRelationship, FollowStatus, SharedStore, TaskStatus,
    TaskTransition,
};
use crate::workspaces::Workspaces;

/// Cap on the pending listing view.
const PENDING_VIEW_LIMIT: usize = 100;

/// Which side of the task table a listing shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskView {
    /// Tasks the caller asked
    #[default]
    Requester,
    /// Tasks asked of the caller
    Target,
    /// Tasks waiting for the caller to process
    Pending,
}

#[derive(Debug, Clone, Serialize)]
pub struct FollowListing {
    pub outgoing: Vec<FollowRelationship>,
    pub incoming: Vec<FollowRelationship>,
}

/// Inline answer from another workspace.
#[derive(Debug, Clone, Serialize)]
pub struct CollaborationAnswer {
    pub response: String,
    pub conversation_id: Uuid,
    pub target_mindop_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedTask {
    pub task: CollaborationTask,
    pub conversation_id: Uuid,
}

/// Outcome of one task in a processing batch.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedTask {
    pub task_id: Uuid,
    /// Status after the attempt; `None` when the task was skipped
    pub status: Option<TaskStatus>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct CollaborationEngine {
    store: SharedStore,
    workspaces: Workspaces,
    query: QueryEngine,
    poller: TaskPoller,
    batch_size: usize,
}

impl CollaborationEngine {
    pub fn new(
        store: SharedStore,
        query: QueryEngine,
        poller: TaskPoller,
        batch_size: usize,
    ) -> Self {
        Self {
            workspaces: Workspaces::new(store.clone()),
            store,
            query,
            poller,
            batch_size: batch_size.max(1),
        }
    }

    pub fn poller(&self) -> &TaskPoller {
        &self.poller
    }

    // ==================== Follows ====================

    /// Ask to follow `target_id`. Re-requesting keeps an approved link.
    pub async fn request_follow(
        &self,
        user_id: &str,
        target_id: Uuid,
    ) -> AppResult<FollowRelationship> {
        let requester = self.workspaces.get_or_create(user_id).await?;
        if requester.id == target_id {
            return Err(AppError::validation("A workspace cannot follow itself"));
        }
        self.workspaces.get(target_id).await?;

        if let Some(existing) = self.store.get_follow(requester.id, target_id).await? {
            if existing.status != FollowStatus::Rejected {
                return Ok(existing);
            }
        }
        let follow = FollowRelationship::pending(requester.id, target_id);
        self.store.upsert_follow(&follow).await?;
        tracing::info!("Workspace {} requested to follow {}", requester.id, target_id);
        Ok(follow)
    }

    /// Approve or reject an incoming request, as the target owner.
    pub async fn respond_to_follow(
        &self,
        user_id: &str,
        requester_id: Uuid,
        approve: bool,
    ) -> AppResult<FollowRelationship> {
        let target = self.workspaces.get_or_create(user_id).await?;
        let status = if approve {
            FollowStatus::Approved
        } else {
            FollowStatus::Rejected
        };
        let follow = self
            .store
            .set_follow_status(requester_id, target.id, status)
            .await?
            .ok_or_else(|| {
                AppError::not_found(format!(
                    "follow request from {} to {}",
                    requester_id, target.id
                ))
            })?;
        tracing::info!("Follow {} -> {} is now {}", requester_id, target.id, status);
        Ok(follow)
    }

    pub async fn list_follows(&self, user_id: &str) -> AppResult<FollowListing> {
        let workspace = self.workspaces.get_or_create(user_id).await?;
        Ok(FollowListing {
            outgoing: self.store.list_follows_by_requester(workspace.id).await?,
            incoming: self.store.list_follows_by_target(workspace.id).await?,
        })
    }

    /// Fails unless `requester_id` holds an approved follow of `target_id`.
    pub async fn authorize(&self, requester_id: Uuid, target_id: Uuid) -> AppResult<()> {
        match self.store.get_follow(requester_id, target_id).await? {
            Some(follow) if follow.is_approved() => Ok(()),
            Some(follow) => Err(AppError::not_authorized(format!(
                "follow request to {} is {}",
                target_id, follow.status
            ))),
            None => Err(AppError::not_authorized(format!(
                "no approved connection to {}",
                target_id
            ))),
        }
    }

    // ==================== Synchronous mode ====================

    /// Answer `query` from the target's chunks inside this request. No task
    /// row is created; the exchange lands in the requester's conversation.
    pub async fn ask_sync(
        &self,
        user_id: &str,
        query: &str,
        target_id: Uuid,
        conversation_id: Option<Uuid>,
    ) -> AppResult<CollaborationAnswer> {
        let query = validate_query(query)?;
        let requester = self.workspaces.get_or_create(user_id).await?;
        self.authorize(requester.id, target_id).await?;

        self.query
            .bounded(self.ask_sync_inner(user_id, query, &requester, target_id, conversation_id))
            .await
    }

    async fn ask_sync_inner(
        &self,
        user_id: &str,
        query: &str,
        requester: &AgentWorkspace,
        target_id: Uuid,
        conversation_id: Option<Uuid>,
    ) -> AppResult<CollaborationAnswer> {
        let conversations = self.query.conversations();
        let target = self.workspaces.get(target_id).await?;
        let existing = match conversation_id {
            Some(id) => Some(conversations.load_owned(user_id, id).await?),
            None => None,
        };

        let answer = self.query.generate_answer(&target, query, &[]).await?;

        let conversation = conversations
            .ensure(existing, user_id, requester.id, query)
            .await?;
        conversations
            .record_exchange(conversation.id, query, &answer.text, target.id)
            .await?;

        tracing::info!(
            "Workspace {} answered {} inline ({:?})",
            target.id,
            requester.id,
            answer.strategy
        );
        Ok(CollaborationAnswer {
            response: answer.text,
            conversation_id: conversation.id,
            target_mindop_id: target.id,
        })
    }

    // ==================== Asynchronous mode ====================

    /// Queue `query` for the target and start polling for its answer.
    pub async fn submit_task(
        &self,
        user_id: &str,
        query: &str,
        target_id: Uuid,
        conversation_id: Option<Uuid>,
        priority: Option<i32>,
    ) -> AppResult<SubmittedTask> {
        let query = validate_query(query)?;
        let requester = self.workspaces.get_or_create(user_id).await?;
        self.authorize(requester.id, target_id).await?;
        self.workspaces.get(target_id).await?;

        let conversations = self.query.conversations();
        let existing = match conversation_id {
            Some(id) => Some(conversations.load_owned(user_id, id).await?),
            None => None,
        };
        let conversation = conversations
            .ensure(existing, user_id, requester.id, query)
            .await?;

        let mut task = CollaborationTask::new(requester.id, target_id, query);
        task.priority = priority;
        task.requester_conversation_id = Some(conversation.id);
        self.store.create_task(&task).await?;
        conversations.append_user(conversation.id, query).await?;

        self.poller.track(task.id).await;
        tracing::info!(
            "Queued collaboration task {} from {} to {}",
            task.id,
            requester.id,
            target_id
        );

        Ok(SubmittedTask {
            task,
            conversation_id: conversation.id,
        })
    }

    /// Process one pending task on behalf of `user_id`, who must own the
    /// target workspace.
    ///
    /// Authorization runs before the claim, so a rejected attempt leaves the
    /// task untouched. Once claimed, the task always ends `complete` or
    /// `failed`; a flow failure is recorded on the task and also returned.
    pub async fn process_task(&self, user_id: &str, task_id: Uuid) -> AppResult<CollaborationTask> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("collaboration task {}", task_id)))?;
        if task.status != TaskStatus::Pending {
            return Err(AppError::InvalidTaskState {
                task_id,
                status: task.status,
            });
        }

        let target = self.workspaces.get(task.target_id).await?;
        if !target.is_owned_by(user_id) {
            return Err(AppError::not_authorized(format!(
                "only the owner of workspace {} can process task {}",
                target.id, task_id
            )));
        }

        let claimed = match self
            .store
            .transition_task(task_id, &TaskTransition::claim())
            .await?
        {
            Some(claimed) => claimed,
            None => {
                let status = self
                    .store
                    .get_task(task_id)
                    .await?
                    .map(|t| t.status)
                    .unwrap_or(TaskStatus::Processing);
                tracing::debug!("Task {} was claimed by another worker", task_id);
                return Err(AppError::InvalidTaskState { task_id, status });
            }
        };
        tracing::info!("Processing collaboration task {} for workspace {}", task_id, target.id);

        self.run_claimed(&claimed, &target).await
    }

    async fn run_claimed(
        &self,
        task: &CollaborationTask,
        target: &AgentWorkspace,
    ) -> AppResult<CollaborationTask> {
        let outcome = AssertUnwindSafe(self.query.generate_answer(target, &task.query, &[]))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(answer)) => {
                match self
                    .store
                    .transition_task(task.id, &TaskTransition::complete(answer.text))
                    .await
                {
                    Ok(Some(done)) => {
                        tracing::info!("Collaboration task {} complete", task.id);
                        return Ok(done);
                    }
                    Ok(None) => AppError::InvalidTaskState {
                        task_id: task.id,
                        status: TaskStatus::Processing,
                    },
                    Err(e) => AppError::from(e),
                }
            }
            Ok(Err(e)) => e,
            Err(_) => AppError::Generation(crate::llm::LlmError::parse_error(
                "answer generation panicked".to_string(),
            )),
        };

        tracing::warn!("Collaboration task {} failed: {}", task.id, failure);
        match self
            .store
            .transition_task(task.id, &TaskTransition::fail(failure.to_string()))
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => tracing::warn!("Task {} left processing before it could fail", task.id),
            Err(e) => tracing::error!("Could not record failure of task {}: {}", task.id, e),
        }
        Err(failure)
    }

    /// Process up to one batch of `user_id`'s pending incoming tasks.
    pub async fn process_my_pending(&self, user_id: &str) -> AppResult<Vec<ProcessedTask>> {
        let target = self.workspaces.get_or_create(user_id).await?;
        let tasks = self
            .store
            .list_pending_tasks(Some(target.id), self.batch_size)
            .await?;
        let mut processed = Vec::with_capacity(tasks.len());
        for task in tasks {
            processed.push(self.process_one(user_id, task.id).await);
        }
        Ok(processed)
    }

    /// Process up to one batch of pending tasks across all targets, each as
    /// its target's owner.
    pub async fn process_pending(&self) -> AppResult<Vec<ProcessedTask>> {
        let tasks = self.store.list_pending_tasks(None, self.batch_size).await?;
        let mut processed = Vec::with_capacity(tasks.len());
        for task in tasks {
            let owner = match self.workspaces.get(task.target_id).await {
                Ok(target) => target.owner_id,
                Err(e) => {
                    tracing::warn!("Skipping task {}: {}", task.id, e);
                    processed.push(ProcessedTask {
                        task_id: task.id,
                        status: None,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };
            processed.push(self.process_one(&owner, task.id).await);
        }
        Ok(processed)
    }

    async fn process_one(&self, user_id: &str, task_id: Uuid) -> ProcessedTask {
        match self.process_task(user_id, task_id).await {
            Ok(task) => ProcessedTask {
                task_id,
                status: Some(task.status),
                error: None,
            },
            Err(e) => {
                let status = self
                    .store
                    .get_task(task_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|t| t.status);
                ProcessedTask {
                    task_id,
                    status,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    // ==================== Listings ====================

    pub async fn list_tasks(
        &self,
        user_id: &str,
        view: TaskView,
    ) -> AppResult<Vec<CollaborationTask>> {
        let workspace = self.workspaces.get_or_create(user_id).await?;
        let tasks = match view {
            TaskView::Requester => self.store.list_tasks_by_requester(workspace.id).await?,
            TaskView::Target => self.store.list_tasks_by_target(workspace.id).await?,
            TaskView::Pending => {
                self.store
                    .list_pending_tasks(Some(workspace.id), PENDING_VIEW_LIMIT)
                    .await?
            }
        };
        Ok(tasks)
    }
}
