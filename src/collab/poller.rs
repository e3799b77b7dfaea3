//! Requester-side task poller.
//!
//! A single actor owns the set of outstanding task ids and the interval
//! timer. The timer only exists while the set is non-empty: it is created
//! when the first id is tracked and dropped when the last one is surfaced.
//! Callers talk to the actor through [`TaskPoller`] messages.
//!
//! On start the actor loads every unsurfaced task from the store, so answers
//! that arrived while no poller was running still reach the requester.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::query::ConversationManager;
use crate::store::{CollaborationTask, SharedStore, TaskStatus, TaskTransition};

/// What the requester learns about a finished task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SurfacedOutcome {
    Answered { response: String },
    Failed { error: String },
}

/// A finished task delivered to the requester's conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurfacedResult {
    pub task_id: Uuid,
    pub requester_id: Uuid,
    pub target_id: Uuid,
    pub conversation_id: Option<Uuid>,
    #[serde(flatten)]
    pub outcome: SurfacedOutcome,
}

impl SurfacedResult {
    /// SSE event name
    pub fn event_name(&self) -> &'static str {
        match self.outcome {
            SurfacedOutcome::Answered { .. } => "task_answered",
            SurfacedOutcome::Failed { .. } => "task_failed",
        }
    }
}

#[derive(Debug)]
enum PollerCommand {
    Track(Uuid),
    Untrack(Uuid),
    Snapshot {
        respond: oneshot::Sender<Vec<Uuid>>,
    },
    /// Poll immediately instead of waiting for the next tick
    PollNow {
        respond: oneshot::Sender<Vec<SurfacedResult>>,
    },
}

/// Handle to the poller actor.
#[derive(Clone)]
pub struct TaskPoller {
    cmd_tx: mpsc::Sender<PollerCommand>,
    events_tx: broadcast::Sender<SurfacedResult>,
}

impl TaskPoller {
    /// Spawn the actor on the current runtime.
    pub fn spawn(
        store: SharedStore,
        conversations: ConversationManager,
        period: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, _) = broadcast::channel(256);
        let actor = PollerActor {
            store,
            conversations,
            events_tx: events_tx.clone(),
            period,
            outstanding: BTreeSet::new(),
            ticker: None,
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx, events_tx }
    }

    /// Start watching `task_id`; starts the timer if it was idle.
    pub async fn track(&self, task_id: Uuid) {
        if self.cmd_tx.send(PollerCommand::Track(task_id)).await.is_err() {
            tracing::error!("Task poller is gone; task {} will not be surfaced", task_id);
        }
    }

    pub async fn untrack(&self, task_id: Uuid) {
        let _ = self.cmd_tx.send(PollerCommand::Untrack(task_id)).await;
    }

    /// Ids still waiting to be surfaced.
    pub async fn outstanding(&self) -> Vec<Uuid> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PollerCommand::Snapshot { respond: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Run one poll now and return what it surfaced.
    pub async fn poll_now(&self) -> Vec<SurfacedResult> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PollerCommand::PollNow { respond: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SurfacedResult> {
        self.events_tx.subscribe()
    }
}

struct PollerActor {
    store: SharedStore,
    conversations: ConversationManager,
    events_tx: broadcast::Sender<SurfacedResult>,
    period: Duration,
    outstanding: BTreeSet<Uuid>,
    ticker: Option<Interval>,
}

impl PollerActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PollerCommand>) {
        self.resume().await;
        self.sync_timer();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        PollerCommand::Track(id) => {
                            self.outstanding.insert(id);
                        }
                        PollerCommand::Untrack(id) => {
                            self.outstanding.remove(&id);
                        }
                        PollerCommand::Snapshot { respond } => {
                            let _ = respond.send(self.outstanding.iter().copied().collect());
                        }
                        PollerCommand::PollNow { respond } => {
                            let surfaced = self.poll_once().await;
                            let _ = respond.send(surfaced);
                        }
                    }
                }
                _ = next_tick(&mut self.ticker) => {
                    self.poll_once().await;
                }
            }
            self.sync_timer();
        }
        tracing::debug!("Task poller stopped");
    }

    /// Track tasks a previous process left unsurfaced.
    async fn resume(&mut self) {
        match self.store.list_unsurfaced_tasks().await {
            Ok(tasks) => {
                if !tasks.is_empty() {
                    tracing::info!("Resuming {} unsurfaced tasks", tasks.len());
                }
                self.outstanding.extend(tasks.iter().map(|t| t.id));
            }
            Err(e) => tracing::warn!("Could not load unsurfaced tasks: {}", e),
        }
    }

    /// Keep the timer alive exactly while ids are outstanding.
    fn sync_timer(&mut self) {
        match (self.outstanding.is_empty(), self.ticker.is_some()) {
            (true, true) => {
                self.ticker = None;
                tracing::debug!("Task poller idle");
            }
            (false, false) => {
                let start = Instant::now() + self.period;
                let mut ticker = tokio::time::interval_at(start, self.period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                self.ticker = Some(ticker);
                tracing::debug!(
                    "Task poller started for {} outstanding tasks",
                    self.outstanding.len()
                );
            }
            _ => {}
        }
    }

    async fn poll_once(&mut self) -> Vec<SurfacedResult> {
        let mut surfaced = Vec::new();
        let ids: Vec<Uuid> = self.outstanding.iter().copied().collect();

        for id in ids {
            let task = match self.store.get_task(id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tracing::warn!("Outstanding task {} no longer exists", id);
                    self.outstanding.remove(&id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Polling task {} failed: {}", id, e);
                    continue;
                }
            };

            match task.status {
                TaskStatus::Pending | TaskStatus::Processing => {}
                TaskStatus::Consumed => {
                    self.outstanding.remove(&id);
                }
                TaskStatus::Complete => {
                    // Consume first so the answer is delivered at most once
                    let consume = TaskTransition::consume();
                    let consumed = self.store.transition_task(id, &consume);
                    match consumed.await {
                        Ok(Some(consumed)) => {
                            let response = consumed.response.clone().unwrap_or_default();
                            surfaced.push(
                                self.surface(&consumed, SurfacedOutcome::Answered { response })
                                    .await,
                            );
                            self.outstanding.remove(&id);
                        }
                        Ok(None) => {
                            self.outstanding.remove(&id);
                        }
                        Err(e) => tracing::warn!("Could not mark task {} completed: {}", id, e),
                    }
                }
                TaskStatus::Failed => {
                    let error = task
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string());
                    surfaced.push(self.surface(&task, SurfacedOutcome::Failed { error }).await);
                    self.outstanding.remove(&id);
                }
            }
        }

        surfaced
    }

    async fn surface(
        &self,
        task: &CollaborationTask,
        outcome: SurfacedOutcome,
    ) -> SurfacedResult {
        if let Some(conversation_id) = task.requester_conversation_id {
            let content = match &outcome {
                SurfacedOutcome::Answered { response } => response.clone(),
                SurfacedOutcome::Failed { error } => {
                    format!("The collaboration request could not be answered: {}", error)
                }
            };
            if let Err(e) = self
                .conversations
                .append_agent(conversation_id, task.target_id, &content)
                .await
            {
                tracing::warn!(
                    "Could not post task {} result to conversation {}: {}",
                    task.id,
                    conversation_id,
                    e
                );
            }
        }

        tracing::info!("Surfaced task {} ({})", task.id, task.status);
        let result = SurfacedResult {
            task_id: task.id,
            requester_id: task.requester_id,
            target_id: task.target_id,
            conversation_id: task.requester_conversation_id,
            outcome,
        };
        // No subscribers is fine
        let _ = self.events_tx.send(result.clone());
        result
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::{
        CollaborationStore, Conversation, ConversationStore, InMemoryStore, MessageRole,
    };

    async fn setup() -> (Arc<InMemoryStore>, TaskPoller, CollaborationTask) {
        let store = Arc::new(InMemoryStore::new());
        let conversation = Conversation::new("alice", Uuid::new_v4(), None);
        store.create_conversation(&conversation).await.unwrap();
        let mut task = CollaborationTask::new(conversation.workspace_id, Uuid::new_v4(), "q?");
        task.requester_conversation_id = Some(conversation.id);
        store.create_task(&task).await.unwrap();

        let conversations = ConversationManager::new(store.clone(), 6);
        let poller = TaskPoller::spawn(store.clone(), conversations, Duration::from_secs(3600));
        (store, poller, task)
    }

    async fn finish(store: &InMemoryStore, id: Uuid, transition: TaskTransition) {
        store
            .transition_task(id, &TaskTransition::claim())
            .await
            .unwrap()
            .unwrap();
        store.transition_task(id, &transition).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn complete_task_is_surfaced_exactly_once() {
        let (store, poller, task) = setup().await;
        poller.track(task.id).await;

        assert!(poller.poll_now().await.is_empty());
        assert_eq!(poller.outstanding().await, vec![task.id]);

        finish(&store, task.id, TaskTransition::complete("42 units")).await;
        let surfaced = poller.poll_now().await;
        assert_eq!(surfaced.len(), 1);
        assert_eq!(
            surfaced[0].outcome,
            SurfacedOutcome::Answered {
                response: "42 units".into()
            }
        );
        assert!(poller.poll_now().await.is_empty());
        assert!(poller.outstanding().await.is_empty());

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Consumed);

        let conversation_id = task.requester_conversation_id.unwrap();
        let messages = store.recent_messages(conversation_id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Agent);
        assert_eq!(messages[0].sender_workspace_id, Some(task.target_id));
    }

    #[tokio::test]
    async fn failed_task_is_surfaced_as_failure_and_stays_failed() {
        let (store, poller, task) = setup().await;
        let mut events = poller.subscribe();
        poller.track(task.id).await;
        finish(&store, task.id, TaskTransition::fail("model down")).await;

        let surfaced = poller.poll_now().await;
        assert_eq!(surfaced.len(), 1);
        assert_eq!(surfaced[0].event_name(), "task_failed");
        assert_eq!(events.recv().await.unwrap().task_id, task.id);

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_runs_only_while_tasks_are_outstanding() {
        let store = Arc::new(InMemoryStore::new());
        let task = CollaborationTask::new(Uuid::new_v4(), Uuid::new_v4(), "q?");
        store.create_task(&task).await.unwrap();
        let poller = TaskPoller::spawn(
            store.clone(),
            ConversationManager::new(store.clone(), 6),
            Duration::from_millis(50),
        );
        let mut events = poller.subscribe();

        poller.track(task.id).await;
        finish(&store, task.id, TaskTransition::complete("done")).await;

        // Surfaced by the timer, without an explicit poll
        let result = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.task_id, task.id);
        assert!(poller.outstanding().await.is_empty());

        // A new task restarts polling
        let second = CollaborationTask::new(task.requester_id, task.target_id, "again?");
        store.create_task(&second).await.unwrap();
        poller.track(second.id).await;
        finish(&store, second.id, TaskTransition::complete("again")).await;
        let result = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.task_id, second.id);
    }

    #[tokio::test]
    async fn restarted_poller_resumes_unsurfaced_tasks() {
        let (store, first, task) = setup().await;
        finish(&store, task.id, TaskTransition::complete("answered while down")).await;
        drop(first);

        let broken = CollaborationTask::new(task.requester_id, task.target_id, "broken?");
        store.create_task(&broken).await.unwrap();
        finish(&store, broken.id, TaskTransition::fail("model down")).await;
        let waiting = CollaborationTask::new(task.requester_id, task.target_id, "later?");
        store.create_task(&waiting).await.unwrap();

        let poller = TaskPoller::spawn(
            store.clone(),
            ConversationManager::new(store.clone(), 6),
            Duration::from_secs(3600),
        );
        assert_eq!(poller.outstanding().await.len(), 2);

        let surfaced = poller.poll_now().await;
        assert_eq!(surfaced.len(), 1);
        assert_eq!(surfaced[0].task_id, task.id);
        assert_eq!(
            surfaced[0].outcome,
            SurfacedOutcome::Answered {
                response: "answered while down".into()
            }
        );
        assert_eq!(poller.outstanding().await, vec![waiting.id]);

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Consumed);
        let conversation_id = task.requester_conversation_id.unwrap();
        let messages = store.recent_messages(conversation_id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "answered while down");
    }

    #[tokio::test]
    async fn untracked_tasks_are_ignored() {
        let (store, poller, task) = setup().await;
        poller.track(task.id).await;
        poller.untrack(task.id).await;
        finish(&store, task.id, TaskTransition::complete("x")).await;
        assert!(poller.poll_now().await.is_empty());
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Complete);
    }
}
