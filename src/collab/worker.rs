//! Optional background worker that drains pending collaboration tasks.

use std::time::Duration;

use tokio::task::JoinHandle;

use super::engine::CollaborationEngine;

/// Process one batch of pending tasks every `interval`.
pub fn spawn_task_worker(engine: CollaborationEngine, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(task_worker_loop(engine, interval))
}

async fn task_worker_loop(engine: CollaborationEngine, interval: Duration) {
    tracing::info!(
        "Collaboration task worker started: processing pending tasks every {:?}",
        interval
    );

    loop {
        tokio::time::sleep(interval).await;

        match engine.process_pending().await {
            Ok(processed) if processed.is_empty() => {}
            Ok(processed) => {
                let failed = processed.iter().filter(|p| p.error.is_some()).count();
                tracing::info!(
                    "Task worker processed {} tasks ({} failed)",
                    processed.len(),
                    failed
                );
            }
            Err(e) => {
                tracing::warn!("Failed to load pending collaboration tasks: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CollaborationStore, TaskStatus};
    use crate::testing::Harness;

    #[tokio::test(start_paused = true)]
    async fn worker_processes_queued_tasks_as_the_target_owner() {
        let harness = Harness::new();
        let alice = harness.query.workspaces().get_or_create("alice").await.unwrap();
        let bob = harness.query.workspaces().get_or_create("bob").await.unwrap();
        harness.collab.request_follow("alice", bob.id).await.unwrap();
        harness.collab.respond_to_follow("bob", alice.id, true).await.unwrap();
        let submitted = harness
            .collab
            .submit_task("alice", "q?", bob.id, None, None)
            .await
            .unwrap();

        let worker = spawn_task_worker(harness.collab.clone(), Duration::from_millis(100));
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let task = harness.store.get_task(submitted.task.id).await.unwrap().unwrap();
            if matches!(task.status, TaskStatus::Complete | TaskStatus::Consumed) {
                worker.abort();
                return;
            }
        }
        worker.abort();
        panic!("task was never processed");
    }
}
