//! Behaviour every store backend must share.

use chrono::{Duration, Utc};
use uuid::Uuid;

use super::*;

fn chunk(workspace_id: Uuid, source: &str, content: &str, embedding: Vec<f32>) -> DocumentChunk {
    DocumentChunk {
        id: Uuid::new_v4(),
        workspace_id,
        content: content.to_string(),
        embedding,
        source_file_name: source.to_string(),
        created_at: Utc::now(),
        metadata: Some(ChunkMetadata {
            chunk_index: 0,
            total_chunks: 1,
            sheet_name: None,
            strategy: ChunkingStrategy::RecursiveV1,
        }),
    }
}

pub(crate) async fn exercise_store<S: Store + ?Sized>(store: &S) {
    workspaces(store).await;
    chunks(store).await;
    conversations(store).await;
    follows(store).await;
    tasks(store).await;
}

async fn workspaces<S: Store + ?Sized>(store: &S) {
    let workspace = AgentWorkspace::new("alice", "Alice's agent");
    store.create_workspace(&workspace).await.unwrap();

    let by_owner = store.get_workspace_by_owner("alice").await.unwrap().unwrap();
    assert_eq!(by_owner.id, workspace.id);
    assert!(store.get_workspace_by_owner("nobody").await.unwrap().is_none());

    let updated = store
        .update_workspace(workspace.id, None, Some("sales data"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.name, "Alice's agent");
    assert_eq!(updated.description.as_deref(), Some("sales data"));
    assert!(store
        .update_workspace(Uuid::new_v4(), Some("x"), None)
        .await
        .unwrap()
        .is_none());
}

async fn chunks<S: Store + ?Sized>(store: &S) {
    let ws = Uuid::new_v4();
    let other = Uuid::new_v4();

    let close = chunk(ws, "a.csv", "close", vec![1.0, 0.0, 0.0]);
    let far = chunk(ws, "a.csv", "far", vec![0.0, 1.0, 0.0]);
    let zero = chunk(ws, "b.csv", "zero", vec![0.0, 0.0, 0.0]);
    let foreign = chunk(other, "a.csv", "foreign", vec![1.0, 0.0, 0.0]);

    let written = store
        .insert_chunks(&[close.clone(), far.clone(), zero.clone(), foreign.clone()])
        .await
        .unwrap();
    assert_eq!(written, 4);
    // Same ids again are ignored
    assert_eq!(store.insert_chunks(&[close.clone()]).await.unwrap(), 0);

    assert_eq!(store.count_chunks(ws).await.unwrap(), 3);
    assert_eq!(store.count_chunks_for_source(ws, "a.csv").await.unwrap(), 2);

    if store.supports_similarity() {
        let hits = store
            .search_chunks(ws, &[0.9, 0.1, 0.0], 0.1, 5)
            .await
            .unwrap();
        let contents: Vec<_> = hits.iter().map(|h| h.content.as_str()).collect();
        assert_eq!(contents, vec!["close", "far"]);
        assert!(hits[0].similarity > hits[1].similarity);
        assert!(hits.iter().all(|h| h.workspace_id == ws));
    }

    let recent = store.recent_chunks(ws, 2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent.iter().all(|h| h.workspace_id == ws));

    let sources = store.list_sources(ws).await.unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0].source_file_name, "a.csv");
    assert_eq!(sources[0].chunk_count, 2);

    assert_eq!(store.delete_chunks_by_source(ws, "a.csv").await.unwrap(), 2);
    assert_eq!(store.delete_chunks_by_source(ws, "a.csv").await.unwrap(), 0);
    assert_eq!(store.count_chunks(ws).await.unwrap(), 1);
    assert_eq!(store.count_chunks(other).await.unwrap(), 1);
}

async fn conversations<S: Store + ?Sized>(store: &S) {
    let conversation = Conversation::new("alice", Uuid::new_v4(), Some("Q3 revenue".into()));
    store.create_conversation(&conversation).await.unwrap();

    let agent = Uuid::new_v4();
    for i in 0..4 {
        let message = if i % 2 == 0 {
            ConversationMessage::user(conversation.id, format!("question {}", i))
        } else {
            ConversationMessage::agent(conversation.id, agent, format!("answer {}", i))
        };
        store.append_message(&message).await.unwrap();
    }

    let last_two = store.recent_messages(conversation.id, 2).await.unwrap();
    let contents: Vec<_> = last_two.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["question 2", "answer 3"]);
    assert_eq!(last_two[1].role, MessageRole::Agent);
    assert_eq!(last_two[1].sender_workspace_id, Some(agent));

    let later = conversation.updated_at + Duration::seconds(30);
    store.touch_conversation(conversation.id, later).await.unwrap();
    let loaded = store.get_conversation(conversation.id).await.unwrap().unwrap();
    assert_eq!(loaded.updated_at.timestamp(), later.timestamp());
    assert_eq!(loaded.title.as_deref(), Some("Q3 revenue"));
}

async fn follows<S: Store + ?Sized>(store: &S) {
    let requester = Uuid::new_v4();
    let target = Uuid::new_v4();

    store
        .upsert_follow(&FollowRelationship::pending(requester, target))
        .await
        .unwrap();
    let approved = store
        .set_follow_status(requester, target, FollowStatus::Approved)
        .await
        .unwrap()
        .unwrap();
    assert!(approved.is_approved());

    // Direction matters
    assert!(store.get_follow(target, requester).await.unwrap().is_none());
    assert_eq!(store.list_follows_by_requester(requester).await.unwrap().len(), 1);
    assert_eq!(store.list_follows_by_target(target).await.unwrap().len(), 1);
    assert!(store.list_follows_by_target(requester).await.unwrap().is_empty());
}

async fn tasks<S: Store + ?Sized>(store: &S) {
    let requester = Uuid::new_v4();
    let target = Uuid::new_v4();

    let mut old = CollaborationTask::new(requester, target, "old");
    old.created_at = Utc::now() - Duration::minutes(5);
    let new = CollaborationTask::new(requester, target, "new");
    let mut urgent = CollaborationTask::new(requester, target, "urgent");
    urgent.priority = Some(10);
    for task in [&old, &new, &urgent] {
        store.create_task(task).await.unwrap();
    }

    let pending = store.list_pending_tasks(Some(target), 2).await.unwrap();
    let order: Vec<_> = pending.iter().map(|t| t.query.as_str()).collect();
    assert_eq!(order, vec!["urgent", "old"]);

    let claimed = store
        .transition_task(urgent.id, &TaskTransition::claim())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.status, TaskStatus::Processing);
    // Second claim loses
    assert!(store
        .transition_task(urgent.id, &TaskTransition::claim())
        .await
        .unwrap()
        .is_none());

    let done = store
        .transition_task(urgent.id, &TaskTransition::complete("42"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, TaskStatus::Complete);
    assert_eq!(done.response.as_deref(), Some("42"));

    let consumed = store
        .transition_task(urgent.id, &TaskTransition::consume())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(consumed.status, TaskStatus::Consumed);
    assert_eq!(consumed.response.as_deref(), Some("42"));

    let illegal = TaskTransition {
        from: TaskStatus::Complete,
        to: TaskStatus::Pending,
        response: None,
        error_message: None,
    };
    assert!(matches!(
        store.transition_task(urgent.id, &illegal).await,
        Err(StoreError::Conflict(_))
    ));

    store
        .transition_task(old.id, &TaskTransition::claim())
        .await
        .unwrap()
        .unwrap();
    let failed = store
        .transition_task(old.id, &TaskTransition::fail("model down"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("model down"));

    assert_eq!(store.list_tasks_by_requester(requester).await.unwrap().len(), 3);
    assert_eq!(store.list_tasks_by_target(target).await.unwrap().len(), 3);
    let remaining = store.list_pending_tasks(None, 10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, new.id);

    let answered = CollaborationTask::new(requester, target, "answered");
    store.create_task(&answered).await.unwrap();
    store
        .transition_task(answered.id, &TaskTransition::claim())
        .await
        .unwrap()
        .unwrap();
    store
        .transition_task(answered.id, &TaskTransition::complete("7"))
        .await
        .unwrap()
        .unwrap();
    // Consumed and failed tasks have already reached the requester
    let unsurfaced: Vec<Uuid> = store
        .list_unsurfaced_tasks()
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(unsurfaced, vec![new.id, answered.id]);
}
