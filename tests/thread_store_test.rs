//! Thread serialization properties and the file-backed store.

use agentloop::store::{FileThreadStore, SaveMetadata, ThreadStore};
use agentloop::{
    ConversationThread, EventCoordinator, ExecutionCheckpoint, LoopState, Message, RunOptions,
    ThreadSnapshot, fork_thread,
};

fn populated_thread(messages: usize) -> ConversationThread {
    let thread = ConversationThread::new();
    thread.set_display_name("Support chat");
    for i in 0..messages {
        thread.add_message(Message::user(format!("message number {i} with some length to it")));
        thread.add_message(Message::assistant_text(format!("reply number {i}, equally sized")));
    }
    thread.set_middleware_state("memory", serde_json::json!({"facts": ["prefers rust"]}));
    thread
}

fn with_execution_state(thread: &ConversationThread) {
    let state = LoopState::new(
        "run-1",
        thread.conversation_id(),
        "Agent",
        thread.messages(),
        RunOptions::builder().model("test-model").build().unwrap(),
    );
    thread.set_execution_state(Some(state.snapshot()));
}

#[test]
fn snapshot_roundtrip_preserves_everything_conversational() {
    let thread = populated_thread(3);
    thread.try_add_branch("experiment", "ckpt-1");

    let json = thread.to_snapshot().serialize().unwrap();
    let restored = ConversationThread::from_snapshot(ThreadSnapshot::deserialize(&json).unwrap());

    assert_eq!(restored.conversation_id(), thread.conversation_id());
    assert_eq!(restored.display_name(), thread.display_name());
    assert_eq!(restored.message_count(), thread.message_count());
    assert_eq!(restored.active_branch(), thread.active_branch());
    assert_eq!(restored.branches(), thread.branches());
    assert_eq!(
        restored.get_middleware_state("memory"),
        thread.get_middleware_state("memory")
    );
}

#[test]
fn checkpoint_roundtrip_preserves_loop_state() {
    let thread = populated_thread(2);
    with_execution_state(&thread);

    let json = thread.to_checkpoint().unwrap().serialize().unwrap();
    let restored =
        ConversationThread::from_checkpoint(ExecutionCheckpoint::deserialize(&json).unwrap());

    let state = restored.execution_state().unwrap();
    assert_eq!(state.run_id, "run-1");
    assert_eq!(state.agent_name, "Agent");
    assert_eq!(state.messages.len(), thread.message_count());
    assert_eq!(state.options.model, "test-model");
}

#[test]
fn snapshots_never_contain_execution_state_keys() {
    let thread = populated_thread(2);
    with_execution_state(&thread);

    let json = thread.to_snapshot().serialize().unwrap();
    assert!(!json.contains("execution_state"));
    assert!(!json.contains("loop_state"));
}

#[test]
fn checkpoints_are_materially_larger_than_snapshots() {
    let thread = populated_thread(5);
    with_execution_state(&thread);

    let snapshot_len = thread.to_snapshot().serialize().unwrap().len();
    let checkpoint_len = thread.to_checkpoint().unwrap().serialize().unwrap().len();

    assert!(
        checkpoint_len as f64 >= 1.5 * snapshot_len as f64,
        "checkpoint {checkpoint_len} vs snapshot {snapshot_len}"
    );
}

#[tokio::test]
async fn file_store_snapshot_roundtrip_and_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileThreadStore::new(dir.path());
    let thread = populated_thread(2);
    let thread_id = thread.conversation_id();

    let id = store
        .save_snapshot(
            &thread_id,
            &thread.to_snapshot(),
            SaveMetadata::source("turn").with_step(7),
        )
        .await
        .unwrap();

    // The file landed at the conforming path.
    let path = dir
        .path()
        .join("threads")
        .join(&thread_id)
        .join(format!("{id}.snapshot.json"));
    assert!(path.exists());

    let loaded = store.load_snapshot(&thread_id, &id).await.unwrap().unwrap();
    assert_eq!(loaded.conversation_id, thread_id);
    assert_eq!(loaded.messages.len(), 4);

    let manifest = store.manifest(&thread_id).await.unwrap();
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0].id, id);
    assert!(manifest[0].is_snapshot);
    assert_eq!(manifest[0].source, "turn");
    assert_eq!(manifest[0].step, Some(7));
    assert_eq!(manifest[0].message_index, 4);
    assert_eq!(manifest[0].branch_name, "main");
}

#[tokio::test]
async fn file_store_checkpoint_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileThreadStore::new(dir.path());
    let thread = populated_thread(1);
    with_execution_state(&thread);
    let thread_id = thread.conversation_id();

    let checkpoint = thread.to_checkpoint().unwrap();
    let id = store
        .save_checkpoint(&thread_id, &checkpoint, SaveMetadata::source("turn"))
        .await
        .unwrap();

    let path = dir
        .path()
        .join("threads")
        .join(&thread_id)
        .join(format!("{id}.json"));
    assert!(path.exists());

    let loaded = store.load_checkpoint(&thread_id, &id).await.unwrap().unwrap();
    assert_eq!(loaded, checkpoint);

    let manifest = store.manifest(&thread_id).await.unwrap();
    assert!(!manifest[0].is_snapshot);
}

#[tokio::test]
async fn save_thread_records_current_checkpoint_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileThreadStore::new(dir.path());

    // Without execution state a snapshot is saved and no pointer recorded.
    let thread = populated_thread(1);
    store.save_thread(&thread).await.unwrap();
    assert!(thread.current_checkpoint_id().is_none());

    // With execution state a checkpoint is saved and the pointer set.
    with_execution_state(&thread);
    let id = store.save_thread(&thread).await.unwrap();
    assert_eq!(thread.current_checkpoint_id().as_deref(), Some(id.as_str()));
}

#[tokio::test]
async fn missing_ids_load_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileThreadStore::new(dir.path());

    assert!(store.load_snapshot("t", "ghost").await.unwrap().is_none());
    assert!(store.load_checkpoint("t", "ghost").await.unwrap().is_none());
    assert!(store.manifest("t").await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_and_prune_rewrite_the_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileThreadStore::new(dir.path());
    let thread = populated_thread(1);
    let thread_id = thread.conversation_id();
    let snapshot = thread.to_snapshot();

    let mut ids = Vec::new();
    for step in 0..4 {
        ids.push(
            store
                .save_snapshot(
                    &thread_id,
                    &snapshot,
                    SaveMetadata::source("turn").with_step(step),
                )
                .await
                .unwrap(),
        );
    }

    store
        .delete_snapshots(&thread_id, &[ids[0].clone()])
        .await
        .unwrap();
    let manifest = store.manifest(&thread_id).await.unwrap();
    assert_eq!(manifest.len(), 3);
    assert!(manifest.iter().all(|e| e.id != ids[0]));
    assert!(store.load_snapshot(&thread_id, &ids[0]).await.unwrap().is_none());

    // Keep only the newest snapshot.
    store.prune_snapshots(&thread_id, 1).await.unwrap();
    let manifest = store.manifest(&thread_id).await.unwrap();
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0].id, ids[3]);

    // Pruning below the keep count is a no-op.
    store.prune_snapshots(&thread_id, 5).await.unwrap();
    assert_eq!(store.manifest(&thread_id).await.unwrap().len(), 1);
}

#[test]
fn forks_are_snapshots_with_fresh_identity() {
    let coordinator = EventCoordinator::new();
    let source = populated_thread(2);
    with_execution_state(&source);

    let fork = fork_thread(&source, "experiment", &coordinator).unwrap();

    assert_ne!(fork.conversation_id(), source.conversation_id());
    assert_eq!(fork.active_branch(), "experiment");
    assert_eq!(fork.message_count(), source.message_count());
    // The fork is a snapshot: no execution state travels with it.
    assert!(fork.execution_state().is_none());
    assert!(source.branches().contains_key("experiment"));

    // The fork serializes strictly smaller than the source's checkpoint.
    let fork_len = fork.to_snapshot().serialize().unwrap().len();
    let checkpoint_len = source.to_checkpoint().unwrap().serialize().unwrap().len();
    assert!(checkpoint_len as f64 >= 1.5 * fork_len as f64);
}
