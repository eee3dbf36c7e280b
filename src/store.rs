//! Thread persistence: the `ThreadStore` port and a file-backed store.
//!
//! Conforming stores use one layout:
//!
//! ```text
//! threads/<threadId>/<id>.snapshot.json   ThreadSnapshot (no execution state)
//! threads/<threadId>/<id>.json            ExecutionCheckpoint
//! threads/<threadId>/manifest.json        ordered list of ManifestEntry
//! ```
//!
//! [`FileThreadStore`] implements the port with `tokio::fs`; manifest
//! rewrites go through a temp file and rename so a crash can't leave a
//! half-written index.

use crate::thread::{ConversationThread, ExecutionCheckpoint, ThreadSnapshot};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One line of a thread's manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    /// The snapshot/checkpoint id (file stem).
    pub id: String,
    /// True for snapshots, false for checkpoints.
    pub is_snapshot: bool,
    /// What produced this entry (e.g. "turn", "fork", "manual").
    pub source: String,
    /// Optional step counter supplied by the saver.
    pub step: Option<u64>,
    /// Message count at capture time.
    pub message_index: usize,
    /// Branch the thread was on.
    pub branch_name: String,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
}

/// Caller-supplied context recorded into the manifest.
#[derive(Debug, Clone)]
pub struct SaveMetadata {
    /// What produced this save.
    pub source: String,
    /// Optional step counter.
    pub step: Option<u64>,
}

impl Default for SaveMetadata {
    fn default() -> Self {
        Self {
            source: "manual".to_string(),
            step: None,
        }
    }
}

impl SaveMetadata {
    /// Creates metadata with the given source.
    pub fn source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            step: None,
        }
    }

    /// Sets the step counter.
    pub fn with_step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }
}

/// The persistence port the engine consumes.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Persists the thread's current state: a checkpoint when execution
    /// state is active, a snapshot otherwise. Returns the stored id and, on
    /// a checkpoint save, records it as the thread's current checkpoint.
    async fn save_thread(&self, thread: &ConversationThread) -> Result<String>;

    /// Stores a snapshot; returns its id.
    async fn save_snapshot(
        &self,
        thread_id: &str,
        snapshot: &ThreadSnapshot,
        metadata: SaveMetadata,
    ) -> Result<String>;

    /// Loads a snapshot by id; `None` when it doesn't exist.
    async fn load_snapshot(&self, thread_id: &str, id: &str) -> Result<Option<ThreadSnapshot>>;

    /// Stores a checkpoint; returns its id.
    async fn save_checkpoint(
        &self,
        thread_id: &str,
        checkpoint: &ExecutionCheckpoint,
        metadata: SaveMetadata,
    ) -> Result<String>;

    /// Loads a checkpoint by id; `None` when it doesn't exist.
    async fn load_checkpoint(
        &self,
        thread_id: &str,
        id: &str,
    ) -> Result<Option<ExecutionCheckpoint>>;

    /// The thread's manifest, oldest entry first.
    async fn manifest(&self, thread_id: &str) -> Result<Vec<ManifestEntry>>;

    /// Deletes the given snapshot/checkpoint ids and their manifest entries.
    async fn delete_snapshots(&self, thread_id: &str, ids: &[String]) -> Result<()>;

    /// Deletes all but the newest `keep_latest` snapshots. Checkpoints are
    /// untouched.
    async fn prune_snapshots(&self, thread_id: &str, keep_latest: usize) -> Result<()>;
}

/// Filesystem-backed [`ThreadStore`].
#[derive(Debug, Clone)]
pub struct FileThreadStore {
    root: PathBuf,
}

impl FileThreadStore {
    /// Creates a store rooted at `root`; directories are created lazily on
    /// first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.root.join("threads").join(thread_id)
    }

    fn snapshot_path(&self, thread_id: &str, id: &str) -> PathBuf {
        self.thread_dir(thread_id).join(format!("{id}.snapshot.json"))
    }

    fn checkpoint_path(&self, thread_id: &str, id: &str) -> PathBuf {
        self.thread_dir(thread_id).join(format!("{id}.json"))
    }

    fn manifest_path(&self, thread_id: &str) -> PathBuf {
        self.thread_dir(thread_id).join("manifest.json")
    }

    async fn read_manifest(&self, thread_id: &str) -> Result<Vec<ManifestEntry>> {
        let path = self.manifest_path(thread_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(io_error("read manifest", &path, e)),
        }
    }

    /// Writes the manifest through a temp file and rename.
    async fn write_manifest(&self, thread_id: &str, entries: &[ManifestEntry]) -> Result<()> {
        let path = self.manifest_path(thread_id);
        let tmp = self.thread_dir(thread_id).join("manifest.json.tmp");
        let json = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_error("write manifest", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("rename manifest", &path, e))?;
        Ok(())
    }

    async fn ensure_dir(&self, thread_id: &str) -> Result<()> {
        let dir = self.thread_dir(thread_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create thread dir", &dir, e))
    }

    async fn append_entry(&self, thread_id: &str, entry: ManifestEntry) -> Result<()> {
        let mut entries = self.read_manifest(thread_id).await?;
        entries.push(entry);
        self.write_manifest(thread_id, &entries).await
    }
}

fn io_error(action: &str, path: &Path, error: std::io::Error) -> Error {
    Error::other(format!("{action} {}: {error}", path.display()))
}

#[async_trait]
impl ThreadStore for FileThreadStore {
    async fn save_thread(&self, thread: &ConversationThread) -> Result<String> {
        let thread_id = thread.conversation_id();
        if thread.execution_state().is_some() {
            let checkpoint = thread.to_checkpoint()?;
            let id = self
                .save_checkpoint(&thread_id, &checkpoint, SaveMetadata::source("thread"))
                .await?;
            // Only record the pointer once the store reported success.
            thread.set_current_checkpoint_id(&id);
            Ok(id)
        } else {
            self.save_snapshot(&thread_id, &thread.to_snapshot(), SaveMetadata::source("thread"))
                .await
        }
    }

    async fn save_snapshot(
        &self,
        thread_id: &str,
        snapshot: &ThreadSnapshot,
        metadata: SaveMetadata,
    ) -> Result<String> {
        self.ensure_dir(thread_id).await?;
        let id = Uuid::new_v4().to_string();
        let path = self.snapshot_path(thread_id, &id);
        tokio::fs::write(&path, snapshot.serialize()?)
            .await
            .map_err(|e| io_error("write snapshot", &path, e))?;

        self.append_entry(
            thread_id,
            ManifestEntry {
                id: id.clone(),
                is_snapshot: true,
                source: metadata.source,
                step: metadata.step,
                message_index: snapshot.messages.len(),
                branch_name: snapshot.active_branch.clone(),
                timestamp: Utc::now(),
            },
        )
        .await?;
        log::debug!("saved snapshot {id} for thread {thread_id}");
        Ok(id)
    }

    async fn load_snapshot(&self, thread_id: &str, id: &str) -> Result<Option<ThreadSnapshot>> {
        let path = self.snapshot_path(thread_id, id);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(ThreadSnapshot::deserialize(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read snapshot", &path, e)),
        }
    }

    async fn save_checkpoint(
        &self,
        thread_id: &str,
        checkpoint: &ExecutionCheckpoint,
        metadata: SaveMetadata,
    ) -> Result<String> {
        self.ensure_dir(thread_id).await?;
        let id = Uuid::new_v4().to_string();
        let path = self.checkpoint_path(thread_id, &id);
        tokio::fs::write(&path, checkpoint.serialize()?)
            .await
            .map_err(|e| io_error("write checkpoint", &path, e))?;

        self.append_entry(
            thread_id,
            ManifestEntry {
                id: id.clone(),
                is_snapshot: false,
                source: metadata.source,
                step: metadata.step,
                message_index: checkpoint.snapshot.messages.len(),
                branch_name: checkpoint.snapshot.active_branch.clone(),
                timestamp: Utc::now(),
            },
        )
        .await?;
        log::debug!("saved checkpoint {id} for thread {thread_id}");
        Ok(id)
    }

    async fn load_checkpoint(
        &self,
        thread_id: &str,
        id: &str,
    ) -> Result<Option<ExecutionCheckpoint>> {
        let path = self.checkpoint_path(thread_id, id);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(ExecutionCheckpoint::deserialize(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read checkpoint", &path, e)),
        }
    }

    async fn manifest(&self, thread_id: &str) -> Result<Vec<ManifestEntry>> {
        self.read_manifest(thread_id).await
    }

    async fn delete_snapshots(&self, thread_id: &str, ids: &[String]) -> Result<()> {
        let entries = self.read_manifest(thread_id).await?;
        let (doomed, kept): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| ids.contains(&e.id));

        for entry in &doomed {
            let path = if entry.is_snapshot {
                self.snapshot_path(thread_id, &entry.id)
            } else {
                self.checkpoint_path(thread_id, &entry.id)
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("delete", &path, e)),
            }
        }
        self.write_manifest(thread_id, &kept).await
    }

    async fn prune_snapshots(&self, thread_id: &str, keep_latest: usize) -> Result<()> {
        let entries = self.read_manifest(thread_id).await?;
        let snapshot_count = entries.iter().filter(|e| e.is_snapshot).count();
        if snapshot_count <= keep_latest {
            return Ok(());
        }

        // Entries are append-ordered; drop the oldest surplus snapshots.
        let mut to_drop = snapshot_count - keep_latest;
        let mut doomed = Vec::new();
        for entry in &entries {
            if to_drop == 0 {
                break;
            }
            if entry.is_snapshot {
                doomed.push(entry.id.clone());
                to_drop -= 1;
            }
        }
        log::debug!(
            "pruning {} snapshots from thread {thread_id}",
            doomed.len()
        );
        self.delete_snapshots(thread_id, &doomed).await
    }
}
