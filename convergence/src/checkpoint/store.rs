//! Checkpoint storage backends.
//!
//! A store keeps the latest checkpoint per run. Upserts are atomic per
//! record and must advance the run's sequence number.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Checkpoint, PersistenceError};

/// Durable home for run checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Upsert the checkpoint for its run.
    ///
    /// Fails with [`PersistenceError::OutOfOrder`] unless `checkpoint.sequence`
    /// is greater than the stored one.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError>;

    /// Latest checkpoint for `run_id`, if any.
    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, PersistenceError>;

    /// Remove the checkpoint for `run_id`. Returns whether one existed.
    async fn delete(&self, run_id: &str) -> Result<bool, PersistenceError>;
}

fn check_order(stored: Option<u64>, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
    match stored {
        Some(stored) if checkpoint.sequence <= stored => Err(PersistenceError::OutOfOrder {
            run_id: checkpoint.run_id().to_string(),
            stored,
            offered: checkpoint.sequence,
        }),
        _ => Ok(()),
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        let mut records = self.records.write().await;
        check_order(
            records.get(checkpoint.run_id()).map(|cp| cp.sequence),
            checkpoint,
        )?;
        records.insert(checkpoint.run_id().to_string(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, PersistenceError> {
        Ok(self.records.read().await.get(run_id).cloned())
    }

    async fn delete(&self, run_id: &str) -> Result<bool, PersistenceError> {
        Ok(self.records.write().await.remove(run_id).is_some())
    }
}

/// One JSON file per run under a directory.
///
/// Writes go to a temporary sibling file that is renamed over the record,
/// so a reader never observes a half-written checkpoint.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    /// Serializes read-check-write so the sequence check and the rename are atomic.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCheckpointStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(run_id)))
    }

    async fn read(&self, path: &Path) -> Result<Option<Checkpoint>, PersistenceError> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => Checkpoint::from_json(&json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keep run ids safe as file names.
fn sanitize(run_id: &str) -> String {
    run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(checkpoint.run_id());
        let stored = self.read(&path).await?;
        check_order(stored.map(|cp| cp.sequence), checkpoint)?;

        let json = checkpoint.to_json()?;
        let tmp = path.with_extension(format!("json.{}.tmp", checkpoint.sequence));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(
            run.id = %checkpoint.run_id(),
            sequence = checkpoint.sequence,
            path = %path.display(),
            "Checkpoint written"
        );
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, PersistenceError> {
        self.read(&self.record_path(run_id)).await
    }

    async fn delete(&self, run_id: &str) -> Result<bool, PersistenceError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.record_path(run_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
