use std::path::{Path, PathBuf};
use std::sync::Mutex;

use converge_core::Snapshot;

use crate::error::EngineError;
use crate::provider::BoxFuture;

/// Durable home of the snapshot. `save` is called after every committed
/// mutation, so it must leave either the old or the new snapshot in place.
pub trait SnapshotStore: Send + Sync {
    /// The last saved snapshot, or an empty one if nothing was saved yet.
    fn load(&self) -> BoxFuture<'_, Result<Snapshot, EngineError>>;

    fn save<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<(), EngineError>>;
}

/// Snapshot stored as pretty JSON on local disk.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> BoxFuture<'_, Result<Snapshot, EngineError>> {
        Box::pin(async move {
            if !tokio::fs::try_exists(&self.path).await? {
                tracing::debug!(path = %self.path.display(), "no snapshot found, starting fresh");
                return Ok(Snapshot::default());
            }
            let json = tokio::fs::read(&self.path).await?;
            let snapshot: Snapshot = serde_json::from_slice(&json)?;
            tracing::debug!(
                path = %self.path.display(),
                resources = snapshot.len(),
                "snapshot loaded"
            );
            Ok(snapshot)
        })
    }

    /// Atomic write: tmp file + rename.
    fn save<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(async move {
            let json = serde_json::to_vec_pretty(snapshot)?;
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp_path = self.path.with_extension("json.tmp");
            tokio::fs::write(&tmp_path, &json).await?;
            tokio::fs::rename(&tmp_path, &self.path).await?;

            tracing::debug!(path = %self.path.display(), "snapshot flushed to disk");
            Ok(())
        })
    }
}

/// Keeps every saved snapshot in memory, oldest first.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    history: Mutex<Vec<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `load` returns `snapshot` until something is saved.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            history: Mutex::new(vec![snapshot]),
        }
    }

    pub fn history(&self) -> Vec<Snapshot> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.history.lock().ok().and_then(|h| h.last().cloned())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> BoxFuture<'_, Result<Snapshot, EngineError>> {
        let snapshot = self.latest().unwrap_or_default();
        Box::pin(async move { Ok(snapshot) })
    }

    fn save<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<(), EngineError>> {
        if let Ok(mut history) = self.history.lock() {
            history.push(snapshot.clone());
        }
        Box::pin(async { Ok(()) })
    }
}
