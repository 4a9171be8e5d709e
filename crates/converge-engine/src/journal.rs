use std::sync::Arc;

use converge_core::urn::STACK_TYPE;
use converge_core::{ResourceState, Snapshot};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::EngineError;
use crate::persistence::SnapshotStore;

/// Index of an entry in the previous snapshot.
pub type OldId = usize;

/// One change to the in-progress snapshot.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Append `new`, retiring the old entry it supersedes, if any.
    Commit {
        replaces: Option<OldId>,
        new: ResourceState,
    },
    /// Append `new` and keep the old entry as a condemned copy, to be
    /// deleted later (create-before-delete replacement).
    Condemn { old: OldId, new: ResourceState },
    MarkPendingReplacement { old: OldId, value: bool },
    /// The old entry is gone from the world.
    Remove { old: OldId },
}

#[derive(Debug, Clone)]
struct OldEntry {
    state: ResourceState,
    done: bool,
}

#[derive(Debug, Clone)]
struct JournalState {
    news: Vec<ResourceState>,
    olds: Vec<OldEntry>,
}

impl JournalState {
    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::Commit { replaces, new } => {
                if let Some(entry) = replaces.and_then(|id| self.olds.get_mut(id)) {
                    entry.done = true;
                }
                self.news.push(new);
            }
            Mutation::Condemn { old, new } => {
                if let Some(entry) = self.olds.get_mut(old) {
                    entry.state.pending_replacement = false;
                    entry.state.pending_delete = true;
                }
                self.news.push(new);
            }
            Mutation::MarkPendingReplacement { old, value } => {
                if let Some(entry) = self.olds.get_mut(old) {
                    entry.state.pending_replacement = value;
                }
            }
            Mutation::Remove { old } => {
                if let Some(entry) = self.olds.get_mut(old) {
                    entry.done = true;
                }
            }
        }
    }

    /// New entries in commit order, then surviving old entries in their
    /// original order. The stack root, new or old, always comes first.
    fn snapshot(&self) -> Snapshot {
        let all = self
            .news
            .iter()
            .chain(self.olds.iter().filter(|e| !e.done).map(|e| &e.state));
        let (stack, rest): (Vec<&ResourceState>, Vec<&ResourceState>) =
            all.partition(|s| s.resource_type == STACK_TYPE && !s.pending_delete);

        Snapshot::new(stack.into_iter().chain(rest).cloned().collect())
    }
}

/// Single writer for the snapshot of a run.
///
/// Every mutation produces a complete snapshot that is verified (when
/// enabled) and saved before the mutation is acknowledged, so any prefix of
/// a run is recoverable. A preview journal keeps its snapshot in memory and
/// never touches the store.
pub struct SnapshotJournal {
    state: Mutex<JournalState>,
    store: Arc<dyn SnapshotStore>,
    verify: bool,
    persist: bool,
}

impl SnapshotJournal {
    pub fn new(previous: &Snapshot, store: Arc<dyn SnapshotStore>, verify: bool) -> Self {
        Self::with_persistence(previous, store, verify, true)
    }

    pub fn preview(previous: &Snapshot, store: Arc<dyn SnapshotStore>, verify: bool) -> Self {
        Self::with_persistence(previous, store, verify, false)
    }

    fn with_persistence(
        previous: &Snapshot,
        store: Arc<dyn SnapshotStore>,
        verify: bool,
        persist: bool,
    ) -> Self {
        let olds = previous
            .resources
            .iter()
            .cloned()
            .map(|state| OldEntry { state, done: false })
            .collect();
        Self {
            state: Mutex::new(JournalState {
                news: Vec::new(),
                olds,
            }),
            store,
            verify,
            persist,
        }
    }

    pub async fn apply(&self, mutation: Mutation) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;

        let mut next = state.clone();
        next.apply(mutation);
        let snapshot = next.snapshot();
        if self.verify {
            snapshot.verify_integrity()?;
        }
        *state = next;

        if !self.persist {
            debug!(resources = snapshot.len(), "preview mutation applied");
            return Ok(());
        }
        // Saved under the lock so the store sees snapshots in commit order.
        self.store.save(&snapshot).await?;
        debug!(resources = snapshot.len(), "snapshot committed");
        Ok(())
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.state.lock().await.snapshot()
    }

    /// Old entries that have not been superseded or removed yet.
    pub async fn surviving_olds(&self) -> Vec<(OldId, ResourceState)> {
        self.state
            .lock()
            .await
            .olds
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.done)
            .map(|(id, e)| (id, e.state.clone()))
            .collect()
    }
}
