//! Delete-before-create replacement.
//!
//! Between deleting the old object and committing its replacement, the old
//! snapshot entry carries `pending_replacement = true`. If the run dies in
//! that window, the next run sees the flag, skips the delete, and goes
//! straight to the create.

use converge_core::{ResourceGoal, ResourceState};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::journal::{Mutation, OldId, SnapshotJournal};
use crate::provider::ProviderHandle;
use crate::registry::RegisterResourceResponse;
use crate::step::{self, OldRef};

/// Flag transitions for one old entry, each committed through the journal.
pub struct PendingReplacement<'a> {
    journal: &'a SnapshotJournal,
    old: OldId,
}

impl<'a> PendingReplacement<'a> {
    pub fn new(journal: &'a SnapshotJournal, old: OldId) -> Self {
        Self { journal, old }
    }

    /// Stable → pending. Must commit before the old object is deleted.
    pub async fn begin(&self) -> Result<(), EngineError> {
        self.journal
            .apply(Mutation::MarkPendingReplacement {
                old: self.old,
                value: true,
            })
            .await
    }

    /// Pending → stable with the old object still in place.
    pub async fn abort(&self) -> Result<(), EngineError> {
        self.journal
            .apply(Mutation::MarkPendingReplacement {
                old: self.old,
                value: false,
            })
            .await
    }

    /// Pending → stable with the replacement in place of the old entry.
    pub async fn complete(&self, new: ResourceState) -> Result<(), EngineError> {
        self.journal
            .apply(Mutation::Commit {
                replaces: Some(self.old),
                new,
            })
            .await
    }
}

pub(crate) async fn delete_before_create(
    journal: &SnapshotJournal,
    goal: &ResourceGoal,
    old: &OldRef,
    provider: Option<&ProviderHandle>,
    resume: bool,
    preview: bool,
) -> Result<RegisterResourceResponse, EngineError> {
    let pending = PendingReplacement::new(journal, old.id);

    if resume {
        info!(urn = %goal.urn, "resuming replacement, old object already deleted");
    } else {
        pending.begin().await?;
        if old.state.retain_on_delete {
            info!(urn = %goal.urn, "retaining old object during replacement");
        } else if preview {
            info!(urn = %goal.urn, "would delete before replacing");
        } else if let Some(provider) = provider {
            if let Err(e) = step::delete_object(provider, &old.state).await {
                warn!(urn = %goal.urn, error = %e, "delete failed, replacement abandoned");
                pending.abort().await?;
                return Err(e);
            }
        }
    }

    let mut new = ResourceState::from_goal(goal, step::reference(provider));
    if let Some(provider) = provider {
        // On failure the flag stays set: the old object is already gone.
        let created = step::create_object(provider, goal, preview).await?;
        new.id = created.id;
        new.outputs = created.outputs;
    }
    step::stamp_created(&mut new);

    let response = step::response_for(&new);
    pending.complete(new).await?;
    Ok(response)
}
