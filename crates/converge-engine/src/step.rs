use converge_core::{PropertyMap, ResourceGoal, ResourceState, StepOp, Urn};
use tracing::info;

use crate::error::EngineError;
use crate::journal::{Mutation, OldId, SnapshotJournal};
use crate::pending;
use crate::provider::{
    CreateRequest, CreateResponse, DeleteRequest, ProviderHandle, ReadRequest, ReadResponse,
    UpdateRequest,
};
use crate::registry::RegisterResourceResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStrategy {
    CreateBeforeDelete,
    DeleteBeforeCreate,
}

/// Why a delete does or does not call the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    Provider,
    /// `retain_on_delete`: forget the object, leave it in the world.
    Retain,
    /// The `deleted_with` owner is going away and takes this object along.
    DeletedWith,
    /// Nothing to delete: the object is already gone or was never ours.
    Discard,
}

/// An entry of the previous snapshot.
#[derive(Debug, Clone)]
pub struct OldRef {
    pub id: OldId,
    pub state: ResourceState,
}

/// What to do to one resource.
#[derive(Debug)]
pub enum Step {
    Same {
        goal: ResourceGoal,
        old: OldRef,
        provider: Option<ProviderHandle>,
    },
    Create {
        goal: ResourceGoal,
        provider: Option<ProviderHandle>,
    },
    Update {
        goal: ResourceGoal,
        old: OldRef,
        provider: Option<ProviderHandle>,
    },
    Replace {
        goal: ResourceGoal,
        old: OldRef,
        provider: Option<ProviderHandle>,
        strategy: ReplaceStrategy,
        /// The old object was already deleted by an interrupted
        /// delete-before-create replacement.
        resume: bool,
    },
    Delete {
        old: OldRef,
        mode: DeleteMode,
        provider: Option<ProviderHandle>,
    },
    /// Adopt an existing object instead of creating one.
    Import {
        goal: ResourceGoal,
        provider: ProviderHandle,
        read: ReadResponse,
        /// Take inputs from the live object (`create_if_not_exists`) rather
        /// than from the goal (`import_id`).
        adopt_inputs: bool,
    },
    Read {
        goal: ResourceGoal,
        id: String,
        provider: ProviderHandle,
        old: Option<OldRef>,
    },
}

impl Step {
    pub fn op(&self) -> StepOp {
        match self {
            Step::Same { .. } => StepOp::Same,
            Step::Create { .. } => StepOp::Create,
            Step::Update { .. } => StepOp::Update,
            Step::Replace { .. } => StepOp::Replace,
            Step::Delete { .. } => StepOp::Delete,
            Step::Import { .. } => StepOp::Import,
            Step::Read { .. } => StepOp::Read,
        }
    }

    pub fn urn(&self) -> &Urn {
        match self {
            Step::Same { goal, .. }
            | Step::Create { goal, .. }
            | Step::Update { goal, .. }
            | Step::Replace { goal, .. }
            | Step::Import { goal, .. }
            | Step::Read { goal, .. } => &goal.urn,
            Step::Delete { old, .. } => &old.state.urn,
        }
    }

    /// Perform the step and commit its result through `journal`.
    ///
    /// In a preview, creates and updates are sent with `preview = true` and
    /// deletes are not sent at all.
    pub async fn apply(
        self,
        journal: &SnapshotJournal,
        preview: bool,
    ) -> Result<RegisterResourceResponse, EngineError> {
        match self {
            Step::Same { goal, old, provider } => {
                let mut new = carry_over(&goal, &old.state, provider.as_ref());
                new.modified = old.state.modified;
                commit(journal, Some(old.id), new).await
            }

            Step::Create { goal, provider } => {
                let mut new = ResourceState::from_goal(&goal, reference(provider.as_ref()));
                if let Some(provider) = &provider {
                    let created = create_object(provider, &goal, preview).await?;
                    new.id = created.id;
                    new.outputs = created.outputs;
                }
                stamp_created(&mut new);
                commit(journal, None, new).await
            }

            Step::Update { goal, old, provider } => {
                let mut new = carry_over(&goal, &old.state, provider.as_ref());
                if let Some(provider) = &provider {
                    new.outputs = provider
                        .provider
                        .update(&UpdateRequest {
                            urn: goal.urn.clone(),
                            id: old.state.id.clone(),
                            old_inputs: old.state.inputs.clone(),
                            old_outputs: old.state.outputs.clone(),
                            new_inputs: goal.inputs.clone(),
                            timeout: goal.custom_timeouts.update,
                            preview,
                        })
                        .await
                        .map_err(|e| EngineError::provider(&goal.urn, "update", &e))?;
                }
                commit(journal, Some(old.id), new).await
            }

            Step::Replace {
                goal,
                old,
                provider,
                strategy: ReplaceStrategy::DeleteBeforeCreate,
                resume,
            } => {
                pending::delete_before_create(journal, &goal, &old, provider.as_ref(), resume, preview)
                    .await
            }

            Step::Replace {
                goal,
                old,
                provider,
                strategy: ReplaceStrategy::CreateBeforeDelete,
                ..
            } => {
                let mut new = ResourceState::from_goal(&goal, reference(provider.as_ref()));
                if let Some(provider) = &provider {
                    let created = create_object(provider, &goal, preview).await?;
                    new.id = created.id;
                    new.outputs = created.outputs;
                }
                stamp_created(&mut new);
                let response = response_for(&new);
                journal
                    .apply(Mutation::Condemn { old: old.id, new })
                    .await?;
                Ok(response)
            }

            Step::Delete { old, mode, provider } => {
                match (mode, &provider) {
                    (DeleteMode::Provider, Some(_)) if preview => {
                        info!(urn = %old.state.urn, "would delete");
                    }
                    (DeleteMode::Provider, Some(provider)) => {
                        delete_object(provider, &old.state).await?;
                    }
                    (DeleteMode::Provider, None) => {}
                    (mode, _) => {
                        info!(urn = %old.state.urn, ?mode, "removing from state without deleting");
                    }
                }
                journal.apply(Mutation::Remove { old: old.id }).await?;
                Ok(RegisterResourceResponse {
                    urn: old.state.urn,
                    id: old.state.id,
                    outputs: PropertyMap::new(),
                })
            }

            Step::Import {
                goal,
                provider,
                read,
                adopt_inputs,
            } => {
                let mut new = ResourceState::from_goal(&goal, Some(provider.reference.clone()));
                new.id = read.id;
                new.outputs = read.outputs;
                if adopt_inputs {
                    if let Some(inputs) = read.inputs {
                        new.inputs = inputs;
                    }
                }
                stamp_created(&mut new);
                commit(journal, None, new).await
            }

            Step::Read {
                goal,
                id,
                provider,
                old,
            } => {
                let read = provider
                    .provider
                    .read(&ReadRequest {
                        urn: goal.urn.clone(),
                        id: id.clone(),
                        inputs: None,
                    })
                    .await
                    .map_err(|e| EngineError::provider(&goal.urn, "read", &e))?
                    .ok_or_else(|| EngineError::ImportNotFound {
                        urn: goal.urn.clone(),
                        id,
                    })?;
                let mut new = ResourceState::from_goal(&goal, Some(provider.reference.clone()));
                new.external = true;
                new.id = read.id;
                new.inputs = read.inputs.unwrap_or_default();
                new.outputs = read.outputs;
                stamp_created(&mut new);
                commit(journal, old.map(|o| o.id), new).await
            }
        }
    }
}

pub(crate) fn reference(provider: Option<&ProviderHandle>) -> Option<String> {
    provider.map(|p| p.reference.clone())
}

pub(crate) fn response_for(state: &ResourceState) -> RegisterResourceResponse {
    RegisterResourceResponse {
        urn: state.urn.clone(),
        id: state.id.clone(),
        outputs: state.outputs.clone(),
    }
}

pub(crate) fn stamp_created(state: &mut ResourceState) {
    let now = jiff::Timestamp::now();
    state.created = Some(now);
    state.modified = Some(now);
}

/// New state for `goal` keeping the identity of `old`.
fn carry_over(
    goal: &ResourceGoal,
    old: &ResourceState,
    provider: Option<&ProviderHandle>,
) -> ResourceState {
    let mut new = ResourceState::from_goal(goal, reference(provider).or_else(|| old.provider.clone()));
    new.id = old.id.clone();
    new.outputs = old.outputs.clone();
    new.created = old.created;
    new.modified = Some(jiff::Timestamp::now());
    new
}

async fn commit(
    journal: &SnapshotJournal,
    replaces: Option<OldId>,
    new: ResourceState,
) -> Result<RegisterResourceResponse, EngineError> {
    let response = response_for(&new);
    journal.apply(Mutation::Commit { replaces, new }).await?;
    Ok(response)
}

pub(crate) async fn create_object(
    provider: &ProviderHandle,
    goal: &ResourceGoal,
    preview: bool,
) -> Result<CreateResponse, EngineError> {
    provider
        .provider
        .create(&CreateRequest {
            urn: goal.urn.clone(),
            inputs: goal.inputs.clone(),
            timeout: goal.custom_timeouts.create,
            preview,
        })
        .await
        .map_err(|e| EngineError::provider(&goal.urn, "create", &e))
}

/// Delete through the provider. A provider without `delete` has nothing to
/// clean up.
pub(crate) async fn delete_object(
    provider: &ProviderHandle,
    state: &ResourceState,
) -> Result<(), EngineError> {
    let result = provider
        .provider
        .delete(&DeleteRequest {
            urn: state.urn.clone(),
            id: state.id.clone(),
            inputs: state.inputs.clone(),
            outputs: state.outputs.clone(),
            timeout: None,
            preview: false,
        })
        .await;
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_unsupported() => Ok(()),
        Err(e) => Err(EngineError::provider(&state.urn, "delete", &e)),
    }
}
