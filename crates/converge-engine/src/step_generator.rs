use std::collections::{HashMap, HashSet};

use converge_core::{ResourceGoal, ResourceState, Snapshot, StepOp, Urn};
use tracing::debug;

use crate::error::EngineError;
use crate::journal::OldId;
use crate::provider::{
    CheckRequest, DiffChanges, DiffRequest, DiffResponse, ProviderHandle, ReadRequest,
    reference_package,
};
use crate::step::{DeleteMode, OldRef, ReplaceStrategy, Step};

/// A planned delete of one old entry.
#[derive(Debug, Clone)]
pub struct DeletePlan {
    pub old: OldRef,
    pub mode: DeleteMode,
    /// Old entries that must be deleted first because they refer to this one.
    pub after: Vec<OldId>,
}

/// Turns goals into steps by comparing them with the previous snapshot.
pub struct StepGenerator {
    olds: Vec<ResourceState>,
    live: HashMap<Urn, OldId>,
    replaced: HashSet<Urn>,
}

impl StepGenerator {
    pub fn new(previous: &Snapshot) -> Self {
        let live = previous
            .resources
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.pending_delete)
            .map(|(id, r)| (r.urn.clone(), id))
            .collect();
        Self {
            olds: previous.resources.clone(),
            live,
            replaced: HashSet::new(),
        }
    }

    fn old(&self, urn: &Urn) -> Option<OldRef> {
        self.live.get(urn).map(|&id| OldRef {
            id,
            state: self.olds[id].clone(),
        })
    }

    /// Step for a registered goal. Providers are consulted for input checks,
    /// diffs and imports; components are compared by inputs.
    pub async fn generate(
        &mut self,
        mut goal: ResourceGoal,
        provider: Option<ProviderHandle>,
    ) -> Result<Step, EngineError> {
        let old = self.old(&goal.urn);
        if let Some(provider) = &provider {
            goal.inputs = check(provider, &goal, old.as_ref()).await?;
        }

        let step = match old {
            None => new_resource(goal, provider).await?,
            Some(old) => self.existing_resource(goal, provider, old).await?,
        };
        debug!(urn = %step.urn(), op = %step.op(), "step planned");
        if step.op() == StepOp::Replace {
            self.replaced.insert(step.urn().clone());
        }
        Ok(step)
    }

    /// Step for a `read_resource` call.
    pub fn read(&self, goal: ResourceGoal, id: String, provider: ProviderHandle) -> Step {
        let old = self.old(&goal.urn);
        Step::Read {
            goal,
            id,
            provider,
            old,
        }
    }

    async fn existing_resource(
        &self,
        goal: ResourceGoal,
        provider: Option<ProviderHandle>,
        old: OldRef,
    ) -> Result<Step, EngineError> {
        let diff = match &provider {
            Some(provider) => diff(provider, &goal, &old.state).await?,
            None => DiffResponse::from_inputs(&old.state.inputs, &goal.inputs),
        };

        // The old object is already gone; only the create is left to do.
        if old.state.pending_replacement {
            return Ok(Step::Replace {
                goal,
                old,
                provider,
                strategy: ReplaceStrategy::DeleteBeforeCreate,
                resume: true,
            });
        }

        if diff.requires_replacement() || self.forces_replacement(&goal, &old.state, provider.as_ref()) {
            if old.state.protect && goal.protect {
                return Err(EngineError::Protected {
                    urn: goal.urn,
                    op: StepOp::Replace,
                });
            }
            let strategy = if goal
                .delete_before_replace
                .unwrap_or(diff.delete_before_replace)
            {
                ReplaceStrategy::DeleteBeforeCreate
            } else {
                ReplaceStrategy::CreateBeforeDelete
            };
            return Ok(Step::Replace {
                goal,
                old,
                provider,
                strategy,
                resume: false,
            });
        }

        if diff.changes == DiffChanges::Some {
            Ok(Step::Update {
                goal,
                old,
                provider,
            })
        } else {
            Ok(Step::Same {
                goal,
                old,
                provider,
            })
        }
    }

    fn forces_replacement(
        &self,
        goal: &ResourceGoal,
        old: &ResourceState,
        provider: Option<&ProviderHandle>,
    ) -> bool {
        let provider_changed = match (old.provider.as_deref(), provider) {
            (Some(before), Some(now)) => {
                reference_package(before) != reference_package(&now.reference)
            }
            _ => false,
        };
        let trigger_changed = goal
            .replacement_trigger
            .as_ref()
            .is_some_and(|t| old.replacement_trigger.as_ref() != Some(t));
        let cascaded = goal.replace_with.iter().any(|u| self.replaced.contains(u));

        if provider_changed || trigger_changed || cascaded {
            debug!(
                urn = %goal.urn,
                provider_changed,
                trigger_changed,
                cascaded,
                "replacement forced"
            );
        }
        provider_changed || trigger_changed || cascaded
    }

    /// Deletes for old entries this run did not keep: condemned copies and
    /// resources the program no longer declares.
    ///
    /// `registered` reports whether a URN was registered in this run.
    pub fn plan_deletes(
        &self,
        survivors: &[(OldId, ResourceState)],
        registered: impl Fn(&Urn) -> bool,
    ) -> Result<Vec<DeletePlan>, EngineError> {
        let targets: Vec<&(OldId, ResourceState)> = survivors
            .iter()
            .filter(|(_, s)| s.pending_delete || !registered(&s.urn))
            .collect();
        let deleting: HashSet<&Urn> = targets
            .iter()
            .filter(|(_, s)| !s.pending_delete)
            .map(|(_, s)| &s.urn)
            .collect();

        let mut plans = Vec::with_capacity(targets.len());
        for (id, state) in &targets {
            let mode = if state.pending_replacement || state.external {
                DeleteMode::Discard
            } else if state.retain_on_delete {
                DeleteMode::Retain
            } else if state.deleted_with.as_ref().is_some_and(|owner| {
                deleting.contains(owner) || (!registered(owner) && !self.live.contains_key(owner))
            }) {
                DeleteMode::DeletedWith
            } else {
                DeleteMode::Provider
            };

            if state.protect && !state.pending_delete && mode != DeleteMode::Discard {
                return Err(EngineError::Protected {
                    urn: state.urn.clone(),
                    op: StepOp::Delete,
                });
            }

            let after = targets
                .iter()
                .filter(|(other_id, other)| {
                    other_id != id && refers_to(other, &state.urn)
                })
                .map(|(other_id, _)| *other_id)
                .collect();

            plans.push(DeletePlan {
                old: OldRef {
                    id: *id,
                    state: state.clone(),
                },
                mode,
                after,
            });
        }
        Ok(plans)
    }
}

fn refers_to(state: &ResourceState, urn: &Urn) -> bool {
    state.parent.as_ref() == Some(urn) || state.references().any(|(_, target)| target == urn)
}

async fn new_resource(goal: ResourceGoal, provider: Option<ProviderHandle>) -> Result<Step, EngineError> {
    let Some(provider) = provider else {
        return Ok(Step::Create {
            goal,
            provider: None,
        });
    };

    if let Some(id) = goal.import_id.clone() {
        let read = provider
            .provider
            .read(&ReadRequest {
                urn: goal.urn.clone(),
                id: id.clone(),
                inputs: Some(goal.inputs.clone()),
            })
            .await
            .map_err(|e| EngineError::provider(&goal.urn, "read", &e))?
            .ok_or_else(|| EngineError::ImportNotFound {
                urn: goal.urn.clone(),
                id: id.clone(),
            })?;

        let imported = provider
            .provider
            .diff(&DiffRequest {
                urn: goal.urn.clone(),
                id,
                old_inputs: read.inputs.clone().unwrap_or_default(),
                old_outputs: read.outputs.clone(),
                new_inputs: goal.inputs.clone(),
            })
            .await;
        let compare_inputs = || match &read.inputs {
            Some(inputs) => DiffResponse::from_inputs(inputs, &goal.inputs),
            None => DiffResponse::no_changes(),
        };
        let diff = match imported {
            Ok(diff) if diff.changes != DiffChanges::Unknown => diff,
            Ok(_) => compare_inputs(),
            Err(e) if e.is_unsupported() => compare_inputs(),
            Err(e) => return Err(EngineError::provider(&goal.urn, "diff", &e)),
        };
        if diff.changes == DiffChanges::Some {
            return Err(EngineError::ImportMismatch {
                urn: goal.urn,
                keys: diff.changed_keys.join(", "),
            });
        }

        return Ok(Step::Import {
            goal,
            provider,
            read,
            adopt_inputs: false,
        });
    }

    if let Some(id) = goal.create_if_not_exists.clone() {
        let existing = provider
            .provider
            .read(&ReadRequest {
                urn: goal.urn.clone(),
                id,
                inputs: Some(goal.inputs.clone()),
            })
            .await;
        match existing {
            Ok(Some(read)) => {
                return Ok(Step::Import {
                    goal,
                    provider,
                    read,
                    adopt_inputs: true,
                });
            }
            Ok(None) => {}
            Err(e) if e.is_unsupported() => {}
            Err(e) => return Err(EngineError::provider(&goal.urn, "read", &e)),
        }
    }

    Ok(Step::Create {
        goal,
        provider: Some(provider),
    })
}

async fn check(
    provider: &ProviderHandle,
    goal: &ResourceGoal,
    old: Option<&OldRef>,
) -> Result<converge_core::PropertyMap, EngineError> {
    let result = provider
        .provider
        .check(&CheckRequest {
            urn: goal.urn.clone(),
            olds: old.map(|o| o.state.inputs.clone()).unwrap_or_default(),
            news: goal.inputs.clone(),
        })
        .await;
    match result {
        Ok(checked) if checked.failures.is_empty() => Ok(checked.inputs),
        Ok(checked) => Err(EngineError::CheckFailed {
            urn: goal.urn.clone(),
            message: checked
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.property, f.reason))
                .collect::<Vec<_>>()
                .join("; "),
        }),
        Err(e) if e.is_unsupported() => Ok(goal.inputs.clone()),
        Err(e) => Err(EngineError::provider(&goal.urn, "check", &e)),
    }
}

async fn diff(
    provider: &ProviderHandle,
    goal: &ResourceGoal,
    old: &ResourceState,
) -> Result<DiffResponse, EngineError> {
    let result = provider
        .provider
        .diff(&DiffRequest {
            urn: goal.urn.clone(),
            id: old.id.clone(),
            old_inputs: old.inputs.clone(),
            old_outputs: old.outputs.clone(),
            new_inputs: goal.inputs.clone(),
        })
        .await;
    match result {
        Ok(diff) if diff.changes != DiffChanges::Unknown => Ok(diff),
        Ok(diff) => Ok(DiffResponse {
            replace_keys: diff.replace_keys,
            delete_before_replace: diff.delete_before_replace,
            ..DiffResponse::from_inputs(&old.inputs, &goal.inputs)
        }),
        Err(e) if e.is_unsupported() => Ok(DiffResponse::from_inputs(&old.inputs, &goal.inputs)),
        Err(e) => Err(EngineError::provider(&goal.urn, "diff", &e)),
    }
}
