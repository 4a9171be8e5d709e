use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use converge_core::Urn;
use converge_core::events::{EngineEvent, EventSink, ResourceStepEvent};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::cancel::{CancelReason, CancellationToken};
use crate::error::EngineError;
use crate::journal::{OldId, SnapshotJournal};
use crate::registry::{RegisterResourceResponse, Reply};
use crate::step::Step;

/// Identifies a step for dependency tracking. Registrations are keyed by
/// URN; deletes by their position in the previous snapshot, since a
/// condemned copy shares its URN with the replacement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepKey {
    Resource(Urn),
    Old(OldId),
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKey::Resource(urn) => write!(f, "{urn}"),
            StepKey::Old(id) => write!(f, "old entry #{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepStatus {
    Pending,
    Succeeded,
    Failed,
}

pub struct StepJob {
    pub key: StepKey,
    pub step: Step,
    pub dependencies: Vec<StepKey>,
    pub reply: Option<Reply<RegisterResourceResponse>>,
}

struct Shared {
    journal: Arc<SnapshotJournal>,
    events: Arc<dyn EventSink>,
    halt: CancellationToken,
    permits: Semaphore,
    continue_on_error: bool,
    preview: bool,
    status: Mutex<HashMap<StepKey, watch::Sender<StepStatus>>>,
    errors: Mutex<Vec<EngineError>>,
}

/// Runs steps concurrently, each as soon as its dependencies have committed,
/// with at most `parallel` provider operations in flight.
pub struct StepExecutor {
    shared: Arc<Shared>,
    tasks: JoinSet<()>,
}

impl StepExecutor {
    pub fn new(
        journal: Arc<SnapshotJournal>,
        events: Arc<dyn EventSink>,
        halt: CancellationToken,
        parallel: usize,
        continue_on_error: bool,
        preview: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                journal,
                events,
                halt,
                permits: Semaphore::new(parallel.max(1)),
                continue_on_error,
                preview,
                status: Mutex::new(HashMap::new()),
                errors: Mutex::new(Vec::new()),
            }),
            tasks: JoinSet::new(),
        }
    }

    pub fn submit(&mut self, job: StepJob) {
        self.shared.set_status(&job.key, StepStatus::Pending);
        let shared = self.shared.clone();
        self.tasks.spawn(async move {
            let StepJob {
                key,
                step,
                dependencies,
                reply,
            } = job;

            let result = shared.run(step, &dependencies).await;
            let status = if result.is_ok() {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            };
            shared.set_status(&key, status);
            if let Err(e) = &result {
                shared.record(e.clone());
            }
            if let Some(reply) = reply {
                // The program may have stopped listening.
                let _ = reply.send(result);
            }
        });
    }

    /// Mark a step that will never run as failed, so its dependents do not
    /// proceed.
    pub fn mark_failed(&self, key: StepKey) {
        self.shared.set_status(&key, StepStatus::Failed);
    }

    /// `true` if the step for `key` failed or was never allowed to run.
    pub fn has_failed(&self, key: &StepKey) -> bool {
        self.shared
            .status
            .lock()
            .ok()
            .and_then(|map| map.get(key).map(|tx| *tx.borrow() == StepStatus::Failed))
            .unwrap_or(false)
    }

    /// Record an error raised outside a step (validation, policy, planning).
    pub fn record_failure(&self, err: EngineError) {
        self.shared.record(err);
    }

    /// Wait for every submitted step to finish.
    pub async fn wait_idle(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "step task aborted");
                self.shared
                    .record(EngineError::Program(format!("step task aborted: {e}")));
            }
        }
    }

    /// Primary errors in the order they were recorded.
    pub fn errors(&self) -> Vec<EngineError> {
        self.shared
            .errors
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default()
    }
}

impl Shared {
    fn set_status(&self, key: &StepKey, status: StepStatus) {
        let Ok(mut map) = self.status.lock() else {
            return;
        };
        map.entry(key.clone())
            .or_insert_with(|| watch::channel(StepStatus::Pending).0)
            .send_replace(status);
    }

    /// `true` once `key` succeeded. Keys that were never submitted count as
    /// satisfied. Gives up with `false` when the run halts first.
    async fn wait_for(&self, key: &StepKey) -> bool {
        let rx = self
            .status
            .lock()
            .ok()
            .and_then(|map| map.get(key).map(|tx| tx.subscribe()));
        let Some(mut rx) = rx else {
            return true;
        };
        tokio::select! {
            settled = rx.wait_for(|s| *s != StepStatus::Pending) => {
                settled.map(|s| *s == StepStatus::Succeeded).unwrap_or(false)
            }
            _ = self.halt.cancelled() => false,
        }
    }

    async fn run(
        &self,
        step: Step,
        dependencies: &[StepKey],
    ) -> Result<RegisterResourceResponse, EngineError> {
        let urn = step.urn().clone();
        let op = step.op();

        for dependency in dependencies {
            let ok = self.wait_for(dependency).await;
            if self.halt.is_cancelled() {
                return Err(EngineError::Canceled);
            }
            if !ok {
                debug!(urn = %urn, dependency = %dependency, "dependency failed, skipping step");
                return Err(EngineError::DependencyFailed {
                    urn,
                    dependency: dependency.to_string(),
                });
            }
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::Canceled)?;
        if self.halt.is_cancelled() {
            return Err(EngineError::Canceled);
        }

        self.events.emit(EngineEvent::ResourcePre(ResourceStepEvent {
            urn: urn.clone(),
            op,
        }));
        match step.apply(&self.journal, self.preview).await {
            Ok(response) => {
                self.events
                    .emit(EngineEvent::ResourceOutputs(ResourceStepEvent { urn, op }));
                Ok(response)
            }
            Err(e) => {
                self.events.emit(EngineEvent::ResourceOperationFailed {
                    urn,
                    op,
                    message: e.to_string(),
                });
                // A step cut short by a requested cancel is not a failure of its own.
                if self.halt.reason() == Some(CancelReason::Requested) {
                    debug!(error = %e, "step interrupted by cancel");
                    return Err(EngineError::Canceled);
                }
                Err(e)
            }
        }
    }

    /// Keep the error unless it is a consequence of another one, and halt
    /// the run unless it continues on error.
    fn record(&self, err: EngineError) {
        if err.is_secondary() {
            return;
        }
        warn!(error = %err, "run error recorded");
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(err);
        }
        if !self.continue_on_error {
            self.halt.cancel_with(CancelReason::Failure);
        }
    }
}
