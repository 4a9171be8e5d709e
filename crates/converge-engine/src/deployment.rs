use std::future::Future;
use std::sync::Arc;

use converge_core::Snapshot;
use converge_core::events::{EventSink, TracingEventSink};
use converge_policy::{AnalyzerOptions, PolicyPipeline, RequiredPolicy};
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, error, info, info_span};

use crate::cancel::{CancelReason, CancellationToken};
use crate::coordinator::{Coordinator, ProgramExit};
use crate::error::EngineError;
use crate::executor::StepExecutor;
use crate::journal::SnapshotJournal;
use crate::persistence::{MemorySnapshotStore, SnapshotStore};
use crate::provider::{PluginHost, ProviderRegistry};
use crate::registry::{GoalRegistry, ResourceMonitor};
use crate::step_generator::StepGenerator;

/// The stack a deployment converges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub stack: String,
    pub project: String,
}

impl Target {
    pub fn new(stack: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            project: project.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentOptions {
    /// Upper bound on concurrent provider operations.
    pub parallel: usize,
    pub continue_on_error: bool,
    /// Verify every snapshot before it is saved.
    pub verify_integrity: bool,
    /// Policy packs to enforce, in order.
    pub required_policies: Vec<RequiredPolicy>,
    /// Plan and report without changing anything: providers see
    /// `preview = true` and the store is left untouched.
    pub preview: bool,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            parallel: 10,
            continue_on_error: false,
            verify_integrity: true,
            required_policies: Vec::new(),
            preview: false,
        }
    }
}

/// Result of one run. The snapshot is always returned, also on failure: it
/// holds every step that committed.
#[derive(Debug)]
pub struct RunOutcome {
    pub snapshot: Snapshot,
    pub result: Result<(), EngineError>,
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Drives a program against a stack: registrations become steps, steps are
/// applied through providers, and the snapshot is committed as they finish.
pub struct Deployment {
    target: Target,
    host: Arc<PluginHost>,
    options: DeploymentOptions,
    store: Arc<dyn SnapshotStore>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl Deployment {
    pub fn new(target: Target, host: Arc<PluginHost>) -> Self {
        Self {
            target,
            host,
            options: DeploymentOptions::default(),
            store: Arc::new(MemorySnapshotStore::new()),
            events: Arc::new(TracingEventSink),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: DeploymentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Token that cancels runs of this deployment.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load the previous snapshot from the store, then run `program`.
    pub async fn update_from_store<F, Fut>(&self, program: F) -> RunOutcome
    where
        F: FnOnce(ResourceMonitor) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        match self.store.load().await {
            Ok(previous) => self.update(previous, program).await,
            Err(e) => RunOutcome {
                snapshot: Snapshot::default(),
                result: Err(e),
            },
        }
    }

    /// Delete everything in `previous`.
    pub async fn destroy(&self, previous: Snapshot) -> RunOutcome {
        self.update(previous, |_monitor| async { Ok(()) }).await
    }

    /// Run `program` against `previous`.
    ///
    /// The program registers resources through the monitor it is given; the
    /// run ends when it returns. Old resources it did not register are
    /// deleted, unless the run failed.
    pub async fn update<F, Fut>(&self, previous: Snapshot, program: F) -> RunOutcome
    where
        F: FnOnce(ResourceMonitor) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        let run_id = uuid::Uuid::new_v4();
        let span = info_span!(
            "deployment",
            run = %run_id,
            stack = %self.target.stack,
            project = %self.target.project
        );
        self.run(previous, program).instrument(span).await
    }

    async fn run<F, Fut>(&self, previous: Snapshot, program: F) -> RunOutcome
    where
        F: FnOnce(ResourceMonitor) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        if let Err(e) = previous.verify_integrity() {
            error!(error = %e, "previous snapshot is inconsistent, refusing to run");
            return RunOutcome {
                snapshot: previous,
                result: Err(e.into()),
            };
        }

        let options = AnalyzerOptions {
            stack: self.target.stack.clone(),
            project: self.target.project.clone(),
            ..Default::default()
        };
        let policy = match PolicyPipeline::load(
            &self.options.required_policies,
            &self.host.analyzers,
            &options,
            self.events.clone(),
        )
        .await
        {
            Ok(policy) => Arc::new(policy),
            Err(e) => {
                return RunOutcome {
                    snapshot: previous,
                    result: Err(e.into()),
                };
            }
        };

        info!(
            resources = previous.len(),
            preview = self.options.preview,
            "run started"
        );

        // Internal halt token: the caller's cancel feeds it, and so do step
        // failures. Only the caller's token is shared across runs.
        let halt = CancellationToken::new();
        if self.cancel.is_cancelled() {
            halt.cancel_with(CancelReason::Requested);
        }
        let forward = {
            let requested = self.cancel.clone();
            let halt = halt.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = requested.cancelled() => halt.cancel_with(CancelReason::Requested),
                    _ = halt.cancelled() => {}
                }
            })
        };

        let journal = if self.options.preview {
            SnapshotJournal::preview(&previous, self.store.clone(), self.options.verify_integrity)
        } else {
            SnapshotJournal::new(&previous, self.store.clone(), self.options.verify_integrity)
        };
        let journal = Arc::new(journal);
        let coordinator = Coordinator {
            registry: GoalRegistry::new(&self.target.stack, &self.target.project),
            providers: ProviderRegistry::new(self.host.clone()),
            policy,
            generator: StepGenerator::new(&previous),
            executor: StepExecutor::new(
                journal.clone(),
                self.events.clone(),
                halt.clone(),
                self.options.parallel,
                self.options.continue_on_error,
                self.options.preview,
            ),
            journal: journal.clone(),
            halt: halt.clone(),
            continue_on_error: self.options.continue_on_error,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let coordinator = tokio::spawn(
            coordinator
                .run(rx, exit_rx)
                .instrument(tracing::Span::current()),
        );

        let program_result = program(ResourceMonitor::new(tx)).await;
        let exit = if program_result.is_ok() {
            ProgramExit::Succeeded
        } else {
            ProgramExit::Failed
        };
        let _ = exit_tx.send(exit);

        let errors = match coordinator.await {
            Ok(errors) => errors,
            Err(e) => vec![EngineError::Program(format!("coordinator task failed: {e}"))],
        };
        forward.abort();

        let snapshot = journal.snapshot().await;
        let result = match errors.into_iter().next() {
            Some(e) => Err(e),
            None => match program_result {
                Err(e) => Err(e),
                Ok(()) if halt.reason() == Some(CancelReason::Requested) => {
                    Err(EngineError::Canceled)
                }
                Ok(()) => Ok(()),
            },
        };

        match &result {
            Ok(()) => info!(resources = snapshot.len(), "run succeeded"),
            Err(e) => error!(resources = snapshot.len(), error = %e, "run failed"),
        }
        RunOutcome { snapshot, result }
    }
}
