use std::sync::Arc;

use converge_core::{ResourceGoal, Urn};
use converge_policy::PolicyPipeline;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::cancel::{CancelReason, CancellationToken};
use crate::error::EngineError;
use crate::executor::{StepExecutor, StepJob, StepKey};
use crate::journal::SnapshotJournal;
use crate::provider::{InvokeRequest, ProviderRegistry};
use crate::registry::{
    GoalRegistry, MonitorRequest, ReadResourceRequest, RegisterResourceRequest,
    RegisterResourceResponse, Reply, analyzer_resource,
};
use crate::step::{DeleteMode, Step};
use crate::step_generator::StepGenerator;

/// How the program finished, sent to the coordinator when it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProgramExit {
    Succeeded,
    Failed,
}

/// Owns the mutable state of a run and serializes every program request
/// through one task. Steps themselves run on the executor.
pub(crate) struct Coordinator {
    pub registry: GoalRegistry,
    pub providers: ProviderRegistry,
    pub policy: Arc<PolicyPipeline>,
    pub generator: StepGenerator,
    pub executor: StepExecutor,
    pub journal: Arc<SnapshotJournal>,
    pub halt: CancellationToken,
    pub continue_on_error: bool,
}

impl Coordinator {
    /// Serve requests until the program exits, then run the stack policies
    /// and the delete phase. Returns the primary errors of the run.
    pub async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<MonitorRequest>,
        mut exit: oneshot::Receiver<ProgramExit>,
    ) -> Vec<EngineError> {
        let hooks = self.spawn_cancel_hooks();

        let program = loop {
            tokio::select! {
                biased;
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break ProgramExit::Succeeded,
                },
                exit = &mut exit => break exit.unwrap_or(ProgramExit::Failed),
            }
        };
        // Calls made after the program returned fail with `MonitorShutDown`.
        drop(requests);

        self.executor.wait_idle().await;
        self.finish(program).await;

        if self.halt.is_cancelled() {
            let _ = hooks.await;
        } else {
            hooks.abort();
        }
        self.executor.errors()
    }

    /// Notify analyzers and providers as soon as the run halts, so calls
    /// still in flight can wind down.
    fn spawn_cancel_hooks(&self) -> JoinHandle<()> {
        let halt = self.halt.clone();
        let policy = self.policy.clone();
        let providers = self.providers.canceller();
        tokio::spawn(
            async move {
                halt.cancelled().await;
                info!(reason = ?halt.reason(), "run canceled, notifying plugins");
                policy.cancel().await;
                providers.cancel_all().await;
            }
            .in_current_span(),
        )
    }

    async fn handle(&mut self, request: MonitorRequest) {
        match request {
            MonitorRequest::Register(req, reply) => self.register(req, reply).await,
            MonitorRequest::Read(req, reply) => self.read(req, reply),
            MonitorRequest::RegisterPackage(req, reply) => {
                let result = if self.halt.is_cancelled() {
                    Err(EngineError::Canceled)
                } else {
                    self.providers.register_package(&req).await
                };
                let _ = reply.send(result);
            }
            MonitorRequest::Invoke(req, reply) => self.invoke(req, reply, false),
            MonitorRequest::Call(req, reply) => self.invoke(req, reply, true),
        }
    }

    async fn register(
        &mut self,
        req: RegisterResourceRequest,
        reply: Reply<RegisterResourceResponse>,
    ) {
        if self.halt.is_cancelled() {
            let _ = reply.send(Err(EngineError::Canceled));
            return;
        }

        let goal = match self.registry.admit(req) {
            Ok(goal) => goal,
            Err(e) => {
                self.executor.record_failure(e.clone());
                let _ = reply.send(Err(e));
                return;
            }
        };

        let urn = goal.urn.clone();
        match self.plan(goal).await {
            Ok((step, dependencies)) => self.executor.submit(StepJob {
                key: StepKey::Resource(urn),
                step,
                dependencies: dependencies.into_iter().map(StepKey::Resource).collect(),
                reply: Some(reply),
            }),
            Err(e) => {
                self.executor.mark_failed(StepKey::Resource(urn));
                let fatal = matches!(e, EngineError::RemediationFailure { .. });
                self.executor.record_failure(e.clone());
                if fatal {
                    // Halts even under continue_on_error.
                    self.halt.cancel_with(CancelReason::Failure);
                }
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Policies, provider resolution and step generation for an admitted goal.
    async fn plan(&mut self, goal: ResourceGoal) -> Result<(Step, Vec<Urn>), EngineError> {
        let goal = self.apply_policies(goal).await?;
        self.registry.record(goal.clone());

        let provider = if goal.custom {
            Some(
                self.providers
                    .resolve(goal.provider.as_deref(), &goal.resource_type)?,
            )
        } else {
            None
        };
        let dependencies = self.registry.scheduling_dependencies(&goal);
        let step = self.generator.generate(goal, provider).await?;
        Ok((step, dependencies))
    }

    /// Remediate, then analyze the remediated goal.
    async fn apply_policies(&self, mut goal: ResourceGoal) -> Result<ResourceGoal, EngineError> {
        if self.policy.is_empty() {
            return Ok(goal);
        }

        goal.inputs = self
            .policy
            .remediate(&analyzer_resource(&goal))
            .await
            .map_err(|e| EngineError::RemediationFailure {
                urn: goal.urn.clone(),
                message: e.to_string(),
            })?;

        let report = self.policy.analyze(&analyzer_resource(&goal)).await?;
        if report.is_blocking() {
            return Err(EngineError::PolicyViolation {
                urn: goal.urn,
                message: report.blocking_summary(),
            });
        }
        Ok(goal)
    }

    fn read(&mut self, req: ReadResourceRequest, reply: Reply<RegisterResourceResponse>) {
        if self.halt.is_cancelled() {
            let _ = reply.send(Err(EngineError::Canceled));
            return;
        }

        let admitted = self.registry.admit(RegisterResourceRequest {
            resource_type: req.resource_type,
            name: req.name,
            custom: true,
            parent: req.parent,
            dependencies: req.dependencies,
            provider: req.provider,
            ..Default::default()
        });
        let goal = match admitted {
            Ok(goal) => goal,
            Err(e) => {
                self.executor.record_failure(e.clone());
                let _ = reply.send(Err(e));
                return;
            }
        };

        let key = StepKey::Resource(goal.urn.clone());
        let provider = match self
            .providers
            .resolve(goal.provider.as_deref(), &goal.resource_type)
        {
            Ok(provider) => provider,
            Err(e) => {
                self.executor.mark_failed(key);
                self.executor.record_failure(e.clone());
                let _ = reply.send(Err(e));
                return;
            }
        };

        let dependencies = self
            .registry
            .scheduling_dependencies(&goal)
            .into_iter()
            .map(StepKey::Resource)
            .collect();
        let step = self.generator.read(goal, req.id, provider);
        self.executor.submit(StepJob {
            key,
            step,
            dependencies,
            reply: Some(reply),
        });
    }

    /// Invokes and calls run concurrently with registrations.
    fn invoke(&mut self, req: InvokeRequest, reply: Reply<converge_core::PropertyMap>, call: bool) {
        if self.halt.is_cancelled() {
            let _ = reply.send(Err(EngineError::Canceled));
            return;
        }
        let provider = match self.providers.resolve(req.provider.as_deref(), &req.token) {
            Ok(provider) => provider,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        tokio::spawn(async move {
            let result = if call {
                provider.provider.call(&req).await
            } else {
                provider.provider.invoke(&req).await
            };
            let result = result.map_err(|e| EngineError::Invoke {
                token: req.token.clone(),
                message: crate::error::format_err_chain(&e),
            });
            let _ = reply.send(result);
        });
    }

    async fn finish(&mut self, program: ProgramExit) {
        let clean = self.executor.errors().is_empty() || self.continue_on_error;
        let proceed = program == ProgramExit::Succeeded && clean && !self.halt.is_cancelled();

        if proceed {
            if let Err(e) = self.analyze_stack().await {
                self.executor.record_failure(e);
            }
        }

        let proceed = proceed
            && (self.executor.errors().is_empty() || self.continue_on_error)
            && !self.halt.is_cancelled();
        if proceed {
            self.delete_phase().await;
            self.executor.wait_idle().await;
        } else {
            debug!(?program, "skipping delete phase");
        }
    }

    async fn analyze_stack(&self) -> Result<(), EngineError> {
        if self.policy.is_empty() {
            return Ok(());
        }
        // Goals whose registration or step failed never made it into the stack.
        let resources: Vec<_> = self
            .registry
            .goals()
            .filter(|goal| {
                !self
                    .executor
                    .has_failed(&StepKey::Resource(goal.urn.clone()))
            })
            .map(analyzer_resource)
            .collect();
        let report = self.policy.analyze_stack(&resources).await?;
        if report.is_blocking() {
            return Err(EngineError::StackPolicyViolation {
                message: report.blocking_summary(),
            });
        }
        Ok(())
    }

    async fn delete_phase(&mut self) {
        let survivors = self.journal.surviving_olds().await;
        let registry = &self.registry;
        let plans = match self
            .generator
            .plan_deletes(&survivors, |urn| registry.contains(urn))
        {
            Ok(plans) => plans,
            Err(e) => {
                self.executor.record_failure(e);
                return;
            }
        };
        debug!(deletes = plans.len(), "delete phase planned");

        for plan in plans {
            let key = StepKey::Old(plan.old.id);
            let provider = match (&plan.mode, plan.old.state.custom, plan.old.state.provider.as_deref()) {
                (DeleteMode::Provider, true, Some(reference)) => {
                    match self.providers.by_reference(reference) {
                        Ok(provider) => Some(provider),
                        Err(e) => {
                            warn!(urn = %plan.old.state.urn, error = %e, "cannot delete without provider");
                            self.executor.mark_failed(key);
                            self.executor.record_failure(e);
                            continue;
                        }
                    }
                }
                _ => None,
            };

            self.executor.submit(StepJob {
                key,
                step: Step::Delete {
                    old: plan.old,
                    mode: plan.mode,
                    provider,
                },
                dependencies: plan.after.into_iter().map(StepKey::Old).collect(),
                reply: None,
            });
        }
    }
}
