use std::collections::HashMap;

use converge_core::goal::CustomTimeouts;
use converge_core::{PropertyMap, ResourceGoal, Urn};
use converge_policy::AnalyzerResource;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::EngineError;
use crate::provider::{CallRequest, InvokeRequest, PackageRef, RegisterPackageRequest};

/// A resource declaration from the program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterResourceRequest {
    pub resource_type: String,
    pub name: String,
    pub custom: bool,
    pub parent: Option<Urn>,
    pub inputs: PropertyMap,
    pub dependencies: Vec<Urn>,
    pub provider: Option<String>,
    pub protect: bool,
    pub retain_on_delete: bool,
    pub delete_before_replace: Option<bool>,
    pub replace_with: Vec<Urn>,
    pub deleted_with: Option<Urn>,
    pub create_if_not_exists: Option<String>,
    pub import_id: Option<String>,
    pub replacement_trigger: Option<Value>,
    pub custom_timeouts: CustomTimeouts,
}

impl RegisterResourceRequest {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>, custom: bool) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            custom,
            ..Default::default()
        }
    }

    pub fn with_inputs(mut self, inputs: PropertyMap) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_parent(mut self, parent: Urn) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Urn>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Request to read an unmanaged object into the snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResourceRequest {
    pub resource_type: String,
    pub name: String,
    pub id: String,
    pub parent: Option<Urn>,
    pub provider: Option<String>,
    pub dependencies: Vec<Urn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterResourceResponse {
    pub urn: Urn,
    pub id: String,
    pub outputs: PropertyMap,
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

pub(crate) enum MonitorRequest {
    Register(RegisterResourceRequest, Reply<RegisterResourceResponse>),
    Read(ReadResourceRequest, Reply<RegisterResourceResponse>),
    RegisterPackage(RegisterPackageRequest, Reply<PackageRef>),
    Invoke(InvokeRequest, Reply<PropertyMap>),
    Call(CallRequest, Reply<PropertyMap>),
}

/// The program's handle on a running deployment.
///
/// Cheap to clone; calls from many tasks are funneled into one coordinator.
/// Each call resolves once the corresponding step has committed (or failed).
#[derive(Clone)]
pub struct ResourceMonitor {
    tx: mpsc::UnboundedSender<MonitorRequest>,
}

impl ResourceMonitor {
    pub(crate) fn new(tx: mpsc::UnboundedSender<MonitorRequest>) -> Self {
        Self { tx }
    }

    pub async fn register_resource(
        &self,
        req: RegisterResourceRequest,
    ) -> Result<RegisterResourceResponse, EngineError> {
        self.round_trip(|reply| MonitorRequest::Register(req, reply))
            .await
    }

    pub async fn read_resource(
        &self,
        req: ReadResourceRequest,
    ) -> Result<RegisterResourceResponse, EngineError> {
        self.round_trip(|reply| MonitorRequest::Read(req, reply))
            .await
    }

    pub async fn register_package(
        &self,
        req: RegisterPackageRequest,
    ) -> Result<PackageRef, EngineError> {
        self.round_trip(|reply| MonitorRequest::RegisterPackage(req, reply))
            .await
    }

    pub async fn invoke(&self, req: InvokeRequest) -> Result<PropertyMap, EngineError> {
        self.round_trip(|reply| MonitorRequest::Invoke(req, reply))
            .await
    }

    pub async fn call(&self, req: CallRequest) -> Result<PropertyMap, EngineError> {
        self.round_trip(|reply| MonitorRequest::Call(req, reply))
            .await
    }

    async fn round_trip<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> MonitorRequest,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| EngineError::MonitorShutDown)?;
        rx.await.map_err(|_| EngineError::MonitorShutDown)?
    }
}

/// Normalizes registrations into goals and remembers what this run declared.
pub struct GoalRegistry {
    stack: String,
    project: String,
    goals: HashMap<Urn, ResourceGoal>,
    order: Vec<Urn>,
}

impl GoalRegistry {
    pub fn new(stack: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            project: project.into(),
            goals: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn urn_for(&self, parent: Option<&Urn>, resource_type: &str, name: &str) -> Urn {
        Urn::new(&self.stack, &self.project, parent, resource_type, name)
    }

    /// Validate a registration and turn it into a goal.
    ///
    /// Rejects conflicting import options, URNs already registered in this
    /// run, and references to resources that have not been registered yet.
    /// `deleted_with` may name anything.
    pub fn admit(&mut self, req: RegisterResourceRequest) -> Result<ResourceGoal, EngineError> {
        let urn = self.urn_for(req.parent.as_ref(), &req.resource_type, &req.name);

        if req.import_id.is_some() && req.create_if_not_exists.is_some() {
            return Err(EngineError::ImportConflict { urn });
        }
        self.claim(&urn)?;

        let references = req
            .parent
            .iter()
            .map(|u| ("parent", u))
            .chain(req.dependencies.iter().map(|u| ("dependency", u)))
            .chain(req.replace_with.iter().map(|u| ("replace_with", u)));
        for (field, target) in references {
            if !self.goals.contains_key(target) {
                return Err(EngineError::UnknownReference {
                    urn,
                    field,
                    target: target.clone(),
                });
            }
        }

        let goal = ResourceGoal {
            urn,
            resource_type: req.resource_type,
            name: req.name,
            custom: req.custom,
            parent: req.parent,
            inputs: req.inputs,
            dependencies: req.dependencies,
            provider: req.provider,
            protect: req.protect,
            retain_on_delete: req.retain_on_delete,
            delete_before_replace: req.delete_before_replace,
            replace_with: req.replace_with,
            deleted_with: req.deleted_with,
            create_if_not_exists: req.create_if_not_exists,
            import_id: req.import_id,
            replacement_trigger: req.replacement_trigger,
            custom_timeouts: req.custom_timeouts,
        };
        self.record(goal.clone());
        Ok(goal)
    }

    /// Fails if `urn` was already registered in this run.
    pub fn claim(&self, urn: &Urn) -> Result<(), EngineError> {
        if self.goals.contains_key(urn) {
            return Err(EngineError::DuplicateUrn { urn: urn.clone() });
        }
        Ok(())
    }

    /// Store (or overwrite) the final goal for its URN.
    pub fn record(&mut self, goal: ResourceGoal) {
        if !self.goals.contains_key(&goal.urn) {
            self.order.push(goal.urn.clone());
        }
        self.goals.insert(goal.urn.clone(), goal);
    }

    pub fn contains(&self, urn: &Urn) -> bool {
        self.goals.contains_key(urn)
    }

    /// Goals in registration order.
    pub fn goals(&self) -> impl Iterator<Item = &ResourceGoal> {
        self.order.iter().filter_map(|urn| self.goals.get(urn))
    }

    /// URNs the step for `goal` must wait for: parent, dependencies,
    /// `replace_with`, and `deleted_with` when it was registered.
    pub fn scheduling_dependencies(&self, goal: &ResourceGoal) -> Vec<Urn> {
        let mut deps = goal.scheduling_dependencies();
        if let Some(target) = &goal.deleted_with {
            if self.contains(target) && !deps.contains(target) {
                deps.push(target.clone());
            }
        }
        deps
    }
}

/// The analyzer's view of a goal.
pub fn analyzer_resource(goal: &ResourceGoal) -> AnalyzerResource {
    AnalyzerResource {
        urn: goal.urn.clone(),
        resource_type: goal.resource_type.clone(),
        name: goal.name.clone(),
        properties: goal.inputs.clone(),
        custom: goal.custom,
        parent: goal.parent.clone(),
        dependencies: goal.dependencies.clone(),
        provider: goal.provider.clone(),
    }
}
