#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use converge_core::events::{EventLog, EventSink};
use converge_core::{PropertyMap, Snapshot, property};
use converge_engine::provider::BoxFuture;
use converge_engine::{
    CheckRequest, CheckResponse, CreateRequest, CreateResponse, DeleteRequest, Deployment,
    DeploymentOptions, DiffRequest, DiffResponse, EngineError, InvokeRequest,
    MemorySnapshotStore, PluginHost, Provider, ProviderError, ProviderLoader, ReadRequest,
    ReadResponse, RegisterResourceRequest, ResourceMonitor, RunOutcome, SnapshotStore, Target,
    UpdateRequest,
};
use converge_policy::{
    AnalyzeResponse, Analyzer, AnalyzerInfo, AnalyzerLoader, AnalyzerOptions, AnalyzerResource,
    PolicyError, RemediateResponse,
};
use serde_json::Value;

pub const TYPE_A: &str = "pkgA:m:typA";
pub const COMPONENT: &str = "my:index:Component";

type Hook<Req, Resp> = Arc<dyn Fn(&Req) -> Result<Resp, ProviderError> + Send + Sync>;

/// Provider whose behaviour is supplied per test.
///
/// Unset hooks fall back to a simple in-memory provider: create assigns a
/// fresh ID and echoes inputs as outputs, update echoes the new inputs,
/// delete succeeds. Check, diff, read, invoke and parameterize are
/// unsupported unless set.
#[derive(Default)]
pub struct FakeProvider {
    pub check: Option<Hook<CheckRequest, CheckResponse>>,
    pub diff: Option<Hook<DiffRequest, DiffResponse>>,
    pub create: Option<Hook<CreateRequest, CreateResponse>>,
    pub read: Option<Hook<ReadRequest, Option<ReadResponse>>>,
    pub update: Option<Hook<UpdateRequest, PropertyMap>>,
    pub delete: Option<Hook<DeleteRequest, ()>>,
    pub invoke: Option<Hook<InvokeRequest, PropertyMap>>,
    pub parameterize: Option<Hook<Value, (String, String)>>,
    pub calls: Mutex<Vec<(String, String)>>,
    pub canceled: AtomicBool,
}

impl FakeProvider {
    fn record(&self, op: &str, name: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((op.to_string(), name.to_string()));
        }
    }

    /// Names of the resources `op` was called for, in call order.
    pub fn calls_of(&self, op: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| o == op)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls_of(op).len()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn was_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl Provider for FakeProvider {
    fn check<'a>(&'a self, req: &'a CheckRequest) -> BoxFuture<'a, Result<CheckResponse, ProviderError>> {
        self.record("check", req.urn.name());
        let result = match &self.check {
            Some(f) => f(req),
            None => Err(ProviderError::unsupported("check")),
        };
        Box::pin(async move { result })
    }

    fn diff<'a>(&'a self, req: &'a DiffRequest) -> BoxFuture<'a, Result<DiffResponse, ProviderError>> {
        self.record("diff", req.urn.name());
        let result = match &self.diff {
            Some(f) => f(req),
            None => Err(ProviderError::unsupported("diff")),
        };
        Box::pin(async move { result })
    }

    fn create<'a>(
        &'a self,
        req: &'a CreateRequest,
    ) -> BoxFuture<'a, Result<CreateResponse, ProviderError>> {
        self.record("create", req.urn.name());
        let result = match &self.create {
            Some(f) => f(req),
            None => Ok(CreateResponse {
                id: uuid::Uuid::new_v4().to_string(),
                outputs: req.inputs.clone(),
            }),
        };
        Box::pin(async move { result })
    }

    fn read<'a>(
        &'a self,
        req: &'a ReadRequest,
    ) -> BoxFuture<'a, Result<Option<ReadResponse>, ProviderError>> {
        self.record("read", req.urn.name());
        let result = match &self.read {
            Some(f) => f(req),
            None => Err(ProviderError::unsupported("read")),
        };
        Box::pin(async move { result })
    }

    fn update<'a>(
        &'a self,
        req: &'a UpdateRequest,
    ) -> BoxFuture<'a, Result<PropertyMap, ProviderError>> {
        self.record("update", req.urn.name());
        let result = match &self.update {
            Some(f) => f(req),
            None => Ok(req.new_inputs.clone()),
        };
        Box::pin(async move { result })
    }

    fn delete<'a>(&'a self, req: &'a DeleteRequest) -> BoxFuture<'a, Result<(), ProviderError>> {
        self.record("delete", req.urn.name());
        let result = match &self.delete {
            Some(f) => f(req),
            None => Ok(()),
        };
        Box::pin(async move { result })
    }

    fn invoke<'a>(
        &'a self,
        req: &'a InvokeRequest,
    ) -> BoxFuture<'a, Result<PropertyMap, ProviderError>> {
        self.record("invoke", &req.token);
        let result = match &self.invoke {
            Some(f) => f(req),
            None => Err(ProviderError::unsupported("invoke")),
        };
        Box::pin(async move { result })
    }

    fn parameterize<'a>(
        &'a self,
        value: &'a Value,
    ) -> BoxFuture<'a, Result<(String, String), ProviderError>> {
        self.record("parameterize", "");
        let result = match &self.parameterize {
            Some(f) => f(value),
            None => Err(ProviderError::unsupported("parameterize")),
        };
        Box::pin(async move { result })
    }

    fn cancel(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
        self.canceled.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

type AnalyzeFn = Box<dyn Fn(&AnalyzerResource) -> Result<AnalyzeResponse, PolicyError> + Send + Sync>;
type StackFn = Box<dyn Fn(&[AnalyzerResource]) -> Result<AnalyzeResponse, PolicyError> + Send + Sync>;
type RemediateFn =
    Box<dyn Fn(&AnalyzerResource) -> Result<RemediateResponse, PolicyError> + Send + Sync>;

/// Analyzer whose behaviour is supplied per test. Unset hooks are unsupported.
#[derive(Default)]
pub struct FakeAnalyzer {
    pub info: Option<AnalyzerInfo>,
    pub analyze: Option<AnalyzeFn>,
    pub analyze_stack: Option<StackFn>,
    pub remediate: Option<RemediateFn>,
    pub canceled: AtomicBool,
}

impl FakeAnalyzer {
    pub fn was_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl Analyzer for FakeAnalyzer {
    fn info(&self) -> converge_policy::BoxFuture<'_, Result<AnalyzerInfo, PolicyError>> {
        let result = self.info.clone().ok_or(PolicyError::unsupported("info"));
        Box::pin(async move { result })
    }

    fn analyze<'a>(
        &'a self,
        resource: &'a AnalyzerResource,
    ) -> converge_policy::BoxFuture<'a, Result<AnalyzeResponse, PolicyError>> {
        let result = match &self.analyze {
            Some(f) => f(resource),
            None => Err(PolicyError::unsupported("analyze")),
        };
        Box::pin(async move { result })
    }

    fn analyze_stack<'a>(
        &'a self,
        resources: &'a [AnalyzerResource],
    ) -> converge_policy::BoxFuture<'a, Result<AnalyzeResponse, PolicyError>> {
        let result = match &self.analyze_stack {
            Some(f) => f(resources),
            None => Err(PolicyError::unsupported("analyze_stack")),
        };
        Box::pin(async move { result })
    }

    fn remediate<'a>(
        &'a self,
        resource: &'a AnalyzerResource,
    ) -> converge_policy::BoxFuture<'a, Result<RemediateResponse, PolicyError>> {
        let result = match &self.remediate {
            Some(f) => f(resource),
            None => Err(PolicyError::unsupported("remediate")),
        };
        Box::pin(async move { result })
    }

    fn cancel(&self) -> converge_policy::BoxFuture<'_, Result<(), PolicyError>> {
        self.canceled.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A host serving `provider` as package `pkgA@1.0.0`.
pub fn host(provider: Arc<FakeProvider>) -> PluginHost {
    PluginHost::new().with_provider(provider_loader("pkgA", "1.0.0", provider))
}

pub fn provider_loader(package: &str, version: &str, provider: Arc<FakeProvider>) -> ProviderLoader {
    ProviderLoader::new(package, version, move || {
        let provider: Arc<dyn Provider> = provider.clone();
        Ok(provider)
    })
}

pub fn analyzer_loader(name: &str, analyzer: Arc<FakeAnalyzer>) -> AnalyzerLoader {
    AnalyzerLoader::new(name, move |_opts: &AnalyzerOptions| {
        let analyzer: Arc<dyn Analyzer> = analyzer.clone();
        Ok(analyzer)
    })
}

pub fn props(value: Value) -> PropertyMap {
    property::from_json(value)
}

/// A custom `pkgA:m:typA` resource.
pub fn custom(name: &str, inputs: Value) -> RegisterResourceRequest {
    RegisterResourceRequest::new(TYPE_A, name, true).with_inputs(props(inputs))
}

pub fn component(name: &str) -> RegisterResourceRequest {
    RegisterResourceRequest::new(COMPONENT, name, false)
}

/// Runs successive updates of one stack over a shared in-memory store.
pub struct Harness {
    pub store: Arc<MemorySnapshotStore>,
    pub events: Arc<EventLog>,
    pub options: DeploymentOptions,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            store: Arc::new(MemorySnapshotStore::new()),
            events: Arc::new(EventLog::new()),
            options: DeploymentOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DeploymentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn deployment(&self, host: PluginHost) -> Deployment {
        let store: Arc<dyn SnapshotStore> = self.store.clone();
        let events: Arc<dyn EventSink> = self.events.clone();
        Deployment::new(Target::new("test", "test"), Arc::new(host))
            .with_options(self.options.clone())
            .with_store(store)
            .with_events(events)
    }

    /// One update against whatever the store holds. Asserts the returned
    /// snapshot is consistent.
    pub async fn run<F, Fut>(&self, host: PluginHost, program: F) -> RunOutcome
    where
        F: FnOnce(ResourceMonitor) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        let outcome = self.deployment(host).update_from_store(program).await;
        assert_valid(&outcome.snapshot);
        outcome
    }

    pub fn latest(&self) -> Snapshot {
        self.store.latest().unwrap_or_default()
    }
}

pub fn assert_valid(snapshot: &Snapshot) {
    if let Err(e) = snapshot.verify_integrity() {
        panic!("snapshot failed integrity check: {e}\n{snapshot:#?}");
    }
}

/// Find the live entry named `name`.
pub fn entry<'a>(snapshot: &'a Snapshot, name: &str) -> &'a converge_core::ResourceState {
    snapshot
        .resources
        .iter()
        .find(|r| r.urn.name() == name && !r.pending_delete)
        .unwrap_or_else(|| panic!("no live entry named {name}"))
}
