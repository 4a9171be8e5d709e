#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use converge_core::events::{EventLog, EventSink};
use converge_core::{EnforcementLevel, PolicySeverity, PropertyMap, Urn, property};
use converge_policy::{
    AnalyzeResponse, Analyzer, AnalyzerInfo, AnalyzerLoader, AnalyzerOptions, AnalyzerResource,
    BoxFuture, PolicyError, PolicyInfo, PolicyKind, PolicyPipeline, RemediateResponse,
    RequiredPolicy,
};

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
    pub canceled: Arc<AtomicBool>,
}

impl FakeAnalyzer {
    pub fn was_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl Analyzer for FakeAnalyzer {
    fn info(&self) -> BoxFuture<'_, Result<AnalyzerInfo, PolicyError>> {
        let result = self.info.clone().ok_or(PolicyError::unsupported("info"));
        Box::pin(async move { result })
    }

    fn analyze<'a>(
        &'a self,
        resource: &'a AnalyzerResource,
    ) -> BoxFuture<'a, Result<AnalyzeResponse, PolicyError>> {
        let result = match &self.analyze {
            Some(f) => f(resource),
            None => Err(PolicyError::unsupported("analyze")),
        };
        Box::pin(async move { result })
    }

    fn analyze_stack<'a>(
        &'a self,
        resources: &'a [AnalyzerResource],
    ) -> BoxFuture<'a, Result<AnalyzeResponse, PolicyError>> {
        let result = match &self.analyze_stack {
            Some(f) => f(resources),
            None => Err(PolicyError::unsupported("analyze_stack")),
        };
        Box::pin(async move { result })
    }

    fn remediate<'a>(
        &'a self,
        resource: &'a AnalyzerResource,
    ) -> BoxFuture<'a, Result<RemediateResponse, PolicyError>> {
        let result = match &self.remediate {
            Some(f) => f(resource),
            None => Err(PolicyError::unsupported("remediate")),
        };
        Box::pin(async move { result })
    }

    fn cancel(&self) -> BoxFuture<'_, Result<(), PolicyError>> {
        self.canceled.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

pub fn loader(name: &str, analyzer: Arc<FakeAnalyzer>) -> AnalyzerLoader {
    AnalyzerLoader::new(name, move |_opts: &AnalyzerOptions| {
        let analyzer: Arc<dyn Analyzer> = analyzer.clone();
        Ok(analyzer)
    })
}

pub fn policy(name: &str, level: EnforcementLevel) -> PolicyInfo {
    PolicyInfo {
        name: name.to_string(),
        description: String::new(),
        kind: PolicyKind::Resource,
        enforcement_level: level,
        severity: None,
    }
}

pub fn policy_with_severity(
    name: &str,
    level: EnforcementLevel,
    severity: PolicySeverity,
) -> PolicyInfo {
    PolicyInfo {
        severity: Some(severity),
        ..policy(name, level)
    }
}

pub fn info(name: &str, policies: Vec<PolicyInfo>) -> AnalyzerInfo {
    AnalyzerInfo {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        policies,
    }
}

pub fn props(value: serde_json::Value) -> PropertyMap {
    property::from_json(value)
}

pub fn resource(name: &str, properties: PropertyMap) -> AnalyzerResource {
    AnalyzerResource {
        urn: Urn::new("test", "test", None, "pkgA:m:typA", name),
        resource_type: "pkgA:m:typA".to_string(),
        name: name.to_string(),
        properties,
        custom: true,
        parent: None,
        dependencies: vec![],
        provider: None,
    }
}

/// Load a single-pack pipeline around `analyzer`, recording events in the
/// returned log.
pub async fn pipeline(analyzer: Arc<FakeAnalyzer>) -> (PolicyPipeline, Arc<EventLog>) {
    let log = Arc::new(EventLog::new());
    let sink: Arc<dyn EventSink> = log.clone();
    let pipeline = PolicyPipeline::load(
        &[RequiredPolicy::new("analyzerA")],
        &[loader("analyzerA", analyzer)],
        &AnalyzerOptions::default(),
        sink,
    )
    .await
    .expect("load pipeline");
    (pipeline, log)
}
