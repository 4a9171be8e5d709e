use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use converge_core::{EnforcementLevel, PolicySeverity, PropertyMap, Urn};
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which kind of check a policy performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Runs per resource, during `analyze` and `remediate`.
    Resource,
    /// Runs once over the whole stack.
    Stack,
    /// The pack did not say. Counted for both resource and stack summaries.
    #[default]
    Unknown,
}

impl PolicyKind {
    pub fn applies_to_resources(self) -> bool {
        matches!(self, PolicyKind::Resource | PolicyKind::Unknown)
    }

    pub fn applies_to_stack(self) -> bool {
        matches!(self, PolicyKind::Stack | PolicyKind::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: PolicyKind,
    pub enforcement_level: EnforcementLevel,
    #[serde(default)]
    pub severity: Option<PolicySeverity>,
}

/// Self-description of a loaded policy pack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub policies: Vec<PolicyInfo>,
}

/// The view of a resource handed to an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerResource {
    pub urn: Urn,
    pub resource_type: String,
    pub name: String,
    pub properties: PropertyMap,
    #[serde(default)]
    pub custom: bool,
    #[serde(default)]
    pub parent: Option<Urn>,
    #[serde(default)]
    pub dependencies: Vec<Urn>,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub policy_name: String,
    #[serde(default)]
    pub description: String,
    pub message: String,
    pub enforcement_level: EnforcementLevel,
    /// Overrides the severity the policy declared in [`AnalyzerInfo`].
    #[serde(default)]
    pub severity: Option<PolicySeverity>,
    /// Stack-level diagnostics may point at a specific resource.
    #[serde(default)]
    pub urn: Option<Urn>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    /// Names of policies that did not apply to the input.
    #[serde(default)]
    pub not_applicable: Vec<String>,
}

/// One proposed fix. Either rewrites the properties, or only reports why
/// it could not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remediation {
    pub policy_name: String,
    #[serde(default)]
    pub policy_pack_name: String,
    #[serde(default)]
    pub policy_pack_version: String,
    #[serde(default)]
    pub description: String,
    /// The complete new property map, replacing the previous one.
    #[serde(default)]
    pub properties: Option<PropertyMap>,
    #[serde(default)]
    pub diagnostic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemediateResponse {
    #[serde(default)]
    pub remediations: Vec<Remediation>,
    #[serde(default)]
    pub not_applicable: Vec<String>,
}

/// A policy pack. Every operation is optional: the default bodies report
/// [`PolicyError::Unsupported`], which the pipeline treats as "nothing to do".
pub trait Analyzer: Send + Sync {
    fn info(&self) -> BoxFuture<'_, Result<AnalyzerInfo, PolicyError>> {
        Box::pin(async { Err(PolicyError::unsupported("info")) })
    }

    fn analyze<'a>(
        &'a self,
        _resource: &'a AnalyzerResource,
    ) -> BoxFuture<'a, Result<AnalyzeResponse, PolicyError>> {
        Box::pin(async { Err(PolicyError::unsupported("analyze")) })
    }

    fn analyze_stack<'a>(
        &'a self,
        _resources: &'a [AnalyzerResource],
    ) -> BoxFuture<'a, Result<AnalyzeResponse, PolicyError>> {
        Box::pin(async { Err(PolicyError::unsupported("analyze_stack")) })
    }

    fn remediate<'a>(
        &'a self,
        _resource: &'a AnalyzerResource,
    ) -> BoxFuture<'a, Result<RemediateResponse, PolicyError>> {
        Box::pin(async { Err(PolicyError::unsupported("remediate")) })
    }

    /// Graceful-shutdown hook, called when a run is canceled.
    fn cancel(&self) -> BoxFuture<'_, Result<(), PolicyError>> {
        Box::pin(async { Err(PolicyError::unsupported("cancel")) })
    }
}

/// A pack the run must enforce, in the order packs are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredPolicy {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub config: PropertyMap,
}

impl RequiredPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            config: PropertyMap::new(),
        }
    }
}

/// What a loader gets to construct an analyzer for one run.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerOptions {
    pub stack: String,
    pub project: String,
    pub config: PropertyMap,
}

type AnalyzerFactory =
    Arc<dyn Fn(&AnalyzerOptions) -> Result<Arc<dyn Analyzer>, PolicyError> + Send + Sync>;

/// Named constructor for a policy pack.
#[derive(Clone)]
pub struct AnalyzerLoader {
    pub name: String,
    factory: AnalyzerFactory,
}

impl AnalyzerLoader {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&AnalyzerOptions) -> Result<Arc<dyn Analyzer>, PolicyError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
        }
    }

    pub fn load(&self, options: &AnalyzerOptions) -> Result<Arc<dyn Analyzer>, PolicyError> {
        (self.factory)(options)
    }
}

impl fmt::Debug for AnalyzerLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyzerLoader")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
