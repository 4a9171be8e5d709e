use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use converge_core::urn::package_of;
use converge_core::{PropertyMap, Urn};
use converge_policy::AnalyzerLoader;
use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::EngineError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider does not support {operation}")]
    Unsupported { operation: &'static str },

    #[error("{0}")]
    Failed(String),
}

impl ProviderError {
    pub fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckRequest {
    pub urn: Urn,
    pub olds: PropertyMap,
    pub news: PropertyMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckFailure {
    pub property: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckResponse {
    /// Normalized inputs to use in place of the declared ones.
    pub inputs: PropertyMap,
    pub failures: Vec<CheckFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffRequest {
    pub urn: Urn,
    pub id: String,
    pub old_inputs: PropertyMap,
    pub old_outputs: PropertyMap,
    pub new_inputs: PropertyMap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiffChanges {
    None,
    Some,
    /// The provider could not tell; the engine compares inputs itself.
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffResponse {
    pub changes: DiffChanges,
    /// Properties whose change requires a replacement.
    pub replace_keys: Vec<String>,
    pub changed_keys: Vec<String>,
    /// Provider hint for the replace strategy.
    pub delete_before_replace: bool,
}

impl DiffResponse {
    pub fn no_changes() -> Self {
        Self {
            changes: DiffChanges::None,
            ..Default::default()
        }
    }

    /// Diff by comparing inputs, for providers without a `diff` and for
    /// components.
    pub fn from_inputs(old: &PropertyMap, new: &PropertyMap) -> Self {
        let changed_keys = converge_core::property::changed_keys(old, new);
        Self {
            changes: if changed_keys.is_empty() {
                DiffChanges::None
            } else {
                DiffChanges::Some
            },
            replace_keys: Vec::new(),
            changed_keys,
            delete_before_replace: false,
        }
    }

    pub fn requires_replacement(&self) -> bool {
        !self.replace_keys.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub urn: Urn,
    pub inputs: PropertyMap,
    pub timeout: Option<f64>,
    /// Plan only: report the expected outputs without creating anything.
    pub preview: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateResponse {
    pub id: String,
    pub outputs: PropertyMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    pub urn: Urn,
    pub id: String,
    pub inputs: Option<PropertyMap>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResponse {
    pub id: String,
    /// Inputs recovered from the live object, if the provider can tell.
    pub inputs: Option<PropertyMap>,
    pub outputs: PropertyMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub urn: Urn,
    pub id: String,
    pub old_inputs: PropertyMap,
    pub old_outputs: PropertyMap,
    pub new_inputs: PropertyMap,
    pub timeout: Option<f64>,
    pub preview: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRequest {
    pub urn: Urn,
    pub id: String,
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
    pub timeout: Option<f64>,
    pub preview: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    pub token: String,
    pub args: PropertyMap,
    /// Package reference; `None` uses the default provider of the token's package.
    pub provider: Option<String>,
}

pub type CallRequest = InvokeRequest;

/// A resource provider plugin. Every method is optional.
pub trait Provider: Send + Sync {
    fn check<'a>(&'a self, _req: &'a CheckRequest) -> BoxFuture<'a, Result<CheckResponse, ProviderError>> {
        Box::pin(async { Err(ProviderError::unsupported("check")) })
    }

    fn diff<'a>(&'a self, _req: &'a DiffRequest) -> BoxFuture<'a, Result<DiffResponse, ProviderError>> {
        Box::pin(async { Err(ProviderError::unsupported("diff")) })
    }

    fn create<'a>(
        &'a self,
        _req: &'a CreateRequest,
    ) -> BoxFuture<'a, Result<CreateResponse, ProviderError>> {
        Box::pin(async { Err(ProviderError::unsupported("create")) })
    }

    /// `Ok(None)` means the object does not exist.
    fn read<'a>(
        &'a self,
        _req: &'a ReadRequest,
    ) -> BoxFuture<'a, Result<Option<ReadResponse>, ProviderError>> {
        Box::pin(async { Err(ProviderError::unsupported("read")) })
    }

    /// Returns the new outputs.
    fn update<'a>(
        &'a self,
        _req: &'a UpdateRequest,
    ) -> BoxFuture<'a, Result<PropertyMap, ProviderError>> {
        Box::pin(async { Err(ProviderError::unsupported("update")) })
    }

    fn delete<'a>(&'a self, _req: &'a DeleteRequest) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(async { Err(ProviderError::unsupported("delete")) })
    }

    fn invoke<'a>(
        &'a self,
        _req: &'a InvokeRequest,
    ) -> BoxFuture<'a, Result<PropertyMap, ProviderError>> {
        Box::pin(async { Err(ProviderError::unsupported("invoke")) })
    }

    fn call<'a>(&'a self, _req: &'a CallRequest) -> BoxFuture<'a, Result<PropertyMap, ProviderError>> {
        Box::pin(async { Err(ProviderError::unsupported("call")) })
    }

    /// Turn this provider into a parameterized package; returns its
    /// `(name, version)`.
    fn parameterize<'a>(
        &'a self,
        _value: &'a Value,
    ) -> BoxFuture<'a, Result<(String, String), ProviderError>> {
        Box::pin(async { Err(ProviderError::unsupported("parameterize")) })
    }

    /// Graceful-shutdown hook, called when a run is canceled.
    fn cancel(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async { Err(ProviderError::unsupported("cancel")) })
    }
}

type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync>;

/// Named, versioned constructor for a provider package.
#[derive(Clone)]
pub struct ProviderLoader {
    pub package: String,
    pub version: String,
    factory: ProviderFactory,
}

impl ProviderLoader {
    pub fn new<F>(package: impl Into<String>, version: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync + 'static,
    {
        Self {
            package: package.into(),
            version: version.into(),
            factory: Arc::new(factory),
        }
    }

    pub fn reference(&self) -> String {
        package_reference(&self.package, &self.version)
    }

    fn load(&self) -> Result<Arc<dyn Provider>, ProviderError> {
        (self.factory)()
    }
}

impl fmt::Debug for ProviderLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderLoader")
            .field("package", &self.package)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Everything a run may load: provider packages and policy packs.
#[derive(Debug, Clone, Default)]
pub struct PluginHost {
    pub providers: Vec<ProviderLoader>,
    pub analyzers: Vec<AnalyzerLoader>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, loader: ProviderLoader) -> Self {
        self.providers.push(loader);
        self
    }

    pub fn with_analyzer(mut self, loader: AnalyzerLoader) -> Self {
        self.analyzers.push(loader);
        self
    }

    fn find(&self, package: &str, version: Option<&str>) -> Option<&ProviderLoader> {
        match version {
            Some(v) if !v.is_empty() => self
                .providers
                .iter()
                .find(|l| l.package == package && l.version == v),
            _ => self.providers.iter().find(|l| l.package == package),
        }
    }
}

/// `name@version`, the form stored in snapshots.
pub fn package_reference(name: &str, version: &str) -> String {
    format!("{name}@{version}")
}

/// Package name of a `name@version` reference.
pub fn reference_package(reference: &str) -> &str {
    reference.split('@').next().unwrap_or(reference)
}

/// A loaded provider together with the reference it was resolved under.
#[derive(Clone)]
pub struct ProviderHandle {
    pub reference: String,
    pub provider: Arc<dyn Provider>,
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameterization {
    pub name: String,
    pub version: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterPackageRequest {
    pub name: String,
    pub version: String,
    pub parameterization: Option<Parameterization>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRef {
    pub reference: String,
}

type Instances = Arc<Mutex<HashMap<String, Arc<dyn Provider>>>>;

/// Per-run cache of instantiated providers and registered packages.
///
/// Owned by the coordinator, so registration is naturally serialized. The
/// instance map is shared with [`ProviderCanceller`].
pub struct ProviderRegistry {
    host: Arc<PluginHost>,
    instances: Instances,
    packages: HashMap<(String, String, Option<(String, String)>), PackageRef>,
}

impl ProviderRegistry {
    pub fn new(host: Arc<PluginHost>) -> Self {
        Self {
            host,
            instances: Arc::default(),
            packages: HashMap::new(),
        }
    }

    /// Handle that can cancel every provider loaded so far, from any task.
    pub fn canceller(&self) -> ProviderCanceller {
        ProviderCanceller {
            instances: self.instances.clone(),
        }
    }

    fn loaded(&self, reference: &str) -> Option<Arc<dyn Provider>> {
        self.instances.lock().ok()?.get(reference).cloned()
    }

    fn remember(&self, reference: &str, provider: Arc<dyn Provider>) {
        if let Ok(mut instances) = self.instances.lock() {
            instances.insert(reference.to_string(), provider);
        }
    }

    /// Provider for a resource: the explicit package reference if given,
    /// otherwise the default provider of the type's package.
    pub fn resolve(
        &mut self,
        reference: Option<&str>,
        resource_type: &str,
    ) -> Result<ProviderHandle, EngineError> {
        match reference {
            Some(reference) => self.by_reference(reference),
            None => {
                let package = package_of(resource_type);
                let loader = self
                    .host
                    .find(package, None)
                    .ok_or_else(|| EngineError::MissingProvider {
                        reference: package.to_string(),
                    })?;
                let reference = loader.reference();
                self.by_reference(&reference)
            }
        }
    }

    /// Provider for a stored `name@version` reference, loading it on first use.
    pub fn by_reference(&mut self, reference: &str) -> Result<ProviderHandle, EngineError> {
        if let Some(provider) = self.loaded(reference) {
            return Ok(ProviderHandle {
                reference: reference.to_string(),
                provider,
            });
        }

        let mut parts = reference.splitn(2, '@');
        let name = parts.next().unwrap_or(reference);
        let version = parts.next();
        let loader = self
            .host
            .find(name, version)
            .ok_or_else(|| EngineError::MissingProvider {
                reference: reference.to_string(),
            })?;
        let provider = loader.load().map_err(|e| EngineError::MissingProvider {
            reference: format!("{reference} ({e})"),
        })?;
        debug!(provider = %reference, "provider loaded");
        self.remember(reference, provider.clone());

        Ok(ProviderHandle {
            reference: reference.to_string(),
            provider,
        })
    }

    /// Register a package, optionally parameterized. Identical requests
    /// return the same reference.
    pub async fn register_package(
        &mut self,
        req: &RegisterPackageRequest,
    ) -> Result<PackageRef, EngineError> {
        let key = (
            req.name.clone(),
            req.version.clone(),
            req.parameterization
                .as_ref()
                .map(|p| (p.name.clone(), p.version.clone())),
        );
        if let Some(existing) = self.packages.get(&key) {
            return Ok(existing.clone());
        }

        let loader = self
            .host
            .find(&req.name, Some(&req.version))
            .ok_or_else(|| EngineError::MissingProvider {
                reference: package_reference(&req.name, &req.version),
            })?;
        let provider = loader.load().map_err(|e| EngineError::MissingProvider {
            reference: format!("{} ({e})", loader.reference()),
        })?;

        let reference = match &req.parameterization {
            None => loader.reference(),
            Some(param) => {
                let (name, version) = provider.parameterize(&param.value).await.map_err(|e| {
                    EngineError::MissingProvider {
                        reference: format!(
                            "{} parameterized as {}: {e}",
                            loader.reference(),
                            package_reference(&param.name, &param.version)
                        ),
                    }
                })?;
                package_reference(&name, &version)
            }
        };

        info!(package = %reference, "package registered");
        self.remember(&reference, provider);
        let package = PackageRef { reference };
        self.packages.insert(key, package.clone());
        Ok(package)
    }
}

/// Sends the cancel signal to loaded providers while their calls are still
/// in flight.
#[derive(Clone)]
pub struct ProviderCanceller {
    instances: Instances,
}

impl ProviderCanceller {
    /// Signal every loaded provider to shut down. Errors are logged.
    pub async fn cancel_all(&self) {
        let loaded: Vec<(String, Arc<dyn Provider>)> = match self.instances.lock() {
            Ok(instances) => instances
                .iter()
                .map(|(reference, provider)| (reference.clone(), provider.clone()))
                .collect(),
            Err(_) => return,
        };
        let results = join_all(loaded.iter().map(|(_, p)| p.cancel())).await;
        for ((reference, _), result) in loaded.iter().zip(results) {
            match result {
                Ok(()) => debug!(provider = %reference, "provider canceled"),
                Err(e) if e.is_unsupported() => {}
                Err(e) => warn!(provider = %reference, error = %e, "provider cancel failed"),
            }
        }
    }
}
