use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::property::PropertyMap;
use crate::urn::Urn;

/// Desired state for one resource, as declared by the program for this run.
///
/// Built once per registration by the registry, handed to the policy pipeline
/// and step generator, and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGoal {
    pub urn: Urn,
    pub resource_type: String,
    pub name: String,
    /// Custom resources are managed by a provider; components are purely logical.
    pub custom: bool,
    pub parent: Option<Urn>,
    pub inputs: PropertyMap,
    pub dependencies: Vec<Urn>,
    /// Package reference from `register_package`, or `None` for the default
    /// provider of the type's package.
    pub provider: Option<String>,
    pub protect: bool,
    pub retain_on_delete: bool,
    /// Explicit replace-strategy override. `None` defers to the provider's hint.
    pub delete_before_replace: Option<bool>,
    /// If any of these is replaced, this resource is replaced too.
    pub replace_with: Vec<Urn>,
    pub deleted_with: Option<Urn>,
    /// External ID to adopt instead of creating, if the object already exists.
    pub create_if_not_exists: Option<String>,
    pub import_id: Option<String>,
    pub replacement_trigger: Option<Value>,
    pub custom_timeouts: CustomTimeouts,
}

impl ResourceGoal {
    /// URNs that must commit before this resource's step may start.
    pub fn scheduling_dependencies(&self) -> Vec<Urn> {
        let mut deps: Vec<Urn> = Vec::with_capacity(self.dependencies.len() + 2);
        let candidates = self
            .parent
            .iter()
            .chain(self.dependencies.iter())
            .chain(self.replace_with.iter());
        for urn in candidates {
            if !deps.contains(urn) {
                deps.push(urn.clone());
            }
        }
        deps
    }
}

/// Per-operation timeouts in seconds, passed through to the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomTimeouts {
    pub create: Option<f64>,
    pub update: Option<f64>,
    pub delete: Option<f64>,
}
