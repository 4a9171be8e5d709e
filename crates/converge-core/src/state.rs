use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::goal::ResourceGoal;
use crate::property::PropertyMap;
use crate::urn::Urn;

/// Persisted state for a single resource, one entry of a [`Snapshot`].
///
/// [`Snapshot`]: crate::snapshot::Snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub urn: Urn,
    pub resource_type: String,
    #[serde(default)]
    pub custom: bool,
    /// Provider-assigned ID. Empty for components.
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub inputs: PropertyMap,
    #[serde(default)]
    pub outputs: PropertyMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Urn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Urn>,
    #[serde(default)]
    pub protect: bool,
    #[serde(default)]
    pub retain_on_delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_with: Option<Urn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replace_with: Vec<Urn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_trigger: Option<Value>,
    /// Read rather than managed; the engine never deletes it through the provider.
    #[serde(default)]
    pub external: bool,
    /// The external object was deleted as the first half of a
    /// delete-before-create replacement; the replacement does not exist yet.
    #[serde(default)]
    pub pending_replacement: bool,
    /// An old copy condemned by a create-before-delete replacement, waiting
    /// for its delete.
    #[serde(default)]
    pub pending_delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<jiff::Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<jiff::Timestamp>,
}

impl ResourceState {
    /// A fresh state for `goal` with no ID or outputs yet.
    pub fn from_goal(goal: &ResourceGoal, provider: Option<String>) -> Self {
        Self {
            urn: goal.urn.clone(),
            resource_type: goal.resource_type.clone(),
            custom: goal.custom,
            id: String::new(),
            provider,
            inputs: goal.inputs.clone(),
            outputs: PropertyMap::new(),
            parent: goal.parent.clone(),
            dependencies: goal.dependencies.clone(),
            protect: goal.protect,
            retain_on_delete: goal.retain_on_delete,
            deleted_with: goal.deleted_with.clone(),
            replace_with: goal.replace_with.clone(),
            replacement_trigger: goal.replacement_trigger.clone(),
            external: false,
            pending_replacement: false,
            pending_delete: false,
            created: None,
            modified: None,
        }
    }

    /// Every URN this entry refers to, tagged with the field it came from.
    pub fn references(&self) -> impl Iterator<Item = (&'static str, &Urn)> {
        self.dependencies
            .iter()
            .map(|u| ("dependency", u))
            .chain(self.deleted_with.iter().map(|u| ("deleted_with", u)))
            .chain(self.replace_with.iter().map(|u| ("replace_with", u)))
    }

    /// Whether this entry represents a live external object that the engine
    /// still owns.
    pub fn is_live(&self) -> bool {
        !self.pending_delete && !self.pending_replacement
    }
}
