//! converge-core
//!
//! Pure domain types shared by the policy pipeline and the deployment engine.
//! No provider or analyzer plumbing lives here. This is the vocabulary of the
//! converge system: URNs, property maps, goals, snapshot entries and events.

pub mod error;
pub mod events;
pub mod goal;
pub mod op;
pub mod policy;
pub mod property;
pub mod snapshot;
pub mod state;
pub mod urn;

pub use crate::error::{CoreError, IntegrityError};
pub use crate::goal::{CustomTimeouts, ResourceGoal};
pub use crate::op::StepOp;
pub use crate::policy::{EnforcementLevel, PolicySeverity};
pub use crate::property::PropertyMap;
pub use crate::snapshot::{Snapshot, SnapshotManifest};
pub use crate::state::ResourceState;
pub use crate::urn::Urn;
