//! converge-engine
//!
//! Deployment engine: runs a program's resource registrations against the
//! previous snapshot and converges the world to match.
//!
//! Public API:
//! - `Deployment::update()`: run a program, committing the snapshot after each step
//! - `Deployment::destroy()`: delete everything in a snapshot
//! - `ResourceMonitor`: the program's handle for registering resources
//! - `Provider` / `PluginHost`: resource plugins and their loaders
//! - `SnapshotStore`: where snapshots are persisted between runs

mod coordinator;
mod executor;

pub mod cancel;
pub mod config;
pub mod deployment;
pub mod error;
pub mod journal;
pub mod pending;
pub mod persistence;
pub mod provider;
pub mod registry;
pub mod step;
pub mod step_generator;

pub use crate::cancel::{CancelReason, CancellationToken};
pub use crate::config::{EngineConfig, default_config_path, load_config, save_config};
pub use crate::deployment::{Deployment, DeploymentOptions, RunOutcome, Target};
pub use crate::error::EngineError;
pub use crate::persistence::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use crate::provider::{
    CheckFailure, CheckRequest, CheckResponse, CreateRequest, CreateResponse, DeleteRequest,
    DiffChanges, DiffRequest, DiffResponse, InvokeRequest, PackageRef, Parameterization,
    PluginHost, Provider, ProviderError, ProviderLoader, ReadRequest, ReadResponse,
    RegisterPackageRequest, UpdateRequest,
};
pub use crate::registry::{
    ReadResourceRequest, RegisterResourceRequest, RegisterResourceResponse, ResourceMonitor,
};
pub use crate::step::{DeleteMode, ReplaceStrategy, Step};
