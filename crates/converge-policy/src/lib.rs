//! converge-policy
//!
//! Policy enforcement for deployments. Required policy packs are loaded
//! through [`AnalyzerLoader`]s and applied in order:
//!
//! - `remediate()`: rewrite a resource's inputs before it is planned
//! - `analyze()`: report violations against the remediated inputs
//! - `analyze_stack()`: report violations over the finished stack
//!
//! Violations, remediations and per-pack summaries are emitted as
//! [`converge_core::events::EngineEvent`]s.

pub mod analyzer;
pub mod error;
pub mod pipeline;
pub mod summary;

pub use crate::analyzer::{
    AnalyzeResponse, Analyzer, AnalyzerInfo, AnalyzerLoader, AnalyzerOptions, AnalyzerResource,
    BoxFuture, Diagnostic, PolicyInfo, PolicyKind, RemediateResponse, Remediation, RequiredPolicy,
};
pub use crate::error::PolicyError;
pub use crate::pipeline::{PolicyPipeline, PolicyReport};
