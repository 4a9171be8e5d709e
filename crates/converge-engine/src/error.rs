use std::sync::Arc;

use converge_core::{IntegrityError, StepOp, Urn};
use converge_policy::PolicyError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("resource {urn}: import_id and create_if_not_exists cannot be specified together")]
    ImportConflict { urn: Urn },

    #[error("duplicate resource URN {urn}: it was already registered in this run")]
    DuplicateUrn { urn: Urn },

    #[error("resource {urn} refers to {field} {target}, which has not been registered")]
    UnknownReference {
        urn: Urn,
        field: &'static str,
        target: Urn,
    },

    #[error("resource {urn} violates mandatory policy: {message}")]
    PolicyViolation { urn: Urn, message: String },

    #[error("stack violates mandatory policy: {message}")]
    StackPolicyViolation { message: String },

    #[error("remediation of {urn} failed: {message}")]
    RemediationFailure { urn: Urn, message: String },

    #[error("{op} of {urn} failed: {message}")]
    ProviderOperation {
        urn: Urn,
        op: &'static str,
        message: String,
    },

    #[error("unable to {op} resource {urn} as it is currently marked for protection")]
    Protected { urn: Urn, op: StepOp },

    #[error("resource {urn} was not applied because dependency {dependency} failed")]
    DependencyFailed { urn: Urn, dependency: String },

    #[error("run canceled")]
    Canceled,

    #[error("resource monitor is shut down")]
    MonitorShutDown,

    #[error("snapshot integrity violation: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("inputs of {urn} failed provider checks: {message}")]
    CheckFailed { urn: Urn, message: String },

    #[error("resource {urn}: object {id} does not exist")]
    ImportNotFound { urn: Urn, id: String },

    #[error("resource {urn}: imported object differs from the declared inputs ({keys})")]
    ImportMismatch { urn: Urn, keys: String },

    #[error("invoke of {token} failed: {message}")]
    Invoke { token: String, message: String },

    #[error("no provider available for {reference}")]
    MissingProvider { reference: String },

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("program failed: {0}")]
    Program(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    #[error("config error: {0}")]
    Config(String),
}

impl EngineError {
    /// Errors that only exist because something else failed first.
    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::Canceled | Self::DependencyFailed { .. })
    }

    pub fn provider(urn: &Urn, op: &'static str, err: &dyn std::error::Error) -> Self {
        Self::ProviderOperation {
            urn: urn.clone(),
            op,
            message: format_err_chain(err),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(e))
    }
}

/// Walk the full error chain and join all causes into one string.
///
/// Provider errors often wrap a terse transport error around the useful
/// detail.
pub fn format_err_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}
