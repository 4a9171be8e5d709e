use thiserror::Error;

use crate::urn::Urn;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed URN: {0}")]
    MalformedUrn(String),

    #[error("snapshot integrity violation: {0}")]
    Integrity(#[from] IntegrityError),
}

/// A snapshot that breaks one of its structural invariants.
///
/// These are never user errors: a snapshot produced by the engine should
/// always verify, so any of these indicates an engine defect or a hand-edited
/// state file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("duplicate resource URN {urn} (entries {first} and {second})")]
    DuplicateUrn { urn: Urn, first: usize, second: usize },

    #[error("resource {urn} refers to unknown parent {parent}")]
    UnknownParent { urn: Urn, parent: Urn },

    #[error("resource {urn} has parent {parent} that appears after it in the snapshot")]
    ParentOutOfOrder { urn: Urn, parent: Urn },

    #[error("resource {urn} refers to unknown {field} {target}")]
    UnknownReference {
        urn: Urn,
        field: &'static str,
        target: Urn,
    },

    #[error("resource {urn} refers to {field} {target} that appears after it in the snapshot")]
    ReferenceOutOfOrder {
        urn: Urn,
        field: &'static str,
        target: Urn,
    },

    #[error("stack resource {urn} must be the first entry (found at {index})")]
    StackNotFirst { urn: Urn, index: usize },

    #[error("resource {urn} is marked both pending replacement and pending deletion")]
    ConflictingPendingFlags { urn: Urn },
}
