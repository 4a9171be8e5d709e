use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of transition a step performs on one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOp {
    Same,
    Create,
    Update,
    Replace,
    Delete,
    /// Adopt an existing external object (`import_id` / `create_if_not_exists`).
    Import,
    /// Read an unmanaged resource into the snapshot.
    Read,
}

impl StepOp {
    /// Whether the step changes anything in the world.
    pub fn is_mutation(self) -> bool {
        !matches!(self, StepOp::Same | StepOp::Read)
    }
}

impl fmt::Display for StepOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            StepOp::Same => "same",
            StepOp::Create => "create",
            StepOp::Update => "update",
            StepOp::Replace => "replace",
            StepOp::Delete => "delete",
            StepOp::Import => "import",
            StepOp::Read => "read",
        };
        f.write_str(s)
    }
}
