use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementLevel {
    /// Report only; never blocks.
    Advisory,
    /// Blocks the resource's operation and fails the run.
    Mandatory,
    /// Fixed automatically by a remediation when one is available.
    Remediate,
    /// Declared by the pack but switched off; never run or reported.
    Disabled,
}

impl EnforcementLevel {
    /// The level observers see for a diagnostic coming out of `analyze`.
    ///
    /// An analyze diagnostic has no fix attached, so `Remediate` is surfaced
    /// as `Mandatory`.
    pub fn for_analysis(self) -> Self {
        match self {
            EnforcementLevel::Remediate => EnforcementLevel::Mandatory,
            other => other,
        }
    }

    pub fn is_blocking(self) -> bool {
        matches!(self, EnforcementLevel::Mandatory)
    }

    pub fn is_enabled(self) -> bool {
        !matches!(self, EnforcementLevel::Disabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySeverity {
    Low,
    Medium,
    High,
    Critical,
}
