use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// The analyzer does not implement this operation. Callers treat it as a
    /// no-op rather than a failure.
    #[error("analyzer does not support {operation}")]
    Unsupported { operation: &'static str },

    #[error("policy pack {pack}: {message}")]
    Analyzer { pack: String, message: String },

    #[error("policy pack {pack} failed to remediate {urn}: {message}")]
    RemediationFailed {
        pack: String,
        urn: String,
        message: String,
    },

    #[error("failed to load policy pack {name}: {message}")]
    Load { name: String, message: String },
}

impl PolicyError {
    pub fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}
