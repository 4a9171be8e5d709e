use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const PREFIX: &str = "urn:converge:";
const DELIMITER: &str = "::";

/// The type token of the implicit root resource.
pub const STACK_TYPE: &str = "converge:converge:Stack";

/// Stable identity of a resource within a snapshot.
///
/// Layout: `urn:converge:{stack}::{project}::{qualified type}::{name}`, where the
/// qualified type is `{parent qualified type}${type}` for children of anything
/// other than the stack root.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    pub fn new(
        stack: &str,
        project: &str,
        parent: Option<&Urn>,
        resource_type: &str,
        name: &str,
    ) -> Self {
        let qualified = match parent {
            Some(p) if p.resource_type() != STACK_TYPE => {
                format!("{}${resource_type}", p.qualified_type())
            }
            _ => resource_type.to_string(),
        };
        Urn(format!(
            "{PREFIX}{stack}{DELIMITER}{project}{DELIMITER}{qualified}{DELIMITER}{name}"
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> (&str, &str, &str, &str) {
        let rest = self.0.strip_prefix(PREFIX).unwrap_or(&self.0);
        let mut split = rest.splitn(4, DELIMITER);
        let stack = split.next().unwrap_or_default();
        let project = split.next().unwrap_or_default();
        let qualified = split.next().unwrap_or_default();
        let name = split.next().unwrap_or_default();
        (stack, project, qualified, name)
    }

    pub fn stack(&self) -> &str {
        self.parts().0
    }

    pub fn project(&self) -> &str {
        self.parts().1
    }

    /// Full `$`-joined type chain, e.g. `pkg:m:Parent$pkg:m:Child`.
    pub fn qualified_type(&self) -> &str {
        self.parts().2
    }

    /// The resource's own type token (last element of the qualified type).
    pub fn resource_type(&self) -> &str {
        let qualified = self.qualified_type();
        qualified.rsplit('$').next().unwrap_or(qualified)
    }

    pub fn name(&self) -> &str {
        self.parts().3
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Urn {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| CoreError::MalformedUrn(s.to_string()))?;
        if rest.splitn(4, DELIMITER).count() != 4 {
            return Err(CoreError::MalformedUrn(s.to_string()));
        }
        Ok(Urn(s.to_string()))
    }
}

/// Package name of a type token (`pkgA:m:typA` → `pkgA`).
pub fn package_of(resource_type: &str) -> &str {
    resource_type.split(':').next().unwrap_or(resource_type)
}
