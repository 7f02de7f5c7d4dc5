//! Operation names and their capability requirements.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::capability::Capability;

/// Known operation names.
pub mod names {
    pub const STORE: &str = "store";
    pub const RETRIEVE: &str = "retrieve";
    pub const DELETE: &str = "delete";
}

/// Cache operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Store,
    Retrieve,
    Delete,
}

impl Operation {
    /// Parse an operation name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            names::STORE => Some(Self::Store),
            names::RETRIEVE => Some(Self::Retrieve),
            names::DELETE => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => names::STORE,
            Self::Retrieve => names::RETRIEVE,
            Self::Delete => names::DELETE,
        }
    }

    /// Capability a client must hold to perform this operation.
    pub fn required_capability(&self) -> Capability {
        match self {
            Self::Retrieve => Capability::Read,
            Self::Store | Self::Delete => Capability::Write,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for op in [Operation::Store, Operation::Retrieve, Operation::Delete] {
            assert_eq!(Operation::from_name(op.as_str()), Some(op));
        }
        assert_eq!(Operation::from_name("inspect"), None);
    }

    #[test]
    fn test_required_capability() {
        assert_eq!(Operation::Retrieve.required_capability(), Capability::Read);
        assert_eq!(Operation::Store.required_capability(), Capability::Write);
        assert_eq!(Operation::Delete.required_capability(), Capability::Write);
    }
}
