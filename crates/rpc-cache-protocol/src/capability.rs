//! Client capabilities.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CacheError;

/// Access level granted to a client identity.
///
/// Ordered so that `Write > Read > None`; holding a level implies every
/// lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    None,
    Read,
    Write,
}

impl Capability {
    /// Check that this capability covers `needed`, naming `op` in the error.
    pub fn require(self, needed: Capability, op: &str) -> Result<(), CacheError> {
        if self >= needed {
            Ok(())
        } else {
            Err(CacheError::permission_denied(op))
        }
    }

    pub fn can_read(self) -> bool {
        self >= Capability::Read
    }

    pub fn can_write(self) -> bool {
        self == Capability::Write
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::None => f.write_str("none"),
            Capability::Read => f.write_str("read"),
            Capability::Write => f.write_str("write"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_write_implies_read() {
        assert!(Capability::Write.can_read());
        assert!(Capability::Write.require(Capability::Read, "retrieve").is_ok());
    }

    #[test]
    fn test_read_cannot_write() {
        let err = Capability::Read.require(Capability::Write, "store").unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
        assert!(!Capability::None.can_read());
    }
}
