//! Trust levels gating which remote methods a connection may invoke.
//!
//! Levels are small integers with fixed meaning:
//!
//! | level | meaning |
//! |-------|---------|
//! | 0 | unauthenticated |
//! | 1 | connection accepted |
//! | 2 | cluster membership verified |
//! | 3 | user verified |
//! | 4 | reserved maximum, not reached by any built-in step |

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// A trust level in the range `0..=4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct TrustLevel(u8);

impl TrustLevel {
    /// Fresh or reset connection.
    pub const UNAUTHENTICATED: TrustLevel = TrustLevel(0);
    /// The acceptor agreed to open a session.
    pub const CONNECTION_ACCEPTED: TrustLevel = TrustLevel(1);
    /// The peer proved knowledge of the cluster secret.
    pub const CLUSTER_VERIFIED: TrustLevel = TrustLevel(2);
    /// The peer proved knowledge of the user password.
    pub const USER_VERIFIED: TrustLevel = TrustLevel(3);
    /// Highest attainable level.
    pub const MAXIMUM: TrustLevel = TrustLevel(4);

    /// Creates a trust level, rejecting values above [`TrustLevel::MAXIMUM`].
    pub fn new(level: u8) -> Result<Self> {
        if level > Self::MAXIMUM.0 {
            return Err(ProtocolError::InvalidTrustLevel(level));
        }
        Ok(Self(level))
    }

    /// Returns the raw level.
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Whether this level satisfies `required`.
    pub fn permits(self, required: TrustLevel) -> bool {
        self >= required
    }
}

impl TryFrom<u8> for TrustLevel {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TrustLevel> for u8 {
    fn from(level: TrustLevel) -> Self {
        level.0
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_enforced() {
        for level in 0..=4 {
            assert_eq!(TrustLevel::new(level).unwrap().as_u8(), level);
        }
        assert!(matches!(
            TrustLevel::new(5),
            Err(ProtocolError::InvalidTrustLevel(5))
        ));
    }

    #[test]
    fn test_permits() {
        assert!(TrustLevel::USER_VERIFIED.permits(TrustLevel::CLUSTER_VERIFIED));
        assert!(TrustLevel::CLUSTER_VERIFIED.permits(TrustLevel::CLUSTER_VERIFIED));
        assert!(!TrustLevel::CLUSTER_VERIFIED.permits(TrustLevel::USER_VERIFIED));
        assert!(TrustLevel::UNAUTHENTICATED.permits(TrustLevel::UNAUTHENTICATED));
    }

    #[test]
    fn test_default_is_unauthenticated() {
        assert_eq!(TrustLevel::default(), TrustLevel::UNAUTHENTICATED);
    }

    #[test]
    fn test_deserialize_rejects_out_of_range() {
        assert!(serde_json::from_str::<TrustLevel>("7").is_err());
        assert_eq!(
            serde_json::from_str::<TrustLevel>("3").unwrap(),
            TrustLevel::USER_VERIFIED
        );
    }
}
