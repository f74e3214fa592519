//! Trading mode and account identification.
//!
//! The remote platform never transmits a mode; it is derived from the
//! account identifier and used to keep SIM and LIVE data strictly apart.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Trading mode derived from an account identifier.
///
/// Determines data isolation: balances, positions and order flow are
/// only ever applied to state tracking the same mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Simulated trading account.
    Sim,
    /// Real money account.
    Live,
    /// Unclassified or test account.
    Debug,
}

impl TradingMode {
    /// Returns true for the modes that carry an account balance.
    pub fn has_balance(&self) -> bool {
        matches!(self, Self::Sim | Self::Live)
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sim => write!(f, "SIM"),
            Self::Live => write!(f, "LIVE"),
            Self::Debug => write!(f, "DEBUG"),
        }
    }
}

/// Trade account identifier as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for AccountId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_display() {
        assert_eq!(TradingMode::Sim.to_string(), "SIM");
        assert_eq!(TradingMode::Live.to_string(), "LIVE");
        assert_eq!(TradingMode::Debug.to_string(), "DEBUG");
    }

    #[test]
    fn test_mode_has_balance() {
        assert!(TradingMode::Sim.has_balance());
        assert!(TradingMode::Live.has_balance());
        assert!(!TradingMode::Debug.has_balance());
    }
}
