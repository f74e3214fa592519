//! Message normalization for the platform protocol.
//!
//! Turns raw frames into typed messages, enforces the protocol's two
//! documented violation guards as first-class policy, and tags every
//! message with the trading mode derived from its account identifier.

pub mod classify;
pub mod error;
pub mod normalizer;

pub use classify::{classify_account, ModeClassifier};
pub use error::{ProtocolError, ProtocolResult, ViolationKind};
pub use normalizer::{Normalizer, RequestKind, ViolationStats};
