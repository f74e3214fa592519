//! Account-to-mode classification.
//!
//! A pure, replaceable function: the platform never transmits a mode,
//! so it is derived entirely from the account identifier's shape.

use desk_core::TradingMode;

/// Classifier signature. Swap in a custom function via
/// [`crate::Normalizer::with_classifier`].
pub type ModeClassifier = fn(&str) -> TradingMode;

/// Default classification:
/// - contains `"sim"` case-insensitively -> `Sim`
/// - consists solely of digits -> `Live`
/// - anything else -> `Debug`
pub fn classify_account(account: &str) -> TradingMode {
    if account.to_ascii_lowercase().contains("sim") {
        TradingMode::Sim
    } else if !account.is_empty() && account.bytes().all(|b| b.is_ascii_digit()) {
        TradingMode::Live
    } else {
        TradingMode::Debug
    }
}
