//! Consumer-side mode filtering.
//!
//! The state manager does not filter by mode itself; every consumer of
//! mode-tagged messages decides with this helper whether a message
//! belongs to the mode it is tracking.

use desk_core::TradingMode;

/// True when a message tagged `message_mode` may be applied by a
/// consumer tracking `tracked`.
///
/// An absent tag is accepted by any mode: older platform builds omit
/// the account identifier on some messages.
pub fn accepts(message_mode: Option<TradingMode>, tracked: TradingMode) -> bool {
    match message_mode {
        None => true,
        Some(mode) => mode == tracked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_mode_accepted() {
        assert!(accepts(Some(TradingMode::Sim), TradingMode::Sim));
        assert!(accepts(Some(TradingMode::Live), TradingMode::Live));
    }

    #[test]
    fn test_mismatched_mode_discarded() {
        assert!(!accepts(Some(TradingMode::Live), TradingMode::Sim));
        assert!(!accepts(Some(TradingMode::Sim), TradingMode::Live));
        assert!(!accepts(Some(TradingMode::Debug), TradingMode::Sim));
    }

    #[test]
    fn test_untagged_accepted_by_any_mode() {
        assert!(accepts(None, TradingMode::Sim));
        assert!(accepts(None, TradingMode::Live));
        assert!(accepts(None, TradingMode::Debug));
    }
}
