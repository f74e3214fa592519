//! Prometheus metrics for the desk gateway.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally: a registration
//! failure means duplicate metric names, a fatal configuration error
//! that should crash at startup rather than fail silently. These
//! panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

/// Platform connection state (1 = connected, 0 = disconnected).
pub static GATEWAY_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "desk_gateway_connected",
        "Platform connection state (1=connected)"
    )
    .unwrap()
});

/// Total reconnection attempts by disconnect reason.
pub static GATEWAY_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "desk_gateway_reconnect_total",
        "Total reconnection attempts",
        &["reason"]
    )
    .unwrap()
});

/// Messages processed by kind.
pub static GATEWAY_MESSAGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "desk_gateway_messages_total",
        "Messages processed by kind",
        &["kind"]
    )
    .unwrap()
});

/// Messages dropped by cause (malformed, violation kind).
pub static GATEWAY_DROPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "desk_gateway_dropped_total",
        "Messages dropped by cause",
        &["cause"]
    )
    .unwrap()
});

/// Circuit breaker state (1 for the active state's label, 0 otherwise).
pub static GATEWAY_BREAKER_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "desk_gateway_breaker_state",
        "Circuit breaker state (1=active)",
        &["state"]
    )
    .unwrap()
});

/// State manager events published, by event kind.
pub static GATEWAY_STATE_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "desk_gateway_state_events_total",
        "State events published",
        &["event"]
    )
    .unwrap()
});

/// Set the breaker state gauge so exactly one label is active.
pub fn set_breaker_state(state: &str) {
    for label in ["closed", "open", "half_open"] {
        GATEWAY_BREAKER_STATE
            .with_label_values(&[label])
            .set(if label == state { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_state_is_exclusive() {
        set_breaker_state("open");
        assert_eq!(
            GATEWAY_BREAKER_STATE.with_label_values(&["open"]).get(),
            1.0
        );
        assert_eq!(
            GATEWAY_BREAKER_STATE.with_label_values(&["closed"]).get(),
            0.0
        );

        set_breaker_state("closed");
        assert_eq!(
            GATEWAY_BREAKER_STATE.with_label_values(&["open"]).get(),
            0.0
        );
    }
}
