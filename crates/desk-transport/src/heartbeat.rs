//! Heartbeat monitoring for the transport connection.
//!
//! The platform sends unsolicited heartbeats on an interval and expects
//! the client to do the same. Silence beyond the timeout means the
//! connection is dead even if the socket still looks open.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::time::Duration;

/// Tracks heartbeat activity in both directions.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    /// How often to emit our own heartbeat.
    interval_ms: u64,
    /// Inbound silence beyond this is a connection failure.
    timeout_ms: u64,
    /// When we last sent a heartbeat.
    last_sent: RwLock<Option<DateTime<Utc>>>,
    /// When any frame was last received.
    last_received: RwLock<DateTime<Utc>>,
}

impl HeartbeatMonitor {
    pub fn new(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval_ms,
            timeout_ms,
            last_sent: RwLock::new(None),
            last_received: RwLock::new(Utc::now()),
        }
    }

    /// Reset state; call once the connection is established.
    pub fn reset(&self) {
        *self.last_sent.write() = None;
        *self.last_received.write() = Utc::now();
    }

    /// Record that we emitted a heartbeat.
    pub fn record_sent(&self) {
        *self.last_sent.write() = Some(Utc::now());
    }

    /// Record that any frame arrived. Every frame counts as liveness,
    /// not just heartbeats.
    pub fn record_received(&self) {
        *self.last_received.write() = Utc::now();
    }

    /// Milliseconds since the last received frame.
    pub fn silence_ms(&self) -> i64 {
        (Utc::now() - *self.last_received.read()).num_milliseconds()
    }

    /// True when inbound silence exceeds the timeout.
    pub fn is_silent(&self) -> bool {
        self.silence_ms() > self.timeout_ms as i64
    }

    /// True when our own heartbeat is due.
    pub fn should_send(&self) -> bool {
        match *self.last_sent.read() {
            None => true,
            Some(sent) => (Utc::now() - sent).num_milliseconds() >= self.interval_ms as i64,
        }
    }

    /// Sleep until the next liveness check is due.
    pub async fn wait_for_check(&self) {
        tokio::time::sleep(Duration::from_millis((self.interval_ms / 2).max(10))).await;
    }

    /// Snapshot for health reporting.
    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            last_sent: *self.last_sent.read(),
            last_received: *self.last_received.read(),
            silence_ms: self.silence_ms(),
        }
    }
}

/// Heartbeat statistics.
#[derive(Debug, Clone)]
pub struct HeartbeatStats {
    pub last_sent: Option<DateTime<Utc>>,
    pub last_received: DateTime<Utc>,
    pub silence_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_not_silent() {
        let hb = HeartbeatMonitor::new(5000, 20000);
        assert!(!hb.is_silent());
        assert!(hb.should_send());
    }

    #[test]
    fn test_send_recorded() {
        let hb = HeartbeatMonitor::new(5000, 20000);
        hb.record_sent();
        assert!(!hb.should_send());
    }

    #[test]
    fn test_zero_timeout_goes_silent() {
        let hb = HeartbeatMonitor::new(5000, 0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(hb.is_silent());
        hb.record_received();
        assert!(hb.silence_ms() <= 1);
    }
}
