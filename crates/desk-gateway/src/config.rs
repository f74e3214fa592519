//! Application configuration.
//!
//! The gateway consumes but does not own this surface: host, port,
//! credentials, heartbeat bounds, breaker thresholds, the periodic SIM
//! reset schedule and the ledger export location all arrive from a
//! TOML file.

use crate::error::GatewayResult;
use desk_breaker::{BackoffPolicy, BreakerConfig};
use desk_transport::{Credentials, TransportConfig};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Trade account to scope the session to, when the platform
    /// requires one.
    #[serde(default)]
    pub trade_account: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_logon_timeout_ms")]
    pub logon_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    11099
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    20_000
}

fn default_logon_timeout_ms() -> u64 {
    10_000
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            trade_account: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            logon_timeout_ms: default_logon_timeout_ms(),
        }
    }
}

impl ConnectionSettings {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout_ms: self.connect_timeout_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            logon_timeout_ms: self.logon_timeout_ms,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
            trade_account: self.trade_account.clone(),
        }
    }
}

/// Circuit breaker and reconnect settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl BreakerSettings {
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
        )
    }
}

/// Periodic SIM balance reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimResetSettings {
    #[serde(default = "default_sim_reset_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sim_reset_interval_hours")]
    pub interval_hours: u64,
    #[serde(default = "default_sim_start_balance")]
    pub start_balance: Decimal,
}

fn default_sim_reset_enabled() -> bool {
    true
}

fn default_sim_reset_interval_hours() -> u64 {
    24
}

fn default_sim_start_balance() -> Decimal {
    Decimal::from(100_000)
}

impl Default for SimResetSettings {
    fn default() -> Self {
        Self {
            enabled: default_sim_reset_enabled(),
            interval_hours: default_sim_reset_interval_hours(),
            start_balance: default_sim_start_balance(),
        }
    }
}

/// Ledger export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    #[serde(default = "default_export_dir")]
    pub export_dir: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

fn default_export_dir() -> String {
    "data".to_string()
}

fn default_delimiter() -> char {
    '\t'
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            export_dir: default_export_dir(),
            delimiter: default_delimiter(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub sim_reset: SimResetSettings,
    #[serde(default)]
    pub ledger: LedgerSettings,
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config.connection.port, 11099);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!(config.sim_reset.enabled);
        assert_eq!(config.sim_reset.start_balance, dec!(100000));
        assert_eq!(config.ledger.delimiter, '\t');
    }

    #[test]
    fn test_partial_config_overrides() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [connection]
            host = "10.0.0.5"
            port = 12000
            username = "trader"
            trade_account = "Sim1"

            [breaker]
            failure_threshold = 3

            [sim_reset]
            enabled = false
            start_balance = "250000"
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.host, "10.0.0.5");
        assert_eq!(config.connection.trade_account.as_deref(), Some("Sim1"));
        assert_eq!(config.breaker.failure_threshold, 3);
        assert!(!config.sim_reset.enabled);
        assert_eq!(config.sim_reset.start_balance, dec!(250000));
        // Untouched sections keep defaults.
        assert_eq!(config.connection.heartbeat_timeout_ms, 20_000);
    }

    #[test]
    fn test_transport_config_mapping() {
        let settings = ConnectionSettings {
            host: "example".to_string(),
            port: 7000,
            ..Default::default()
        };
        let transport = settings.transport_config();
        assert_eq!(transport.host, "example");
        assert_eq!(transport.port, 7000);
        assert_eq!(transport.logon_timeout_ms, 10_000);
    }
}
