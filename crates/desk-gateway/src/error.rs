//! Gateway error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] desk_transport::TransportError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] desk_ledger::LedgerError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] desk_telemetry::TelemetryError),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
