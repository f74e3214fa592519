//! Desk gateway entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Desk gateway: platform connectivity, state and ledger core.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via DESK_CONFIG).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    desk_telemetry::init_logging()?;

    info!("Starting desk-gateway v{}", env!("CARGO_PKG_VERSION"));

    // Config path: CLI arg > DESK_CONFIG env var > default.
    let config_path = args
        .config
        .or_else(|| std::env::var("DESK_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    let config = if std::path::Path::new(&config_path).exists() {
        info!(config_path = %config_path, "Loading configuration");
        desk_gateway::GatewayConfig::from_file(&config_path)?
    } else {
        info!(config_path = %config_path, "No config file found, using defaults");
        desk_gateway::GatewayConfig::default()
    };

    let app = desk_gateway::Application::new(config);

    // Ctrl-c cancels the supervisor; the transport is stopped and the
    // ledger exported on the way out.
    let token = app.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-c received, shutting down");
            token.cancel();
        }
    });

    app.run().await?;

    info!("desk-gateway stopped");
    Ok(())
}
