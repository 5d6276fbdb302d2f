//! Relay server binary.
//!
//! Configuration comes from the environment (see [`RelayConfig::from_env`]).
//! `RUST_LOG` overrides the log filter; `--debug` raises the default to
//! `debug`.

// ============================================================================
// Imports
// ============================================================================

use std::process::ExitCode;
use std::sync::Arc;

use device_relay::{
    Broker, DrainOutcome, LivenessMonitor, RelayConfig, RelayServer, Result, ShutdownCoordinator,
    wait_for_signal,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Logging
// ============================================================================

fn init_logging(debug: bool) {
    let fallback = if debug {
        "device_relay=debug"
    } else {
        "device_relay=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with_target(false)
        .init();
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let debug = std::env::args().any(|arg| arg == "--debug");
    init_logging(debug);

    match run().await {
        Ok(DrainOutcome::Clean) => ExitCode::SUCCESS,
        Ok(DrainOutcome::TimedOut { remaining }) => {
            warn!(remaining, "Exiting with connections still open");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<DrainOutcome> {
    let config = RelayConfig::from_env()?;
    info!(?config, "Configuration loaded");

    let broker = Arc::new(Broker::new(&config));
    let server = RelayServer::bind(&config, Arc::clone(&broker)).await?;
    info!(
        url = %server.ws_url(),
        policy = %config.attach_policy,
        devices = config.devices.len(),
        "Relay listening"
    );

    let liveness = LivenessMonitor::spawn(Arc::clone(&broker), config.heartbeat_interval);

    wait_for_signal().await?;

    let outcome = ShutdownCoordinator::new(broker, server, Some(liveness), config.shutdown_grace)
        .run()
        .await;
    Ok(outcome)
}
