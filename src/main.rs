//! ==============================================================================
//! main.rs - scale telemetry service entry point
//! ==============================================================================
//!
//! purpose:
//!     runs the rig's telemetry and control service: one HX711 load-cell scale
//!     and three pressure sensors on an ADS1115, exposed over a websocket.
//!
//! responsibilities:
//!     - load configuration and set up logging
//!     - open the hardware (or the mock HAL off-Pi)
//!     - bring the scale up with the default reference unit
//!     - run the global 1s telemetry broadcast
//!     - accept websocket clients and dispatch their commands
//!     - shut everything down on SIGINT/SIGTERM/SIGQUIT
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                     scale-telemetry                          │
//!     │  ┌─────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//!     │  │ telemetry   │  │ ws server    │  │ per-connection     │  │
//!     │  │ loop (1s)   │  │ (port 8765)  │  │ dispatchers        │  │
//!     │  └──────┬──────┘  └──────┬───────┘  └─────────┬──────────┘  │
//!     │         │ broadcast      │ register           │ commands    │
//!     │         ▼                ▼                    ▼             │
//!     │     ┌──────────────────────┐      ┌─────────────────────┐   │
//!     │     │   broadcast hub      │      │ scale calibration   │   │
//!     │     └──────────────────────┘      └──────────┬──────────┘   │
//!     │                                              │              │
//!     │              ┌───────────────────────────────┘              │
//!     │              ▼                                              │
//!     │     ┌──────────────────┐                                    │
//!     │     │ sensor gateway   │ <- sensors.rs                      │
//!     │     └────────┬─────────┘                                    │
//!     └──────────────┼──────────────────────────────────────────────┘
//!                    │ hal.rs
//!          ┌─────────┴─────────┐
//!          ▼                   ▼
//!     ┌─────────┐         ┌─────────┐
//!     │  HX711  │         │ ADS1115 │
//!     └─────────┘         └─────────┘
//!
//! ==============================================================================

mod calibration;
mod config;
mod dispatcher;
mod domain;
mod error;
mod hal;
mod hub;
mod protocol;
mod sensors;
mod server;
mod telemetry;

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::domain::AppState;
use crate::sensors::SensorGateway;
use crate::telemetry::TelemetryLoop;

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Scale Telemetry Service");
    println!("  HX711 load cell + ADS1115 pressure sensors over WebSocket");
    println!("===========================================================");

    // step 1: load configuration (optional path as first argument)
    let config = config::ServiceConfig::load_or_default(std::env::args_os().nth(1).map(PathBuf::from));
    init_tracing(&config.logging.level);
    config.print_summary();

    // step 2: open hardware and build shared state
    let (scale, pressure) = hal::open(&config).context("failed to open sensor hardware")?;
    let gateway = SensorGateway::new(scale, pressure, &config.scale);
    let shutdown = CancellationToken::new();
    let state = AppState::new(gateway.clone(), &config, shutdown.clone());

    // step 3: bring the scale up in the background; the readiness wait can be long
    let calibration = state.calibration.clone();
    tokio::spawn(async move {
        match calibration.init(None).await {
            Ok(reference_unit) => tracing::info!(reference_unit, "scale and pressure sensors ready"),
            Err(e) => tracing::warn!(
                kind = e.as_label(),
                error = %e,
                "initial scale init failed; weights stay untared until init or tare_scale succeeds"
            ),
        }
    });

    // step 4: global telemetry broadcast
    let feed = TelemetryLoop::new(gateway, state.hub.clone(), state.latest.clone(), state.feed);
    let telemetry = tokio::spawn(feed.run(shutdown.clone()));

    // step 5: shutdown on signal
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            tracing::error!(error = %e, "signal handler failed; shutting down");
        } else {
            tracing::info!("shutdown signal received");
        }
        signal_token.cancel();
    });

    // step 6: websocket server (runs until shutdown)
    let address = config.server.address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    tracing::info!(%address, "WebSocket server started");

    let served = server::serve(listener, state).await;
    shutdown.cancel();
    if let Err(e) = telemetry.await {
        tracing::error!(error = %e, "telemetry loop ended abnormally");
    }
    served
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
