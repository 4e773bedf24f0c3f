//! ==============================================================================
//! telemetry.rs - periodic sampling and push loops
//! ==============================================================================
//!
//! purpose:
//!     - TelemetryLoop: the single global task. every tick it samples weight
//!       and pressures, records the frame as "latest" and fans it out through
//!       the hub. tick k is fully sampled and sent before tick k+1 starts.
//!     - run_client_loop: a dedicated push loop for one connection, started
//!       by `start_measuring` and stopped through its cancellation token.
//!
//!     sample failures become null fields; they never end a loop.
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::error::TransportError;
use crate::hub::{BroadcastHub, BroadcastReport, ClientHandle};
use crate::protocol::{unix_timestamp, Outbound, TelemetryFrame};
use crate::sensors::SensorGateway;

/// Most recent frame produced by the global loop.
pub type LatestFrame = Arc<RwLock<Option<TelemetryFrame>>>;

#[derive(Debug, Clone, Copy)]
pub struct FeedSettings {
    pub interval: Duration,
    pub client_interval: Duration,
    pub weight_samples: usize,
    pub send_timeout: Duration,
    /// per-client outbound queue depth
    pub client_buffer: usize,
    pub show_data: bool,
}

impl FeedSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            interval: config.telemetry.interval(),
            client_interval: config.telemetry.client_interval(),
            weight_samples: config.scale.weight_samples.max(1),
            send_timeout: config.telemetry.send_timeout(),
            client_buffer: config.server.client_buffer.max(1),
            show_data: config.logging.show_sensor_data,
        }
    }
}

pub async fn build_frame(gateway: &SensorGateway, weight_samples: usize) -> TelemetryFrame {
    let waage2 = gateway.sample_weight(weight_samples).await;
    let drucksensoren = gateway.sample_pressures().await;
    TelemetryFrame { waage2, drucksensoren, timestamp: unix_timestamp() }
}

pub struct TelemetryLoop {
    gateway: SensorGateway,
    hub: Arc<BroadcastHub>,
    latest: LatestFrame,
    settings: FeedSettings,
}

impl TelemetryLoop {
    pub fn new(gateway: SensorGateway, hub: Arc<BroadcastHub>, latest: LatestFrame, settings: FeedSettings) -> Self {
        Self { gateway, hub, latest, settings }
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(interval = ?self.settings.interval, "telemetry loop started");
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.tick() => {}
            }
        }
        tracing::info!("telemetry loop stopped");
    }

    /// Sample once and broadcast the frame.
    pub async fn tick(&self) -> BroadcastReport {
        let frame = build_frame(&self.gateway, self.settings.weight_samples).await;
        *self.latest.write().await = Some(frame);

        if self.hub.is_empty() && !self.settings.show_data {
            return BroadcastReport::default();
        }

        let text = Outbound::from(frame).to_text();
        if self.settings.show_data {
            tracing::info!(frame = %text, "telemetry");
        } else {
            tracing::debug!(frame = %text, "telemetry");
        }

        let report = self.hub.broadcast(&text).await;
        if !report.dropped.is_empty() {
            tracing::debug!(delivered = report.delivered, dropped = report.dropped.len(), "broadcast pass finished");
        }
        report
    }
}

/// Push frames to a single client until cancelled or the client goes away.
pub async fn run_client_loop(
    gateway: SensorGateway,
    client: ClientHandle,
    settings: FeedSettings,
    token: CancellationToken,
) -> Result<(), TransportError> {
    let mut ticker = interval(settings.client_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            frame = build_frame(&gateway, settings.weight_samples) => frame,
        };

        client
            .send(Outbound::from(frame).to_text(), settings.send_timeout)
            .await?;
    }
}
