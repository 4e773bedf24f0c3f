use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::calibration::{CalibrationState, ScaleCalibration};
use crate::config::ServiceConfig;
use crate::hub::BroadcastHub;
use crate::protocol::TelemetryFrame;
use crate::sensors::{Conversion, SensorGateway};
use crate::telemetry::{FeedSettings, LatestFrame};

/// shared service state, cloned into every connection and background task
#[derive(Clone)]
pub struct AppState {
    pub gateway: SensorGateway,
    pub calibration: Arc<ScaleCalibration>,
    pub hub: Arc<BroadcastHub>,
    /// last frame produced by the global telemetry loop
    pub latest: LatestFrame,
    pub feed: FeedSettings,
    /// process-wide shutdown; per-connection tokens are children of it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(gateway: SensorGateway, config: &ServiceConfig, shutdown: CancellationToken) -> Self {
        let feed = FeedSettings::from_config(config);
        Self {
            calibration: Arc::new(ScaleCalibration::new(gateway.clone(), &config.scale)),
            hub: Arc::new(BroadcastHub::new(feed.send_timeout)),
            latest: LatestFrame::default(),
            gateway,
            feed,
            shutdown,
        }
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport {
            calibration: self.calibration.snapshot(),
            conversion: self.gateway.conversion(),
            latest_frame: *self.latest.read().await,
            clients: self.hub.len(),
        }
    }
}

/// body of `GET /api/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub calibration: CalibrationState,
    pub conversion: Conversion,
    pub latest_frame: Option<TelemetryFrame>,
    pub clients: usize,
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::hal::fake::{FakePressure, FakeScale};
    use crate::sensors::testing::{fake_gateway, fast_scale_config};

    pub fn fake_state(raw: i32) -> (AppState, FakeScale, FakePressure) {
        let (gateway, scale, pressure) = fake_gateway(raw);
        let mut config = ServiceConfig { scale: fast_scale_config(), ..ServiceConfig::default() };
        config.telemetry.interval_ms = 10;
        config.telemetry.client_interval_ms = 10;
        config.telemetry.send_timeout_ms = 50;
        config.scale.weight_samples = 2;

        let state = AppState::new(gateway, &config, CancellationToken::new());
        (state, scale, pressure)
    }
}
