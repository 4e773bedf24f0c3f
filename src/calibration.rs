//! ==============================================================================
//! calibration.rs - scale calibration state machine
//! ==============================================================================
//!
//! purpose:
//!     owns the mutable scale configuration (zero offset + reference unit) and
//!     the sequences that change it:
//!
//!         Uninitialized ──zero()──► Zeroed ──calibrate()──► Calibrated
//!                                     ▲                          │
//!                                     └─────────zero()───────────┘
//!
//!     zero offset and reference unit are independent fields: re-zeroing a
//!     calibrated scale keeps its reference unit.
//!
//! concurrency:
//!     zero / calibrate / init run under one async mutex, held across the
//!     device part of the sequence, so two clients cannot interleave a zero
//!     with a calibration. the bounded data-ready wait happens before the
//!     lock is taken: an absent HX711 fails each caller on its own timeout
//!     instead of parking every other sequence behind it.
//!     readers go through `snapshot()`, which never waits on a running
//!     sequence.
//!
//! relationships:
//!     - used by: dispatcher.rs, main.rs (startup init), server.rs (status)
//!     - uses: sensors.rs (device primitives + conversion path)
//!
//! ==============================================================================

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;

use crate::config::ScaleConfig;
use crate::error::CalibrationError;
use crate::sensors::SensorGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    Uninitialized,
    Zeroed,
    Calibrated,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationState {
    pub reference_unit: f64,
    pub zero_offset: Option<f64>,
    pub phase: CalibrationPhase,
}

impl CalibrationState {
    pub fn new(reference_unit: f64) -> Self {
        Self { reference_unit, zero_offset: None, phase: CalibrationPhase::Uninitialized }
    }
}

/// Reject weights that would make the reference-unit division meaningless.
pub fn validate_known_weight(known_weight: f64) -> Result<f64, CalibrationError> {
    if !known_weight.is_finite() {
        return Err(CalibrationError::InvalidArgument(format!(
            "known_weight must be a finite number (got {known_weight})"
        )));
    }
    if known_weight == 0.0 {
        return Err(CalibrationError::InvalidArgument("known_weight must not be zero".to_string()));
    }
    Ok(known_weight)
}

pub struct ScaleCalibration {
    gateway: SensorGateway,
    state: Mutex<CalibrationState>,
    published: watch::Sender<CalibrationState>,
    zero_samples: usize,
    calibration_samples: usize,
}

impl ScaleCalibration {
    pub fn new(gateway: SensorGateway, config: &ScaleConfig) -> Self {
        let initial = CalibrationState::new(config.default_reference_unit);
        let (published, _) = watch::channel(initial);
        Self {
            gateway,
            state: Mutex::new(initial),
            published,
            zero_samples: config.zero_samples.max(1),
            calibration_samples: config.calibration_samples.max(1),
        }
    }

    /// Last committed state. Does not wait for a sequence in flight.
    pub fn snapshot(&self) -> CalibrationState {
        *self.published.borrow()
    }

    fn commit(&self, state: &CalibrationState) {
        self.published.send_replace(*state);
    }

    /// Measure the unloaded raw reading and store it as the zero offset.
    pub async fn zero(&self) -> Result<f64, CalibrationError> {
        self.gateway.wait_ready().await?;
        let mut state = self.state.lock().await;
        let timing = self.gateway.timing();

        self.gateway.reset().await?;
        sleep(timing.settle).await;
        let raw_zero = self.gateway.read_raw_average(self.zero_samples).await?;

        state.zero_offset = Some(raw_zero);
        state.phase = CalibrationPhase::Zeroed;
        self.commit(&state);
        tracing::info!(zero_offset = raw_zero, "zero value measured and stored");
        Ok(raw_zero)
    }

    /// Derive the reference unit from a known weight placed on a zeroed scale.
    pub async fn calibrate(&self, known_weight: f64) -> Result<f64, CalibrationError> {
        let known_weight = validate_known_weight(known_weight)?;
        let mut state = self.state.lock().await;
        self.calibrate_locked(&mut state, known_weight).await
    }

    async fn calibrate_locked(
        &self,
        state: &mut CalibrationState,
        known_weight: f64,
    ) -> Result<f64, CalibrationError> {
        let zero_offset = state.zero_offset.ok_or(CalibrationError::Precondition)?;
        let timing = self.gateway.timing();

        tracing::info!(zero_offset, known_weight, "starting calibration");
        self.gateway.reset().await?;
        sleep(timing.settle).await;
        // time to place the known weight
        sleep(timing.placement).await;

        let raw_known = self.gateway.read_raw_average(self.calibration_samples).await?;
        let reference_unit = (raw_known - zero_offset) / known_weight;
        if !reference_unit.is_finite() || reference_unit == 0.0 {
            return Err(CalibrationError::DegenerateReading { raw_known, zero_offset });
        }

        state.reference_unit = reference_unit;
        state.phase = CalibrationPhase::Calibrated;
        self.commit(state);
        tracing::info!(raw_known, reference_unit, "calibration complete");
        Ok(reference_unit)
    }

    /// Bring the amplifier up, optionally recalibrate, then tare and switch
    /// the gateway to the reference unit in one step.
    pub async fn init(&self, known_weight: Option<f64>) -> Result<f64, CalibrationError> {
        let known_weight = known_weight.map(validate_known_weight).transpose()?;
        self.gateway.wait_ready().await?;
        let mut state = self.state.lock().await;
        let timing = self.gateway.timing();

        self.gateway.reset().await?;
        sleep(timing.reset_settle).await;

        let reference_unit = match known_weight {
            Some(weight) => self.calibrate_locked(&mut state, weight).await?,
            None => state.reference_unit,
        };

        let applied = self.gateway.apply(reference_unit).await?;
        tracing::info!(offset = applied.offset, reference_unit, "scale initialized");
        Ok(reference_unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SensorError;
    use crate::hal::fake::{FakePressure, FakeScale};
    use crate::sensors::testing::{fake_gateway, fast_scale_config};
    use crate::sensors::Conversion;
    use std::sync::Arc;
    use std::time::Duration;

    fn calibration(raw: i32) -> (ScaleCalibration, SensorGateway, FakeScale) {
        let (gateway, scale, _) = fake_gateway(raw);
        let calibration = ScaleCalibration::new(gateway.clone(), &fast_scale_config());
        (calibration, gateway, scale)
    }

    #[tokio::test]
    async fn zero_overwrites_instead_of_accumulating() {
        let (cal, _, scale) = calibration(1000);

        for raw in [1000, 1200, 950] {
            scale.set_raw(raw);
            assert_eq!(cal.zero().await.unwrap(), f64::from(raw));
            assert_eq!(cal.snapshot().zero_offset, Some(f64::from(raw)));
        }
        assert_eq!(cal.snapshot().phase, CalibrationPhase::Zeroed);
    }

    #[tokio::test]
    async fn calibrate_before_zero_is_a_precondition_error() {
        let (cal, _, _) = calibration(3652);

        assert_eq!(cal.calibrate(2.0).await, Err(CalibrationError::Precondition));
        let state = cal.snapshot();
        assert_eq!(state.reference_unit, 3.26);
        assert_eq!(state.phase, CalibrationPhase::Uninitialized);
    }

    #[tokio::test]
    async fn calibrate_with_zero_weight_is_rejected_before_any_read() {
        let (cal, _, scale) = calibration(1000);
        cal.zero().await.unwrap();
        let reads = scale.reads();

        let err = cal.calibrate(0.0).await.unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidArgument(_)));
        assert_eq!(scale.reads(), reads);
        assert_eq!(cal.snapshot().reference_unit, 3.26);

        assert!(matches!(cal.calibrate(f64::NAN).await, Err(CalibrationError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn known_weight_scenario_yields_expected_reference_unit() {
        let (cal, _, scale) = calibration(1000);
        cal.zero().await.unwrap();

        scale.set_raw(3652);
        assert_eq!(cal.calibrate(2.0).await.unwrap(), 1326.0);
        let state = cal.snapshot();
        assert_eq!(state.reference_unit, 1326.0);
        assert_eq!(state.phase, CalibrationPhase::Calibrated);
    }

    #[tokio::test]
    async fn unchanged_reading_is_degenerate_and_leaves_state_alone() {
        let (cal, _, _) = calibration(1000);
        cal.zero().await.unwrap();

        let err = cal.calibrate(2.0).await.unwrap_err();
        assert_eq!(err, CalibrationError::DegenerateReading { raw_known: 1000.0, zero_offset: 1000.0 });
        assert_eq!(cal.snapshot().phase, CalibrationPhase::Zeroed);
    }

    #[tokio::test]
    async fn rezeroing_a_calibrated_scale_keeps_the_reference_unit() {
        let (cal, _, scale) = calibration(1000);
        cal.zero().await.unwrap();
        scale.set_raw(3652);
        cal.calibrate(2.0).await.unwrap();

        scale.set_raw(1100);
        cal.zero().await.unwrap();
        let state = cal.snapshot();
        assert_eq!(state.zero_offset, Some(1100.0));
        assert_eq!(state.reference_unit, 1326.0);
        assert_eq!(state.phase, CalibrationPhase::Zeroed);
    }

    #[tokio::test]
    async fn init_without_weight_applies_existing_unit_and_tares() {
        let (cal, gateway, scale) = calibration(1000);
        let resets = scale.resets();

        assert_eq!(cal.init(None).await.unwrap(), 3.26);
        let conversion = gateway.conversion();
        assert_eq!(conversion.reference_unit, 3.26);
        assert_eq!(conversion.offset, 1000.0);
        assert_eq!(scale.resets(), resets + 1);
        assert_eq!(cal.snapshot().phase, CalibrationPhase::Uninitialized);
    }

    #[tokio::test]
    async fn init_with_weight_calibrates_and_applies() {
        let (cal, gateway, scale) = calibration(1000);
        cal.zero().await.unwrap();

        scale.set_raw(3652);
        assert_eq!(cal.init(Some(2.0)).await.unwrap(), 1326.0);
        assert_eq!(gateway.conversion().reference_unit, 1326.0);
        assert_eq!(cal.snapshot().phase, CalibrationPhase::Calibrated);
    }

    #[tokio::test]
    async fn init_reports_readiness_timeout_without_touching_state() {
        let (cal, gateway, scale) = calibration(1000);
        scale.set_ready(false);
        let before = gateway.conversion();

        let err = cal.init(Some(2.0)).await.unwrap_err();
        assert!(err.is_device_not_ready());
        assert!(matches!(err, CalibrationError::Sensor(SensorError::DeviceNotReady { .. })));
        assert_eq!(gateway.conversion(), before);
        assert_eq!(scale.resets(), 0);
    }

    #[tokio::test]
    async fn calibrate_queued_behind_zero_sees_the_new_offset() {
        let (cal, _, scale) = calibration(1000);
        scale.set_read_delay(Duration::from_millis(5));
        let cal = Arc::new(cal);

        let zeroing = tokio::spawn({
            let cal = cal.clone();
            async move { cal.zero().await }
        });
        // zero is now inside its read burst and holds the lock
        tokio::time::sleep(Duration::from_millis(20)).await;

        let calibrated = cal.calibrate(2.0).await;
        assert_eq!(zeroing.await.unwrap().unwrap(), 1000.0);
        assert_eq!(
            calibrated.unwrap_err(),
            CalibrationError::DegenerateReading { raw_known: 1000.0, zero_offset: 1000.0 }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_never_see_a_half_applied_conversion() {
        let (cal, gateway, scale) = calibration(1000);
        let initial = gateway.apply(3.26).await.unwrap();
        cal.zero().await.unwrap();
        scale.set_raw(3652);
        cal.calibrate(2.0).await.unwrap();

        scale.set_raw(1100);
        scale.set_read_delay(Duration::from_millis(2));
        let cal = Arc::new(cal);
        let init = tokio::spawn({
            let cal = cal.clone();
            async move { cal.init(None).await }
        });

        let expected = Conversion { offset: 1100.0, reference_unit: 1326.0 };
        while !init.is_finished() {
            let seen = gateway.conversion();
            assert!(seen == initial || seen == expected, "reader observed mixed pair {seen:?}");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(init.await.unwrap().unwrap(), 1326.0);
        assert_eq!(gateway.conversion(), expected);
    }

    #[tokio::test]
    async fn absent_device_does_not_hold_the_lock_while_waiting() {
        let scale = FakeScale::new(1000);
        scale.set_ready(false);
        let config = ScaleConfig { ready_timeout_ms: 500, ..fast_scale_config() };
        let gateway = SensorGateway::new(
            Box::new(scale.clone()),
            Box::new(FakePressure::new([0.0; 3])),
            &config,
        );
        let cal = Arc::new(ScaleCalibration::new(gateway, &config));

        let init = tokio::spawn({
            let cal = cal.clone();
            async move { cal.init(None).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // the startup init is still polling data-ready; other sequences answer at once
        let answered = tokio::time::timeout(Duration::from_millis(100), cal.calibrate(2.0)).await;
        assert_eq!(answered, Ok(Err(CalibrationError::Precondition)));

        assert!(init.await.unwrap().unwrap_err().is_device_not_ready());
    }
}
