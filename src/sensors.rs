//! ==============================================================================
//! sensors.rs - sensor gateway
//! ==============================================================================
//!
//! purpose:
//!     wraps the two hardware capabilities from hal.rs and turns raw driver
//!     calls into the readings the rest of the service wants:
//!     - averaged, calibrated weight (rounded to 2 decimals)
//!     - three pressure voltages, reported all-or-nothing
//!
//!     it also exposes the low-level scale primitives (ready wait, reset,
//!     raw averages, tare-and-apply) that calibration.rs sequences.
//!
//! concurrency:
//!     each device sits behind its own std mutex and is only touched from the
//!     blocking pool. a multi-sample burst holds the lock for the whole burst,
//!     so two tasks never interleave clock pulses on the HX711.
//!
//!     the conversion path (tare offset + reference unit) is a Copy snapshot
//!     behind an RwLock, so a reader always sees a matching pair.
//!
//! ==============================================================================

use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use tokio::time::{sleep, Instant};

use crate::config::{ScaleConfig, ScaleTiming};
use crate::error::SensorError;
use crate::hal::{LoadCellAmplifier, PressureAdc};

/// ADS1115 inputs P0..P2, in wire order.
const PRESSURE_CHANNELS: [u8; 3] = [0, 1, 2];

/// Raw count -> weight mapping currently applied to samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Conversion {
    pub offset: f64,
    pub reference_unit: f64,
}

impl Conversion {
    pub fn to_weight(&self, raw: f64) -> f64 {
        (raw - self.offset) / self.reference_unit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PressureReadings {
    pub sensor1: Option<f64>,
    pub sensor2: Option<f64>,
    pub sensor3: Option<f64>,
}

impl PressureReadings {
    /// All three channels null.
    pub fn unavailable() -> Self {
        Self::default()
    }

    fn from_volts(volts: [f64; 3]) -> Self {
        Self {
            sensor1: Some(round_to(volts[0], 3)),
            sensor2: Some(round_to(volts[1], 3)),
            sensor3: Some(round_to(volts[2], 3)),
        }
    }
}

pub fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

#[derive(Clone)]
pub struct SensorGateway {
    scale: Arc<Mutex<Box<dyn LoadCellAmplifier>>>,
    pressure: Arc<Mutex<Box<dyn PressureAdc>>>,
    conversion: Arc<RwLock<Conversion>>,
    gain: u8,
    tare_samples: usize,
    timing: ScaleTiming,
}

impl SensorGateway {
    pub fn new(
        scale: Box<dyn LoadCellAmplifier>,
        pressure: Box<dyn PressureAdc>,
        config: &ScaleConfig,
    ) -> Self {
        Self {
            scale: Arc::new(Mutex::new(scale)),
            pressure: Arc::new(Mutex::new(pressure)),
            conversion: Arc::new(RwLock::new(Conversion {
                offset: 0.0,
                reference_unit: config.default_reference_unit,
            })),
            gain: config.gain,
            tare_samples: config.tare_samples.max(1),
            timing: config.timing(),
        }
    }

    pub fn timing(&self) -> ScaleTiming {
        self.timing
    }

    /// Run `f` against the amplifier on the blocking pool, holding the device lock.
    async fn with_scale<T, F>(&self, f: F) -> Result<T, SensorError>
    where
        F: FnOnce(&mut dyn LoadCellAmplifier) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let scale = self.scale.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = scale
                .lock()
                .map_err(|_| SensorError::Read("scale lock poisoned".to_string()))?;
            f(&mut **guard).map_err(|e| SensorError::Read(e.to_string()))
        })
        .await
        .map_err(|e| SensorError::Join(e.to_string()))?
    }

    /// Poll data-ready until it goes high or the bounded wait runs out.
    pub async fn wait_ready(&self) -> Result<(), SensorError> {
        let started = Instant::now();
        loop {
            if self.with_scale(|s| Ok(s.is_ready())).await? {
                return Ok(());
            }
            if started.elapsed() >= self.timing.ready_timeout {
                return Err(SensorError::DeviceNotReady { waited: self.timing.ready_timeout });
            }
            sleep(self.timing.ready_poll).await;
        }
    }

    /// Power-cycle the amplifier and restore the configured gain.
    pub async fn reset(&self) -> Result<(), SensorError> {
        let gain = self.gain;
        self.with_scale(move |s| {
            s.reset()?;
            s.set_gain(gain)
        })
        .await
    }

    /// Mean of `n` raw conversions, taken as one uninterrupted burst.
    pub async fn read_raw_average(&self, n: usize) -> Result<f64, SensorError> {
        let n = n.max(1);
        self.with_scale(move |s| {
            let mut sum = 0.0;
            for _ in 0..n {
                sum += f64::from(s.read_raw()?);
            }
            Ok(sum / n as f64)
        })
        .await
    }

    /// Tare against the current unloaded reading and switch to `reference_unit`.
    /// Both halves of the conversion change in one write, after the burst.
    pub async fn apply(&self, reference_unit: f64) -> Result<Conversion, SensorError> {
        let offset = self.read_raw_average(self.tare_samples).await?;
        let applied = Conversion { offset, reference_unit };
        self.write_conversion(|c| *c = applied);
        tracing::debug!(offset, reference_unit, "conversion applied");
        Ok(applied)
    }

    #[cfg(test)]
    pub fn set_reference_unit(&self, reference_unit: f64) {
        self.write_conversion(|c| c.reference_unit = reference_unit);
    }

    pub fn conversion(&self) -> Conversion {
        match self.conversion.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn write_conversion(&self, f: impl FnOnce(&mut Conversion)) {
        match self.conversion.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Averaged weight over `n` readings using the conversion in force when
    /// the read starts.
    pub async fn try_sample_weight(&self, n: usize) -> Result<f64, SensorError> {
        self.wait_ready().await?;
        let conversion = self.conversion();
        let raw = self.read_raw_average(n).await?;
        Ok(round_to(conversion.to_weight(raw), 2))
    }

    /// Like `try_sample_weight`, but a failure becomes `None`.
    pub async fn sample_weight(&self, n: usize) -> Option<f64> {
        match self.try_sample_weight(n).await {
            Ok(weight) => Some(weight),
            Err(e) => {
                tracing::warn!(error = %e, kind = e.as_label(), "weight sample failed");
                None
            }
        }
    }

    pub async fn try_sample_pressures(&self) -> Result<PressureReadings, SensorError> {
        let pressure = self.pressure.clone();
        let volts = tokio::task::spawn_blocking(move || {
            let mut adc = pressure
                .lock()
                .map_err(|_| SensorError::Read("adc lock poisoned".to_string()))?;
            let mut volts = [0.0; 3];
            for (slot, channel) in volts.iter_mut().zip(PRESSURE_CHANNELS) {
                *slot = adc
                    .read_voltage(channel)
                    .map_err(|e| SensorError::Read(e.to_string()))?;
            }
            Ok::<_, SensorError>(volts)
        })
        .await
        .map_err(|e| SensorError::Join(e.to_string()))??;

        Ok(PressureReadings::from_volts(volts))
    }

    /// One failing channel nulls all three.
    pub async fn sample_pressures(&self) -> PressureReadings {
        match self.try_sample_pressures().await {
            Ok(readings) => readings,
            Err(e) => {
                tracing::warn!(error = %e, kind = e.as_label(), "pressure sample failed");
                PressureReadings::unavailable()
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::hal::fake::{FakePressure, FakeScale};

    /// Millisecond timings so sequences finish quickly under test.
    pub fn fast_scale_config() -> ScaleConfig {
        ScaleConfig {
            settle_ms: 1,
            placement_ms: 1,
            reset_settle_ms: 1,
            ready_timeout_ms: 30,
            ready_poll_ms: 5,
            ..ScaleConfig::default()
        }
    }

    pub fn fake_gateway(raw: i32) -> (SensorGateway, FakeScale, FakePressure) {
        let scale = FakeScale::new(raw);
        let pressure = FakePressure::new([0.5, 0.75, 1.0]);
        let gateway = SensorGateway::new(
            Box::new(scale.clone()),
            Box::new(pressure.clone()),
            &fast_scale_config(),
        );
        (gateway, scale, pressure)
    }
}
