//! ==============================================================================
//! error.rs - typed error taxonomy
//! ==============================================================================
//!
//! purpose:
//!     every failure a client can observe has a kind here. command handlers
//!     return these, and the connection boundary turns them into `type: error`
//!     or `status: error` messages instead of tearing the socket down.
//!
//! relationships:
//!     - raised by: sensors.rs, calibration.rs, hub.rs, protocol.rs
//!     - converted by: dispatcher.rs (into wire messages)
//!
//! ==============================================================================

use std::time::Duration;
use thiserror::Error;

/// Failures of the physical sensor path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    /// The amplifier did not signal data-ready within the bounded wait.
    #[error("HX711 not ready after {waited:?}")]
    DeviceNotReady { waited: Duration },

    /// The underlying driver reported a read failure.
    #[error("sensor read failed: {0}")]
    Read(String),

    /// The blocking read task panicked or was cancelled.
    #[error("sensor task aborted: {0}")]
    Join(String),
}

impl SensorError {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorError::DeviceNotReady { .. } => "device_not_ready",
            SensorError::Read(_) => "sensor_read",
            SensorError::Join(_) => "sensor_join",
        }
    }
}

/// Failures of the zero / calibrate / init sequences.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Zero value not set. Please perform zero measurement first.")]
    Precondition,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The known-weight reading did not differ from the zero reading.
    #[error("calibration reading {raw_known} gives no usable reference unit against zero {zero_offset}")]
    DegenerateReading { raw_known: f64, zero_offset: f64 },

    #[error(transparent)]
    Sensor(#[from] SensorError),
}

impl CalibrationError {
    pub fn as_label(&self) -> &'static str {
        match self {
            CalibrationError::Precondition => "precondition",
            CalibrationError::InvalidArgument(_) => "invalid_argument",
            CalibrationError::DegenerateReading { .. } => "degenerate_reading",
            CalibrationError::Sensor(e) => e.as_label(),
        }
    }

    pub fn is_device_not_ready(&self) -> bool {
        matches!(self, CalibrationError::Sensor(SensorError::DeviceNotReady { .. }))
    }
}

/// A send to one specific client failed. Never propagated past the hub.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("client channel closed")]
    Closed,

    #[error("client send timed out after {0:?}")]
    Timeout(Duration),
}

/// Inbound frame could not be turned into a command.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message has no \"command\" field")]
    MissingCommand,

    #[error("unsupported frame type; send JSON text frames")]
    UnsupportedFrame,
}

/// Everything a single command can fail with.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

impl CommandError {
    pub fn as_label(&self) -> &'static str {
        match self {
            CommandError::Protocol(_) => "protocol",
            CommandError::Calibration(e) => e.as_label(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_not_ready_is_detected_through_calibration_error() {
        let err: CalibrationError = SensorError::DeviceNotReady { waited: Duration::from_secs(120) }.into();
        assert!(err.is_device_not_ready());
        assert_eq!(err.as_label(), "device_not_ready");
        assert!(!CalibrationError::Precondition.is_device_not_ready());
    }

    #[test]
    fn precondition_message_tells_the_user_what_to_do() {
        let msg = CalibrationError::Precondition.to_string();
        assert!(msg.contains("zero measurement first"));
    }
}
