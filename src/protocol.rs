//! ==============================================================================
//! protocol.rs - JSON wire protocol
//! ==============================================================================
//!
//! inbound (client -> service), one JSON object per text frame:
//!
//!     { "command": "calibrate_scale", "known_weight": 2.0, ...ignored }
//!
//! outbound (service -> client), discriminated by "type":
//!
//!     weight_data  telemetry frame  { waage2, drucksensoren{sensor1..3}, timestamp }
//!     response     command reply    { command, status, message?, ...fields }
//!     error        protocol error   { message }
//!     connection   greeting         { message, client_id }
//!
//! ==============================================================================

use serde::Serialize;
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::calibration::validate_known_weight;
use crate::error::{CalibrationError, ProtocolError};
use crate::sensors::PressureReadings;

/// Seconds since the unix epoch, as a float.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ==============================================================================
// inbound
// ==============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub command: String,
    /// every field except "command"
    pub payload: Map<String, Value>,
}

impl CommandRequest {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Value::Object(mut payload) = value else {
            return Err(ProtocolError::Malformed("expected a JSON object".to_string()));
        };

        let command = match payload.remove("command") {
            Some(Value::String(command)) => command,
            Some(Value::Null) | None => return Err(ProtocolError::MissingCommand),
            Some(other) => {
                return Err(ProtocolError::Malformed(format!("\"command\" must be a string, got {other}")))
            }
        };

        Ok(Self { command, payload })
    }

    /// `known_weight` as a usable divisor. Numeric strings are accepted.
    pub fn known_weight(&self) -> Result<f64, CalibrationError> {
        let weight = match self.payload.get("known_weight") {
            None | Some(Value::Null) => {
                return Err(CalibrationError::InvalidArgument("known_weight is required".to_string()))
            }
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(_) => None,
        };
        let weight = weight.ok_or_else(|| {
            CalibrationError::InvalidArgument("known_weight must be numeric".to_string())
        })?;
        validate_known_weight(weight)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartMeasuring,
    StopMeasuring,
    StartZeroMeasurement,
    Init { known_weight: f64 },
    TareScale,
    CalibrateScale { known_weight: f64 },
    GetCurrentWeight,
    Unknown(String),
}

impl Command {
    /// Argument errors surface here, before anything touches the device.
    pub fn from_request(request: &CommandRequest) -> Result<Self, CalibrationError> {
        Ok(match request.command.as_str() {
            "start_measuring" => Command::StartMeasuring,
            "stop_measuring" => Command::StopMeasuring,
            "start_zero_measurement" => Command::StartZeroMeasurement,
            "init" => Command::Init { known_weight: request.known_weight()? },
            "tare_scale" => Command::TareScale,
            "calibrate_scale" => Command::CalibrateScale { known_weight: request.known_weight()? },
            "get_current_weight" => Command::GetCurrentWeight,
            other => Command::Unknown(other.to_string()),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Command::StartMeasuring => "start_measuring",
            Command::StopMeasuring => "stop_measuring",
            Command::StartZeroMeasurement => "start_zero_measurement",
            Command::Init { .. } => "init",
            Command::TareScale => "tare_scale",
            Command::CalibrateScale { .. } => "calibrate_scale",
            Command::GetCurrentWeight => "get_current_weight",
            Command::Unknown(name) => name,
        }
    }
}

// ==============================================================================
// outbound
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetryFrame {
    pub waage2: Option<f64>,
    pub drucksensoren: PressureReadings,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    pub command: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CommandResponse {
    pub fn new(command: impl Into<String>, status: Status) -> Self {
        Self { command: command.into(), status, message: None, fields: Map::new() }
    }

    pub fn success(command: impl Into<String>) -> Self {
        Self::new(command, Status::Success)
    }

    pub fn error(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(command, Status::Error).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    WeightData(TelemetryFrame),
    Response(CommandResponse),
    Error { message: String },
    Connection { message: String, client_id: u64 },
}

impl Outbound {
    pub fn error(message: impl Into<String>) -> Self {
        Outbound::Error { message: message.into() }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize outbound message");
            r#"{"type":"error","message":"internal serialization failure"}"#.to_string()
        })
    }
}

impl From<CommandResponse> for Outbound {
    fn from(response: CommandResponse) -> Self {
        Outbound::Response(response)
    }
}

impl From<TelemetryFrame> for Outbound {
    fn from(frame: TelemetryFrame) -> Self {
        Outbound::WeightData(frame)
    }
}
