//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `service.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: Listening address and per-client channel sizing.
//!     - TelemetryConfig: Broadcast cadence and send timeout.
//!     - ScaleConfig: HX711 pins, calibration defaults and all scale timings.
//!     - PressureConfig: ADS1115 address.
//!     - LoggingConfig: Log level and whether frames are logged at info.
//!
//!     every section carries serde defaults, so a partial file is fine.
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub scale: ScaleConfig,
    #[serde(default)]
    pub pressure: PressureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// outbound frames buffered per client before sends start waiting
    pub client_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0".to_string(), port: 8765, client_buffer: 32 }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
    pub client_interval_ms: u64,
    pub send_timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { interval_ms: 1000, client_interval_ms: 1000, send_timeout_ms: 2000 }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn client_interval(&self) -> Duration {
        Duration::from_millis(self.client_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScaleConfig {
    pub dout_pin: u8,
    pub sck_pin: u8,
    pub gain: u8,
    pub default_reference_unit: f64,
    pub zero_samples: usize,
    pub calibration_samples: usize,
    pub weight_samples: usize,
    pub tare_samples: usize,
    pub settle_ms: u64,
    pub placement_ms: u64,
    pub reset_settle_ms: u64,
    pub ready_timeout_ms: u64,
    pub ready_poll_ms: u64,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            dout_pin: 13,
            sck_pin: 26,
            gain: 128,
            default_reference_unit: 3.26,
            zero_samples: 10,
            calibration_samples: 5,
            weight_samples: 10,
            tare_samples: 15,
            settle_ms: 1000,
            placement_ms: 2000,
            reset_settle_ms: 200,
            ready_timeout_ms: 120_000,
            ready_poll_ms: 100,
        }
    }
}

/// Delays used by the scale sequences, resolved to durations once.
#[derive(Debug, Clone, Copy)]
pub struct ScaleTiming {
    pub settle: Duration,
    pub placement: Duration,
    pub reset_settle: Duration,
    pub ready_timeout: Duration,
    pub ready_poll: Duration,
}

impl ScaleConfig {
    pub fn timing(&self) -> ScaleTiming {
        ScaleTiming {
            settle: Duration::from_millis(self.settle_ms),
            placement: Duration::from_millis(self.placement_ms),
            reset_settle: Duration::from_millis(self.reset_settle_ms),
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            ready_poll: Duration::from_millis(self.ready_poll_ms.max(1)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PressureConfig {
    pub i2c_address: String,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self { i2c_address: "0x48".to_string() }
    }
}

impl PressureConfig {
    /// only the rppal HAL needs the parsed form
    #[allow(dead_code)]
    pub fn address(&self) -> anyhow::Result<u16> {
        let trimmed = self.i2c_address.trim_start_matches("0x").trim_start_matches("0X");
        u16::from_str_radix(trimmed, 16)
            .map_err(|e| anyhow::anyhow!("Invalid i2c address {:?}: {}", self.i2c_address, e))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: false }
    }
}

impl ServiceConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let config: ServiceConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Load with default fallback. An explicit path wins over the search list.
    pub fn load_or_default(explicit: Option<PathBuf>) -> Self {
        let paths = match explicit {
            Some(path) => vec![path],
            None => vec![
                PathBuf::from("config").join("service.toml"),
                PathBuf::from("..").join("config").join("service.toml"),
            ],
        };

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│        SCALE TELEMETRY CONFIGURATION    │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Listen: {}", self.server.address());
        println!("│ Broadcast Interval: {}ms", self.telemetry.interval_ms);
        println!("│ HX711: dout={} sck={} gain={}", self.scale.dout_pin, self.scale.sck_pin, self.scale.gain);
        println!("│ Reference Unit: {}", self.scale.default_reference_unit);
        println!("│ ADS1115: {}", self.pressure.i2c_address);
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}
