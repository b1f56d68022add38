use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

use crate::error::VeloxError;

/// A device seen during a discovery scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedDevice {
    /// Advertised local name
    pub name: String,
    /// Platform address of the peripheral
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: i16,
    /// Whether the device advertises the Fitness Machine Service
    pub has_ftms: bool,
    /// Manufacturer inferred from advertisement data or name
    pub manufacturer: Option<String>,
}

impl ScannedDevice {
    /// Whether this device answers to an address or name, case-insensitively
    #[must_use]
    pub fn matches(&self, target: &str) -> bool {
        self.address.eq_ignore_ascii_case(target) || self.name.eq_ignore_ascii_case(target)
    }

    /// Human readable label used after connecting
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.address)
    }
}

/// Normalized indoor bike telemetry
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndoorBikeMetrics {
    /// Instantaneous power in watts
    pub power_watts: Option<i16>,
    /// Instantaneous cadence in rpm (0.5 rpm resolution)
    pub cadence_rpm: Option<f64>,
    /// Instantaneous speed in km/h (0.01 km/h resolution)
    pub speed_kmh: Option<f64>,
}

/// Power range a trainer accepts for ERG targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedPowerRange {
    /// Minimum target in watts
    pub min_watts: i16,
    /// Maximum target in watts
    pub max_watts: i16,
    /// Target granularity in watts, at least 1
    pub increment_watts: u16,
}

impl fmt::Display for SupportedPowerRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} W step {} W",
            self.min_watts, self.max_watts, self.increment_watts
        )
    }
}

/// Which trainer to connect to
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectTarget {
    /// First device advertising the Fitness Machine Service
    #[default]
    Auto,
    /// Device matching this address or name
    Named(String),
}

impl FromStr for ConnectTarget {
    type Err = VeloxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            Ok(Self::Named(trimmed.to_string()))
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Named(target) => write!(f, "{target}"),
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Scan timeout in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Request pairing on the first connection attempt
    pub pair: bool,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 5_000,
            connect_timeout_ms: 25_000,
            pair: true,
        }
    }
}

impl ConnectionParams {
    /// Scan timeout as a [`Duration`]
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Connection timeout as a [`Duration`]
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Control point pacing and telemetry hand-off settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Delay between commands of one control point sequence in milliseconds
    pub command_spacing_ms: u64,
    /// Capacity of the metrics channel handed to subscribers
    pub metrics_buffer: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            command_spacing_ms: 50,
            metrics_buffer: 64,
        }
    }
}

/// Workout runner retry and timing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Attempts made to apply a step target before aborting
    pub max_attempts: u32,
    /// Backoff between target attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Progress tick interval in milliseconds
    pub tick_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 1_000,
            tick_interval_ms: 1_000,
        }
    }
}

/// Trainer simulator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Seed for the deterministic random generator
    pub seed: u64,
    /// Telemetry tick interval in milliseconds
    pub tick_interval_ms: u64,
    /// Power range the simulated trainer reports
    pub power_range: SupportedPowerRange,
    /// Initial ERG target in watts
    pub initial_target_watts: i32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 20_260_225,
            tick_interval_ms: 1_000,
            power_range: SupportedPowerRange {
                min_watts: 50,
                max_watts: 1200,
                increment_watts: 5,
            },
            initial_target_watts: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_params_default() {
        let params = ConnectionParams::default();
        assert_eq!(params.scan_timeout(), Duration::from_secs(5));
        assert_eq!(params.connect_timeout(), Duration::from_secs(25));
        assert!(params.pair);
    }

    #[test]
    fn test_runner_and_control_defaults() {
        let runner = RunnerConfig::default();
        assert_eq!(runner.max_attempts, 3);
        assert_eq!(runner.retry_delay_ms, 1_000);
        assert_eq!(runner.tick_interval_ms, 1_000);

        let control = ControlConfig::default();
        assert_eq!(control.command_spacing_ms, 50);
        assert_eq!(control.metrics_buffer, 64);
    }

    #[test]
    fn test_connect_target_parsing() {
        assert_eq!("auto".parse::<ConnectTarget>().unwrap(), ConnectTarget::Auto);
        assert_eq!("".parse::<ConnectTarget>().unwrap(), ConnectTarget::Auto);
        assert_eq!(
            " DIRETO XR ".parse::<ConnectTarget>().unwrap(),
            ConnectTarget::Named("DIRETO XR".to_string())
        );
    }

    #[test]
    fn test_scanned_device_matching() {
        let device = ScannedDevice {
            name: "KICKR CORE 1A2B".to_string(),
            address: "C4:7F:51:00:11:22".to_string(),
            rssi: -60,
            has_ftms: true,
            manufacturer: Some("Wahoo Fitness".to_string()),
        };
        assert!(device.matches("c4:7f:51:00:11:22"));
        assert!(device.matches("kickr core 1a2b"));
        assert!(!device.matches("KICKR"));
        assert_eq!(device.label(), "KICKR CORE 1A2B (C4:7F:51:00:11:22)");
    }
}
