use thiserror::Error;

use crate::workout::TargetMode;

/// Errors that can occur while talking to a trainer or running a workout
#[derive(Error, Debug)]
pub enum VeloxError {
    /// No Bluetooth backend or adapter is present on this host
    #[error("Bluetooth transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Scan or connect yielded nothing matching the requested target
    #[error("Trainer not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Operation requires an active connection
    #[error("Not connected to a trainer")]
    NotConnected,

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Payload shorter than the mandatory header
    #[error("Malformed payload: {len} bytes, header needs {needed}")]
    MalformedPayload {
        /// Received payload length
        len: usize,
        /// Minimum length required
        needed: usize,
    },

    /// A flagged optional field runs past the end of the payload
    #[error("Truncated {field} field: need {needed} bytes at offset {offset}, payload has {len}")]
    TruncatedField {
        /// Name of the field being decoded
        field: &'static str,
        /// Byte offset the field starts at
        offset: usize,
        /// Width of the field in bytes
        needed: usize,
        /// Total payload length
        len: usize,
    },

    /// Every control point write sequence failed
    #[error("Trainer rejected ERG target of {watts} W")]
    ControlRejected {
        /// Target that was being applied
        watts: i32,
        /// Error raised by the last attempted sequence
        #[source]
        source: Box<VeloxError>,
    },

    /// Target mode is not implemented for this trainer
    #[error("{0} mode is not supported on this trainer")]
    UnsupportedMode(TargetMode),

    /// Workout step target could not be applied after all retries
    #[error("Unable to apply {mode} target after {attempts} attempts")]
    TargetApplicationFailed {
        /// Active target mode
        mode: TargetMode,
        /// Number of attempts made
        attempts: u32,
        /// Error raised by the last attempt
        #[source]
        source: Box<VeloxError>,
    },

    /// A workout is already running
    #[error("Workout already running")]
    AlreadyRunning,

    /// No workout is running
    #[error("No workout running")]
    NotRunning,

    /// The workout task panicked, usually inside a progress callback
    #[error("Workout task panicked: {0}")]
    WorkoutPanicked(String),

    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for Velox operations
pub type Result<T> = std::result::Result<T, VeloxError>;

impl VeloxError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::NotConnected
                | Self::DeviceNotFound
                | Self::TransportUnavailable(_)
        )
    }

    /// Check if retrying the same operation may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Ble(_) | Self::ControlRejected { .. }
        )
    }

    /// Check if this error came from decoding a notification payload
    #[must_use]
    pub const fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedPayload { .. } | Self::TruncatedField { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_classification() {
        let connection_error = VeloxError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());
        assert!(!connection_error.is_decode_error());

        let timeout_error = VeloxError::Timeout { timeout_ms: 5000 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        let decode_error = VeloxError::TruncatedField {
            field: "cadence",
            offset: 4,
            needed: 2,
            len: 5,
        };
        assert!(decode_error.is_decode_error());
        assert!(!decode_error.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = VeloxError::TruncatedField {
            field: "instantaneous power",
            offset: 6,
            needed: 2,
            len: 7,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("instantaneous power"));
        assert!(error_string.contains("offset 6"));
    }

    #[test]
    fn test_wrapped_sources() {
        let error = VeloxError::TargetApplicationFailed {
            mode: TargetMode::Erg,
            attempts: 3,
            source: Box::new(VeloxError::ControlRejected {
                watts: 200,
                source: Box::new(VeloxError::NotConnected),
            }),
        };
        assert!(error.to_string().contains("erg"));
        let source = error.source().map(ToString::to_string).unwrap_or_default();
        assert!(source.contains("200 W"));
    }
}
