//! Error types for the teleoperation core

use thiserror::Error;

use crate::InstrumentId;

/// Core teleoperation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TeleopError {
    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Instrument errors
    #[error("Calibration failed on {instrument} DOF {dof}: {reason}")]
    CalibrationFailed {
        instrument: InstrumentId,
        dof: usize,
        reason: String,
    },

    #[error("Instrument {instrument} not calibrated")]
    NotCalibrated { instrument: InstrumentId },

    #[error("Instrument fault on {instrument}: {reason}")]
    InstrumentFault {
        instrument: InstrumentId,
        reason: String,
    },

    #[error("Instrument {0} is emergency stopped")]
    InstrumentStopped(InstrumentId),

    #[error("Unknown instrument {0}")]
    UnknownInstrument(InstrumentId),

    // Console errors
    #[error("Console error: {0}")]
    Console(String),

    // Session errors
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("System is emergency stopped")]
    EmergencyStopped,

    #[error("Heartbeat lost: {gap_ms} ms since last beat")]
    HeartbeatLost { gap_ms: u64 },

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection failed")]
    ConnectionFailed,

    #[error("Channel closed")]
    ChannelClosed,
}

impl TeleopError {
    /// Errors that must take the whole system to emergency stop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TeleopError::HeartbeatLost { .. } | TeleopError::EmergencyStopped
        )
    }
}

impl From<std::io::Error> for TeleopError {
    fn from(e: std::io::Error) -> Self {
        TeleopError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for TeleopError {
    fn from(e: serde_json::Error) -> Self {
        TeleopError::InvalidConfig(e.to_string())
    }
}

/// Result type for teleoperation operations
pub type TeleopResult<T> = Result<T, TeleopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_error_names_dof() {
        let err = TeleopError::CalibrationFailed {
            instrument: InstrumentId::new(2),
            dof: 4,
            reason: "range test timed out".into(),
        };
        assert_eq!(
            err.to_string(),
            "Calibration failed on arm2 DOF 4: range test timed out"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TeleopError::HeartbeatLost { gap_ms: 101 }.is_fatal());
        assert!(!TeleopError::ConnectionFailed.is_fatal());
    }
}
