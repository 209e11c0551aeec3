//! Error types for positioner control.
//!
//! Two layers are kept apart:
//!
//! - **`BusError`**: a single Modbus exchange failed (I/O, response timeout,
//!   CRC mismatch, exception reply). These are what the transport retries.
//! - **`PositionerError`**: what callers of the axis controller and the
//!   supervisor see. Communication faults only reach this layer after the
//!   channel has exhausted its retry budget, and they are classified as either
//!   transient (link noise, worth retrying later) or addressing (a register
//!   map/configuration bug that no retry will fix).
//!
//! Motion failures (`Stalled`, `TimedOut`, `LimitFault`) are raised by the
//! move-and-confirm loop after it has already commanded the axis to stop.

use crate::axis::{AxisKind, LimitState};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the positioner error type.
pub type PositionerResult<T> = std::result::Result<T, PositionerError>;

/// Modbus exception code for "illegal data address".
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Failure of one register-level exchange on the wire.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),

    #[error("CRC mismatch (expected {expected:#06x}, received {received:#06x})")]
    Crc { expected: u16, received: u16 },

    #[error("Modbus exception {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("channel is closed")]
    Closed,
}

impl BusError {
    /// True for the "illegal data address" exception class.
    ///
    /// This indicates a wrong register address in the axis profile rather
    /// than a noisy link.
    pub fn is_addressing(&self) -> bool {
        matches!(
            self,
            BusError::Exception { code, .. } if *code == EXCEPTION_ILLEGAL_DATA_ADDRESS
        )
    }
}

/// Classification of a communication failure once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommFailure {
    /// Timeout or link noise. Safe to retry at a higher level.
    Transient,
    /// Illegal register address. Configuration bug, not retryable.
    Addressing,
}

impl std::fmt::Display for CommFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CommFailure::Transient => "transient",
            CommFailure::Addressing => "addressing",
        };
        write!(f, "{}", label)
    }
}

impl From<&BusError> for CommFailure {
    fn from(err: &BusError) -> Self {
        if err.is_addressing() {
            CommFailure::Addressing
        } else {
            CommFailure::Transient
        }
    }
}

/// Primary error type for positioner control.
#[derive(Error, Debug)]
pub enum PositionerError {
    /// Requested physical value lies outside the axis limits.
    ///
    /// Always raised before any bus traffic.
    #[error("{axis} value {value} outside allowed range [{min}, {max}]")]
    Range {
        axis: AxisKind,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Channel operation failed on every attempt.
    #[error("{kind} communication failure on {port} after {attempts} attempts: {source}")]
    Communication {
        port: String,
        kind: CommFailure,
        attempts: u32,
        #[source]
        source: BusError,
    },

    /// Position stopped changing before the target was reached.
    #[error("{axis} stalled at {position:.3} (target {target:.3})")]
    Stalled {
        axis: AxisKind,
        position: f64,
        target: f64,
    },

    /// Wall-clock motion budget exceeded.
    #[error("{axis} did not reach {target:.3} within {elapsed:?} (last position {position:?})")]
    TimedOut {
        axis: AxisKind,
        target: f64,
        position: Option<f64>,
        elapsed: Duration,
    },

    /// The confirming read after completion fell outside tolerance.
    #[error("{axis} settled at {position:.3}, outside tolerance of {target:.3}")]
    Drifted {
        axis: AxisKind,
        position: f64,
        target: f64,
    },

    /// A hardware end-of-travel switch tripped during motion.
    #[error("{axis} limit switch tripped ({switches})")]
    LimitFault { axis: AxisKind, switches: LimitState },

    /// Operation not available on this axis kind.
    #[error("{operation} is not supported on {axis}")]
    Unsupported {
        axis: AxisKind,
        operation: &'static str,
    },

    /// Speed above the axis maximum.
    #[error("{axis} speed {speed} exceeds maximum {max}")]
    InvalidSpeed { axis: AxisKind, speed: u16, max: u16 },

    /// Calibration write did not read back as the requested value.
    #[error("{axis} calibration mismatch: wrote {expected:.3}, read back {actual:.3}")]
    CalibrationMismatch {
        axis: AxisKind,
        expected: f64,
        actual: f64,
    },

    /// A stop request interrupted a move in progress.
    #[error("{axis} move cancelled by stop request")]
    Cancelled { axis: AxisKind },

    /// Configuration is missing or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file parsing failed.
    #[error("Configuration parse error: {0}")]
    Figment(#[from] figment::Error),

    /// Opening or closing a port failed outside of a register exchange.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PositionerError {
    /// True when the failure is worth retrying at a higher level.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PositionerError::Communication {
                kind: CommFailure::Transient,
                ..
            }
        )
    }

    /// Short machine-readable label, used in structured events.
    pub fn kind_label(&self) -> &'static str {
        match self {
            PositionerError::Range { .. } => "range",
            PositionerError::Communication { .. } => "communication",
            PositionerError::Stalled { .. } => "stalled",
            PositionerError::TimedOut { .. } => "timed_out",
            PositionerError::Drifted { .. } => "drifted",
            PositionerError::LimitFault { .. } => "limit_fault",
            PositionerError::Unsupported { .. } => "unsupported",
            PositionerError::InvalidSpeed { .. } => "invalid_speed",
            PositionerError::CalibrationMismatch { .. } => "calibration_mismatch",
            PositionerError::Cancelled { .. } => "cancelled",
            PositionerError::Config(_) | PositionerError::Figment(_) => "config",
            PositionerError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_address_is_classified_as_addressing() {
        let err = BusError::Exception {
            function: 0x03,
            code: EXCEPTION_ILLEGAL_DATA_ADDRESS,
        };
        assert!(err.is_addressing());
        assert_eq!(CommFailure::from(&err), CommFailure::Addressing);

        let noise = BusError::ResponseTimeout(Duration::from_secs(1));
        assert!(!noise.is_addressing());
        assert_eq!(CommFailure::from(&noise), CommFailure::Transient);
    }

    #[test]
    fn only_transient_communication_is_retryable() {
        let transient = PositionerError::Communication {
            port: "COM15".into(),
            kind: CommFailure::Transient,
            attempts: 3,
            source: BusError::ResponseTimeout(Duration::from_secs(1)),
        };
        assert!(transient.is_transient());

        let addressing = PositionerError::Communication {
            port: "COM15".into(),
            kind: CommFailure::Addressing,
            attempts: 3,
            source: BusError::Exception {
                function: 0x03,
                code: 0x02,
            },
        };
        assert!(!addressing.is_transient());
        assert_eq!(addressing.kind_label(), "communication");
    }
}
