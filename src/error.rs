//! Custom error types for the test station.
//!
//! This module defines the primary error type, `EolError`, for the whole engine. Using the
//! `thiserror` crate, it provides one consistent way to report everything that can go wrong
//! while a test plan runs, from a malformed test specification to an unplugged CAN adapter.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidInput`**: a bad test specification, an empty plan or a non-positive DUT UID.
//!   Fatal to `Sequencer::start`; inside the runner it becomes an `Error` result.
//! - **`Unreachable`** / **`Transport`**: the adapter or instrument is disconnected or a write
//!   failed. Recorded as `Error` on the single test that hit it.
//! - **`Decode`** / **`UnknownSignal`**: the message database cannot encode or decode a signal.
//! - **`DegenerateData`**: a calibration fit is unavailable (constant or single-point input).
//! - **`Timeout`**: a bounded wait elapsed without producing any data.
//! - **`Cancelled`**: a cancellation request interrupted a dwell or acquisition wait.
//! - **`Internal`**: a procedure panicked or the engine hit an unexpected state.
//! - **`Config`**, **`Io`**, **`Serialization`**, **`Toml`**: configuration and plan loading.
//!
//! Tolerance violations are deliberately *not* errors: a value outside its tolerance is a valid
//! `Fail` verdict and never travels through this type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the station error type.
pub type EolResult<T> = std::result::Result<T, EolError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum EolError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Hardware unreachable: {0}")]
    Unreachable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unknown signal '{signal}' in message 0x{message_id:X}")]
    UnknownSignal { message_id: u32, signal: String },

    #[error("Degenerate calibration data: {0}")]
    DegenerateData(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled by operator")]
    Cancelled,

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Plan parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<figment::Error> for EolError {
    fn from(value: figment::Error) -> Self {
        EolError::Config(Box::new(value))
    }
}

/// Coarse classification of an [`EolError`], recorded on `Error` results for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Malformed specification or arguments
    InvalidInput,
    /// Adapter, instrument or bus problem
    Hardware,
    /// Data could not be decoded or reduced to a verdict
    Data,
    /// Interrupted by an operator cancel
    Cancelled,
    /// Anything else (configuration, I/O, a panicking procedure)
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::InvalidInput => write!(f, "invalid-input"),
            ErrorCategory::Hardware => write!(f, "hardware"),
            ErrorCategory::Data => write!(f, "data"),
            ErrorCategory::Cancelled => write!(f, "cancelled"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

impl EolError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EolError::InvalidInput(_) => ErrorCategory::InvalidInput,
            EolError::Unreachable(_)
            | EolError::Transport(_)
            | EolError::Timeout(_)
            | EolError::Instrument(_) => ErrorCategory::Hardware,
            EolError::Decode(_) | EolError::UnknownSignal { .. } | EolError::DegenerateData(_) => {
                ErrorCategory::Data
            }
            EolError::Cancelled => ErrorCategory::Cancelled,
            EolError::Internal(_)
            | EolError::Config(_)
            | EolError::Io(_)
            | EolError::Serialization(_)
            | EolError::Toml(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the remaining tests of a sequence can still run after this error.
    ///
    /// Only a cancellation ends a sequence; everything else is isolated to one test.
    pub fn can_continue(&self) -> bool {
        !matches!(self, EolError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorises_hardware_faults() {
        let err = EolError::Unreachable("PCAN adapter unplugged".into());
        assert_eq!(err.category(), ErrorCategory::Hardware);
        assert!(err.can_continue());
    }

    #[test]
    fn degenerate_data_is_a_data_error() {
        let err = EolError::DegenerateData("all x values identical".into());
        assert_eq!(err.category(), ErrorCategory::Data);
        assert!(err.to_string().contains("all x values identical"));
    }

    #[test]
    fn cancellation_stops_the_sequence() {
        assert!(!EolError::Cancelled.can_continue());
        assert_eq!(EolError::Cancelled.category(), ErrorCategory::Cancelled);
    }

    #[test]
    fn unknown_signal_formats_hex_id() {
        let err = EolError::UnknownSignal {
            message_id: 0x1A0,
            signal: "Relay".into(),
        };
        assert_eq!(err.to_string(), "Unknown signal 'Relay' in message 0x1A0");
    }
}
