//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire library.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while sequencing instruments, talking to the board
//! and persisting reports.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: An instrument or transport could not be reached, or was lost
//!   mid-exchange. The automation controller treats this class as systemic and aborts
//!   the running sequence.
//! - **`NotFound`**: Auto-attach scanned every candidate resource and none reported
//!   the expected identity family.
//! - **`Busy`**: A resource, logical instrument name, run slot or programming slot is
//!   already held.
//! - **`MalformedField`**: A hex field, frame or value failed validation before anything
//!   was transmitted.
//! - **`Decode`**: A binary trace response could not be turned into finite values.
//! - **`Write`**: The report store could not be opened, locked or written.
//! - **`Timeout`**: A bounded wait expired. The session that timed out stays open.
//! - **`ExternalTool`**: The FPGA toolchain could not be launched or exited non-zero.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the crate reports
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or parsed
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but holds an invalid value
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Instrument or transport unreachable or lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Auto-attach found no matching identity
    #[error("No instrument found: {0}")]
    NotFound(String),

    /// Resource, name, run slot or programming slot already held
    #[error("Busy: {0}")]
    Busy(String),

    /// Input failed validation before transmission
    #[error("Malformed field '{field}': {reason}")]
    MalformedField {
        /// Field name
        field: String,
        /// What was wrong
        reason: String,
    },

    /// Binary trace could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Report store could not be opened, locked or written
    #[error("Report write error: {0}")]
    Write(String),

    /// Bounded wait expired
    #[error("Timed out after {timeout:?}: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Wait that expired
        timeout: Duration,
    },

    /// FPGA toolchain failed to launch or exited non-zero
    #[error("External tool error: {0}")]
    ExternalTool(String),

    /// Run request rejected as a whole
    #[error("Invalid run request: {0}")]
    InvalidRequest(String),

    /// Serial port failure
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Operation needs a cargo feature this build lacks
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Shorthand for a [`DaqError::MalformedField`].
    pub fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DaqError::MalformedField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`DaqError::Timeout`].
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        DaqError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// True for faults that mean the instrument link itself is gone.
    ///
    /// The automation controller aborts a run on these and retries everything else.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            DaqError::Connection(_) | DaqError::Io(_) | DaqError::Serial(_)
        )
    }

    /// True if this error is a bounded wait that expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DaqError::Timeout { .. })
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

#[cfg(feature = "instrument_serial")]
impl From<serialport::Error> for DaqError {
    fn from(err: serialport::Error) -> Self {
        DaqError::Serial(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Connection("analyzer dropped".to_string());
        assert_eq!(err.to_string(), "Connection error: analyzer dropped");
    }

    #[test]
    fn test_malformed_field_display() {
        let err = DaqError::malformed("prt", "expected 4 bytes, got 3");
        assert_eq!(
            err.to_string(),
            "Malformed field 'prt': expected 4 bytes, got 3"
        );
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(DaqError::Connection("gone".into()).is_disconnect());
        assert!(DaqError::Io(std::io::Error::other("broken pipe")).is_disconnect());
        assert!(!DaqError::timeout(":CALC:MARK:Y?", Duration::from_secs(1)).is_disconnect());
        assert!(!DaqError::Decode("bad block".into()).is_disconnect());
    }

    #[test]
    fn test_timeout_classification() {
        let err = DaqError::timeout("*IDN?", Duration::from_millis(1500));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("*IDN?"));
    }
}
