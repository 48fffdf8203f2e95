//! Custom error types for the application.
//!
//! This module defines the primary error type, `ScanError`, for the whole crate, and
//! `DeviceError`, the error surfaced by the hardware capability traits. Using the
//! `thiserror` crate, they provide a centralized and consistent way to handle the
//! different kinds of errors that can occur, from configuration and I/O issues to
//! instrument faults.
//!
//! ## Error Hierarchy
//!
//! `ScanError` consolidates various error sources:
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type errors
//!   while extracting the settings.
//! - **`Configuration`**: Semantic errors in the configuration, values that parse but
//!   are logically incorrect (zero step counts, inverted frequency bounds, ...).
//! - **`Precondition`**: A run was rejected before entering `Running`.
//! - **`Io`** / **`Json`**: File and serialization failures while persisting or
//!   loading results.
//! - **`Format`**: A result file was readable but structurally invalid.
//! - **`Device`**: A hardware fault that escaped the orchestrator's recovery policy.
//!
//! `DeviceError` carries the instrument's status code so that the orchestrator can
//! classify faults into a [`FaultKind`] without string matching.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ScanError>;

/// Convenience alias for results returned by hardware capabilities.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// VISA status: the interface is not currently the controller in charge.
pub const VI_ERROR_NCIC: i32 = -1_073_807_264;

/// VISA status: timeout expired before the operation completed.
pub const VI_ERROR_TMO: i32 = -1_073_807_339;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Settings could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings were loaded but are invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The run was rejected before it started.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A result file has an unexpected structure.
    #[error("Invalid result file: {0}")]
    Format(String),

    /// Result persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unrecovered hardware fault.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// The run task panicked or was cancelled.
    #[error("Scan task failed: {0}")]
    Task(String),
}

impl From<figment::Error> for ScanError {
    fn from(err: figment::Error) -> Self {
        ScanError::Config(Box::new(err))
    }
}

/// Classification of a device fault, used to select a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The instrument session does not hold bus control.
    Contention,
    /// The instrument did not answer in time.
    Timeout,
    /// Anything else.
    Other,
}

/// Errors raised by motion controllers and instruments.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Instrument transport or protocol fault with a status code.
    #[error("Instrument fault ({code}): {message}")]
    Instrument {
        /// Driver status code.
        code: i32,
        /// Driver-provided description.
        message: String,
    },

    /// The motion controller reported a failure.
    #[error("Motion fault: {0}")]
    Motion(String),

    /// Transport-level I/O failure.
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Build an instrument fault from a status code.
    pub fn instrument(code: i32, message: impl Into<String>) -> Self {
        DeviceError::Instrument {
            code,
            message: message.into(),
        }
    }

    /// "Not controller in charge" fault.
    pub fn contention() -> Self {
        Self::instrument(VI_ERROR_NCIC, "interface not currently controller in charge")
    }

    /// Timeout fault.
    pub fn timeout() -> Self {
        Self::instrument(VI_ERROR_TMO, "timeout expired before operation completed")
    }

    /// Instrument status code, if the fault carries one.
    pub fn code(&self) -> Option<i32> {
        match self {
            DeviceError::Instrument { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Classify this fault for the recovery policy.
    pub fn fault_kind(&self) -> FaultKind {
        match self.code() {
            Some(VI_ERROR_NCIC) => FaultKind::Contention,
            Some(VI_ERROR_TMO) => FaultKind::Timeout,
            _ => FaultKind::Other,
        }
    }
}
