//! Custom error types for the application.
//!
//! This module defines the primary error type, `WaveError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized way to report the
//! failures that can escape the transfer / decode / burst pipeline.
//!
//! ## Error Hierarchy
//!
//! - **`NotConnected`**: the transport is not open. Returned before any state
//!   is mutated; never retried.
//! - **`DownloadInProgress`**: a second batch was requested while one is active.
//! - **`Io`**: wraps `std::io::Error` (missing or unreadable files, output
//!   directory creation).
//! - **`Config`** / **`ConfigValidation`**: parse and semantic errors for the
//!   persisted options document.
//! - **`Transport`**: a failure reported by the instrument link for one request.
//! - **`Storage`** / **`Serialization`**: burst writer failures.
//! - **`Render`**: a display consumer rejected a record.
//!
//! Per-file transfer failures and per-ensemble corruption are *not* errors at
//! this level: they are absorbed into counters and lists by the download
//! coordinator and the decoder respectively.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, WaveError>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum WaveError {
    /// The transport is not open.
    #[error("Instrument not connected")]
    NotConnected,

    /// A download session is already running.
    #[error("A download session is already active")]
    DownloadInProgress,

    /// File or directory I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The options document could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// An option is out of range.
    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    /// Encoding or decoding a document failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The instrument link failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serial support was compiled out.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// A burst writer failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A renderer rejected a record.
    #[error("Render error: {0}")]
    Render(String),

    /// A background task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(String),
}

impl WaveError {
    /// Whether the failure is confined to a single file or record.
    ///
    /// Recoverable errors are recorded and the surrounding batch continues;
    /// the rest describe a missing precondition or a broken resource.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WaveError::Transport(_) | WaveError::Storage(_) | WaveError::Render(_)
        )
    }
}

impl From<figment::Error> for WaveError {
    fn from(value: figment::Error) -> Self {
        WaveError::Config(Box::new(value))
    }
}

impl From<serde_json::Error> for WaveError {
    fn from(value: serde_json::Error) -> Self {
        WaveError::Serialization(value.to_string())
    }
}

impl From<toml::ser::Error> for WaveError {
    fn from(value: toml::ser::Error) -> Self {
        WaveError::Serialization(value.to_string())
    }
}

impl From<tokio::task::JoinError> for WaveError {
    fn from(value: tokio::task::JoinError) -> Self {
        WaveError::Task(value.to_string())
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for WaveError {
    fn from(value: csv::Error) -> Self {
        WaveError::Storage(value.to_string())
    }
}

#[cfg(feature = "instrument_serial")]
impl From<serialport::Error> for WaveError {
    fn from(value: serialport::Error) -> Self {
        WaveError::Transport(value.to_string())
    }
}
