//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Each subsystem keeps its own focused error enum (`ConfigError` for channel
//! resolution, `DriverFault` for the hardware feed, `FormatError` for the log
//! format) and `DaqError` wraps them with `#[from]` so the `?` operator works
//! across module boundaries.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: the channel list could not be resolved. Fatal before a
//!   session starts.
//! - **`Settings`**: the configuration file or environment could not be parsed.
//! - **`Configuration`**: parsed settings that are semantically invalid.
//! - **`Driver`**: the hardware feed failed. Fatal to the session.
//! - **`Io`**: disk write/flush failure. Fatal to the session, prior segments
//!   remain valid.
//! - **`Format`**: a log file could not be read. Scoped to one read operation.
//! - **`SessionAborted`**: a running session stopped because of one of the
//!   faults above; carries the last durably committed sample count.
//!
//! Truncated final segments are *not* errors; the reader reports them as
//! [`TruncationRecovered`](crate::storage::TruncationRecovered) warnings.

use crate::channel::registry::ConfigError;
use crate::hardware::DriverFault;
use crate::storage::FormatError;
use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Channel configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Driver fault: {0}")]
    Driver(#[from] DriverFault),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log format error: {0}")]
    Format(#[from] FormatError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session aborted by {kind} fault after {durable_samples} durable samples: {message}")]
    SessionAborted {
        kind: FaultKind,
        durable_samples: u64,
        message: String,
    },

    #[error("Export error: {0}")]
    Export(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Settings(Box::new(err))
    }
}

/// The precipitating fault of an aborted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Driver,
    Io,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Driver => f.write_str("driver"),
            FaultKind::Io => f.write_str("I/O"),
        }
    }
}

impl DaqError {
    /// Fault classification for errors that end a running session.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            DaqError::Driver(_) => Some(FaultKind::Driver),
            DaqError::Io(_) => Some(FaultKind::Io),
            DaqError::Format(FormatError::Io(_)) => Some(FaultKind::Io),
            DaqError::SessionAborted { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether the error is fatal to an active acquisition session.
    pub fn is_session_fatal(&self) -> bool {
        self.fault_kind().is_some()
    }
}
