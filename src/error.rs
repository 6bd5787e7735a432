//! Unified error handling for the patrol crate
//!
//! Each module defines its own thiserror enum; this module consolidates
//! them into a single [`Error`] for use across module boundaries, with an
//! [`ErrorCategory`] classification driving handling strategies.

use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::accounts::AccountError;
pub use crate::config::ConfigError;
pub use crate::dispatch::DispatchError;
pub use crate::spawns::SpawnError;
pub use crate::worker::VisitError;

/// Result type for patrol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Dispatch loop and scheduling errors
    Scheduling,
    /// Spawn data and snapshot errors
    Storage,
    /// Account pool errors
    Credentials,
    /// Field protocol errors
    Protocol,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

/// Unified error type for the patrol crate
#[derive(Error, Debug)]
pub enum Error {
    /// Dispatch loop errors
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Spawn data errors
    #[error("spawn data error: {0}")]
    Spawns(#[from] SpawnError),

    /// Account pool errors
    #[error("account error: {0}")]
    Accounts(#[from] AccountError),

    /// Field protocol errors
    #[error("visit error: {0}")]
    Visit(#[from] VisitError),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Dispatch(_) => ErrorCategory::Scheduling,
            Self::Spawns(_) => ErrorCategory::Storage,
            Self::Accounts(_) => ErrorCategory::Credentials,
            Self::Visit(_) => ErrorCategory::Protocol,
            Self::Config(_) => ErrorCategory::Config,
            Self::Io(_) | Self::Json(_) => ErrorCategory::Other,
        }
    }

    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Cancellation and the fault limit end the run; a refresh
            // failure before the first successful load is fatal too.
            Self::Dispatch(
                DispatchError::Cancelled
                | DispatchError::FaultLimit { .. }
                | DispatchError::InitialRefresh(_),
            ) => false,
            Self::Dispatch(_) => true,
            Self::Spawns(_) => true,
            // A visit fault only costs one event.
            Self::Visit(_) => true,
            Self::Accounts(_) => false,
            Self::Config(_) => false,
            Self::Io(_) | Self::Json(_) => false,
        }
    }
}
