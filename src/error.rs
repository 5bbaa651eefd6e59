use std::time::Duration;
use thiserror::Error;

/// Errors produced by a backend while talking to its container engine
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Couldn't connect to {backend}: {reason}")]
    Connection { backend: String, reason: String },

    #[error("{backend} backend used before connect()")]
    NotConnected { backend: String },

    #[error("operation timeout: {operation} {target} exceeded {after:?}{}", last_error_suffix(.last_error))]
    Timeout {
        operation: &'static str,
        target: String,
        after: Duration,
        last_error: Option<String>,
    },

    #[error("{operation} {target} failed: {message}")]
    Engine {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("{operation} {target}: malformed engine payload: {message}")]
    Decode {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(err) => format!(" (last error: {err})"),
        None => String::new(),
    }
}

impl DriverError {
    pub fn timeout(operation: &'static str, target: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation,
            target: target.into(),
            after,
            last_error: None,
        }
    }

    pub fn engine(
        operation: &'static str,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Engine {
            operation,
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn decode(
        operation: &'static str,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Decode {
            operation,
            target: target.into(),
            message: message.into(),
        }
    }

    /// True when a deadline tripped, as opposed to the engine rejecting the call.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_engine(&self) -> bool {
        matches!(self, Self::Engine { .. })
    }
}

/// Startup failures while resolving a backend by name
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Can't find a driver named: {name} (available: {})", .available.join(", "))]
    NotFound { name: String, available: Vec<String> },

    #[error("{name} is not a driver: contract version {found}, expected {expected}")]
    NotConforming {
        name: String,
        expected: u32,
        found: u32,
    },

    #[error("{name} driver failed to start: {source}")]
    Setup {
        name: String,
        #[source]
        source: DriverError,
    },
}

/// Read failure inside an exec drain task
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("output stream of exec {exec} broke after {bytes_read} bytes: {message}")]
pub struct DrainError {
    pub exec: String,
    pub bytes_read: usize,
    pub message: String,
}

/// Convenience type alias for driver results
pub type Result<T, E = DriverError> = std::result::Result<T, E>;
