//! Domain-specific error types for runtime operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use std::io;
use std::time::Duration;

/// Result type used throughout the runtime.
pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

/// Errors that can occur during runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// No sandbox is registered under the ID.
    #[error("sandbox not found: {id}")]
    NotFound { id: String },

    /// A sandbox with the ID is already registered.
    #[error("sandbox already exists: {id}")]
    AlreadyExists { id: String },

    /// `start` was called on a running sandbox.
    #[error("sandbox is already running: {id}")]
    AlreadyRunning { id: String },

    /// The operation requires a running sandbox.
    #[error("sandbox is not running: {id}")]
    NotRunning { id: String },

    /// The creation config was rejected.
    #[error("invalid sandbox configuration: {message}")]
    InvalidConfig { message: String },

    /// Execution exceeded its deadline.
    #[error("execution timed out after {}ms", timeout.as_millis())]
    Timeout { timeout: Duration },

    /// Execution was interrupted by `stop` or `destroy`.
    #[error("execution in sandbox {id} was cancelled")]
    Cancelled { id: String },

    /// The process could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// I/O failed for a reason other than the child's own exit.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl RuntimeError {
    /// Creates a `NotFound` error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates an `AlreadyExists` error.
    pub fn already_exists(id: impl Into<String>) -> Self {
        Self::AlreadyExists { id: id.into() }
    }

    /// Creates an `AlreadyRunning` error.
    pub fn already_running(id: impl Into<String>) -> Self {
        Self::AlreadyRunning { id: id.into() }
    }

    /// Creates a `NotRunning` error.
    pub fn not_running(id: impl Into<String>) -> Self {
        Self::NotRunning { id: id.into() }
    }

    /// Creates an `InvalidConfig` error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Creates a `Cancelled` error.
    pub fn cancelled(id: impl Into<String>) -> Self {
        Self::Cancelled { id: id.into() }
    }

    /// Creates a `Spawn` error.
    pub fn spawn(program: impl Into<String>, source: io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Creates an `Io` error.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns true if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is an already-exists error.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true if this is an already-running error.
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }

    /// Returns true if this is a not-running error.
    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::NotRunning { .. })
    }

    /// Returns true if this is a configuration error.
    pub fn is_invalid_config(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this is a cancellation error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
