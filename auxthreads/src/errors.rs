//! Error types for the auxiliary-thread manager.
//!
//! Every failure carries a human-readable message (through `Display`) and
//! maps onto the flat [`ErrorCode`] namespace the Test Agent reports back to
//! its controller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::WorkerId;

/// Convenience alias used across the crate.
pub type Result<T, E = AuxThreadError> = std::result::Result<T, E>;

/// Flat status code namespace.
///
/// Registry operations only ever report [`ErrorCode::GenericFailure`];
/// the task thread pool additionally distinguishes slot exhaustion and
/// unknown routines the way the agent's thread starter does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The operation succeeded.
    Success,
    /// The operation failed.
    GenericFailure,
    /// No free slot was available.
    TooMany,
    /// The named object does not exist.
    NoEntry,
    /// A wait expired.
    TimedOut,
}

impl ErrorCode {
    /// Returns the integer value reported to the controller.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::GenericFailure => 1,
            Self::TooMany => 2,
            Self::NoEntry => 3,
            Self::TimedOut => 4,
        }
    }

    /// Returns true for [`ErrorCode::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::GenericFailure => "generic failure",
            Self::TooMany => "too many",
            Self::NoEntry => "no entry",
            Self::TimedOut => "timed out",
        };
        write!(f, "{name} ({})", self.as_i32())
    }
}

/// The main error type for auxiliary-thread operations.
#[derive(Debug, Error)]
pub enum AuxThreadError {
    /// A registry operation was attempted before `init`.
    #[error("Auxiliary thread registry is not initialized")]
    NotInitialized,

    /// Space for a new registry entry could not be reserved.
    #[error("Failed to allocate registry entry: {0}")]
    Allocation(String),

    /// The calling thread already has a live child and the policy rejects overwriting it.
    #[error("Worker {previous} is still running for this parent")]
    ChildStillRunning {
        /// The child that is still registered.
        previous: WorkerId,
    },

    /// Joining a worker failed after cancellation was requested.
    #[error("Failed to join worker {worker}: {message}")]
    Join {
        /// The worker being joined.
        worker: WorkerId,
        /// What went wrong.
        message: String,
    },

    /// The last cleanup found entries belonging to other parents.
    #[error("Registry torn down with {live_entries} live entries")]
    Teardown {
        /// Entries that were still registered.
        live_entries: usize,
    },

    /// The OS refused to start a thread.
    #[error("Failed to spawn worker '{name}': {source}")]
    Spawn {
        /// The requested thread name.
        name: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Every task thread slot is occupied.
    #[error("Too many task threads (limit {limit})")]
    TooManyThreads {
        /// The configured slot count.
        limit: usize,
    },

    /// A routine name could not be resolved.
    #[error("No such routine: {0}")]
    NoSuchRoutine(String),

    /// A task thread slot is not active.
    #[error("No such task thread: {0}")]
    NoSuchThread(usize),

    /// An RPC call did not finish in time.
    #[error("RPC call '{name}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The call name.
        name: String,
        /// The timeout that expired.
        timeout_ms: u64,
    },

    /// The worker was cancelled before producing a result.
    #[error("Worker cancelled: {0}")]
    Cancelled(String),

    /// The worker went away without publishing a result.
    #[error("Worker {0} exited without a result")]
    WorkerLost(WorkerId),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuxThreadError {
    /// Maps the error onto the flat status code namespace.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::TooManyThreads { .. } => ErrorCode::TooMany,
            Self::NoSuchRoutine(_) | Self::NoSuchThread(_) => ErrorCode::NoEntry,
            Self::Timeout { .. } => ErrorCode::TimedOut,
            _ => ErrorCode::GenericFailure,
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<serde_json::Error> for AuxThreadError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}
