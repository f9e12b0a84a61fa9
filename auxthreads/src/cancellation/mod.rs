//! Cooperative cancellation for worker threads.
//!
//! This module provides:
//! - CancellationToken for requesting cancellation and waiting on it
//! - CleanupStack for LIFO handlers run when a worker is cancelled

mod cleanup;
mod token;

pub use cleanup::CleanupStack;
pub use token::{Cancelled, CancellationToken};
