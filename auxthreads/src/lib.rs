//! # auxthreads
//!
//! Auxiliary-thread manager for a Unix Test Agent.
//!
//! RPC calls arriving at a Test Agent may block indefinitely, so each one
//! runs on a short-lived worker thread that the dispatcher can stop:
//!
//! - **Registry**: process-wide map from parent thread to its latest worker,
//!   with an init/cleanup reference count
//! - **Workers**: threads running a user body to completion or to the next
//!   cancellation point
//! - **Sessions**: dispatcher-side wrapper with per-call timeouts
//! - **Task thread pool**: fixed set of controller-started routine threads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use auxthreads::prelude::*;
//! use std::time::Duration;
//!
//! # fn main() -> auxthreads::errors::Result<()> {
//! let mut session = RpcSession::open(AuxThreadConfig::new())?;
//!
//! let value = session.call_with_timeout("compute", Duration::from_secs(1), |point| {
//!     point.checkpoint()?;
//!     Ok(21 * 2)
//! })?;
//! assert_eq!(value, 42);
//!
//! session.close()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod errors;
pub mod observability;
pub mod pool;
pub mod registry;
pub mod session;
pub mod worker;


/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{Cancelled, CancellationToken, CleanupStack};
    pub use crate::config::{AuxThreadConfig, OverwritePolicy};
    pub use crate::errors::{AuxThreadError, ErrorCode};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::pool::{ReadySignal, RoutineTable, TaskThreadPool};
    pub use crate::registry::{AuxThreadRegistry, RegistryEntryInfo};
    pub use crate::session::{CallId, RpcSession};
    pub use crate::worker::{
        spawn_registered, spawn_worker, CancelPoint, JoinOutcome, WorkerExit, WorkerHandle,
        WorkerId, WorkerResult,
    };
}
