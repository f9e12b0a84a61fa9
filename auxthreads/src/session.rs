//! RPC server session: the dispatcher side of cancellable calls.
//!
//! Opening a session takes a reference on the registry; every call runs on
//! a freshly spawned worker registered under the session's thread; closing
//! the session releases the reference and reaps whatever worker is still
//! registered. A session is bound to the thread that opened it.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info_span, warn};
use uuid::Uuid;

use crate::cancellation::Cancelled;
use crate::config::AuxThreadConfig;
use crate::errors::{AuxThreadError, Result};
use crate::registry::AuxThreadRegistry;
use crate::worker::{spawn_registered, CancelPoint, WorkerExit, WorkerHandle};

/// Identifier attached to every call for log correlation.
pub type CallId = Uuid;

enum SessionRegistry {
    Global,
    Shared(Arc<AuxThreadRegistry>),
}

impl SessionRegistry {
    fn get(&self) -> &AuxThreadRegistry {
        match self {
            Self::Global => AuxThreadRegistry::global(),
            Self::Shared(registry) => registry.as_ref(),
        }
    }
}

/// A dispatcher session on the current thread.
pub struct RpcSession {
    registry: SessionRegistry,
    config: AuxThreadConfig,
    last_worker: Option<WorkerHandle>,
    closed: bool,
    /// Cleanup is keyed by the opening thread, so the session must stay on it.
    _not_send: PhantomData<*const ()>,
}

impl RpcSession {
    /// Opens a session on the process-wide registry.
    pub fn open(config: AuxThreadConfig) -> Result<Self> {
        Self::open_with(SessionRegistry::Global, config)
    }

    /// Opens a session on a specific registry.
    pub fn open_in(registry: Arc<AuxThreadRegistry>, config: AuxThreadConfig) -> Result<Self> {
        Self::open_with(SessionRegistry::Shared(registry), config)
    }

    fn open_with(registry: SessionRegistry, config: AuxThreadConfig) -> Result<Self> {
        registry.get().init()?;
        debug!("RPC session opened");
        Ok(Self {
            registry,
            config,
            last_worker: None,
            closed: false,
            _not_send: PhantomData,
        })
    }

    /// The session configuration.
    #[must_use]
    pub fn config(&self) -> &AuxThreadConfig {
        &self.config
    }

    /// The worker started by the latest call.
    #[must_use]
    pub fn last_worker(&self) -> Option<&WorkerHandle> {
        self.last_worker.as_ref()
    }

    /// Runs `body` on a cancellable worker, using the configured timeout.
    pub fn call<T, F>(&mut self, name: &str, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelPoint) -> Result<T, Cancelled> + Send + 'static,
    {
        let timeout = self.config.call_timeout();
        self.run(name, timeout, body)
    }

    /// Runs `body` on a cancellable worker, waiting at most `timeout`.
    ///
    /// On expiry the worker stays registered; it is reaped by the next
    /// call, by [`abort`](Self::abort) or by [`close`](Self::close).
    pub fn call_with_timeout<T, F>(&mut self, name: &str, timeout: Duration, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelPoint) -> Result<T, Cancelled> + Send + 'static,
    {
        self.run(name, Some(timeout), body)
    }

    fn run<T, F>(&mut self, name: &str, timeout: Option<Duration>, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelPoint) -> Result<T, Cancelled> + Send + 'static,
    {
        let call_id: CallId = Uuid::new_v4();
        let span = info_span!("rpc_call", %call_id, name);
        let _enter = span.enter();

        // The registry only remembers one child per parent
        if let Some(previous) = self.last_worker.take() {
            reap_unregistered(&previous, "superseded by a new call");
        }

        let (worker, result) = spawn_registered(self.registry.get(), &self.config, name, body)?;
        self.last_worker = Some(worker.clone());

        let received = match timeout {
            Some(timeout) => result.recv_timeout(timeout),
            None => result.recv().map(Some),
        };
        let exit = match received {
            Ok(Some(exit)) => exit,
            Ok(None) => {
                warn!(worker_id = %worker.id(), "RPC call timed out");
                return Err(AuxThreadError::Timeout {
                    name: name.to_string(),
                    timeout_ms: timeout
                        .map_or(u64::MAX, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
                });
            }
            Err(lost) => {
                // No result means the body panicked; report the panic for this call
                worker.join()?;
                return Err(lost);
            }
        };

        worker.join()?;
        debug!(worker_id = %worker.id(), cancelled = exit.is_cancelled(), "RPC call finished");
        match exit {
            WorkerExit::Completed(value) => Ok(value),
            WorkerExit::Cancelled { reason } => Err(AuxThreadError::Cancelled(reason)),
        }
    }

    /// Cancels and joins the latest worker without closing the session.
    pub fn abort(&mut self, reason: &str) -> Result<()> {
        if let Some(worker) = self.last_worker.take() {
            worker.cancel_and_join(reason)?;
        }
        Ok(())
    }

    /// Closes the session, reaping the registered worker.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let registry = self.registry.get();
        let worker = self.last_worker.take();
        let registered = registry.current_child();
        let owned = worker.as_ref().map(WorkerHandle::id).filter(|id| registered == Some(*id));
        if let Some(worker) = worker.filter(|w| owned != Some(w.id())) {
            // Another session on this thread has replaced it in the registry
            reap_unregistered(&worker, "session closed");
        }

        let result = registry.cleanup_owned(owned);
        debug!(ok = result.is_ok(), "RPC session closed");
        result
    }
}

/// Cancels and joins a worker the registry no longer tracks for this session.
fn reap_unregistered(worker: &WorkerHandle, reason: &str) {
    if worker.is_reaped() {
        return;
    }
    if let Err(e) = worker.cancel_and_join(reason) {
        warn!(worker_id = %worker.id(), error = %e, "Failed to reap previous worker");
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!(error = %e, "Failed to close RPC session");
        }
    }
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("last_worker", &self.last_worker)
            .field("closed", &self.closed)
            .finish()
    }
}
