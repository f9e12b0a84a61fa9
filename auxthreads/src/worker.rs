//! Cancellable worker threads.
//!
//! A worker runs one user-supplied body on its own OS thread. The body
//! receives a [`CancelPoint`] and is expected to pass through it
//! (`checkpoint`, `sleep`, `wait_cancelled`) often enough for a pending
//! cancellation to take effect. Whoever holds a [`WorkerHandle`] can
//! request cancellation and join the thread; the result of the body is
//! published through the [`WorkerResult`] returned at spawn time.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use crate::cancellation::{CancellationToken, Cancelled, CleanupStack};
use crate::config::AuxThreadConfig;
use crate::errors::{AuxThreadError, Result};
use crate::registry::AuxThreadRegistry;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique worker identifier. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(u64);

impl WorkerId {
    fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw identifier.
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// How a worker body ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit<T> {
    /// The body ran to completion.
    Completed(T),
    /// The body stopped at a cancellation point.
    Cancelled {
        /// The reason given when cancellation was requested.
        reason: String,
    },
}

impl<T> WorkerExit<T> {
    /// Returns true if the body was cancelled.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Converts into the completed value, mapping cancellation to an error.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Cancelled { reason } => Err(AuxThreadError::Cancelled(reason)),
        }
    }
}

/// Outcome of joining a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The thread was joined by this call.
    Joined,
    /// Another caller already reaped the thread.
    AlreadyReaped,
}

/// The worker's view of its own cancellation state.
pub struct CancelPoint {
    worker: WorkerId,
    token: Arc<CancellationToken>,
    cleanup: CleanupStack,
}

impl CancelPoint {
    pub(crate) fn new(worker: WorkerId, token: Arc<CancellationToken>) -> Self {
        Self {
            worker,
            token,
            cleanup: CleanupStack::new(),
        }
    }

    /// The worker this cancellation point belongs to.
    #[must_use]
    pub const fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails if cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        self.token.check()
    }

    /// Sleeps for `duration`, waking early if cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        if self.token.wait_timeout(duration) {
            self.token.check()
        } else {
            Ok(())
        }
    }

    /// Blocks until cancellation is requested.
    pub fn wait_cancelled(&self) -> Cancelled {
        self.token.wait()
    }

    /// Pushes a handler run if the worker exits through cancellation.
    pub fn push_cleanup<F>(&self, name: &str, handler: F)
    where
        F: FnOnce() + 'static,
    {
        self.cleanup.push(handler, Some(name));
    }

    /// Pops the most recent cleanup handler, optionally running it.
    pub fn pop_cleanup(&self, execute: bool) -> bool {
        self.cleanup.pop(execute)
    }

    fn finish<T>(self, outcome: Result<T, Cancelled>) -> WorkerExit<T> {
        match outcome {
            Ok(value) => {
                let leftover = self.cleanup.pending_count();
                if leftover > 0 {
                    debug!(worker_id = %self.worker, leftover, "Discarding unpopped cleanup handlers");
                }
                WorkerExit::Completed(value)
            }
            Err(cancelled) => {
                let failures = self.cleanup.run_all();
                if !failures.is_empty() {
                    warn!(
                        worker_id = %self.worker,
                        failures = failures.len(),
                        "Cleanup handlers failed during cancellation"
                    );
                }
                WorkerExit::Cancelled {
                    reason: cancelled.reason,
                }
            }
        }
    }
}

impl std::fmt::Debug for CancelPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelPoint")
            .field("worker", &self.worker)
            .field("cancelled", &self.is_cancelled())
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

struct WorkerShared {
    id: WorkerId,
    name: String,
    started_at: DateTime<Utc>,
    token: Arc<CancellationToken>,
    finished: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a running or finished worker.
///
/// All clones share one join slot: the first `join` reaps the thread and
/// later ones report [`JoinOutcome::AlreadyReaped`].
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// The worker identifier.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    /// The worker thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// When the worker was spawned.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    /// The worker's cancellation token.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.shared.token
    }

    /// Requests cancellation. Returns true if this call requested it first.
    pub fn cancel(&self, reason: &str) -> bool {
        self.shared.token.cancel(reason)
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Returns whether the worker thread has left its body.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Returns whether the thread has been joined.
    #[must_use]
    pub fn is_reaped(&self) -> bool {
        self.shared.join.lock().is_none()
    }

    /// Joins the worker thread.
    ///
    /// Blocks until the body returns. A body that panicked is a join failure.
    pub fn join(&self) -> Result<JoinOutcome> {
        let handle = self.shared.join.lock().take();
        let Some(handle) = handle else {
            return Ok(JoinOutcome::AlreadyReaped);
        };

        handle.join().map_err(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            error!(worker_id = %self.id(), %message, "Worker join failed");
            AuxThreadError::Join {
                worker: self.id(),
                message,
            }
        })?;
        Ok(JoinOutcome::Joined)
    }

    /// Requests cancellation, then joins.
    ///
    /// A worker that has already been reaped counts as success.
    pub fn cancel_and_join(&self, reason: &str) -> Result<JoinOutcome> {
        self.cancel(reason);
        let outcome = self.join()?;
        match outcome {
            JoinOutcome::Joined => debug!(worker_id = %self.id(), "Worker cancelled and joined"),
            JoinOutcome::AlreadyReaped => {
                debug!(worker_id = %self.id(), "Worker already reaped");
            }
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Receiving end for a worker's exit value.
#[derive(Debug)]
pub struct WorkerResult<T> {
    worker: WorkerId,
    rx: Receiver<WorkerExit<T>>,
}

impl<T> WorkerResult<T> {
    /// The worker producing this result.
    #[must_use]
    pub const fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Blocks until the worker exits.
    pub fn recv(&self) -> Result<WorkerExit<T>> {
        self.rx
            .recv()
            .map_err(|_| AuxThreadError::WorkerLost(self.worker))
    }

    /// Waits at most `timeout`. Returns `None` if the worker is still running.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<WorkerExit<T>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(exit) => Ok(Some(exit)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(AuxThreadError::WorkerLost(self.worker)),
        }
    }

    /// Returns the exit value if it is already available.
    pub fn try_recv(&self) -> Result<Option<WorkerExit<T>>> {
        match self.rx.try_recv() {
            Ok(exit) => Ok(Some(exit)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(AuxThreadError::WorkerLost(self.worker)),
        }
    }
}

/// Sets the finished flag however the thread leaves its body.
struct FinishGuard(Arc<AtomicBool>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Spawns a worker thread running `body`.
pub fn spawn_worker<T, F>(
    config: &AuxThreadConfig,
    name: &str,
    body: F,
) -> Result<(WorkerHandle, WorkerResult<T>)>
where
    T: Send + 'static,
    F: FnOnce(&CancelPoint) -> Result<T, Cancelled> + Send + 'static,
{
    let id = WorkerId::next();
    let thread_name = format!("{}-{}", config.worker_name_prefix, name);
    let token = Arc::new(CancellationToken::new());
    let finished = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::sync_channel(1);

    let mut builder = std::thread::Builder::new().name(thread_name.clone());
    if let Some(stack_size) = config.worker_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let thread_token = token.clone();
    let thread_finished = finished.clone();
    let handle = builder
        .spawn(move || {
            let finish_guard = FinishGuard(thread_finished);
            let point = CancelPoint::new(id, thread_token);
            trace!(worker_id = %id, "Worker body starting");
            let outcome = body(&point);
            let exit = point.finish(outcome);
            // Finished must be visible before the result is sent
            drop(finish_guard);
            if exit.is_cancelled() {
                debug!(worker_id = %id, "Worker stopped at cancellation point");
            }
            if tx.send(exit).is_err() {
                trace!(worker_id = %id, "Result receiver dropped");
            }
        })
        .map_err(|source| {
            error!(name = %thread_name, error = %source, "Failed to spawn worker");
            AuxThreadError::Spawn {
                name: thread_name.clone(),
                source,
            }
        })?;

    debug!(worker_id = %id, name = %thread_name, "Worker spawned");

    let worker = WorkerHandle {
        shared: Arc::new(WorkerShared {
            id,
            name: thread_name,
            started_at: Utc::now(),
            token,
            finished,
            join: Mutex::new(Some(handle)),
        }),
    };

    Ok((worker, WorkerResult { worker: id, rx }))
}

/// Spawns a worker and registers it as the calling thread's child.
///
/// Registration follows `config.overwrite_policy`. If registration fails
/// the new worker is cancelled and joined before the error is returned, so
/// no unregistered worker is left behind.
pub fn spawn_registered<T, F>(
    registry: &AuxThreadRegistry,
    config: &AuxThreadConfig,
    name: &str,
    body: F,
) -> Result<(WorkerHandle, WorkerResult<T>)>
where
    T: Send + 'static,
    F: FnOnce(&CancelPoint) -> Result<T, Cancelled> + Send + 'static,
{
    let (worker, result) = spawn_worker(config, name, body)?;
    if let Err(e) = registry.register_child_with_policy(&worker, config.overwrite_policy) {
        if let Err(join_err) = worker.cancel_and_join("registration failed") {
            warn!(worker_id = %worker.id(), error = %join_err, "Failed to reap unregistered worker");
        }
        return Err(e);
    }
    Ok((worker, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverwritePolicy;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicUsize;

    fn config() -> AuxThreadConfig {
        AuxThreadConfig::new().with_worker_name_prefix("test")
    }

    #[test]
    fn test_worker_ids_unique_and_nonzero() {
        let a = WorkerId::next();
        let b = WorkerId::next();
        assert_ne!(a, b);
        assert_ne!(a.as_u64(), 0);
        assert_eq!(WorkerId::from_raw(9).to_string(), "worker-9");
    }

    #[test]
    fn test_worker_completes() {
        let (worker, result) = spawn_worker(&config(), "add", |_point| Ok(2 + 2)).unwrap();

        assert_eq!(result.recv().unwrap(), WorkerExit::Completed(4));
        assert_eq!(worker.join().unwrap(), JoinOutcome::Joined);
        assert!(worker.is_finished());
        assert!(worker.is_reaped());
        assert_eq!(worker.name(), "test-add");
    }

    #[test]
    fn test_worker_cancelled_at_wait() {
        let (worker, result) = spawn_worker(&config(), "wait", |point| -> Result<(), Cancelled> {
            Err(point.wait_cancelled())
        })
        .unwrap();

        assert_eq!(worker.cancel_and_join("shutdown").unwrap(), JoinOutcome::Joined);
        assert_eq!(
            result.recv().unwrap(),
            WorkerExit::Cancelled {
                reason: "shutdown".to_string()
            }
        );
    }

    #[test]
    fn test_sleep_interrupted_by_cancel() {
        let (worker, result) = spawn_worker(&config(), "sleep", |point| {
            point.sleep(Duration::from_secs(60))?;
            Ok("slept")
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(10));
        worker.cancel_and_join("timeout").unwrap();
        assert!(result.recv().unwrap().is_cancelled());
    }

    #[test]
    fn test_second_join_reports_reaped() {
        let (worker, _result) = spawn_worker(&config(), "noop", |_| Ok(())).unwrap();
        let clone = worker.clone();

        assert_eq!(worker.join().unwrap(), JoinOutcome::Joined);
        assert_eq!(clone.cancel_and_join("late").unwrap(), JoinOutcome::AlreadyReaped);
    }

    #[test]
    fn test_panicking_worker_is_join_failure() {
        let (worker, result) =
            spawn_worker(&config(), "boom", |_| -> Result<(), Cancelled> { panic!("boom") })
                .unwrap();

        let err = worker.join().unwrap_err();
        assert!(matches!(err, AuxThreadError::Join { ref message, .. } if message == "boom"));
        assert!(worker.is_finished());
        assert!(matches!(result.recv(), Err(AuxThreadError::WorkerLost(_))));
    }

    #[test]
    fn test_cleanup_handlers_run_on_cancel_only() {
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let (worker, result) = spawn_worker(&config(), "cleanup", move |point| {
            let c = counter.clone();
            point.push_cleanup("release", move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            point.wait_cancelled();
            point.checkpoint()?;
            Ok(())
        })
        .unwrap();

        worker.cancel_and_join("stop").unwrap();
        assert!(result.recv().unwrap().is_cancelled());
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let counter = ran.clone();
        let (worker, result) = spawn_worker(&config(), "no-cleanup", move |point| {
            let c = counter.clone();
            point.push_cleanup("release", move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            Ok(())
        })
        .unwrap();

        worker.join().unwrap();
        assert_eq!(result.recv().unwrap(), WorkerExit::Completed(()));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pop_cleanup_in_body() {
        let (worker, result) = spawn_worker(&config(), "pop", |point| {
            let ran = Rc::new(Cell::new(false));
            let flag = ran.clone();
            point.push_cleanup("flag", move || flag.set(true));
            assert!(point.pop_cleanup(true));
            Ok(ran.get())
        })
        .unwrap();

        worker.join().unwrap();
        assert_eq!(result.recv().unwrap(), WorkerExit::Completed(true));
    }

    #[test]
    fn test_recv_timeout_while_running() {
        let (worker, result) = spawn_worker(&config(), "slow", |point| {
            point.wait_cancelled();
            Ok(())
        })
        .unwrap();

        assert!(result.recv_timeout(Duration::from_millis(10)).unwrap().is_none());
        assert!(result.try_recv().unwrap().is_none());
        worker.cancel_and_join("done").unwrap();
        // Body ignored the cancellation and returned normally
        assert_eq!(result.recv().unwrap(), WorkerExit::Completed(()));
    }

    fn blocked_until_cancelled(
        done: mpsc::Sender<String>,
    ) -> impl FnOnce(&CancelPoint) -> Result<(), Cancelled> + Send + 'static {
        move |point| {
            let cancelled = point.wait_cancelled();
            let _ = done.send(cancelled.reason.clone());
            Err(cancelled)
        }
    }

    #[test]
    fn test_spawn_registered_applies_configured_policy() {
        let registry = AuxThreadRegistry::new();
        registry.init().unwrap();
        let config = config().with_overwrite_policy(OverwritePolicy::Reject);
        let (done_tx, done_rx) = mpsc::channel();

        let first_body = blocked_until_cancelled(done_tx.clone());
        let (first, _r1) = spawn_registered(&registry, &config, "first", first_body).unwrap();
        let second_body = blocked_until_cancelled(done_tx);
        let err = spawn_registered(&registry, &config, "second", second_body).unwrap_err();

        assert!(matches!(
            err,
            AuxThreadError::ChildStillRunning { previous } if previous == first.id()
        ));
        assert_eq!(registry.current_child(), Some(first.id()));
        // The rejected worker was cancelled and joined before the error came back
        assert_eq!(done_rx.try_recv().unwrap(), "registration failed");
        assert!(!first.is_cancelled());

        registry.cleanup().unwrap();
        assert_eq!(done_rx.recv().unwrap(), "parent cleanup");
        assert!(first.is_reaped());
    }

    #[test]
    fn test_spawn_registered_reaps_worker_when_uninitialized() {
        let registry = AuxThreadRegistry::new();
        let (done_tx, done_rx) = mpsc::channel();

        let body = blocked_until_cancelled(done_tx);
        let err = spawn_registered(&registry, &config(), "stray", body).unwrap_err();

        assert!(matches!(err, AuxThreadError::NotInitialized));
        assert_eq!(done_rx.try_recv().unwrap(), "registration failed");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_into_result() {
        assert_eq!(WorkerExit::Completed(1).into_result().unwrap(), 1);
        let err = WorkerExit::<i32>::Cancelled {
            reason: "x".to_string(),
        }
        .into_result()
        .unwrap_err();
        assert!(matches!(err, AuxThreadError::Cancelled(_)));
    }
}
