//! Process-wide table of auxiliary threads.
//!
//! Each parent thread (typically an RPC dispatcher) owns at most one entry
//! naming the latest worker it spawned. `cleanup` from that parent cancels
//! and joins the worker and removes the entry. An init/cleanup reference
//! count decides when the table itself is constructed and torn down.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::thread::{self, ThreadId};
use tracing::{debug, error, warn};

use crate::config::OverwritePolicy;
use crate::errors::{AuxThreadError, Result};
use crate::worker::{WorkerHandle, WorkerId};

static GLOBAL: OnceLock<AuxThreadRegistry> = OnceLock::new();

struct RegistryEntry {
    child: WorkerHandle,
    registered_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    ref_count: usize,
    entries: HashMap<ThreadId, RegistryEntry>,
}

/// A point-in-time view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntryInfo {
    /// Debug rendering of the parent thread id.
    pub parent: String,
    /// The registered child.
    pub child: WorkerId,
    /// The child's thread name.
    pub child_name: String,
    /// When the child was registered.
    pub registered_at: DateTime<Utc>,
    /// Whether the child has left its body.
    pub finished: bool,
}

/// Registry mapping parent threads to their latest child worker.
///
/// The table is built lazily by the first [`init`](Self::init) and dropped
/// by the [`cleanup`](Self::cleanup) that brings the reference count back
/// to zero; a later `init` starts from a fresh table.
#[derive(Default)]
pub struct AuxThreadRegistry {
    state: Mutex<Option<RegistryState>>,
    policy: RwLock<OverwritePolicy>,
}

impl AuxThreadRegistry {
    /// Creates an uninitialised registry with the default overwrite policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an uninitialised registry with the given overwrite policy.
    #[must_use]
    pub fn with_policy(policy: OverwritePolicy) -> Self {
        Self {
            state: Mutex::new(None),
            policy: RwLock::new(policy),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(Self::new)
    }

    /// Returns the overwrite policy.
    #[must_use]
    pub fn overwrite_policy(&self) -> OverwritePolicy {
        *self.policy.read()
    }

    /// Changes the overwrite policy for later registrations.
    pub fn set_overwrite_policy(&self, policy: OverwritePolicy) {
        *self.policy.write() = policy;
    }

    /// Takes a reference on the registry, constructing it if needed.
    pub fn init(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.get_or_insert_with(|| {
            debug!("Constructing auxiliary thread registry");
            RegistryState::default()
        });

        state.ref_count = state.ref_count.checked_add(1).ok_or_else(|| {
            error!("Auxiliary thread registry reference count overflow");
            AuxThreadError::Allocation("reference count overflow".to_string())
        })?;

        debug!(ref_count = state.ref_count, "Auxiliary thread registry initialized");
        Ok(())
    }

    /// Records `child` as the calling thread's current worker.
    ///
    /// The first registration from a parent inserts an entry; later ones
    /// replace its child according to the registry's overwrite policy.
    /// Under [`OverwritePolicy::Keep`] the previous child is left untouched
    /// and must already have been joined by the caller.
    pub fn register_child(&self, child: &WorkerHandle) -> Result<()> {
        self.register_child_with_policy(child, self.overwrite_policy())
    }

    /// Records `child` as the calling thread's current worker under `policy`.
    ///
    /// An `Err` means `child` was not registered. Under
    /// [`OverwritePolicy::CancelPrevious`] the new child is registered
    /// before the displaced one is reaped, so a displaced child that
    /// panicked is logged and does not fail the registration.
    pub fn register_child_with_policy(
        &self,
        child: &WorkerHandle,
        policy: OverwritePolicy,
    ) -> Result<()> {
        let parent = thread::current().id();

        let displaced = {
            let mut guard = self.state.lock();
            let Some(state) = guard.as_mut() else {
                error!(worker_id = %child.id(), "Cannot register worker: registry not initialized");
                return Err(AuxThreadError::NotInitialized);
            };

            if let Some(entry) = state.entries.get_mut(&parent) {
                let previous = &entry.child;
                if previous.id() == child.id() {
                    return Ok(());
                }
                if policy == OverwritePolicy::Reject && !previous.is_finished() {
                    warn!(
                        previous = %previous.id(),
                        worker_id = %child.id(),
                        "Rejecting registration: previous worker still running"
                    );
                    return Err(AuxThreadError::ChildStillRunning {
                        previous: previous.id(),
                    });
                }

                let previous = std::mem::replace(&mut entry.child, child.clone());
                entry.registered_at = Utc::now();
                debug!(
                    ?parent,
                    previous = %previous.id(),
                    worker_id = %child.id(),
                    "Replaced registered worker"
                );
                (policy == OverwritePolicy::CancelPrevious).then_some(previous)
            } else {
                state.entries.try_reserve(1).map_err(|e| {
                    error!(?parent, error = %e, "Failed to allocate registry entry");
                    AuxThreadError::Allocation(e.to_string())
                })?;
                state.entries.insert(
                    parent,
                    RegistryEntry {
                        child: child.clone(),
                        registered_at: Utc::now(),
                    },
                );
                debug!(?parent, worker_id = %child.id(), "Registered worker");
                None
            }
        };

        if let Some(previous) = displaced {
            if let Err(e) = cancel_child(Some(&previous)) {
                warn!(
                    previous = %previous.id(),
                    worker_id = %child.id(),
                    error = %e,
                    "Displaced worker failed; new worker stays registered"
                );
            }
        }
        Ok(())
    }

    /// Drops a reference, cancelling and joining the calling thread's worker.
    ///
    /// The entry is removed and, on the last reference, the table torn down
    /// before any join happens, so a stuck worker only blocks this caller.
    /// A failure to reap the worker is returned but never keeps the entry
    /// or the table alive. Tearing down while other parents still have an
    /// unreaped worker registered reaps them and reports
    /// [`AuxThreadError::Teardown`].
    pub fn cleanup(&self) -> Result<()> {
        self.release(|_| true)
    }

    /// Drops a reference, reaping the calling thread's worker only if it is `owned`.
    ///
    /// For callers sharing a thread with other owners of its entry: a child
    /// registered by someone else on this thread stays registered unless
    /// this is the last reference, in which case the table is torn down as
    /// in [`cleanup`](Self::cleanup).
    pub fn cleanup_owned(&self, owned: Option<WorkerId>) -> Result<()> {
        self.release(|child| Some(child) == owned)
    }

    fn release(&self, owns: impl Fn(WorkerId) -> bool) -> Result<()> {
        let parent = thread::current().id();

        let (removed, last, orphans) = {
            let mut guard = self.state.lock();
            let Some(state) = guard.as_mut() else {
                error!("Cannot clean up: auxiliary thread registry not initialized");
                return Err(AuxThreadError::NotInitialized);
            };

            state.ref_count = state.ref_count.saturating_sub(1);
            let last = state.ref_count == 0;
            let reap_own = state
                .entries
                .get(&parent)
                .is_some_and(|entry| last || owns(entry.child.id()));
            let removed = if reap_own {
                state.entries.remove(&parent)
            } else {
                None
            };
            debug!(ref_count = state.ref_count, ?parent, "Auxiliary thread registry cleanup");

            let orphans: Vec<RegistryEntry> = if last {
                guard
                    .take()
                    .map(|s| s.entries.into_values().collect())
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            (removed, last, orphans)
        };

        let mut result = cancel_child(removed.as_ref().map(|entry| &entry.child));

        if last {
            let live: Vec<&RegistryEntry> =
                orphans.iter().filter(|entry| !entry.child.is_reaped()).collect();
            if !live.is_empty() {
                let live_entries = live.len();
                error!(live_entries, "Auxiliary thread registry torn down with live entries");
                for orphan in live {
                    if let Err(e) = cancel_child(Some(&orphan.child)) {
                        warn!(
                            worker_id = %orphan.child.id(),
                            error = %e,
                            "Failed to reap orphaned worker"
                        );
                    }
                }
                if result.is_ok() {
                    result = Err(AuxThreadError::Teardown { live_entries });
                }
            }
            debug!("Auxiliary thread registry torn down");
        }

        result
    }

    /// Returns the live reference count, zero when not initialised.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.ref_count)
    }

    /// Returns whether the table currently exists.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.entries.len())
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the child registered by `parent`.
    #[must_use]
    pub fn child_of(&self, parent: ThreadId) -> Option<WorkerId> {
        self.state
            .lock()
            .as_ref()
            .and_then(|s| s.entries.get(&parent))
            .map(|entry| entry.child.id())
    }

    /// Returns the child registered by the calling thread.
    #[must_use]
    pub fn current_child(&self) -> Option<WorkerId> {
        self.child_of(thread::current().id())
    }

    /// Returns a snapshot of all entries, ordered by child id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RegistryEntryInfo> {
        let guard = self.state.lock();
        let mut entries: Vec<RegistryEntryInfo> = guard
            .as_ref()
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(parent, entry)| RegistryEntryInfo {
                        parent: format!("{parent:?}"),
                        child: entry.child.id(),
                        child_name: entry.child.name().to_string(),
                        registered_at: entry.registered_at,
                        finished: entry.child.is_finished(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by_key(|e| e.child);
        entries
    }
}

impl std::fmt::Debug for AuxThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.state.lock();
        f.debug_struct("AuxThreadRegistry")
            .field("initialized", &guard.is_some())
            .field("ref_count", &guard.as_ref().map_or(0, |s| s.ref_count))
            .field("entries", &guard.as_ref().map_or(0, |s| s.entries.len()))
            .field("policy", &*self.policy.read())
            .finish()
    }
}

/// Cancels and joins a child. No child, or one already reaped, is success.
fn cancel_child(child: Option<&WorkerHandle>) -> Result<()> {
    let Some(child) = child else {
        return Ok(());
    };

    child.cancel_and_join("parent cleanup").map(|_| ()).map_err(|e| {
        error!(worker_id = %child.id(), error = %e, "Failed to cancel auxiliary thread");
        e
    })
}

/// Takes a reference on the process-wide registry.
pub fn init() -> Result<()> {
    AuxThreadRegistry::global().init()
}

/// Registers `child` with the process-wide registry for the calling thread.
pub fn register_child(child: &WorkerHandle) -> Result<()> {
    AuxThreadRegistry::global().register_child(child)
}

/// Drops a reference on the process-wide registry, reaping the calling thread's worker.
pub fn cleanup() -> Result<()> {
    AuxThreadRegistry::global().cleanup()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::Cancelled;
    use crate::config::AuxThreadConfig;
    use crate::worker::{spawn_worker, WorkerExit};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn blocked_worker(name: &str) -> (WorkerHandle, crate::worker::WorkerResult<()>) {
        spawn_worker(&AuxThreadConfig::new(), name, |point| -> Result<(), Cancelled> {
            Err(point.wait_cancelled())
        })
        .unwrap()
    }

    #[test]
    fn test_uninitialized_operations_fail() {
        let registry = AuxThreadRegistry::new();
        let (worker, _result) = blocked_worker("orphan");

        assert!(matches!(
            registry.register_child(&worker),
            Err(AuxThreadError::NotInitialized)
        ));
        assert!(matches!(registry.cleanup(), Err(AuxThreadError::NotInitialized)));

        worker.cancel_and_join("test done").unwrap();
    }

    #[test]
    fn test_init_constructs_and_counts() {
        let registry = AuxThreadRegistry::new();
        assert!(!registry.is_initialized());
        assert_eq!(registry.ref_count(), 0);

        registry.init().unwrap();
        assert!(registry.is_initialized());
        assert_eq!(registry.ref_count(), 1);
        assert!(registry.is_empty());

        registry.cleanup().unwrap();
        assert!(!registry.is_initialized());
    }

    #[test]
    fn test_reinit_after_teardown() {
        let registry = AuxThreadRegistry::new();
        registry.init().unwrap();
        registry.cleanup().unwrap();

        registry.init().unwrap();
        let (worker, _result) = blocked_worker("again");
        registry.register_child(&worker).unwrap();
        assert_eq!(registry.len(), 1);

        registry.cleanup().unwrap();
        assert!(worker.is_reaped());
        assert!(!registry.is_initialized());
    }

    #[test]
    fn test_register_then_cleanup_cancels_child() {
        let registry = AuxThreadRegistry::new();
        registry.init().unwrap();

        let (worker, result) = blocked_worker("blocked");
        registry.register_child(&worker).unwrap();
        assert_eq!(registry.current_child(), Some(worker.id()));

        registry.cleanup().unwrap();
        assert_eq!(
            result.recv().unwrap(),
            WorkerExit::Cancelled {
                reason: "parent cleanup".to_string()
            }
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregistering_same_child_is_noop() {
        let registry = AuxThreadRegistry::with_policy(OverwritePolicy::Reject);
        registry.init().unwrap();

        let (worker, _result) = blocked_worker("same");
        registry.register_child(&worker).unwrap();
        registry.register_child(&worker).unwrap();
        assert_eq!(registry.len(), 1);

        registry.cleanup().unwrap();
    }

    #[test]
    fn test_reject_policy() {
        let registry = AuxThreadRegistry::with_policy(OverwritePolicy::Reject);
        registry.init().unwrap();

        let (first, _r1) = blocked_worker("first");
        let (second, _r2) = blocked_worker("second");
        registry.register_child(&first).unwrap();

        let err = registry.register_child(&second).unwrap_err();
        assert!(matches!(
            err,
            AuxThreadError::ChildStillRunning { previous } if previous == first.id()
        ));
        assert_eq!(registry.current_child(), Some(first.id()));

        second.cancel_and_join("test").unwrap();
        registry.cleanup().unwrap();
        assert!(first.is_reaped());
    }

    #[test]
    fn test_reject_policy_allows_after_exit() {
        let registry = AuxThreadRegistry::with_policy(OverwritePolicy::Reject);
        registry.init().unwrap();

        let (first, r1) =
            spawn_worker(&AuxThreadConfig::new(), "quick", |_| Ok(())).unwrap();
        registry.register_child(&first).unwrap();
        r1.recv().unwrap();
        first.join().unwrap();

        let (second, _r2) = blocked_worker("next");
        registry.register_child(&second).unwrap();
        assert_eq!(registry.current_child(), Some(second.id()));

        registry.cleanup().unwrap();
    }

    #[test]
    fn test_cancel_previous_policy() {
        let registry = AuxThreadRegistry::with_policy(OverwritePolicy::CancelPrevious);
        registry.init().unwrap();

        let (first, r1) = blocked_worker("first");
        let (second, _r2) = blocked_worker("second");
        registry.register_child(&first).unwrap();
        registry.register_child(&second).unwrap();

        assert!(r1.recv().unwrap().is_cancelled());
        assert!(first.is_reaped());
        assert_eq!(registry.current_child(), Some(second.id()));

        registry.cleanup().unwrap();
        assert!(second.is_reaped());
    }

    #[test]
    fn test_cancel_previous_with_panicked_child_keeps_new_child() {
        let registry = AuxThreadRegistry::with_policy(OverwritePolicy::CancelPrevious);
        registry.init().unwrap();

        let (first, r1) =
            spawn_worker(&AuxThreadConfig::new(), "panics", |_| -> Result<(), Cancelled> {
                panic!("body failed")
            })
            .unwrap();
        registry.register_child(&first).unwrap();
        assert!(matches!(r1.recv(), Err(AuxThreadError::WorkerLost(id)) if id == first.id()));

        let (second, r2) = blocked_worker("second");
        registry.register_child(&second).unwrap();
        assert!(first.is_reaped());
        assert_eq!(registry.current_child(), Some(second.id()));

        registry.cleanup().unwrap();
        assert!(r2.recv().unwrap().is_cancelled());
        assert!(second.is_reaped());
    }

    #[test]
    fn test_explicit_policy_overrides_registry_policy() {
        let registry = AuxThreadRegistry::new();
        registry.init().unwrap();

        let (first, _r1) = blocked_worker("first");
        let (second, _r2) = blocked_worker("second");
        registry.register_child(&first).unwrap();

        let err = registry
            .register_child_with_policy(&second, OverwritePolicy::Reject)
            .unwrap_err();
        assert!(matches!(
            err,
            AuxThreadError::ChildStillRunning { previous } if previous == first.id()
        ));
        assert_eq!(registry.overwrite_policy(), OverwritePolicy::Keep);

        second.cancel_and_join("test").unwrap();
        registry.cleanup().unwrap();
        assert!(first.is_reaped());
    }

    #[test]
    fn test_cleanup_without_entry() {
        let registry = AuxThreadRegistry::new();
        registry.init().unwrap();
        registry.init().unwrap();

        registry.cleanup().unwrap();
        assert_eq!(registry.ref_count(), 1);
        registry.cleanup().unwrap();
        assert_eq!(registry.ref_count(), 0);
    }

    #[test]
    fn test_cleanup_only_removes_own_entry() {
        let registry = std::sync::Arc::new(AuxThreadRegistry::new());
        registry.init().unwrap();
        registry.init().unwrap();

        let (own, _r_own) = blocked_worker("own");
        registry.register_child(&own).unwrap();

        let (other, _r_other) = blocked_worker("other");
        let other_parent = {
            let registry = registry.clone();
            let other = other.clone();
            thread::spawn(move || {
                registry.register_child(&other).unwrap();
                thread::current().id()
            })
            .join()
            .unwrap()
        };
        assert_eq!(registry.len(), 2);

        registry.cleanup().unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.child_of(other_parent), Some(other.id()));
        assert!(!other.is_reaped());

        // An orphan its spawner already reaped is not a live entry
        other.cancel_and_join("test done").unwrap();
        registry.cleanup().unwrap();
        assert!(!registry.is_initialized());
    }

    #[test]
    fn test_cleanup_owned_leaves_foreign_child() {
        let registry = AuxThreadRegistry::new();
        registry.init().unwrap();
        registry.init().unwrap();

        let (worker, result) = blocked_worker("shared-thread");
        registry.register_child(&worker).unwrap();

        registry.cleanup_owned(Some(WorkerId::from_raw(u64::MAX))).unwrap();
        assert_eq!(registry.ref_count(), 1);
        assert_eq!(registry.current_child(), Some(worker.id()));
        assert!(!worker.is_cancelled());

        registry.cleanup_owned(None).unwrap();
        assert!(result.recv().unwrap().is_cancelled());
        assert!(worker.is_reaped());
        assert!(!registry.is_initialized());
    }

    #[test]
    fn test_cleanup_owned_reaps_own_child() {
        let registry = AuxThreadRegistry::new();
        registry.init().unwrap();
        registry.init().unwrap();

        let (worker, result) = blocked_worker("mine");
        registry.register_child(&worker).unwrap();

        registry.cleanup_owned(Some(worker.id())).unwrap();
        assert!(result.recv().unwrap().is_cancelled());
        assert!(registry.is_empty());
        assert_eq!(registry.ref_count(), 1);
        registry.cleanup().unwrap();
    }

    #[test]
    fn test_teardown_with_live_entries_reports_failure() {
        let registry = std::sync::Arc::new(AuxThreadRegistry::new());
        registry.init().unwrap();

        let (other, other_result) = blocked_worker("stray");
        {
            let registry = registry.clone();
            let other = other.clone();
            thread::spawn(move || registry.register_child(&other).unwrap())
                .join()
                .unwrap();
        }

        let err = registry.cleanup().unwrap_err();
        assert!(matches!(err, AuxThreadError::Teardown { live_entries: 1 }));
        assert!(!registry.is_initialized());
        assert!(other_result.recv().unwrap().is_cancelled());
        assert!(other.is_reaped());
    }

    #[test]
    fn test_panicked_child_reports_join_failure() {
        let registry = AuxThreadRegistry::new();
        registry.init().unwrap();

        let (worker, _result) =
            spawn_worker(&AuxThreadConfig::new(), "panics", |_| -> Result<(), Cancelled> {
                panic!("body failed")
            })
            .unwrap();
        registry.register_child(&worker).unwrap();
        thread::sleep(Duration::from_millis(10));

        let err = registry.cleanup().unwrap_err();
        assert!(matches!(err, AuxThreadError::Join { .. }));
        assert!(!registry.is_initialized());
    }

    #[test]
    fn test_snapshot() {
        let registry = AuxThreadRegistry::new();
        assert!(registry.snapshot().is_empty());
        registry.init().unwrap();

        let (worker, _result) = blocked_worker("snap");
        registry.register_child(&worker).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].child, worker.id());
        assert_eq!(snapshot[0].child_name, "ta-aux-snap");
        assert!(!snapshot[0].finished);

        registry.cleanup().unwrap();
    }

    #[test]
    fn test_global_functions() {
        init().unwrap();
        let (worker, result) = blocked_worker("global");
        register_child(&worker).unwrap();
        assert_eq!(AuxThreadRegistry::global().current_child(), Some(worker.id()));

        cleanup().unwrap();
        assert!(result.recv().unwrap().is_cancelled());
        assert_eq!(AuxThreadRegistry::global().current_child(), None);
    }
}
