//! Fixed-size pool of controller-started task threads.
//!
//! The controller starts long-running routines by name. Each one occupies
//! a slot until it returns; the slot index is the handle the controller
//! later uses to kill it. Starting blocks until the routine reports that it
//! has consumed its arguments.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cancellation::Cancelled;
use crate::config::AuxThreadConfig;
use crate::errors::{AuxThreadError, Result};
use crate::worker::{spawn_worker, CancelPoint, WorkerExit, WorkerHandle, WorkerResult};

/// A routine that can be started as a task thread.
pub type Routine =
    Arc<dyn Fn(&ReadySignal, &CancelPoint, &[String]) -> Result<i32, Cancelled> + Send + Sync>;

/// Lets a routine tell its starter that its arguments are processed.
pub struct ReadySignal {
    tx: Mutex<Option<SyncSender<()>>>,
}

impl ReadySignal {
    fn new(tx: SyncSender<()>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Releases the starter. Only the first call has an effect.
    pub fn signal(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for ReadySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadySignal")
            .field("signalled", &self.tx.lock().is_none())
            .finish()
    }
}

/// Routines available to the task thread pool, by name.
#[derive(Default)]
pub struct RoutineTable {
    routines: RwLock<HashMap<String, Routine>>,
}

impl RoutineTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a routine, replacing any routine with the same name.
    pub fn register<F>(&self, name: impl Into<String>, routine: F)
    where
        F: Fn(&ReadySignal, &CancelPoint, &[String]) -> Result<i32, Cancelled>
            + Send
            + Sync
            + 'static,
    {
        self.routines.write().insert(name.into(), Arc::new(routine));
    }

    /// Looks up a routine.
    pub fn resolve(&self, name: &str) -> Result<Routine> {
        self.routines
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AuxThreadError::NoSuchRoutine(name.to_string()))
    }

    /// Returns whether a routine is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.routines.read().contains_key(name)
    }

    /// Lists registered routine names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routines.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for RoutineTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutineTable")
            .field("routines", &self.names())
            .finish()
    }
}

struct TaskSlot {
    routine: String,
    worker: WorkerHandle,
    result: WorkerResult<i32>,
    exit: Option<WorkerExit<i32>>,
}

impl TaskSlot {
    fn poll_exit(&mut self) -> Option<&WorkerExit<i32>> {
        if self.exit.is_none() {
            match self.result.try_recv() {
                Ok(exit) => self.exit = exit,
                Err(e) => debug!(worker_id = %self.worker.id(), error = %e, "Task thread left no result"),
            }
        }
        self.exit.as_ref()
    }
}

/// Pool of task threads with a fixed number of slots.
pub struct TaskThreadPool {
    config: AuxThreadConfig,
    routines: Arc<RoutineTable>,
    slots: Mutex<Vec<Option<TaskSlot>>>,
}

impl TaskThreadPool {
    /// Creates a pool with `config.max_task_threads` slots.
    #[must_use]
    pub fn new(config: AuxThreadConfig, routines: Arc<RoutineTable>) -> Self {
        let slots = (0..config.max_task_threads).map(|_| None).collect();
        Self {
            config,
            routines,
            slots: Mutex::new(slots),
        }
    }

    /// The routine table used to resolve names.
    #[must_use]
    pub fn routines(&self) -> &Arc<RoutineTable> {
        &self.routines
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.max_task_threads
    }

    /// Starts `routine` in a free slot and returns the slot index.
    ///
    /// Returns once the routine has signalled readiness or exited.
    pub fn start_thread(&self, routine: &str, args: &[&str]) -> Result<usize> {
        let body = self.routines.resolve(routine)?;
        let args: Vec<String> = args.iter().map(|s| (*s).to_string()).collect();

        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(|slot| slot.as_ref().map_or(true, |s| s.worker.is_finished()))
            .ok_or_else(|| {
                warn!(routine, limit = self.capacity(), "No free task thread slot");
                AuxThreadError::TooManyThreads {
                    limit: self.capacity(),
                }
            })?;

        if let Some(stale) = slots[index].take() {
            if let Err(e) = stale.worker.join() {
                warn!(slot = index, routine = %stale.routine, error = %e, "Failed to reap finished task thread");
            }
        }

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (worker, result) = spawn_worker(&self.config, routine, move |point| {
            let ready = ReadySignal::new(ready_tx);
            body(&ready, point, &args)
        })?;

        // A disconnect means the routine returned without signalling.
        let _ = ready_rx.recv();

        info!(slot = index, routine, worker_id = %worker.id(), "Started task thread");
        slots[index] = Some(TaskSlot {
            routine: routine.to_string(),
            worker,
            result,
            exit: None,
        });
        Ok(index)
    }

    /// Cancels and joins the task thread in `slot`.
    pub fn kill_thread(&self, slot: usize) -> Result<()> {
        let task = self
            .slots
            .lock()
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or(AuxThreadError::NoSuchThread(slot))?;

        task.worker.cancel_and_join("killed").map_err(|e| {
            error!(slot, routine = %task.routine, error = %e, "Failed to kill task thread");
            e
        })?;
        info!(slot, routine = %task.routine, "Killed task thread");
        Ok(())
    }

    /// Cancels and joins every task thread, returning the first failure.
    pub fn kill_all(&self) -> Result<()> {
        let tasks: Vec<(usize, TaskSlot)> = {
            let mut slots = self.slots.lock();
            slots
                .iter_mut()
                .enumerate()
                .filter_map(|(i, slot)| slot.take().map(|t| (i, t)))
                .collect()
        };

        for (_, task) in &tasks {
            task.worker.cancel("pool shutdown");
        }

        let mut first_error = None;
        for (slot, task) in tasks {
            if let Err(e) = task.worker.join() {
                error!(slot, routine = %task.routine, error = %e, "Failed to join task thread");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Number of slots whose thread is still running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .flatten()
            .filter(|s| !s.worker.is_finished())
            .count()
    }

    /// Exit code of a finished task thread still occupying `slot`.
    ///
    /// `Ok(None)` while running or when the thread was cancelled.
    pub fn exit_code(&self, slot: usize) -> Result<Option<i32>> {
        let mut slots = self.slots.lock();
        let task = slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or(AuxThreadError::NoSuchThread(slot))?;

        Ok(match task.poll_exit() {
            Some(WorkerExit::Completed(code)) => Some(*code),
            _ => None,
        })
    }
}

impl Drop for TaskThreadPool {
    fn drop(&mut self) {
        if let Err(e) = self.kill_all() {
            error!(error = %e, "Failed to stop task threads");
        }
    }
}

impl std::fmt::Debug for TaskThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskThreadPool")
            .field("capacity", &self.capacity())
            .field("active", &self.active_count())
            .finish()
    }
}
