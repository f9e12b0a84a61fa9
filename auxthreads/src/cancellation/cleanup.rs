//! Cleanup handlers run when a worker is cancelled.

use parking_lot::Mutex;
use tracing::warn;

/// A cleanup handler, with optional name.
struct CleanupHandler {
    /// The handler function.
    handler: Box<dyn FnOnce()>,
    /// Optional name for the handler.
    name: Option<String>,
}

/// Stack of cleanup handlers executed in LIFO order.
///
/// Handlers are pushed while a worker acquires resources and popped once
/// it releases them itself. Whatever is still on the stack when the worker
/// exits through cancellation is run by [`run_all`](Self::run_all).
#[derive(Default)]
pub struct CleanupStack {
    handlers: Mutex<Vec<CleanupHandler>>,
}

impl CleanupStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a handler.
    pub fn push<F>(&self, handler: F, name: Option<&str>)
    where
        F: FnOnce() + 'static,
    {
        self.handlers.lock().push(CleanupHandler {
            handler: Box::new(handler),
            name: name.map(String::from),
        });
    }

    /// Pops the most recent handler, running it when `execute` is set.
    ///
    /// Returns false if the stack was empty.
    pub fn pop(&self, execute: bool) -> bool {
        let entry = self.handlers.lock().pop();
        match entry {
            Some(entry) => {
                if execute {
                    Self::run_one(entry);
                }
                true
            }
            None => false,
        }
    }

    /// Runs all handlers in LIFO order and empties the stack.
    ///
    /// A panicking handler is logged and the remaining ones still run.
    /// Returns `(name, message)` for every failure.
    pub fn run_all(&self) -> Vec<(String, String)> {
        let handlers = std::mem::take(&mut *self.handlers.lock());

        handlers
            .into_iter()
            .rev()
            .filter_map(Self::run_one)
            .collect()
    }

    /// Returns the number of pending handlers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.handlers.lock().len()
    }

    fn run_one(entry: CleanupHandler) -> Option<(String, String)> {
        let name = entry.name.unwrap_or_else(|| "<unnamed>".to_string());
        let handler = entry.handler;
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(handler)) {
            Ok(()) => None,
            Err(panic) => {
                let msg = format!("Cleanup handler panicked: {panic:?}");
                warn!("{}: {}", name, msg);
                Some((name, msg))
            }
        }
    }
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}
