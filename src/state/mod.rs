//! Process-wide queue state.
//!
//! The host core drives the task subsystem through the free functions in the
//! crate root, which all operate on one process-wide queue. That queue lives
//! here, behind an `OnceLock<Mutex<...>>`.
//!
//! `Option<Context>` encodes the init/deinit lifecycle: `None` means
//! uninitialized (every operation except `deinit` is a contract violation),
//! `Some` holds either the direct queue or the handle to the worker thread.

use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::queue::TaskQueue;
use crate::worker::Worker;

pub(crate) enum Context {
    /// Single-threaded cooperative mode: ticks run on whatever thread calls
    /// `check()`.
    Direct(TaskQueue),
    /// Threaded mode: a dedicated worker drains the queue at frame cadence;
    /// `check()` from the host thread is only a wakeup.
    Threaded(Worker),
}

static CONTEXT: OnceLock<Mutex<Option<Context>>> = OnceLock::new();

/// Lock the process-wide context.
///
/// Poisoning is recovered: a contract assertion that fired while the lock was
/// held must not wedge the queue for the rest of the process.
pub(crate) fn lock() -> MutexGuard<'static, Option<Context>> {
    CONTEXT
        .get_or_init(|| Mutex::new(None))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
