//! Task descriptors and per-task handles.
//!
//! Responsibilities:
//! - `TaskSpec`: immutable descriptor binding a per-tick action to an optional
//!   cleanup action. Constructing a spec performs no side effects; work begins
//!   only once the spec is pushed onto a queue and ticked.
//! - `TaskHandle`: the shared cancellation/finish flags for one live task.
//!   The queue passes the handle into the action on every tick; a clone of the
//!   same handle is returned from `push` so the host can cancel externally.
//!
//! Both flags are monotonic: once set, they stay set for the task's lifetime.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-tick unit of work. Invoked once per queue tick with the task's handle.
///
/// Returning `Err` is a task-body failure: the queue logs it, reports it to
/// the failure hook, and removes the task (cleanup still runs).
pub type TaskAction = Box<dyn FnMut(&TaskHandle) -> anyhow::Result<()> + Send>;

/// One-shot cleanup, invoked exactly once when the task leaves the queue,
/// whatever the removal reason (voluntary finish, cancellation, failure, or
/// queue teardown).
pub type TaskCleanup = Box<dyn FnOnce(&TaskHandle) -> anyhow::Result<()> + Send>;

#[derive(Debug, Default)]
struct TaskFlags {
    cancelled: AtomicBool,
    finished: AtomicBool,
}

/// Shared per-task state: the cooperative cancellation and finish flags.
///
/// Cheap to clone; all clones observe the same flags. The flags carry no data
/// dependencies of their own (queue mutation is separately synchronized), so
/// relaxed ordering is sufficient.
#[derive(Clone, Debug, Default)]
pub struct TaskHandle {
    flags: Arc<TaskFlags>,
}

impl TaskHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// True once `reset()` or external cancellation has been applied.
    ///
    /// Cancellation is cooperative: a cancelled task is never interrupted
    /// mid-action. It observes this flag on its next tick and is expected to
    /// flush whatever it needs to and return.
    pub fn is_cancelled(&self) -> bool {
        self.flags.cancelled.load(Ordering::Relaxed)
    }

    /// True once the task has requested removal via [`finish`](Self::finish).
    pub fn is_finished(&self) -> bool {
        self.flags.finished.load(Ordering::Relaxed)
    }

    /// Request cancellation of this task alone.
    ///
    /// The task keeps running until its next tick, where it sees
    /// `is_cancelled() == true` and is removed after that tick completes.
    pub fn cancel(&self) {
        self.flags.cancelled.store(true, Ordering::Relaxed);
    }

    /// Called from within the action to request removal after the current
    /// tick. The task is not ticked again; its cleanup runs before the next
    /// tick begins.
    pub fn finish(&self) {
        self.flags.finished.store(true, Ordering::Relaxed);
    }
}

/// Immutable descriptor for a periodic task: an action plus optional cleanup.
pub struct TaskSpec {
    name: Option<String>,
    pub(crate) action: TaskAction,
    pub(crate) cleanup: Option<TaskCleanup>,
}

impl TaskSpec {
    /// Bind an action. No code runs until the spec is pushed and ticked.
    pub fn new(action: impl FnMut(&TaskHandle) -> anyhow::Result<()> + Send + 'static) -> Self {
        Self {
            name: None,
            action: Box::new(action),
            cleanup: None,
        }
    }

    /// Like [`new`](Self::new), with a label used in log messages and failure
    /// reports. Anonymous tasks are logged by their queue-assigned id instead.
    pub fn named(
        name: impl Into<String>,
        action: impl FnMut(&TaskHandle) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            name: Some(name.into()),
            action: Box::new(action),
            cleanup: None,
        }
    }

    /// Attach a cleanup action, guaranteed to run exactly once when the task
    /// is removed from the queue.
    pub fn with_cleanup(
        mut self,
        cleanup: impl FnOnce(&TaskHandle) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish_non_exhaustive()
    }
}
