//! The cooperative task queue.
//!
//! Responsibilities:
//! - Own the ordered set of live tasks (insertion order preserved, so tick
//!   order is deterministic).
//! - Drive every live task forward by one tick per call to [`TaskQueue::check`].
//! - Contain task-body failures: an action or cleanup that errors or panics is
//!   logged, reported to the optional failure hook, and the task is dropped.
//!   One malfunctioning task never takes down the scheduler or its neighbours.
//!
//! `TaskQueue` is an explicit value, so tests (and embedders that want more
//! than one queue) can construct as many independent queues as they like. The
//! process-wide queue the host core drives lives in `crate::state` and is
//! reached through the free functions in the crate root.
//!
//! Tick mechanics:
//! - The live-at-tick-start entries are lifted out of the queue for the
//!   duration of the tick (`take_live`), survivors are reinstalled in order
//!   (`restore_live`), and entries pushed meanwhile land behind them. This is
//!   what makes push-during-iteration well-defined: a task pushed from within
//!   a running action is never ticked in the same tick.

use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::task::{TaskHandle, TaskSpec};

/// Details of a task-body failure, passed to the failure hook.
#[derive(Debug)]
pub struct TaskFailure {
    /// The label given via [`TaskSpec::named`], if any.
    pub name: Option<String>,
    /// What went wrong: the action's error, or a caught panic.
    pub error: anyhow::Error,
}

/// Callback invoked (in addition to logging) whenever a task's action or
/// cleanup fails. The host core typically surfaces these on the OSD.
pub type FailureHook = Box<dyn Fn(&TaskFailure) + Send + Sync>;

pub(crate) type FailureFn = dyn Fn(&TaskFailure) + Send + Sync;

/// One live task: its immutable spec plus its shared handle.
pub(crate) struct TaskEntry {
    id: u64,
    spec: TaskSpec,
    handle: TaskHandle,
}

impl TaskEntry {
    fn describe(&self) -> String {
        match self.spec.name() {
            Some(name) => format!("task \"{name}\""),
            None => format!("task #{}", self.id),
        }
    }

    /// Run the cleanup action, if any. Consumes the entry, so cleanup cannot
    /// run twice for one task.
    fn run_cleanup(mut self, hook: Option<&FailureFn>) {
        let Some(cleanup) = self.spec.cleanup.take() else {
            return;
        };
        let label = self.describe();
        match catch_unwind(AssertUnwindSafe(|| cleanup(&self.handle))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => report_failure(hook, self.spec.name(), &label, "cleanup", error),
            Err(payload) => {
                let error = anyhow::anyhow!("panic: {}", panic_message(&payload));
                report_failure(hook, self.spec.name(), &label, "cleanup", error);
            }
        }
    }
}

/// Force-run cleanup for a batch of entries, outside any queue.
///
/// Used at teardown, and by the crate-root facade when `deinit()` was called
/// from within a running action and the tick's survivors have no queue left
/// to return to.
pub(crate) fn drain_entries(entries: Vec<TaskEntry>, hook: Option<&FailureFn>) {
    for entry in entries {
        entry.run_cleanup(hook);
    }
}

fn report_failure(
    hook: Option<&FailureFn>,
    name: Option<&str>,
    label: &str,
    stage: &str,
    error: anyhow::Error,
) {
    log::error!("{label} {stage} failed: {error:#}");
    if let Some(hook) = hook {
        hook(&TaskFailure {
            name: name.map(str::to_string),
            error,
        });
    }
}

/// Best-effort extraction of a panic payload's message.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Advance every entry by one tick; return the entries that stay scheduled.
///
/// Runs with no queue lock held (the caller lifted `live` out first), so
/// actions are free to call back into the queue they came from.
pub(crate) fn run_tick(live: Vec<TaskEntry>, hook: Option<&FailureFn>) -> Vec<TaskEntry> {
    let mut survivors = Vec::with_capacity(live.len());

    for mut entry in live {
        let outcome = catch_unwind(AssertUnwindSafe(|| (entry.spec.action)(&entry.handle)));
        match outcome {
            Ok(Ok(())) => {
                // Removal is decided after the call, so a task cancelled via
                // `reset()` still gets one last tick to observe the flag and
                // flush its state.
                if entry.handle.is_finished() || entry.handle.is_cancelled() {
                    let why = if entry.handle.is_finished() {
                        "finished"
                    } else {
                        "cancelled"
                    };
                    log::trace!("{} left the queue ({why})", entry.describe());
                    entry.run_cleanup(hook);
                } else {
                    survivors.push(entry);
                }
            }
            Ok(Err(error)) => {
                report_failure(hook, entry.spec.name(), &entry.describe(), "action", error);
                entry.run_cleanup(hook);
            }
            Err(payload) => {
                let error = anyhow::anyhow!("panic: {}", panic_message(&payload));
                report_failure(hook, entry.spec.name(), &entry.describe(), "action", error);
                entry.run_cleanup(hook);
            }
        }
    }

    survivors
}

/// Ordered collection of live periodic tasks.
pub struct TaskQueue {
    entries: Vec<TaskEntry>,
    /// Handles of entries lifted out for an in-progress tick. `reset()` must
    /// still reach those tasks, and `is_empty()` must not report empty while
    /// they are out.
    in_flight: Vec<TaskHandle>,
    hook: Option<Arc<FailureFn>>,
    next_id: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            in_flight: Vec::new(),
            hook: None,
            next_id: 0,
        }
    }

    /// Like [`new`](Self::new), with a hook invoked on every task-body failure.
    pub fn with_failure_hook(hook: FailureHook) -> Self {
        let mut queue = Self::new();
        queue.hook = Some(Arc::from(hook));
        queue
    }

    /// Append a task at the back of the queue. Runs no code yet; the task is
    /// first ticked on the next call to [`check`](Self::check).
    ///
    /// The returned handle may be used for external cancellation.
    pub fn push(&mut self, spec: TaskSpec) -> TaskHandle {
        let handle = TaskHandle::new();
        let entry = TaskEntry {
            id: self.next_id,
            spec,
            handle: handle.clone(),
        };
        self.next_id += 1;
        log::trace!("{} pushed", entry.describe());
        self.entries.push(entry);
        handle
    }

    /// Run one tick: invoke every live task's action once, in insertion
    /// order, and remove the tasks that finished, were cancelled, or failed.
    pub fn check(&mut self) {
        let live = self.take_live();
        let hook = self.hook.clone();
        let survivors = run_tick(live, hook.as_deref());
        self.restore_live(survivors);
    }

    /// Request cooperative shutdown: set `cancelled` on every live task.
    ///
    /// No cleanup runs here. Each task observes the flag on its next tick and
    /// is removed (cleanup included) after that tick.
    pub fn reset(&mut self) {
        for entry in &self.entries {
            entry.handle.cancel();
        }
        for handle in &self.in_flight {
            handle.cancel();
        }
    }

    /// Drive [`check`](Self::check) until the queue is empty. Returns
    /// immediately on an empty queue.
    ///
    /// Termination is only assumed at shutdown: call [`reset`](Self::reset)
    /// first so every task observes cancellation on its next tick.
    pub fn wait(&mut self) {
        while !self.is_empty() {
            self.check();
        }
    }

    /// Teardown: forcibly run cleanup for every remaining task (no further
    /// action ticks) and leave the queue empty.
    pub fn drain(&mut self) {
        let remaining = mem::take(&mut self.entries);
        if remaining.is_empty() {
            return;
        }
        log::debug!("draining {} task(s) at teardown", remaining.len());
        let hook = self.hook.clone();
        drain_entries(remaining, hook.as_deref());
    }

    /// Number of live tasks, including any lifted out for an in-progress tick.
    pub fn len(&self) -> usize {
        self.entries.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.in_flight.is_empty()
    }

    /// Lift the live-at-tick-start entries out of the queue. Pushes that land
    /// while the tick runs append behind them on [`restore_live`](Self::restore_live).
    pub(crate) fn take_live(&mut self) -> Vec<TaskEntry> {
        let live = mem::take(&mut self.entries);
        self.in_flight = live.iter().map(|e| e.handle.clone()).collect();
        live
    }

    /// Reinstall the tick's survivors ahead of anything pushed mid-tick.
    pub(crate) fn restore_live(&mut self, survivors: Vec<TaskEntry>) {
        let pushed_mid_tick = mem::replace(&mut self.entries, survivors);
        self.entries.extend(pushed_mid_tick);
        self.in_flight.clear();
    }

    /// True while a tick's entries are lifted out. The facade uses this to
    /// make a reentrant `check()` a no-op instead of a double tick.
    pub(crate) fn tick_in_progress(&self) -> bool {
        !self.in_flight.is_empty()
    }

    pub(crate) fn failure_hook(&self) -> Option<Arc<FailureFn>> {
        self.hook.clone()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // Uphold exactly-once cleanup even if the queue is dropped with tasks
        // still present. A prior `drain` leaves nothing to do here.
        self.drain();
    }
}
