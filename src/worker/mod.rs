//! Background worker for threaded mode.
//!
//! Responsibilities:
//! - Drain the same `TaskQueue` the direct mode uses, on a dedicated thread,
//!   at roughly frame cadence.
//! - Keep `push`/`reset` safe to call from the host thread while the worker
//!   ticks: all queue mutation happens under one mutex, and actions run with
//!   the lock released (same lift-out/reinstall dance as the direct mode).
//! - Wake early on push, reset, host `check()` kicks, and shutdown.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::queue::{self, TaskQueue};
use crate::task::{TaskHandle, TaskSpec};

/// Pace of worker ticks while tasks are scheduled. Matches one emulated frame
/// closely enough for the periodic maintenance jobs this queue carries.
const TICK_INTERVAL: Duration = Duration::from_millis(16);

pub(crate) struct Worker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// State shared between the worker thread and the host-facing operations.
pub(crate) struct Shared {
    state: Mutex<WorkerState>,
    cv: Condvar,
}

struct WorkerState {
    queue: TaskQueue,
    shutdown: bool,
}

impl Worker {
    pub(crate) fn spawn(queue: TaskQueue) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkerState {
                queue,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });

        let for_thread = shared.clone();
        let thread = std::thread::Builder::new()
            .name("retrotask-worker".into())
            .spawn(move || drain_loop(&for_thread))
            .expect("failed to spawn task queue worker thread");

        log::debug!("task queue worker started");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Clone of the shared state, so callers can release the process-wide
    /// context lock before touching the worker.
    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Stop and join the worker, then force-run cleanup for whatever is left.
    pub(crate) fn shutdown(mut self) {
        {
            let mut st = self.shared.locked();
            st.shutdown = true;
        }
        self.shared.cv.notify_all();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("task queue worker exited by panic");
            }
        }

        let mut queue = {
            let mut st = self.shared.locked();
            std::mem::take(&mut st.queue)
        };
        queue.drain();
        log::debug!("task queue worker stopped");
    }
}

impl Shared {
    fn locked(&self) -> MutexGuard<'_, WorkerState> {
        // Worker panics are caught per task, so poisoning here would mean an
        // internal bug; recover rather than wedge the host.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push(&self, spec: TaskSpec) -> TaskHandle {
        let handle = self.locked().queue.push(spec);
        self.cv.notify_all();
        handle
    }

    pub(crate) fn reset(&self) {
        self.locked().queue.reset();
        self.cv.notify_all();
    }

    /// Lightweight poll from the host thread; the worker owns the ticking.
    pub(crate) fn kick(&self) {
        self.cv.notify_all();
    }

    /// Block until the queue is empty (or the worker is shutting down, in
    /// which case `deinit` owns the remaining cleanups).
    pub(crate) fn wait_empty(&self) {
        let mut st = self.locked();
        while !st.queue.is_empty() && !st.shutdown {
            st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }
}

fn drain_loop(shared: &Shared) {
    let mut st = shared.locked();
    loop {
        while st.queue.is_empty() && !st.shutdown {
            st = shared.cv.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        if st.shutdown {
            break;
        }

        let live = st.queue.take_live();
        let hook = st.queue.failure_hook();
        drop(st);

        let survivors = queue::run_tick(live, hook.as_deref());

        st = shared.locked();
        st.queue.restore_live(survivors);
        shared.cv.notify_all();
        if st.shutdown {
            break;
        }

        // Pace the next tick; any notify (push/reset/kick/shutdown) ends the
        // wait early.
        let (guard, _timed_out) = shared
            .cv
            .wait_timeout(st, TICK_INTERVAL)
            .unwrap_or_else(|e| e.into_inner());
        st = guard;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn finishing_after(ticks: usize, cleaned: &Arc<AtomicUsize>) -> TaskSpec {
        let seen = AtomicUsize::new(0);
        let c = cleaned.clone();
        TaskSpec::new(move |handle| {
            if seen.fetch_add(1, Ordering::Relaxed) + 1 == ticks {
                handle.finish();
            }
            Ok(())
        })
        .with_cleanup(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    #[test]
    fn worker_drains_a_self_finishing_task() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let worker = Worker::spawn(TaskQueue::new());
        let shared = worker.shared();

        shared.push(finishing_after(3, &cleaned));
        shared.wait_empty();

        assert_eq!(cleaned.load(Ordering::Relaxed), 1);
        worker.shutdown();
    }

    #[test]
    fn reset_reaches_tasks_on_the_worker_thread() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let worker = Worker::spawn(TaskQueue::new());
        let shared = worker.shared();

        let c = cleaned.clone();
        shared.push(
            TaskSpec::named("until-cancelled", |handle| {
                if handle.is_cancelled() {
                    handle.finish();
                }
                Ok(())
            })
            .with_cleanup(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        );

        shared.reset();
        shared.wait_empty();

        assert_eq!(cleaned.load(Ordering::Relaxed), 1);
        worker.shutdown();
    }

    #[test]
    fn shutdown_force_cleans_remaining_tasks() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let worker = Worker::spawn(TaskQueue::new());
        let shared = worker.shared();

        for _ in 0..2 {
            let c = cleaned.clone();
            shared.push(TaskSpec::new(|_| Ok(())).with_cleanup(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }));
        }

        worker.shutdown();
        assert_eq!(cleaned.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn wait_empty_returns_immediately_when_nothing_is_scheduled() {
        let worker = Worker::spawn(TaskQueue::new());
        worker.shared().wait_empty();
        worker.shutdown();
    }
}
