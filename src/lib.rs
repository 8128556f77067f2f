//! retrotask: a cooperative, frame-driven task queue for libretro-style cores.
//!
//! Emulator shims accumulate small recurring jobs that do not belong in the
//! per-frame hot path: battery/power-status polling, on-screen-display text
//! refresh, deferred flush-to-disk bookkeeping. This crate schedules those
//! jobs as cooperative tasks, ticked once per emulated frame by the host
//! core's run loop.
//!
//! Model:
//! - A task is a [`TaskSpec`]: an action invoked each tick, plus an optional
//!   cleanup guaranteed to run exactly once when the task leaves the queue.
//! - Cancellation is cooperative, never preemptive: [`reset`] (or
//!   [`TaskHandle::cancel`]) sets a flag the task observes on its next tick.
//! - Tasks run strictly in push order, one action call per tick, never
//!   concurrently with themselves.
//!
//! The host core drives the process-wide queue like this:
//!
//! - `retro_init`: [`init`] once.
//! - `retro_run`: [`check`] once per frame while content is running.
//! - `retro_unload_game`: [`reset`], then [`wait`], then [`deinit`], giving
//!   every task a last tick to observe cancellation and flush deferred state.
//! - `retro_deinit`: [`deinit`] (idempotent, in case unload already ran).
//!
//! `init(threaded = true, ...)` moves the ticking onto a dedicated worker
//! thread instead; `check` then becomes a lightweight wakeup and `push` /
//! `reset` are safe from the host thread while the worker drains.
//!
//! Embedders that want isolated queues (several cores in one process, or
//! tests) can skip the free functions and hold a [`TaskQueue`] directly.

pub mod queue;
pub mod task;

mod state;
mod worker;

pub use queue::{FailureHook, TaskFailure, TaskQueue};
pub use task::{TaskHandle, TaskSpec};

use state::Context;
use worker::Worker;

fn uninitialized() -> ! {
    panic!("task queue is not initialized; init() must be called first");
}

/// Establish the process-wide queue. Called once by the host at startup.
///
/// `on_failure`, when given, is invoked (in addition to logging) for every
/// task-body failure.
///
/// # Panics
///
/// Calling `init` twice without an intervening [`deinit`] is a contract
/// violation and panics.
pub fn init(threaded: bool, on_failure: Option<FailureHook>) {
    let mut guard = state::lock();
    assert!(
        guard.is_none(),
        "task queue is already initialized; deinit() must run before init() is called again"
    );

    let queue = match on_failure {
        Some(hook) => TaskQueue::with_failure_hook(hook),
        None => TaskQueue::new(),
    };
    *guard = Some(if threaded {
        Context::Threaded(Worker::spawn(queue))
    } else {
        Context::Direct(queue)
    });

    log::debug!("task queue initialized (threaded={threaded})");
}

/// Append a task to the process-wide queue. Runs no code yet.
///
/// The returned handle may be used to cancel this task alone. Safe to call
/// from within a running task's action; the new task is first ticked on the
/// next [`check`].
pub fn push(spec: TaskSpec) -> TaskHandle {
    let mut guard = state::lock();
    match guard.as_mut() {
        None => uninitialized(),
        Some(Context::Direct(queue)) => queue.push(spec),
        Some(Context::Threaded(worker)) => {
            let shared = worker.shared();
            drop(guard);
            shared.push(spec)
        }
    }
}

/// Run one tick over all live tasks. The host calls this once per emulated
/// frame while content is running.
///
/// In threaded mode this is only a wakeup for the worker.
pub fn check() {
    // Lift the live set out under the lock, run it with the lock released
    // (actions may push/reset/cancel through this same facade), then
    // reinstall the survivors ahead of anything pushed mid-tick.
    let (live, hook) = {
        let mut guard = state::lock();
        match guard.as_mut() {
            None => uninitialized(),
            Some(Context::Threaded(worker)) => {
                let shared = worker.shared();
                drop(guard);
                shared.kick();
                return;
            }
            Some(Context::Direct(queue)) => {
                if queue.tick_in_progress() {
                    // check() called from within a task action. The outer
                    // tick already covers every live task once.
                    return;
                }
                (queue.take_live(), queue.failure_hook())
            }
        }
    };

    let survivors = queue::run_tick(live, hook.as_deref());

    let mut guard = state::lock();
    match guard.as_mut() {
        Some(Context::Direct(queue)) => queue.restore_live(survivors),
        _ => {
            // deinit() ran from within a task action; the survivors have no
            // queue to return to, so treat them as torn down.
            drop(guard);
            queue::drain_entries(survivors, hook.as_deref());
        }
    }
}

/// Set `cancelled` on every live task. No cleanup runs here; each task
/// observes the flag on its next tick and is removed after it.
pub fn reset() {
    let mut guard = state::lock();
    match guard.as_mut() {
        None => uninitialized(),
        Some(Context::Direct(queue)) => queue.reset(),
        Some(Context::Threaded(worker)) => {
            let shared = worker.shared();
            drop(guard);
            shared.reset();
        }
    }
}

/// Block until the queue is empty, repeatedly driving [`check`] (or waiting
/// on the worker in threaded mode). Returns immediately if already empty.
///
/// Used at shutdown, after [`reset`], so in-flight tasks observe cancellation
/// and run their cleanups before teardown.
pub fn wait() {
    loop {
        {
            let mut guard = state::lock();
            match guard.as_mut() {
                None => uninitialized(),
                Some(Context::Threaded(worker)) => {
                    let shared = worker.shared();
                    drop(guard);
                    shared.wait_empty();
                    return;
                }
                Some(Context::Direct(queue)) => {
                    if queue.is_empty() {
                        return;
                    }
                }
            }
        }
        check();
    }
}

/// Tear down the process-wide queue. Idempotent.
///
/// Any tasks still present have their cleanup invoked (no further action
/// ticks). Afterwards [`init`] may be called again.
pub fn deinit() {
    let ctx = state::lock().take();
    match ctx {
        None => return,
        Some(Context::Direct(mut queue)) => queue.drain(),
        Some(Context::Threaded(worker)) => worker.shutdown(),
    }
    log::debug!("task queue deinitialized");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard};

    // The facade operates on process-wide state; these tests serialize on one
    // lock and leave the queue deinitialized behind them.
    static FACADE: Mutex<()> = Mutex::new(());

    fn facade_test() -> MutexGuard<'static, ()> {
        let guard = FACADE.lock().unwrap_or_else(|e| e.into_inner());
        deinit(); // clear leftovers from an earlier failed test
        guard
    }

    #[test]
    fn direct_lifecycle_flushes_tasks_at_unload() {
        let _serial = facade_test();
        let cleaned = Arc::new(AtomicUsize::new(0));

        init(false, None);

        let c = cleaned.clone();
        push(
            TaskSpec::named("sram-flush", |handle| {
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

        for _ in 0..3 {
            check();
        }
        assert_eq!(cleaned.load(Ordering::Relaxed), 0);

        // Unload sequence: reset, wait, deinit.
        reset();
        wait();
        assert_eq!(cleaned.load(Ordering::Relaxed), 1);
        deinit();

        // deinit releases the state; init may run again.
        init(false, None);
        deinit();
    }

    #[test]
    fn task_pushed_from_within_an_action_runs_on_the_next_tick() {
        let _serial = facade_test();
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        init(false, None);

        let outer_log = log.clone();
        let inner_log = log.clone();
        let mut pushed = false;
        push(TaskSpec::named("outer", move |_| {
            outer_log.lock().unwrap().push("outer");
            if !pushed {
                pushed = true;
                let inner_log = inner_log.clone();
                push(TaskSpec::named("inner", move |_| {
                    inner_log.lock().unwrap().push("inner");
                    Ok(())
                }));
            }
            Ok(())
        }));

        check();
        assert_eq!(*log.lock().unwrap(), vec!["outer"]);

        check();
        assert_eq!(*log.lock().unwrap(), vec!["outer", "outer", "inner"]);

        deinit();
    }

    #[test]
    fn deinit_with_tasks_present_runs_their_cleanups() {
        let _serial = facade_test();
        let cleaned = Arc::new(AtomicUsize::new(0));

        init(false, None);
        for _ in 0..2 {
            let c = cleaned.clone();
            push(TaskSpec::new(|_| Ok(())).with_cleanup(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }));
        }

        deinit();
        assert_eq!(cleaned.load(Ordering::Relaxed), 2);

        // Idempotent.
        deinit();
        assert_eq!(cleaned.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn double_init_is_a_contract_violation() {
        let _serial = facade_test();

        init(false, None);
        let second = std::panic::catch_unwind(|| init(false, None));
        assert!(second.is_err());
        deinit();
    }

    #[test]
    fn use_before_init_is_a_contract_violation() {
        let _serial = facade_test();

        let result = std::panic::catch_unwind(|| push(TaskSpec::new(|_| Ok(()))));
        assert!(result.is_err());

        let result = std::panic::catch_unwind(check);
        assert!(result.is_err());
    }

    #[test]
    fn threaded_lifecycle_drains_on_the_worker() {
        let _serial = facade_test();
        let cleaned = Arc::new(AtomicUsize::new(0));

        init(true, None);

        // A task that finishes on its own; wait() blocks until the worker
        // has removed it.
        let c = cleaned.clone();
        let ticks = AtomicUsize::new(0);
        push(
            TaskSpec::named("osd", move |handle| {
                if ticks.fetch_add(1, Ordering::Relaxed) + 1 == 3 {
                    handle.finish();
                }
                Ok(())
            })
            .with_cleanup(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        );
        check(); // wakeup only in threaded mode
        wait();
        assert_eq!(cleaned.load(Ordering::Relaxed), 1);

        // A task that only leaves when cancelled; the unload sequence must
        // still drain it.
        let c = cleaned.clone();
        push(
            TaskSpec::named("power-poll", |handle| {
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

        reset();
        wait();
        deinit();
        assert_eq!(cleaned.load(Ordering::Relaxed), 2);
    }
}
