//! The fiber scheduler: an event-loop source driving ready fibers.
//!
//! One scheduler owns a set of fibers and runs them, one at a time, on the
//! thread iterating its event loop. All queue state sits behind a single
//! mutex; a separate [`ReentrantMutex`] is the execution guard that keeps
//! fiber execution on one thread at a time: the thread driving fibers
//! holds it for the whole dispatch, so a completion listener that
//! re-enters `dispatch` on the same thread is a harmless no-op while a
//! foreign thread's attempt fails fast and reports no work.
//!
//! Fibers come back from a switch in one of three ways:
//!
//! - `Exited`: unlink it and release its stack (the scheduler has unwound
//!   to its own context by then),
//! - `Waiting`: park it, unless a completion already marked it ready while
//!   it was switching out (the `wake_pending` flag closes that race),
//! - `Ready`: cooperative yield, back to the tail of the ready queue.
//!
//! `ready_fiber` may be called from any thread, typically by a future's
//! completion listener, and wakes the attached event loop through its
//! [`Wakeup`] handle.

use super::{FiberInner, FiberState, SwitchCode};
use crate::event_loop::{EventLoop, Readiness, Source, Wakeup};
use crate::fiber::{swap_current, Fiber};
use crate::scheduler::Scheduler;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

struct CurrentSlot {
    id: u64,
    wake_pending: bool,
}

#[derive(Default)]
struct SchedState {
    ready: VecDeque<Arc<FiberInner>>,
    waiting: HashMap<u64, Arc<FiberInner>>,
    current: Option<CurrentSlot>,
}

/// Drives a set of fibers from a single event-loop thread.
pub struct FiberScheduler {
    state: Mutex<SchedState>,
    /// Held by the thread driving fibers; recursive so listener callbacks
    /// dispatched from a running fiber may re-enter without deadlock.
    exec: ReentrantMutex<()>,
    wakeup: Mutex<Option<Wakeup>>,
    self_ref: Weak<FiberScheduler>,
}

impl FiberScheduler {
    /// Creates a new scheduler with empty queues.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(SchedState::default()),
            exec: ReentrantMutex::new(()),
            wakeup: Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    /// Attaches the scheduler to an event loop as a dispatch source.
    pub fn attach(&self, event_loop: &EventLoop) {
        *self.wakeup.lock() = Some(event_loop.wakeup());
        let this = self
            .self_ref
            .upgrade()
            .expect("scheduler self reference dropped");
        event_loop.add_source(this);
    }

    /// Number of fibers queued to run.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Number of fibers parked on futures.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting.len()
    }

    fn wake(&self) {
        if let Some(wakeup) = &*self.wakeup.lock() {
            wakeup.notify();
        }
    }

    /// Queues a freshly migrated fiber.
    pub(crate) fn enqueue_ready(&self, fiber: Arc<FiberInner>) {
        self.state.lock().ready.push_back(fiber);
        self.wake();
    }

    /// Marks a fiber runnable. Callable from any thread.
    ///
    /// A parked fiber moves waiting → ready and the event loop is woken. If
    /// the fiber is the one currently running (its completion listener
    /// fired before it finished switching out), the wakeup is recorded and
    /// applied when the switch lands. Anything else is a no-op.
    pub(crate) fn ready_fiber(&self, fiber: &Arc<FiberInner>) {
        let mut state = self.state.lock();
        if let Some(current) = state.current.as_mut() {
            if current.id == fiber.id() {
                current.wake_pending = true;
                return;
            }
        }
        if state.waiting.remove(&fiber.id()).is_some() {
            fiber.set_phase(FiberState::Ready);
            state.ready.push_back(Arc::clone(fiber));
            drop(state);
            tracing::trace!(fiber = fiber.id(), "fiber readied");
            self.wake();
        }
    }

    /// Runs ready fibers until the queue drains.
    ///
    /// Returns false without doing work when another thread is already
    /// driving this scheduler, or when re-entered while a fiber of this
    /// scheduler is running on the calling thread.
    pub fn dispatch_fibers(&self) -> bool {
        let Some(_exec) = self.exec.try_lock() else {
            return false;
        };
        if self.state.lock().current.is_some() {
            return false;
        }

        let mut did_work = false;
        loop {
            let fiber = {
                let mut state = self.state.lock();
                let Some(fiber) = state.ready.pop_front() else {
                    break;
                };
                fiber.set_phase(FiberState::Running);
                state.current = Some(CurrentSlot {
                    id: fiber.id(),
                    wake_pending: false,
                });
                fiber
            };

            let code = self.run_fiber(&fiber);

            let exited = {
                let mut state = self.state.lock();
                let current = state
                    .current
                    .take()
                    .expect("current fiber slot cleared during dispatch");
                match code {
                    SwitchCode::Exited => {
                        fiber.set_phase(FiberState::Exited);
                        true
                    }
                    SwitchCode::Ready => {
                        fiber.set_phase(FiberState::Ready);
                        state.ready.push_back(Arc::clone(&fiber));
                        false
                    }
                    SwitchCode::Waiting => {
                        if current.wake_pending {
                            fiber.set_phase(FiberState::Ready);
                            state.ready.push_back(Arc::clone(&fiber));
                        } else {
                            fiber.set_phase(FiberState::Waiting);
                            state.waiting.insert(fiber.id(), Arc::clone(&fiber));
                        }
                        false
                    }
                }
            };
            if exited {
                tracing::debug!(fiber = fiber.id(), "fiber exited");
                fiber.release_stack();
            }
            did_work = true;
        }
        did_work
    }

    /// Runs `work` on this scheduler by spawning a fiber for it.
    pub fn push(&self, work: Box<dyn FnOnce() + Send>) {
        let fiber = match Fiber::with_default_stack(move || {
            work();
            Ok(())
        }) {
            Ok(fiber) => fiber,
            Err(error) => {
                tracing::error!(%error, "failed to spawn fiber for pushed work");
                return;
            }
        };
        let this = self
            .self_ref
            .upgrade()
            .expect("scheduler self reference dropped");
        if let Err(error) = fiber.migrate_to(&this) {
            tracing::error!(%error, "failed to queue pushed work");
        }
    }

    fn run_fiber(&self, fiber: &Arc<FiberInner>) -> SwitchCode {
        let this = self
            .self_ref
            .upgrade()
            .expect("scheduler self reference dropped");
        let previous = swap_current(Some((Arc::clone(fiber), this)));
        let code = FiberInner::resume(fiber);
        swap_current(previous);
        code
    }
}

impl Source for FiberScheduler {
    fn name(&self) -> &'static str {
        "fiber-scheduler"
    }

    fn prepare(&self) -> Readiness {
        if self.state.lock().ready.is_empty() {
            Readiness::wait()
        } else {
            Readiness::now()
        }
    }

    fn check(&self) -> bool {
        !self.state.lock().ready.is_empty()
    }

    fn dispatch(&self) -> bool {
        self.dispatch_fibers()
    }
}

impl Scheduler for FiberScheduler {
    fn push(&self, work: Box<dyn FnOnce() + Send>) {
        Self::push(self, work);
    }
}

impl std::fmt::Debug for FiberScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FiberScheduler")
            .field("ready", &state.ready.len())
            .field("waiting", &state.waiting.len())
            .field("running", &state.current.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fiber;
    use crate::future::{FutureStatus, Promise};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn dispatch_runs_migrated_fiber_to_completion() {
        let scheduler = FiberScheduler::new();
        let arg = Arc::new(AtomicU32::new(0));
        let arg2 = Arc::clone(&arg);

        let fiber = Fiber::with_default_stack(move || {
            arg2.store(99, Ordering::SeqCst);
            Ok(7u32)
        })
        .expect("fiber creation failed");
        fiber.migrate_to(&scheduler).expect("migrate failed");

        assert_eq!(fiber.state(), FiberState::Ready);
        assert!(scheduler.dispatch_fibers());

        assert_eq!(arg.load(Ordering::SeqCst), 99);
        assert_eq!(fiber.state(), FiberState::Exited);
        assert_eq!(*fiber.future().value().expect("value missing"), 7);
    }

    #[test]
    fn second_migrate_is_rejected() {
        let scheduler = FiberScheduler::new();
        let other = FiberScheduler::new();
        let fiber = Fiber::with_default_stack(|| Ok(())).expect("fiber creation failed");

        fiber.migrate_to(&scheduler).expect("migrate failed");
        let err = fiber.migrate_to(&other).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn wait_parks_until_completion() {
        let scheduler = FiberScheduler::new();
        let promise: Promise<u32> = Promise::new();
        let fut = promise.future();

        let fiber = Fiber::with_default_stack(move || {
            let value = fiber::wait(&fut)?;
            Ok(*value * 2)
        })
        .expect("fiber creation failed");
        fiber.migrate_to(&scheduler).expect("migrate failed");

        assert!(scheduler.dispatch_fibers());
        assert_eq!(fiber.state(), FiberState::Waiting);
        assert_eq!(scheduler.waiting_count(), 1);

        // Completion readies the fiber; the next dispatch finishes it.
        promise.resolve(21);
        assert_eq!(fiber.state(), FiberState::Ready);
        assert!(scheduler.dispatch_fibers());
        assert_eq!(*fiber.future().value().expect("value missing"), 42);
    }

    #[test]
    fn wait_on_terminal_future_needs_no_park() {
        let scheduler = FiberScheduler::new();
        let fut = crate::future::Future::resolved(5u32);

        let fiber = Fiber::with_default_stack(move || {
            let value = fiber::wait(&fut)?;
            Ok(*value)
        })
        .expect("fiber creation failed");
        fiber.migrate_to(&scheduler).expect("migrate failed");

        // One dispatch suffices: the fiber never parks.
        assert!(scheduler.dispatch_fibers());
        assert_eq!(fiber.state(), FiberState::Exited);
        assert_eq!(*fiber.future().value().expect("value missing"), 5);
    }

    #[test]
    fn yield_now_reschedules_at_tail() {
        let scheduler = FiberScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = Arc::clone(&order);
        let a = Fiber::with_default_stack(move || {
            order_a.lock().push("a1");
            fiber::yield_now()?;
            order_a.lock().push("a2");
            Ok(())
        })
        .expect("fiber creation failed");

        let order_b = Arc::clone(&order);
        let b = Fiber::with_default_stack(move || {
            order_b.lock().push("b1");
            Ok(())
        })
        .expect("fiber creation failed");

        a.migrate_to(&scheduler).expect("migrate failed");
        b.migrate_to(&scheduler).expect("migrate failed");
        scheduler.dispatch_fibers();

        assert_eq!(*order.lock(), vec!["a1", "b1", "a2"]);
    }

    #[test]
    fn completion_during_switch_out_is_not_lost() {
        // Resolve the awaited future from another thread the moment the
        // listener is registered; even if that lands while the fiber is
        // still switching out, the wake must not be lost.
        let scheduler = FiberScheduler::new();
        let promise: Promise<u32> = Promise::new();
        let fut = promise.future();

        let fiber = Fiber::with_default_stack(move || {
            let value = fiber::wait(&fut)?;
            Ok(*value)
        })
        .expect("fiber creation failed");
        fiber.migrate_to(&scheduler).expect("migrate failed");

        let completer = {
            let promise = promise.clone();
            std::thread::spawn(move || promise.resolve(11))
        };

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while fiber.future().is_pending() {
            scheduler.dispatch_fibers();
            assert!(
                std::time::Instant::now() < deadline,
                "fiber never completed"
            );
            std::thread::yield_now();
        }
        completer.join().expect("completer thread panicked");
        assert_eq!(*fiber.future().value().expect("value missing"), 11);
    }

    #[test]
    fn panicking_entry_rejects_result() {
        let scheduler = FiberScheduler::new();
        let fiber: Fiber<u32> =
            Fiber::with_default_stack(|| panic!("entry exploded")).expect("fiber creation failed");
        fiber.migrate_to(&scheduler).expect("migrate failed");

        scheduler.dispatch_fibers();
        let fut = fiber.future();
        assert_eq!(fut.status(), FutureStatus::Rejected);
        let error = fut.error().expect("error missing");
        assert_eq!(error.kind(), ErrorKind::FiberExited);
        assert!(error.to_string().contains("entry exploded"));
    }

    #[test]
    fn push_spawns_a_fiber() {
        let scheduler = FiberScheduler::new();
        let hit = Arc::new(AtomicU32::new(0));
        let hit2 = Arc::clone(&hit);
        scheduler.push(Box::new(move || {
            hit2.store(1, Ordering::SeqCst);
        }));

        assert!(scheduler.dispatch_fibers());
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentrant_lock_survives_yield() {
        // A fiber takes a recursive lock twice and releases it before
        // yielding; the outer holder on the dispatching thread must still
        // own its guard after the dispatch returns.
        let scheduler = FiberScheduler::new();
        let lock = Arc::new(ReentrantMutex::new(()));

        let fiber_lock = Arc::clone(&lock);
        let fiber = Fiber::with_default_stack(move || {
            let outer = fiber_lock.lock();
            let inner = fiber_lock.lock();
            drop(inner);
            drop(outer);
            fiber::yield_now()?;
            Ok(())
        })
        .expect("fiber creation failed");

        let guard = lock.lock();
        fiber.migrate_to(&scheduler).expect("migrate failed");
        scheduler.dispatch_fibers();
        drop(guard);

        // Relocking must not deadlock.
        let again = lock.lock();
        drop(again);
        assert_eq!(fiber.state(), FiberState::Exited);
    }
}
