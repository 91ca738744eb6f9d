//! Cooperatively scheduled fibers with typed result futures.
//!
//! A [`Fiber`] runs a user entry function on its own guard-paged stack and
//! owns a result [`Future`] that completes when the entry returns: `Ok`
//! resolves it, `Err` rejects it, and a panic inside the fiber rejects it
//! with [`ErrorKind::FiberExited`] carrying the panic message.
//!
//! Fibers are created detached. [`Fiber::migrate_to`] hands a fiber to a
//! [`FiberScheduler`] and is the only way to start it; from then on the
//! fiber executes on that scheduler's event-loop thread and suspends only
//! at explicit points: [`wait`] on a future, or [`yield_now`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use strand::event_loop::EventLoop;
//! use strand::fiber::{Fiber, FiberScheduler};
//! use strand::future::Promise;
//!
//! let ev = Arc::new(EventLoop::new()?);
//! let scheduler = FiberScheduler::new();
//! scheduler.attach(&ev);
//!
//! let answer: Promise<u32> = Promise::new();
//! let fut = answer.future();
//! let fiber = Fiber::with_default_stack(move || {
//!     let value = strand::fiber::wait(&fut)?;
//!     Ok(*value + 1)
//! })?;
//! fiber.migrate_to(&scheduler)?;
//!
//! answer.resolve(41);
//! ev.run_until(|| !fiber.future().is_pending(), std::time::Duration::from_secs(1));
//! # Ok::<(), strand::Error>(())
//! ```
//!
//! [`ErrorKind::FiberExited`]: crate::error::ErrorKind::FiberExited

mod scheduler;
mod stack;
mod switch;

pub use scheduler::FiberScheduler;

use crate::error::{Error, ErrorKind, Result};
use crate::future::{Future, Promise};
use switch::SavedContext;
use parking_lot::Mutex;
use stack::FiberStack;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Observable lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberState {
    /// Created, not yet migrated to a scheduler.
    Detached,
    /// Queued on a scheduler, will run on a future dispatch.
    Ready,
    /// Currently executing on its scheduler's thread.
    Running,
    /// Parked until a future it waits on completes.
    Waiting,
    /// Entry function returned; the stack has been or will be released.
    Exited,
}

const PHASE_DETACHED: u8 = 0;
const PHASE_READY: u8 = 1;
const PHASE_RUNNING: u8 = 2;
const PHASE_WAITING: u8 = 3;
const PHASE_EXITED: u8 = 4;

/// Word passed back to the scheduler when a fiber switches out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwitchCode {
    /// Parked on a future; resume when marked ready.
    Waiting = 0,
    /// Cooperative yield; reschedule at the ready tail.
    Ready = 1,
    /// Entry returned; unlink and release the stack.
    Exited = 2,
}

impl SwitchCode {
    fn from_raw(raw: usize) -> Self {
        match raw {
            0 => Self::Waiting,
            1 => Self::Ready,
            _ => Self::Exited,
        }
    }
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);

/// Type-erased fiber shared between the handle and its scheduler.
pub(crate) struct FiberInner {
    id: u64,
    phase: AtomicU8,
    started: AtomicBool,
    entry: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    stack: Mutex<Option<FiberStack>>,
    /// Context the scheduler switches to when resuming this fiber.
    resume_ctx: Mutex<Option<SavedContext>>,
    /// Context the fiber switches to when yielding back to the scheduler.
    return_ctx: Mutex<Option<SavedContext>>,
    scheduler: Mutex<Option<Arc<FiberScheduler>>>,
}

impl FiberInner {
    fn new(stack: FiberStack, entry: Box<dyn FnOnce() + Send>) -> Arc<Self> {
        let resume_ctx = switch::make_fiber_context(&stack);
        Arc::new(Self {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            phase: AtomicU8::new(PHASE_DETACHED),
            started: AtomicBool::new(false),
            entry: Mutex::new(Some(entry)),
            stack: Mutex::new(Some(stack)),
            resume_ctx: Mutex::new(Some(resume_ctx)),
            return_ctx: Mutex::new(None),
            scheduler: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_phase(&self, state: FiberState) {
        let raw = match state {
            FiberState::Detached => PHASE_DETACHED,
            FiberState::Ready => PHASE_READY,
            FiberState::Running => PHASE_RUNNING,
            FiberState::Waiting => PHASE_WAITING,
            FiberState::Exited => PHASE_EXITED,
        };
        self.phase.store(raw, Ordering::Release);
    }

    pub(crate) fn state(&self) -> FiberState {
        match self.phase.load(Ordering::Acquire) {
            PHASE_DETACHED => FiberState::Detached,
            PHASE_READY => FiberState::Ready,
            PHASE_RUNNING => FiberState::Running,
            PHASE_WAITING => FiberState::Waiting,
            _ => FiberState::Exited,
        }
    }

    pub(crate) fn set_return(&self, ctx: SavedContext) {
        *self.return_ctx.lock() = Some(ctx);
    }

    pub(crate) fn take_return(&self) -> SavedContext {
        self.return_ctx
            .lock()
            .take()
            .expect("fiber has no scheduler context to return to")
    }

    /// Runs the boxed entry. The entry completes the result future itself
    /// and catches panics from user code; this outer guard only protects
    /// the context-switch boundary from a panicking completion listener.
    pub(crate) fn run_entry(&self) {
        if let Some(entry) = self.entry.lock().take() {
            if std::panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
                tracing::error!(fiber = self.id, "listener panicked during fiber completion");
            }
        }
        self.set_phase(FiberState::Exited);
    }

    /// Switches into the fiber; returns how it came back.
    ///
    /// The first resume hands the fiber to the trampoline through the
    /// transfer word; later resumes pass nothing.
    pub(crate) fn resume(this: &Arc<Self>) -> SwitchCode {
        let ctx = this
            .resume_ctx
            .lock()
            .take()
            .expect("resumed a fiber without a saved context");
        let data = if this.started.swap(true, Ordering::AcqRel) {
            0
        } else {
            Arc::into_raw(Arc::clone(this)) as usize
        };
        let (back, raw) = ctx.switch(data);
        let code = SwitchCode::from_raw(raw);
        if code == SwitchCode::Exited {
            drop(back);
        } else {
            *this.resume_ctx.lock() = Some(back);
        }
        code
    }

    /// Drops the stack. Only called after the fiber exited and the
    /// scheduler has unwound back to its own context.
    pub(crate) fn release_stack(&self) {
        self.stack.lock().take();
    }

    pub(crate) fn migrate_to(this: &Arc<Self>, scheduler: &Arc<FiberScheduler>) -> Result<()> {
        if this
            .phase
            .compare_exchange(
                PHASE_DETACHED,
                PHASE_READY,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::new(ErrorKind::Internal)
                .with_context("fiber was already migrated to a scheduler"));
        }
        *this.scheduler.lock() = Some(Arc::clone(scheduler));
        tracing::debug!(fiber = this.id, "fiber migrated");
        scheduler.enqueue_ready(Arc::clone(this));
        Ok(())
    }
}

impl std::fmt::Debug for FiberInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberInner")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A cooperatively scheduled coroutine with a typed result future.
pub struct Fiber<T> {
    inner: Arc<FiberInner>,
    future: Future<T>,
}

impl<T: Send + Sync + 'static> Fiber<T> {
    /// Creates a detached fiber running `entry` on a stack of `stack_size`
    /// bytes (platform default if 0).
    ///
    /// # Errors
    ///
    /// Fails if the stack cannot be allocated.
    pub fn new<F>(stack_size: usize, entry: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let stack = FiberStack::new(stack_size)?;
        let promise: Promise<T> = Promise::new();
        let future = promise.future();

        let run: Box<dyn FnOnce() + Send> = Box::new(move || {
            match std::panic::catch_unwind(AssertUnwindSafe(entry)) {
                Ok(Ok(value)) => {
                    promise.resolve(value);
                }
                Ok(Err(error)) => {
                    promise.reject(error);
                }
                Err(payload) => {
                    promise.reject(
                        Error::new(ErrorKind::FiberExited).with_context(panic_message(&payload)),
                    );
                }
            }
        });

        Ok(Self {
            inner: FiberInner::new(stack, run),
            future,
        })
    }

    /// Creates a detached fiber with the platform default stack size.
    ///
    /// # Errors
    ///
    /// Fails if the stack cannot be allocated.
    pub fn with_default_stack<F>(entry: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Self::new(0, entry)
    }

    /// The fiber's result future.
    #[must_use]
    pub fn future(&self) -> Future<T> {
        self.future.clone()
    }

    /// The fiber's observable state.
    #[must_use]
    pub fn state(&self) -> FiberState {
        self.inner.state()
    }

    /// Hands the fiber to `scheduler` and marks it ready to run.
    ///
    /// This is the only way to start a fiber and may be called from any
    /// thread.
    ///
    /// # Errors
    ///
    /// Rejects a fiber that was already migrated (including one currently
    /// running) with `ErrorKind::Internal`.
    pub fn migrate_to(&self, scheduler: &Arc<FiberScheduler>) -> Result<()> {
        FiberInner::migrate_to(&self.inner, scheduler)
    }
}

impl<T> std::fmt::Debug for Fiber<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "fiber panicked".to_string())
}

struct CurrentFiber {
    inner: Arc<FiberInner>,
    scheduler: Arc<FiberScheduler>,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentFiber>> = const { RefCell::new(None) };
}

/// Installs the running fiber for this thread, returning the previous one
/// so nested dispatches restore it.
pub(crate) fn swap_current(
    fiber: Option<(Arc<FiberInner>, Arc<FiberScheduler>)>,
) -> Option<(Arc<FiberInner>, Arc<FiberScheduler>)> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let previous = slot.take();
        *slot = fiber.map(|(inner, scheduler)| CurrentFiber { inner, scheduler });
        previous.map(|c| (c.inner, c.scheduler))
    })
}

fn current() -> Option<(Arc<FiberInner>, Arc<FiberScheduler>)> {
    CURRENT.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|c| (Arc::clone(&c.inner), Arc::clone(&c.scheduler)))
    })
}

/// Switches from the running fiber back to its scheduler.
fn switch_to_scheduler(inner: &Arc<FiberInner>, code: SwitchCode) {
    let ret = inner.take_return();
    let (back, _ignored) = ret.switch(code as usize);
    inner.set_return(back);
}

/// Suspends the current fiber until `future` becomes terminal, then
/// returns its value or error.
///
/// A future that is already terminal returns immediately, without a
/// context switch. The future may be completed from any thread; completion
/// marks the fiber ready and wakes its scheduler's event loop.
///
/// # Errors
///
/// Returns the future's rejection error, or `ErrorKind::Internal` when
/// called outside a fiber.
pub fn wait<T: Send + Sync + 'static>(future: &Future<T>) -> Result<Arc<T>> {
    let Some((inner, scheduler)) = current() else {
        return Err(
            Error::new(ErrorKind::Internal).with_context("wait() called outside a fiber")
        );
    };

    loop {
        if let Some(outcome) = future.outcome() {
            return outcome;
        }
        tracing::trace!(fiber = inner.id(), "fiber waiting on future");
        let wake_inner = Arc::clone(&inner);
        let wake_scheduler = Arc::clone(&scheduler);
        future.add_listener(move |_| wake_scheduler.ready_fiber(&wake_inner));
        switch_to_scheduler(&inner, SwitchCode::Waiting);
    }
}

/// Cooperatively reschedules the current fiber at its ready-queue tail.
///
/// # Errors
///
/// Returns `ErrorKind::Internal` when called outside a fiber.
pub fn yield_now() -> Result<()> {
    let Some((inner, _scheduler)) = current() else {
        return Err(
            Error::new(ErrorKind::Internal).with_context("yield_now() called outside a fiber")
        );
    };
    switch_to_scheduler(&inner, SwitchCode::Ready);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureStatus;

    #[test]
    fn new_fiber_is_detached_and_pending() {
        let fiber = Fiber::with_default_stack(|| Ok(1u32)).expect("fiber creation failed");
        assert_eq!(fiber.state(), FiberState::Detached);
        assert_eq!(fiber.future().status(), FutureStatus::Pending);
    }

    #[test]
    fn wait_outside_fiber_is_internal_error() {
        let fut = Future::resolved(1u32);
        // Even a terminal future needs a fiber context.
        let err = wait(&fut).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn yield_outside_fiber_is_internal_error() {
        let err = yield_now().expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn switch_code_round_trip() {
        assert_eq!(
            SwitchCode::from_raw(SwitchCode::Waiting as usize),
            SwitchCode::Waiting
        );
        assert_eq!(
            SwitchCode::from_raw(SwitchCode::Ready as usize),
            SwitchCode::Ready
        );
        assert_eq!(
            SwitchCode::from_raw(SwitchCode::Exited as usize),
            SwitchCode::Exited
        );
    }

    #[test]
    fn panic_message_extracts_text() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("kapow"));
        assert_eq!(panic_message(payload.as_ref()), "kapow");
    }
}
