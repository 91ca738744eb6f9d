//! A small prepare/check/dispatch event loop.
//!
//! The loop owns a set of [`Source`]s and iterates them GLib-style:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ iterate:                                                     │
//! │   1. prepare every source  → ready-now? / earliest timeout   │
//! │   2. fold in the timer driver's next deadline                │
//! │   3. poller.wait(timeout), interruptible via Wakeup          │
//! │   4. fire expired timers                                     │
//! │   5. check + dispatch every source that reports ready        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cross-thread wakeups go through [`Wakeup`], a cloneable handle over the
//! poller's notify mechanism; completion callbacks on foreign threads use
//! it to interrupt a blocked iteration after they mark a fiber runnable.
//!
//! Only the wakeup path of the poller is used; sources that watch file
//! descriptors (the AIO backend) register them with the poller themselves.

mod timer;

pub use timer::{TimerDriver, TimerId};

use crate::error::Result;
use crate::time::monotonic_time;
use parking_lot::Mutex;
use polling::Poller;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a source reports from `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// The source wants `dispatch` on this iteration.
    pub ready: bool,
    /// Upper bound on how long the loop may sleep; `None` means no bound.
    pub timeout: Option<Duration>,
}

impl Readiness {
    /// Ready to dispatch immediately.
    #[must_use]
    pub const fn now() -> Self {
        Self {
            ready: true,
            timeout: Some(Duration::ZERO),
        }
    }

    /// Nothing to do; the loop may sleep until woken.
    #[must_use]
    pub const fn wait() -> Self {
        Self {
            ready: false,
            timeout: None,
        }
    }

    /// Nothing to do yet, but wake within `timeout`.
    #[must_use]
    pub const fn wait_at_most(timeout: Duration) -> Self {
        Self {
            ready: false,
            timeout: Some(timeout),
        }
    }
}

/// An event-loop source with GLib-style hooks.
pub trait Source: Send + Sync {
    /// Name used in trace output.
    fn name(&self) -> &'static str {
        "source"
    }

    /// Reports whether the source is ready and how long the loop may sleep.
    fn prepare(&self) -> Readiness;

    /// Re-checked after the poll wait; true requests `dispatch`.
    fn check(&self) -> bool;

    /// Performs the source's work. Returns true if any work was done.
    fn dispatch(&self) -> bool;
}

/// Cloneable cross-thread handle that interrupts a blocked iteration.
#[derive(Clone)]
pub struct Wakeup {
    poller: Arc<Poller>,
}

impl Wakeup {
    pub(crate) fn new(poller: Arc<Poller>) -> Self {
        Self { poller }
    }

    /// Wakes the loop if it is blocked in a poll wait.
    pub fn notify(&self) {
        if let Err(error) = self.poller.notify() {
            tracing::warn!(%error, "event loop wakeup failed");
        }
    }
}

impl std::fmt::Debug for Wakeup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wakeup").finish_non_exhaustive()
    }
}

/// Owner of sources and the timer driver; drives one thread's dispatching.
pub struct EventLoop {
    poller: Arc<Poller>,
    sources: Mutex<Vec<Arc<dyn Source>>>,
    timers: Arc<TimerDriver>,
}

impl EventLoop {
    /// Creates a new event loop.
    ///
    /// # Errors
    ///
    /// Fails if the OS poller cannot be created.
    pub fn new() -> Result<Self> {
        let poller = Arc::new(Poller::new()?);
        let timers = Arc::new(TimerDriver::new(Wakeup::new(Arc::clone(&poller))));
        Ok(Self {
            poller,
            sources: Mutex::new(Vec::new()),
            timers,
        })
    }

    /// Returns a cross-thread wakeup handle.
    #[must_use]
    pub fn wakeup(&self) -> Wakeup {
        Wakeup::new(Arc::clone(&self.poller))
    }

    /// Returns the loop's timer driver.
    #[must_use]
    pub fn timers(&self) -> Arc<TimerDriver> {
        Arc::clone(&self.timers)
    }

    /// Returns the poller sources may register file descriptors with.
    #[must_use]
    pub fn poller(&self) -> Arc<Poller> {
        Arc::clone(&self.poller)
    }

    /// Adds a source to the loop.
    pub fn add_source(&self, source: Arc<dyn Source>) {
        tracing::debug!(source = source.name(), "source attached");
        self.sources.lock().push(source);
        self.wakeup().notify();
    }

    /// Runs one iteration. With `may_block` the poll wait sleeps until a
    /// source is ready, a timer is due, or a [`Wakeup`] fires; otherwise it
    /// returns immediately. Returns true if any timer fired or any source
    /// dispatched work.
    pub fn iterate(&self, may_block: bool) -> bool {
        self.iterate_capped(may_block, None)
    }

    fn iterate_capped(&self, may_block: bool, cap: Option<Duration>) -> bool {
        let sources: Vec<Arc<dyn Source>> = self.sources.lock().clone();

        let mut ready_now = false;
        let mut wait = cap;
        for source in &sources {
            let readiness = source.prepare();
            ready_now |= readiness.ready;
            if let Some(t) = readiness.timeout {
                wait = Some(wait.map_or(t, |w| w.min(t)));
            }
        }
        if let Some(deadline) = self.timers.next_deadline() {
            let now = monotonic_time();
            let until = if deadline <= now {
                Duration::ZERO
            } else {
                Duration::from_micros((deadline - now) as u64)
            };
            wait = Some(wait.map_or(until, |w| w.min(until)));
        }

        let timeout = if !may_block || ready_now {
            Some(Duration::ZERO)
        } else {
            wait
        };

        let mut events = Vec::new();
        if let Err(error) = self.poller.wait(&mut events, timeout) {
            tracing::warn!(%error, "event loop poll failed");
        }

        let fired = self.timers.fire_expired();

        let mut dispatched = false;
        for source in &sources {
            if source.check() {
                tracing::trace!(source = source.name(), "dispatching");
                dispatched |= source.dispatch();
            }
        }

        fired > 0 || dispatched
    }

    /// Iterates until `done` returns true or `limit` elapses.
    ///
    /// Returns true if `done` was reached. Blocked waits are capped by the
    /// remaining budget, so the call always returns near `limit`.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while !done() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.iterate_capped(true, Some(deadline - now));
        }
        true
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("sources", &self.sources.lock().len())
            .finish_non_exhaustive()
    }
}

thread_local! {
    static THREAD_DEFAULT: RefCell<Option<Arc<EventLoop>>> = const { RefCell::new(None) };
}

/// Installs (or clears) the calling thread's default event loop.
pub fn set_thread_default(event_loop: Option<Arc<EventLoop>>) {
    THREAD_DEFAULT.with(|slot| *slot.borrow_mut() = event_loop);
}

/// Returns the calling thread's default event loop, if one is installed.
#[must_use]
pub fn thread_default() -> Option<Arc<EventLoop>> {
    THREAD_DEFAULT.with(|slot| slot.borrow().clone())
}
