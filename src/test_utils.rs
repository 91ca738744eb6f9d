//! Test utilities for strand.
//!
//! Shared helpers for unit and integration tests:
//! - consistent tracing-based logging initialization
//! - one-call construction of an event loop with an attached scheduler
//! - bounded loop driving with a panic on timeout
//!
//! # Example
//! ```
//! use strand::test_utils::{init_test_logging, test_event_loop};
//!
//! init_test_logging();
//! let (ev, scheduler) = test_event_loop();
//! scheduler.push(Box::new(|| {}));
//! ev.iterate(false);
//! ```

use crate::event_loop::{self, EventLoop};
use crate::fiber::FiberScheduler;
use crate::scheduler::Scheduler;
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Creates an event loop with an attached fiber scheduler and installs
/// both as this thread's defaults.
#[must_use]
pub fn test_event_loop() -> (Arc<EventLoop>, Arc<FiberScheduler>) {
    let ev = Arc::new(EventLoop::new().expect("event loop creation failed"));
    let scheduler = FiberScheduler::new();
    scheduler.attach(&ev);
    event_loop::set_thread_default(Some(Arc::clone(&ev)));
    crate::scheduler::set_thread_default(Some(scheduler.clone() as Arc<dyn Scheduler>));
    (ev, scheduler)
}

/// Iterates `ev` until `done` holds, panicking after `limit`.
pub fn drive_until(ev: &EventLoop, done: impl FnMut() -> bool, limit: Duration) {
    assert!(
        ev.run_until(done, limit),
        "event loop condition not reached within {limit:?}"
    );
}

/// [`drive_until`] with a 5 second budget.
pub fn drive(ev: &EventLoop, done: impl FnMut() -> bool) {
    drive_until(ev, done, Duration::from_secs(5));
}
