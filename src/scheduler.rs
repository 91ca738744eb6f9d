//! Scheduler trait and default-scheduler registries.
//!
//! A [`Scheduler`] accepts closures and runs them later on whatever
//! execution resource it owns; [`crate::fiber::FiberScheduler`] runs each
//! pushed closure on a fresh fiber. Two registries mirror the usual
//! main-context conventions: a process-wide default, set once at startup,
//! and a per-thread default that threads driving their own event loop
//! install for themselves.

use crate::error::{Error, ErrorKind, Result};
use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

/// Something that can run queued closures.
pub trait Scheduler: Send + Sync {
    /// Queues `work` to run on this scheduler.
    fn push(&self, work: Box<dyn FnOnce() + Send>);
}

static DEFAULT: OnceLock<Arc<dyn Scheduler>> = OnceLock::new();

thread_local! {
    static THREAD_DEFAULT: RefCell<Option<Arc<dyn Scheduler>>> = const { RefCell::new(None) };
}

/// Installs the process-wide default scheduler.
///
/// # Errors
///
/// Returns `ErrorKind::Internal` if a default was already installed.
pub fn set_default(scheduler: Arc<dyn Scheduler>) -> Result<()> {
    DEFAULT.set(scheduler).map_err(|_| {
        Error::new(ErrorKind::Internal).with_context("default scheduler already set")
    })
}

/// Returns the process-wide default scheduler, if one was installed.
#[must_use]
pub fn get_default() -> Option<Arc<dyn Scheduler>> {
    DEFAULT.get().cloned()
}

/// Installs (or clears) the calling thread's default scheduler.
pub fn set_thread_default(scheduler: Option<Arc<dyn Scheduler>>) {
    THREAD_DEFAULT.with(|slot| *slot.borrow_mut() = scheduler);
}

/// Returns the calling thread's default scheduler, falling back to none.
#[must_use]
pub fn get_thread_default() -> Option<Arc<dyn Scheduler>> {
    THREAD_DEFAULT.with(|slot| slot.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingScheduler {
        log: Mutex<Vec<&'static str>>,
    }

    impl Scheduler for RecordingScheduler {
        fn push(&self, work: Box<dyn FnOnce() + Send>) {
            self.log.lock().push("pushed");
            work();
        }
    }

    #[test]
    fn thread_default_round_trip() {
        assert!(get_thread_default().is_none());

        let scheduler = Arc::new(RecordingScheduler {
            log: Mutex::new(Vec::new()),
        });
        set_thread_default(Some(scheduler.clone() as Arc<dyn Scheduler>));

        let found = get_thread_default().expect("thread default missing");
        found.push(Box::new(|| {}));
        assert_eq!(*scheduler.log.lock(), vec!["pushed"]);

        set_thread_default(None);
        assert!(get_thread_default().is_none());
    }
}
