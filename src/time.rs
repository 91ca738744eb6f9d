//! Monotonic clock and timeout futures.
//!
//! A [`Timeout`] is a future that **rejects** with
//! [`ErrorKind::TimedOut`](crate::error::ErrorKind::TimedOut) once the
//! monotonic clock reaches its deadline. Racing it against real work (via
//! [`crate::future::first`]) bounds the work; awaiting it alone is a
//! cancellable sleep that ends in an error.
//!
//! Deadlines are absolute microseconds on the [`monotonic_time`] scale.

use crate::error::Error;
use crate::event_loop::{self, TimerDriver, TimerId};
use crate::future::{Future, Promise};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

const USEC_PER_SEC: i64 = 1_000_000;

/// Microseconds of monotonic time since the process epoch.
///
/// The epoch is fixed on first use; all strand deadlines share this scale.
#[must_use]
pub fn monotonic_time() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    i64::try_from(epoch.elapsed().as_micros()).unwrap_or(i64::MAX)
}

/// A future that rejects with `TimedOut` at its deadline.
///
/// Constructors without an explicit driver register against the calling
/// thread's default event loop; with no loop installed, the future rejects
/// immediately with `Internal`. Dropping the `Timeout` handle does not
/// disarm the deadline; clones of the future remain live and still reject
/// on time.
pub struct Timeout {
    future: Future<()>,
    armed: Option<(Arc<TimerDriver>, TimerId)>,
}

impl Timeout {
    /// Creates a timeout firing at an absolute monotonic deadline (µs).
    #[must_use]
    pub fn new_deadline(deadline: i64) -> Self {
        match event_loop::thread_default() {
            Some(ev) => Self::new_deadline_on(&ev.timers(), deadline),
            None => Self {
                future: Future::rejected(
                    Error::new(crate::error::ErrorKind::Internal)
                        .with_context("no thread-default event loop"),
                ),
                armed: None,
            },
        }
    }

    /// Creates a timeout on an explicit timer driver.
    #[must_use]
    pub fn new_deadline_on(timers: &Arc<TimerDriver>, deadline: i64) -> Self {
        let promise: Promise<()> = Promise::new();
        let future = promise.future();
        let id = timers.register(
            deadline,
            Box::new(move || {
                promise.reject(Error::timed_out());
            }),
        );
        Self {
            future,
            armed: Some((Arc::clone(timers), id)),
        }
    }

    /// Creates a timeout `seconds` from now.
    #[must_use]
    pub fn new_seconds(seconds: i64) -> Self {
        Self::new_deadline(monotonic_time() + seconds * USEC_PER_SEC)
    }

    /// Creates a timeout `msec` milliseconds from now.
    #[must_use]
    pub fn new_msec(msec: i64) -> Self {
        Self::new_deadline(monotonic_time() + msec * (USEC_PER_SEC / 1000))
    }

    /// Creates a timeout `usec` microseconds from now.
    #[must_use]
    pub fn new_usec(usec: i64) -> Self {
        Self::new_deadline(monotonic_time() + usec)
    }

    /// Returns the timeout's future.
    #[must_use]
    pub fn future(&self) -> Future<()> {
        self.future.clone()
    }

    /// Re-arms a still-pending timeout to a new absolute deadline (µs).
    ///
    /// Postponing a timeout that has already fired is a no-op.
    pub fn postpone_until(&self, deadline: i64) {
        if let Some((timers, id)) = &self.armed {
            timers.postpone(*id, deadline);
        }
    }
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeout")
            .field("future", &self.future)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::event_loop::EventLoop;
    use crate::future::FutureStatus;

    #[test]
    fn monotonic_time_advances() {
        let a = monotonic_time();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic_time();
        assert!(b > a);
    }

    #[test]
    fn rejects_at_deadline() {
        let ev = EventLoop::new().expect("event loop");
        let timeout = Timeout::new_deadline_on(&ev.timers(), monotonic_time() - 1);

        assert!(timeout.future().is_pending());
        ev.iterate(false);
        assert_eq!(
            timeout.future().error().expect("error missing").kind(),
            ErrorKind::TimedOut
        );
    }

    #[test]
    fn postpone_delays_rejection() {
        let ev = EventLoop::new().expect("event loop");
        let timeout = Timeout::new_deadline_on(&ev.timers(), monotonic_time() - 1);
        timeout.postpone_until(monotonic_time() + 60 * USEC_PER_SEC);

        ev.iterate(false);
        assert_eq!(timeout.future().status(), FutureStatus::Pending);
    }

    #[test]
    fn postpone_after_fire_is_noop() {
        let ev = EventLoop::new().expect("event loop");
        let timeout = Timeout::new_deadline_on(&ev.timers(), monotonic_time() - 1);
        ev.iterate(false);
        assert_eq!(timeout.future().status(), FutureStatus::Rejected);

        timeout.postpone_until(monotonic_time() - 1);
        ev.iterate(false);
        assert_eq!(timeout.future().status(), FutureStatus::Rejected);
    }

    #[test]
    fn without_thread_default_loop_rejects_internal() {
        // This thread has no default loop installed.
        let timeout = Timeout::new_msec(1);
        assert_eq!(
            timeout.future().error().expect("error missing").kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn drop_does_not_disarm() {
        let ev = EventLoop::new().expect("event loop");
        let fut = {
            let timeout = Timeout::new_deadline_on(&ev.timers(), monotonic_time() - 1);
            timeout.future()
        };
        ev.iterate(false);
        assert!(fut.error().expect("error missing").is_timeout());
    }
}
