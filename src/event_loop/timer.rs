//! Deadline-ordered timer driver for the event loop.
//!
//! The driver keeps a min-heap of `{deadline, id, generation}` entries over
//! boxed fire callbacks. Re-arming (postpone) bumps the generation and
//! pushes a fresh heap entry; stale entries are skipped when they surface.
//! Callbacks run outside the driver's locks so a firing timer may register
//! or postpone other timers freely.

use super::Wakeup;
use crate::time::monotonic_time;
use parking_lot::Mutex;
use std::collections::{BinaryHeap, HashMap};

type FireFn = Box<dyn FnOnce() + Send>;

/// Identifies a timer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct HeapEntry {
    /// Monotonic deadline in microseconds.
    deadline: i64,
    id: u64,
    generation: u64,
}

impl Eq for HeapEntry {}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.generation == other.generation
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse for a min-heap: earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Registration {
    generation: u64,
    fire: FireFn,
}

/// Timer driver owned by an [`super::EventLoop`].
///
/// Thread-safe: timers may be registered and postponed from any thread;
/// registration wakes the loop so a shortened deadline takes effect on the
/// current iteration.
pub struct TimerDriver {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    registrations: Mutex<HashMap<u64, Registration>>,
    next_id: Mutex<u64>,
    wakeup: Wakeup,
}

impl TimerDriver {
    pub(crate) fn new(wakeup: Wakeup) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            registrations: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
            wakeup,
        }
    }

    /// Registers `fire` to run once the monotonic clock reaches `deadline`
    /// (microseconds, [`monotonic_time`] scale).
    pub fn register(&self, deadline: i64, fire: FireFn) -> TimerId {
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        self.registrations.lock().insert(
            id,
            Registration {
                generation: 0,
                fire,
            },
        );
        self.heap.lock().push(HeapEntry {
            deadline,
            id,
            generation: 0,
        });
        tracing::trace!(id, deadline, "timer registered");
        self.wakeup.notify();
        TimerId(id)
    }

    /// Moves a still-armed timer to a new deadline.
    ///
    /// A timer that has already fired is gone; postponing it is a no-op.
    pub fn postpone(&self, timer: TimerId, deadline: i64) {
        let generation = {
            let mut regs = self.registrations.lock();
            match regs.get_mut(&timer.0) {
                Some(reg) => {
                    reg.generation += 1;
                    reg.generation
                }
                None => return,
            }
        };
        self.heap.lock().push(HeapEntry {
            deadline,
            id: timer.0,
            generation,
        });
        tracing::trace!(id = timer.0, deadline, "timer postponed");
        self.wakeup.notify();
    }

    /// Returns the earliest armed deadline, if any.
    ///
    /// May report a stale (postponed) entry's deadline; that only makes the
    /// loop wake early and find nothing expired.
    #[must_use]
    pub fn next_deadline(&self) -> Option<i64> {
        self.heap.lock().peek().map(|e| e.deadline)
    }

    /// Runs every timer whose deadline has passed. Returns the fire count.
    pub fn fire_expired(&self) -> usize {
        let now = monotonic_time();
        let mut due = Vec::new();
        {
            let mut heap = self.heap.lock();
            let mut regs = self.registrations.lock();
            while let Some(entry) = heap.peek() {
                if entry.deadline > now {
                    break;
                }
                let entry = heap.pop().expect("peeked heap entry vanished");
                // Stale generation: the timer was postponed past this entry.
                let current = regs
                    .get(&entry.id)
                    .is_some_and(|reg| reg.generation == entry.generation);
                if current {
                    if let Some(reg) = regs.remove(&entry.id) {
                        due.push(reg.fire);
                    }
                }
            }
        }

        let fired = due.len();
        for fire in due {
            fire();
        }
        fired
    }

    /// Returns the number of armed timers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.registrations.lock().len()
    }
}

impl std::fmt::Debug for TimerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerDriver")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_driver() -> TimerDriver {
        let poller = Arc::new(polling::Poller::new().expect("poller"));
        TimerDriver::new(Wakeup::new(poller))
    }

    fn counter_fire(counter: &Arc<AtomicUsize>) -> FireFn {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fires_past_deadlines_only() {
        let driver = test_driver();
        let hits = Arc::new(AtomicUsize::new(0));
        let now = monotonic_time();

        driver.register(now - 1, counter_fire(&hits));
        driver.register(now + 60_000_000, counter_fire(&hits));

        assert_eq!(driver.fire_expired(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(driver.pending_count(), 1);
    }

    #[test]
    fn next_deadline_reports_earliest() {
        let driver = test_driver();
        let now = monotonic_time();
        driver.register(now + 5_000_000, Box::new(|| {}));
        driver.register(now + 3_000_000, Box::new(|| {}));
        assert_eq!(driver.next_deadline(), Some(now + 3_000_000));
    }

    #[test]
    fn postpone_outruns_old_deadline() {
        let driver = test_driver();
        let hits = Arc::new(AtomicUsize::new(0));
        let now = monotonic_time();

        let id = driver.register(now - 1, counter_fire(&hits));
        driver.postpone(id, now + 60_000_000);

        // The stale entry surfaces but must not fire.
        assert_eq!(driver.fire_expired(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(driver.pending_count(), 1);
    }

    #[test]
    fn postpone_after_fire_is_noop() {
        let driver = test_driver();
        let hits = Arc::new(AtomicUsize::new(0));
        let now = monotonic_time();

        let id = driver.register(now - 1, counter_fire(&hits));
        assert_eq!(driver.fire_expired(), 1);

        driver.postpone(id, now - 1);
        assert_eq!(driver.fire_expired(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fire_callback_may_register_again() {
        let driver = Arc::new(test_driver());
        let hits = Arc::new(AtomicUsize::new(0));
        let now = monotonic_time();

        let driver2 = Arc::clone(&driver);
        let hits2 = Arc::clone(&hits);
        driver.register(
            now - 1,
            Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
                let hits3 = Arc::clone(&hits2);
                driver2.register(
                    monotonic_time() - 1,
                    Box::new(move || {
                        hits3.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        assert_eq!(driver.fire_expired(), 1);
        assert_eq!(driver.fire_expired(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
