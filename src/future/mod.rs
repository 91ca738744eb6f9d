//! Completable futures with ordered listener notification.
//!
//! A [`Future`] is the read side of an eventual value or error. It starts
//! pending and makes exactly one transition, to resolved or rejected; the
//! transition is final. Completion can happen from any thread. Listeners
//! registered while the future is pending run exactly once, in registration
//! order, after the terminal state is visible; registering on an already
//! terminal future invokes the listener synchronously.
//!
//! ```text
//!              complete(Ok(v))  ┌──────────┐
//!          ┌────────────────────► Resolved │
//! ┌────────┴─┐                  └──────────┘
//! │ Pending  │
//! └────────┬─┘                  ┌──────────┐
//!          └────────────────────► Rejected │
//!              complete(Err(e)) └──────────┘
//! ```
//!
//! Resolved payloads are stored as `Arc<T>` so every listener and every
//! clone of the handle observes the same immutable value.
//!
//! # Reentrancy
//!
//! The listener list is detached from the future under its lock and invoked
//! after the lock is released. A listener may therefore complete other
//! futures, including ones whose own listeners complete this one, without
//! deadlocking, and a listener that registers another listener on the same
//! future sees it as terminal.

mod combinator;
mod promise;

pub use combinator::{all, all_race, any, first};
pub use promise::Promise;

use crate::error::Error;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;

/// The lifecycle state of a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureStatus {
    /// Not yet completed.
    Pending,
    /// Completed with a value.
    Resolved,
    /// Completed with an error.
    Rejected,
}

/// The terminal outcome of a future: the shared value or the error.
pub type Outcome<T> = Result<Arc<T>, Error>;

type Listener<T> = Box<dyn FnOnce(&Future<T>) + Send>;

enum State<T> {
    Pending { listeners: SmallVec<[Listener<T>; 4]> },
    Resolved(Arc<T>),
    Rejected(Error),
}

pub(crate) struct Core<T> {
    state: Mutex<State<T>>,
}

/// Read-side handle to an eventual value or error.
///
/// Handles are cheap to clone; all clones observe the same completion.
pub struct Future<T> {
    core: Arc<Core<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + Sync + 'static> Default for Future<T> {
    fn default() -> Self {
        Self::pending()
    }
}

impl<T: Send + Sync + 'static> Future<T> {
    /// Creates a pending future with no way to complete it.
    ///
    /// Useful as a "never" future; for a completable one use [`Promise`].
    #[must_use]
    pub fn pending() -> Self {
        Self {
            core: Arc::new(Core {
                state: Mutex::new(State::Pending {
                    listeners: SmallVec::new(),
                }),
            }),
        }
    }

    /// Creates a future that is already resolved with `value`.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        Self {
            core: Arc::new(Core {
                state: Mutex::new(State::Resolved(Arc::new(value))),
            }),
        }
    }

    /// Creates a future that is already rejected with `error`.
    #[must_use]
    pub fn rejected(error: Error) -> Self {
        Self {
            core: Arc::new(Core {
                state: Mutex::new(State::Rejected(error)),
            }),
        }
    }

    pub(crate) fn from_core(core: Arc<Core<T>>) -> Self {
        Self { core }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> FutureStatus {
        match &*self.core.state.lock() {
            State::Pending { .. } => FutureStatus::Pending,
            State::Resolved(_) => FutureStatus::Resolved,
            State::Rejected(_) => FutureStatus::Rejected,
        }
    }

    /// Returns true while the future has not completed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(&*self.core.state.lock(), State::Pending { .. })
    }

    /// Returns the resolved value, if the future has resolved.
    #[must_use]
    pub fn value(&self) -> Option<Arc<T>> {
        match &*self.core.state.lock() {
            State::Resolved(v) => Some(Arc::clone(v)),
            _ => None,
        }
    }

    /// Returns the rejection error, if the future has rejected.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        match &*self.core.state.lock() {
            State::Rejected(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Returns the terminal outcome, or `None` while pending.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.core.state.lock() {
            State::Pending { .. } => None,
            State::Resolved(v) => Some(Ok(Arc::clone(v))),
            State::Rejected(e) => Some(Err(e.clone())),
        }
    }

    /// Attempts the single pending → terminal transition.
    ///
    /// Returns true if this call performed the transition. A future that is
    /// already terminal discards `outcome` and returns false; completion is
    /// idempotent and never corrupts state. On success the listener list is
    /// detached and each listener is invoked, in registration order, after
    /// the state change is visible and the lock is released.
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        let drained = {
            let mut state = self.core.state.lock();
            match &mut *state {
                State::Pending { listeners } => {
                    let drained = std::mem::take(listeners);
                    *state = match outcome {
                        Ok(value) => State::Resolved(value),
                        Err(error) => State::Rejected(error),
                    };
                    Some(drained)
                }
                _ => None,
            }
        };

        match drained {
            Some(listeners) => {
                tracing::trace!(listeners = listeners.len(), "future completed");
                for listener in listeners {
                    listener(self);
                }
                true
            }
            None => false,
        }
    }

    /// Registers `listener` to run once when the future becomes terminal.
    ///
    /// If the future is already terminal, `listener` runs synchronously
    /// before this call returns.
    pub fn add_listener(&self, listener: impl FnOnce(&Self) + Send + 'static) {
        let run_now = {
            let mut state = self.core.state.lock();
            match &mut *state {
                State::Pending { listeners } => {
                    listeners.push(Box::new(listener));
                    None
                }
                _ => Some(listener),
            }
        };
        if let Some(listener) = run_now {
            listener(self);
        }
    }

    /// Forwards this future's eventual outcome into `dst`.
    ///
    /// When `self` becomes terminal, `dst` is completed with the same value
    /// or error; if `self` is already terminal the propagation is
    /// synchronous. Chains cannot form cycles: an edge is only ever created
    /// toward a promise allocated before any listener of `self` could
    /// observe it.
    pub fn chain(&self, dst: &Promise<T>) {
        let dst = dst.clone();
        self.add_listener(move |src| {
            if let Some(outcome) = src.outcome() {
                dst.complete(outcome);
            }
        });
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match &*self.core.state.lock() {
            State::Pending { listeners } => format!("Pending({} listeners)", listeners.len()),
            State::Resolved(_) => "Resolved".to_string(),
            State::Rejected(e) => format!("Rejected({e})"),
        };
        f.debug_struct("Future").field("status", &status).finish()
    }
}

impl<T> Core<T> {
    pub(crate) fn new_pending() -> Self {
        Self {
            state: Mutex::new(State::Pending {
                listeners: SmallVec::new(),
            }),
        }
    }
}
