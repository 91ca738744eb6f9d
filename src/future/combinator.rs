//! Future combinators: chaining callbacks and aggregate completion.
//!
//! Two families live here:
//!
//! - **Chaining**: [`Future::then`], [`Future::catch`], [`Future::finally`]
//!   derive a new future from one source. `then` runs on resolution and its
//!   returned future is flattened into the result; `catch` is the symmetric
//!   recovery hook for rejection; `finally` observes either terminal state
//!   and passes the outcome through unchanged.
//! - **Aggregation**: [`all`], [`all_race`], [`any`], [`first`] combine a
//!   vector of futures. `all` waits for every input and then resolves with
//!   the ordered values or rejects with the first observed rejection;
//!   `all_race` rejects as soon as any input rejects; `any` resolves with
//!   the first resolution and swallows rejections until none remain;
//!   `first` completes with whichever input finishes first, either way.
//!
//! Rejections propagate as-is through `then` and `all`. `any` rejects with
//! [`ErrorKind::DependencyFailed`] carrying the last rejection as source.
//!
//! [`ErrorKind::DependencyFailed`]: crate::error::ErrorKind::DependencyFailed

use super::{Future, Promise};
use crate::error::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

impl<T: Send + Sync + 'static> Future<T> {
    /// Monadic bind: runs `f` when this future resolves.
    ///
    /// The future returned by `f` is flattened into the result, so `f` may
    /// itself be asynchronous. If this future rejects, the rejection
    /// propagates untouched and `f` never runs.
    pub fn then<U, F>(&self, f: F) -> Future<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(Arc<T>) -> Future<U> + Send + 'static,
    {
        let promise = Promise::new();
        let out = promise.future();
        self.add_listener(move |src| {
            match src.outcome().expect("listener invoked on a pending future") {
                Ok(value) => f(value).chain(&promise),
                Err(error) => {
                    promise.reject(error);
                }
            }
        });
        out
    }

    /// Recovery hook: runs `f` when this future rejects.
    ///
    /// The future returned by `f` replaces the rejection; a resolution
    /// passes through untouched and `f` never runs.
    pub fn catch<F>(&self, f: F) -> Future<T>
    where
        F: FnOnce(&Error) -> Future<T> + Send + 'static,
    {
        let promise = Promise::new();
        let out = promise.future();
        self.add_listener(move |src| {
            match src.outcome().expect("listener invoked on a pending future") {
                Ok(value) => {
                    promise.resolve_arc(value);
                }
                Err(error) => f(&error).chain(&promise),
            }
        });
        out
    }

    /// Runs `f` when this future completes either way.
    ///
    /// The outcome passes through unchanged; `f` is for side effects only.
    pub fn finally<F>(&self, f: F) -> Future<T>
    where
        F: FnOnce(&Future<T>) + Send + 'static,
    {
        let promise = Promise::new();
        let out = promise.future();
        self.add_listener(move |src| {
            f(src);
            promise.complete(src.outcome().expect("listener invoked on a pending future"));
        });
        out
    }
}

struct GatherState<T> {
    slots: Vec<Option<Arc<T>>>,
    remaining: usize,
    first_error: Option<Error>,
}

fn collect_slots<T>(slots: Vec<Option<Arc<T>>>) -> Vec<Arc<T>> {
    slots
        .into_iter()
        .map(|s| s.expect("aggregate resolved with an unfilled slot"))
        .collect()
}

/// Waits for every input, then resolves with the ordered values.
///
/// If any input rejected, `all` waits for the remainder to finish and then
/// rejects with the first rejection it observed. An empty input resolves
/// with an empty vector.
pub fn all<T: Send + Sync + 'static>(futures: Vec<Future<T>>) -> Future<Vec<Arc<T>>> {
    let promise = Promise::new();
    let out = promise.future();
    let count = futures.len();
    if count == 0 {
        promise.resolve(Vec::new());
        return out;
    }

    let state = Arc::new(Mutex::new(GatherState {
        slots: vec![None; count],
        remaining: count,
        first_error: None,
    }));

    for (index, future) in futures.iter().enumerate() {
        let state = Arc::clone(&state);
        let promise = promise.clone();
        future.add_listener(move |f| {
            let finished = {
                let mut st = state.lock();
                match f.outcome().expect("listener invoked on a pending future") {
                    Ok(value) => st.slots[index] = Some(value),
                    Err(error) => {
                        if st.first_error.is_none() {
                            st.first_error = Some(error);
                        }
                    }
                }
                st.remaining -= 1;
                if st.remaining == 0 {
                    Some((std::mem::take(&mut st.slots), st.first_error.take()))
                } else {
                    None
                }
            };
            if let Some((slots, error)) = finished {
                match error {
                    Some(error) => promise.reject(error),
                    None => promise.resolve(collect_slots(slots)),
                };
            }
        });
    }

    out
}

/// Like [`all`], but rejects immediately when any input rejects.
///
/// The ordered values still arrive only once every input has resolved.
pub fn all_race<T: Send + Sync + 'static>(futures: Vec<Future<T>>) -> Future<Vec<Arc<T>>> {
    let promise = Promise::new();
    let out = promise.future();
    let count = futures.len();
    if count == 0 {
        promise.resolve(Vec::new());
        return out;
    }

    let state = Arc::new(Mutex::new(GatherState {
        slots: vec![None; count],
        remaining: count,
        first_error: None,
    }));

    for (index, future) in futures.iter().enumerate() {
        let state = Arc::clone(&state);
        let promise = promise.clone();
        future.add_listener(move |f| {
            match f.outcome().expect("listener invoked on a pending future") {
                Ok(value) => {
                    let finished = {
                        let mut st = state.lock();
                        st.slots[index] = Some(value);
                        st.remaining -= 1;
                        if st.remaining == 0 {
                            Some(std::mem::take(&mut st.slots))
                        } else {
                            None
                        }
                    };
                    if let Some(slots) = finished {
                        promise.resolve(collect_slots(slots));
                    }
                }
                Err(error) => {
                    promise.reject(error);
                }
            }
        });
    }

    out
}

/// Resolves with the first input to resolve.
///
/// Rejections are swallowed while any contender remains; once every input
/// has rejected, `any` rejects with [`ErrorKind::DependencyFailed`]
/// carrying the last rejection as its source. An empty input rejects
/// immediately.
///
/// [`ErrorKind::DependencyFailed`]: crate::error::ErrorKind::DependencyFailed
pub fn any<T: Send + Sync + 'static>(futures: Vec<Future<T>>) -> Future<T> {
    let promise = Promise::new();
    let out = promise.future();
    if futures.is_empty() {
        promise.reject(Error::dependency_failed());
        return out;
    }

    let contenders = Arc::new(AtomicUsize::new(futures.len()));
    for future in &futures {
        let promise = promise.clone();
        let contenders = Arc::clone(&contenders);
        future.add_listener(move |f| {
            match f.outcome().expect("listener invoked on a pending future") {
                Ok(value) => {
                    promise.resolve_arc(value);
                }
                Err(error) => {
                    if contenders.fetch_sub(1, Ordering::AcqRel) == 1 {
                        promise.reject(Error::dependency_failed().with_source(error));
                    }
                }
            }
        });
    }

    out
}

/// Completes with the first input to finish, value or error.
///
/// An empty input rejects immediately.
pub fn first<T: Send + Sync + 'static>(futures: Vec<Future<T>>) -> Future<T> {
    let promise = Promise::new();
    let out = promise.future();
    if futures.is_empty() {
        promise.reject(Error::dependency_failed());
        return out;
    }

    for future in &futures {
        let promise = promise.clone();
        future.add_listener(move |f| {
            promise.complete(f.outcome().expect("listener invoked on a pending future"));
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::future::FutureStatus;

    #[test]
    fn then_flattens_returned_future() {
        let src = Promise::new();
        let derived = src.future().then(|v: Arc<u32>| Future::resolved(*v + 1));

        assert!(derived.is_pending());
        src.resolve(41);
        assert_eq!(*derived.value().expect("value missing"), 42);
    }

    #[test]
    fn then_waits_for_inner_future() {
        let src = Promise::new();
        let inner = Promise::new();
        let inner_fut = inner.future();
        let derived = src.future().then(move |_: Arc<u32>| inner_fut);

        src.resolve(1);
        assert!(derived.is_pending());
        inner.resolve(99u32);
        assert_eq!(*derived.value().expect("value missing"), 99);
    }

    #[test]
    fn then_propagates_rejection_without_running() {
        let src: Future<u32> = Future::rejected(Error::channel_closed());
        let derived = src.then(|_| -> Future<u32> { panic!("callback must not run") });
        assert_eq!(
            derived.error().expect("error missing").kind(),
            ErrorKind::ChannelClosed
        );
    }

    #[test]
    fn catch_recovers_rejection() {
        let src: Future<u32> = Future::rejected(Error::timed_out());
        let derived = src.catch(|e| {
            assert!(e.is_timeout());
            Future::resolved(7)
        });
        assert_eq!(*derived.value().expect("value missing"), 7);
    }

    #[test]
    fn catch_passes_value_through() {
        let src = Future::resolved(3u32);
        let derived = src.catch(|_| panic!("callback must not run"));
        assert_eq!(*derived.value().expect("value missing"), 3);
    }

    #[test]
    fn finally_runs_on_both_outcomes() {
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let ok = Future::resolved(1u32).finally(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(*ok.value().expect("value missing"), 1);

        let h = Arc::clone(&hits);
        let err: Future<u32> = Future::rejected(Error::timed_out());
        let err = err.finally(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(err.error().expect("error missing").is_timeout());

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn all_resolves_in_input_order() {
        let a = Promise::new();
        let b = Promise::new();
        let combined = all(vec![a.future(), b.future()]);

        // Complete out of order; values still land in input order.
        b.resolve(2u32);
        assert!(combined.is_pending());
        a.resolve(1u32);

        let values = combined.value().expect("value missing");
        let values: Vec<u32> = values.iter().map(|v| **v).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn all_rejects_with_first_rejection_after_drain() {
        let a = Promise::new();
        let b: Promise<u32> = Promise::new();
        let combined = all(vec![a.future(), b.future()]);

        b.reject(Error::timed_out());
        // Still pending: all waits for every input.
        assert!(combined.is_pending());
        a.resolve(1);
        assert!(combined.error().expect("error missing").is_timeout());
    }

    #[test]
    fn all_of_empty_resolves_empty() {
        let combined: Future<Vec<Arc<u32>>> = all(Vec::new());
        assert_eq!(combined.status(), FutureStatus::Resolved);
        assert!(combined.value().expect("value missing").is_empty());
    }

    #[test]
    fn all_race_rejects_eagerly() {
        let a: Promise<u32> = Promise::new();
        let b: Promise<u32> = Promise::new();
        let combined = all_race(vec![a.future(), b.future()]);

        b.reject(Error::channel_closed());
        assert_eq!(
            combined.error().expect("error missing").kind(),
            ErrorKind::ChannelClosed
        );
        // Late resolution of the other input is discarded.
        a.resolve(1);
        assert_eq!(combined.status(), FutureStatus::Rejected);
    }

    #[test]
    fn any_takes_first_resolution() {
        let a: Promise<u32> = Promise::new();
        let b: Promise<u32> = Promise::new();
        let combined = any(vec![a.future(), b.future()]);

        a.reject(Error::timed_out());
        assert!(combined.is_pending());
        b.resolve(5);
        assert_eq!(*combined.value().expect("value missing"), 5);
    }

    #[test]
    fn any_rejects_when_all_reject() {
        let a: Promise<u32> = Promise::new();
        let b: Promise<u32> = Promise::new();
        let combined = any(vec![a.future(), b.future()]);

        a.reject(Error::timed_out());
        b.reject(Error::channel_closed());
        assert_eq!(
            combined.error().expect("error missing").kind(),
            ErrorKind::DependencyFailed
        );
    }

    #[test]
    fn first_takes_either_outcome() {
        let a: Promise<u32> = Promise::new();
        let b: Promise<u32> = Promise::new();
        let combined = first(vec![a.future(), b.future()]);

        b.reject(Error::timed_out());
        assert!(combined.error().expect("error missing").is_timeout());
        a.resolve(1);
        assert_eq!(combined.status(), FutureStatus::Rejected);
    }

    #[test]
    fn empty_any_and_first_reject() {
        let a: Future<u32> = any(Vec::new());
        let f: Future<u32> = first(Vec::new());
        assert_eq!(
            a.error().expect("error missing").kind(),
            ErrorKind::DependencyFailed
        );
        assert_eq!(
            f.error().expect("error missing").kind(),
            ErrorKind::DependencyFailed
        );
    }
}
