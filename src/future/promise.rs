//! Write-side handle for completing a future.

use super::{Core, Future, Outcome};
use crate::error::Error;
use std::sync::Arc;

/// Externally completable future.
///
/// A `Promise` is distinguished from [`Future`] only by carrying the public
/// resolve/reject API; the completion invariants are the future's. Clones
/// share the same underlying future, and the first completion wins; later
/// calls are discarded no-ops.
pub struct Promise<T> {
    core: Arc<Core<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Creates a new pending promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core::new_pending()),
        }
    }

    /// Returns a read-side handle to this promise's future.
    #[must_use]
    pub fn future(&self) -> Future<T> {
        Future::from_core(Arc::clone(&self.core))
    }

    /// Resolves the future with `value`. Returns false if already terminal.
    pub fn resolve(&self, value: T) -> bool {
        self.future().complete(Ok(Arc::new(value)))
    }

    /// Resolves the future with an already shared value.
    pub fn resolve_arc(&self, value: Arc<T>) -> bool {
        self.future().complete(Ok(value))
    }

    /// Rejects the future with `error`. Returns false if already terminal.
    pub fn reject(&self, error: Error) -> bool {
        self.future().complete(Err(error))
    }

    /// Completes the future with a prepared outcome.
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        self.future().complete(outcome)
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::future::FutureStatus;

    #[test]
    fn resolve_then_resolve_keeps_first() {
        let promise = Promise::new();
        promise.resolve(1u32);
        promise.resolve(2u32);
        assert_eq!(*promise.future().value().expect("value missing"), 1);
    }

    #[test]
    fn reject_surfaces_error() {
        let promise: Promise<u32> = Promise::new();
        promise.reject(Error::channel_closed());
        let fut = promise.future();
        assert_eq!(fut.status(), FutureStatus::Rejected);
        assert_eq!(
            fut.error().expect("error missing").kind(),
            ErrorKind::ChannelClosed
        );
    }

    #[test]
    fn clones_share_the_future() {
        let promise = Promise::new();
        let other = promise.clone();
        other.resolve(3u32);
        assert_eq!(*promise.future().value().expect("value missing"), 3);
    }
}
