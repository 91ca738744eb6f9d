//! Error types and error handling strategy for strand.
//!
//! Errors in this crate are values carried by rejected futures; they are
//! never raised across stack frames except through [`crate::fiber::wait`],
//! where a rejection surfaces as the caller's `Err`. Because a single
//! rejection fans out to every listener of a future, [`Error`] is `Clone`
//! and any underlying source error is shared behind an `Arc`.

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// One side of a channel was closed.
    ChannelClosed,
    /// A deadline elapsed before the awaited event occurred.
    TimedOut,
    /// A combinator dependency rejected (or no dependency could complete).
    DependencyFailed,
    /// A fiber exited abnormally (its entry panicked).
    FiberExited,
    /// Operation was cancelled.
    Cancelled,
    /// An I/O operation failed.
    Io,
    /// Internal contract violation (bug or misuse of the API).
    Internal,
    /// User-provided error.
    User,
}

/// The main error type for strand operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error reports a closed channel.
    #[must_use]
    pub const fn is_channel_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::ChannelClosed)
    }

    /// Returns true if this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::TimedOut)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// A closed-channel error, worded as the channel module rejects waiters.
    #[must_use]
    pub fn channel_closed() -> Self {
        Self::new(ErrorKind::ChannelClosed).with_context("channel is closed")
    }

    /// A timeout rejection.
    #[must_use]
    pub fn timed_out() -> Self {
        Self::new(ErrorKind::TimedOut).with_context("operation timed out")
    }

    /// A combinator rejection when no dependency could complete.
    #[must_use]
    pub fn dependency_failed() -> Self {
        Self::new(ErrorKind::DependencyFailed).with_context("dependency failed")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io).with_source(e)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for strand operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_context() {
        let err = Error::channel_closed();
        assert_eq!(err.to_string(), "ChannelClosed: channel is closed");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::User)
            .with_context("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn clone_preserves_kind_and_source() {
        let err = Error::new(ErrorKind::Io).with_source(Underlying);
        let cloned = err.clone();
        assert_eq!(cloned.kind(), ErrorKind::Io);
        assert!(cloned.source().is_some());
    }

    #[test]
    fn from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let err = res.context("read failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.to_string(), "Io: read failed");
    }

    #[test]
    fn predicates_match_kind() {
        assert!(Error::timed_out().is_timeout());
        assert!(!Error::timed_out().is_channel_closed());
        assert!(Error::channel_closed().is_channel_closed());
    }
}
