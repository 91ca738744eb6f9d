//! Asynchronous I/O glue: completion-based read/write as futures.
//!
//! The core treats AIO as an external collaborator reached through two
//! traits. An [`AioBackend`] manufactures [`AioContext`]s bound to an
//! event loop; a context turns positioned reads and writes into ordinary
//! [`Future`]s that the backend's event-loop source completes when the
//! kernel reports completion.
//!
//! Buffers are owned: callers pass a `Vec<u8>` and get it back inside
//! [`AioBuf`] together with the transferred length, which keeps the buffer
//! alive and address-stable for as long as the kernel may write to it.
//!
//! The io_uring backend (`UringAioBackend`, Linux, feature `aio-uring`)
//! is the production implementation; anything else that can complete a
//! promise (a thread pool, a test double) can implement the same traits.

#[cfg(all(target_os = "linux", feature = "aio-uring"))]
mod uring;

#[cfg(all(target_os = "linux", feature = "aio-uring"))]
pub use uring::UringAioBackend;

use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::future::Future;
use std::os::fd::RawFd;
use std::sync::Arc;

/// An owned buffer handed back by a completed AIO operation.
#[derive(Debug)]
pub struct AioBuf {
    /// The buffer passed to the operation.
    pub buf: Vec<u8>,
    /// Bytes actually read or written.
    pub len: usize,
}

impl AioBuf {
    /// The transferred prefix of the buffer.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len.min(self.buf.len())]
    }
}

/// A per-event-loop AIO submission context.
///
/// Operations return futures that resolve with [`AioBuf`] on completion or
/// reject with [`ErrorKind::Io`] carrying the OS error.
///
/// [`ErrorKind::Io`]: crate::error::ErrorKind::Io
pub trait AioContext: Send + Sync {
    /// Reads up to `buf.len()` bytes from `fd` at `offset`.
    fn read(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> Future<AioBuf>;

    /// Writes `buf` to `fd` at `offset`.
    fn write(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> Future<AioBuf>;
}

/// Factory for [`AioContext`]s.
pub trait AioBackend: Send + Sync {
    /// Creates a context whose completions are delivered through
    /// `event_loop`.
    ///
    /// # Errors
    ///
    /// Backend-specific setup failures surface as `ErrorKind::Io`.
    fn create_context(&self, event_loop: &EventLoop) -> Result<Arc<dyn AioContext>>;
}
