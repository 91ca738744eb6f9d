//! strand: futures, fibers, and channels on a cooperative event loop.
//!
//! # Overview
//!
//! strand composes three ideas into one small structured-concurrency
//! substrate:
//!
//! - a [`future::Future`]: an eventual value or error, completable exactly
//!   once from any thread, with ordered listener notification and
//!   combinators ([`future::all`], [`future::any`], [`future::first`],
//!   [`Future::then`](future::Future::then), ...);
//! - a [`fiber::Fiber`]: a cooperatively scheduled coroutine on its own
//!   guard-paged stack, suspending only at explicit [`fiber::wait`] points
//!   and bound to a typed result future;
//! - a [`channel::Channel`]: a bounded FIFO handing futures from producers
//!   to consumers with strict ordering and capacity backpressure.
//!
//! A [`fiber::FiberScheduler`] ties them together as a source on a small
//! prepare/check/dispatch [`event_loop::EventLoop`]: fibers await futures;
//! channels produce futures; external completion sources (timeouts via
//! [`time::Timeout`], AIO backends via [`aio`]) resolve futures from
//! the loop, which moves parked fibers back to the ready queue.
//!
//! # Module Structure
//!
//! - [`error`]: crate-wide error type and result alias
//! - [`future`]: completable futures, promises, combinators
//! - [`fiber`]: fibers, the await primitive, the fiber scheduler
//! - [`scheduler`]: scheduler trait and default registries
//! - [`channel`]: bounded FIFO channel of futures
//! - [`event_loop`]: prepare/check/dispatch loop, wakeups, timer driver
//! - [`time`]: monotonic clock and timeout futures
//! - [`aio`]: completion-based I/O facade (io_uring backend behind the
//!   `aio-uring` feature)
//! - [`test_utils`]: logging and loop-driving helpers for tests
//!
//! # Threading Model
//!
//! Fiber execution is single-threaded per scheduler; futures and channels
//! are thread-safe, so completions and sends may originate anywhere and
//! wake the owning loop through its [`event_loop::Wakeup`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[cfg(unix)]
pub mod aio;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod fiber;
pub mod future;
pub mod scheduler;
pub mod test_utils;
pub mod time;

pub use channel::Channel;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use event_loop::{EventLoop, Readiness, Source, Wakeup};
pub use fiber::{wait, yield_now, Fiber, FiberScheduler, FiberState};
pub use future::{all, all_race, any, first, Future, FutureStatus, Promise};
pub use time::{monotonic_time, Timeout};
