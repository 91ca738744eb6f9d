//! io_uring AIO backend (Linux only, feature `aio-uring`).
//!
//! One [`UringContext`] owns an io_uring ring plus an eventfd that the
//! kernel signals on completion. The eventfd is registered with the event
//! loop's poller, so completions wake a blocked iteration; the context is
//! also an event-loop [`Source`]:
//!
//! - `prepare` submits queued operations while there is SQE room,
//! - `check` reports whether completions are waiting,
//! - `dispatch` drains the eventfd and the completion ring, completing the
//!   futures outside the ring lock.
//!
//! Operations park in a pending table keyed by sqe user_data; the table
//! owns each buffer, which keeps the kernel's target address valid until
//! the matching CQE has been seen.
//!
//! NOTE: this module uses unsafe to create the eventfd and push SQEs. The
//! safety invariants are documented inline.
#![allow(unsafe_code)]

use super::{AioBackend, AioBuf, AioContext};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, Readiness, Source, Wakeup};
use crate::future::{Future, Promise};
use io_uring::{opcode, types, IoUring};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const DEFAULT_URING_ENTRIES: u32 = 32;

#[derive(Debug, Clone, Copy)]
enum OpKind {
    Read,
    Write,
}

struct PendingOp {
    kind: OpKind,
    fd: RawFd,
    offset: u64,
    /// Owned for address stability until the CQE lands.
    buf: Vec<u8>,
    promise: Promise<AioBuf>,
}

/// Backend producing io_uring-driven [`AioContext`]s.
#[derive(Debug, Clone, Copy)]
pub struct UringAioBackend {
    entries: u32,
}

impl UringAioBackend {
    /// Backend with the default ring size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DEFAULT_URING_ENTRIES,
        }
    }

    /// Backend with an explicit ring size.
    #[must_use]
    pub fn with_entries(entries: u32) -> Self {
        Self { entries }
    }
}

impl Default for UringAioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AioBackend for UringAioBackend {
    fn create_context(&self, event_loop: &EventLoop) -> Result<Arc<dyn AioContext>> {
        let context = UringContext::new(self.entries, event_loop)?;
        event_loop.add_source(Arc::clone(&context) as Arc<dyn Source>);
        Ok(context)
    }
}

struct UringContext {
    ring: Mutex<IoUring>,
    eventfd: OwnedFd,
    /// In-flight operations keyed by sqe user_data.
    ops: Mutex<HashMap<u64, PendingOp>>,
    /// Operation ids accepted but not yet pushed to the SQ.
    queued: Mutex<VecDeque<u64>>,
    next_id: AtomicU64,
    wakeup: Wakeup,
    poller: Arc<polling::Poller>,
    poller_key: usize,
}

impl UringContext {
    fn new(entries: u32, event_loop: &EventLoop) -> Result<Arc<Self>> {
        let ring = IoUring::new(entries).map_err(Error::from)?;
        let eventfd = create_eventfd()?;
        ring.submitter()
            .register_eventfd(eventfd.as_raw_fd())
            .map_err(Error::from)?;

        // Completions signal the eventfd; watching it from the poller turns
        // them into event-loop wakeups.
        let poller = event_loop.poller();
        let poller_key = eventfd.as_raw_fd() as usize;
        poller
            .add(
                eventfd.as_raw_fd(),
                polling::Event::readable(poller_key),
            )
            .map_err(Error::from)?;

        Ok(Arc::new(Self {
            ring: Mutex::new(ring),
            eventfd,
            ops: Mutex::new(HashMap::new()),
            queued: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
            wakeup: event_loop.wakeup(),
            poller,
            poller_key,
        }))
    }

    fn submit_op(&self, kind: OpKind, fd: RawFd, buf: Vec<u8>, offset: u64) -> Future<AioBuf> {
        let promise: Promise<AioBuf> = Promise::new();
        let future = promise.future();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.ops.lock().insert(
            id,
            PendingOp {
                kind,
                fd,
                offset,
                buf,
                promise,
            },
        );
        self.queued.lock().push_back(id);
        tracing::trace!(id, ?kind, fd, offset, "aio operation queued");

        // A blocked loop would otherwise never reach prepare.
        self.wakeup.notify();
        future
    }

    /// Pushes queued operations while the submission queue has room.
    fn flush_queued(&self) {
        let mut ring = self.ring.lock();
        let mut queued = self.queued.lock();
        let mut submitted = false;

        while let Some(id) = queued.front().copied() {
            let entry = {
                let mut ops = self.ops.lock();
                let Some(op) = ops.get_mut(&id) else {
                    queued.pop_front();
                    continue;
                };
                let len = u32::try_from(op.buf.len()).unwrap_or(u32::MAX);
                match op.kind {
                    OpKind::Read => opcode::Read::new(types::Fd(op.fd), op.buf.as_mut_ptr(), len)
                        .offset(op.offset)
                        .build()
                        .user_data(id),
                    OpKind::Write => opcode::Write::new(types::Fd(op.fd), op.buf.as_ptr(), len)
                        .offset(op.offset)
                        .build()
                        .user_data(id),
                }
            };

            // SAFETY: the entry's buffer pointer targets the Vec owned by
            // the pending table, which is not removed (and whose heap
            // allocation never moves) until this operation's CQE is seen.
            let pushed = unsafe { ring.submission().push(&entry).is_ok() };
            if pushed {
                queued.pop_front();
                submitted = true;
            } else {
                // SQ full; retry on the next prepare.
                break;
            }
        }

        if submitted {
            if let Err(error) = ring.submit() {
                tracing::warn!(%error, "io_uring submit failed");
            }
        }
    }

    fn drain_eventfd(&self) {
        let fd = self.eventfd.as_raw_fd();
        let mut counter = [0u8; 8];
        // SAFETY: reads into a local buffer from an eventfd we own; the fd
        // is nonblocking, so this cannot hang.
        let _ = unsafe {
            libc::read(
                fd,
                counter.as_mut_ptr().cast::<libc::c_void>(),
                counter.len(),
            )
        };
        // Oneshot registration: re-arm for the next completion burst.
        if let Err(error) = self
            .poller
            .modify(fd, polling::Event::readable(self.poller_key))
        {
            tracing::warn!(%error, "failed to re-arm aio eventfd");
        }
    }

    /// Drains the completion ring and completes futures outside the lock.
    fn complete_ready(&self) -> bool {
        let mut finished: Vec<(PendingOp, i32)> = Vec::new();
        {
            let mut ring = self.ring.lock();
            let mut ops = self.ops.lock();
            let completion = ring.completion();
            for cqe in completion {
                let id = cqe.user_data();
                if let Some(op) = ops.remove(&id) {
                    finished.push((op, cqe.result()));
                }
            }
        }

        let any = !finished.is_empty();
        for (op, result) in finished {
            if result < 0 {
                op.promise
                    .reject(Error::from(io::Error::from_raw_os_error(-result)));
            } else {
                let len = result as usize;
                op.promise.resolve(AioBuf { buf: op.buf, len });
            }
        }
        any
    }
}

impl AioContext for UringContext {
    fn read(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> Future<AioBuf> {
        self.submit_op(OpKind::Read, fd, buf, offset)
    }

    fn write(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> Future<AioBuf> {
        self.submit_op(OpKind::Write, fd, buf, offset)
    }
}

impl Source for UringContext {
    fn name(&self) -> &'static str {
        "uring-aio"
    }

    fn prepare(&self) -> Readiness {
        self.flush_queued();
        if self.ring.lock().completion().is_empty() {
            Readiness::wait()
        } else {
            Readiness::now()
        }
    }

    fn check(&self) -> bool {
        !self.ring.lock().completion().is_empty()
    }

    fn dispatch(&self) -> bool {
        self.drain_eventfd();
        let completed = self.complete_ready();
        self.flush_queued();
        completed
    }
}

impl std::fmt::Debug for UringContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UringContext")
            .field("in_flight", &self.ops.lock().len())
            .field("queued", &self.queued.lock().len())
            .finish_non_exhaustive()
    }
}

fn create_eventfd() -> Result<OwnedFd> {
    // SAFETY: eventfd(2) returns a fresh descriptor we immediately wrap in
    // an OwnedFd, which becomes its sole owner.
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(Error::from(io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
