//! Bounded FIFO channel transporting futures between producers and
//! consumers.
//!
//! A [`Channel`] carries [`Future`]s: `send` queues a future (which may
//! still be pending) and hands the producer a future that resolves with
//! the queue depth once the item is accepted; that is the backpressure
//! signal.
//! `receive` hands the consumer a future that is eventually chained to a
//! sent future, preserving strict FIFO on both sides: the k-th receiver is
//! paired with the k-th in-flight send.
//!
//! ```text
//!  send(f) ──► [ sendq ]──►[ queue (≤ capacity) ]──► pairing ──► recvq head
//!                 ▲                                     │
//!                 └── promoted when a receive drains ───┘
//! ```
//!
//! The channel lock is never held across promise completion: pairing
//! decisions are recorded under the lock and performed after it is
//! released, so completion listeners may call back into the channel.
//!
//! Closing the send side rejects receivers that can never be fulfilled;
//! closing the receive side drains everything with `ChannelClosed`
//! rejections. Dropping the channel closes both sides.

use crate::error::Error;
use crate::future::{Future, Promise};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// An in-flight item: the transported future and the producer's promise.
struct ChannelItem<T> {
    future: Future<T>,
    send: Promise<usize>,
}

struct ChannelInner<T> {
    /// Sent items not yet picked up by a receiver.
    queue: VecDeque<ChannelItem<T>>,
    /// Producers parked because `queue` is at capacity.
    sendq: VecDeque<ChannelItem<T>>,
    /// Receiver promises parked because `queue` is empty.
    recvq: VecDeque<Promise<T>>,
    capacity: usize,
    can_send: bool,
    can_receive: bool,
}

/// Completions recorded under the channel lock, performed after release.
enum Deferred<T> {
    Pair {
        future: Future<T>,
        receiver: Promise<T>,
    },
    ResolveSend {
        promise: Promise<usize>,
        depth: usize,
    },
}

impl<T: Send + Sync + 'static> ChannelInner<T> {
    fn has_capacity(&self) -> bool {
        self.sendq.is_empty() && self.queue.len() < self.capacity
    }

    /// Pairs queue items with parked receivers, promoting parked senders as
    /// room opens up. Runs under the channel lock; completions only get
    /// recorded.
    fn pair(&mut self, deferred: &mut Vec<Deferred<T>>) {
        while !self.queue.is_empty() && !self.recvq.is_empty() {
            let (Some(item), Some(receiver)) = (self.queue.pop_front(), self.recvq.pop_front())
            else {
                break;
            };
            deferred.push(Deferred::Pair {
                future: item.future,
                receiver,
            });

            // A receive made room; advance the sendq head into the queue.
            if !self.sendq.is_empty() && self.queue.len() < self.capacity {
                if let Some(parked) = self.sendq.pop_front() {
                    let promise = parked.send.clone();
                    self.queue.push_back(parked);
                    deferred.push(Deferred::ResolveSend {
                        promise,
                        depth: self.queue.len(),
                    });
                }
            }
        }
    }
}

/// Bounded FIFO pairing senders and receivers of futures.
///
/// Thread-safe; senders and receivers may live on different fibers,
/// schedulers, or plain threads.
pub struct Channel<T: Send + Sync + 'static> {
    inner: Mutex<ChannelInner<T>>,
}

impl<T: Send + Sync + 'static> Channel<T> {
    /// Creates a channel holding at most `capacity` items, or effectively
    /// unbounded when `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { usize::MAX } else { capacity };
        Self {
            inner: Mutex::new(ChannelInner {
                queue: VecDeque::new(),
                sendq: VecDeque::new(),
                recvq: VecDeque::new(),
                capacity,
                can_send: true,
                can_receive: true,
            }),
        }
    }

    /// Queues `future` into the channel.
    ///
    /// Returns a future resolving with the queue depth once the channel has
    /// accepted the item: immediately when there is room, or after enough
    /// receives when there is not. If either side of the channel is closed
    /// the returned future is already rejected with `ChannelClosed`.
    pub fn send(&self, future: Future<T>) -> Future<usize> {
        let item = ChannelItem {
            future,
            send: Promise::new(),
        };
        let ret = item.send.future();

        let mut deferred = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !(inner.can_send && inner.can_receive) {
                drop(inner);
                return Future::rejected(Error::channel_closed());
            }

            if inner.has_capacity() {
                let promise = item.send.clone();
                inner.queue.push_back(item);
                deferred.push(Deferred::ResolveSend {
                    promise,
                    depth: inner.queue.len(),
                });
                inner.pair(&mut deferred);
            } else {
                inner.sendq.push_back(item);
            }
        }
        self.run_deferred(deferred);

        ret
    }

    /// Asks for the next item.
    ///
    /// Returns a future that is chained to the paired sent future, so it
    /// reflects that future's eventual value or error, which itself may
    /// still be pending at pairing time. Rejected with `ChannelClosed` when
    /// the receive side is closed, or when the send side is closed and no
    /// in-flight item can ever serve this request.
    pub fn receive(&self) -> Future<T> {
        let receiver: Promise<T> = Promise::new();
        let ret = receiver.future();

        let mut deferred = Vec::new();
        let rejected = {
            let mut inner = self.inner.lock();
            if !inner.can_receive {
                true
            } else if !inner.can_send
                && inner.queue.len() + inner.sendq.len() <= inner.recvq.len()
            {
                // Nothing left that could ever fulfil this receiver.
                true
            } else {
                inner.recvq.push_back(receiver.clone());
                inner.pair(&mut deferred);
                false
            }
        };

        if rejected {
            receiver.reject(Error::channel_closed());
        } else {
            self.run_deferred(deferred);
        }
        ret
    }

    /// Closes the send side.
    ///
    /// Parked receivers beyond what the in-flight items can fulfil are
    /// rejected with `ChannelClosed`; everything already queued remains
    /// receivable.
    pub fn close_send(&self) {
        self.unset_flags(true, false);
    }

    /// Closes the receive side, draining the whole channel.
    ///
    /// Every parked receiver and every parked sender is rejected with
    /// `ChannelClosed`; queued items are dropped.
    pub fn close_receive(&self) {
        self.unset_flags(false, true);
    }

    /// True while the send side is open.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.inner.lock().can_send
    }

    /// True while the receive side is open.
    #[must_use]
    pub fn can_receive(&self) -> bool {
        self.inner.lock().can_receive
    }

    /// The configured capacity (`usize::MAX` when unbounded).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Number of items sitting in the queue right now.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// True when no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    fn run_deferred(&self, deferred: Vec<Deferred<T>>) {
        for action in deferred {
            match action {
                Deferred::Pair { future, receiver } => future.chain(&receiver),
                Deferred::ResolveSend { promise, depth } => {
                    promise.resolve(depth);
                }
            }
        }
    }

    fn unset_flags(&self, close_send: bool, close_receive: bool) {
        let mut doomed_receivers = Vec::new();
        let mut doomed_senders = Vec::new();
        let mut dropped_items = Vec::new();
        {
            let mut inner = self.inner.lock();

            if close_send && inner.can_send {
                inner.can_send = false;
                let pending = inner.sendq.len() + inner.queue.len();
                while inner.recvq.len() > pending {
                    if let Some(receiver) = inner.recvq.pop_back() {
                        doomed_receivers.push(receiver);
                    }
                }
            }

            if close_receive && inner.can_receive {
                inner.can_receive = false;
                doomed_receivers.extend(inner.recvq.drain(..));
                dropped_items.extend(inner.queue.drain(..));
                for item in inner.sendq.drain(..) {
                    doomed_senders.push(item.send.clone());
                    dropped_items.push(item);
                }
            }
        }

        if !doomed_receivers.is_empty() || !doomed_senders.is_empty() {
            tracing::debug!(
                receivers = doomed_receivers.len(),
                senders = doomed_senders.len(),
                "channel close rejecting waiters"
            );
        }
        for receiver in doomed_receivers {
            receiver.reject(Error::channel_closed());
        }
        for sender in doomed_senders {
            sender.reject(Error::channel_closed());
        }
        drop(dropped_items);
    }
}

impl<T: Send + Sync + 'static> Drop for Channel<T> {
    fn drop(&mut self) {
        self.unset_flags(true, true);
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Channel")
            .field("queued", &inner.queue.len())
            .field("parked_sends", &inner.sendq.len())
            .field("parked_receives", &inner.recvq.len())
            .field("can_send", &inner.can_send)
            .field("can_receive", &inner.can_receive)
            .finish_non_exhaustive()
    }
}
