//! Conformance tests for future completion invariants.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strand::test_utils::init_test_logging;
use strand::{all, any, Error, ErrorKind, Future, FutureStatus, Promise};

#[test]
fn completion_is_exactly_once_under_contention() {
    init_test_logging();

    for round in 0..50 {
        let promise: Promise<usize> = Promise::new();
        let fut = promise.future();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        fut.add_listener(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        let threads: Vec<_> = (0..4)
            .map(|i| {
                let promise = promise.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        promise.resolve(i)
                    } else {
                        promise.reject(Error::timed_out())
                    }
                })
            })
            .collect();

        let wins: usize = threads
            .into_iter()
            .map(|t| usize::from(t.join().expect("completer panicked")))
            .sum();

        assert_eq!(wins, 1, "round {round}: exactly one completion must win");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_ne!(fut.status(), FutureStatus::Pending);
    }
}

#[test]
fn listener_order_is_stable_across_many_registrations() {
    init_test_logging();

    let promise: Promise<()> = Promise::new();
    let fut = promise.future();
    let order = Arc::new(ordered_log::Order::default());
    for i in 0..100 {
        let order = Arc::clone(&order);
        fut.add_listener(move |_| order.push(i));
    }
    promise.resolve(());

    let seen = order.snapshot();
    let expected: Vec<usize> = (0..100).collect();
    assert_eq!(seen, expected);
}

#[test]
fn chain_transfers_both_outcomes() {
    init_test_logging();

    let src: Promise<u32> = Promise::new();
    let dst: Promise<u32> = Promise::new();
    src.future().chain(&dst);
    src.resolve(4);
    assert_eq!(*dst.future().value().expect("value missing"), 4);

    let src: Promise<u32> = Promise::new();
    let dst: Promise<u32> = Promise::new();
    src.future().chain(&dst);
    src.reject(Error::channel_closed());
    assert_eq!(
        dst.future().error().expect("error missing").kind(),
        ErrorKind::ChannelClosed
    );
}

#[test]
fn then_chain_composes_across_threads() {
    init_test_logging();

    let start: Promise<u32> = Promise::new();
    let doubled = start.future().then(|v| Future::resolved(*v * 2));
    let plus_one = doubled.then(|v| Future::resolved(*v + 1));

    let completer = {
        let start = start.clone();
        std::thread::spawn(move || start.resolve(20))
    };
    completer.join().expect("completer panicked");

    assert_eq!(*plus_one.value().expect("value missing"), 41);
}

#[test]
fn aggregates_settle_with_concurrent_completers() {
    init_test_logging();

    let promises: Vec<Promise<usize>> = (0..8).map(|_| Promise::new()).collect();
    let combined = all(promises.iter().map(Promise::future).collect());
    let winner = any(promises.iter().map(Promise::future).collect());

    let threads: Vec<_> = promises
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let p = p.clone();
            std::thread::spawn(move || p.resolve(i))
        })
        .collect();
    for t in threads {
        t.join().expect("completer panicked");
    }

    let values = combined.value().expect("all did not resolve");
    let values: Vec<usize> = values.iter().map(|v| **v).collect();
    assert_eq!(values, (0..8).collect::<Vec<_>>());
    assert!(winner.value().is_some());
}

/// Tiny ordered-log helper so the test does not depend on crate internals.
mod ordered_log {
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct Order(Mutex<Vec<usize>>);

    impl Order {
        pub fn push(&self, i: usize) {
            self.0.lock().expect("order lock poisoned").push(i);
        }

        pub fn snapshot(&self) -> Vec<usize> {
            self.0.lock().expect("order lock poisoned").clone()
        }
    }
}
