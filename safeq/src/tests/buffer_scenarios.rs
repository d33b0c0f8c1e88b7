use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::init_tracing;
use crate::buffer::{Buffer, BufferConfig, Lifecycle};
use crate::locker::Locker;
use crate::runner::{Receiver, Runner, Sender};

const PRODUCERS: u64 = 4;
const PER_PRODUCER: u64 = 2_000;

fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn concurrent_producers_and_consumers_conserve_messages() {
    init_tracing();
    let cfg = BufferConfig::builder().name("conserve").exit_capacity(16).build().unwrap();
    let buffer = Arc::new(Buffer::with_config(cfg));
    buffer.start().unwrap();

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let buffer = buffer.clone();
            thread::spawn(move || std::iter::from_fn(|| buffer.receive()).collect::<Vec<u64>>())
        })
        .collect();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    assert!(buffer.send(p * PER_PRODUCER + i));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    buffer.close();

    let mut received = Vec::new();
    for consumer in consumers {
        let part = consumer.join().unwrap();
        // Each consumer sees every producer's messages in send order.
        for p in 0..PRODUCERS {
            let own: Vec<u64> = part.iter().copied().filter(|v| v / PER_PRODUCER == p).collect();
            assert!(own.windows(2).all(|w| w[0] < w[1]), "producer {} reordered", p);
        }
        received.extend(part);
    }
    buffer.wait();

    assert_eq!(received.len() as u64, PRODUCERS * PER_PRODUCER);
    let unique: HashSet<u64> = received.into_iter().collect();
    assert_eq!(unique.len() as u64, PRODUCERS * PER_PRODUCER);
    assert_eq!(buffer.lifecycle(), Lifecycle::Closed);
}

#[test]
fn graceful_drain_delivers_backlog_to_a_late_consumer() {
    init_tracing();
    let buffer = Arc::new(Buffer::new());
    buffer.start().unwrap();
    for i in 0..500u32 {
        assert!(buffer.send(i));
    }
    wait_until("backlog to be queued", || buffer.queued() == 500);
    buffer.close();
    assert!(!buffer.send(500), "entry side is closed");
    assert_eq!(buffer.lifecycle(), Lifecycle::Draining);
    assert!(!buffer.is_closed());

    let drained: Vec<u32> = std::iter::from_fn(|| buffer.receive()).collect();
    assert_eq!(drained, (0..500).collect::<Vec<_>>());
    buffer.wait();
    assert!(buffer.is_closed());
}

#[test]
fn clean_buffer_discards_the_queued_backlog() {
    init_tracing();
    let buffer = Buffer::new();
    buffer.start().unwrap();
    for i in 0..100u32 {
        assert!(buffer.send(i));
    }
    wait_until("backlog to be queued", || buffer.queued() == 100);
    buffer.clean_buffer();
    assert_eq!(buffer.queued(), 0);

    assert!(buffer.send(1000));
    buffer.close();
    let rest: Vec<u32> = std::iter::from_fn(|| buffer.receive()).collect();
    assert_eq!(rest, vec![1000]);
    buffer.wait();
}

#[test]
fn dropping_a_running_buffer_releases_its_workers() {
    init_tracing();
    let buffer = Buffer::new();
    buffer.start().unwrap();
    for i in 0..10u32 {
        assert!(buffer.send(i));
    }
    let closed = Arc::new(AtomicBool::new(false));
    let flag = closed.clone();
    buffer.observe_lifecycle(move |state| {
        if *state == Lifecycle::Closed {
            flag.store(true, Ordering::SeqCst);
        }
    });
    drop(buffer);
    wait_until("workers to finish", || closed.load(Ordering::SeqCst));
}

#[test]
fn locker_wakes_the_worker_whose_predicate_dropped() {
    init_tracing();
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    enum Key {
        A,
        B,
    }

    let locker = Arc::new(Locker::new());
    locker.set_subject(Key::A, true, true);
    locker.set_subject(Key::B, true, true);

    let woke = Arc::new(Mutex::new(Vec::new()));
    let worker = {
        let locker = locker.clone();
        let woke = woke.clone();
        thread::spawn(move || {
            loop {
                let keep_going = locker.do_func(|snapshot| {
                    let falses: Vec<Key> = snapshot
                        .iter()
                        .filter(|(_, v)| !**v)
                        .map(|(k, _)| *k)
                        .collect();
                    woke.lock().extend(falses.iter().copied());
                    !falses.contains(&Key::B)
                });
                if !keep_going {
                    break;
                }
                locker.change_value(Key::A, true);
            }
        })
    };

    thread::sleep(Duration::from_millis(20));
    assert!(woke.lock().is_empty(), "all predicates true keeps the worker asleep");

    locker.change_value(Key::A, false);
    wait_until("A to be seen", || woke.lock().contains(&Key::A));
    wait_until("A to be restored", || locker.get(Key::A) == Some(true));
    locker.change_value(Key::B, false);
    worker.join().unwrap();
    assert!(woke.lock().contains(&Key::B));
}
