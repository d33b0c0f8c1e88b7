use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::init_tracing;
use crate::buffer::{Buffer, BufferConfig};
use crate::runner::{HandlerSend, Receiver, Runner, Sender, SenderRunner};
use crate::topology::{ChannelThrough, Redirect};

fn feed(name: &str, values: Vec<u32>) -> Arc<Buffer<u32>> {
    let cfg = BufferConfig::builder().name(name).build().unwrap();
    let buffer = Arc::new(Buffer::with_config(cfg));
    buffer.start().unwrap();
    let feeder = buffer.clone();
    thread::spawn(move || {
        for v in values {
            assert!(feeder.send(v));
        }
        feeder.close();
    });
    buffer
}

fn slow_collector(pause: Duration) -> (Arc<HandlerSend<u32>>, Arc<Mutex<Vec<u32>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = HandlerSend::new("slow", move |v: u32| {
        thread::sleep(pause);
        sink.lock().push(v);
        Ok(ControlFlow::Continue(()))
    });
    (Arc::new(handler), seen)
}

#[test]
fn redirect_into_buffers_then_merge_back() {
    init_tracing();
    let source = feed("source", (0..200).collect());
    let left = Arc::new(Buffer::with_config(BufferConfig::builder().name("left").build().unwrap()));
    let right = Arc::new(Buffer::with_config(BufferConfig::builder().name("right").build().unwrap()));

    let redirect = Redirect::new(
        source as Arc<dyn Receiver<u32>>,
        vec![left.clone() as Arc<dyn SenderRunner<u32>>, right.clone() as Arc<dyn SenderRunner<u32>>],
    );
    let (sink, seen) = slow_collector(Duration::ZERO);
    let through = ChannelThrough::new(
        Some(sink.clone() as Arc<dyn SenderRunner<u32>>),
        vec![left as Arc<dyn Receiver<u32>>, right as Arc<dyn Receiver<u32>>],
    );

    // Redirect starts the middle buffers, so it must run before they are read.
    redirect.run().unwrap();
    through.run().unwrap();
    redirect.wait();
    through.wait();

    let mut seen = seen.lock().clone();
    assert_eq!(seen.len(), 400);
    seen.sort_unstable();
    let expected: Vec<u32> = (0..200).flat_map(|v| [v, v]).collect();
    assert_eq!(seen, expected);
    assert!(sink.is_closed());
    assert!(!redirect.is_running());
    assert!(!through.is_running());
}

#[test]
fn slow_sender_does_not_starve_a_fast_one() {
    init_tracing();
    let source = feed("fan-out", (0..20).collect());
    let (slow, slow_seen) = slow_collector(Duration::from_millis(50));
    let (fast, fast_seen) = slow_collector(Duration::ZERO);

    let redirect = Redirect::new(
        source as Arc<dyn Receiver<u32>>,
        vec![slow as Arc<dyn SenderRunner<u32>>, fast as Arc<dyn SenderRunner<u32>>],
    );
    redirect.run().unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while fast_seen.lock().len() < 20 {
        assert!(std::time::Instant::now() < deadline, "fast sender stalled");
        thread::sleep(Duration::from_millis(1));
    }
    assert!(slow_seen.lock().len() < 20, "the slow sender is still behind");

    redirect.wait();
    assert_eq!(*slow_seen.lock(), (0..20).collect::<Vec<_>>());
    assert_eq!(*fast_seen.lock(), (0..20).collect::<Vec<_>>());
}

#[test]
fn through_from_many_receivers_is_complete() {
    init_tracing();
    let receivers: Vec<Arc<dyn Receiver<u32>>> = (0..5)
        .map(|r| feed("through-src", (r * 1000..r * 1000 + 300).collect()) as Arc<dyn Receiver<u32>>)
        .collect();
    let (sink, seen) = slow_collector(Duration::ZERO);
    let through = ChannelThrough::new(Some(sink as Arc<dyn SenderRunner<u32>>), receivers);
    assert!(!through.is_running());
    through.run().unwrap();
    through.wait();

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 1500);
    for r in 0..5 {
        let own: Vec<u32> = seen.iter().copied().filter(|v| v / 1000 == r).collect();
        assert_eq!(own, (r * 1000..r * 1000 + 300).collect::<Vec<_>>());
    }
}
