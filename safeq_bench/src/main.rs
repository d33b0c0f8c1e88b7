use std::error::Error;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};
use signal_hook::iterator::Signals;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use safeq::buffer::{Buffer, BufferConfig};
use safeq::runner::{Batch, HandlerSend, Receiver, Runner, Sender, SenderRunner, SignalChannel};
use safeq::topology::Redirect;

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "safeq-bench.toml")]
    config: String,
    #[clap(long)]
    producers: Option<usize>,
    #[clap(long)]
    messages: Option<u64>,
    /// Number of senders a Redirect fans every message out to. 0 reads the buffer directly.
    #[clap(long = "fan-out")]
    fan_out: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct BenchConfig {
    producers: usize,
    messages_per_producer: u64,
    fan_out: usize,
    buffer: BufferConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            producers: 4,
            messages_per_producer: 1_000_000,
            fan_out: 0,
            buffer: BufferConfig::default(),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let mut cfg: BenchConfig = confy::load_path(&opts.config)?;
    if let Some(producers) = opts.producers {
        cfg.producers = producers;
    }
    if let Some(messages) = opts.messages {
        cfg.messages_per_producer = messages;
    }
    if let Some(fan_out) = opts.fan_out {
        cfg.fan_out = fan_out;
    }
    cfg.buffer.validate()?;
    info!(?cfg, "bench configured");

    let stopping = Arc::new(AtomicBool::new(false));
    let stop_signals = {
        let stopping = stopping.clone();
        Arc::new(SignalChannel::new(move |signal| {
            // Producers stop, the buffer drains what it already holds.
            warn!(signal, "stopping");
            stopping.store(true, Ordering::SeqCst);
        }))
    };
    stop_signals.start()?;
    let mut signals = Signals::new(&[libc::SIGHUP, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM])?;
    let signals_handle = signals.handle();
    let signal_listener = {
        let stop_signals = stop_signals.clone();
        thread::spawn(move || {
            for signal in signals.forever() {
                stop_signals.send(signal);
            }
        })
    };

    run(&cfg, &stopping)?;

    signals_handle.close();
    let _ = signal_listener.join();
    stop_signals.close();
    Ok(())
}

fn run(cfg: &BenchConfig, stopping: &Arc<AtomicBool>) -> Result<(), Box<dyn Error>> {
    let buffer = Arc::new(Buffer::<u64>::with_config(cfg.buffer.clone()));
    buffer.start()?;

    let start = Instant::now();
    let received = Arc::new(AtomicU64::new(0));
    let consumer = spawn_consumers(cfg, &buffer, &received)?;

    let sent = Arc::new(AtomicU64::new(0));
    let mut producers = Batch::new();
    for p in 0..cfg.producers {
        let buffer = buffer.clone();
        let stopping = stopping.clone();
        let total = sent.clone();
        let messages = cfg.messages_per_producer;
        let mut produced = 0u64;
        producers.add(format!("producer-{}", p), move || {
            if produced >= messages || stopping.load(Ordering::Relaxed) {
                return Ok(ControlFlow::Break(()));
            }
            if !buffer.send(produced) {
                return Err("bench buffer closed".into());
            }
            produced += 1;
            total.fetch_add(1, Ordering::Relaxed);
            if p == 0 && produced % 100_000 == 0 {
                eprint!("\rTotal {} ops (producer 0)", produced);
            }
            Ok(ControlFlow::Continue(()))
        });
    }
    producers.start_all()?;
    for (id, error) in producers.wait_all() {
        if let Some(error) = error {
            warn!(producer = %id, %error, "producer stopped early");
        }
    }
    let sent = sent.load(Ordering::SeqCst);
    buffer.close();
    consumer();

    let duration = start.elapsed();
    let delivered = received.load(Ordering::SeqCst);
    let iops = (delivered as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{:#?}K messages delivered/s. Sent: {}, delivered: {}, total time: {:#?}",
        (iops / 1000f64) as u64,
        sent,
        delivered,
        duration
    );
    let expected = sent * cfg.fan_out.max(1) as u64;
    if delivered != expected {
        return Err(format!("delivered {} messages, expected {}", delivered, expected).into());
    }
    Ok(())
}

/// Starts the consuming side and returns a function that waits for it to finish.
fn spawn_consumers(
    cfg: &BenchConfig,
    buffer: &Arc<Buffer<u64>>,
    received: &Arc<AtomicU64>,
) -> Result<Box<dyn FnOnce()>, Box<dyn Error>> {
    if cfg.fan_out == 0 {
        let buffer = buffer.clone();
        let received = received.clone();
        let reader = thread::Builder::new()
            .name("bench-consumer".to_string())
            .spawn(move || {
                while buffer.receive().is_some() {
                    received.fetch_add(1, Ordering::Relaxed);
                }
            })?;
        return Ok(Box::new(move || {
            if reader.join().is_err() {
                warn!("consumer panicked");
            }
        }));
    }

    let senders: Vec<Arc<dyn SenderRunner<u64>>> = (0..cfg.fan_out)
        .map(|i| {
            let received = received.clone();
            let handler = HandlerSend::new(format!("bench-sink-{}", i), move |_: u64| {
                received.fetch_add(1, Ordering::Relaxed);
                Ok(ControlFlow::Continue(()))
            });
            Arc::new(handler) as Arc<dyn SenderRunner<u64>>
        })
        .collect();
    let redirect = Redirect::new(buffer.clone() as Arc<dyn Receiver<u64>>, senders);
    redirect.run()?;
    Ok(Box::new(move || redirect.wait()))
}
