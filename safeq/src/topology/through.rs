use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::buffer::{Buffer, BufferConfig};
use crate::errors::SafeqError;
use crate::runner::{discard_any_message, Receiver, Runner, Sender, SenderRunner};
use crate::subject::Subject;

struct ThroughState {
    started: bool,
    workers: Vec<JoinHandle<()>>,
}

/// Merges every receiver into one sender through an internal [`Buffer`].
///
/// Messages from one receiver keep their relative order; messages from
/// different receivers interleave arbitrarily. Once every receiver has
/// closed and the merge point has drained, the sender is closed. If the
/// sender refuses a message, relaying stops, the rest of the merge point is
/// discarded and the sender is left as is.
pub struct ChannelThrough<T> {
    sender: Option<Arc<dyn SenderRunner<T>>>,
    receivers: Vec<Arc<dyn Receiver<T>>>,
    config: BufferConfig,
    closed: Arc<Subject<bool>>,
    state: Mutex<ThroughState>,
}

impl<T> ChannelThrough<T>
    where T: Send + Sync + 'static,
{
    /// `None` receivers are dropped. Without a sender, every receiver is drained
    /// and its messages discarded.
    pub fn new<I, R>(sender: Option<Arc<dyn SenderRunner<T>>>, receivers: I) -> ChannelThrough<T>
        where I: IntoIterator<Item = R>,
              R: Into<Option<Arc<dyn Receiver<T>>>>,
    {
        ChannelThrough::with_config(BufferConfig {
            name: "through".to_string(),
            ..BufferConfig::default()
        }, sender, receivers)
    }

    /// Like [`ChannelThrough::new`], with `config` for the internal buffer.
    pub fn with_config<I, R>(
        config: BufferConfig,
        sender: Option<Arc<dyn SenderRunner<T>>>,
        receivers: I,
    ) -> ChannelThrough<T>
        where I: IntoIterator<Item = R>,
              R: Into<Option<Arc<dyn Receiver<T>>>>,
    {
        ChannelThrough {
            sender,
            receivers: receivers.into_iter().filter_map(Into::into).collect(),
            config,
            closed: Arc::new(Subject::new(false)),
            state: Mutex::new(ThroughState {
                started: false,
                workers: Vec::new(),
            }),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    /// Starts the sender and the merge point, then starts relaying. Runs at most once.
    pub fn run(&self) -> Result<(), SafeqError> {
        let mut state = self.state.lock();
        if state.started {
            return Ok(());
        }

        if self.receivers.is_empty() {
            state.started = true;
            self.closed.set(true);
            debug!("through without receivers closed at once");
            return Ok(());
        }

        let receivers = self.receivers.clone();
        let closed = self.closed.clone();
        let sender = match &self.sender {
            Some(sender) => sender.clone(),
            None => {
                let worker = thread::Builder::new()
                    .name("through-discard".to_string())
                    .spawn(move || {
                        let discarded = drain_all(&receivers, |r| discard_any_message(r.as_ref()));
                        debug!(discarded, "through without sender finished");
                        closed.set(true);
                    })?;
                state.started = true;
                state.workers.push(worker);
                return Ok(());
            }
        };

        let buffer = Arc::new(Buffer::with_config(self.config.clone()));
        let (sender_started, buffer_started) = thread::scope(|scope| {
            let starting = scope.spawn(|| sender.start());
            let buffer_started = buffer.start();
            let sender_started = starting
                .join()
                .unwrap_or_else(|_| Err(SafeqError::Panic("sender start panicked".to_string())));
            (sender_started, buffer_started)
        });
        if let Err(e) = sender_started {
            warn!(error = %e, "through sender failed to start");
        }
        buffer_started?;

        let relay = {
            let buffer = buffer.clone();
            thread::Builder::new()
                .name(format!("{}-relay", self.config.name))
                .spawn(move || {
                    relay(buffer.as_ref(), sender.as_ref());
                    closed.set(true);
                })?
        };
        let merge = {
            let buffer = buffer.clone();
            thread::Builder::new()
                .name(format!("{}-merge", self.config.name))
                .spawn(move || {
                    let merged = drain_all(&receivers, |r| forward(r.as_ref(), buffer.as_ref()));
                    debug!(merged, "through receivers closed");
                    buffer.close();
                })
        };
        let merge = match merge {
            Ok(merge) => merge,
            Err(e) => {
                // Closing the merge point lets the relay finish on its own.
                buffer.close();
                state.started = true;
                state.workers.push(relay);
                return Err(e.into());
            }
        };

        state.started = true;
        state.workers.push(relay);
        state.workers.push(merge);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().started && !self.closed.get()
    }

    /// Calls `f` once relaying has finished.
    pub fn observe_closed<F>(&self, f: F)
        where F: Fn(&bool) + Send + Sync + 'static,
    {
        self.closed.set_observer(f);
    }

    /// Blocks until every receiver has closed and relaying has finished.
    pub fn wait(&self) {
        let workers: Vec<JoinHandle<()>> = self.state.lock().workers.drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("through worker panicked");
            }
        }
    }
}

/// Runs `f` for every receiver in parallel and sums the results.
fn drain_all<T, F>(receivers: &[Arc<dyn Receiver<T>>], f: F) -> usize
    where F: Fn(&Arc<dyn Receiver<T>>) -> usize + Sync,
{
    thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = receivers
            .iter()
            .map(|receiver| scope.spawn(move || f(receiver)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|_| {
                error!("receiver drain panicked");
                0
            }))
            .sum()
    })
}

fn forward<T>(receiver: &dyn Receiver<T>, buffer: &Buffer<T>) -> usize
    where T: Send + Sync + 'static,
{
    let mut forwarded = 0;
    while let Some(msg) = receiver.receive() {
        if !buffer.send(msg) {
            error!(buffer = %buffer.name(), "merge point closed while receivers are open");
            break;
        }
        forwarded += 1;
    }
    forwarded
}

fn relay<T>(buffer: &Buffer<T>, sender: &dyn SenderRunner<T>)
    where T: Send + Sync + 'static,
{
    let mut relayed = 0usize;
    while let Some(msg) = buffer.receive() {
        if !sender.send(msg) {
            let discarded = discard_any_message(buffer);
            warn!(relayed, discarded, "through sender refused a message");
            return;
        }
        relayed += 1;
    }
    sender.close();
    debug!(relayed, "through relay finished");
}
