use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel as cc;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::errors::SafeqError;
use crate::runner::{discard_any_message, Receiver, SenderRunner};
use crate::subject::Subject;

struct RedirectState {
    started: bool,
    worker: Option<JoinHandle<()>>,
}

/// Broadcasts everything a receiver produces to every sender.
///
/// Each sender is fed by its own lane, so a slow sender never holds back a
/// fast one, while every sender still sees the source order. There is no
/// manual close: when the receiver closes, the lanes flush, every sender is
/// closed and the redirect marks itself closed.
pub struct Redirect<T> {
    receiver: Arc<dyn Receiver<T>>,
    senders: Vec<Arc<dyn SenderRunner<T>>>,
    closed: Arc<Subject<bool>>,
    state: Mutex<RedirectState>,
}

impl<T> Redirect<T>
    where T: Clone + Send + Sync + 'static,
{
    /// `None` senders are dropped. With no sender left, every message is discarded.
    pub fn new<I, S>(receiver: Arc<dyn Receiver<T>>, senders: I) -> Redirect<T>
        where I: IntoIterator<Item = S>,
              S: Into<Option<Arc<dyn SenderRunner<T>>>>,
    {
        Redirect {
            receiver,
            senders: senders.into_iter().filter_map(Into::into).collect(),
            closed: Arc::new(Subject::new(false)),
            state: Mutex::new(RedirectState {
                started: false,
                worker: None,
            }),
        }
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// Starts every sender, then starts forwarding. Runs at most once.
    pub fn run(&self) -> Result<(), SafeqError> {
        let mut state = self.state.lock();
        if state.started {
            return Ok(());
        }

        let receiver = self.receiver.clone();
        let closed = self.closed.clone();
        let worker = if self.senders.is_empty() {
            thread::Builder::new()
                .name("redirect-discard".to_string())
                .spawn(move || {
                    let discarded = discard_any_message(receiver.as_ref());
                    debug!(discarded, "redirect without senders finished");
                    closed.set(true);
                })?
        } else {
            start_all(&self.senders);
            let senders = self.senders.clone();
            thread::Builder::new()
                .name("redirect".to_string())
                .spawn(move || {
                    broadcast(receiver.as_ref(), &senders);
                    closed.set(true);
                })?
        };

        state.started = true;
        state.worker = Some(worker);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().started && !self.closed.get()
    }

    /// Calls `f` once the redirect has closed every sender.
    pub fn observe_closed<F>(&self, f: F)
        where F: Fn(&bool) + Send + Sync + 'static,
    {
        self.closed.set_observer(f);
    }

    /// Blocks until the receiver has closed and every sender has been closed.
    pub fn wait(&self) {
        let worker = self.state.lock().worker.take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("redirect worker panicked");
            }
        }
    }
}

fn start_all<T>(senders: &[Arc<dyn SenderRunner<T>>]) {
    thread::scope(|scope| {
        for sender in senders {
            scope.spawn(move || {
                if let Err(e) = sender.start() {
                    warn!(error = %e, "redirect sender failed to start");
                }
            });
        }
    });
}

fn broadcast<T>(receiver: &dyn Receiver<T>, senders: &[Arc<dyn SenderRunner<T>>])
    where T: Clone + Send,
{
    thread::scope(|scope| {
        let lanes: Vec<cc::Sender<T>> = senders
            .iter()
            .map(|sender| {
                let (lane_tx, lane_rx) = cc::unbounded::<T>();
                scope.spawn(move || {
                    for msg in lane_rx.iter() {
                        if !sender.send(msg) {
                            trace!("redirect sender refused a message");
                        }
                    }
                    sender.close();
                });
                lane_tx
            })
            .collect();

        let mut forwarded = 0usize;
        while let Some(msg) = receiver.receive() {
            if let Some((last, rest)) = lanes.split_last() {
                for lane in rest {
                    let _ = lane.send(msg.clone());
                }
                let _ = last.send(msg);
            }
            forwarded += 1;
        }
        debug!(forwarded, senders = lanes.len(), "redirect source closed");
        // Closing the lanes lets each one flush and close its sender.
        drop(lanes);
    });
}
