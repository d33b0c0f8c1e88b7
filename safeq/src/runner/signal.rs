use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel as cc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Runner, Sender};
use crate::errors::{panic_message, SafeqError};

struct SignalState {
    signals: Option<cc::Sender<i32>>,
    listener: Option<JoinHandle<()>>,
}

/// Calls a function for every signal code it is sent, on one listener thread.
pub struct SignalChannel {
    on_signal: Arc<dyn Fn(i32) + Send + Sync>,
    state: Mutex<SignalState>,
}

impl SignalChannel {
    pub fn new<F>(on_signal: F) -> SignalChannel
        where F: Fn(i32) + Send + Sync + 'static,
    {
        SignalChannel {
            on_signal: Arc::new(on_signal),
            state: Mutex::new(SignalState {
                signals: None,
                listener: None,
            }),
        }
    }

    /// Blocks until the channel is closed and every pending signal was handled.
    pub fn wait(&self) {
        let listener = self.state.lock().listener.take();
        if let Some(listener) = listener {
            if listener.join().is_err() {
                warn!("signal listener exited abnormally");
            }
        }
    }

    fn listen(on_signal: Arc<dyn Fn(i32) + Send + Sync>, signals: cc::Receiver<i32>) {
        for code in signals.iter() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| on_signal(code))) {
                warn!(signal = code, panic = %panic_message(payload.as_ref()), "signal handler panicked");
            }
        }
        debug!("signal listener finished");
    }
}

impl Sender<i32> for SignalChannel {
    fn send(&self, code: i32) -> bool {
        let signals = self.state.lock().signals.clone();
        match signals {
            Some(signals) => signals.send(code).is_ok(),
            None => false,
        }
    }
}

impl Runner for SignalChannel {
    fn start(&self) -> Result<(), SafeqError> {
        let mut state = self.state.lock();
        if state.signals.is_some() {
            return Ok(());
        }
        if let Some(previous) = state.listener.take() {
            if previous.join().is_err() {
                warn!("signal listener exited abnormally");
            }
        }

        let (signals_tx, signals_rx) = cc::unbounded();
        let on_signal = self.on_signal.clone();
        let listener = thread::Builder::new()
            .name("signal-listener".to_string())
            .spawn(move || SignalChannel::listen(on_signal, signals_rx))?;
        state.signals = Some(signals_tx);
        state.listener = Some(listener);
        Ok(())
    }

    /// Stops accepting signals and waits for the pending ones to be handled.
    fn close(&self) {
        let listener = {
            let mut state = self.state.lock();
            state.signals = None;
            state.listener.take()
        };
        if let Some(listener) = listener {
            if listener.thread().id() != thread::current().id() && listener.join().is_err() {
                warn!("signal listener exited abnormally");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().signals.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (SignalChannel, Arc<Mutex<Vec<i32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (SignalChannel::new(move |code| sink.lock().push(code)), seen)
    }

    #[test]
    fn handles_every_code_in_order() {
        let (channel, seen) = recorder();
        assert!(!channel.send(1));
        assert!(channel.is_closed());

        channel.start().unwrap();
        channel.start().unwrap();
        for code in [2, 15, 2] {
            assert!(channel.send(code));
        }
        channel.close();

        assert_eq!(*seen.lock(), vec![2, 15, 2]);
        assert!(channel.is_closed());
        assert!(!channel.send(9));
    }

    #[test]
    fn wait_returns_once_closed_elsewhere() {
        let (channel, seen) = recorder();
        let channel = Arc::new(channel);
        channel.start().unwrap();

        let closer = channel.clone();
        let closing = thread::spawn(move || {
            closer.send(3);
            closer.close();
        });
        channel.wait();
        closing.join().unwrap();
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn survives_a_panicking_handler_and_restarts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let channel = SignalChannel::new(move |code| {
            if code < 0 {
                panic!("bad code");
            }
            sink.lock().push(code);
        });
        channel.start().unwrap();
        channel.send(-1);
        channel.send(1);
        channel.close();

        channel.start().unwrap();
        channel.send(2);
        channel.close();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }
}
