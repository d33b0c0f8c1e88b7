use std::error::Error;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel as cc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Runner, Sender};
use crate::errors::{panic_message, SafeqError};

pub type RoutineResult = Result<ControlFlow<()>, Box<dyn Error + Send + Sync + 'static>>;

type Routine<T> = Box<dyn FnMut(T) -> RoutineResult + Send + 'static>;

struct HandlerState<T> {
    messages: Option<cc::Sender<T>>,
    errors: Option<cc::Receiver<SafeqError>>,
    worker: Option<JoinHandle<()>>,
}

/// A sender that runs a routine on a worker thread for every message it is sent.
///
/// A routine error does not stop the worker: it is reported through
/// [`HandlerSend::receive_err`] and the next message is processed. Returning
/// `ControlFlow::Break` stops the worker, as does a panic (reported as
/// [`SafeqError::Panic`]). The handler can be started again after it closed.
pub struct HandlerSend<T> {
    name: String,
    routine: Arc<Mutex<Routine<T>>>,
    running: Arc<AtomicBool>,
    state: Mutex<HandlerState<T>>,
}

impl<T> HandlerSend<T>
    where T: Send + 'static,
{
    pub fn new<F>(name: impl Into<String>, routine: F) -> HandlerSend<T>
        where F: FnMut(T) -> RoutineResult + Send + 'static,
    {
        HandlerSend {
            name: name.into(),
            routine: Arc::new(Mutex::new(Box::new(routine))),
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(HandlerState {
                messages: None,
                errors: None,
                worker: None,
            }),
        }
    }

    /// Next error reported by the routine. None once the worker has stopped and
    /// every error was read.
    pub fn receive_err(&self) -> Option<SafeqError> {
        let errors = self.state.lock().errors.clone()?;
        errors.recv().ok()
    }

    fn run(
        name: String,
        routine: Arc<Mutex<Routine<T>>>,
        running: Arc<AtomicBool>,
        messages: cc::Receiver<T>,
        errors: cc::Sender<SafeqError>,
    ) {
        for msg in messages.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut routine = routine.lock();
                (&mut **routine)(msg)
            }));
            match outcome {
                Ok(Ok(ControlFlow::Continue(()))) => continue,
                Ok(Ok(ControlFlow::Break(()))) => {
                    debug!(handler = %name, "routine asked to stop");
                    break;
                }
                Ok(Err(e)) => {
                    let _ = errors.send(SafeqError::Routine(e));
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(handler = %name, panic = %message, "routine panicked");
                    let _ = errors.send(SafeqError::Panic(message));
                    break;
                }
            }
        }
        running.store(false, Ordering::SeqCst);
    }
}

impl<T> Sender<T> for HandlerSend<T>
    where T: Send + 'static,
{
    fn send(&self, msg: T) -> bool {
        let messages = match self.state.lock().messages.clone() {
            Some(messages) => messages,
            None => return false,
        };
        messages.send(msg).is_ok()
    }
}

impl<T> Runner for HandlerSend<T>
    where T: Send + 'static,
{
    fn start(&self) -> Result<(), SafeqError> {
        let mut state = self.state.lock();
        if state.messages.is_some() {
            if self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            // The routine stopped the worker on its own; reap it before starting a new one.
            state.messages = None;
            state.errors = None;
            if let Some(worker) = state.worker.take() {
                if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                    warn!(handler = %self.name, "worker exited abnormally");
                }
            }
        }
        let (messages_tx, messages_rx) = cc::bounded(0);
        let (errors_tx, errors_rx) = cc::unbounded();

        let name = self.name.clone();
        let routine = self.routine.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        let worker = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || HandlerSend::run(name, routine, running, messages_rx, errors_tx));
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        state.messages = Some(messages_tx);
        state.errors = Some(errors_rx);
        state.worker = Some(worker);
        debug!(handler = %self.name, "started");
        Ok(())
    }

    /// Stops accepting messages and waits for the worker to finish the ones it took.
    fn close(&self) {
        let worker = {
            let mut state = self.state.lock();
            if state.messages.take().is_none() {
                return;
            }
            state.worker.take()
        };
        if let Some(worker) = worker {
            // Closing from inside the routine must not join its own thread.
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!(handler = %self.name, "worker exited abnormally");
            }
        }
        debug!(handler = %self.name, "closed");
    }

    fn is_closed(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }
}

impl<T> Drop for HandlerSend<T> {
    fn drop(&mut self) {
        // Dropping the message sender lets a still running worker wind down on its own.
        self.state.get_mut().messages.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn runs_routine_for_each_message() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = HandlerSend::new("collect", move |v: i32| {
            sink.lock().push(v);
            Ok(ControlFlow::Continue(()))
        });

        assert!(!handler.send(0), "not started yet");
        handler.start().unwrap();
        handler.start().unwrap();
        for v in 1..=3 {
            assert!(handler.send(v));
        }
        handler.close();
        handler.close();

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert!(handler.is_closed());
        assert!(!handler.send(4));
    }

    #[test]
    fn errors_are_reported_without_stopping() {
        let handler = HandlerSend::new("odd", |v: i32| {
            if v % 2 == 1 {
                Err(Box::new(io::Error::new(io::ErrorKind::Other, format!("odd {}", v))) as _)
            } else {
                Ok(ControlFlow::Continue(()))
            }
        });
        handler.start().unwrap();
        for v in 0..4 {
            assert!(handler.send(v));
        }
        handler.close();

        let errors: Vec<String> = std::iter::from_fn(|| handler.receive_err())
            .map(|e| e.to_string())
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("odd 1"));
        assert!(errors[1].contains("odd 3"));
    }

    #[test]
    fn break_stops_the_worker() {
        let handler = HandlerSend::new("once", |_: i32| Ok(ControlFlow::Break(())));
        handler.start().unwrap();
        assert!(handler.send(1));
        assert!(handler.receive_err().is_none());
        assert!(handler.is_closed());
        assert!(!handler.send(2));
        handler.close();
    }

    #[test]
    fn panics_are_reported() {
        let handler = HandlerSend::new("boom", |_: i32| -> RoutineResult { panic!("boom") });
        handler.start().unwrap();
        assert!(handler.send(1));
        match handler.receive_err() {
            Some(SafeqError::Panic(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected {:?}", other),
        }
        handler.close();
    }

    #[test]
    fn restarts_after_the_routine_stopped_the_worker() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = HandlerSend::new("stop-on-zero", move |v: i32| {
            sink.lock().push(v);
            if v == 0 {
                Ok(ControlFlow::Break(()))
            } else {
                Ok(ControlFlow::Continue(()))
            }
        });
        handler.start().unwrap();
        assert!(handler.send(0));
        assert!(handler.receive_err().is_none());
        assert!(handler.is_closed());

        handler.start().unwrap();
        assert!(!handler.is_closed());
        assert!(handler.send(1));
        assert!(handler.send(2));
        handler.close();
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn restarts_after_a_panic() {
        let handler = HandlerSend::new("panic-on-zero", |v: i32| -> RoutineResult {
            if v == 0 {
                panic!("zero");
            }
            Ok(ControlFlow::Continue(()))
        });
        handler.start().unwrap();
        assert!(handler.send(0));
        assert!(matches!(handler.receive_err(), Some(SafeqError::Panic(_))));
        assert!(handler.receive_err().is_none());

        handler.start().unwrap();
        assert!(handler.send(1));
        handler.close();
        assert!(handler.receive_err().is_none());
    }

    #[test]
    fn can_restart_after_close() {
        let count = Arc::new(AtomicBool::new(false));
        let flag = count.clone();
        let handler = HandlerSend::new("restart", move |_: ()| {
            flag.store(true, Ordering::SeqCst);
            Ok(ControlFlow::Continue(()))
        });
        handler.start().unwrap();
        handler.close();
        handler.start().unwrap();
        assert!(handler.send(()));
        handler.close();
        assert!(count.load(Ordering::SeqCst));
    }
}
