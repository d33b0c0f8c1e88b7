use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel as cc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::handler::RoutineResult;
use super::Runner;
use crate::errors::{panic_message, SafeqError};

type Routine = Box<dyn FnMut() -> RoutineResult + Send + 'static>;

struct SimpleState {
    stop: Option<Arc<AtomicBool>>,
    errors: Option<cc::Receiver<SafeqError>>,
    worker: Option<JoinHandle<()>>,
}

/// Calls a routine over and over on a worker thread until it is closed.
///
/// The routine ends the loop itself by returning `ControlFlow::Break`. An
/// error or a panic also ends it and is reported through
/// [`HandlerSimple::receive_err`].
pub struct HandlerSimple {
    name: String,
    routine: Arc<Mutex<Routine>>,
    running: Arc<AtomicBool>,
    state: Mutex<SimpleState>,
}

impl HandlerSimple {
    pub fn new<F>(name: impl Into<String>, routine: F) -> HandlerSimple
        where F: FnMut() -> RoutineResult + Send + 'static,
    {
        HandlerSimple {
            name: name.into(),
            routine: Arc::new(Mutex::new(Box::new(routine))),
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(SimpleState {
                stop: None,
                errors: None,
                worker: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The error that ended the last run. None once the worker has stopped
    /// and every error was read, or if it was never started.
    pub fn receive_err(&self) -> Option<SafeqError> {
        let errors = self.state.lock().errors.clone()?;
        errors.recv().ok()
    }

    fn run(
        name: String,
        routine: Arc<Mutex<Routine>>,
        running: Arc<AtomicBool>,
        stop: Arc<AtomicBool>,
        errors: cc::Sender<SafeqError>,
    ) {
        let mut rounds = 0u64;
        while !stop.load(Ordering::SeqCst) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut routine = routine.lock();
                (&mut **routine)()
            }));
            rounds += 1;
            match outcome {
                Ok(Ok(ControlFlow::Continue(()))) => {}
                Ok(Ok(ControlFlow::Break(()))) => break,
                Ok(Err(e)) => {
                    let _ = errors.send(SafeqError::Routine(e));
                    break;
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(handler = %name, panic = %message, "routine panicked");
                    let _ = errors.send(SafeqError::Panic(message));
                    break;
                }
            }
        }
        debug!(handler = %name, rounds, "routine finished");
        running.store(false, Ordering::SeqCst);
    }

    fn reap(&self, state: &mut SimpleState) {
        if let Some(stop) = state.stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        if let Some(worker) = state.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!(handler = %self.name, "worker exited abnormally");
            }
        }
    }
}

impl Runner for HandlerSimple {
    /// Does nothing while the routine is looping. A worker that already
    /// stopped is reaped and replaced; unread errors of the previous run are dropped.
    fn start(&self) -> Result<(), SafeqError> {
        let mut state = self.state.lock();
        if state.worker.is_some() && self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.reap(&mut state);

        let stop = Arc::new(AtomicBool::new(false));
        let (errors_tx, errors_rx) = cc::unbounded();
        let name = self.name.clone();
        let routine = self.routine.clone();
        let running = self.running.clone();
        let worker_stop = stop.clone();
        self.running.store(true, Ordering::SeqCst);
        let worker = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || HandlerSimple::run(name, routine, running, worker_stop, errors_tx));
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        state.stop = Some(stop);
        state.errors = Some(errors_rx);
        state.worker = Some(worker);
        debug!(handler = %self.name, "started");
        Ok(())
    }

    /// Asks the loop to stop and waits for the current round to finish.
    fn close(&self) {
        let mut state = self.state.lock();
        if state.stop.is_none() {
            return;
        }
        self.reap(&mut state);
        debug!(handler = %self.name, "closed");
    }

    fn is_closed(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }
}

impl Drop for HandlerSimple {
    fn drop(&mut self) {
        if let Some(stop) = self.state.get_mut().stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
    }
}
