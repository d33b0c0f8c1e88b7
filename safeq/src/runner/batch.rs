use std::collections::HashMap;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use tracing::{debug, warn};

use super::handler::RoutineResult;
use super::simple::HandlerSimple;
use super::Runner;
use crate::errors::{panic_message, SafeqError};

/// A named group of [`HandlerSimple`]s started and awaited together.
#[derive(Default)]
pub struct Batch {
    handlers: HashMap<String, HandlerSimple>,
}

impl Batch {
    pub fn new() -> Batch {
        Batch::default()
    }

    /// Registers `routine` under `id`. A handler already registered under the
    /// same id is replaced and asked to stop.
    pub fn add<F>(&mut self, id: impl Into<String>, routine: F)
        where F: FnMut() -> RoutineResult + Send + 'static,
    {
        let id = id.into();
        let handler = HandlerSimple::new(id.clone(), routine);
        if let Some(previous) = self.handlers.insert(id, handler) {
            debug!(handler = %previous.name(), "replaced in batch");
        }
    }

    /// Drops every handler. Running ones are asked to stop.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn start_all(&self) -> Result<(), SafeqError> {
        for handler in self.handlers.values() {
            handler.start()?;
        }
        Ok(())
    }

    /// Blocks until every handler has stopped. Each id maps to the error that
    /// ended its handler, or None if the routine finished on its own.
    pub fn wait_all(&self) -> HashMap<String, Option<SafeqError>> {
        thread::scope(|scope| {
            let waiting: Vec<_> = self
                .handlers
                .iter()
                .map(|(id, handler)| {
                    (id, scope.spawn(move || {
                        let mut last = None;
                        while let Some(e) = handler.receive_err() {
                            last = Some(e);
                        }
                        last
                    }))
                })
                .collect();
            waiting
                .into_iter()
                .map(|(id, wait)| {
                    let outcome = wait.join().unwrap_or_else(|payload| {
                        Some(SafeqError::Panic(panic_message(payload.as_ref())))
                    });
                    (id.clone(), outcome)
                })
                .collect()
        })
    }
}

/// Calls `f` on every element in parallel, one thread per element.
///
/// Results come back in input order. A panic in `f` becomes
/// `SafeqError::Panic` for that element only.
pub fn execute_batch<I, O, F>(elems: impl IntoIterator<Item = I>, f: F) -> Vec<Result<O, SafeqError>>
    where I: Send,
          O: Send,
          F: Fn(I) -> Result<O, Box<dyn Error + Send + Sync + 'static>> + Sync,
{
    thread::scope(|scope| {
        let f = &f;
        let running: Vec<_> = elems
            .into_iter()
            .map(|elem| scope.spawn(move || panic::catch_unwind(AssertUnwindSafe(|| f(elem)))))
            .collect();
        running
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(Ok(result)) => result.map_err(SafeqError::Routine),
                Ok(Err(payload)) | Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(panic = %message, "batch element panicked");
                    Err(SafeqError::Panic(message))
                }
            })
            .collect()
    })
}
