//! Capability contracts shared by buffers, topologies and their collaborators.

mod batch;
mod handler;
mod signal;
mod simple;

pub use batch::{execute_batch, Batch};
pub use handler::{HandlerSend, RoutineResult};
pub use signal::SignalChannel;
pub use simple::HandlerSimple;

use crate::errors::SafeqError;

pub trait Sender<T>: Send + Sync {
    /// Returns false if the destination is closed.
    fn send(&self, msg: T) -> bool;
}

pub trait Receiver<T>: Send + Sync {
    /// Returns None once the source is exhausted and closed.
    fn receive(&self) -> Option<T>;
}

/// Start, close and query a background component. Every method is idempotent.
pub trait Runner: Send + Sync {
    fn start(&self) -> Result<(), SafeqError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

pub trait SenderRunner<T>: Sender<T> + Runner {}

impl<T, S> SenderRunner<T> for S
    where S: Sender<T> + Runner + ?Sized,
{}

/// Receives and drops every message until `receiver` closes.
pub fn discard_any_message<T, R>(receiver: &R) -> usize
    where R: Receiver<T> + ?Sized,
{
    let mut discarded = 0;
    while receiver.receive().is_some() {
        discarded += 1;
    }
    discarded
}
