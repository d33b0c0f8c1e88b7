//! The decoupling buffer.
//!
//! Producers [`Buffer::send`] into an entry channel, consumers
//! [`Buffer::receive`] from an exit channel, and an unbounded [`SafeQueue`]
//! sits between the two. Two worker threads move the messages:
//!
//! - ingress drains the entry channel into the queue until the entry side is
//!   closed, then flips `IsRunning` to false;
//! - egress waits on a [`Locker`] until the queue is non-empty or the buffer is
//!   shutting down, and offers queued messages to the exit channel without
//!   blocking. Once the producer side is closed nothing new can arrive, so it
//!   drains what is left with blocking sends and then closes the exit side.
//!
//! Closing the entry side is the only way to stop a buffer; everything else
//! cascades from it. A closed buffer cannot be started again.

mod config;

pub use config::{BufferConfig, BufferConfigBuilder, DEFAULT_BUFFER_NAME};

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{self as cc, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::errors::SafeqError;
use crate::locker::Locker;
use crate::queue::{Handoff, SafeQueue};
use crate::runner::{Receiver, Runner, Sender};
use crate::subject::Subject;

// Refused hand-offs are retried by yielding first, then by short sleeps.
const SPIN_REFUSALS: u32 = 16;
const RETRY_PAUSE: Duration = Duration::from_micros(50);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BufferCondition {
    IsEmpty,
    IsRunning,
}

impl fmt::Display for BufferCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferCondition::IsEmpty => write!(f, "IsEmpty"),
            BufferCondition::IsRunning => write!(f, "IsRunning"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Unstarted,
    Running,
    /// The entry side is closed; queued messages are still being delivered.
    Draining,
    Closed,
}

struct Channels<T> {
    entry: Option<cc::Sender<T>>,
    exit: Option<cc::Receiver<T>>,
    // The workers own the queue; it is freed once both have finished.
    queue: Weak<SafeQueue<T>>,
    workers: Vec<JoinHandle<()>>,
}

pub struct Buffer<T> {
    config: BufferConfig,
    lifecycle: Arc<Subject<Lifecycle>>,
    channels: Mutex<Channels<T>>,
}

impl<T> Buffer<T>
    where T: Send + Sync + 'static,
{
    pub fn new() -> Buffer<T> {
        Buffer::with_config(BufferConfig::default())
    }

    pub fn with_config(config: BufferConfig) -> Buffer<T> {
        Buffer {
            config,
            lifecycle: Arc::new(Subject::new(Lifecycle::Unstarted)),
            channels: Mutex::new(Channels {
                entry: None,
                exit: None,
                queue: Weak::new(),
                workers: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    /// Calls `f` on every lifecycle transition. `f` may run on a worker thread.
    pub fn observe_lifecycle<F>(&self, f: F)
        where F: Fn(&Lifecycle) + Send + Sync + 'static,
    {
        self.lifecycle.set_observer(f);
    }

    /// Number of messages waiting in the internal queue.
    pub fn queued(&self) -> usize {
        let queue = self.channels.lock().queue.upgrade();
        queue.map_or(0, |q| q.size())
    }

    /// Discards every message still in the internal queue. Messages already
    /// handed to the exit side are not affected.
    pub fn clean_buffer(&self) {
        let queue = self.channels.lock().queue.upgrade();
        if let Some(queue) = queue {
            let discarded = queue.size();
            queue.clear();
            debug!(buffer = %self.config.name, discarded, "backlog discarded");
        }
    }

    /// Blocks until both workers have finished, that is until the buffer is
    /// closed and every queued message has been received.
    pub fn wait(&self) {
        let workers: Vec<JoinHandle<()>> = self.channels.lock().workers.drain(..).collect();
        for worker in workers {
            if worker.thread().id() == thread::current().id() {
                continue;
            }
            if worker.join().is_err() {
                error!(buffer = %self.config.name, "worker panicked");
            }
        }
    }

    fn spawn_workers(
        &self,
        entry: cc::Receiver<T>,
        exit: cc::Sender<T>,
        queue: Arc<SafeQueue<T>>,
        locker: Arc<Locker<BufferCondition>>,
    ) -> Result<Vec<JoinHandle<()>>, SafeqError> {
        let ingress = {
            let name = self.config.name.clone();
            let queue = queue.clone();
            let locker = locker.clone();
            thread::Builder::new()
                .name(format!("{}-ingress", self.config.name))
                .spawn(move || ingress(&name, entry, &queue, &locker))?
        };
        let egress = {
            let name = self.config.name.clone();
            let lifecycle = self.lifecycle.clone();
            thread::Builder::new()
                .name(format!("{}-egress", self.config.name))
                .spawn(move || {
                    egress(&name, &exit, &queue, &locker);
                    drop(exit);
                    lifecycle.set(Lifecycle::Closed);
                    debug!(buffer = %name, "closed");
                })?
        };
        Ok(vec![ingress, egress])
    }
}

fn ingress<T>(
    name: &str,
    entry: cc::Receiver<T>,
    queue: &SafeQueue<T>,
    locker: &Locker<BufferCondition>,
) where T: Send + Sync,
{
    for msg in entry.iter() {
        queue.enqueue(msg);
        trace!(buffer = %name, "message queued");
    }
    if !locker.change_value(BufferCondition::IsRunning, false) {
        error!(buffer = %name, "IsRunning predicate missing");
    }
    debug!(buffer = %name, "entry side closed");
}

fn egress<T>(
    name: &str,
    exit: &cc::Sender<T>,
    queue: &SafeQueue<T>,
    locker: &Locker<BufferCondition>,
) where T: Send + Sync,
{
    let mut refusals = 0u32;
    while locker.get(BufferCondition::IsRunning).unwrap_or(false) {
        let mut refused = false;
        let running = locker.do_func(|snapshot| {
            loop {
                let handoff = queue.dequeue_with(|msg| exit.try_send(msg).map_err(TrySendError::into_inner));
                match handoff {
                    Handoff::Accepted => continue,
                    Handoff::Empty => break,
                    Handoff::Refused => {
                        refused = true;
                        break;
                    }
                }
            }
            snapshot.get(&BufferCondition::IsRunning).copied().unwrap_or(false)
        });
        if !running {
            break;
        }
        if refused {
            refusals = refusals.saturating_add(1);
            if refusals < SPIN_REFUSALS {
                thread::yield_now();
            } else {
                thread::sleep(RETRY_PAUSE);
            }
        } else {
            refusals = 0;
        }
    }

    // No producer can add anything now, so blocking on the consumer is safe.
    let mut drained = 0usize;
    while let Some(msg) = queue.dequeue() {
        if exit.send(msg).is_err() {
            warn!(buffer = %name, left = queue.size() + 1, "exit side dropped while draining");
            queue.clear();
            break;
        }
        drained += 1;
    }
    debug!(buffer = %name, drained, "drained");
}

impl<T> Default for Buffer<T>
    where T: Send + Sync + 'static,
{
    fn default() -> Self {
        Buffer::new()
    }
}

impl<T> Runner for Buffer<T>
    where T: Send + Sync + 'static,
{
    /// Allocates the queue, the locker and both channels and launches the workers.
    /// Does nothing if the buffer is already running.
    fn start(&self) -> Result<(), SafeqError> {
        let mut channels = self.channels.lock();
        match self.lifecycle.get() {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Draining | Lifecycle::Closed => return Err(SafeqError::AlreadyClosed),
            Lifecycle::Unstarted => {}
        }

        let locker = Arc::new(Locker::new());
        locker.set_subject(BufferCondition::IsEmpty, true, true);
        locker.set_subject(BufferCondition::IsRunning, true, true);

        let queue = Arc::new(SafeQueue::new());
        {
            let locker = locker.clone();
            let name = self.config.name.clone();
            queue.observe_size(move |size| {
                if !locker.change_value(BufferCondition::IsEmpty, *size == 0) {
                    error!(buffer = %name, "IsEmpty predicate missing");
                }
            });
        }

        let (entry_tx, entry_rx) = cc::bounded(self.config.entry_capacity);
        let (exit_tx, exit_rx) = cc::bounded(self.config.exit_capacity);
        let weak_queue = Arc::downgrade(&queue);
        match self.spawn_workers(entry_rx, exit_tx, queue, locker) {
            Ok(workers) => {
                channels.entry = Some(entry_tx);
                channels.exit = Some(exit_rx);
                channels.queue = weak_queue;
                channels.workers = workers;
                self.lifecycle.set(Lifecycle::Running);
                debug!(buffer = %self.config.name, "started");
                Ok(())
            }
            Err(e) => {
                // Dropping entry_tx lets an already spawned ingress worker exit.
                drop(entry_tx);
                self.lifecycle.set(Lifecycle::Closed);
                error!(buffer = %self.config.name, error = %e, "failed to start");
                Err(e)
            }
        }
    }

    /// Closes the entry side. Queued messages are still delivered; the exit side
    /// closes once they have all been received. Does not block.
    fn close(&self) {
        let entry = self.channels.lock().entry.take();
        if let Some(entry) = entry {
            self.lifecycle.set(Lifecycle::Draining);
            drop(entry);
            debug!(buffer = %self.config.name, "entry side closing");
        }
    }

    /// True before start and after the exit side has closed.
    fn is_closed(&self) -> bool {
        !matches!(self.lifecycle.get(), Lifecycle::Running | Lifecycle::Draining)
    }
}

impl<T> Sender<T> for Buffer<T>
    where T: Send + Sync + 'static,
{
    /// Blocks while the ingress worker is busy. Returns false if the buffer was
    /// never started or is already closed.
    fn send(&self, msg: T) -> bool {
        let entry = match self.channels.lock().entry.clone() {
            Some(entry) => entry,
            None => return false,
        };
        entry.send(msg).is_ok()
    }
}

impl<T> Receiver<T> for Buffer<T>
    where T: Send + Sync + 'static,
{
    /// Blocks until a message is available. None once the buffer is drained and closed.
    fn receive(&self) -> Option<T> {
        let exit = self.channels.lock().exit.clone()?;
        exit.recv().ok()
    }
}

impl<T> Drop for Buffer<T> {
    fn drop(&mut self) {
        // Workers keep running detached until the queue is drained or the exit side is gone.
        self.channels.get_mut().entry.take();
    }
}

impl<T> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.config.name)
            .field("lifecycle", &self.lifecycle.get())
            .finish()
    }
}
