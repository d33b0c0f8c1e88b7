//! A switchable debug printer.
//!
//! Lines are pushed through a [`Buffer`] and written by a single listener
//! thread, so callers never block on the output itself and lines from
//! concurrent callers never interleave.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::buffer::{Buffer, BufferConfig};
use crate::errors::SafeqError;
use crate::runner::{Receiver, Runner, Sender};

/// Where debug lines end up.
pub enum DebugSink {
    Stdout,
    /// `info!` events with the `safeq::debugger` target.
    Log,
    Writer(Box<dyn Write + Send>),
}

impl DebugSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        match self {
            DebugSink::Stdout => {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                writeln!(out, "{}", line)
            }
            DebugSink::Log => {
                info!(target: "safeq::debugger", "{}", line);
                Ok(())
            }
            DebugSink::Writer(w) => {
                writeln!(w, "{}", line)?;
                w.flush()
            }
        }
    }
}

impl fmt::Debug for DebugSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebugSink::Stdout => write!(f, "Stdout"),
            DebugSink::Log => write!(f, "Log"),
            DebugSink::Writer(_) => write!(f, "Writer"),
        }
    }
}

struct Listening {
    lines: Arc<Buffer<String>>,
    listener: JoinHandle<()>,
}

pub struct Debugger {
    sink: Arc<Mutex<DebugSink>>,
    debug_mode: AtomicBool,
    state: Mutex<Option<Listening>>,
}

impl Debugger {
    /// A closed debugger with debug mode off.
    pub fn new(sink: DebugSink) -> Debugger {
        Debugger {
            sink: Arc::new(Mutex::new(sink)),
            debug_mode: AtomicBool::new(false),
            state: Mutex::new(None),
        }
    }

    pub fn toggle_debug_mode(&self, active: bool) {
        self.debug_mode.store(active, Ordering::SeqCst);
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode.load(Ordering::SeqCst)
    }

    /// Queues one line. Ignored unless the debugger is started and debug mode is on.
    pub fn println(&self, msg: impl fmt::Display) -> bool {
        self.push(|| msg.to_string())
    }

    /// `debugger.printf(format_args!("{} queued", n))`
    pub fn printf(&self, args: fmt::Arguments<'_>) -> bool {
        self.push(|| fmt::format(args))
    }

    fn push<F>(&self, line: F) -> bool
        where F: FnOnce() -> String,
    {
        if !self.debug_mode() {
            return false;
        }
        let lines = match self.state.lock().as_ref() {
            Some(listening) => listening.lines.clone(),
            None => return false,
        };
        lines.send(line())
    }
}

fn listen(lines: &Buffer<String>, sink: &Mutex<DebugSink>) {
    while let Some(line) = lines.receive() {
        if let Err(e) = sink.lock().write_line(&line) {
            warn!(error = %e, "debug line dropped");
        }
    }
}

impl Runner for Debugger {
    fn start(&self) -> Result<(), SafeqError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }
        let config = BufferConfig::builder().name("debugger").build()?;
        let lines = Arc::new(Buffer::with_config(config));
        lines.start()?;

        let listener = {
            let lines = lines.clone();
            let sink = self.sink.clone();
            thread::Builder::new()
                .name("debugger-listener".to_string())
                .spawn(move || listen(&lines, &sink))
        };
        let listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                lines.close();
                return Err(e.into());
            }
        };
        *state = Some(Listening { lines, listener });
        Ok(())
    }

    /// Flushes every queued line before returning.
    fn close(&self) {
        let listening = match self.state.lock().take() {
            Some(listening) => listening,
            None => return,
        };
        listening.lines.close();
        if listening.listener.join().is_err() {
            warn!("debugger listener panicked");
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().is_none()
    }
}

/// Every write is one line. Writes are always reported as fully accepted,
/// even when debug mode is off and the bytes are dropped.
impl Write for &Debugger {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(|| String::from_utf8_lossy(buf).into_owned());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for Debugger {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        self.close();
    }
}
