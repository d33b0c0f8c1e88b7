use std::{fmt, io};

// Expected conditions (closed buffer, empty queue, unknown predicate) are reported
// through bool/Option results. Only the hard failures end up here.

#[derive(Debug)]
pub enum SafeqError {
    Io(io::Error), // spawning a worker thread
    AlreadyClosed,
    Panic(String),
    Routine(Box<dyn std::error::Error + Send + Sync + 'static>),
    Logic(String),
}

impl fmt::Display for SafeqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafeqError::Io(e) => write!(f, "IO error: {}", e),
            SafeqError::AlreadyClosed => write!(f, "Already closed: a new instance is required"),
            SafeqError::Panic(s) => write!(f, "Worker panicked: {}", s),
            SafeqError::Routine(e) => write!(f, "Routine error: {}", e),
            SafeqError::Logic(s) => write!(f, "Logic error: {}", s),
        }
    }
}

impl std::error::Error for SafeqError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SafeqError::Io(e) => Some(e),
            SafeqError::Routine(e) => Some(e.as_ref()),
            SafeqError::AlreadyClosed => None,
            SafeqError::Panic(_) => None,
            SafeqError::Logic(_) => None,
        }
    }
}

impl From<io::Error> for SafeqError {
    fn from(err: io::Error) -> Self {
        SafeqError::Io(err)
    }
}

impl From<Box<dyn std::error::Error + Send + Sync + 'static>> for SafeqError {
    fn from(err: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        SafeqError::Routine(err)
    }
}

// Turns the payload of a caught panic into something printable.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
