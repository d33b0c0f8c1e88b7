pub mod buffer;
pub mod debugger;
mod errors;
pub mod locker;
pub mod queue;
pub mod runner;
pub mod subject;
pub mod topology;

#[cfg(test)]
mod tests;

pub use buffer::{Buffer, BufferCondition, BufferConfig, Lifecycle};
pub use errors::SafeqError;
pub use runner::{discard_any_message, Receiver, Runner, Sender, SenderRunner};
