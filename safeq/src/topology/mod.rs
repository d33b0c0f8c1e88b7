//! Fan-out and fan-in between senders and receivers.

mod redirect;
mod through;

pub use redirect::Redirect;
pub use through::ChannelThrough;
