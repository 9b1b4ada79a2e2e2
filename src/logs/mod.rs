// Logs module - Output capture and size-based rotation

mod channel;
mod sink;

pub use channel::LogChannel;
pub use sink::{LogSink, SharedChannel};
