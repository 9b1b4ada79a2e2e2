use crate::process::types::{ExitRecord, InstanceId};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// One-way notifications sent to the supervisor core.
///
/// Every component other than the core reports through these instead of
/// touching the process table.
#[derive(Debug, Clone)]
pub enum Event {
    /// The OS process behind an instance has terminated
    Exited {
        name: String,
        instance: InstanceId,
        exit: ExitRecord,
    },
    /// Fresh resident memory reading
    MemorySampled {
        name: String,
        instance: InstanceId,
        bytes: u64,
    },
    /// Resident memory is above the spec's ceiling
    MemoryExceeded {
        name: String,
        instance: InstanceId,
        bytes: u64,
    },
    /// Sampling has failed `failures` times in a row
    SampleFailing {
        name: String,
        instance: InstanceId,
        failures: u32,
        error: String,
    },
    LogDegraded {
        path: PathBuf,
        error: String,
    },
    LogRecovered {
        path: PathBuf,
    },
    /// The restart delay for an exited instance has elapsed
    RestartDue {
        name: String,
        instance: InstanceId,
    },
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
