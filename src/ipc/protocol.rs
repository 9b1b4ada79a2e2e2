// IPC Protocol definitions for client-supervisor communication

use crate::process::{InstanceSnapshot, StopTarget};
use serde::{Deserialize, Serialize};

/// All available commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Snapshot of every instance
    Status,
    /// Stop without restarting
    Stop(StopTarget),
    /// Re-read configuration (always refused while running)
    Reload,
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    /// Instances in registry order
    Status(Vec<InstanceSnapshot>),
    /// Names that reached `Stopped`
    Stopped(Vec<String>),
}

/// Request message from client to supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from supervisor to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, String>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: String) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}
