// IPC module - Communication between the CLI and a running supervisor

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{Command, Request, Response, ResponseData};
pub use server::IpcServer;

/// Socket used when `--socket` is not given
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/drover.sock";
