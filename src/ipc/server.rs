// IPC Server - Listens for client connections and handles requests

use crate::error::{DroverError, Result};
use crate::ipc::{Command, Request, Response, ResponseData};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// IPC server for handling client connections
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl IpcServer {
    /// Create a new IPC server with the default socket path
    pub fn new() -> Self {
        Self::with_socket_path(super::DEFAULT_SOCKET_PATH)
    }

    /// Create a new IPC server with a custom socket path
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Bind the Unix socket, replacing a stale socket file from an earlier run
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                DroverError::Ipc(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| DroverError::Ipc(format!("Failed to bind to socket: {}", e)))?;

        // Owner only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, permissions).map_err(|e| {
                DroverError::Ipc(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        debug!(socket = %self.socket_path.display(), "IPC server listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// Accept connections until the task is cancelled, answering one
    /// request per connection
    pub async fn serve<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseData>> + Send,
    {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| DroverError::Ipc("Server not started".to_string()))?;
        let handler = Arc::new(handler);

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to accept IPC connection");
                    continue;
                }
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler.as_ref()).await {
                    warn!(error = %e, "IPC connection failed");
                }
            });
        }
    }

    /// Stop the server and clean up the socket file
    pub fn stop(&mut self) -> Result<()> {
        self.listener = None;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                DroverError::Ipc(format!("Failed to remove socket file: {}", e))
            })?;
        }

        Ok(())
    }

    /// Get the socket path being used
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Default for IpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.listener.is_some() {
            let _ = self.stop();
        }
    }
}

/// Read one newline-delimited request, run the handler, write the response
async fn handle_connection<F, Fut>(stream: UnixStream, handler: &F) -> Result<()>
where
    F: Fn(Command) -> Fut,
    Fut: Future<Output = Result<ResponseData>>,
{
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .await
        .map_err(|e| DroverError::Ipc(format!("Failed to read request: {}", e)))?;

    let response = match serde_json::from_str::<Request>(&request_line) {
        Ok(request) => {
            debug!(id = request.id, command = ?request.command, "IPC request");
            match handler(request.command).await {
                Ok(data) => Response::success(request.id, data),
                Err(e) => Response::error(request.id, e.to_string()),
            }
        }
        Err(e) => Response::error(0, format!("Failed to deserialize request: {}", e)),
    };

    let mut response_json = serde_json::to_string(&response).map_err(|e| {
        DroverError::Serialization(format!("Failed to serialize response: {}", e))
    })?;
    response_json.push('\n');

    write_half
        .write_all(response_json.as_bytes())
        .await
        .map_err(|e| DroverError::Ipc(format!("Failed to write response: {}", e)))?;
    write_half
        .flush()
        .await
        .map_err(|e| DroverError::Ipc(format!("Failed to flush stream: {}", e)))?;

    Ok(())
}
