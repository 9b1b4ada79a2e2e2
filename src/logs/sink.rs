use crate::config::{LogTarget, ProcessSpec};
use crate::process::event::{Event, EventSender};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::LogChannel;

/// A channel shared by every drain that writes to the same path
pub type SharedChannel = Arc<Mutex<LogChannel>>;

/// LogSink routes process output into per-path log channels.
///
/// Channels are keyed by resolved file path, so a restarted instance keeps
/// writing to the channel its predecessor used, and merged stdout/stderr
/// share one channel.
pub struct LogSink {
    channels: HashMap<PathBuf, SharedChannel>,
    events: EventSender,
}

impl LogSink {
    pub fn new(events: EventSender) -> Self {
        Self {
            channels: HashMap::new(),
            events,
        }
    }

    /// Get the channel for `path`, opening it on first use.
    ///
    /// An open failure is reported as a degraded-logging event; the channel
    /// is still returned and retries opening on its next write.
    pub async fn open_channel(&mut self, path: &Path, target: &LogTarget) -> SharedChannel {
        if let Some(channel) = self.channels.get(path) {
            return Arc::clone(channel);
        }

        let mut channel = LogChannel::new(path, target);
        if let Err(e) = channel.open().await {
            channel.note_failure();
            warn!(log = %path.display(), error = %e, "Log file unavailable, logging degraded");
            let _ = self.events.send(Event::LogDegraded {
                path: path.to_path_buf(),
                error: e.to_string(),
            });
        }

        let channel = Arc::new(Mutex::new(channel));
        self.channels
            .insert(path.to_path_buf(), Arc::clone(&channel));
        channel
    }

    /// Take the child's stdout/stderr pipes and drain them into the spec's channels
    pub async fn attach(&mut self, spec: &ProcessSpec, child: &mut Child) {
        let out = self.open_channel(&spec.log.out_file, &spec.log).await;
        let err = self.open_channel(&spec.log.error_file, &spec.log).await;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(stdout, out, self.events.clone()));
        } else {
            debug!(process = %spec.name, "No stdout pipe to capture");
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(stderr, err, self.events.clone()));
        } else {
            debug!(process = %spec.name, "No stderr pipe to capture");
        }
    }

    /// Look up an open channel
    pub fn channel(&self, path: &Path) -> Option<SharedChannel> {
        self.channels.get(path).cloned()
    }

    /// Flush and forget the channel for `path`
    pub async fn close(&mut self, path: &Path) {
        if let Some(channel) = self.channels.remove(path) {
            if let Err(e) = channel.lock().await.close().await {
                warn!(log = %path.display(), error = %e, "Failed to close log file");
            }
        }
    }

    /// Flush and forget every channel
    pub async fn close_all(&mut self) {
        let paths: Vec<PathBuf> = self.channels.keys().cloned().collect();
        for path in paths {
            self.close(&path).await;
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Copy one output stream into a channel until EOF.
///
/// Keeps reading even while the channel is failing so the child never blocks
/// on a full pipe.
async fn drain<R>(reader: R, channel: SharedChannel, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut chunk = Vec::with_capacity(1024);

    loop {
        chunk.clear();
        match reader.read_until(b'\n', &mut chunk).await {
            Ok(0) => break,
            Ok(_) => {
                let mut channel = channel.lock().await;
                match channel.write(&chunk).await {
                    Ok(_) => {
                        if channel.note_success() {
                            let _ = events.send(Event::LogRecovered {
                                path: channel.path().to_path_buf(),
                            });
                        }
                    }
                    Err(e) => {
                        if channel.note_failure() {
                            warn!(
                                log = %channel.path().display(),
                                error = %e,
                                "Log write failed, logging degraded"
                            );
                            let _ = events.send(Event::LogDegraded {
                                path: channel.path().to_path_buf(),
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "Output stream closed with error");
                break;
            }
        }
    }
}
