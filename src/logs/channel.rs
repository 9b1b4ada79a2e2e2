use crate::config::LogTarget;
use crate::error::{DroverError, Result};
use chrono::Local;
use std::borrow::Cow;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;

/// One log file with size-based rotation.
///
/// Rotation is checked after every write, so the active file is never larger
/// than `max_size` plus the last write. Bytes are never dropped across a
/// rotation: the triggering write is flushed to the old file first.
#[derive(Debug)]
pub struct LogChannel {
    path: PathBuf,
    file: Option<TokioFile>,
    rotate: bool,
    max_size: u64,
    date_format: Option<String>,
    /// Bytes in the active file
    size: u64,
    /// Bytes written through this channel since it was created
    total_written: u64,
    archives: Vec<PathBuf>,
    degraded: bool,
}

impl LogChannel {
    /// Create an unopened channel for `path` using the policy from `target`
    pub fn new(path: &Path, target: &LogTarget) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
            rotate: target.rotate,
            max_size: target.max_size,
            date_format: target.date_format.clone(),
            size: 0,
            total_written: 0,
            archives: Vec::new(),
            degraded: false,
        }
    }

    /// Open (or reopen) the file in append mode, creating parent directories
    pub async fn open(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                DroverError::LogIo(format!(
                    "Failed to create log directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                DroverError::LogIo(format!(
                    "Failed to open log file {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        self.size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = Some(TokioFile::from_std(file));
        Ok(())
    }

    /// Append one chunk of process output
    ///
    /// # Returns
    /// * `Ok(n)` - number of bytes that reached the file (including any date prefix)
    /// * `Err(DroverError::LogIo)` - the file could not be opened or written
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let entry = self.format_entry(data);

        if self.file.is_none() {
            self.open().await?;
        }

        let Some(file) = self.file.as_mut() else {
            return Err(DroverError::LogIo(format!(
                "Log file {} is not open",
                self.path.display()
            )));
        };

        let written = match file.write_all(&entry).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            self.file = None;
            return Err(DroverError::LogIo(format!(
                "Failed to write to {}: {}",
                self.path.display(),
                e
            )));
        }

        let len = entry.len();
        self.size += len as u64;
        self.total_written += len as u64;

        if self.rotate && self.size > self.max_size {
            self.rotate_file().await?;
        }

        Ok(len)
    }

    fn format_entry<'a>(&self, data: &'a [u8]) -> Cow<'a, [u8]> {
        match self.date_format {
            Some(ref format) => {
                let prefix = format!("{}: ", Local::now().format(format));
                let mut entry = Vec::with_capacity(prefix.len() + data.len());
                entry.extend_from_slice(prefix.as_bytes());
                entry.extend_from_slice(data);
                Cow::Owned(entry)
            }
            None => Cow::Borrowed(data),
        }
    }

    /// Archive the active file and start a fresh one at the same path
    async fn rotate_file(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }

        let archive = self.archive_path()?;

        if let Err(e) = tokio::fs::rename(&self.path, &archive).await {
            // Keep appending to the oversized file; the next write retries.
            self.open().await?;
            return Err(DroverError::LogRotation(format!(
                "Failed to rotate {}: {}",
                self.path.display(),
                e
            )));
        }

        tracing::debug!(
            log = %self.path.display(),
            archive = %archive.display(),
            "Rotated log file"
        );

        self.archives.push(archive);
        self.size = 0;
        self.open().await
    }

    /// `<stem>__<timestamp>.<ext>`, with `-N` appended until the name is unused
    fn archive_path(&self) -> Result<PathBuf> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| DroverError::LogRotation("Invalid log file path".to_string()))?;
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| DroverError::LogRotation("Invalid log file name".to_string()))?;
        let extension = self
            .path
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default();

        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let mut candidate = parent.join(format!("{}__{}{}", stem, timestamp, extension));
        let mut counter = 1;

        while candidate.exists() {
            candidate = parent.join(format!("{}__{}-{}{}", stem, timestamp, counter, extension));
            counter += 1;
        }

        Ok(candidate)
    }

    /// Flush buffered data to disk
    pub async fn flush(&mut self) -> Result<()> {
        if let Some(ref mut file) = self.file {
            file.flush()
                .await
                .map_err(|e| DroverError::LogIo(format!("Failed to flush log: {}", e)))?;
        }
        Ok(())
    }

    /// Flush and release the file handle; a later write reopens it
    pub async fn close(&mut self) -> Result<()> {
        let result = self.flush().await;
        self.file = None;
        result
    }

    /// Record a failed write. Returns true when this starts a failure streak.
    pub fn note_failure(&mut self) -> bool {
        !std::mem::replace(&mut self.degraded, true)
    }

    /// Record a successful write. Returns true when it ends a failure streak.
    pub fn note_success(&mut self) -> bool {
        std::mem::replace(&mut self.degraded, false)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Archives created by this channel, oldest first
    pub fn archives(&self) -> &[PathBuf] {
        &self.archives
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}
