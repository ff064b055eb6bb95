//! Uniform file I/O for the host side.
//!
//! `FileOps` is the only component that touches the filesystem; the autosave
//! queue and bridge handlers route through it. Metadata is computed from the
//! bytes present at read or write time, never cached across calls.

use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tether_types::{FileContent, FileMetadata, FileOpsError};
use tracing::debug;

/// Default maximum readable file size (10 MiB).
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// A content validation predicate supplied by the caller.
pub type Validator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FileOpsConfig {
    /// Files larger than this are rejected with `TooLarge`. A file of
    /// exactly this size is accepted.
    pub max_size: u64,
}

impl Default for FileOpsConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

#[derive(Clone, Default)]
pub struct ReadOptions {
    /// Rejects the read with `Validation` when the predicate returns false.
    pub validator: Option<Validator>,
}

#[derive(Clone, Default)]
pub struct WriteOptions {
    /// Create missing parent directories before writing.
    pub create_parents: bool,
    /// Rejects the write with `Validation` when the predicate returns false.
    pub validator: Option<Validator>,
}

/// The seam the autosave queue writes through, so write-failure behavior is
/// testable with fault-injecting wrappers.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, path: &Path) -> Result<FileContent, FileOpsError>;
    async fn write(&self, path: &Path, content: &str) -> Result<u64, FileOpsError>;
    async fn stat(&self, path: &Path) -> Result<FileMetadata, FileOpsError>;
}

/// Host-side file operations with size limits and metadata extraction.
#[derive(Debug, Clone, Default)]
pub struct FileOps {
    config: FileOpsConfig,
}

impl FileOps {
    pub fn new(config: FileOpsConfig) -> Self {
        Self { config }
    }

    /// Read a file as UTF-8 text with derived metadata.
    pub async fn read(
        &self,
        path: &Path,
        options: &ReadOptions,
    ) -> Result<FileContent, FileOpsError> {
        let metadata = self.stat(path).await?;
        if metadata.size_bytes > self.config.max_size {
            return Err(FileOpsError::TooLarge {
                size: metadata.size_bytes,
                max: self.config.max_size,
            });
        }

        let bytes = tokio::fs::read(path).await.map_err(|e| map_io(path, e))?;
        let text = String::from_utf8(bytes)?;

        if let Some(validator) = &options.validator {
            if !validator(&text) {
                return Err(FileOpsError::validation(format!(
                    "predicate rejected content of {}",
                    path.display()
                )));
            }
        }

        debug!(path = %path.display(), bytes = text.len(), "read file");
        Ok(FileContent::from_text(path, text, metadata.modified_ms))
    }

    /// Write UTF-8 text. Returns the number of bytes written. Does not fsync.
    pub async fn write(
        &self,
        path: &Path,
        content: &str,
        options: &WriteOptions,
    ) -> Result<u64, FileOpsError> {
        if let Some(validator) = &options.validator {
            if !validator(content) {
                return Err(FileOpsError::validation(format!(
                    "predicate rejected content for {}",
                    path.display()
                )));
            }
        }

        if options.create_parents {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tokio::fs::write(path, content.as_bytes()).await?;
        debug!(path = %path.display(), bytes = content.len(), "wrote file");
        Ok(content.len() as u64)
    }

    /// Filesystem metadata without reading bytes.
    pub async fn stat(&self, path: &Path) -> Result<FileMetadata, FileOpsError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| map_io(path, e))?;
        let modified_ms = meta.modified().ok().and_then(to_epoch_ms);
        Ok(FileMetadata::from_entry(path, meta.len(), modified_ms))
    }

    /// Read the file and apply a predicate to its content. Pure: no caching,
    /// no side effects beyond the read itself.
    pub async fn validate<F>(&self, path: &Path, predicate: F) -> Result<bool, FileOpsError>
    where
        F: Fn(&str) -> bool,
    {
        let content = self.read(path, &ReadOptions::default()).await?;
        Ok(predicate(&content.text))
    }
}

#[async_trait]
impl FileStore for FileOps {
    async fn read(&self, path: &Path) -> Result<FileContent, FileOpsError> {
        FileOps::read(self, path, &ReadOptions::default()).await
    }

    async fn write(&self, path: &Path, content: &str) -> Result<u64, FileOpsError> {
        FileOps::write(self, path, content, &WriteOptions::default()).await
    }

    async fn stat(&self, path: &Path) -> Result<FileMetadata, FileOpsError> {
        FileOps::stat(self, path).await
    }
}

fn map_io(path: &Path, e: io::Error) -> FileOpsError {
    if e.kind() == io::ErrorKind::NotFound {
        FileOpsError::not_found(path.display().to_string())
    } else {
        FileOpsError::Io(e)
    }
}

/// Milliseconds since the Unix epoch for a filesystem timestamp.
pub fn to_epoch_ms(t: SystemTime) -> Option<u64> {
    t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_millis() as u64)
}

/// Current time as milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> u64 {
    to_epoch_ms(SystemTime::now()).unwrap_or(0)
}
