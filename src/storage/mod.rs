//! Response sinks the downloader streams bodies into
//!
//! A sink accepts sequential bytes, reports how many it accepted and can be
//! truncated when a retrieval aborts. Disk and in-memory variants are selected
//! by [`ResponseType`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::domain::StorageLocation;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Sink already finished")]
    Finished,
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// Storage backend for retrieved bodies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Disk,
    Memory,
}

#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Discard everything accepted so far
    async fn truncate(&mut self) -> Result<()>;

    /// Flush pending bytes; no writes are accepted afterwards
    async fn finish(&mut self) -> Result<()>;

    fn bytes_accepted(&self) -> u64;

    fn location(&self) -> StorageLocation;
}

/// Writes to a file, created (and emptied) when the sink is opened
pub struct DiskSink {
    path: PathBuf,
    file: Option<File>,
    accepted: u64,
}

impl DiskSink {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(&path, source))?;
        }
        let file = File::create(&path)
            .await
            .map_err(|source| io_error(&path, source))?;

        Ok(Self {
            path,
            file: Some(file),
            accepted: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResponseSink for DiskSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or(SinkError::Finished)?;
        file.write_all(chunk)
            .await
            .map_err(|source| io_error(&self.path, source))?;
        self.accepted += chunk.len() as u64;
        Ok(())
    }

    async fn truncate(&mut self) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => {
                file.set_len(0)
                    .await
                    .map_err(|source| io_error(&self.path, source))?;
                file.rewind()
                    .await
                    .map_err(|source| io_error(&self.path, source))?;
            }
            None => {
                // Already closed, reopen to empty it
                File::create(&self.path)
                    .await
                    .map_err(|source| io_error(&self.path, source))?;
            }
        }
        self.accepted = 0;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|source| io_error(&self.path, source))?;
            file.sync_all()
                .await
                .map_err(|source| io_error(&self.path, source))?;
        }
        Ok(())
    }

    fn bytes_accepted(&self) -> u64 {
        self.accepted
    }

    fn location(&self) -> StorageLocation {
        StorageLocation::Disk(self.path.clone())
    }
}

/// Buffers the body in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: BytesMut,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Bytes {
        self.buffer.clone().freeze()
    }
}

#[async_trait]
impl ResponseSink for MemorySink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.finished {
            return Err(SinkError::Finished);
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn truncate(&mut self) -> Result<()> {
        self.buffer.clear();
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    fn bytes_accepted(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn location(&self) -> StorageLocation {
        StorageLocation::Memory
    }
}

/// Open a sink of the configured type for `relative_path` under `base_dir`
pub async fn open_sink(
    response_type: ResponseType,
    base_dir: &Path,
    relative_path: &str,
) -> Result<Box<dyn ResponseSink>> {
    match response_type {
        ResponseType::Disk => {
            let sink = DiskSink::create(base_dir.join(relative_path)).await?;
            tracing::debug!(path = %sink.path().display(), "Opened disk sink");
            Ok(Box::new(sink))
        }
        ResponseType::Memory => Ok(Box::new(MemorySink::new())),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> SinkError {
    SinkError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_disk_sink_writes_and_truncates() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("job-1/res-1");
        let mut sink = DiskSink::create(&path).await.unwrap();

        sink.write(b"hello ").await.unwrap();
        sink.write(b"world").await.unwrap();
        assert_eq!(sink.bytes_accepted(), 11);

        sink.truncate().await.unwrap();
        sink.write(b"again").await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(sink.bytes_accepted(), 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"again");
        assert_eq!(sink.location(), StorageLocation::Disk(path));
    }

    #[tokio::test]
    async fn test_disk_sink_exists_empty_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.bin");
        std::fs::write(&path, b"stale").unwrap();

        let mut sink = DiskSink::create(&path).await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_memory_sink_rejects_writes_after_finish() {
        let mut sink = MemorySink::new();
        sink.write(b"abc").await.unwrap();
        sink.finish().await.unwrap();

        assert!(matches!(sink.write(b"d").await, Err(SinkError::Finished)));
        assert_eq!(sink.contents(), Bytes::from_static(b"abc"));
    }
}
