//! Temp file writers.
//!
//! A [`RecordFormat`] opens a [`RecordWriter`] on a temp path. Appended
//! records reach the storage buffer immediately and become durable when the
//! writer is closed. A writer whose append or close failed is never used
//! again: the caller discards the file and replays into a fresh one.

mod binary;
mod text;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use helix_core::SinkRecord;
use helix_wal::{Storage, StorageFile};
use tracing::debug;

use crate::config::FormatKind;
use crate::error::{FailureKind, SinkError, SinkResult};

pub use binary::{BinaryFormat, BinaryRecord, RECORD_HEADER_SIZE};
pub use text::TextFormat;

/// An output format.
#[async_trait]
pub trait RecordFormat: Send + Sync {
    /// Default committed file extension, including the leading dot.
    fn extension(&self) -> &str;

    /// Opens a writer at `path`, discarding any stale content there.
    ///
    /// # Errors
    /// Returns a transient `Open` error if the file cannot be created.
    async fn open(&self, storage: &dyn Storage, path: &Path) -> SinkResult<Box<dyn RecordWriter>>;
}

/// An open temp file.
#[async_trait]
pub trait RecordWriter: Send {
    /// Appends one record.
    ///
    /// # Errors
    /// Returns a transient `Append` error. Partial bytes may have landed.
    async fn append(&mut self, record: &SinkRecord) -> SinkResult<()>;

    /// Flushes and syncs the file.
    ///
    /// # Errors
    /// Returns a transient `Close` error. The content is then not durable.
    async fn close(&mut self) -> SinkResult<()>;

    /// Returns the number of bytes appended so far.
    fn bytes_written(&self) -> u64;
}

/// Builds the format named by the configuration.
#[must_use]
pub fn create_format(kind: FormatKind) -> Arc<dyn RecordFormat> {
    match kind {
        FormatKind::Binary => Arc::new(BinaryFormat),
        FormatKind::Text => Arc::new(TextFormat),
    }
}

/// Deletes `path`, ignoring failures.
///
/// Leftover temp files are harmless: recovery removes them.
pub async fn discard(storage: &dyn Storage, path: &Path) {
    if let Err(e) = storage.remove(path).await {
        debug!(path = %path.display(), error = %e, "Failed to discard temp file");
    }
}

/// Sequential writer over a storage file shared by the formats.
struct FileAppender {
    file: Box<dyn StorageFile>,
    path: PathBuf,
    position: u64,
}

impl FileAppender {
    async fn create(storage: &dyn Storage, path: &Path) -> SinkResult<Self> {
        let open_err = |e| SinkError::transient(FailureKind::Open, path, e);
        let file = storage.open(path).await.map_err(open_err)?;
        file.truncate(0).await.map_err(open_err)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            position: 0,
        })
    }

    async fn write(&mut self, data: &[u8]) -> SinkResult<()> {
        self.file
            .write_at(self.position, data)
            .await
            .map_err(|e| SinkError::transient(FailureKind::Append, &self.path, e))?;
        self.position += data.len() as u64;
        Ok(())
    }

    async fn sync(&self) -> SinkResult<()> {
        self.file
            .sync()
            .await
            .map_err(|e| SinkError::transient(FailureKind::Close, &self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use helix_wal::{FaultConfig, SimulatedStorage};

    use super::*;

    #[tokio::test]
    async fn test_open_truncates_stale_content() {
        let storage = SimulatedStorage::new(1);
        let path = Path::new("/topics/+tmp/t/p/stale_tmp.bin");
        storage.set_raw_content(path, b"garbage from a previous session".to_vec());

        let format = create_format(FormatKind::Binary);
        let mut writer = format.open(&storage, path).await.unwrap();
        writer.append(&SinkRecord::new("t", 0, 0, "v")).await.unwrap();
        writer.close().await.unwrap();

        let content = storage.get_synced_content(path).unwrap();
        assert_eq!(content.len() as u64, writer.bytes_written());
        assert_eq!(BinaryFormat::decode("t", 0, &content).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_failure_is_transient() {
        let storage = SimulatedStorage::with_faults(1, FaultConfig::none().with_force_fsync_fail());
        let path = Path::new("/topics/+tmp/t/p/a_tmp.txt");

        let mut writer = TextFormat.open(&storage, path).await.unwrap();
        writer.append(&SinkRecord::new("t", 0, 0, "v")).await.unwrap();
        let err = writer.close().await.unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::Close));

        storage.simulate_crash();
        assert!(storage.get_raw_content(path).is_none());
    }

    #[tokio::test]
    async fn test_discard_ignores_missing_file() {
        let storage = SimulatedStorage::new(1);
        discard(&storage, Path::new("/nope")).await;

        let path = Path::new("/topics/+tmp/t/p/a_tmp.bin");
        storage.set_raw_content(path, vec![1, 2, 3]);
        discard(&storage, path).await;
        assert!(storage.get_raw_content(path).is_none());
    }
}
