//! Filesystem access for the sink.
//!
//! Everything the sink persists goes through [`Storage`]: temp files under
//! `+tmp`, committed files under the topics directory, and the per
//! topic-partition commit log. The surface is the minimum those need: open a
//! file, write and read it whole, make it durable, then rename, remove and
//! list files below a directory.
//!
//! [`TokioStorage`] backs production. [`SimulatedStorage`] keeps files in
//! memory, loses unsynced bytes on a simulated crash, and injects faults.

mod simulated;
mod tokio_storage;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::WalResult;

pub use simulated::{FaultConfig, FaultStats, SimulatedStorage, StorageOp};
pub use tokio_storage::TokioStorage;

/// Directory-level operations.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Opens `path` for reading and writing, creating it empty if missing.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or created.
    async fn open(&self, path: &Path) -> WalResult<Box<dyn StorageFile>>;

    /// Returns true if a file exists at `path`.
    ///
    /// # Errors
    /// Returns an error if existence cannot be determined.
    async fn exists(&self, path: &Path) -> WalResult<bool>;

    /// Lists every file below `dir` at any depth, sorted.
    ///
    /// A missing directory yields an empty list.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be read.
    async fn list_files_recursive(&self, dir: &Path) -> WalResult<Vec<PathBuf>>;

    /// Atomically renames `from` to `to`, replacing `to` if it exists.
    ///
    /// The rename is durable once it returns. The content is only as durable
    /// as the last sync of `from`.
    ///
    /// # Errors
    /// Returns an error if `from` is missing or the rename fails.
    async fn rename(&self, from: &Path, to: &Path) -> WalResult<()>;

    /// Removes the file at `path`.
    ///
    /// # Errors
    /// Returns an error if the file is missing or cannot be removed.
    async fn remove(&self, path: &Path) -> WalResult<()>;

    /// Creates `path` and any missing parents.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be created.
    async fn create_dir_all(&self, path: &Path) -> WalResult<()>;
}

/// An open file.
#[async_trait]
pub trait StorageFile: Send + Sync {
    /// Writes `data` at byte `offset`, extending the file as needed.
    ///
    /// # Errors
    /// Returns an error if the write fails. A failed write may leave part of
    /// `data` behind.
    async fn write_at(&self, offset: u64, data: &[u8]) -> WalResult<()>;

    /// Reads the whole file.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    async fn read_all(&self) -> WalResult<Bytes>;

    /// Makes everything written so far durable.
    ///
    /// # Errors
    /// Returns an error if the sync fails. Nothing written since the last
    /// successful sync is durable then.
    async fn sync(&self) -> WalResult<()>;

    /// Cuts the file to `len` bytes.
    ///
    /// # Errors
    /// Returns an error if the truncation fails.
    async fn truncate(&self, len: u64) -> WalResult<()>;

    /// Writes `data` at `offset`, then syncs.
    ///
    /// # Errors
    /// Returns an error if the write or the sync fails.
    async fn write_at_and_sync(&self, offset: u64, data: &[u8]) -> WalResult<()> {
        self.write_at(offset, data).await?;
        self.sync().await
    }
}
