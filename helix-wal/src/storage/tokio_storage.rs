//! Production storage on `tokio::fs`.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{Storage, StorageFile};
use crate::error::{WalError, WalResult};

/// Storage on the local filesystem.
///
/// `tokio::fs` runs each call on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct TokioStorage;

impl TokioStorage {
    /// Creates the storage.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Fsyncs the directory holding `path` so a rename or removal in it
    /// survives power loss.
    async fn sync_parent(path: &Path, operation: &'static str) -> WalResult<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        let dir = File::open(parent)
            .await
            .map_err(|e| WalError::io(operation, e))?;
        dir.sync_all().await.map_err(|e| WalError::io(operation, e))
    }
}

#[async_trait]
impl Storage for TokioStorage {
    async fn open(&self, path: &Path) -> WalResult<Box<dyn StorageFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|e| WalError::io("open", e))?;
        Ok(Box::new(TokioFile {
            file: Mutex::new(file),
        }))
    }

    async fn exists(&self, path: &Path) -> WalResult<bool> {
        fs::try_exists(path)
            .await
            .map_err(|e| WalError::io("exists", e))
    }

    async fn list_files_recursive(&self, dir: &Path) -> WalResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut dirs = vec![dir.to_path_buf()];

        while let Some(current) = dirs.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                // Nothing written yet, or removed while walking.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(WalError::io("read_dir", e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| WalError::io("read_dir", e))?
            {
                let kind = entry
                    .file_type()
                    .await
                    .map_err(|e| WalError::io("file_type", e))?;
                if kind.is_dir() {
                    dirs.push(entry.path());
                } else if kind.is_file() {
                    files.push(entry.path());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn rename(&self, from: &Path, to: &Path) -> WalResult<()> {
        fs::rename(from, to)
            .await
            .map_err(|e| WalError::io("rename", e))?;
        Self::sync_parent(to, "rename").await
    }

    async fn remove(&self, path: &Path) -> WalResult<()> {
        fs::remove_file(path)
            .await
            .map_err(|e| WalError::io("remove", e))?;
        Self::sync_parent(path, "remove").await
    }

    async fn create_dir_all(&self, path: &Path) -> WalResult<()> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| WalError::io("create_dir_all", e))
    }
}

/// An open file. The lock keeps each seek and its write together.
struct TokioFile {
    file: Mutex<File>,
}

#[allow(clippy::significant_drop_tightening)]
#[async_trait]
impl StorageFile for TokioFile {
    async fn write_at(&self, offset: u64, data: &[u8]) -> WalResult<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| WalError::io("seek", e))?;
        file.write_all(data)
            .await
            .map_err(|e| WalError::io("write", e))
    }

    async fn read_all(&self) -> WalResult<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(0))
            .await
            .map_err(|e| WalError::io("seek", e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| WalError::io("read", e))?;
        Ok(Bytes::from(buf))
    }

    async fn sync(&self) -> WalResult<()> {
        let mut file = self.file.lock().await;
        file.flush().await.map_err(|e| WalError::io("flush", e))?;
        file.sync_all().await.map_err(|e| WalError::io("sync", e))
    }

    async fn truncate(&self, len: u64) -> WalResult<()> {
        let file = self.file.lock().await;
        file.set_len(len)
            .await
            .map_err(|e| WalError::io("truncate", e))
    }
}
