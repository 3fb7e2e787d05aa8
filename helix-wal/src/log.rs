//! Per topic-partition commit log.
//!
//! The commit log is a single append-only file of CRC-framed
//! [`CommitEntry`] records. Every append is synced before it returns, so an
//! entry that was acknowledged survives a crash.
//!
//! # Truncation and Compaction
//!
//! Truncation is logical: [`CommitLog::truncate`] appends a
//! [`CommitEntry::TruncateTo`] marker and the entries it covers disappear
//! from [`CommitLog::read_all`]. Once the file grows past
//! [`CommitLogConfig::compaction_bytes`], it is rewritten to hold only the
//! live entries and one marker. The rewrite goes to a sibling `.compact`
//! file that is renamed over the log, so a crash mid-compaction leaves the
//! original intact.
//!
//! # Recovery
//!
//! Opening the log replays every entry. A torn entry at the tail (from a crash
//! mid-append) is dropped and trimmed from the file. A checksum mismatch or an
//! undecodable entry is corruption and fails the open.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use helix_core::Offset;
use tracing::{debug, info, warn};

use crate::commit::{CommitEntry, LoggedEntry};
use crate::error::{WalError, WalResult};
use crate::frame::FrameReader;
use crate::limits::COMPACTION_BYTES_DEFAULT;
use crate::storage::{Storage, StorageFile};

/// Suffix of the temporary file used while compacting.
const COMPACT_SUFFIX: &str = "compact";

/// Commit log configuration.
#[derive(Debug, Clone)]
pub struct CommitLogConfig {
    /// File size after which a truncation also compacts the file.
    pub compaction_bytes: u64,
}

impl Default for CommitLogConfig {
    fn default() -> Self {
        Self {
            compaction_bytes: COMPACTION_BYTES_DEFAULT,
        }
    }
}

impl CommitLogConfig {
    /// Sets the compaction threshold.
    #[must_use]
    pub const fn with_compaction_bytes(mut self, bytes: u64) -> Self {
        self.compaction_bytes = bytes;
        self
    }
}

/// An open commit log.
pub struct CommitLog<S: Storage> {
    storage: Arc<S>,
    path: PathBuf,
    config: CommitLogConfig,
    /// Open handle; `None` when it must be reopened (after compaction).
    file: Option<Box<dyn StorageFile>>,
    /// Byte offset where the next entry is written.
    write_offset: u64,
    /// Set when an append failed and bytes past `write_offset` may be garbage.
    dirty_tail: bool,
    /// Sequence number for the next entry.
    next_seq: u64,
    /// Entries above the truncation point, in order.
    live: Vec<LoggedEntry>,
    /// Highest truncated sequence.
    truncated_through: Option<u64>,
    /// Most recent watermark carried by any entry.
    watermark: Option<Offset>,
    /// Number of framed entries physically in the file.
    entries_on_disk: u64,
}

impl<S: Storage> CommitLog<S> {
    /// Opens (or creates) the log at `path` and replays it.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, or `ChecksumMismatch` /
    /// `InvalidEntry` if it is corrupt.
    pub async fn open(
        storage: Arc<S>,
        path: impl Into<PathBuf>,
        config: CommitLogConfig,
    ) -> WalResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            storage.create_dir_all(parent).await?;
        }

        let compact_path = compaction_path(&path);
        if storage.exists(&compact_path).await? {
            warn!(path = %compact_path.display(), "Removing interrupted compaction");
            storage.remove(&compact_path).await?;
        }

        let file = storage.open(&path).await?;
        let data = file.read_all().await?;

        let mut log = Self {
            storage,
            path,
            config,
            file: None,
            write_offset: 0,
            dirty_tail: false,
            next_seq: 1,
            live: Vec::new(),
            truncated_through: None,
            watermark: None,
            entries_on_disk: 0,
        };

        let valid_len = log.replay(&data)?;
        if valid_len < data.len() as u64 {
            warn!(
                path = %log.path.display(),
                valid_len,
                file_len = data.len(),
                "Truncating torn tail of commit log"
            );
            file.truncate(valid_len).await?;
            file.sync().await?;
        }
        log.write_offset = valid_len;
        log.file = Some(file);

        info!(
            path = %log.path.display(),
            entries = log.entries_on_disk,
            live = log.live.len(),
            "Commit log opened"
        );
        Ok(log)
    }

    /// Decodes entries from `data`, returning the length of the valid prefix.
    fn replay(&mut self, data: &[u8]) -> WalResult<u64> {
        let mut frames = FrameReader::new(data);
        while let Some((offset, frame)) = frames.next_frame()? {
            if frame.sequence < self.next_seq {
                return Err(WalError::invalid_entry(offset, "sequence went backwards"));
            }
            let commit = CommitEntry::decode(frame.kind, &frame.payload, offset)?;
            if let CommitEntry::TruncateTo { seq: up_to, .. } = &commit {
                if *up_to >= frame.sequence {
                    return Err(WalError::invalid_entry(offset, "truncation marker covers itself"));
                }
            }
            self.apply(frame.sequence, commit);
            self.entries_on_disk += 1;
        }
        Ok(frames.valid_len())
    }

    /// Applies an entry to the in-memory view.
    ///
    /// # Panics
    /// Panics if `seq` is at or below the truncation point.
    fn apply(&mut self, seq: u64, entry: CommitEntry) {
        assert!(
            self.truncated_through.is_none_or(|t| seq > t),
            "entry sequence at or below truncation point"
        );
        self.watermark = self.watermark.max(entry.watermark());
        self.next_seq = seq + 1;

        match entry {
            CommitEntry::TruncateTo { seq: up_to, .. } => {
                self.truncated_through = self.truncated_through.max(Some(up_to));
                self.live.retain(|e| e.seq > up_to);
            }
            entry => self.live.push(LoggedEntry { seq, entry }),
        }
    }

    /// Appends an entry and syncs it, returning its sequence number.
    ///
    /// # Errors
    /// Returns an error if the write or sync fails. The entry is then not part
    /// of the log, and the next append overwrites any partial bytes.
    pub async fn append(&mut self, entry: CommitEntry) -> WalResult<u64> {
        let seq = self.next_seq;
        let mut buf = BytesMut::new();
        entry.encode_frame(seq, &mut buf)?;

        let file = match self.file.take() {
            Some(file) => file,
            None => self.storage.open(&self.path).await?,
        };
        let result = self.write_frame(file.as_ref(), &buf).await;
        self.file = Some(file);

        if let Err(e) = result {
            self.dirty_tail = true;
            return Err(e);
        }

        self.write_offset += buf.len() as u64;
        self.entries_on_disk += 1;
        debug!(path = %self.path.display(), seq, kind = entry.kind(), "Appended commit entry");
        self.apply(seq, entry);
        Ok(seq)
    }

    async fn write_frame(&mut self, file: &dyn StorageFile, frame: &[u8]) -> WalResult<()> {
        if self.dirty_tail {
            file.truncate(self.write_offset).await?;
            self.dirty_tail = false;
        }
        file.write_at_and_sync(self.write_offset, frame).await
    }

    /// Returns the live entries, in sequence order.
    #[must_use]
    pub fn read_all(&self) -> &[LoggedEntry] {
        &self.live
    }

    /// Returns the most recent watermark recorded in the log.
    #[must_use]
    pub const fn recorded_watermark(&self) -> Option<Offset> {
        self.watermark
    }

    /// Returns the sequence number of the last appended entry.
    #[must_use]
    pub const fn last_seq(&self) -> Option<u64> {
        match self.next_seq {
            1 => None,
            next => Some(next - 1),
        }
    }

    /// Returns the highest truncated sequence.
    #[must_use]
    pub const fn truncated_through(&self) -> Option<u64> {
        self.truncated_through
    }

    /// Returns the log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current log file size in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.write_offset
    }

    /// Marks every entry with sequence `<= up_to_seq` redundant.
    ///
    /// Compacts the file afterwards if it has outgrown the threshold.
    ///
    /// # Panics
    /// Panics if `up_to_seq` was never appended.
    ///
    /// # Errors
    /// Returns an error if the marker cannot be appended or compaction fails.
    pub async fn truncate(&mut self, up_to_seq: u64, watermark: Option<Offset>) -> WalResult<()> {
        assert!(up_to_seq < self.next_seq, "cannot truncate past the last entry");
        let covered = self.truncated_through.is_some_and(|t| t >= up_to_seq);
        if covered && watermark <= self.watermark {
            return Ok(());
        }

        self.append(CommitEntry::TruncateTo {
            seq: up_to_seq,
            watermark,
        })
        .await?;

        if self.write_offset >= self.config.compaction_bytes {
            self.compact(None).await?;
        }
        Ok(())
    }

    /// Drops every entry and compacts, leaving a single marker carrying
    /// `watermark`.
    ///
    /// Calling this on a log that already has that shape does nothing.
    ///
    /// # Errors
    /// Returns an error if compaction fails.
    pub async fn reset(&mut self, watermark: Option<Offset>) -> WalResult<()> {
        if let Some(last) = self.last_seq() {
            self.truncated_through = self.truncated_through.max(Some(last));
        }
        self.live.clear();
        self.compact(watermark).await
    }

    /// Rewrites the file as the live entries plus one truncation marker.
    ///
    /// `watermark` raises the recorded watermark if it is higher.
    ///
    /// # Errors
    /// Returns an error if the rewrite fails; the original file is then intact.
    pub async fn compact(&mut self, watermark: Option<Offset>) -> WalResult<()> {
        let watermark = self.watermark.max(watermark);
        if self.is_compact(watermark) {
            return Ok(());
        }

        let up_to = self
            .live
            .first()
            .map_or(self.next_seq - 1, |first| first.seq - 1);
        let marker_seq = self.next_seq;

        let mut buf = BytesMut::new();
        for logged in &self.live {
            logged.entry.encode_frame(logged.seq, &mut buf)?;
        }
        let marker = CommitEntry::TruncateTo {
            seq: up_to,
            watermark,
        };
        marker.encode_frame(marker_seq, &mut buf)?;

        let compact_path = compaction_path(&self.path);
        let compact_file = self.storage.open(&compact_path).await?;
        compact_file.truncate(0).await?;
        compact_file.write_at_and_sync(0, &buf).await?;
        drop(compact_file);
        self.storage.rename(&compact_path, &self.path).await?;

        // The old handle refers to the replaced file.
        self.file = None;
        self.dirty_tail = false;
        self.write_offset = buf.len() as u64;
        self.entries_on_disk = self.live.len() as u64 + 1;
        self.next_seq = marker_seq + 1;
        self.truncated_through = Some(up_to);
        self.watermark = watermark;

        info!(
            path = %self.path.display(),
            live = self.live.len(),
            size = self.write_offset,
            "Compacted commit log"
        );
        Ok(())
    }

    /// Returns true if the file holds nothing but a marker for `watermark`.
    fn is_compact(&self, watermark: Option<Offset>) -> bool {
        if !self.live.is_empty() || self.dirty_tail || watermark != self.watermark {
            return false;
        }
        match self.entries_on_disk {
            0 => watermark.is_none(),
            1 => self.truncated_through.is_some(),
            _ => false,
        }
    }
}

fn compaction_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(COMPACT_SUFFIX);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use helix_core::FileId;

    use super::*;
    use crate::storage::{FaultConfig, SimulatedStorage, TokioStorage};

    fn begin(id: u64) -> CommitEntry {
        CommitEntry::BeginTemp {
            file_id: FileId::new(id),
            temp_path: PathBuf::from(format!("/topics/+tmp/t/p/t+0+{id}_tmp")),
        }
    }

    fn committed(id: u64, start: u64, end: u64) -> CommitEntry {
        CommitEntry::AppendCommitted {
            file_id: FileId::new(id),
            temp_path: PathBuf::from(format!("/topics/+tmp/t/p/t+0+{id}_tmp")),
            committed_path: PathBuf::from(format!("/topics/t/p/t+0+{start}+{end}")),
            start: Offset::new(start),
            end: Offset::new(end),
            watermark: Some(Offset::new(end)),
        }
    }

    async fn open_sim(storage: &SimulatedStorage) -> CommitLog<SimulatedStorage> {
        CommitLog::open(
            Arc::new(storage.clone()),
            "/logs/t/0/log",
            CommitLogConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_commit_log_append_and_reopen() {
        let storage = SimulatedStorage::new(1);
        let mut log = open_sim(&storage).await;
        assert_eq!(log.last_seq(), None);

        assert_eq!(log.append(begin(1)).await.unwrap(), 1);
        assert_eq!(log.append(committed(1, 0, 2)).await.unwrap(), 2);
        drop(log);

        // Appends are synced, so they survive a crash.
        storage.simulate_crash();
        let log = open_sim(&storage).await;
        assert_eq!(log.read_all().len(), 2);
        assert_eq!(log.read_all()[1].entry, committed(1, 0, 2));
        assert_eq!(log.recorded_watermark(), Some(Offset::new(2)));
        assert_eq!(log.last_seq(), Some(2));
    }

    #[tokio::test]
    async fn test_commit_log_truncate_hides_entries() {
        let storage = SimulatedStorage::new(1);
        let mut log = open_sim(&storage).await;

        log.append(begin(1)).await.unwrap();
        log.append(committed(1, 0, 2)).await.unwrap();
        log.append(begin(2)).await.unwrap();
        log.truncate(2, Some(Offset::new(2))).await.unwrap();

        assert_eq!(log.read_all().len(), 1);
        assert_eq!(log.read_all()[0].seq, 3);
        drop(log);

        let log = open_sim(&storage).await;
        assert_eq!(log.read_all().len(), 1);
        assert_eq!(log.truncated_through(), Some(2));
        assert_eq!(log.recorded_watermark(), Some(Offset::new(2)));
    }

    #[tokio::test]
    async fn test_commit_log_torn_tail_is_trimmed() {
        let storage = SimulatedStorage::new(1);
        let mut log = open_sim(&storage).await;
        log.append(committed(1, 0, 2)).await.unwrap();
        let good_len = log.size_bytes();

        storage.fault_config().force_torn_write_at = Some(10);
        assert!(log.append(committed(2, 3, 5)).await.is_err());
        drop(log);

        let log = open_sim(&storage).await;
        assert_eq!(log.read_all().len(), 1);
        assert_eq!(log.size_bytes(), good_len);
        let path = Path::new("/logs/t/0/log");
        assert_eq!(storage.get_raw_content(path).unwrap().len() as u64, good_len);
    }

    #[tokio::test]
    async fn test_commit_log_retry_after_failed_append_overwrites_garbage() {
        let storage = SimulatedStorage::new(1);
        let mut log = open_sim(&storage).await;
        log.append(begin(1)).await.unwrap();

        storage.fault_config().force_torn_write_at = Some(30);
        assert!(log.append(committed(1, 0, 2)).await.is_err());
        // Retry with a shorter entry; the longer garbage must not survive.
        assert_eq!(log.append(begin(2)).await.unwrap(), 2);
        drop(log);

        let log = open_sim(&storage).await;
        assert_eq!(log.read_all().len(), 2);
        assert_eq!(log.read_all()[1].entry, begin(2));
    }

    #[tokio::test]
    async fn test_commit_log_checksum_mismatch_is_corruption() {
        let storage = SimulatedStorage::new(1);
        let mut log = open_sim(&storage).await;
        log.append(committed(1, 0, 2)).await.unwrap();
        log.append(committed(2, 3, 5)).await.unwrap();
        drop(log);

        storage.corrupt_bytes(Path::new("/logs/t/0/log"), crate::FRAME_HEADER_SIZE + 2, 1);

        let result = CommitLog::open(
            Arc::new(storage.clone()),
            "/logs/t/0/log",
            CommitLogConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(ref e) if e.is_corruption()));
    }

    #[tokio::test]
    async fn test_commit_log_self_covering_marker_is_corruption() {
        let storage = SimulatedStorage::new(1);
        let mut buf = BytesMut::new();
        committed(1, 0, 2).encode_frame(1, &mut buf).unwrap();
        CommitEntry::TruncateTo {
            seq: 5,
            watermark: Some(Offset::new(2)),
        }
        .encode_frame(2, &mut buf)
        .unwrap();
        storage.set_raw_content(Path::new("/logs/t/0/log"), buf.to_vec());

        let result = CommitLog::open(
            Arc::new(storage.clone()),
            "/logs/t/0/log",
            CommitLogConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(ref e) if e.is_corruption()));
    }

    #[tokio::test]
    async fn test_commit_log_compaction_keeps_live_entries() {
        let storage = SimulatedStorage::new(1);
        let mut log = CommitLog::open(
            Arc::new(storage.clone()),
            "/logs/t/0/log",
            CommitLogConfig::default().with_compaction_bytes(256),
        )
        .await
        .unwrap();

        let mut seq = 0;
        for i in 0..10u64 {
            log.append(begin(i)).await.unwrap();
            seq = log.append(committed(i, i * 3, i * 3 + 2)).await.unwrap();
            log.truncate(seq, Some(Offset::new(i * 3 + 2))).await.unwrap();
        }
        log.append(begin(99)).await.unwrap();
        assert!(log.size_bytes() < 512);
        drop(log);

        let log = open_sim(&storage).await;
        assert_eq!(log.read_all().len(), 1);
        assert_eq!(log.read_all()[0].entry, begin(99));
        assert!(log.last_seq().unwrap() > seq);
        assert_eq!(log.recorded_watermark(), Some(Offset::new(29)));
    }

    #[tokio::test]
    async fn test_commit_log_reset_is_idempotent() {
        let storage = SimulatedStorage::new(1);
        let path = Path::new("/logs/t/0/log");
        let mut log = open_sim(&storage).await;
        log.append(begin(1)).await.unwrap();
        log.append(committed(1, 0, 2)).await.unwrap();

        log.reset(Some(Offset::new(2))).await.unwrap();
        assert!(log.read_all().is_empty());
        let after_first = storage.get_raw_content(path).unwrap();
        drop(log);

        let mut log = open_sim(&storage).await;
        log.reset(Some(Offset::new(2))).await.unwrap();
        assert_eq!(storage.get_raw_content(path).unwrap(), after_first);
        assert_eq!(log.recorded_watermark(), Some(Offset::new(2)));
    }

    #[tokio::test]
    async fn test_commit_log_reset_on_empty_log_writes_nothing() {
        let storage = SimulatedStorage::new(1);
        let mut log = open_sim(&storage).await;
        log.reset(None).await.unwrap();
        assert_eq!(log.size_bytes(), 0);
        assert!(storage
            .get_raw_content(Path::new("/logs/t/0/log"))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_commit_log_interrupted_compaction_is_discarded() {
        let storage = SimulatedStorage::new(1);
        let mut log = open_sim(&storage).await;
        log.append(committed(1, 0, 2)).await.unwrap();
        drop(log);

        storage.set_raw_content(Path::new("/logs/t/0/log.compact"), b"partial".to_vec());

        let log = open_sim(&storage).await;
        assert_eq!(log.read_all().len(), 1);
        assert!(storage
            .get_raw_content(Path::new("/logs/t/0/log.compact"))
            .is_none());
    }

    #[tokio::test]
    async fn test_commit_log_failed_sync_is_not_acknowledged() {
        let storage = SimulatedStorage::with_faults(1, FaultConfig::none().with_force_fsync_fail());
        let mut log = open_sim(&storage).await;

        assert!(log.append(begin(1)).await.is_err());
        assert_eq!(log.last_seq(), None);
        assert_eq!(log.append(begin(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commit_log_on_tokio_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("t").join("0").join("log");
        let storage = Arc::new(TokioStorage::new());

        let mut log = CommitLog::open(storage.clone(), &path, CommitLogConfig::default())
            .await
            .unwrap();
        log.append(begin(1)).await.unwrap();
        log.append(committed(1, 0, 2)).await.unwrap();
        log.reset(Some(Offset::new(2))).await.unwrap();
        log.append(begin(2)).await.unwrap();
        drop(log);

        let log = CommitLog::open(storage, &path, CommitLogConfig::default())
            .await
            .unwrap();
        assert_eq!(log.read_all().len(), 1);
        assert_eq!(log.recorded_watermark(), Some(Offset::new(2)));
    }
}
