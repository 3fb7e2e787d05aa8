//! In-memory storage for deterministic simulation testing.
//!
//! Each file has a live copy, which every write changes, and a durable copy,
//! which only `sync` updates. [`SimulatedStorage::simulate_crash`] throws the
//! live copies away. Rename and remove act on both copies at once, like a
//! journaling filesystem once the directory entry is persisted.
//!
//! Faults are drawn from one seeded RNG, so a seed replays the same fault
//! sequence as long as the caller issues the same operations. A path filter
//! scopes faults to a subset of files; tests use it to fail one lane's temp
//! file while the commit log stays healthy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Storage, StorageFile};
use crate::error::{WalError, WalResult};

/// Storage calls a fault can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    /// `Storage::open`.
    Open,
    /// `Storage::exists`.
    Exists,
    /// `Storage::list_files_recursive`.
    List,
    /// `Storage::rename`.
    Rename,
    /// `Storage::remove`.
    Remove,
    /// `StorageFile::write_at`.
    Write,
    /// `StorageFile::read_all`.
    Read,
    /// `StorageFile::sync`.
    Sync,
}

impl StorageOp {
    const COUNT: usize = 8;

    const fn index(self) -> usize {
        self as usize
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Exists => "exists",
            Self::List => "list",
            Self::Rename => "rename",
            Self::Remove => "remove",
            Self::Write => "write",
            Self::Read => "read",
            Self::Sync => "sync",
        }
    }
}

/// Which faults to inject, and how often.
///
/// Rates are probabilities in `0.0..=1.0` per call. The `force_*` fields
/// fire once on the next matching call and then reset.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    rates: [f64; StorageOp::COUNT],
    /// Chance that a write lands only in part before failing.
    pub torn_write_rate: f64,
    /// Only paths containing this substring see faults.
    pub path_filter: Option<String>,
    /// Tears the next write after this many bytes.
    pub force_torn_write_at: Option<usize>,
    /// Fails the next sync.
    pub force_fsync_fail: bool,
    /// Fails the next write as if the disk were full.
    pub force_disk_full: bool,
    /// Fails the next rename.
    pub force_rename_fail: bool,
}

impl FaultConfig {
    /// No faults.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Occasional transient failures on every operation.
    ///
    /// Reads never return corrupt data: the sink treats corruption as fatal,
    /// not transient.
    #[must_use]
    pub fn flaky() -> Self {
        Self::none()
            .with_rate(StorageOp::Open, 0.005)
            .with_rate(StorageOp::Exists, 0.005)
            .with_rate(StorageOp::List, 0.005)
            .with_rate(StorageOp::Rename, 0.01)
            .with_rate(StorageOp::Remove, 0.005)
            .with_rate(StorageOp::Write, 0.01)
            .with_rate(StorageOp::Read, 0.005)
            .with_rate(StorageOp::Sync, 0.01)
            .with_torn_write_rate(0.01)
    }

    /// Returns the failure rate of `op`.
    #[must_use]
    pub const fn rate(&self, op: StorageOp) -> f64 {
        self.rates[op.index()]
    }

    /// Sets the failure rate of `op`.
    #[must_use]
    pub const fn with_rate(mut self, op: StorageOp, rate: f64) -> Self {
        self.rates[op.index()] = rate;
        self
    }

    /// Sets the write failure rate.
    #[must_use]
    pub const fn with_write_fail_rate(self, rate: f64) -> Self {
        self.with_rate(StorageOp::Write, rate)
    }

    /// Sets the sync failure rate.
    #[must_use]
    pub const fn with_fsync_fail_rate(self, rate: f64) -> Self {
        self.with_rate(StorageOp::Sync, rate)
    }

    /// Sets the rename failure rate.
    #[must_use]
    pub const fn with_rename_fail_rate(self, rate: f64) -> Self {
        self.with_rate(StorageOp::Rename, rate)
    }

    /// Sets the remove failure rate.
    #[must_use]
    pub const fn with_remove_fail_rate(self, rate: f64) -> Self {
        self.with_rate(StorageOp::Remove, rate)
    }

    /// Sets the listing failure rate.
    #[must_use]
    pub const fn with_list_files_fail_rate(self, rate: f64) -> Self {
        self.with_rate(StorageOp::List, rate)
    }

    /// Sets the torn write rate.
    #[must_use]
    pub const fn with_torn_write_rate(mut self, rate: f64) -> Self {
        self.torn_write_rate = rate;
        self
    }

    /// Restricts faults to paths containing `filter`.
    #[must_use]
    pub fn with_path_filter(mut self, filter: impl Into<String>) -> Self {
        self.path_filter = Some(filter.into());
        self
    }

    /// Tears the next write after `len` bytes.
    #[must_use]
    pub const fn with_force_torn_write_at(mut self, len: usize) -> Self {
        self.force_torn_write_at = Some(len);
        self
    }

    /// Fails the next sync.
    #[must_use]
    pub const fn with_force_fsync_fail(mut self) -> Self {
        self.force_fsync_fail = true;
        self
    }

    /// Fails the next write with disk full.
    #[must_use]
    pub const fn with_force_disk_full(mut self) -> Self {
        self.force_disk_full = true;
        self
    }

    /// Fails the next rename.
    #[must_use]
    pub const fn with_force_rename_fail(mut self) -> Self {
        self.force_rename_fail = true;
        self
    }

    /// Returns true if faults apply to `path`.
    #[must_use]
    pub fn applies_to(&self, path: &Path) -> bool {
        self.path_filter
            .as_deref()
            .is_none_or(|filter| path.to_string_lossy().contains(filter))
    }

    /// Turns every fault off. The path filter stays.
    pub fn clear(&mut self) {
        *self = Self {
            path_filter: self.path_filter.take(),
            ..Self::default()
        };
    }
}

/// Counts of injected faults.
#[derive(Debug, Clone, Default)]
pub struct FaultStats {
    injected: [u64; StorageOp::COUNT],
    /// Writes that landed in part.
    pub torn_writes: u64,
    /// Storage calls made, faulted or not.
    pub total_ops: u64,
}

impl FaultStats {
    /// Returns how many times `op` was failed.
    #[must_use]
    pub const fn injected(&self, op: StorageOp) -> u64 {
        self.injected[op.index()]
    }

    /// Returns every injected fault, torn writes included.
    #[must_use]
    pub fn total_faults(&self) -> u64 {
        self.injected.iter().sum::<u64>() + self.torn_writes
    }
}

type Files = HashMap<PathBuf, Vec<u8>>;

#[derive(Debug, Default)]
struct Disk {
    live: Files,
    durable: Files,
}

#[derive(Debug)]
struct Dice {
    rng: StdRng,
    stats: FaultStats,
}

#[derive(Debug)]
struct Shared {
    disk: Mutex<Disk>,
    faults: Mutex<FaultConfig>,
    dice: Mutex<Dice>,
}

/// A poisoned lock only means another test thread panicked; the data is
/// still usable for inspection.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn injected(op: StorageOp, detail: &str) -> WalError {
    WalError::io(op.name(), format!("{detail} (simulated)"))
}

fn not_found(op: StorageOp, path: &Path) -> WalError {
    WalError::io(op.name(), format!("{} not found", path.display()))
}

impl Shared {
    /// Counts one call and, if the dice say so, fails it.
    fn roll(&self, op: StorageOp, paths: &[&Path]) -> WalResult<()> {
        let rate = {
            let faults = lock(&self.faults);
            if paths.iter().any(|p| faults.applies_to(p)) {
                faults.rate(op)
            } else {
                0.0
            }
        };

        let mut dice = lock(&self.dice);
        dice.stats.total_ops += 1;
        if rate > 0.0 && dice.rng.gen::<f64>() < rate {
            dice.stats.injected[op.index()] += 1;
            return Err(injected(op, "injected failure"));
        }
        Ok(())
    }

    fn record(&self, op: StorageOp) {
        lock(&self.dice).stats.injected[op.index()] += 1;
    }

    /// Decides how a write to `path` of `len` bytes fails, if at all.
    fn write_outcome(&self, path: &Path, len: usize) -> WalResult<Option<usize>> {
        self.roll(StorageOp::Write, &[path])?;

        let mut faults = lock(&self.faults);
        if !faults.applies_to(path) {
            return Ok(None);
        }
        if faults.force_disk_full {
            faults.force_disk_full = false;
            drop(faults);
            self.record(StorageOp::Write);
            return Err(injected(StorageOp::Write, "disk full"));
        }
        if let Some(at) = faults.force_torn_write_at.take() {
            return Ok(Some(at.min(len)));
        }
        let rate = faults.torn_write_rate;
        drop(faults);

        if rate <= 0.0 {
            return Ok(None);
        }
        let mut dice = lock(&self.dice);
        if dice.rng.gen::<f64>() < rate {
            Ok(Some(dice.rng.gen_range(0..len.max(1))))
        } else {
            Ok(None)
        }
    }
}

/// In-memory [`Storage`] with crash simulation and fault injection.
///
/// Clones share the same files and fault settings. Directories are implicit.
#[derive(Debug, Clone)]
pub struct SimulatedStorage {
    shared: Arc<Shared>,
}

impl SimulatedStorage {
    /// Creates an empty storage that never fails.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_faults(seed, FaultConfig::none())
    }

    /// Creates an empty storage that injects `faults`.
    #[must_use]
    pub fn with_faults(seed: u64, faults: FaultConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                disk: Mutex::new(Disk::default()),
                faults: Mutex::new(faults),
                dice: Mutex::new(Dice {
                    rng: StdRng::seed_from_u64(seed),
                    stats: FaultStats::default(),
                }),
            }),
        }
    }

    /// Loses everything written since each file's last sync.
    pub fn simulate_crash(&self) {
        let mut disk = lock(&self.shared.disk);
        disk.live = disk.durable.clone();
    }

    /// Returns the fault settings for in-place changes.
    pub fn fault_config(&self) -> MutexGuard<'_, FaultConfig> {
        lock(&self.shared.faults)
    }

    /// Replaces the fault settings.
    pub fn set_fault_config(&self, faults: FaultConfig) {
        *self.fault_config() = faults;
    }

    /// Returns the fault counts so far.
    #[must_use]
    pub fn fault_stats(&self) -> FaultStats {
        lock(&self.shared.dice).stats.clone()
    }

    /// Returns the live content of `path`.
    #[must_use]
    pub fn get_raw_content(&self, path: &Path) -> Option<Vec<u8>> {
        lock(&self.shared.disk).live.get(path).cloned()
    }

    /// Returns the content of `path` that would survive a crash.
    #[must_use]
    pub fn get_synced_content(&self, path: &Path) -> Option<Vec<u8>> {
        lock(&self.shared.disk).durable.get(path).cloned()
    }

    /// Returns every live path, sorted.
    #[must_use]
    pub fn file_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = lock(&self.shared.disk).live.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Returns every live file with its content.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<PathBuf, Vec<u8>> {
        lock(&self.shared.disk).live.clone()
    }

    /// Replaces the live content of `path` without syncing it.
    pub fn set_raw_content(&self, path: &Path, content: Vec<u8>) {
        lock(&self.shared.disk).live.insert(path.to_path_buf(), content);
    }

    /// Flips `len` live bytes of `path` starting at `offset`.
    pub fn corrupt_bytes(&self, path: &Path, offset: usize, len: usize) {
        if let Some(content) = lock(&self.shared.disk).live.get_mut(path) {
            for byte in content.iter_mut().skip(offset).take(len) {
                *byte ^= 0xFF;
            }
        }
    }

    /// Deletes `path` outright, without fault injection.
    pub fn delete_file(&self, path: &Path) {
        let mut disk = lock(&self.shared.disk);
        disk.live.remove(path);
        disk.durable.remove(path);
    }
}

#[async_trait]
impl Storage for SimulatedStorage {
    async fn open(&self, path: &Path) -> WalResult<Box<dyn StorageFile>> {
        self.shared.roll(StorageOp::Open, &[path])?;
        lock(&self.shared.disk)
            .live
            .entry(path.to_path_buf())
            .or_default();
        Ok(Box::new(SimulatedFile {
            path: path.to_path_buf(),
            shared: self.shared.clone(),
        }))
    }

    async fn exists(&self, path: &Path) -> WalResult<bool> {
        self.shared.roll(StorageOp::Exists, &[path])?;
        Ok(lock(&self.shared.disk).live.contains_key(path))
    }

    async fn list_files_recursive(&self, dir: &Path) -> WalResult<Vec<PathBuf>> {
        self.shared.roll(StorageOp::List, &[dir])?;
        let mut files: Vec<_> = lock(&self.shared.disk)
            .live
            .keys()
            .filter(|p| p.starts_with(dir) && p.as_path() != dir)
            .cloned()
            .collect();
        files.sort();
        Ok(files)
    }

    async fn rename(&self, from: &Path, to: &Path) -> WalResult<()> {
        let forced = {
            let mut faults = lock(&self.shared.faults);
            let forced = faults.force_rename_fail && (faults.applies_to(from) || faults.applies_to(to));
            if forced {
                faults.force_rename_fail = false;
            }
            forced
        };
        if forced {
            self.shared.record(StorageOp::Rename);
            return Err(injected(StorageOp::Rename, "forced failure"));
        }
        self.shared.roll(StorageOp::Rename, &[from, to])?;

        let mut disk = lock(&self.shared.disk);
        let content = disk
            .live
            .remove(from)
            .ok_or_else(|| not_found(StorageOp::Rename, from))?;
        disk.live.insert(to.to_path_buf(), content);
        // The entry moves durably; unsynced content does not come along.
        match disk.durable.remove(from) {
            Some(durable) => disk.durable.insert(to.to_path_buf(), durable),
            None => disk.durable.remove(to),
        };
        Ok(())
    }

    async fn remove(&self, path: &Path) -> WalResult<()> {
        self.shared.roll(StorageOp::Remove, &[path])?;
        let mut disk = lock(&self.shared.disk);
        disk.durable.remove(path);
        disk.live
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(StorageOp::Remove, path))
    }

    async fn create_dir_all(&self, _path: &Path) -> WalResult<()> {
        Ok(())
    }
}

/// An open simulated file.
struct SimulatedFile {
    path: PathBuf,
    shared: Arc<Shared>,
}

#[async_trait]
#[allow(clippy::cast_possible_truncation)] // Simulated files stay far below usize::MAX.
impl StorageFile for SimulatedFile {
    async fn write_at(&self, offset: u64, data: &[u8]) -> WalResult<()> {
        let torn_at = self.shared.write_outcome(&self.path, data.len())?;

        let start = offset as usize;
        let mut disk = lock(&self.shared.disk);
        let content = disk.live.entry(self.path.clone()).or_default();
        let landed = torn_at.unwrap_or(data.len());
        if content.len() < start + landed {
            content.resize(start + landed, 0);
        }
        content[start..start + landed].copy_from_slice(&data[..landed]);

        if torn_at.is_some() {
            // The file ends where the write stopped.
            content.truncate(start + landed);
            drop(disk);
            lock(&self.shared.dice).stats.torn_writes += 1;
            return Err(injected(StorageOp::Write, "torn write"));
        }
        Ok(())
    }

    async fn read_all(&self) -> WalResult<Bytes> {
        self.shared.roll(StorageOp::Read, &[self.path.as_path()])?;
        lock(&self.shared.disk)
            .live
            .get(&self.path)
            .map(|content| Bytes::from(content.clone()))
            .ok_or_else(|| not_found(StorageOp::Read, &self.path))
    }

    async fn sync(&self) -> WalResult<()> {
        let forced = {
            let mut faults = lock(&self.shared.faults);
            let forced = faults.force_fsync_fail && faults.applies_to(&self.path);
            if forced {
                faults.force_fsync_fail = false;
            }
            forced
        };
        if forced {
            self.shared.record(StorageOp::Sync);
            return Err(injected(StorageOp::Sync, "forced failure"));
        }
        self.shared.roll(StorageOp::Sync, &[self.path.as_path()])?;

        let mut disk = lock(&self.shared.disk);
        if let Some(content) = disk.live.get(&self.path).cloned() {
            disk.durable.insert(self.path.clone(), content);
        }
        Ok(())
    }

    async fn truncate(&self, len: u64) -> WalResult<()> {
        lock(&self.shared.disk)
            .live
            .entry(self.path.clone())
            .or_default()
            .truncate(len as usize);
        Ok(())
    }
}
