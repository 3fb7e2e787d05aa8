//! Topic-partition writer.
//!
//! One writer owns one topic-partition: its commit log, its temp files and
//! the commit watermark reported upstream. Records are routed to encoded
//! partitions ("lanes"); each lane has at most one pending file at a time.
//!
//! # States
//!
//! ```text
//! Recovering ──► Active ◄──► RetryBackoff
//!     │             │              │
//!     └─────────────┴──► Fatal ◄───┘
//! ```
//!
//! # Sealing
//!
//! A pending file is sealed in stages, each of which survives a failure and
//! is retried from where it stopped:
//!
//! 1. close (flush and sync) the temp file;
//! 2. log `BeginTemp`;
//! 3. log `AppendCommitted`, after which the file is part of the committed set;
//! 4. rename the temp file to its committed name.
//!
//! Afterwards the log is truncated and the watermark advances. A failed
//! append or close leaves bytes of unknown state behind, so the lane discards
//! that temp file and replays its retained records into a new one. Storage
//! is never touched for a lane in backoff; the first tick past the deadline
//! re-attempts the failed step once.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use helix_core::{FileId, Offset, SinkRecord, TopicPartition};
use helix_wal::{CommitEntry, CommitLog, CommitLogConfig, Storage};
use tracing::{debug, error, info, warn};

use crate::catalog::NewPartition;
use crate::config::SinkConfig;
use crate::error::{FailureKind, SinkError, SinkResult};
use crate::format::{self, RecordFormat, RecordWriter};
use crate::naming::FileNaming;
use crate::partitioner::Partitioner;
use crate::recovery::{self, LoggedWatermark, RecoveryPlan};
use crate::retry::RetryState;

/// Everything a writer needs that is shared across topic-partitions.
pub struct WriterContext {
    pub(crate) config: SinkConfig,
    pub(crate) naming: FileNaming,
    pub(crate) format: Arc<dyn RecordFormat>,
    pub(crate) partitioner: Arc<dyn Partitioner>,
}

impl WriterContext {
    /// Builds a context, using the configured extension or the format's.
    ///
    /// # Errors
    /// Returns `Configuration` if `config` is invalid.
    pub fn new(
        config: SinkConfig,
        format: Arc<dyn RecordFormat>,
        partitioner: Arc<dyn Partitioner>,
    ) -> SinkResult<Self> {
        config.validate()?;
        Ok(Self::assemble(config, format, partitioner))
    }

    /// Builds a context from an already validated configuration.
    fn assemble(
        config: SinkConfig,
        format: Arc<dyn RecordFormat>,
        partitioner: Arc<dyn Partitioner>,
    ) -> Self {
        let extension = config
            .extension
            .clone()
            .unwrap_or_else(|| format.extension().to_string());
        let naming = FileNaming::new(
            config.topics_dir.clone(),
            config.logs_dir.clone(),
            config.zero_pad_width,
            extension,
        );
        Self {
            config,
            naming,
            format,
            partitioner,
        }
    }

    /// Returns a copy with a different format.
    #[must_use]
    pub fn with_format(&self, format: Arc<dyn RecordFormat>) -> Self {
        Self::assemble(self.config.clone(), format, self.partitioner.clone())
    }

    /// Returns a copy with a different partitioner.
    #[must_use]
    pub fn with_partitioner(&self, partitioner: Arc<dyn Partitioner>) -> Self {
        Self::assemble(self.config.clone(), self.format.clone(), partitioner)
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Returns the path scheme.
    #[must_use]
    pub const fn naming(&self) -> &FileNaming {
        &self.naming
    }
}

/// Externally visible writer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Recovery has not completed.
    Recovering,
    /// Every lane is healthy.
    Active,
    /// At least one lane (or recovery) is waiting out a backoff.
    RetryBackoff,
    /// The topic-partition stopped after an unrecoverable error.
    Fatal,
}

enum Phase {
    Recovering { retry: Option<RetryState> },
    Running,
    Fatal { reason: String },
}

/// Where a pending file is in its seal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SealStage {
    /// Open for appends.
    Writing,
    /// Synced and closed.
    Closed,
    /// `BeginTemp` logged.
    Begun,
    /// `AppendCommitted` logged at `seq`.
    Logged { seq: u64, rename_attempted: bool },
}

struct PendingFile {
    file_id: FileId,
    temp_path: PathBuf,
    writer: Option<Box<dyn RecordWriter>>,
    /// Records appended so far, kept for replay until sealed.
    records: Vec<SinkRecord>,
    bytes_written: u64,
    opened_at_us: u64,
    schema_version: Option<u32>,
    stage: SealStage,
    /// Set after a failed append or close.
    needs_rewrite: bool,
}

impl PendingFile {
    fn range(&self) -> Option<(Offset, Offset)> {
        Some((self.records.first()?.offset, self.records.last()?.offset))
    }
}

#[derive(Default)]
struct Lane {
    buffer: VecDeque<SinkRecord>,
    pending: Option<PendingFile>,
    retry: Option<RetryState>,
}

impl Lane {
    /// First offset of this lane not yet committed.
    fn low(&self) -> Option<Offset> {
        self.pending
            .as_ref()
            .and_then(|p| p.records.first())
            .or_else(|| self.buffer.front())
            .map(|r| r.offset)
    }

    fn logged_seq(&self) -> Option<u64> {
        match self.pending.as_ref()?.stage {
            SealStage::Logged { seq, .. } => Some(seq),
            _ => None,
        }
    }

    fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.pending.is_none() && self.retry.is_none()
    }
}

/// Writes one topic-partition's records into committed files.
pub struct TopicPartitionWriter<S: Storage> {
    tp: TopicPartition,
    storage: Arc<S>,
    ctx: Arc<WriterContext>,
    session: u64,
    next_file_id: FileId,
    wal: Option<CommitLog<S>>,
    phase: Phase,
    lanes: BTreeMap<String, Lane>,
    /// Records received before recovery finished.
    unrecovered: Vec<SinkRecord>,
    /// Highest offset accepted or dropped as already committed.
    high_offset: Option<Offset>,
    watermark: Option<Offset>,
    /// Highest committed end offset per encoded partition.
    committed_ends: BTreeMap<String, Offset>,
    known_partitions: BTreeSet<String>,
    new_partitions: Vec<NewPartition>,
}

impl<S: Storage + 'static> TopicPartitionWriter<S> {
    /// Creates a writer in the `Recovering` state.
    ///
    /// `session` distinguishes this writer's temp files from those of any
    /// earlier instance.
    #[must_use]
    pub fn new(tp: TopicPartition, storage: Arc<S>, ctx: Arc<WriterContext>, session: u64) -> Self {
        Self {
            tp,
            storage,
            ctx,
            session,
            next_file_id: FileId::new(0),
            wal: None,
            phase: Phase::Recovering { retry: None },
            lanes: BTreeMap::new(),
            unrecovered: Vec::new(),
            high_offset: None,
            watermark: None,
            committed_ends: BTreeMap::new(),
            known_partitions: BTreeSet::new(),
            new_partitions: Vec::new(),
        }
    }

    // ---- Accessors ----

    /// Returns the topic-partition.
    #[must_use]
    pub const fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    /// Returns the session id embedded in temp file names.
    #[must_use]
    pub const fn session(&self) -> u64 {
        self.session
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> WriterState {
        match &self.phase {
            Phase::Fatal { .. } => WriterState::Fatal,
            Phase::Recovering { .. } => WriterState::Recovering,
            Phase::Running if self.lanes.values().any(|l| l.retry.is_some()) => {
                WriterState::RetryBackoff
            }
            Phase::Running => WriterState::Active,
        }
    }

    /// Returns why the writer is fatal.
    #[must_use]
    pub fn fatal_reason(&self) -> Option<&str> {
        match &self.phase {
            Phase::Fatal { reason } => Some(reason),
            _ => None,
        }
    }

    /// Returns the highest offset such that every accepted offset at or
    /// below it is committed.
    #[must_use]
    pub const fn watermark(&self) -> Option<Offset> {
        self.watermark
    }

    /// Returns the next offset upstream should deliver.
    #[must_use]
    pub fn next_offset(&self) -> Option<Offset> {
        self.watermark.map(Offset::next)
    }

    /// Returns the current temp file of each lane with a pending file.
    #[must_use]
    pub fn temp_file_paths(&self) -> BTreeMap<String, PathBuf> {
        self.lanes
            .iter()
            .filter_map(|(encoded, lane)| {
                let pending = lane.pending.as_ref()?;
                Some((encoded.clone(), pending.temp_path.clone()))
            })
            .collect()
    }

    /// Returns the number of records in the pending file of `encoded`.
    #[must_use]
    pub fn pending_record_count(&self, encoded: &str) -> usize {
        self.lanes
            .get(encoded)
            .and_then(|l| l.pending.as_ref())
            .map_or(0, |p| p.records.len())
    }

    /// Returns the number of accepted records not yet in any file.
    #[must_use]
    pub fn buffered_record_count(&self) -> usize {
        self.unrecovered.len() + self.lanes.values().map(|l| l.buffer.len()).sum::<usize>()
    }

    /// Returns the earliest time a backed-off operation may be retried.
    #[must_use]
    pub fn retry_not_before(&self) -> Option<u64> {
        let recovery = match &self.phase {
            Phase::Recovering { retry } => retry.map(|r| r.retry_not_before_us),
            _ => None,
        };
        self.lanes
            .values()
            .filter_map(|l| l.retry.map(|r| r.retry_not_before_us))
            .chain(recovery)
            .min()
    }

    /// Returns how long until the earliest retry, if one is pending.
    #[must_use]
    pub fn retry_pause(&self, now_us: u64) -> Option<Duration> {
        self.retry_not_before()
            .map(|at| Duration::from_micros(at.saturating_sub(now_us)))
    }

    /// Returns the retry state of `encoded`.
    #[must_use]
    pub fn lane_retry(&self, encoded: &str) -> Option<RetryState> {
        self.lanes.get(encoded).and_then(|l| l.retry)
    }

    /// Returns the encoded partitions with buffered, pending or failed work.
    #[must_use]
    pub fn encoded_partitions(&self) -> Vec<String> {
        self.lanes.keys().cloned().collect()
    }

    /// Takes the new-partition notifications produced so far.
    pub fn drain_new_partitions(&mut self) -> Vec<NewPartition> {
        std::mem::take(&mut self.new_partitions)
    }

    /// Puts back notifications the listener failed to take.
    pub fn requeue_new_partitions(&mut self, mut partitions: Vec<NewPartition>) {
        partitions.append(&mut self.new_partitions);
        self.new_partitions = partitions;
    }

    fn fatal_error(&self) -> SinkError {
        SinkError::WriterFatal {
            topic_partition: self.tp.to_string(),
            reason: self.fatal_reason().unwrap_or_default().to_string(),
        }
    }

    fn enter_fatal(&mut self, err: &SinkError) {
        error!(
            tp = %self.tp,
            error = %err,
            dropped = self.buffered_record_count(),
            "Topic-partition writer is fatal"
        );
        self.lanes.clear();
        self.unrecovered.clear();
        self.phase = Phase::Fatal {
            reason: err.to_string(),
        };
    }

    // ---- Recovery ----

    /// Runs recovery if it has not completed yet.
    ///
    /// A transient failure keeps the writer `Recovering` and schedules a
    /// retry after the backoff.
    ///
    /// # Errors
    /// Returns the inconsistency if recovery finds one (the writer is then
    /// fatal), or `WriterFatal` if it already was.
    pub async fn recover(&mut self, now_us: u64) -> SinkResult<()> {
        let previous = match &self.phase {
            Phase::Running => return Ok(()),
            Phase::Fatal { .. } => return Err(self.fatal_error()),
            Phase::Recovering { retry } => *retry,
        };

        match self.try_recover().await {
            Ok(plan) => {
                self.apply_recovered(&plan);
                Ok(())
            }
            Err(e) => match e.failure_kind() {
                Some(kind) => {
                    let retry = RetryState::record_failure(
                        previous,
                        kind,
                        now_us,
                        self.ctx.config.retry_backoff_us(),
                    );
                    warn!(
                        tp = %self.tp,
                        kind = %kind,
                        failures = retry.consecutive_failures,
                        retry_at_us = retry.retry_not_before_us,
                        error = %e,
                        "Recovery failed, backing off"
                    );
                    self.phase = Phase::Recovering { retry: Some(retry) };
                    Ok(())
                }
                None => {
                    self.enter_fatal(&e);
                    Err(e)
                }
            },
        }
    }

    async fn try_recover(&mut self) -> SinkResult<RecoveryPlan> {
        let naming = &self.ctx.naming;
        if self.wal.is_none() {
            let path = naming.wal_path(&self.tp);
            let config =
                CommitLogConfig::default().with_compaction_bytes(self.ctx.config.wal_compaction_bytes);
            let wal = CommitLog::open(self.storage.clone(), &path, config)
                .await
                .map_err(|e| SinkError::from_wal(&self.tp, FailureKind::Recovery, &path, e))?;
            self.wal = Some(wal);
        }
        let Some(wal) = self.wal.as_mut() else {
            return Err(SinkError::fatal(&self.tp, "commit log unavailable"));
        };

        let mut listing = Vec::new();
        for dir in [
            naming.topic_dir(&self.tp.topic),
            naming.temp_topic_dir(&self.tp.topic),
        ] {
            let files = self
                .storage
                .list_files_recursive(&dir)
                .await
                .map_err(|e| SinkError::transient(FailureKind::List, &dir, e))?;
            listing.extend(files);
        }

        let logged_watermark = match wal.last_seq() {
            None => LoggedWatermark::Empty,
            Some(_) => LoggedWatermark::Recorded(wal.recorded_watermark()),
        };
        let plan = recovery::reconcile(naming, &self.tp, wal.read_all(), logged_watermark, &listing)?;

        for rename in &plan.renames {
            let rename_err = |e| SinkError::transient(FailureKind::Rename, &rename.to, e);
            if let Some(parent) = rename.to.parent() {
                self.storage.create_dir_all(parent).await.map_err(rename_err)?;
            }
            self.storage
                .rename(&rename.from, &rename.to)
                .await
                .map_err(rename_err)?;
            info!(
                tp = %self.tp,
                from = %rename.from.display(),
                to = %rename.to.display(),
                "Completed interrupted commit"
            );
        }
        for path in &plan.discards {
            self.storage
                .remove(path)
                .await
                .map_err(|e| SinkError::transient(FailureKind::Delete, path, e))?;
            debug!(tp = %self.tp, path = %path.display(), "Removed stale temp file");
        }

        let wal_path = wal.path().to_path_buf();
        wal.reset(plan.watermark)
            .await
            .map_err(|e| SinkError::from_wal(&self.tp, FailureKind::Recovery, &wal_path, e))?;
        Ok(plan)
    }

    fn apply_recovered(&mut self, plan: &RecoveryPlan) {
        self.watermark = self.watermark.max(plan.watermark);
        self.high_offset = self.high_offset.max(self.watermark);
        for (encoded, end) in &plan.lane_ends {
            let slot = self.committed_ends.entry(encoded.clone()).or_insert(*end);
            *slot = (*slot).max(*end);
        }
        self.known_partitions
            .extend(plan.committed.iter().map(|f| f.encoded_partition.clone()));
        self.phase = Phase::Running;

        info!(
            tp = %self.tp,
            watermark = ?self.watermark.map(Offset::get),
            committed_files = plan.committed.len(),
            renamed = plan.renames.len(),
            discarded = plan.discards.len(),
            "Recovery complete"
        );

        for record in std::mem::take(&mut self.unrecovered) {
            self.accept(record);
        }
    }

    // ---- Writes ----

    /// Buffers `records` and drives every lane.
    ///
    /// Records at or below an offset already accepted or committed are
    /// dropped.
    ///
    /// # Errors
    /// Returns `WriterFatal` if the writer is (or becomes) fatal.
    pub async fn write(&mut self, records: Vec<SinkRecord>, now_us: u64) -> SinkResult<()> {
        match self.phase {
            Phase::Fatal { .. } => return Err(self.fatal_error()),
            Phase::Recovering { .. } => self.unrecovered.extend(records),
            Phase::Running => {
                for record in records {
                    self.accept(record);
                }
            }
        }
        self.tick(now_us).await
    }

    fn accept(&mut self, record: SinkRecord) {
        if !record.belongs_to(&self.tp) {
            warn!(tp = %self.tp, record_tp = %record.topic_partition(), "Dropping misrouted record");
            return;
        }

        let offset = record.offset;
        let encoded = self.ctx.partitioner.encode_partition(&record);
        let duplicate = self.high_offset.is_some_and(|h| offset <= h)
            || self.committed_ends.get(&encoded).is_some_and(|e| offset <= *e);
        self.high_offset = self.high_offset.max(Some(offset));

        if duplicate {
            debug!(tp = %self.tp, offset = offset.get(), "Dropping already accepted record");
            return;
        }
        self.lanes.entry(encoded).or_default().buffer.push_back(record);
    }

    /// Drives every lane whose backoff (if any) has expired.
    ///
    /// Runs or retries recovery first while the writer is `Recovering`.
    ///
    /// # Errors
    /// Returns `WriterFatal` if the writer is (or becomes) fatal.
    pub async fn tick(&mut self, now_us: u64) -> SinkResult<()> {
        match &self.phase {
            Phase::Fatal { .. } => return Err(self.fatal_error()),
            Phase::Recovering { retry } => {
                if retry.is_some_and(|r| !r.is_ready(now_us)) {
                    return Ok(());
                }
                if self.recover(now_us).await.is_err() {
                    return Err(self.fatal_error());
                }
                if !matches!(self.phase, Phase::Running) {
                    return Ok(());
                }
            }
            Phase::Running => {}
        }

        let encoded: Vec<String> = self.lanes.keys().cloned().collect();
        for key in encoded {
            if self.lanes.get(&key).and_then(|l| l.retry).is_some_and(|r| !r.is_ready(now_us)) {
                continue;
            }
            let Some(mut lane) = self.lanes.remove(&key) else {
                continue;
            };

            let result = self.drive_lane(&key, &mut lane, now_us, false).await;
            let outcome = self.settle(&key, &mut lane, result, now_us);
            if !lane.is_idle() {
                self.lanes.insert(key, lane);
            }
            if let Err(e) = outcome {
                self.enter_fatal(&e);
                return Err(self.fatal_error());
            }
        }
        Ok(())
    }

    /// Records the outcome of driving a lane. Only fatal errors pass through.
    fn settle(
        &self,
        encoded: &str,
        lane: &mut Lane,
        result: SinkResult<()>,
        now_us: u64,
    ) -> SinkResult<()> {
        let err = match result {
            Ok(()) => {
                lane.retry = None;
                return Ok(());
            }
            Err(e) => e,
        };
        let Some(kind) = err.failure_kind() else {
            return Err(err);
        };

        let retry = RetryState::record_failure(
            lane.retry,
            kind,
            now_us,
            self.ctx.config.retry_backoff_us(),
        );
        warn!(
            tp = %self.tp,
            encoded,
            kind = %kind,
            failures = retry.consecutive_failures,
            retry_at_us = retry.retry_not_before_us,
            error = %err,
            "Storage operation failed, backing off"
        );
        lane.retry = Some(retry);
        Ok(())
    }

    /// Appends buffered records and seals files until the lane is drained
    /// or a step fails.
    ///
    /// With `graceful`, the pending file is sealed once the buffer is empty.
    async fn drive_lane(
        &mut self,
        encoded: &str,
        lane: &mut Lane,
        now_us: u64,
        graceful: bool,
    ) -> SinkResult<()> {
        loop {
            let (sealing, needs_rewrite) = lane
                .pending
                .as_ref()
                .map_or((false, false), |p| (p.stage != SealStage::Writing, p.needs_rewrite));
            if sealing {
                self.seal(encoded, lane, now_us).await?;
                continue;
            }
            if needs_rewrite {
                self.rewrite(encoded, lane).await?;
            }
            if self.rotation_due(encoded, lane, now_us, graceful) {
                self.seal(encoded, lane, now_us).await?;
                continue;
            }

            let Some(schema_version) = lane.buffer.front().map(|r| r.schema_version) else {
                break;
            };
            if lane.pending.is_none() {
                self.open_pending(encoded, lane, schema_version, now_us).await?;
            }
            Self::append_front(lane).await?;
        }

        if graceful {
            if let Some(pending) = lane.pending.take_if(|p| p.records.is_empty()) {
                format::discard(self.storage.as_ref(), &pending.temp_path).await;
            }
        }
        Ok(())
    }

    fn rotation_due(&self, encoded: &str, lane: &Lane, now_us: u64, graceful: bool) -> bool {
        let Some(pending) = &lane.pending else {
            return false;
        };
        if pending.records.is_empty() {
            return false;
        }

        let config = &self.ctx.config;
        let age_us = now_us.saturating_sub(pending.opened_at_us);
        let next = lane.buffer.front();

        pending.records.len() as u64 >= config.flush_size
            || config
                .flush_size_bytes
                .is_some_and(|limit| pending.bytes_written >= limit)
            || config.rotate_interval_us().is_some_and(|interval| age_us >= interval)
            || self
                .ctx
                .partitioner
                .ready_to_close(encoded, pending.opened_at_us, now_us)
            || next.is_some_and(|r| r.schema_version != pending.schema_version)
            || (graceful && next.is_none())
    }

    async fn open_writer(
        &mut self,
        encoded: &str,
    ) -> SinkResult<(FileId, PathBuf, Box<dyn RecordWriter>)> {
        let file_id = self.next_file_id;
        self.next_file_id = file_id.next();
        let temp_path = self
            .ctx
            .naming
            .temp_path(&self.tp, encoded, self.session, file_id);

        if let Some(parent) = temp_path.parent() {
            self.storage
                .create_dir_all(parent)
                .await
                .map_err(|e| SinkError::transient(FailureKind::Open, parent, e))?;
        }
        let writer = self
            .ctx
            .format
            .open(self.storage.as_ref(), &temp_path)
            .await?;
        Ok((file_id, temp_path, writer))
    }

    async fn open_pending(
        &mut self,
        encoded: &str,
        lane: &mut Lane,
        schema_version: Option<u32>,
        now_us: u64,
    ) -> SinkResult<()> {
        let (file_id, temp_path, writer) = self.open_writer(encoded).await?;
        debug!(tp = %self.tp, encoded, path = %temp_path.display(), "Opened temp file");
        lane.pending = Some(PendingFile {
            file_id,
            temp_path,
            writer: Some(writer),
            records: Vec::new(),
            bytes_written: 0,
            opened_at_us: now_us,
            schema_version,
            stage: SealStage::Writing,
            needs_rewrite: false,
        });
        Ok(())
    }

    async fn append_front(lane: &mut Lane) -> SinkResult<()> {
        let (Some(pending), Some(record)) = (lane.pending.as_mut(), lane.buffer.front()) else {
            return Ok(());
        };
        let Some(writer) = pending.writer.as_mut() else {
            pending.needs_rewrite = true;
            return Ok(());
        };

        if let Err(e) = writer.append(record).await {
            pending.needs_rewrite = true;
            return Err(e);
        }
        pending.bytes_written = writer.bytes_written();
        if let Some(record) = lane.buffer.pop_front() {
            pending.records.push(record);
        }
        Ok(())
    }

    /// Replaces a temp file in unknown state with a fresh copy of its records.
    async fn rewrite(&mut self, encoded: &str, lane: &mut Lane) -> SinkResult<()> {
        let Some(pending) = lane.pending.as_mut() else {
            return Ok(());
        };
        pending.writer = None;
        format::discard(self.storage.as_ref(), &pending.temp_path).await;

        let (file_id, temp_path, mut writer) = self.open_writer(encoded).await?;
        pending.file_id = file_id;
        pending.temp_path = temp_path;

        for record in &pending.records {
            writer.append(record).await?;
        }
        pending.bytes_written = writer.bytes_written();
        pending.writer = Some(writer);
        pending.needs_rewrite = false;

        debug!(
            tp = %self.tp,
            encoded,
            path = %pending.temp_path.display(),
            records = pending.records.len(),
            "Rewrote temp file"
        );
        Ok(())
    }

    // ---- Sealing ----

    async fn seal(&mut self, encoded: &str, lane: &mut Lane, now_us: u64) -> SinkResult<()> {
        loop {
            let next_low = lane.buffer.front().map(|r| r.offset);
            let Some(pending) = lane.pending.as_mut() else {
                return Ok(());
            };
            let Some((start, end)) = pending.range() else {
                return Ok(());
            };
            // Records are appended in offset order.
            assert!(start <= end, "pending file range is inverted");

            match pending.stage {
                SealStage::Writing => {
                    if pending.needs_rewrite {
                        return Ok(());
                    }
                    if let Some(mut writer) = pending.writer.take() {
                        if let Err(e) = writer.close().await {
                            pending.needs_rewrite = true;
                            return Err(e);
                        }
                    }
                    pending.stage = SealStage::Closed;
                }
                SealStage::Closed => {
                    let entry = CommitEntry::BeginTemp {
                        file_id: pending.file_id,
                        temp_path: pending.temp_path.clone(),
                    };
                    self.log(entry).await?;
                    pending.stage = SealStage::Begun;
                }
                SealStage::Begun => {
                    let entry = CommitEntry::AppendCommitted {
                        file_id: pending.file_id,
                        temp_path: pending.temp_path.clone(),
                        committed_path: self.ctx.naming.committed_path(&self.tp, encoded, start, end),
                        start,
                        end,
                        watermark: self.watermark_with(next_low),
                    };
                    let seq = self.log(entry).await?;
                    pending.stage = SealStage::Logged {
                        seq,
                        rename_attempted: false,
                    };
                }
                SealStage::Logged {
                    seq,
                    rename_attempted,
                } => {
                    let committed = self.ctx.naming.committed_path(&self.tp, encoded, start, end);
                    pending.stage = SealStage::Logged {
                        seq,
                        rename_attempted: true,
                    };
                    self.promote(&pending.temp_path, &committed, rename_attempted)
                        .await?;
                    self.finish_commit(encoded, lane, &committed).await;
                    return Ok(());
                }
            }
        }
    }

    async fn log(&mut self, entry: CommitEntry) -> SinkResult<u64> {
        let Some(wal) = self.wal.as_mut() else {
            return Err(SinkError::fatal(&self.tp, "commit log unavailable"));
        };
        match wal.append(entry).await {
            Ok(seq) => Ok(seq),
            Err(e) => {
                let path = wal.path().to_path_buf();
                Err(SinkError::from_wal(&self.tp, FailureKind::WalAppend, &path, e))
            }
        }
    }

    /// Renames the temp file into place.
    ///
    /// A retried rename first checks whether the previous attempt landed.
    ///
    /// # Errors
    /// Returns `FatalConsistency` if a retry finds neither the temp file nor
    /// the committed file: the log committed a file that no longer exists.
    async fn promote(&self, temp: &Path, committed: &Path, retried: bool) -> SinkResult<()> {
        let rename_err = |e| SinkError::transient(FailureKind::Rename, committed, e);
        if retried && !self.storage.exists(temp).await.map_err(rename_err)? {
            if self.storage.exists(committed).await.map_err(rename_err)? {
                return Ok(());
            }
            return Err(SinkError::fatal(
                &self.tp,
                format!(
                    "logged temp file {} disappeared before it was committed as {}",
                    temp.display(),
                    committed.display()
                ),
            ));
        }
        if let Some(parent) = committed.parent() {
            self.storage.create_dir_all(parent).await.map_err(rename_err)?;
        }
        self.storage.rename(temp, committed).await.map_err(rename_err)
    }

    async fn finish_commit(&mut self, encoded: &str, lane: &mut Lane, committed: &Path) {
        let Some(pending) = lane.pending.take() else {
            return;
        };
        let Some((start, end)) = pending.range() else {
            return;
        };

        self.committed_ends.insert(encoded.to_string(), end);
        self.watermark = self.watermark_with(lane.low());
        info!(
            tp = %self.tp,
            encoded,
            start = start.get(),
            end = end.get(),
            records = pending.records.len(),
            path = %committed.display(),
            "Committed file"
        );

        self.truncate_log().await;

        if self.known_partitions.insert(encoded.to_string()) {
            self.new_partitions.push(NewPartition {
                topic: self.tp.topic.clone(),
                encoded_partition: encoded.to_string(),
                directory: self.ctx.naming.partition_dir(&self.tp.topic, encoded),
            });
        }
    }

    /// Drops log entries no lane still depends on. Failure is harmless:
    /// recovery treats an entry whose file is already committed as done.
    async fn truncate_log(&mut self) {
        let oldest_needed = self.lanes.values().filter_map(Lane::logged_seq).min();
        let watermark = self.watermark;
        let Some(wal) = self.wal.as_mut() else {
            return;
        };
        let up_to = match oldest_needed {
            Some(seq) => seq.checked_sub(1),
            None => wal.last_seq(),
        };
        let Some(up_to) = up_to.filter(|s| *s > 0) else {
            return;
        };
        if let Err(e) = wal.truncate(up_to, watermark).await {
            warn!(tp = %self.tp, up_to, error = %e, "Failed to truncate commit log");
        }
    }

    /// Computes the watermark with `extra_low` as the first uncommitted
    /// offset of the lane currently detached from `lanes`.
    fn watermark_with(&self, extra_low: Option<Offset>) -> Option<Offset> {
        let low = self
            .lanes
            .values()
            .filter_map(Lane::low)
            .chain(extra_low)
            .min();
        let candidate = match low {
            Some(low) => low.prev(),
            None => self.high_offset,
        };
        self.watermark.max(candidate)
    }

    // ---- Shutdown ----

    /// Flushes and seals every lane, attempting each step once regardless of
    /// backoff.
    ///
    /// Lanes that fail keep their records out of the watermark.
    ///
    /// # Errors
    /// Returns `WriterFatal` if the writer is (or becomes) fatal.
    pub async fn close(&mut self, now_us: u64) -> SinkResult<()> {
        match &self.phase {
            Phase::Fatal { .. } => return Err(self.fatal_error()),
            Phase::Recovering { .. } => {
                if self.recover(now_us).await.is_err() {
                    return Err(self.fatal_error());
                }
                if !matches!(self.phase, Phase::Running) {
                    warn!(tp = %self.tp, "Closing before recovery completed");
                    return Ok(());
                }
            }
            Phase::Running => {}
        }

        let encoded: Vec<String> = self.lanes.keys().cloned().collect();
        for key in encoded {
            let Some(mut lane) = self.lanes.remove(&key) else {
                continue;
            };
            let result = self.drive_lane(&key, &mut lane, now_us, true).await;
            let outcome = self.settle(&key, &mut lane, result, now_us);
            if !lane.is_idle() {
                self.lanes.insert(key, lane);
            }
            if let Err(e) = outcome {
                self.enter_fatal(&e);
                return Err(self.fatal_error());
            }
        }

        info!(
            tp = %self.tp,
            watermark = ?self.watermark.map(Offset::get),
            unflushed = self.buffered_record_count(),
            "Closed topic-partition writer"
        );
        Ok(())
    }

    /// Abandons every buffer and open file without touching storage.
    pub fn stop(self) {
        debug!(
            tp = %self.tp,
            abandoned = self.buffered_record_count(),
            "Stopped topic-partition writer"
        );
    }
}
