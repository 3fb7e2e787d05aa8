//! Writer orchestrator.
//!
//! [`SinkWriter`] owns one [`TopicPartitionWriter`] per assigned
//! topic-partition, routes each incoming batch to them and drives them
//! concurrently. It is also the only place that talks to the
//! [`PartitionListener`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use helix_core::{Offset, SinkRecord, TopicPartition};
use helix_wal::Storage;
use tracing::{info, warn};

use crate::catalog::{NewPartition, NoopPartitionListener, PartitionListener};
use crate::config::SinkConfig;
use crate::error::SinkResult;
use crate::format::{create_format, RecordFormat};
use crate::naming::FileNaming;
use crate::partitioner::{create_partitioner, Partitioner};
use crate::writer::{TopicPartitionWriter, WriterContext, WriterState};

/// What the caller needs to know after a `write` or `tick`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// How long until the earliest pending retry, if any.
    pub pause: Option<Duration>,
    /// Time of the earliest pending retry.
    pub retry_not_before_us: Option<u64>,
    /// Topic-partitions whose writer is fatal.
    pub fatal: Vec<TopicPartition>,
    /// Records dropped because their topic-partition is not assigned.
    pub unassigned_records: usize,
}

/// Writes records of every assigned topic-partition.
pub struct SinkWriter<S: Storage> {
    storage: Arc<S>,
    ctx: Arc<WriterContext>,
    listener: Arc<dyn PartitionListener>,
    writers: BTreeMap<TopicPartition, TopicPartitionWriter<S>>,
}

impl<S: Storage + 'static> SinkWriter<S> {
    /// Creates an orchestrator with the format and partitioner named in
    /// `config`.
    ///
    /// # Errors
    /// Returns `Configuration` if `config` is invalid.
    pub fn new(config: SinkConfig, storage: Arc<S>) -> SinkResult<Self> {
        let format = create_format(config.format);
        let partitioner = create_partitioner(&config.partitioner);
        let ctx = WriterContext::new(config, format, partitioner)?;
        info!(
            topics_dir = %ctx.config.topics_dir.display(),
            logs_dir = %ctx.config.logs_dir.display(),
            flush_size = ctx.config.flush_size,
            "Sink writer created"
        );
        Ok(Self {
            storage,
            ctx: Arc::new(ctx),
            listener: Arc::new(NoopPartitionListener),
            writers: BTreeMap::new(),
        })
    }

    /// Replaces the partitioner. Applies to topic-partitions assigned later.
    #[must_use]
    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.ctx = Arc::new(self.ctx.with_partitioner(partitioner));
        self
    }

    /// Replaces the format. Applies to topic-partitions assigned later.
    #[must_use]
    pub fn with_format(mut self, format: Arc<dyn RecordFormat>) -> Self {
        self.ctx = Arc::new(self.ctx.with_format(format));
        self
    }

    /// Sets the listener told about new partition directories.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn PartitionListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SinkConfig {
        &self.ctx.config
    }

    /// Returns the path scheme of every file the sink writes.
    #[must_use]
    pub fn naming(&self) -> &FileNaming {
        &self.ctx.naming
    }

    /// Returns the writer of `tp`, if assigned.
    #[must_use]
    pub fn writer(&self, tp: &TopicPartition) -> Option<&TopicPartitionWriter<S>> {
        self.writers.get(tp)
    }

    /// Returns the assigned topic-partitions.
    #[must_use]
    pub fn assigned(&self) -> Vec<TopicPartition> {
        self.writers.keys().cloned().collect()
    }

    /// Takes ownership of `tps` and recovers each of them.
    ///
    /// Already assigned topic-partitions are left alone.
    pub async fn assign(&mut self, tps: impl IntoIterator<Item = TopicPartition>, now_us: u64) {
        let mut added = Vec::new();
        for tp in tps {
            if self.writers.contains_key(&tp) {
                continue;
            }
            let writer = TopicPartitionWriter::new(
                tp.clone(),
                self.storage.clone(),
                self.ctx.clone(),
                rand::random(),
            );
            info!(tp = %tp, session = format_args!("{:016x}", writer.session()), "Assigned topic-partition");
            self.writers.insert(tp.clone(), writer);
            added.push(tp);
        }

        let recoveries = self
            .writers
            .iter_mut()
            .filter(|(tp, _)| added.contains(*tp))
            .map(|(_, writer)| writer.recover(now_us));
        // Fatal writers log their own failure and surface in the next summary.
        join_all(recoveries).await;
    }

    /// Closes and drops the writers of `tps`.
    pub async fn revoke(&mut self, tps: impl IntoIterator<Item = TopicPartition>, now_us: u64) {
        let mut revoked: Vec<_> = tps
            .into_iter()
            .filter_map(|tp| self.writers.remove(&tp))
            .collect();
        self.close_writers(&mut revoked, now_us).await;
        for writer in &revoked {
            info!(
                tp = %writer.topic_partition(),
                watermark = ?writer.watermark().map(Offset::get),
                "Revoked topic-partition"
            );
        }
    }

    /// Routes `batch` to its topic-partitions and drives every writer.
    pub async fn write(&mut self, batch: Vec<SinkRecord>, now_us: u64) -> WriteSummary {
        let mut groups: BTreeMap<TopicPartition, Vec<SinkRecord>> = BTreeMap::new();
        let mut unassigned_records = 0;
        for record in batch {
            let tp = record.topic_partition();
            if self.writers.contains_key(&tp) {
                groups.entry(tp).or_default().push(record);
            } else {
                unassigned_records += 1;
            }
        }
        if unassigned_records > 0 {
            warn!(records = unassigned_records, "Dropping records of unassigned topic-partitions");
        }

        let writes = self.writers.iter_mut().map(|(tp, writer)| {
            let records = groups.remove(tp).unwrap_or_default();
            writer.write(records, now_us)
        });
        // Failures are reflected in writer state below.
        join_all(writes).await;

        self.notify_listener().await;
        self.summary(now_us, unassigned_records)
    }

    /// Drives every writer without new records.
    pub async fn tick(&mut self, now_us: u64) -> WriteSummary {
        self.write(Vec::new(), now_us).await
    }

    /// Returns the watermark of every topic-partition that has one.
    #[must_use]
    pub fn committed_offsets(&self) -> BTreeMap<TopicPartition, Offset> {
        self.writers
            .iter()
            .filter_map(|(tp, w)| Some((tp.clone(), w.watermark()?)))
            .collect()
    }

    /// Returns the offset upstream should resume each topic-partition from.
    #[must_use]
    pub fn next_offsets(&self) -> BTreeMap<TopicPartition, Offset> {
        self.writers
            .iter()
            .filter_map(|(tp, w)| Some((tp.clone(), w.next_offset()?)))
            .collect()
    }

    /// Flushes and closes every writer.
    pub async fn close(&mut self, now_us: u64) {
        let mut writers: Vec<_> = std::mem::take(&mut self.writers).into_values().collect();
        self.close_writers(&mut writers, now_us).await;
        info!(topic_partitions = writers.len(), "Sink writer closed");
    }

    /// Abandons every writer without touching storage.
    pub fn stop(&mut self) {
        for writer in std::mem::take(&mut self.writers).into_values() {
            writer.stop();
        }
    }

    async fn close_writers(&self, writers: &mut [TopicPartitionWriter<S>], now_us: u64) {
        join_all(writers.iter_mut().map(|w| w.close(now_us))).await;
        for writer in writers.iter_mut() {
            let partitions = writer.drain_new_partitions();
            if let Err(undelivered) = deliver(self.listener.as_ref(), partitions).await {
                warn!(
                    tp = %writer.topic_partition(),
                    dropped = undelivered.len(),
                    "Dropping undelivered partition notifications of closed writer"
                );
            }
        }
    }

    async fn notify_listener(&mut self) {
        for writer in self.writers.values_mut() {
            let partitions = writer.drain_new_partitions();
            if let Err(undelivered) = deliver(self.listener.as_ref(), partitions).await {
                writer.requeue_new_partitions(undelivered);
            }
        }
    }

    fn summary(&self, now_us: u64, unassigned_records: usize) -> WriteSummary {
        let retry_not_before_us = self
            .writers
            .values()
            .filter_map(TopicPartitionWriter::retry_not_before)
            .min();
        WriteSummary {
            pause: retry_not_before_us.map(|at| Duration::from_micros(at.saturating_sub(now_us))),
            retry_not_before_us,
            fatal: self
                .writers
                .iter()
                .filter(|(_, w)| w.state() == WriterState::Fatal)
                .map(|(tp, _)| tp.clone())
                .collect(),
            unassigned_records,
        }
    }
}

/// Hands `partitions` to `listener` in order, returning the undelivered
/// remainder on the first failure.
async fn deliver(
    listener: &dyn PartitionListener,
    partitions: Vec<NewPartition>,
) -> Result<(), Vec<NewPartition>> {
    let mut remaining = partitions.into_iter();
    while let Some(partition) = remaining.next() {
        if let Err(e) = listener.partition_created(&partition).await {
            warn!(
                topic = %partition.topic,
                encoded = %partition.encoded_partition,
                error = %e,
                "Partition listener failed, will retry"
            );
            let mut undelivered = vec![partition];
            undelivered.extend(remaining);
            return Err(undelivered);
        }
    }
    Ok(())
}
