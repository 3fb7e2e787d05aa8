//! Simulated upstream message source.
//!
//! Holds a fixed, seeded record log per topic-partition and delivers it in
//! random-sized batches. After a sink restart the source rewinds each
//! topic-partition to the offset the sink reports as next, the way a
//! consumer resumes from its last acknowledged position.

use std::collections::BTreeMap;

use helix_core::{Offset, SinkRecord, TopicPartition};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Shape of the generated record log.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Topic name.
    pub topic: String,
    /// Number of partitions.
    pub partitions: u32,
    /// Records per partition.
    pub records_per_partition: u64,
    /// Distinct keys; records cycle through them at random. Zero means no key.
    pub key_count: u32,
    /// Largest batch taken from one partition per delivery.
    pub max_batch: u64,
    /// Chance that offsets skip ahead (compacted upstream).
    pub gap_probability: f64,
}

impl UpstreamConfig {
    /// Creates a config for `partitions` partitions of `records_per_partition`.
    #[must_use]
    pub fn new(topic: impl Into<String>, partitions: u32, records_per_partition: u64) -> Self {
        Self {
            topic: topic.into(),
            partitions,
            records_per_partition,
            key_count: 0,
            max_batch: 5,
            gap_probability: 0.0,
        }
    }

    /// Sets the number of distinct keys.
    #[must_use]
    pub const fn with_keys(mut self, key_count: u32) -> Self {
        self.key_count = key_count;
        self
    }

    /// Sets the largest batch per partition.
    #[must_use]
    pub const fn with_max_batch(mut self, max_batch: u64) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Sets the chance of an offset gap.
    #[must_use]
    pub const fn with_gaps(mut self, probability: f64) -> Self {
        self.gap_probability = probability;
        self
    }
}

/// A deterministic, rewindable record source.
pub struct Upstream {
    config: UpstreamConfig,
    rng: StdRng,
    log: BTreeMap<TopicPartition, Vec<SinkRecord>>,
    /// Index into `log` of the next record to deliver.
    cursor: BTreeMap<TopicPartition, usize>,
}

impl Upstream {
    /// Generates the record log for `seed`.
    #[must_use]
    pub fn new(seed: u64, config: UpstreamConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut log = BTreeMap::new();

        for partition in 0..config.partitions {
            let tp = TopicPartition::new(config.topic.clone(), partition);
            let mut offset = 0u64;
            let mut records = Vec::new();
            for i in 0..config.records_per_partition {
                if config.gap_probability > 0.0 && rng.gen_bool(config.gap_probability) {
                    offset += rng.gen_range(1..4);
                }
                let value = format!("{tp}-{i}-{:08x}", rng.gen::<u32>());
                let mut record = SinkRecord::new(config.topic.clone(), partition, offset, value);
                if config.key_count > 0 {
                    record = record.with_key(format!("k{}", rng.gen_range(0..config.key_count)));
                }
                records.push(record);
                offset += 1;
            }
            log.insert(tp, records);
        }

        let cursor = log.keys().map(|tp| (tp.clone(), 0)).collect();
        Self {
            config,
            rng,
            log,
            cursor,
        }
    }

    /// Returns every topic-partition of the source.
    #[must_use]
    pub fn topic_partitions(&self) -> Vec<TopicPartition> {
        self.log.keys().cloned().collect()
    }

    /// Returns the full record log of `tp`.
    #[must_use]
    pub fn records(&self, tp: &TopicPartition) -> &[SinkRecord] {
        self.log.get(tp).map_or(&[], Vec::as_slice)
    }

    /// Returns every record of every topic-partition.
    pub fn all_records(&self) -> impl Iterator<Item = &SinkRecord> {
        self.log.values().flatten()
    }

    /// Returns the last offset of `tp`.
    #[must_use]
    pub fn last_offset(&self, tp: &TopicPartition) -> Option<Offset> {
        self.log.get(tp)?.last().map(|r| r.offset)
    }

    /// Returns true once every record has been delivered.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.log
            .iter()
            .all(|(tp, records)| self.cursor.get(tp).copied().unwrap_or(0) >= records.len())
    }

    /// Takes a random-sized batch from each topic-partition.
    pub fn next_batch(&mut self) -> Vec<SinkRecord> {
        let mut batch = Vec::new();
        for (tp, records) in &self.log {
            let Some(cursor) = self.cursor.get_mut(tp) else {
                continue;
            };
            let take = self.rng.gen_range(0..=self.config.max_batch);
            #[allow(clippy::cast_possible_truncation)] // Batch sizes are small.
            let end = (*cursor + take as usize).min(records.len());
            batch.extend_from_slice(&records[*cursor..end]);
            *cursor = end;
        }
        batch
    }

    /// Takes everything not yet delivered.
    pub fn remaining(&mut self) -> Vec<SinkRecord> {
        let mut batch = Vec::new();
        for (tp, records) in &self.log {
            if let Some(cursor) = self.cursor.get_mut(tp) {
                batch.extend_from_slice(&records[*cursor..]);
                *cursor = records.len();
            }
        }
        batch
    }

    /// Resumes each topic-partition from `next_offsets`, or from the start
    /// when the sink reports nothing for it.
    pub fn rewind(&mut self, next_offsets: &BTreeMap<TopicPartition, Offset>) {
        for (tp, records) in &self.log {
            let next = next_offsets.get(tp).copied().unwrap_or_default();
            let index = records.partition_point(|r| r.offset < next);
            self.cursor.insert(tp.clone(), index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_is_deterministic() {
        let config = UpstreamConfig::new("orders", 2, 20).with_keys(3).with_gaps(0.2);
        let mut a = Upstream::new(7, config.clone());
        let mut b = Upstream::new(7, config);
        assert_eq!(a.next_batch(), b.next_batch());
        assert_eq!(a.remaining(), b.remaining());
        assert!(a.is_drained());
    }

    #[test]
    fn test_upstream_rewind_redelivers() {
        let config = UpstreamConfig::new("orders", 1, 10);
        let mut upstream = Upstream::new(1, config);
        let tp = TopicPartition::new("orders", 0);
        let all = upstream.remaining();
        assert_eq!(all.len(), 10);

        upstream.rewind(&BTreeMap::from([(tp.clone(), Offset::new(6))]));
        let again = upstream.remaining();
        assert_eq!(again.first().map(|r| r.offset), Some(Offset::new(6)));
        assert_eq!(again.len(), 4);
        assert_eq!(upstream.last_offset(&tp), Some(Offset::new(9)));
    }
}
