//! Partition functions.
//!
//! A partitioner maps a record to its encoded partition: the directory its
//! file lands in. The mapping must be a pure function of the record.

use std::sync::Arc;

use helix_core::SinkRecord;

use crate::config::PartitionerKind;

/// Maps records to encoded partitions.
pub trait Partitioner: Send + Sync {
    /// Returns the encoded partition of `record`.
    fn encode_partition(&self, record: &SinkRecord) -> String;

    /// Returns true if the open file of `encoded` should be sealed now,
    /// regardless of its size.
    fn ready_to_close(&self, _encoded: &str, _opened_at_us: u64, _now_us: u64) -> bool {
        false
    }
}

/// `partition=<n>`, the source partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPartitioner;

impl Partitioner for DefaultPartitioner {
    fn encode_partition(&self, record: &SinkRecord) -> String {
        format!("partition={}", record.partition.get())
    }
}

/// `<field>=<key>`, the UTF-8 record key.
#[derive(Debug, Clone)]
pub struct KeyPartitioner {
    field: String,
}

impl KeyPartitioner {
    /// Creates a key partitioner naming its directories after `field`.
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Partitioner for KeyPartitioner {
    fn encode_partition(&self, record: &SinkRecord) -> String {
        let value = record.key.as_ref().map_or_else(
            || "null".to_string(),
            |key| sanitize(&String::from_utf8_lossy(key)),
        );
        format!("{}={value}", self.field)
    }
}

/// `bucket=<start ms>`, the record timestamp rounded down to a bucket.
///
/// A bucket closes once the clock passes its end plus the grace period.
#[derive(Debug, Clone, Copy)]
pub struct TimeBucketPartitioner {
    bucket_ms: u64,
    close_grace_ms: u64,
}

impl TimeBucketPartitioner {
    /// Creates a time partitioner.
    #[must_use]
    pub const fn new(bucket_ms: u64, close_grace_ms: u64) -> Self {
        Self {
            bucket_ms,
            close_grace_ms,
        }
    }

    fn bucket_start(&self, millis: u64) -> u64 {
        millis - millis % self.bucket_ms.max(1)
    }
}

impl Partitioner for TimeBucketPartitioner {
    fn encode_partition(&self, record: &SinkRecord) -> String {
        format!("bucket={}", self.bucket_start(record.timestamp.millis().unwrap_or(0)))
    }

    fn ready_to_close(&self, encoded: &str, _opened_at_us: u64, now_us: u64) -> bool {
        let Some(start) = encoded
            .strip_prefix("bucket=")
            .and_then(|s| s.parse::<u64>().ok())
        else {
            return false;
        };
        let close_at_ms = start
            .saturating_add(self.bucket_ms)
            .saturating_add(self.close_grace_ms);
        now_us / 1000 >= close_at_ms
    }
}

/// Builds the partitioner named by the configuration.
#[must_use]
pub fn create_partitioner(kind: &PartitionerKind) -> Arc<dyn Partitioner> {
    match kind {
        PartitionerKind::Default => Arc::new(DefaultPartitioner),
        PartitionerKind::Key { field } => Arc::new(KeyPartitioner::new(field.clone())),
        PartitionerKind::Time {
            bucket_ms,
            close_grace_ms,
        } => Arc::new(TimeBucketPartitioner::new(*bucket_ms, *close_grace_ms)),
    }
}

/// Replaces characters that would change the directory structure.
fn sanitize(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '+') || c.is_control() { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" => "empty".to_string(),
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use helix_core::Timestamp;

    use super::*;

    #[test]
    fn test_default_partitioner() {
        let record = SinkRecord::new("orders", 7, 0, "v");
        assert_eq!(DefaultPartitioner.encode_partition(&record), "partition=7");
        assert!(!DefaultPartitioner.ready_to_close("partition=7", 0, u64::MAX));
    }

    #[test]
    fn test_key_partitioner() {
        let partitioner = KeyPartitioner::new("customer");
        let keyed = SinkRecord::new("orders", 0, 0, "v").with_key("alice");
        let unkeyed = SinkRecord::new("orders", 0, 1, "v");
        let nasty = SinkRecord::new("orders", 0, 2, "v").with_key("../a/b+c");

        assert_eq!(partitioner.encode_partition(&keyed), "customer=alice");
        assert_eq!(partitioner.encode_partition(&unkeyed), "customer=null");
        assert_eq!(partitioner.encode_partition(&nasty), "customer=.._a_b_c");
    }

    #[test]
    fn test_time_bucket_partitioner() {
        let partitioner = TimeBucketPartitioner::new(1000, 500);
        let record = SinkRecord::new("t", 0, 0, "v").with_timestamp(Timestamp::from_millis(2_345));
        let encoded = partitioner.encode_partition(&record);
        assert_eq!(encoded, "bucket=2000");

        // Bucket [2000, 3000) closes at 3500 ms.
        assert!(!partitioner.ready_to_close(&encoded, 0, 3_499_999));
        assert!(partitioner.ready_to_close(&encoded, 0, 3_500_000));
        assert!(!partitioner.ready_to_close("partition=0", 0, u64::MAX));

        let untimed = SinkRecord::new("t", 0, 0, "v");
        assert_eq!(partitioner.encode_partition(&untimed), "bucket=0");
    }

    #[test]
    fn test_create_partitioner() {
        let record = SinkRecord::new("t", 2, 0, "v").with_key("k");
        let kind = PartitionerKind::Key {
            field: "id".to_string(),
        };
        assert_eq!(create_partitioner(&kind).encode_partition(&record), "id=k");
        assert_eq!(
            create_partitioner(&PartitionerKind::Default).encode_partition(&record),
            "partition=2"
        );
    }
}
