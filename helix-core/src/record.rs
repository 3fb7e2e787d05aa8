//! Records delivered to the sink.
//!
//! A [`SinkRecord`] is identified by (topic, partition, offset). Offsets grow
//! within a partition but need not be contiguous: compacted sources leave
//! gaps.

use std::fmt;

use bytes::Bytes;

use crate::{PartitionId, TopicPartition};

/// Position of a record in its source partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(u64);

impl Offset {
    /// Wraps a raw offset.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw offset.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the offset after this one, saturating at `u64::MAX`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the offset before this one, or `None` at zero.
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        if self.0 == 0 {
            None
        } else {
            Some(Self(self.0 - 1))
        }
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Source-assigned creation time in milliseconds since the Unix epoch.
///
/// Negative values mean the source did not set one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// No timestamp.
    pub const NONE: Self = Self(-1);

    /// Wraps milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the raw value, negative when unset.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Returns the milliseconds, or `None` when unset.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // Checked non-negative.
    pub const fn millis(self) -> Option<u64> {
        if self.0 < 0 {
            None
        } else {
            Some(self.0 as u64)
        }
    }

    /// Returns true when unset.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 < 0
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::NONE
    }
}

/// One record from the upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkRecord {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: PartitionId,
    /// Offset in the source partition.
    pub offset: Offset,
    /// Creation time, used by time partitioners.
    pub timestamp: Timestamp,
    /// Key, used by key and field partitioners.
    pub key: Option<Bytes>,
    /// Payload written to output files.
    pub value: Bytes,
    /// Schema version of the value. A change forces the open file to rotate.
    pub schema_version: Option<u32>,
}

impl SinkRecord {
    /// Creates an unkeyed, untimed record.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        partition: impl Into<PartitionId>,
        offset: u64,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition: partition.into(),
            offset: Offset(offset),
            timestamp: Timestamp::NONE,
            key: None,
            value: value.into(),
            schema_version: None,
        }
    }

    /// Sets the key.
    #[must_use]
    pub fn with_key(self, key: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            ..self
        }
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn with_timestamp(self, timestamp: Timestamp) -> Self {
        Self { timestamp, ..self }
    }

    /// Sets the schema version.
    #[must_use]
    pub fn with_schema_version(self, version: u32) -> Self {
        Self {
            schema_version: Some(version),
            ..self
        }
    }

    /// Returns the topic-partition of the record.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.as_str(), self.partition)
    }

    /// Returns true if the record belongs to `tp`.
    #[must_use]
    pub fn belongs_to(&self, tp: &TopicPartition) -> bool {
        self.partition == tp.partition && self.topic == tp.topic
    }
}
