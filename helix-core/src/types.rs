//! Identifiers for topic-partitions and the files written for them.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Partition number within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Wraps a partition number.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the partition number.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl FromStr for PartitionId {
    type Err = ParseIntError;

    /// Parses the decimal form used in file and directory names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number of a temp file within one writer session.
///
/// Together with the session id it makes every temp path unique.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileId(u64);

impl FileId {
    /// Wraps a raw file sequence number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw sequence number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the id of the file opened after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        // A session never opens 2^64 files.
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({:#x})", self.0)
    }
}

/// A (topic, partition) pair: the unit of ordering and of writer ownership.
///
/// Topic names follow Kafka rules (`[a-zA-Z0-9._-]`), so they never contain
/// the `+` separator used in file names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    /// Topic name.
    pub topic: String,
    /// Partition within the topic.
    pub partition: PartitionId,
}

impl TopicPartition {
    /// Creates a topic-partition.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: impl Into<PartitionId>) -> Self {
        Self {
            topic: topic.into(),
            partition: partition.into(),
        }
    }

    /// Returns true if `topic` is a legal topic name.
    #[must_use]
    pub fn is_valid_topic(topic: &str) -> bool {
        !matches!(topic, "" | "." | "..")
            && topic
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_id_parses_decimal_only() {
        assert_eq!("17".parse::<PartitionId>().unwrap(), PartitionId::new(17));
        assert!("x".parse::<PartitionId>().is_err());
        assert!("-1".parse::<PartitionId>().is_err());
        assert_eq!(PartitionId::new(3).to_string(), "3");
    }

    #[test]
    fn test_file_id_sequence() {
        let first = FileId::default();
        assert_eq!(first.next().get(), 1);
        assert_eq!(first.next().next(), FileId::new(2));
        assert_eq!(format!("{:?}", FileId::new(255)), "FileId(0xff)");
    }

    #[test]
    fn test_topic_partition_display_and_order() {
        let a = TopicPartition::new("orders", 0);
        let b = TopicPartition::new("orders", 1);
        let c = TopicPartition::new("payments", 0);

        assert_eq!(a.to_string(), "orders-0");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_topic_name_validation() {
        assert!(TopicPartition::is_valid_topic("orders.v2_eu-west"));
        assert!(!TopicPartition::is_valid_topic(""));
        assert!(!TopicPartition::is_valid_topic(".."));
        assert!(!TopicPartition::is_valid_topic("a+b"));
        assert!(!TopicPartition::is_valid_topic("a/b"));
    }
}
