//! Property definitions and checkers for sink simulation tests.
//!
//! The central property is exactly-once output: once faults stop and the
//! sink has closed, the committed files of a topic-partition hold every
//! produced record exactly once, with file names that describe their
//! content.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use bytes::Bytes;
use helix_core::{Offset, SinkRecord, TopicPartition};
use helix_sink::naming::CommittedName;
use helix_sink::{BinaryFormat, FileNaming};
use helix_wal::SimulatedStorage;

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of an output property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// An offset appears in more than one committed file.
    DuplicateOffset {
        /// The topic-partition.
        topic_partition: TopicPartition,
        /// The duplicated offset.
        offset: u64,
        /// Every file holding it.
        files: Vec<PathBuf>,
    },
    /// A produced offset covered by the watermark is in no committed file.
    MissingOffset {
        /// The topic-partition.
        topic_partition: TopicPartition,
        /// The missing offset.
        offset: u64,
    },
    /// A committed offset was never produced, or carries other content.
    PhantomRecord {
        /// The topic-partition.
        topic_partition: TopicPartition,
        /// The offset.
        offset: u64,
    },
    /// A file's name disagrees with the offsets inside it.
    RangeMismatch {
        /// The file.
        path: PathBuf,
        /// Range from the file name.
        named: (u64, u64),
        /// First and last offset of the content.
        actual: Option<(u64, u64)>,
    },
    /// Two files of the same encoded partition have overlapping ranges.
    OverlappingRanges {
        /// The earlier file.
        first: PathBuf,
        /// The later file.
        second: PathBuf,
    },
    /// A committed file does not decode.
    Undecodable {
        /// The file.
        path: PathBuf,
        /// Decoder message.
        reason: String,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateOffset {
                topic_partition,
                offset,
                files,
            } => write!(f, "{topic_partition}: offset {offset} committed in {files:?}"),
            Self::MissingOffset {
                topic_partition,
                offset,
            } => write!(f, "{topic_partition}: offset {offset} below watermark is missing"),
            Self::PhantomRecord {
                topic_partition,
                offset,
            } => write!(f, "{topic_partition}: committed offset {offset} was not produced as stored"),
            Self::RangeMismatch {
                path,
                named,
                actual,
            } => write!(
                f,
                "{}: named {named:?} but holds {actual:?}",
                path.display()
            ),
            Self::OverlappingRanges { first, second } => write!(
                f,
                "{} overlaps {}",
                first.display(),
                second.display()
            ),
            Self::Undecodable { path, reason } => {
                write!(f, "{}: {reason}", path.display())
            }
        }
    }
}

// ============================================================================
// Committed Output
// ============================================================================

/// A committed file and its decoded records.
#[derive(Debug, Clone)]
pub struct CommittedFile {
    /// Committed path.
    pub path: PathBuf,
    /// Parsed name.
    pub name: CommittedName,
    /// Decoded records.
    pub records: Vec<SinkRecord>,
}

/// Reads every committed binary file of `tp` from `storage`.
///
/// Files that fail to decode are reported as violations.
#[must_use]
pub fn read_committed(
    storage: &SimulatedStorage,
    naming: &FileNaming,
    tp: &TopicPartition,
) -> (Vec<CommittedFile>, Vec<PropertyViolation>) {
    let mut files = Vec::new();
    let mut violations = Vec::new();

    for path in storage.file_paths() {
        let Some(name) = naming.parse_committed(tp, &path) else {
            continue;
        };
        let content = storage.get_raw_content(&path).unwrap_or_default();
        match BinaryFormat::decode(&tp.topic, tp.partition, &content) {
            Ok(records) => files.push(CommittedFile {
                path,
                name,
                records,
            }),
            Err(e) => violations.push(PropertyViolation::Undecodable {
                path,
                reason: e.to_string(),
            }),
        }
    }
    (files, violations)
}

// ============================================================================
// Property Checker
// ============================================================================

/// Tracks produced records and checks committed output against them.
#[derive(Debug, Default)]
pub struct ExactlyOnceChecker {
    /// Produced values: topic-partition -> offset -> value.
    produced: BTreeMap<TopicPartition, BTreeMap<u64, Bytes>>,
}

impl ExactlyOnceChecker {
    /// Creates an empty checker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records records handed to the sink. Redeliveries are idempotent.
    pub fn record_produced<'a>(&mut self, records: impl IntoIterator<Item = &'a SinkRecord>) {
        for record in records {
            self.produced
                .entry(record.topic_partition())
                .or_default()
                .insert(record.offset.get(), record.value.clone());
        }
    }

    /// Checks the committed files of `tp` against what was produced.
    ///
    /// Every produced offset at or below `watermark` must be committed.
    #[must_use]
    pub fn check(
        &self,
        storage: &SimulatedStorage,
        naming: &FileNaming,
        tp: &TopicPartition,
        watermark: Option<Offset>,
    ) -> Vec<PropertyViolation> {
        let (files, mut violations) = read_committed(storage, naming, tp);
        let produced = self.produced.get(tp);

        let mut holders: BTreeMap<u64, Vec<PathBuf>> = BTreeMap::new();
        for file in &files {
            let actual = file
                .records
                .first()
                .zip(file.records.last())
                .map(|(first, last)| (first.offset.get(), last.offset.get()));
            let named = (file.name.start.get(), file.name.end.get());
            if actual != Some(named) {
                violations.push(PropertyViolation::RangeMismatch {
                    path: file.path.clone(),
                    named,
                    actual,
                });
            }

            for record in &file.records {
                let offset = record.offset.get();
                holders.entry(offset).or_default().push(file.path.clone());
                let matches = produced
                    .and_then(|p| p.get(&offset))
                    .is_some_and(|value| *value == record.value);
                if !matches {
                    violations.push(PropertyViolation::PhantomRecord {
                        topic_partition: tp.clone(),
                        offset,
                    });
                }
            }
        }

        for (offset, files) in &holders {
            if files.len() > 1 {
                violations.push(PropertyViolation::DuplicateOffset {
                    topic_partition: tp.clone(),
                    offset: *offset,
                    files: files.clone(),
                });
            }
        }

        if let (Some(produced), Some(watermark)) = (produced, watermark) {
            let committed: BTreeSet<u64> = holders.keys().copied().collect();
            for offset in produced.keys().filter(|o| **o <= watermark.get()) {
                if !committed.contains(offset) {
                    violations.push(PropertyViolation::MissingOffset {
                        topic_partition: tp.clone(),
                        offset: *offset,
                    });
                }
            }
        }

        violations.extend(check_no_overlap(&files));
        violations
    }

    /// Returns the highest produced offset of `tp`.
    #[must_use]
    pub fn last_produced(&self, tp: &TopicPartition) -> Option<Offset> {
        self.produced
            .get(tp)?
            .keys()
            .next_back()
            .map(|o| Offset::new(*o))
    }
}

/// Checks that ranges within each encoded partition are disjoint.
fn check_no_overlap(files: &[CommittedFile]) -> Vec<PropertyViolation> {
    let mut by_partition: BTreeMap<&str, Vec<&CommittedFile>> = BTreeMap::new();
    for file in files {
        by_partition
            .entry(file.name.encoded_partition.as_str())
            .or_default()
            .push(file);
    }

    let mut violations = Vec::new();
    for files in by_partition.values_mut() {
        files.sort_by_key(|f| f.name.start);
        for pair in files.windows(2) {
            if pair[1].name.start <= pair[0].name.end {
                violations.push(PropertyViolation::OverlappingRanges {
                    first: pair[0].path.clone(),
                    second: pair[1].path.clone(),
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naming() -> FileNaming {
        FileNaming::new("/topics", "/logs", 10, ".bin")
    }

    fn store(storage: &SimulatedStorage, path: &std::path::Path, records: &[SinkRecord]) {
        let mut buf = bytes::BytesMut::new();
        for record in records {
            BinaryFormat::encode(record, &mut buf);
        }
        storage.set_raw_content(path, buf.to_vec());
    }

    #[test]
    fn test_checker_accepts_exact_output() {
        let storage = SimulatedStorage::new(1);
        let tp = TopicPartition::new("orders", 0);
        let records: Vec<_> = (0..4).map(|o| SinkRecord::new("orders", 0, o, "v")).collect();
        let naming = naming();
        store(
            &storage,
            &naming.committed_path(&tp, "partition=0", Offset::new(0), Offset::new(3)),
            &records,
        );

        let mut checker = ExactlyOnceChecker::new();
        checker.record_produced(&records);
        assert!(checker.check(&storage, &naming, &tp, Some(Offset::new(3))).is_empty());
        assert_eq!(checker.last_produced(&tp), Some(Offset::new(3)));
    }

    #[test]
    fn test_checker_reports_duplicates_and_gaps() {
        let storage = SimulatedStorage::new(1);
        let tp = TopicPartition::new("orders", 0);
        let records: Vec<_> = (0..4).map(|o| SinkRecord::new("orders", 0, o, "v")).collect();
        let naming = naming();
        store(
            &storage,
            &naming.committed_path(&tp, "partition=0", Offset::new(0), Offset::new(1)),
            &records[0..2],
        );
        store(
            &storage,
            &naming.committed_path(&tp, "partition=0", Offset::new(1), Offset::new(1)),
            &records[1..2],
        );

        let mut checker = ExactlyOnceChecker::new();
        checker.record_produced(&records);
        let violations = checker.check(&storage, &naming, &tp, Some(Offset::new(3)));

        assert!(violations
            .iter()
            .any(|v| matches!(v, PropertyViolation::DuplicateOffset { offset: 1, .. })));
        assert!(violations
            .iter()
            .any(|v| matches!(v, PropertyViolation::MissingOffset { offset: 2, .. })));
        assert!(violations
            .iter()
            .any(|v| matches!(v, PropertyViolation::OverlappingRanges { .. })));
    }
}
