//! Crash recovery.
//!
//! [`reconcile`] compares the commit log with what is actually on disk and
//! decides how to repair it. It performs no I/O; the topic-partition writer
//! applies the resulting [`RecoveryPlan`]:
//!
//! 1. A committed entry whose committed file is missing is finished by
//!    renaming its temp file. If the temp file is gone too, the log and the
//!    filesystem disagree and the partition is fatal.
//! 2. A committed entry whose committed file exists needs nothing; its temp
//!    file, if still present, is deleted.
//! 3. Every other temp file belongs to a seal that never committed and is
//!    deleted.
//!
//! The watermark comes from the log: it is the highest end offset among the
//! committed files, capped by the last watermark the log recorded. The cap
//! matters when several encoded partitions interleave: a later file of one
//! encoded partition can be committed while an earlier offset of another is
//! still pending. A log that holds entries but never recorded a watermark
//! therefore means nothing below the committed files is safe to skip. Only a
//! log that was never written falls back to the committed files alone.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use helix_core::{Offset, TopicPartition};
use helix_wal::{CommitEntry, LoggedEntry};

use crate::error::{SinkError, SinkResult};
use crate::naming::FileNaming;

/// What the commit log knows about the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggedWatermark {
    /// The log has never held an entry.
    Empty,
    /// The log holds entries. `None` means no offset was ever fully
    /// committed.
    Recorded(Option<Offset>),
}

/// A committed file found (or restored) by recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedFile {
    /// Committed path.
    pub path: PathBuf,
    /// Encoded partition.
    pub encoded_partition: String,
    /// First offset.
    pub start: Offset,
    /// Last offset (inclusive).
    pub end: Offset,
}

/// A rename that was logged but never happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRename {
    /// Temp path.
    pub from: PathBuf,
    /// Committed path.
    pub to: PathBuf,
}

/// The repairs recovery must apply, and the state it leaves behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// Renames to redo, in log order.
    pub renames: Vec<PendingRename>,
    /// Temp files to delete.
    pub discards: Vec<PathBuf>,
    /// Every committed file once the plan is applied, sorted by path.
    pub committed: Vec<CommittedFile>,
    /// Commit watermark once the plan is applied.
    pub watermark: Option<Offset>,
    /// Highest committed end offset per encoded partition.
    pub lane_ends: BTreeMap<String, Offset>,
}

impl RecoveryPlan {
    /// Returns true if applying the plan touches no file.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.renames.is_empty() && self.discards.is_empty()
    }
}

/// Builds the recovery plan for `tp`.
///
/// `entries` are the live commit log entries, `listing` every file below the
/// topic's committed and temp directories. Files that do not parse as this
/// topic-partition's are ignored.
///
/// # Errors
/// Returns `FatalConsistency` if a committed entry has neither its committed
/// file nor its temp file, or names a path that is not a committed file of
/// `tp`.
pub fn reconcile(
    naming: &FileNaming,
    tp: &TopicPartition,
    entries: &[LoggedEntry],
    logged_watermark: LoggedWatermark,
    listing: &[PathBuf],
) -> SinkResult<RecoveryPlan> {
    let mut committed: BTreeMap<PathBuf, CommittedFile> = BTreeMap::new();
    let mut temps: BTreeSet<PathBuf> = BTreeSet::new();
    for path in listing {
        if let Some(name) = naming.parse_committed(tp, path) {
            committed.insert(
                path.clone(),
                CommittedFile {
                    path: path.clone(),
                    encoded_partition: name.encoded_partition,
                    start: name.start,
                    end: name.end,
                },
            );
        } else if naming.parse_temp(tp, path).is_some() {
            temps.insert(path.clone());
        }
    }

    let mut plan = RecoveryPlan::default();
    for logged in entries {
        let CommitEntry::AppendCommitted {
            temp_path,
            committed_path,
            ..
        } = &logged.entry
        else {
            continue;
        };

        let Some(name) = naming.parse_committed(tp, committed_path) else {
            return Err(SinkError::fatal(
                tp,
                format!(
                    "commit log entry {} names foreign path {}",
                    logged.seq,
                    committed_path.display()
                ),
            ));
        };

        if committed.contains_key(committed_path) {
            if temps.remove(temp_path) {
                plan.discards.push(temp_path.clone());
            }
            continue;
        }

        if !temps.remove(temp_path) {
            return Err(SinkError::fatal(
                tp,
                format!(
                    "commit log entry {} references missing temp file {}",
                    logged.seq,
                    temp_path.display()
                ),
            ));
        }

        plan.renames.push(PendingRename {
            from: temp_path.clone(),
            to: committed_path.clone(),
        });
        committed.insert(
            committed_path.clone(),
            CommittedFile {
                path: committed_path.clone(),
                encoded_partition: name.encoded_partition,
                start: name.start,
                end: name.end,
            },
        );
    }
    plan.discards.extend(temps);

    for file in committed.values() {
        let end = plan
            .lane_ends
            .entry(file.encoded_partition.clone())
            .or_insert(file.end);
        *end = (*end).max(file.end);
    }

    let highest = committed.values().map(|f| f.end).max();
    plan.watermark = match logged_watermark {
        LoggedWatermark::Empty => highest,
        LoggedWatermark::Recorded(recorded) => highest.min(recorded),
    };
    plan.committed = committed.into_values().collect();
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use helix_core::FileId;

    use super::*;

    fn setup() -> (FileNaming, TopicPartition) {
        (
            FileNaming::new("/topics", "/logs", 10, ".bin"),
            TopicPartition::new("orders", 0),
        )
    }

    fn committed_entry(
        naming: &FileNaming,
        tp: &TopicPartition,
        seq: u64,
        encoded: &str,
        range: (u64, u64),
    ) -> LoggedEntry {
        LoggedEntry {
            seq,
            entry: CommitEntry::AppendCommitted {
                file_id: FileId::new(seq),
                temp_path: naming.temp_path(tp, encoded, 1, FileId::new(seq)),
                committed_path: naming.committed_path(
                    tp,
                    encoded,
                    Offset::new(range.0),
                    Offset::new(range.1),
                ),
                start: Offset::new(range.0),
                end: Offset::new(range.1),
                watermark: Some(Offset::new(range.1)),
            },
        }
    }

    const fn recorded(offset: u64) -> LoggedWatermark {
        LoggedWatermark::Recorded(Some(Offset::new(offset)))
    }

    fn paths(entry: &LoggedEntry) -> (PathBuf, PathBuf) {
        match &entry.entry {
            CommitEntry::AppendCommitted {
                temp_path,
                committed_path,
                ..
            } => (temp_path.clone(), committed_path.clone()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_reconcile_empty() {
        let (naming, tp) = setup();
        let plan = reconcile(&naming, &tp, &[], LoggedWatermark::Empty, &[]).unwrap();
        assert!(plan.is_clean());
        assert_eq!(plan.watermark, None);
        assert!(plan.committed.is_empty());
    }

    #[test]
    fn test_reconcile_redoes_missing_rename() {
        let (naming, tp) = setup();
        let first = committed_entry(&naming, &tp, 2, "partition=0", (0, 2));
        let second = committed_entry(&naming, &tp, 4, "partition=0", (3, 5));
        let (_, first_committed) = paths(&first);
        let (second_temp, second_committed) = paths(&second);

        let listing = vec![first_committed, second_temp.clone()];
        let plan = reconcile(&naming, &tp, &[first, second], recorded(5), &listing).unwrap();

        assert_eq!(
            plan.renames,
            vec![PendingRename {
                from: second_temp,
                to: second_committed,
            }]
        );
        assert!(plan.discards.is_empty());
        assert_eq!(plan.committed.len(), 2);
        assert_eq!(plan.watermark, Some(Offset::new(5)));
        assert_eq!(plan.lane_ends.get("partition=0"), Some(&Offset::new(5)));
    }

    #[test]
    fn test_reconcile_missing_temp_is_fatal() {
        let (naming, tp) = setup();
        let entry = committed_entry(&naming, &tp, 2, "partition=0", (0, 2));
        let result = reconcile(&naming, &tp, &[entry], recorded(2), &[]);
        assert!(matches!(result, Err(SinkError::FatalConsistency { .. })));
    }

    #[test]
    fn test_reconcile_discards_orphans_and_leftovers() {
        let (naming, tp) = setup();
        let entry = committed_entry(&naming, &tp, 2, "partition=0", (0, 2));
        let (temp, committed) = paths(&entry);
        let orphan = naming.temp_path(&tp, "partition=0", 1, FileId::new(9));
        let other_tp = naming.temp_path(&TopicPartition::new("orders", 1), "partition=1", 1, FileId::new(1));
        let unrelated = PathBuf::from("/topics/orders/partition=0/README");

        let listing = vec![committed, temp.clone(), orphan.clone(), other_tp, unrelated];
        let plan = reconcile(&naming, &tp, &[entry], recorded(2), &listing).unwrap();

        assert!(plan.renames.is_empty());
        assert_eq!(plan.discards, vec![temp, orphan]);
        assert_eq!(plan.watermark, Some(Offset::new(2)));
    }

    #[test]
    fn test_reconcile_caps_watermark_with_recorded() {
        let (naming, tp) = setup();
        let a = naming.committed_path(&tp, "key=a", Offset::new(0), Offset::new(2));
        let b = naming.committed_path(&tp, "key=b", Offset::new(5), Offset::new(7));

        // Offsets 3 and 4 of key=a were still pending when key=b committed.
        let plan = reconcile(&naming, &tp, &[], recorded(2), &[a, b]).unwrap();
        assert_eq!(plan.watermark, Some(Offset::new(2)));
        assert_eq!(plan.lane_ends.get("key=a"), Some(&Offset::new(2)));
        assert_eq!(plan.lane_ends.get("key=b"), Some(&Offset::new(7)));
    }

    #[test]
    fn test_reconcile_unrecorded_watermark_skips_nothing() {
        let (naming, tp) = setup();
        // key=b committed 1..=5 while offset 0 of key=a was still pending.
        let mut entry = committed_entry(&naming, &tp, 2, "key=b", (1, 5));
        if let CommitEntry::AppendCommitted { watermark, .. } = &mut entry.entry {
            *watermark = None;
        }
        let (_, committed) = paths(&entry);

        let plan = reconcile(
            &naming,
            &tp,
            &[entry],
            LoggedWatermark::Recorded(None),
            &[committed.clone()],
        )
        .unwrap();
        assert_eq!(plan.watermark, None);
        assert_eq!(plan.lane_ends.get("key=b"), Some(&Offset::new(5)));

        // Without any log history the committed files are all there is.
        let plan = reconcile(&naming, &tp, &[], LoggedWatermark::Empty, &[committed]).unwrap();
        assert_eq!(plan.watermark, Some(Offset::new(5)));
    }

    #[test]
    fn test_reconcile_rejects_foreign_committed_path() {
        let (naming, tp) = setup();
        let mut entry = committed_entry(&naming, &tp, 2, "partition=0", (0, 2));
        if let CommitEntry::AppendCommitted { committed_path, .. } = &mut entry.entry {
            *committed_path = PathBuf::from("/elsewhere/file.bin");
        }
        let (temp, _) = paths(&entry);
        let result = reconcile(&naming, &tp, &[entry], recorded(2), &[temp]);
        assert!(matches!(result, Err(SinkError::FatalConsistency { .. })));
    }
}
