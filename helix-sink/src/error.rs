//! Sink error types.
//!
//! Three classes matter to callers:
//!
//! - **Transient**: a storage operation failed and will be retried after
//!   the configured backoff. Never escapes a topic-partition writer.
//! - **Fatal consistency**: the commit log and the filesystem disagree in a
//!   way that cannot be repaired. The topic-partition stops.
//! - **Configuration**: rejected at construction, before any write.

use std::fmt;
use std::path::Path;

use helix_core::TopicPartition;
use helix_wal::WalError;
use thiserror::Error;

/// Result type for sink operations.
pub type SinkResult<T> = Result<T, SinkError>;

/// The storage step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Opening a temp file.
    Open,
    /// Appending a record to a temp file.
    Append,
    /// Closing (flushing and syncing) a temp file.
    Close,
    /// Appending to the commit log.
    WalAppend,
    /// Renaming a temp file to its committed name.
    Rename,
    /// Listing committed or temp files.
    List,
    /// Deleting a stale temp file.
    Delete,
    /// Reading the commit log or listing files during recovery.
    Recovery,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Append => "append",
            Self::Close => "close",
            Self::WalAppend => "wal-append",
            Self::Rename => "rename",
            Self::List => "list",
            Self::Delete => "delete",
            Self::Recovery => "recovery",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// A storage operation failed; retried after backoff.
    #[error("transient {kind} failure on {path}: {message}")]
    TransientWrite {
        /// Which step failed.
        kind: FailureKind,
        /// Path involved.
        path: String,
        /// Underlying error.
        message: String,
    },

    /// Commit log and filesystem cannot be reconciled.
    #[error("consistency failure for {topic_partition}: {reason}")]
    FatalConsistency {
        /// Affected topic-partition.
        topic_partition: String,
        /// What is inconsistent.
        reason: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration for '{field}': {reason}")]
    Configuration {
        /// Offending field.
        field: &'static str,
        /// Why it is invalid.
        reason: String,
    },

    /// Configuration text could not be parsed.
    #[error("failed to parse configuration: {message}")]
    ConfigParse {
        /// Parser message.
        message: String,
    },

    /// The topic-partition writer is in the fatal state.
    #[error("{topic_partition} is fatal: {reason}")]
    WriterFatal {
        /// Affected topic-partition.
        topic_partition: String,
        /// The error that made it fatal.
        reason: String,
    },

    /// A stored record failed to decode.
    #[error("corrupt record at byte {position}: {reason}")]
    CorruptRecord {
        /// Byte position of the record.
        position: u64,
        /// What is wrong.
        reason: &'static str,
    },

    /// A catalog listener rejected a notification.
    #[error("catalog sync failed: {message}")]
    Catalog {
        /// Error message.
        message: String,
    },
}

impl SinkError {
    /// Creates a transient error for `path`.
    pub fn transient(kind: FailureKind, path: &Path, err: impl fmt::Display) -> Self {
        Self::TransientWrite {
            kind,
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    /// Creates a fatal consistency error.
    pub fn fatal(tp: &TopicPartition, reason: impl Into<String>) -> Self {
        Self::FatalConsistency {
            topic_partition: tp.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field,
            reason: reason.into(),
        }
    }

    /// Classifies a commit log or storage error.
    ///
    /// Corruption is fatal; everything else is an I/O hiccup.
    pub fn from_wal(tp: &TopicPartition, kind: FailureKind, path: &Path, err: WalError) -> Self {
        if err.is_corruption() {
            Self::fatal(tp, format!("commit log {} is corrupt: {err}", path.display()))
        } else {
            Self::transient(kind, path, err)
        }
    }

    /// Returns true if the operation should be retried after backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientWrite { .. })
    }

    /// Returns the failed step for transient errors.
    #[must_use]
    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::TransientWrite { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal_corruption_is_fatal() {
        let tp = TopicPartition::new("orders", 0);
        let path = Path::new("/logs/orders/0/log");

        let corrupt = WalError::ChecksumMismatch {
            offset: 0,
            expected: 1,
            actual: 2,
        };
        let err = SinkError::from_wal(&tp, FailureKind::Recovery, path, corrupt);
        assert!(matches!(err, SinkError::FatalConsistency { .. }));
        assert!(!err.is_retryable());

        let io = WalError::io("write", "disk unavailable");
        let err = SinkError::from_wal(&tp, FailureKind::WalAppend, path, io);
        assert!(err.is_retryable());
        assert_eq!(err.failure_kind(), Some(FailureKind::WalAppend));
    }

    #[test]
    fn test_error_display() {
        let err = SinkError::transient(FailureKind::Rename, Path::new("/a"), "busy");
        assert_eq!(err.to_string(), "transient rename failure on /a: busy");

        let err = SinkError::config("flush_size", "must be at least 1");
        assert!(err.to_string().contains("flush_size"));
    }
}
