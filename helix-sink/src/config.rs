//! Sink configuration.
//!
//! Loaded from TOML or built in code. Every field has a default, so a config
//! file only names what it changes:
//!
//! ```toml
//! topics_dir = "/data/topics"
//! logs_dir = "/data/logs"
//! flush_size = 500
//! rotate_interval_ms = 60000
//!
//! [partitioner]
//! type = "time"
//! bucket_ms = 3600000
//! close_grace_ms = 60000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SinkError, SinkResult};

/// Maximum zero-pad width; `u64::MAX` has 20 digits.
pub const ZERO_PAD_WIDTH_MAX: usize = 20;

/// Output format of temp and committed files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    /// Checksummed binary records, decodable back into records.
    #[default]
    Binary,
    /// One record value per line.
    Text,
}

/// How records map to encoded partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionerKind {
    /// One encoded partition per source partition.
    #[default]
    Default,
    /// Encoded partition from the record key.
    Key {
        /// Field name used in the path segment.
        field: String,
    },
    /// Encoded partition from the record timestamp.
    Time {
        /// Bucket width in milliseconds.
        bucket_ms: u64,
        /// How long after a bucket ends it stays open.
        #[serde(default)]
        close_grace_ms: u64,
    },
}

/// Sink configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Root of committed and temp files.
    pub topics_dir: PathBuf,
    /// Root of the commit logs.
    pub logs_dir: PathBuf,
    /// Records per file before rotation.
    pub flush_size: u64,
    /// Bytes per file before rotation.
    pub flush_size_bytes: Option<u64>,
    /// Maximum age of an open file before rotation.
    pub rotate_interval_ms: Option<u64>,
    /// Fixed delay before retrying a failed storage operation.
    pub retry_backoff_ms: u64,
    /// Digits used for offsets in committed file names.
    pub zero_pad_width: usize,
    /// Committed file extension, including the leading dot. Defaults to the
    /// format's extension.
    pub extension: Option<String>,
    /// Output format.
    pub format: FormatKind,
    /// Commit log size that triggers compaction.
    pub wal_compaction_bytes: u64,
    /// Partition function.
    pub partitioner: PartitionerKind,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            topics_dir: PathBuf::from("topics"),
            logs_dir: PathBuf::from("logs"),
            flush_size: 1000,
            flush_size_bytes: None,
            rotate_interval_ms: None,
            retry_backoff_ms: 5000,
            zero_pad_width: 10,
            extension: None,
            format: FormatKind::Binary,
            wal_compaction_bytes: helix_wal::limits::COMPACTION_BYTES_DEFAULT,
            partitioner: PartitionerKind::Default,
        }
    }
}

impl SinkConfig {
    /// Creates a config rooted at `/topics` and `/logs` with small files,
    /// for tests against simulated storage.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            topics_dir: PathBuf::from("/topics"),
            logs_dir: PathBuf::from("/logs"),
            flush_size: 3,
            retry_backoff_ms: 1000,
            ..Self::default()
        }
    }

    /// Parses a config from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigParse` if the TOML is malformed.
    pub fn from_toml_str(toml: &str) -> SinkResult<Self> {
        toml::from_str(toml).map_err(|e| SinkError::ConfigParse {
            message: e.to_string(),
        })
    }

    /// Loads a config from a TOML file.
    ///
    /// # Errors
    /// Returns `ConfigParse` if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SinkResult<Self> {
        let contents =
            std::fs::read_to_string(path.as_ref()).map_err(|e| SinkError::ConfigParse {
                message: format!("failed to read {}: {e}", path.as_ref().display()),
            })?;
        Self::from_toml_str(&contents)
    }

    /// Serializes the config to TOML.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Sets the committed and temp file root.
    #[must_use]
    pub fn with_topics_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.topics_dir = dir.into();
        self
    }

    /// Sets the commit log root.
    #[must_use]
    pub fn with_logs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = dir.into();
        self
    }

    /// Sets the rotation record count.
    #[must_use]
    pub const fn with_flush_size(mut self, records: u64) -> Self {
        self.flush_size = records;
        self
    }

    /// Sets the rotation byte threshold.
    #[must_use]
    pub const fn with_flush_size_bytes(mut self, bytes: u64) -> Self {
        self.flush_size_bytes = Some(bytes);
        self
    }

    /// Sets the rotation interval.
    #[must_use]
    pub const fn with_rotate_interval_ms(mut self, ms: u64) -> Self {
        self.rotate_interval_ms = Some(ms);
        self
    }

    /// Sets the retry backoff.
    #[must_use]
    pub const fn with_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    /// Sets the zero-pad width of offsets in file names.
    #[must_use]
    pub const fn with_zero_pad_width(mut self, width: usize) -> Self {
        self.zero_pad_width = width;
        self
    }

    /// Sets the committed file extension.
    #[must_use]
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// Sets the output format.
    #[must_use]
    pub const fn with_format(mut self, format: FormatKind) -> Self {
        self.format = format;
        self
    }

    /// Sets the partition function.
    #[must_use]
    pub fn with_partitioner(mut self, partitioner: PartitionerKind) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Sets the commit log compaction threshold.
    #[must_use]
    pub const fn with_wal_compaction_bytes(mut self, bytes: u64) -> Self {
        self.wal_compaction_bytes = bytes;
        self
    }

    /// Returns the retry backoff in microseconds.
    #[must_use]
    pub const fn retry_backoff_us(&self) -> u64 {
        self.retry_backoff_ms.saturating_mul(1000)
    }

    /// Returns the rotation interval in microseconds.
    #[must_use]
    pub fn rotate_interval_us(&self) -> Option<u64> {
        self.rotate_interval_ms.map(|ms| ms.saturating_mul(1000))
    }

    /// Returns the retry backoff as a duration.
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Checks every constraint.
    ///
    /// # Errors
    /// Returns `Configuration` naming the first invalid field.
    pub fn validate(&self) -> SinkResult<()> {
        if self.topics_dir.as_os_str().is_empty() {
            return Err(SinkError::config("topics_dir", "must not be empty"));
        }
        if self.logs_dir.as_os_str().is_empty() {
            return Err(SinkError::config("logs_dir", "must not be empty"));
        }
        if self.flush_size == 0 {
            return Err(SinkError::config("flush_size", "must be at least 1"));
        }
        if self.flush_size_bytes == Some(0) {
            return Err(SinkError::config("flush_size_bytes", "must be at least 1"));
        }
        if self.rotate_interval_ms == Some(0) {
            return Err(SinkError::config("rotate_interval_ms", "must be at least 1"));
        }
        if self.retry_backoff_ms == 0 {
            return Err(SinkError::config("retry_backoff_ms", "must be at least 1"));
        }
        if !(1..=ZERO_PAD_WIDTH_MAX).contains(&self.zero_pad_width) {
            return Err(SinkError::config(
                "zero_pad_width",
                format!("must be between 1 and {ZERO_PAD_WIDTH_MAX}"),
            ));
        }
        if let Some(ext) = &self.extension {
            validate_extension(ext)?;
        }
        if self.wal_compaction_bytes == 0 {
            return Err(SinkError::config("wal_compaction_bytes", "must be at least 1"));
        }

        match &self.partitioner {
            PartitionerKind::Default => {}
            PartitionerKind::Key { field } => {
                if field.is_empty() || field.contains(['/', '+', '=']) {
                    return Err(SinkError::config(
                        "partitioner.field",
                        format!("'{field}' must be non-empty without '/', '+' or '='"),
                    ));
                }
            }
            PartitionerKind::Time { bucket_ms, .. } => {
                if *bucket_ms == 0 {
                    return Err(SinkError::config("partitioner.bucket_ms", "must be at least 1"));
                }
            }
        }
        Ok(())
    }
}

fn validate_extension(ext: &str) -> SinkResult<()> {
    if ext.is_empty() {
        return Ok(());
    }
    if !ext.starts_with('.') {
        return Err(SinkError::config(
            "extension",
            format!("'{ext}' must start with '.'"),
        ));
    }
    if ext.len() == 1 || ext.contains(['/', '+']) || ext.ends_with("_tmp") {
        return Err(SinkError::config(
            "extension",
            format!("'{ext}' is not a usable file extension"),
        ));
    }
    Ok(())
}
