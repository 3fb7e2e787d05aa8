//! File naming.
//!
//! ```text
//! committed: <topics>/<topic>/<encoded>/<topic>+<partition>+<start>+<end><ext>
//! temp:      <topics>/+tmp/<topic>/<encoded>/<topic>+<partition>+<session>-<file-id>_tmp<ext>
//! wal:       <logs>/<topic>/<partition>/log
//! ```
//!
//! Offsets in committed names are zero-padded to a fixed width so names sort
//! by offset. Temp names carry the writer session and a per-session file id,
//! and the `_tmp` suffix keeps them from ever parsing as committed names.

use std::path::{Path, PathBuf};

use helix_core::{FileId, Offset, PartitionId, TopicPartition};

/// Directory below the topics root holding temp files.
pub const TEMP_DIR: &str = "+tmp";

/// Suffix of temp file names, before the extension.
const TEMP_SUFFIX: &str = "_tmp";

/// File name of a commit log.
const WAL_FILE: &str = "log";

/// A committed file name, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedName {
    /// Encoded partition (directory below the topic).
    pub encoded_partition: String,
    /// First offset.
    pub start: Offset,
    /// Last offset (inclusive).
    pub end: Offset,
}

/// A temp file name, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempName {
    /// Encoded partition (directory below the temp topic directory).
    pub encoded_partition: String,
    /// Session that created the file.
    pub session: u64,
    /// File id within the session.
    pub file_id: FileId,
}

/// Builds and parses every path the sink touches.
#[derive(Debug, Clone)]
pub struct FileNaming {
    topics_dir: PathBuf,
    logs_dir: PathBuf,
    zero_pad_width: usize,
    extension: String,
}

impl FileNaming {
    /// Creates a naming scheme.
    #[must_use]
    pub fn new(
        topics_dir: impl Into<PathBuf>,
        logs_dir: impl Into<PathBuf>,
        zero_pad_width: usize,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            topics_dir: topics_dir.into(),
            logs_dir: logs_dir.into(),
            zero_pad_width,
            extension: extension.into(),
        }
    }

    /// Returns the committed file extension.
    #[must_use]
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Returns `<topics>/<topic>`.
    #[must_use]
    pub fn topic_dir(&self, topic: &str) -> PathBuf {
        self.topics_dir.join(topic)
    }

    /// Returns `<topics>/+tmp/<topic>`.
    #[must_use]
    pub fn temp_topic_dir(&self, topic: &str) -> PathBuf {
        self.topics_dir.join(TEMP_DIR).join(topic)
    }

    /// Returns the directory holding committed files of one encoded partition.
    #[must_use]
    pub fn partition_dir(&self, topic: &str, encoded: &str) -> PathBuf {
        self.topic_dir(topic).join(encoded)
    }

    /// Returns the committed path for `[start, end]`.
    #[must_use]
    pub fn committed_path(
        &self,
        tp: &TopicPartition,
        encoded: &str,
        start: Offset,
        end: Offset,
    ) -> PathBuf {
        let width = self.zero_pad_width;
        let name = format!(
            "{topic}+{partition}+{start:0width$}+{end:0width$}{ext}",
            topic = tp.topic,
            partition = tp.partition,
            start = start.get(),
            end = end.get(),
            ext = self.extension,
        );
        self.partition_dir(&tp.topic, encoded).join(name)
    }

    /// Returns the temp path for a file of `session`.
    #[must_use]
    pub fn temp_path(
        &self,
        tp: &TopicPartition,
        encoded: &str,
        session: u64,
        file_id: FileId,
    ) -> PathBuf {
        let name = format!(
            "{topic}+{partition}+{session:016x}-{file_id:08x}{TEMP_SUFFIX}{ext}",
            topic = tp.topic,
            partition = tp.partition,
            file_id = file_id.get(),
            ext = self.extension,
        );
        self.temp_topic_dir(&tp.topic).join(encoded).join(name)
    }

    /// Returns the commit log path of `tp`.
    #[must_use]
    pub fn wal_path(&self, tp: &TopicPartition) -> PathBuf {
        self.logs_dir
            .join(&tp.topic)
            .join(tp.partition.to_string())
            .join(WAL_FILE)
    }

    /// Parses `path` as a committed file of `tp`.
    ///
    /// Returns `None` for anything else, including other partitions' files.
    #[must_use]
    pub fn parse_committed(&self, tp: &TopicPartition, path: &Path) -> Option<CommittedName> {
        let encoded = encoded_below(path, &self.topic_dir(&tp.topic))?;
        let stem = self.strip_extension(file_name(path)?)?;

        let mut parts = stem.rsplitn(4, '+');
        let end = parse_offset(parts.next()?)?;
        let start = parse_offset(parts.next()?)?;
        if !self.names_partition(tp, parts.next()?, parts.next()?) || end < start {
            return None;
        }

        Some(CommittedName {
            encoded_partition: encoded,
            start,
            end,
        })
    }

    /// Parses `path` as a temp file of `tp`.
    #[must_use]
    pub fn parse_temp(&self, tp: &TopicPartition, path: &Path) -> Option<TempName> {
        let encoded = encoded_below(path, &self.temp_topic_dir(&tp.topic))?;
        let stem = self
            .strip_extension(file_name(path)?)?
            .strip_suffix(TEMP_SUFFIX)?;

        let mut parts = stem.rsplitn(3, '+');
        let (session, file_id) = parts.next()?.split_once('-')?;
        if !self.names_partition(tp, parts.next()?, parts.next()?) {
            return None;
        }

        Some(TempName {
            encoded_partition: encoded,
            session: u64::from_str_radix(session, 16).ok()?,
            file_id: FileId::new(u64::from_str_radix(file_id, 16).ok()?),
        })
    }

    fn strip_extension<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_suffix(self.extension.as_str())
    }

    fn names_partition(&self, tp: &TopicPartition, partition: &str, topic: &str) -> bool {
        topic == tp.topic && partition.parse::<PartitionId>().ok() == Some(tp.partition)
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name()?.to_str()
}

/// Returns the directory of `path` relative to `root`, as a `/`-joined string.
fn encoded_below(path: &Path, root: &Path) -> Option<String> {
    let dir = path.parent()?.strip_prefix(root).ok()?;
    let segments: Option<Vec<&str>> = dir.iter().map(|s| s.to_str()).collect();
    let encoded = segments?.join("/");
    (!encoded.is_empty()).then_some(encoded)
}

fn parse_offset(digits: &str) -> Option<Offset> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(Offset::new)
}
