//! Commit log entry types.
//!
//! The log records the intent to promote temp files into committed files:
//!
//! - [`CommitEntry::BeginTemp`]: sealing of a temp file has started.
//! - [`CommitEntry::AppendCommitted`]: the temp file is part of the committed
//!   set and must end up at `committed_path`, even if the process crashes
//!   before the rename happens.
//! - [`CommitEntry::TruncateTo`]: every entry with a sequence at or below
//!   `seq` is redundant because the directory listing alone describes it.
//!
//! # Payload Format
//!
//! ```text
//! BeginTemp:        file_id(8) | temp_path
//! AppendCommitted:  file_id(8) | temp_path | committed_path | start(8) | end(8) | watermark
//! TruncateTo:       seq(8) | watermark
//!
//! path      = len(4) | utf-8 bytes
//! watermark = present(1) | offset(8)
//! ```

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use helix_core::{FileId, Offset};

use crate::error::{WalError, WalResult};
use crate::frame::Frame;

const KIND_BEGIN_TEMP: u8 = 1;
const KIND_APPEND_COMMITTED: u8 = 2;
const KIND_TRUNCATE_TO: u8 = 3;

/// One logical entry in the commit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitEntry {
    /// A seal of `temp_path` has started.
    BeginTemp {
        /// Temp file identifier.
        file_id: FileId,
        /// Temp file location.
        temp_path: PathBuf,
    },
    /// `temp_path` is committed as `committed_path`, covering `[start, end]`.
    AppendCommitted {
        /// Temp file identifier.
        file_id: FileId,
        /// Temp file location.
        temp_path: PathBuf,
        /// Final committed location.
        committed_path: PathBuf,
        /// First offset in the file.
        start: Offset,
        /// Last offset in the file (inclusive).
        end: Offset,
        /// Commit watermark of the topic-partition once this commit lands.
        watermark: Option<Offset>,
    },
    /// All entries with sequence `<= seq` are redundant.
    TruncateTo {
        /// Highest redundant sequence.
        seq: u64,
        /// Commit watermark at truncation time.
        watermark: Option<Offset>,
    },
}

impl CommitEntry {
    /// Returns the kind tag used in the entry header.
    #[must_use]
    pub const fn kind(&self) -> u8 {
        match self {
            Self::BeginTemp { .. } => KIND_BEGIN_TEMP,
            Self::AppendCommitted { .. } => KIND_APPEND_COMMITTED,
            Self::TruncateTo { .. } => KIND_TRUNCATE_TO,
        }
    }

    /// Returns the watermark carried by this entry, if any.
    #[must_use]
    pub const fn watermark(&self) -> Option<Offset> {
        match self {
            Self::BeginTemp { .. } => None,
            Self::AppendCommitted { watermark, .. } | Self::TruncateTo { watermark, .. } => {
                *watermark
            }
        }
    }

    /// Appends the entry to `buf` as frame number `sequence`.
    ///
    /// # Errors
    /// Returns an error if a path is not valid UTF-8 or the entry is too
    /// large to frame.
    pub fn encode_frame(&self, sequence: u64, buf: &mut BytesMut) -> WalResult<()> {
        Frame::encode(sequence, self.kind(), &self.encode()?, buf)
    }

    /// Encodes the entry payload.
    ///
    /// # Errors
    /// Returns an error if a path is not valid UTF-8.
    pub fn encode(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Self::BeginTemp { file_id, temp_path } => {
                buf.put_u64_le(file_id.get());
                put_path(&mut buf, temp_path)?;
            }
            Self::AppendCommitted {
                file_id,
                temp_path,
                committed_path,
                start,
                end,
                watermark,
            } => {
                buf.put_u64_le(file_id.get());
                put_path(&mut buf, temp_path)?;
                put_path(&mut buf, committed_path)?;
                buf.put_u64_le(start.get());
                buf.put_u64_le(end.get());
                put_watermark(&mut buf, *watermark);
            }
            Self::TruncateTo { seq, watermark } => {
                buf.put_u64_le(*seq);
                put_watermark(&mut buf, *watermark);
            }
        }
        Ok(buf.freeze())
    }

    /// Decodes an entry payload of the given kind.
    ///
    /// `offset` is the byte position of the entry, used for error reporting.
    ///
    /// # Errors
    /// Returns `InvalidEntry` if the kind is unknown or the payload is malformed.
    pub fn decode(kind: u8, payload: &[u8], offset: u64) -> WalResult<Self> {
        let mut buf = payload;
        let entry = match kind {
            KIND_BEGIN_TEMP => Self::BeginTemp {
                file_id: FileId::new(get_u64(&mut buf, offset)?),
                temp_path: get_path(&mut buf, offset)?,
            },
            KIND_APPEND_COMMITTED => {
                let file_id = FileId::new(get_u64(&mut buf, offset)?);
                let temp_path = get_path(&mut buf, offset)?;
                let committed_path = get_path(&mut buf, offset)?;
                let start = Offset::new(get_u64(&mut buf, offset)?);
                let end = Offset::new(get_u64(&mut buf, offset)?);
                if end < start {
                    return Err(WalError::invalid_entry(offset, "end offset before start"));
                }
                Self::AppendCommitted {
                    file_id,
                    temp_path,
                    committed_path,
                    start,
                    end,
                    watermark: get_watermark(&mut buf, offset)?,
                }
            }
            KIND_TRUNCATE_TO => Self::TruncateTo {
                seq: get_u64(&mut buf, offset)?,
                watermark: get_watermark(&mut buf, offset)?,
            },
            other => {
                return Err(WalError::invalid_entry(
                    offset,
                    format!("unknown entry kind {other}"),
                ))
            }
        };

        if buf.has_remaining() {
            return Err(WalError::invalid_entry(offset, "trailing bytes in payload"));
        }
        Ok(entry)
    }
}

/// A commit entry together with its sequence number in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEntry {
    /// Sequence number assigned when the entry was appended.
    pub seq: u64,
    /// The entry.
    pub entry: CommitEntry,
}

fn put_path(buf: &mut BytesMut, path: &Path) -> WalResult<()> {
    let s = path
        .to_str()
        .ok_or_else(|| WalError::invalid_entry(0, format!("non utf-8 path {}", path.display())))?;
    #[allow(clippy::cast_possible_truncation)] // Bounded by the entry payload limit.
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_watermark(buf: &mut BytesMut, watermark: Option<Offset>) {
    match watermark {
        Some(offset) => {
            buf.put_u8(1);
            buf.put_u64_le(offset.get());
        }
        None => {
            buf.put_u8(0);
            buf.put_u64_le(0);
        }
    }
}

fn get_u64(buf: &mut &[u8], offset: u64) -> WalResult<u64> {
    if buf.remaining() < 8 {
        return Err(WalError::invalid_entry(offset, "payload too short"));
    }
    Ok(buf.get_u64_le())
}

fn get_path(buf: &mut &[u8], offset: u64) -> WalResult<PathBuf> {
    if buf.remaining() < 4 {
        return Err(WalError::invalid_entry(offset, "payload too short"));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(WalError::invalid_entry(offset, "path exceeds payload"));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| WalError::invalid_entry(offset, "path is not utf-8"))?
        .to_string();
    buf.advance(len);
    Ok(PathBuf::from(s))
}

fn get_watermark(buf: &mut &[u8], offset: u64) -> WalResult<Option<Offset>> {
    if buf.remaining() < 9 {
        return Err(WalError::invalid_entry(offset, "payload too short"));
    }
    let present = buf.get_u8();
    let value = buf.get_u64_le();
    match present {
        0 => Ok(None),
        1 => Ok(Some(Offset::new(value))),
        _ => Err(WalError::invalid_entry(offset, "bad watermark flag")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed() -> CommitEntry {
        CommitEntry::AppendCommitted {
            file_id: FileId::new(3),
            temp_path: PathBuf::from("/topics/+tmp/t/partition=0/t+0+x_tmp.bin"),
            committed_path: PathBuf::from("/topics/t/partition=0/t+0+0000000000+0000000002.bin"),
            start: Offset::new(0),
            end: Offset::new(2),
            watermark: Some(Offset::new(2)),
        }
    }

    #[test]
    fn test_commit_entry_roundtrip() {
        let entries = [
            CommitEntry::BeginTemp {
                file_id: FileId::new(3),
                temp_path: PathBuf::from("/topics/+tmp/t/partition=0/t+0+x_tmp.bin"),
            },
            committed(),
            CommitEntry::TruncateTo {
                seq: 9,
                watermark: None,
            },
        ];

        for entry in entries {
            let payload = entry.encode().unwrap();
            let decoded = CommitEntry::decode(entry.kind(), &payload, 0).unwrap();
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn test_commit_entry_rejects_unknown_kind() {
        let payload = committed().encode().unwrap();
        let result = CommitEntry::decode(99, &payload, 12);
        assert!(matches!(result, Err(WalError::InvalidEntry { offset: 12, .. })));
    }

    #[test]
    fn test_commit_entry_rejects_short_payload() {
        let payload = committed().encode().unwrap();
        let result = CommitEntry::decode(KIND_APPEND_COMMITTED, &payload[..payload.len() - 4], 0);
        assert!(matches!(result, Err(WalError::InvalidEntry { .. })));
    }

    #[test]
    fn test_commit_entry_watermark() {
        assert_eq!(committed().watermark(), Some(Offset::new(2)));
        let begin = CommitEntry::BeginTemp {
            file_id: FileId::new(1),
            temp_path: PathBuf::from("/x"),
        };
        assert_eq!(begin.watermark(), None);
    }
}
