//! Checksummed binary records.
//!
//! Each record is framed as:
//!
//! ```text
//! +----------+----------+----------+-----------+----------+-----------+-----+-----------+-------+
//! |  CRC32   |  Length  |  Offset  | Timestamp |  Schema  |  Key len  | Key | Value len | Value |
//! | (4 bytes)| (4 bytes)| (8 bytes)| (8 bytes) | (4 bytes)| (4 bytes) |     | (4 bytes) |       |
//! +----------+----------+----------+-----------+----------+-----------+-----+-----------+-------+
//! ```
//!
//! - CRC32: Checksum of everything after the CRC
//! - Length: Size of the body after the length field
//! - Schema / Key len: `u32::MAX` means absent
//!
//! All integers are little-endian. Topic and partition are implied by the
//! file name and not stored.

use std::path::Path;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use helix_core::{Offset, PartitionId, SinkRecord, Timestamp};
use helix_wal::Storage;

use super::{FileAppender, RecordFormat, RecordWriter};
use crate::error::{SinkError, SinkResult};

/// Size of the CRC and length prefix.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Marker for an absent schema version or key.
const ABSENT: u32 = u32::MAX;

/// Fixed part of the body: offset, timestamp, schema, key len, value len.
const BODY_FIXED_SIZE: usize = 8 + 8 + 4 + 4 + 4;

/// The binary format.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryFormat;

/// A decoded record without its topic and partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRecord {
    /// Record offset.
    pub offset: Offset,
    /// Record timestamp.
    pub timestamp: Timestamp,
    /// Schema version.
    pub schema_version: Option<u32>,
    /// Record key.
    pub key: Option<Bytes>,
    /// Record value.
    pub value: Bytes,
}

impl BinaryFormat {
    /// Encodes one record frame into `buf`.
    #[allow(clippy::cast_possible_truncation)] // Records are far below 4 GiB.
    pub fn encode(record: &SinkRecord, buf: &mut BytesMut) {
        let key_len = record.key.as_ref().map_or(0, Bytes::len);
        let body_len = BODY_FIXED_SIZE + key_len + record.value.len();

        let mut body = BytesMut::with_capacity(4 + body_len);
        body.put_u32_le(body_len as u32);
        body.put_u64_le(record.offset.get());
        body.put_i64_le(record.timestamp.as_millis());
        body.put_u32_le(record.schema_version.unwrap_or(ABSENT));
        match &record.key {
            Some(key) => {
                body.put_u32_le(key.len() as u32);
                body.put_slice(key);
            }
            None => body.put_u32_le(ABSENT),
        }
        body.put_u32_le(record.value.len() as u32);
        body.put_slice(&record.value);

        buf.put_u32_le(crc32fast::hash(&body));
        buf.put_slice(&body);
    }

    /// Decodes every frame in `data`.
    ///
    /// # Errors
    /// Returns `CorruptRecord` at the first frame that is truncated or fails
    /// its checksum.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode_frames(data: &[u8]) -> SinkResult<Vec<BinaryRecord>> {
        let mut records = Vec::new();
        let mut buf = data;
        let mut position = 0u64;

        while buf.has_remaining() {
            let corrupt = |reason| SinkError::CorruptRecord { position, reason };
            if buf.remaining() < RECORD_HEADER_SIZE {
                return Err(corrupt("truncated header"));
            }
            let crc = buf.get_u32_le();
            let body_len = buf.get_u32_le() as usize;
            if buf.remaining() < body_len || body_len < BODY_FIXED_SIZE {
                return Err(corrupt("truncated body"));
            }

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&(body_len as u32).to_le_bytes());
            hasher.update(&buf[..body_len]);
            if hasher.finalize() != crc {
                return Err(corrupt("checksum mismatch"));
            }

            let mut body = &buf[..body_len];
            let offset = Offset::new(body.get_u64_le());
            let timestamp = Timestamp::from_millis(body.get_i64_le());
            let schema_version = Some(body.get_u32_le()).filter(|v| *v != ABSENT);
            let key = match body.get_u32_le() {
                ABSENT => None,
                len => Some(take(&mut body, len as usize).ok_or_else(|| corrupt("bad key length"))?),
            };
            if body.remaining() < 4 {
                return Err(corrupt("truncated body"));
            }
            let value_len = body.get_u32_le() as usize;
            let value = take(&mut body, value_len).ok_or_else(|| corrupt("bad value length"))?;
            if body.has_remaining() {
                return Err(corrupt("trailing bytes in record"));
            }

            records.push(BinaryRecord {
                offset,
                timestamp,
                schema_version,
                key,
                value,
            });
            buf.advance(body_len);
            position += (RECORD_HEADER_SIZE + body_len) as u64;
        }
        Ok(records)
    }

    /// Decodes `data` into records of `topic`/`partition`.
    ///
    /// # Errors
    /// Returns `CorruptRecord` if any frame is damaged.
    pub fn decode(
        topic: &str,
        partition: impl Into<PartitionId>,
        data: &[u8],
    ) -> SinkResult<Vec<SinkRecord>> {
        let partition = partition.into();
        Ok(Self::decode_frames(data)?
            .into_iter()
            .map(|r| SinkRecord {
                topic: topic.to_string(),
                partition,
                offset: r.offset,
                timestamp: r.timestamp,
                key: r.key,
                value: r.value,
                schema_version: r.schema_version,
            })
            .collect())
    }
}

fn take(buf: &mut &[u8], len: usize) -> Option<Bytes> {
    if buf.remaining() < len {
        return None;
    }
    Some(buf.copy_to_bytes(len))
}

#[async_trait]
impl RecordFormat for BinaryFormat {
    fn extension(&self) -> &str {
        ".bin"
    }

    async fn open(&self, storage: &dyn Storage, path: &Path) -> SinkResult<Box<dyn RecordWriter>> {
        let file = FileAppender::create(storage, path).await?;
        Ok(Box::new(BinaryWriter {
            file,
            buf: BytesMut::new(),
        }))
    }
}

struct BinaryWriter {
    file: FileAppender,
    buf: BytesMut,
}

#[async_trait]
impl RecordWriter for BinaryWriter {
    async fn append(&mut self, record: &SinkRecord) -> SinkResult<()> {
        self.buf.clear();
        BinaryFormat::encode(record, &mut self.buf);
        self.file.write(&self.buf).await
    }

    async fn close(&mut self) -> SinkResult<()> {
        self.file.sync().await
    }

    fn bytes_written(&self) -> u64 {
        self.file.position
    }
}

#[cfg(test)]
mod tests {
    use helix_wal::{FaultConfig, SimulatedStorage};

    use super::*;

    fn sample() -> Vec<SinkRecord> {
        vec![
            SinkRecord::new("orders", 2, 10, "first"),
            SinkRecord::new("orders", 2, 11, "")
                .with_key("k")
                .with_timestamp(Timestamp::from_millis(1_700_000_000_000))
                .with_schema_version(4),
            SinkRecord::new("orders", 2, 12, vec![0u8; 300]).with_key(Bytes::new()),
        ]
    }

    #[test]
    fn test_binary_decode_preserves_fields() {
        let mut buf = BytesMut::new();
        for record in sample() {
            BinaryFormat::encode(&record, &mut buf);
        }
        assert_eq!(BinaryFormat::decode("orders", 2, &buf).unwrap(), sample());
    }

    #[test]
    fn test_binary_decode_detects_corruption() {
        let mut buf = BytesMut::new();
        for record in sample() {
            BinaryFormat::encode(&record, &mut buf);
        }

        let mut flipped = buf.to_vec();
        flipped[RECORD_HEADER_SIZE + 3] ^= 0xFF;
        assert!(matches!(
            BinaryFormat::decode_frames(&flipped),
            Err(SinkError::CorruptRecord { position: 0, .. })
        ));

        let torn = &buf[..buf.len() - 1];
        let err = BinaryFormat::decode_frames(torn).unwrap_err();
        assert!(matches!(err, SinkError::CorruptRecord { position, .. } if position > 0));
    }

    #[tokio::test]
    async fn test_binary_writer_appends_and_syncs() {
        let storage = SimulatedStorage::new(5);
        let path = Path::new("/topics/+tmp/orders/p/a_tmp.bin");

        let mut writer = BinaryFormat.open(&storage, path).await.unwrap();
        for record in sample() {
            writer.append(&record).await.unwrap();
        }
        assert!(storage.get_synced_content(path).is_none_or(|c| c.is_empty()));
        writer.close().await.unwrap();

        let synced = storage.get_synced_content(path).unwrap();
        assert_eq!(synced.len() as u64, writer.bytes_written());
        assert_eq!(BinaryFormat::decode("orders", 2, &synced).unwrap(), sample());
    }

    #[tokio::test]
    async fn test_binary_writer_append_failure_is_transient() {
        let storage = SimulatedStorage::with_faults(5, FaultConfig::none().with_write_fail_rate(1.0));
        let path = Path::new("/topics/+tmp/orders/p/a_tmp.bin");

        let mut writer = BinaryFormat.open(&storage, path).await.unwrap();
        let err = writer.append(&sample()[0]).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(writer.bytes_written(), 0);
    }
}
