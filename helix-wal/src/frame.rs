//! Commit log framing.
//!
//! Every commit log entry is stored as one frame:
//!
//! ```text
//! +--------+--------+----------+------+---------+
//! | CRC32  | Length | Sequence | Kind | Payload |
//! |   4    |   4    |    8     |  1   |    N    |
//! +--------+--------+----------+------+---------+
//! ```
//!
//! The CRC covers every byte after itself. Integers are little-endian.
//! A frame cut short by a crash is a torn tail, not corruption:
//! [`FrameReader`] stops in front of it and reports how many bytes were valid.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WalError, WalResult};
use crate::limits::ENTRY_PAYLOAD_SIZE_BYTES_MAX;

/// Bytes in front of the payload.
pub const FRAME_HEADER_SIZE: usize = 4 + 4 + 8 + 1;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Position of the entry within its log.
    pub sequence: u64,
    /// Entry type tag, interpreted by [`crate::CommitEntry`].
    pub kind: u8,
    /// Entry body.
    pub payload: Bytes,
}

impl Frame {
    /// Returns the encoded size of the frame.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        (FRAME_HEADER_SIZE + self.payload.len()) as u64
    }

    /// Appends the frame for (`sequence`, `kind`, `payload`) to `buf`.
    ///
    /// # Errors
    /// Returns `FrameTooLarge` if the payload exceeds the entry limit.
    pub fn encode(sequence: u64, kind: u8, payload: &[u8], buf: &mut BytesMut) -> WalResult<()> {
        let length = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= ENTRY_PAYLOAD_SIZE_BYTES_MAX)
            .ok_or(WalError::FrameTooLarge {
                size: payload.len(),
                max: ENTRY_PAYLOAD_SIZE_BYTES_MAX,
            })?;

        let start = buf.len();
        buf.reserve(FRAME_HEADER_SIZE + payload.len());
        buf.put_u32_le(0);
        buf.put_u32_le(length);
        buf.put_u64_le(sequence);
        buf.put_u8(kind);
        buf.put_slice(payload);

        let crc = crc32fast::hash(&buf[start + 4..]);
        buf[start..start + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Decodes the frame at the start of `data`, which sits at byte `offset`
    /// of its file.
    ///
    /// # Errors
    /// Returns `TornFrame` if `data` ends inside the frame, `MalformedFrame`
    /// if the length is impossible, or `ChecksumMismatch` if the CRC fails.
    pub fn decode(data: &[u8], offset: u64) -> WalResult<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(WalError::TornFrame {
                offset,
                needed: FRAME_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut header = &data[..FRAME_HEADER_SIZE];
        let stored_crc = header.get_u32_le();
        let length = header.get_u32_le();
        let sequence = header.get_u64_le();
        let kind = header.get_u8();

        if length > ENTRY_PAYLOAD_SIZE_BYTES_MAX {
            return Err(WalError::MalformedFrame {
                offset,
                reason: "length exceeds maximum",
            });
        }
        let total = FRAME_HEADER_SIZE + length as usize;
        if data.len() < total {
            return Err(WalError::TornFrame {
                offset,
                needed: total,
                available: data.len(),
            });
        }

        let computed = crc32fast::hash(&data[4..total]);
        if computed != stored_crc {
            return Err(WalError::ChecksumMismatch {
                offset,
                expected: stored_crc,
                actual: computed,
            });
        }

        Ok(Self {
            sequence,
            kind,
            payload: Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..total]),
        })
    }
}

/// Reads consecutive frames from the contents of a log file.
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: u64,
}

impl<'a> FrameReader<'a> {
    /// Starts reading at the beginning of `data`.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Returns the length of the prefix made of complete, valid frames.
    #[must_use]
    pub const fn valid_len(&self) -> u64 {
        self.position
    }

    /// Returns the next frame and its byte offset.
    ///
    /// Returns `Ok(None)` at the end of the data or in front of a torn tail.
    ///
    /// # Errors
    /// Returns the decode error for a frame that is present but corrupt.
    pub fn next_frame(&mut self) -> WalResult<Option<(u64, Frame)>> {
        #[allow(clippy::cast_possible_truncation)] // Position never exceeds data length.
        let rest = &self.data[self.position as usize..];
        if rest.is_empty() {
            return Ok(None);
        }
        match Frame::decode(rest, self.position) {
            Ok(frame) => {
                let offset = self.position;
                self.position += frame.encoded_len();
                Ok(Some((offset, frame)))
            }
            Err(WalError::TornFrame { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
