//! Commit log and storage errors.

use thiserror::Error;

/// Result type for commit log and storage operations.
pub type WalResult<T> = Result<T, WalError>;

/// Errors raised by storage, framing and the commit log.
#[derive(Debug, Error)]
pub enum WalError {
    /// A storage call failed.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// The storage operation.
        operation: &'static str,
        /// Underlying error message.
        message: String,
    },

    /// The data ends inside a frame. Expected after a crash mid-append.
    #[error("torn frame at offset {offset}: needs {needed} bytes, {available} available")]
    TornFrame {
        /// Byte offset of the frame.
        offset: u64,
        /// Bytes the frame needs.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// The stored CRC does not match the frame content.
    #[error("checksum mismatch at offset {offset}: stored {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        /// Byte offset of the frame.
        offset: u64,
        /// CRC stored in the frame.
        expected: u32,
        /// CRC computed over the content.
        actual: u32,
    },

    /// The frame header cannot describe a valid frame.
    #[error("malformed frame at offset {offset}: {reason}")]
    MalformedFrame {
        /// Byte offset of the frame.
        offset: u64,
        /// What is wrong.
        reason: &'static str,
    },

    /// A valid frame whose payload is not a known commit entry.
    #[error("invalid entry at offset {offset}: {reason}")]
    InvalidEntry {
        /// Byte offset of the frame.
        offset: u64,
        /// What is wrong.
        reason: String,
    },

    /// A payload too large to frame.
    #[error("frame payload of {size} bytes exceeds max {max}")]
    FrameTooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Limit in bytes.
        max: u32,
    },
}

impl WalError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Creates an invalid entry error.
    pub fn invalid_entry(offset: u64, reason: impl Into<String>) -> Self {
        Self::InvalidEntry {
            offset,
            reason: reason.into(),
        }
    }

    /// Returns true if the log content is damaged beyond a torn tail.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::MalformedFrame { .. } | Self::InvalidEntry { .. }
        )
    }
}
