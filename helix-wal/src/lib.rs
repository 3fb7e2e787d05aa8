//! Helix WAL - Commit log and storage abstraction for the sink.
//!
//! This crate provides a crash-safe, append-only commit log recording which
//! temp files have been promoted to committed files, and the storage traits
//! through which the sink touches the filesystem.
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Crash safety**: Every acknowledged entry survives crashes
//! - **Checksums**: CRC32 on every entry to detect corruption
//! - **Explicit limits**: Bounded entry sizes
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod commit;
mod error;
mod frame;
mod log;
pub mod storage;

pub use commit::{CommitEntry, LoggedEntry};
pub use frame::{Frame, FrameReader, FRAME_HEADER_SIZE};
pub use error::{WalError, WalResult};
pub use log::{CommitLog, CommitLogConfig};
pub use storage::{
    FaultConfig, FaultStats, SimulatedStorage, Storage, StorageFile, StorageOp, TokioStorage,
};

/// WAL configuration limits.
pub mod limits {
    /// Maximum size of a single entry payload in bytes (64 KB).
    ///
    /// Entries hold two paths and a few integers.
    pub const ENTRY_PAYLOAD_SIZE_BYTES_MAX: u32 = 64 * 1024;

    /// Default log size that triggers compaction (64 KB).
    pub const COMPACTION_BYTES_DEFAULT: u64 = 64 * 1024;
}
