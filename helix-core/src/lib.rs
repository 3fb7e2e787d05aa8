//! Helix Core - Strongly-typed identifiers and record types for the sink.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up `FileId` with `PartitionId`
//! - **Explicit types**: Use u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod record;
mod types;

pub use record::{Offset, SinkRecord, Timestamp};
pub use types::{FileId, PartitionId, TopicPartition};
