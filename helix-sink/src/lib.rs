//! Helix Sink - Exactly-once partitioned file writer.
//!
//! Records arrive per topic-partition in offset order and leave as immutable
//! committed files whose names carry the offset range they hold. Files are
//! first written under a temp name, then promoted through a per-partition
//! commit log so a crash at any point leaves either the old or the new state,
//! never a duplicate or a gap.
//!
//! # Layout
//!
//! ```text
//! <topics>/<topic>/<encoded>/<topic>+<partition>+<start>+<end><ext>   committed
//! <topics>/+tmp/<topic>/<encoded>/...                               temp
//! <logs>/<topic>/<partition>/log                                    commit log
//! ```
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Durable watermark**: Upstream resumes from `watermark + 1`
//! - **Explicit time**: Every call carries `now_us`; nothing runs in the background
//! - **Isolated failures**: One failing encoded partition backs off alone
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod catalog;
pub mod config;
mod error;
pub mod format;
pub mod naming;
mod orchestrator;
pub mod partitioner;
pub mod recovery;
mod retry;
mod writer;

pub use catalog::{InMemoryPartitionListener, NewPartition, NoopPartitionListener, PartitionListener};
pub use config::{FormatKind, PartitionerKind, SinkConfig};
pub use error::{FailureKind, SinkError, SinkResult};
pub use format::{BinaryFormat, RecordFormat, RecordWriter, TextFormat};
pub use naming::FileNaming;
pub use orchestrator::{SinkWriter, WriteSummary};
pub use partitioner::{DefaultPartitioner, KeyPartitioner, Partitioner, TimeBucketPartitioner};
pub use recovery::{reconcile, LoggedWatermark, RecoveryPlan};
pub use retry::RetryState;
pub use writer::{TopicPartitionWriter, WriterContext, WriterState};
