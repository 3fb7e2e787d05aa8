//! Catalog notifications.
//!
//! The first committed file in a partition directory makes that partition
//! visible to readers; a [`PartitionListener`] hears about it so it can
//! register the partition with an external catalog. Notifications that fail
//! are retried on the next write.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::{SinkError, SinkResult};

/// A partition directory that received its first committed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPartition {
    /// Topic name.
    pub topic: String,
    /// Encoded partition.
    pub encoded_partition: String,
    /// Directory holding the committed files.
    pub directory: PathBuf,
}

/// Receives new-partition notifications.
#[async_trait]
pub trait PartitionListener: Send + Sync {
    /// Called once per new partition directory.
    ///
    /// # Errors
    /// Returns an error to have the notification redelivered later.
    async fn partition_created(&self, partition: &NewPartition) -> SinkResult<()>;
}

/// Ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPartitionListener;

#[async_trait]
impl PartitionListener for NoopPartitionListener {
    async fn partition_created(&self, _partition: &NewPartition) -> SinkResult<()> {
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// InMemoryPartitionListener
// -----------------------------------------------------------------------------

/// Records notifications in memory, for testing.
///
/// Clones share the same underlying data (via `Arc`).
#[derive(Debug, Clone, Default)]
pub struct InMemoryPartitionListener {
    partitions: Arc<Mutex<Vec<NewPartition>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryPartitionListener {
    /// Creates an empty listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every notification fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the notifications received so far, in order.
    #[must_use]
    pub fn partitions(&self) -> Vec<NewPartition> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PartitionListener for InMemoryPartitionListener {
    async fn partition_created(&self, partition: &NewPartition) -> SinkResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Catalog {
                message: format!("simulated catalog failure for {}", partition.encoded_partition),
            });
        }
        self.partitions
            .lock()
            .map_err(|_| SinkError::Catalog {
                message: "partitions lock poisoned".to_string(),
            })?
            .push(partition.clone());
        Ok(())
    }
}
