//! Checkpoint records and the checkpoint store contract
//!
//! A [`Checkpoint`] marks the last durably processed position of a partition.
//! Writes are fenced by the writer's lease epoch: a write whose epoch is lower
//! than the stored one comes from a superseded owner and is rejected with
//! [`HostError::StaleWriter`], leaving the stored record untouched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{HostError, Result};

const STORE_NAME: &str = "checkpoint";

/// Offset marking the start of a partition's stream
pub const STREAM_START_OFFSET: &str = "-1";

/// Progress record for one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition_id: String,

    /// Opaque stream cursor of the last processed event
    pub offset: String,

    /// Numeric position matching `offset`
    pub sequence_number: i64,

    /// Lease epoch of the writer that produced this checkpoint
    pub writer_epoch: u64,
}

impl Checkpoint {
    /// Zero-valued checkpoint positioned at the stream start
    pub fn new(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            offset: STREAM_START_OFFSET.to_string(),
            sequence_number: 0,
            writer_epoch: 0,
        }
    }
}

/// Shared repository of checkpoint records
#[async_trait]
pub trait CheckpointStore: Send + Sync + Debug {
    /// Idempotently provision the backing repository
    async fn ensure_store(&self) -> Result<()>;

    /// Whether the repository has been provisioned
    async fn store_exists(&self) -> Result<bool>;

    /// Destroy all checkpoint records (full reset path)
    async fn delete_store(&self) -> Result<()>;

    /// Current record, or `None` if the partition has never been checkpointed
    ///
    /// Never creates a record.
    async fn get_checkpoint(&self, partition_id: &str) -> Result<Option<Checkpoint>>;

    /// Create a zero-valued record if absent, otherwise return the current one
    async fn ensure_checkpoint(&self, partition_id: &str) -> Result<Checkpoint>;

    /// Persist new progress if `writer_epoch >= stored writer_epoch`
    ///
    /// Returns `Err(HostError::StaleWriter)` for an outdated epoch.
    async fn update_checkpoint(
        &self,
        partition_id: &str,
        offset: &str,
        sequence_number: i64,
        writer_epoch: u64,
    ) -> Result<Checkpoint>;

    /// Remove the record entirely (reset path only)
    async fn delete_checkpoint(&self, partition_id: &str) -> Result<()>;
}

/// Statistics for a checkpoint store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointStoreStats {
    pub reads: u64,
    pub writes: u64,
    /// Writes rejected because of a stale epoch
    pub stale_writes: u64,
}

/// In-memory checkpoint store for testing and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    /// `None` until `ensure_store` is called
    checkpoints: parking_lot::Mutex<Option<HashMap<String, Checkpoint>>>,
    stats: InMemoryCheckpointStoreStats,
}

#[derive(Debug, Default)]
struct InMemoryCheckpointStoreStats {
    reads: AtomicU64,
    writes: AtomicU64,
    stale_writes: AtomicU64,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CheckpointStoreStats {
        CheckpointStoreStats {
            reads: self.stats.reads.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            stale_writes: self.stats.stale_writes.load(Ordering::Relaxed),
        }
    }

    fn not_provisioned() -> HostError {
        HostError::StoreNotProvisioned(STORE_NAME.to_string())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn ensure_store(&self) -> Result<()> {
        let mut guard = self.checkpoints.lock();
        if guard.is_none() {
            *guard = Some(HashMap::new());
        }
        Ok(())
    }

    async fn store_exists(&self) -> Result<bool> {
        Ok(self.checkpoints.lock().is_some())
    }

    async fn delete_store(&self) -> Result<()> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        *self.checkpoints.lock() = None;
        Ok(())
    }

    async fn get_checkpoint(&self, partition_id: &str) -> Result<Option<Checkpoint>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let guard = self.checkpoints.lock();
        let checkpoints = guard.as_ref().ok_or_else(Self::not_provisioned)?;
        Ok(checkpoints.get(partition_id).cloned())
    }

    async fn ensure_checkpoint(&self, partition_id: &str) -> Result<Checkpoint> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.checkpoints.lock();
        let checkpoints = guard.as_mut().ok_or_else(Self::not_provisioned)?;
        Ok(checkpoints
            .entry(partition_id.to_string())
            .or_insert_with(|| Checkpoint::new(partition_id))
            .clone())
    }

    async fn update_checkpoint(
        &self,
        partition_id: &str,
        offset: &str,
        sequence_number: i64,
        writer_epoch: u64,
    ) -> Result<Checkpoint> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.checkpoints.lock();
        let checkpoints = guard.as_mut().ok_or_else(Self::not_provisioned)?;
        let checkpoint = checkpoints
            .entry(partition_id.to_string())
            .or_insert_with(|| Checkpoint::new(partition_id));

        if writer_epoch < checkpoint.writer_epoch {
            self.stats.stale_writes.fetch_add(1, Ordering::Relaxed);
            return Err(HostError::StaleWriter {
                partition_id: partition_id.to_string(),
                writer_epoch,
                stored_epoch: checkpoint.writer_epoch,
            });
        }

        checkpoint.offset = offset.to_string();
        checkpoint.sequence_number = sequence_number;
        checkpoint.writer_epoch = writer_epoch;
        Ok(checkpoint.clone())
    }

    async fn delete_checkpoint(&self, partition_id: &str) -> Result<()> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.checkpoints.lock();
        let checkpoints = guard.as_mut().ok_or_else(Self::not_provisioned)?;
        checkpoints.remove(partition_id);
        Ok(())
    }
}

/// Checkpoint writer bound to one partition and one lease epoch
///
/// Handed to the pump on start so that intermediate progress is written under
/// the epoch the partition was acquired with.
#[derive(Debug, Clone)]
pub struct FencedCheckpointer {
    store: Arc<dyn CheckpointStore>,
    partition_id: String,
    epoch: u64,
}

impl FencedCheckpointer {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        partition_id: impl Into<String>,
        epoch: u64,
    ) -> Self {
        Self {
            store,
            partition_id: partition_id.into(),
            epoch,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Record progress, fenced by the bound epoch
    pub async fn checkpoint(&self, offset: &str, sequence_number: i64) -> Result<Checkpoint> {
        let stored = self
            .store
            .update_checkpoint(&self.partition_id, offset, sequence_number, self.epoch)
            .await?;
        debug!(
            partition_id = %self.partition_id,
            epoch = self.epoch,
            sequence_number,
            "Checkpoint written"
        );
        Ok(stored)
    }
}
