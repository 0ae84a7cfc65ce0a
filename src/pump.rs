//! Boundary to the external partition pump
//!
//! The pump consumes events from an owned partition and invokes user
//! callbacks. The balancer only tells it when to start and stop; the pump's
//! own transport retries are outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::error::Result;
use crate::storage::{Checkpoint, FencedCheckpointer};

/// Everything a pump needs to start processing a partition
#[derive(Debug, Clone)]
pub struct PartitionAssignment {
    pub partition_id: String,

    /// Position to resume from
    pub initial: Checkpoint,

    /// Lease epoch the partition was acquired under
    pub epoch: u64,

    /// Writer for intermediate progress, fenced by `epoch`
    pub checkpointer: FencedCheckpointer,
}

/// Opaque handle to a running pump
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PumpHandle {
    pub id: u64,
    pub partition_id: String,
}

/// Final position reported by a stopped pump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    pub offset: String,
    pub sequence_number: i64,
}

impl StreamPosition {
    pub fn new(offset: impl Into<String>, sequence_number: i64) -> Self {
        Self {
            offset: offset.into(),
            sequence_number,
        }
    }
}

/// Start/stop capability consumed by the balancer
#[async_trait]
pub trait PartitionPump: Send + Sync + Debug {
    /// Begin processing a partition
    ///
    /// An error means the partition is not taken on; the balancer releases
    /// the lease it just acquired.
    async fn start(&self, assignment: PartitionAssignment) -> Result<PumpHandle>;

    /// Stop processing and report the final position to flush
    ///
    /// `None` means there is nothing to checkpoint.
    async fn stop(&self, handle: PumpHandle) -> Result<Option<StreamPosition>>;
}
