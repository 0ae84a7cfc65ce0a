//! Shared stores for lease ownership and checkpoint progress
//!
//! Both stores own their records exclusively and are independently
//! replaceable: checkpoint persistence can be swapped without touching lease
//! persistence.

pub mod checkpoint;
pub mod lease;

pub use checkpoint::{
    Checkpoint, CheckpointStore, CheckpointStoreStats, FencedCheckpointer,
    InMemoryCheckpointStore, STREAM_START_OFFSET,
};
pub use lease::{InMemoryLeaseStore, Lease, LeaseStore, LeaseStoreStats};
