#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # partition-host
//!
//! Lease-based partition ownership for a fleet of stream consumers.
//!
//! Every host runs a [`PartitionBalancer`]. Hosts never talk to each other:
//! they coordinate only through a shared [`LeaseStore`], whose atomic
//! acquire is the single mutual-exclusion primitive, and a shared
//! [`CheckpointStore`], whose writes are fenced by the lease epoch so a
//! superseded owner can never overwrite its successor's progress.
//!
//! ## Guarantees
//!
//! - **At most one owner**: a live lease is never taken by another host
//! - **Full coverage**: free and expired leases are picked up every cycle
//! - **Fairness**: hosts converge to `floor(N/H)` or `ceil(N/H)` partitions
//! - **Fencing**: checkpoint writes carrying an older epoch are rejected
//!
//! ## Quick Start
//!
//! ```no_run
//! use partition_host::storage::{InMemoryCheckpointStore, InMemoryLeaseStore};
//! use partition_host::testing::RecordingPump;
//! use partition_host::{BalancerConfig, HostName, PartitionBalancer, Result, StaticPartitions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = BalancerConfig::default();
//!     let leases = Arc::new(InMemoryLeaseStore::new(config.lease_duration()));
//!     let checkpoints = Arc::new(InMemoryCheckpointStore::new());
//!
//!     let balancer = Arc::new(PartitionBalancer::new(
//!         HostName::new("host-a")?,
//!         config,
//!         leases,
//!         checkpoints,
//!         Arc::new(RecordingPump::new()),
//!         Arc::new(StaticPartitions::count(8)),
//!     )?);
//!
//!     balancer.start()?;
//!     tokio::signal::ctrl_c().await?;
//!     balancer.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: lease and checkpoint store contracts with in-memory backends
//! - [`balancer`]: the per-host balancing loop and its pure planner
//! - [`pump`] and [`discovery`]: boundaries to the stream consumer
//! - [`config`]: configuration file, CLI and presets
//! - [`testing`]: recording pump and fault-injecting store wrappers

pub mod balancer;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod host;
pub mod logging;
pub mod pump;
pub mod storage;
pub mod testing;

pub use balancer::{
    BalancerState, BalancerStatsSnapshot, CycleReport, HostHealth, LossReason, OwnershipEvent,
    PartitionBalancer,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::BalancerConfig;
pub use discovery::{PartitionDiscovery, StaticPartitions};
pub use error::{ConfigError, HostError, Result};
pub use host::{HostName, PRESENCE_PREFIX};
pub use logging::init_logging;
pub use pump::{PartitionAssignment, PartitionPump, PumpHandle, StreamPosition};
pub use storage::{
    Checkpoint, CheckpointStore, FencedCheckpointer, InMemoryCheckpointStore, InMemoryLeaseStore,
    Lease, LeaseStore, STREAM_START_OFFSET,
};
