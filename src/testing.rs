//! In-process collaborators for tests and the simulator
//!
//! - [`RecordingPump`] stands in for a real partition pump: it records every
//!   start and stop and advances a synthetic stream position.
//! - [`FlakyLeaseStore`] and [`FlakyCheckpointStore`] wrap a real store and
//!   inject outages or latency on demand.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{HostError, Result};
use crate::host::HostName;
use crate::pump::{PartitionAssignment, PartitionPump, PumpHandle, StreamPosition};
use crate::storage::{Checkpoint, CheckpointStore, FencedCheckpointer, Lease, LeaseStore};

/// Events a [`RecordingPump`] pretends to process between start and stop
const DEFAULT_EVENTS_PER_RUN: i64 = 10;

/// A recorded pump start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PumpStart {
    pub partition_id: String,
    pub epoch: u64,
    pub offset: String,
    pub sequence_number: i64,
}

/// A recorded pump stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PumpStop {
    pub partition_id: String,
    pub epoch: u64,
    pub position: StreamPosition,
}

#[derive(Debug, Clone)]
struct RunningPartition {
    handle_id: u64,
    epoch: u64,
    sequence_number: i64,
    checkpointer: FencedCheckpointer,
}

/// Pump that records what the balancer asks of it
#[derive(Debug)]
pub struct RecordingPump {
    next_handle: AtomicU64,
    events_per_run: i64,
    running: DashMap<String, RunningPartition>,
    starts: Mutex<Vec<PumpStart>>,
    stops: Mutex<Vec<PumpStop>>,
    failing_starts: DashMap<String, ()>,
}

impl Default for RecordingPump {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPump {
    pub fn new() -> Self {
        Self::with_events_per_run(DEFAULT_EVENTS_PER_RUN)
    }

    /// Pump whose stop reports `events` more than the start position
    pub fn with_events_per_run(events: i64) -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            events_per_run: events,
            running: DashMap::new(),
            starts: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            failing_starts: DashMap::new(),
        }
    }

    /// Make future starts for `partition_id` fail
    pub fn fail_starts_for(&self, partition_id: impl Into<String>) {
        self.failing_starts.insert(partition_id.into(), ());
    }

    pub fn clear_failures(&self) {
        self.failing_starts.clear();
    }

    /// Sorted identifiers of partitions currently running
    pub fn running_partitions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_running(&self, partition_id: &str) -> bool {
        self.running.contains_key(partition_id)
    }

    /// Epoch the running pump for `partition_id` was started with
    pub fn running_epoch(&self, partition_id: &str) -> Option<u64> {
        self.running.get(partition_id).map(|r| r.epoch)
    }

    pub fn starts(&self) -> Vec<PumpStart> {
        self.starts.lock().clone()
    }

    pub fn stops(&self) -> Vec<PumpStop> {
        self.stops.lock().clone()
    }

    /// Process `events` on a running partition and checkpoint through its
    /// fenced writer
    pub async fn process(&self, partition_id: &str, events: i64) -> Result<Checkpoint> {
        let (checkpointer, sequence_number) = {
            let mut running = self
                .running
                .get_mut(partition_id)
                .ok_or_else(|| {
                    HostError::Pump(format!("partition {} is not running", partition_id))
                })?;
            running.sequence_number += events;
            (running.checkpointer.clone(), running.sequence_number)
        };
        checkpointer
            .checkpoint(&sequence_number.to_string(), sequence_number)
            .await
    }
}

#[async_trait]
impl PartitionPump for RecordingPump {
    async fn start(&self, assignment: PartitionAssignment) -> Result<PumpHandle> {
        if self.failing_starts.contains_key(&assignment.partition_id) {
            return Err(HostError::Pump(format!(
                "injected start failure for partition {}",
                assignment.partition_id
            )));
        }

        let handle = PumpHandle {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            partition_id: assignment.partition_id.clone(),
        };
        self.starts.lock().push(PumpStart {
            partition_id: assignment.partition_id.clone(),
            epoch: assignment.epoch,
            offset: assignment.initial.offset.clone(),
            sequence_number: assignment.initial.sequence_number,
        });
        self.running.insert(
            assignment.partition_id,
            RunningPartition {
                handle_id: handle.id,
                epoch: assignment.epoch,
                sequence_number: assignment.initial.sequence_number,
                checkpointer: assignment.checkpointer,
            },
        );
        Ok(handle)
    }

    async fn stop(&self, handle: PumpHandle) -> Result<Option<StreamPosition>> {
        let (_, running) = self
            .running
            .remove_if(&handle.partition_id, |_, r| r.handle_id == handle.id)
            .ok_or_else(|| HostError::Pump(format!("unknown pump handle {}", handle.id)))?;

        let sequence_number = running.sequence_number + self.events_per_run;
        let position = StreamPosition::new(sequence_number.to_string(), sequence_number);
        self.stops.lock().push(PumpStop {
            partition_id: handle.partition_id,
            epoch: running.epoch,
            position: position.clone(),
        });
        Ok(Some(position))
    }
}

/// Switchable fault injection shared by the flaky store wrappers
#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl Faults {
    async fn check(&self, store: &str) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(HostError::backend(store, "injected outage"));
        }
        Ok(())
    }
}

/// Lease store wrapper that can be made unavailable or slow
#[derive(Debug)]
pub struct FlakyLeaseStore {
    inner: Arc<dyn LeaseStore>,
    faults: Faults,
}

impl FlakyLeaseStore {
    pub fn new(inner: Arc<dyn LeaseStore>) -> Self {
        Self {
            inner,
            faults: Faults::default(),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`, or remove the delay with `None`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.faults.latency.lock() = latency;
    }
}

#[async_trait]
impl LeaseStore for FlakyLeaseStore {
    async fn ensure_store(&self) -> Result<()> {
        self.faults.check("lease").await?;
        self.inner.ensure_store().await
    }

    async fn store_exists(&self) -> Result<bool> {
        self.faults.check("lease").await?;
        self.inner.store_exists().await
    }

    async fn delete_store(&self) -> Result<()> {
        self.faults.check("lease").await?;
        self.inner.delete_store().await
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        self.faults.check("lease").await?;
        self.inner.list_leases().await
    }

    async fn ensure_lease(&self, partition_id: &str) -> Result<Lease> {
        self.faults.check("lease").await?;
        self.inner.ensure_lease(partition_id).await
    }

    async fn acquire(&self, partition_id: &str, requester: &HostName) -> Result<Lease> {
        self.faults.check("lease").await?;
        self.inner.acquire(partition_id, requester).await
    }

    async fn renew(&self, partition_id: &str, requester: &HostName) -> Result<Lease> {
        self.faults.check("lease").await?;
        self.inner.renew(partition_id, requester).await
    }

    async fn release(&self, partition_id: &str, requester: &HostName) -> Result<bool> {
        self.faults.check("lease").await?;
        self.inner.release(partition_id, requester).await
    }

    async fn bump_epoch(&self, partition_id: &str, requester: &HostName) -> Result<Lease> {
        self.faults.check("lease").await?;
        self.inner.bump_epoch(partition_id, requester).await
    }

    async fn delete_lease(&self, partition_id: &str) -> Result<()> {
        self.faults.check("lease").await?;
        self.inner.delete_lease(partition_id).await
    }

    fn lease_duration(&self) -> Duration {
        self.inner.lease_duration()
    }
}

/// Checkpoint store wrapper that can be made unavailable or slow
#[derive(Debug)]
pub struct FlakyCheckpointStore {
    inner: Arc<dyn CheckpointStore>,
    faults: Faults,
}

impl FlakyCheckpointStore {
    pub fn new(inner: Arc<dyn CheckpointStore>) -> Self {
        Self {
            inner,
            faults: Faults::default(),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.faults.latency.lock() = latency;
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpointStore {
    async fn ensure_store(&self) -> Result<()> {
        self.faults.check("checkpoint").await?;
        self.inner.ensure_store().await
    }

    async fn store_exists(&self) -> Result<bool> {
        self.faults.check("checkpoint").await?;
        self.inner.store_exists().await
    }

    async fn delete_store(&self) -> Result<()> {
        self.faults.check("checkpoint").await?;
        self.inner.delete_store().await
    }

    async fn get_checkpoint(&self, partition_id: &str) -> Result<Option<Checkpoint>> {
        self.faults.check("checkpoint").await?;
        self.inner.get_checkpoint(partition_id).await
    }

    async fn ensure_checkpoint(&self, partition_id: &str) -> Result<Checkpoint> {
        self.faults.check("checkpoint").await?;
        self.inner.ensure_checkpoint(partition_id).await
    }

    async fn update_checkpoint(
        &self,
        partition_id: &str,
        offset: &str,
        sequence_number: i64,
        writer_epoch: u64,
    ) -> Result<Checkpoint> {
        self.faults.check("checkpoint").await?;
        self.inner
            .update_checkpoint(partition_id, offset, sequence_number, writer_epoch)
            .await
    }

    async fn delete_checkpoint(&self, partition_id: &str) -> Result<()> {
        self.faults.check("checkpoint").await?;
        self.inner.delete_checkpoint(partition_id).await
    }
}
