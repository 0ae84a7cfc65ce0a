//! Partition balancer
//!
//! One [`PartitionBalancer`] runs per host. Each cycle it reads the lease
//! table, renews what it owns, and moves its owned set one step toward the
//! fair share by either acquiring free partitions or releasing excess ones.
//! Hosts never talk to each other; the lease store's compare-and-swap is the
//! only coordination.
//!
//! ## Lifecycle
//!
//! ```text
//! Stopped --start()--> Running --shutdown()--> Draining --> Stopped
//!                         |
//!                         +------abort()------------------> Stopped
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let balancer = Arc::new(PartitionBalancer::new(
//!     HostName::new("host-a")?,
//!     BalancerConfig::default(),
//!     lease_store,
//!     checkpoint_store,
//!     pump,
//!     Arc::new(StaticPartitions::count(8)),
//! )?);
//! balancer.start()?;
//! // ...
//! balancer.shutdown().await;
//! ```

pub mod events;
pub mod plan;
mod retry;

pub use events::{
    BalancerState, BalancerStats, BalancerStatsSnapshot, CycleReport, HostHealth, LossReason,
    OwnershipEvent,
};
pub use plan::{fair_share, floor_share, BalancePlan, OwnershipView};

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::{system_clock, Clock};
use crate::config::BalancerConfig;
use crate::discovery::PartitionDiscovery;
use crate::error::{HostError, Result};
use crate::host::HostName;
use crate::pump::{PartitionAssignment, PartitionPump, PumpHandle};
use crate::storage::{Checkpoint, CheckpointStore, FencedCheckpointer, Lease, LeaseStore};
use retry::RetryPolicy;

/// Capacity of the ownership event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A partition this host is running a pump for
#[derive(Debug)]
struct OwnedPartition {
    epoch: u64,
    handle: PumpHandle,
    /// Acquisition order, higher is more recent
    acquired_seq: u64,
    /// Expiry returned by the last successful acquire or renew
    expires_at_ms: i64,
}

impl OwnedPartition {
    /// Whether the lease runs out within `margin_ms` of `now_ms`
    fn expiring_within(&self, now_ms: i64, margin_ms: i64) -> bool {
        self.expires_at_ms - margin_ms <= now_ms
    }
}

/// Balances partition ownership for one host
pub struct PartitionBalancer {
    host: HostName,
    config: BalancerConfig,
    lease_store: Arc<dyn LeaseStore>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    pump: Arc<dyn PartitionPump>,
    discovery: Arc<dyn PartitionDiscovery>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,

    /// Owned partitions; held for a whole cycle so cycles never overlap
    owned: tokio::sync::Mutex<HashMap<String, OwnedPartition>>,

    /// Partition to epoch, readable without waiting for a cycle
    published: DashMap<String, u64>,

    provisioned: AtomicBool,
    acquire_seq: AtomicU64,
    consecutive_failures: AtomicU32,

    state_tx: watch::Sender<BalancerState>,
    health_tx: watch::Sender<HostHealth>,
    shutdown_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<OwnershipEvent>,
    loop_task: Mutex<Option<JoinHandle<()>>>,

    stats: BalancerStats,
}

impl std::fmt::Debug for PartitionBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionBalancer")
            .field("host", &self.host)
            .field("state", &self.state())
            .field("owned", &self.owned_partitions())
            .finish()
    }
}

impl PartitionBalancer {
    /// Create a balancer; the configuration is validated here
    pub fn new(
        host: HostName,
        config: BalancerConfig,
        lease_store: Arc<dyn LeaseStore>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        pump: Arc<dyn PartitionPump>,
        discovery: Arc<dyn PartitionDiscovery>,
    ) -> Result<Self> {
        config.validate()?;
        if lease_store.lease_duration() != config.lease_duration() {
            warn!(
                host = %host,
                store_lease_ms = lease_store.lease_duration().as_millis() as u64,
                config_lease_ms = config.lease_duration_ms,
                "Lease store and balancer disagree on lease duration"
            );
        }

        let (state_tx, _) = watch::channel(BalancerState::Stopped);
        let (health_tx, _) = watch::channel(HostHealth::Healthy);
        let (shutdown_tx, _) = watch::channel(false);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            host,
            retry: RetryPolicy::from_config(&config),
            config,
            lease_store,
            checkpoint_store,
            pump,
            discovery,
            clock: system_clock(),
            owned: tokio::sync::Mutex::new(HashMap::new()),
            published: DashMap::new(),
            provisioned: AtomicBool::new(false),
            acquire_seq: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            state_tx,
            health_tx,
            shutdown_tx,
            event_tx,
            loop_task: Mutex::new(None),
            stats: BalancerStats::default(),
        })
    }

    /// Use `clock` for expiry decisions instead of the system clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn host(&self) -> &HostName {
        &self.host
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn state(&self) -> BalancerState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<BalancerState> {
        self.state_tx.subscribe()
    }

    pub fn health(&self) -> HostHealth {
        *self.health_tx.borrow()
    }

    pub fn watch_health(&self) -> watch::Receiver<HostHealth> {
        self.health_tx.subscribe()
    }

    /// Subscribe to ownership changes
    pub fn subscribe(&self) -> broadcast::Receiver<OwnershipEvent> {
        self.event_tx.subscribe()
    }

    pub fn stats(&self) -> BalancerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Sorted identifiers of the partitions this host runs pumps for
    pub fn owned_partitions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.published.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Epoch this host holds `partition_id` under
    pub fn owned_epoch(&self, partition_id: &str) -> Option<u64> {
        self.published.get(partition_id).map(|e| *e.value())
    }

    /// Spawn the balancing loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.state() == BalancerState::Draining {
            return Err(HostError::ShuttingDown);
        }
        let mut task = self.loop_task.lock();
        if task.is_some() {
            warn!(host = %self.host, "Balancing loop already running");
            return Ok(());
        }

        info!(
            host = %self.host,
            lease_duration_ms = self.config.lease_duration_ms,
            balance_interval_ms = self.config.balance_interval().as_millis() as u64,
            "Starting partition balancer"
        );

        self.shutdown_tx.send_replace(false);
        self.state_tx.send_replace(BalancerState::Running);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let balancer = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            balancer.run_loop(shutdown_rx).await;
        }));
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.balance_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_rx.changed() => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                debug!(host = %self.host, error = %e, "Cycle ended with error");
            }
        }

        debug!(host = %self.host, "Balancing loop exited");
    }

    /// Stop the loop, then release every owned partition within the drain
    /// timeout. Leases left unreleased when the timeout fires simply expire.
    pub async fn shutdown(&self) {
        if self.state() == BalancerState::Draining {
            return;
        }
        info!(host = %self.host, "Draining partition balancer");
        self.state_tx.send_replace(BalancerState::Draining);
        self.shutdown_tx.send_replace(true);

        let mut task = self.loop_task.lock().take();
        let drain_timeout = self.config.drain_timeout();
        let drained = tokio::time::timeout(drain_timeout, async {
            if let Some(handle) = task.as_mut() {
                if let Err(e) = handle.await {
                    warn!(host = %self.host, error = %e, "Balancing loop did not exit cleanly");
                }
            }
            self.drain().await
        })
        .await;

        match drained {
            Ok(released) => {
                info!(host = %self.host, released, "Partition balancer drained");
            }
            Err(_) => {
                warn!(
                    host = %self.host,
                    timeout_ms = drain_timeout.as_millis() as u64,
                    "Drain timed out; remaining leases will expire"
                );
                if let Some(handle) = task {
                    handle.abort();
                }
                self.stop_remaining().await;
            }
        }

        self.state_tx.send_replace(BalancerState::Stopped);
    }

    /// Stop the loop without releasing anything, as if the process died
    ///
    /// Pumps are not stopped and leases are left to expire.
    pub async fn abort(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.loop_task.lock().take();
        if let Some(handle) = task {
            handle.abort();
        }
        self.forget_all().await;
        self.state_tx.send_replace(BalancerState::Stopped);
        warn!(host = %self.host, "Partition balancer aborted");
    }

    /// Run exactly one balancing cycle
    ///
    /// Cycles can be driven by hand on a balancer that was never started.
    /// After `shutdown()` or `abort()` they are refused with
    /// [`HostError::ShuttingDown`] until `start()` is called again.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        if *self.shutdown_tx.borrow() {
            return Err(HostError::ShuttingDown);
        }

        let mut owned = self.owned.lock().await;
        let deadline = Instant::now() + self.config.balance_interval();
        BalancerStats::incr(&self.stats.cycles);

        match self.balance(&mut owned, deadline).await {
            Ok(report) => {
                if report.failed_renewals > 0 {
                    self.record_failure(&format!("{} renewals failed", report.failed_renewals));
                } else {
                    self.record_success();
                }
                debug!(
                    host = %self.host,
                    owned = owned.len(),
                    fair_share = report.fair_share,
                    estimated_hosts = report.estimated_hosts,
                    acquired = report.acquired.len(),
                    released = report.released.len(),
                    lost = report.lost.len(),
                    "Cycle complete"
                );
                Ok(report)
            }
            Err(e) => {
                if matches!(e, HostError::StoreNotProvisioned(_)) {
                    self.provisioned.store(false, Ordering::Release);
                }
                self.demote_locally_expired(&mut owned).await;
                self.record_failure(&e.to_string());
                Err(e)
            }
        }
    }

    async fn balance(
        &self,
        owned: &mut HashMap<String, OwnedPartition>,
        deadline: Instant,
    ) -> Result<CycleReport> {
        self.provision(deadline).await?;

        let discovery = &self.discovery;
        let partition_ids = self
            .call("partition_ids", deadline, || discovery.partition_ids())
            .await?;
        let leases = self.snapshot(&partition_ids, deadline).await?;

        let held: HashSet<String> = owned.keys().cloned().collect();
        let now_ms = self.clock.now_ms();
        let mut view = OwnershipView::classify(&self.host, &partition_ids, &leases, &held, now_ms);
        let mut report = CycleReport {
            fair_share: view.fair_share(),
            estimated_hosts: view.estimated_hosts(),
            ..CycleReport::default()
        };

        // Pumps for partitions the store no longer shows as ours
        let mine: HashSet<&str> = view.mine.iter().map(|l| l.partition_id.as_str()).collect();
        let gone: Vec<String> = owned
            .keys()
            .filter(|p| !mine.contains(p.as_str()))
            .cloned()
            .collect();
        for partition_id in gone {
            let reason = match leases.iter().find(|l| l.partition_id == partition_id) {
                Some(lease) if !lease.owner.is_empty() => LossReason::Superseded,
                _ => LossReason::Revoked,
            };
            self.lose(owned, &partition_id, reason, deadline).await;
            report.lost.push(partition_id);
        }

        for lease in &view.mine {
            self.renew_owned(owned, lease, deadline, &mut report).await?;
        }
        view.mine.retain(|l| owned.contains_key(&l.partition_id));

        match view.plan(self.config.max_acquire_per_cycle, self.config.max_release_per_cycle) {
            BalancePlan::Acquire(candidates) => {
                for partition_id in candidates {
                    if *self.shutdown_tx.borrow() {
                        break;
                    }
                    self.acquire_partition(owned, &partition_id, deadline, &mut report)
                        .await?;
                }
            }
            BalancePlan::Release(count) => {
                let mut newest: Vec<(u64, String)> = owned
                    .iter()
                    .map(|(id, p)| (p.acquired_seq, id.clone()))
                    .collect();
                newest.sort_by(|a, b| b.cmp(a));
                for (_, partition_id) in newest.into_iter().take(count) {
                    info!(
                        host = %self.host,
                        partition_id = %partition_id,
                        fair_share = report.fair_share,
                        "Releasing partition to rebalance"
                    );
                    self.release_partition(owned, &partition_id, deadline).await;
                    report.released.push(partition_id);
                }
            }
            BalancePlan::Hold => {}
        }

        Ok(report)
    }

    /// Create both stores once; repeated after a store reports it is missing
    async fn provision(&self, deadline: Instant) -> Result<()> {
        if self.provisioned.load(Ordering::Acquire) {
            return Ok(());
        }
        let lease_store = &self.lease_store;
        let checkpoint_store = &self.checkpoint_store;
        self.call("ensure_lease_store", deadline, || lease_store.ensure_store())
            .await?;
        self.call("ensure_checkpoint_store", deadline, || {
            checkpoint_store.ensure_store()
        })
        .await?;
        self.provisioned.store(true, Ordering::Release);
        debug!(host = %self.host, "Stores provisioned");
        Ok(())
    }

    /// List leases, create missing ones, and refresh this host's presence
    async fn snapshot(&self, partition_ids: &[String], deadline: Instant) -> Result<Vec<Lease>> {
        let store = &self.lease_store;
        let host = &self.host;
        let mut leases = self.call("list_leases", deadline, || store.list_leases()).await?;

        let known: HashSet<String> = leases.iter().map(|l| l.partition_id.clone()).collect();
        for partition_id in partition_ids.iter().filter(|p| !known.contains(*p)) {
            let lease = self
                .call("ensure_lease", deadline, || store.ensure_lease(partition_id))
                .await?;
            debug!(
                host = %self.host,
                partition_id = %partition_id,
                "Created lease for new partition"
            );
            leases.push(lease);
        }

        let presence_key = host.presence_key();
        if !known.contains(&presence_key) {
            self.call("ensure_lease", deadline, || store.ensure_lease(&presence_key))
                .await?;
        }
        match self
            .call("acquire_presence", deadline, || store.acquire(&presence_key, host))
            .await
        {
            Ok(presence) => {
                leases.retain(|l| l.partition_id != presence_key);
                leases.push(presence);
            }
            Err(e) if e.is_partition_scoped() => {
                warn!(
                    host = %self.host,
                    error = %e,
                    "Presence lease is held by another process with the same host name"
                );
            }
            Err(e) => return Err(e),
        }

        Ok(leases)
    }

    async fn renew_owned(
        &self,
        owned: &mut HashMap<String, OwnedPartition>,
        lease: &Lease,
        deadline: Instant,
        report: &mut CycleReport,
    ) -> Result<()> {
        let partition_id = lease.partition_id.as_str();
        let store = &self.lease_store;
        let host = &self.host;
        let now_ms = self.clock.now_ms();

        let local = owned.get(partition_id).map(|p| (p.epoch, p.expires_at_ms));
        match local {
            None => {
                // Listed as ours without a pump, e.g. after a restart under the same name
                match self.call("renew", deadline, || store.renew(partition_id, host)).await {
                    Ok(renewed) => {
                        info!(
                            host = %self.host,
                            partition_id,
                            epoch = renewed.epoch,
                            "Adopting owned partition"
                        );
                        self.take_on(owned, &renewed, None, deadline, report).await;
                        Ok(())
                    }
                    Err(e) => self.renew_failed(owned, partition_id, e, deadline, report).await,
                }
            }
            Some((previous, expires_at_ms)) if expires_at_ms < now_ms => {
                // Others may have seen the lease as free; move to a new epoch
                match self
                    .call("bump_epoch", deadline, || store.bump_epoch(partition_id, host))
                    .await
                {
                    Ok(bumped) => {
                        warn!(
                            host = %self.host,
                            partition_id,
                            previous,
                            current = bumped.epoch,
                            "Late renewal, restarting pump under new epoch"
                        );
                        BalancerStats::incr(&self.stats.epoch_bumps);
                        self.emit(OwnershipEvent::EpochBumped {
                            partition_id: partition_id.to_string(),
                            previous,
                            current: bumped.epoch,
                        });
                        if let Some(entry) = self.untrack(owned, partition_id) {
                            self.stop_and_flush(partition_id, entry.handle, entry.epoch, deadline)
                                .await;
                            self.take_on(owned, &bumped, Some(entry.acquired_seq), deadline, report)
                                .await;
                        }
                        report.renewed.push(partition_id.to_string());
                        Ok(())
                    }
                    Err(e) => self.renew_failed(owned, partition_id, e, deadline, report).await,
                }
            }
            Some(_) => match self
                .call("renew", deadline, || store.renew(partition_id, host))
                .await
            {
                Ok(renewed) => {
                    if let Some(entry) = owned.get_mut(partition_id) {
                        entry.expires_at_ms = renewed.expires_at_ms;
                    }
                    BalancerStats::incr(&self.stats.renewals);
                    self.emit(OwnershipEvent::Renewed {
                        partition_id: partition_id.to_string(),
                        epoch: renewed.epoch,
                        expires_at_ms: renewed.expires_at_ms,
                    });
                    report.renewed.push(partition_id.to_string());
                    Ok(())
                }
                Err(e) => self.renew_failed(owned, partition_id, e, deadline, report).await,
            },
        }
    }

    async fn renew_failed(
        &self,
        owned: &mut HashMap<String, OwnedPartition>,
        partition_id: &str,
        error: HostError,
        deadline: Instant,
        report: &mut CycleReport,
    ) -> Result<()> {
        if error.is_partition_scoped() {
            let reason = match &error {
                HostError::LeaseNotFound(_) => LossReason::Revoked,
                _ => LossReason::Superseded,
            };
            if owned.contains_key(partition_id) {
                self.lose(owned, partition_id, reason, deadline).await;
                report.lost.push(partition_id.to_string());
            }
            return Ok(());
        }
        if !error.is_retriable() {
            return Err(error);
        }

        report.failed_renewals += 1;
        let now_ms = self.clock.now_ms();
        let margin_ms = self.expiry_margin_ms();
        let expiring = owned
            .get(partition_id)
            .is_some_and(|p| p.expiring_within(now_ms, margin_ms));
        if expiring {
            self.lose(owned, partition_id, LossReason::LocalExpiry, deadline)
                .await;
            report.lost.push(partition_id.to_string());
        } else {
            warn!(
                host = %self.host,
                partition_id,
                error = %error,
                "Renew failed, keeping partition until local expiry"
            );
        }
        Ok(())
    }

    async fn acquire_partition(
        &self,
        owned: &mut HashMap<String, OwnedPartition>,
        partition_id: &str,
        deadline: Instant,
        report: &mut CycleReport,
    ) -> Result<()> {
        let store = &self.lease_store;
        let host = &self.host;
        match self
            .call("acquire", deadline, || store.acquire(partition_id, host))
            .await
        {
            Ok(lease) => {
                self.take_on(owned, &lease, None, deadline, report).await;
                Ok(())
            }
            Err(HostError::LeaseHeldByOther { owner, .. }) => {
                debug!(host = %self.host, partition_id, owner = %owner, "Lost acquire race");
                BalancerStats::incr(&self.stats.acquire_conflicts);
                Ok(())
            }
            Err(e) if e.is_partition_scoped() => {
                debug!(host = %self.host, partition_id, error = %e, "Acquire skipped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Claim the checkpoint and start a pump for a lease this host now holds
    ///
    /// On failure the lease is released again so another host can take it.
    async fn take_on(
        &self,
        owned: &mut HashMap<String, OwnedPartition>,
        lease: &Lease,
        acquired_seq: Option<u64>,
        deadline: Instant,
        report: &mut CycleReport,
    ) {
        let partition_id = lease.partition_id.as_str();
        let started = match self.claim_checkpoint(partition_id, lease.epoch, deadline).await {
            Ok(initial) => {
                let assignment = PartitionAssignment {
                    partition_id: partition_id.to_string(),
                    initial,
                    epoch: lease.epoch,
                    checkpointer: FencedCheckpointer::new(
                        Arc::clone(&self.checkpoint_store),
                        partition_id,
                        lease.epoch,
                    ),
                };
                self.pump.start(assignment).await
            }
            Err(e) => Err(e),
        };

        match started {
            Ok(handle) => {
                let fresh = acquired_seq.is_none();
                let acquired_seq = acquired_seq
                    .unwrap_or_else(|| self.acquire_seq.fetch_add(1, Ordering::Relaxed));
                self.track(
                    owned,
                    partition_id,
                    OwnedPartition {
                        epoch: lease.epoch,
                        handle,
                        acquired_seq,
                        expires_at_ms: lease.expires_at_ms,
                    },
                );
                if fresh {
                    info!(
                        host = %self.host,
                        partition_id,
                        epoch = lease.epoch,
                        "Acquired partition"
                    );
                    BalancerStats::incr(&self.stats.acquisitions);
                    self.emit(OwnershipEvent::Acquired {
                        partition_id: partition_id.to_string(),
                        epoch: lease.epoch,
                    });
                    report.acquired.push(partition_id.to_string());
                }
            }
            Err(e) => {
                warn!(
                    host = %self.host,
                    partition_id,
                    error = %e,
                    "Could not start partition, releasing lease"
                );
                self.release_lease(partition_id, deadline).await;
                if acquired_seq.is_some() {
                    BalancerStats::incr(&self.stats.releases);
                    self.emit(OwnershipEvent::Released {
                        partition_id: partition_id.to_string(),
                        epoch: lease.epoch,
                    });
                    report.released.push(partition_id.to_string());
                }
            }
        }
    }

    /// Re-write the current checkpoint under `epoch` so a previous owner's
    /// late writes are fenced out before the new pump starts
    async fn claim_checkpoint(
        &self,
        partition_id: &str,
        epoch: u64,
        deadline: Instant,
    ) -> Result<Checkpoint> {
        let store = &self.checkpoint_store;
        let current = match self
            .call("get_checkpoint", deadline, || store.get_checkpoint(partition_id))
            .await?
        {
            Some(checkpoint) => checkpoint,
            None => {
                self.call("ensure_checkpoint", deadline, || {
                    store.ensure_checkpoint(partition_id)
                })
                .await?
            }
        };

        match self
            .call("claim_checkpoint", deadline, || {
                store.update_checkpoint(
                    partition_id,
                    &current.offset,
                    current.sequence_number,
                    epoch,
                )
            })
            .await
        {
            Ok(claimed) => Ok(claimed),
            Err(HostError::StaleWriter { stored_epoch, .. }) => {
                warn!(
                    host = %self.host,
                    partition_id,
                    epoch,
                    stored_epoch,
                    "Checkpoint carries a newer epoch than the lease; starting anyway"
                );
                BalancerStats::incr(&self.stats.stale_checkpoints);
                Ok(current)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the pump, flush its final position, then release the lease
    async fn release_partition(
        &self,
        owned: &mut HashMap<String, OwnedPartition>,
        partition_id: &str,
        deadline: Instant,
    ) {
        let Some(entry) = self.untrack(owned, partition_id) else {
            return;
        };
        self.stop_and_flush(partition_id, entry.handle, entry.epoch, deadline)
            .await;
        self.release_lease(partition_id, deadline).await;
        BalancerStats::incr(&self.stats.releases);
        self.emit(OwnershipEvent::Released {
            partition_id: partition_id.to_string(),
            epoch: entry.epoch,
        });
    }

    async fn release_lease(&self, partition_id: &str, deadline: Instant) {
        let store = &self.lease_store;
        let host = &self.host;
        match self
            .call("release", deadline, || store.release(partition_id, host))
            .await
        {
            Ok(true) => debug!(host = %self.host, partition_id, "Lease released"),
            Ok(false) => debug!(
                host = %self.host,
                partition_id,
                "Lease no longer ours, nothing to release"
            ),
            Err(e) => warn!(
                host = %self.host,
                partition_id,
                error = %e,
                "Release failed; lease will expire"
            ),
        }
    }

    /// Demote a partition without releasing its lease
    async fn lose(
        &self,
        owned: &mut HashMap<String, OwnedPartition>,
        partition_id: &str,
        reason: LossReason,
        deadline: Instant,
    ) {
        let Some(entry) = self.untrack(owned, partition_id) else {
            return;
        };
        warn!(
            host = %self.host,
            partition_id,
            epoch = entry.epoch,
            reason = %reason,
            "Partition lost"
        );
        self.stop_and_flush(partition_id, entry.handle, entry.epoch, deadline)
            .await;
        BalancerStats::incr(&self.stats.losses);
        self.emit(OwnershipEvent::Lost {
            partition_id: partition_id.to_string(),
            epoch: entry.epoch,
            reason,
        });
    }

    /// Stop a pump and write its final position fenced by `epoch`
    async fn stop_and_flush(
        &self,
        partition_id: &str,
        handle: PumpHandle,
        epoch: u64,
        deadline: Instant,
    ) {
        let position = match self.pump.stop(handle).await {
            Ok(Some(position)) => position,
            Ok(None) => return,
            Err(e) => {
                warn!(host = %self.host, partition_id, error = %e, "Pump did not stop cleanly");
                return;
            }
        };

        let store = &self.checkpoint_store;
        match self
            .call("flush_checkpoint", deadline, || {
                store.update_checkpoint(
                    partition_id,
                    &position.offset,
                    position.sequence_number,
                    epoch,
                )
            })
            .await
        {
            Ok(_) => debug!(
                host = %self.host,
                partition_id,
                epoch,
                sequence_number = position.sequence_number,
                "Final checkpoint flushed"
            ),
            Err(HostError::StaleWriter { stored_epoch, .. }) => {
                BalancerStats::incr(&self.stats.stale_checkpoints);
                info!(
                    host = %self.host,
                    partition_id,
                    epoch,
                    stored_epoch,
                    "Final checkpoint fenced out by newer owner"
                );
            }
            Err(e) => {
                warn!(host = %self.host, partition_id, error = %e, "Final checkpoint flush failed");
            }
        }
    }

    /// Demote every partition whose lease could lapse before the next cycle
    async fn demote_locally_expired(&self, owned: &mut HashMap<String, OwnedPartition>) {
        let now_ms = self.clock.now_ms();
        let margin_ms = self.expiry_margin_ms();
        let expired: Vec<String> = owned
            .iter()
            .filter(|(_, p)| p.expiring_within(now_ms, margin_ms))
            .map(|(id, _)| id.clone())
            .collect();
        let deadline = Instant::now() + self.config.store_call_timeout();
        for partition_id in expired {
            self.lose(owned, &partition_id, LossReason::LocalExpiry, deadline)
                .await;
        }
    }

    /// Release every owned partition and the presence lease
    async fn drain(&self) -> usize {
        let mut owned = self.owned.lock().await;
        let deadline = Instant::now() + self.config.drain_timeout();

        let mut ids: Vec<String> = owned.keys().cloned().collect();
        ids.sort();
        for partition_id in &ids {
            self.release_partition(&mut owned, partition_id, deadline)
                .await;
        }

        let store = &self.lease_store;
        let host = &self.host;
        let presence_key = host.presence_key();
        if let Err(e) = self
            .call("release_presence", deadline, || store.release(&presence_key, host))
            .await
        {
            debug!(host = %self.host, error = %e, "Presence lease not released");
        }
        ids.len()
    }

    /// Stop the pumps a timed out drain left behind, without flushing or
    /// releasing; their leases expire on their own
    async fn stop_remaining(&self) {
        let mut owned = self.owned.lock().await;
        let stop_timeout = self.config.store_call_timeout();
        for (partition_id, entry) in owned.drain() {
            self.published.remove(&partition_id);
            let partition_id = partition_id.as_str();
            match tokio::time::timeout(stop_timeout, self.pump.stop(entry.handle)).await {
                Ok(Ok(_)) => debug!(host = %self.host, partition_id, "Pump stopped without flush"),
                Ok(Err(e)) => {
                    warn!(host = %self.host, partition_id, error = %e, "Pump did not stop cleanly")
                }
                Err(_) => warn!(
                    host = %self.host,
                    partition_id,
                    timeout_ms = stop_timeout.as_millis() as u64,
                    "Pump stop timed out"
                ),
            }
        }
        self.published.clear();
    }

    async fn forget_all(&self) {
        let mut owned = self.owned.lock().await;
        owned.clear();
        self.published.clear();
    }

    /// How long before local expiry an unrenewed partition is given up
    fn expiry_margin_ms(&self) -> i64 {
        self.config.balance_interval().as_millis() as i64
    }

    fn track(
        &self,
        owned: &mut HashMap<String, OwnedPartition>,
        partition_id: &str,
        entry: OwnedPartition,
    ) {
        self.published.insert(partition_id.to_string(), entry.epoch);
        owned.insert(partition_id.to_string(), entry);
    }

    fn untrack(
        &self,
        owned: &mut HashMap<String, OwnedPartition>,
        partition_id: &str,
    ) -> Option<OwnedPartition> {
        self.published.remove(partition_id);
        owned.remove(partition_id)
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        deadline: Instant,
        call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry
            .run(operation, deadline, || BalancerStats::incr(&self.stats.retries), call)
            .await
    }

    fn emit(&self, event: OwnershipEvent) {
        let _ = self.event_tx.send(event);
    }

    fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
        if previous == 0 {
            return;
        }
        if !self.health().is_healthy() {
            info!(host = %self.host, previous_failures = previous, "Balancer healthy again");
        }
        self.health_tx.send_replace(HostHealth::Healthy);
    }

    fn record_failure(&self, reason: &str) {
        BalancerStats::incr(&self.stats.failed_cycles);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(host = %self.host, consecutive_failures = failures, reason, "Balancing cycle failed");
        if failures >= self.config.degraded_after_failed_cycles {
            self.health_tx.send_replace(HostHealth::Degraded {
                consecutive_failures: failures,
            });
        }
    }
}
