//! Ownership events, health and statistics published by a balancer

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Why a partition was lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// Another host owns the lease now
    Superseded,
    /// The lease record was deleted or cleared by someone else
    Revoked,
    /// The store could not be reached before the local expiry passed
    LocalExpiry,
}

impl std::fmt::Display for LossReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LossReason::Superseded => write!(f, "superseded"),
            LossReason::Revoked => write!(f, "revoked"),
            LossReason::LocalExpiry => write!(f, "local expiry"),
        }
    }
}

/// Change in the set of partitions owned by one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OwnershipEvent {
    /// Lease acquired (or adopted) and pump started
    Acquired { partition_id: String, epoch: u64 },
    /// Lease renewed
    Renewed {
        partition_id: String,
        epoch: u64,
        expires_at_ms: i64,
    },
    /// Lease voluntarily released after the pump was stopped
    Released { partition_id: String, epoch: u64 },
    /// Ownership lost without a voluntary release
    Lost {
        partition_id: String,
        epoch: u64,
        reason: LossReason,
    },
    /// Late renewal moved the lease to a new epoch
    EpochBumped {
        partition_id: String,
        previous: u64,
        current: u64,
    },
}

impl OwnershipEvent {
    pub fn partition_id(&self) -> &str {
        match self {
            OwnershipEvent::Acquired { partition_id, .. }
            | OwnershipEvent::Renewed { partition_id, .. }
            | OwnershipEvent::Released { partition_id, .. }
            | OwnershipEvent::Lost { partition_id, .. }
            | OwnershipEvent::EpochBumped { partition_id, .. } => partition_id,
        }
    }
}

/// Lifecycle state of a balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerState {
    Stopped,
    Running,
    Draining,
}

/// Health as seen by the host embedding the balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostHealth {
    Healthy,
    /// Several consecutive cycles failed on store errors
    Degraded { consecutive_failures: u32 },
}

impl HostHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HostHealth::Healthy)
    }
}

/// Statistics for a balancer
#[derive(Debug, Default)]
pub struct BalancerStats {
    pub cycles: AtomicU64,
    pub failed_cycles: AtomicU64,
    pub acquisitions: AtomicU64,
    /// Acquire attempts that lost the race to another host
    pub acquire_conflicts: AtomicU64,
    pub renewals: AtomicU64,
    pub epoch_bumps: AtomicU64,
    pub releases: AtomicU64,
    pub losses: AtomicU64,
    /// Store calls retried after a transient failure
    pub retries: AtomicU64,
    pub stale_checkpoints: AtomicU64,
}

impl BalancerStats {
    /// Get statistics as a snapshot
    pub fn snapshot(&self) -> BalancerStatsSnapshot {
        BalancerStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            acquire_conflicts: self.acquire_conflicts.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            epoch_bumps: self.epoch_bumps.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            losses: self.losses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            stale_checkpoints: self.stale_checkpoints.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of balancer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BalancerStatsSnapshot {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub acquisitions: u64,
    pub acquire_conflicts: u64,
    pub renewals: u64,
    pub epoch_bumps: u64,
    pub releases: u64,
    pub losses: u64,
    pub retries: u64,
    pub stale_checkpoints: u64,
}

/// Outcome of one balancing cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub acquired: Vec<String>,
    pub released: Vec<String>,
    pub lost: Vec<String>,
    pub renewed: Vec<String>,
    pub fair_share: usize,
    pub estimated_hosts: usize,
    /// Renewals that failed transiently and were kept on the local expiry
    pub failed_renewals: usize,
}

impl CycleReport {
    /// True if the owned set did not change
    pub fn is_steady(&self) -> bool {
        self.acquired.is_empty() && self.released.is_empty() && self.lost.is_empty()
    }
}
