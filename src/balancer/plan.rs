//! Pure balancing decisions
//!
//! Everything here works on a snapshot of the lease store and has no async or
//! I/O, so the fairness rules can be tested in isolation.
//!
//! Given `N` partitions and `H` visible hosts:
//!
//! - fair share is `ceil(N / H)` and floor share is `N / H`
//! - a host below fair share acquires free partitions, soonest expiry first,
//!   unless it already holds the floor share while another host is below it
//! - a host above fair share releases the excess
//! - a host at fair share releases one partition when nothing is free, some
//!   host is below floor, and it holds more than floor

use std::collections::{BTreeMap, HashSet};

use crate::host::{is_presence_key, HostName};
use crate::storage::Lease;

/// `ceil(total / hosts)`, with at least one host assumed
pub fn fair_share(total_partitions: usize, estimated_hosts: usize) -> usize {
    total_partitions.div_ceil(estimated_hosts.max(1))
}

/// `floor(total / hosts)`, with at least one host assumed
pub fn floor_share(total_partitions: usize, estimated_hosts: usize) -> usize {
    total_partitions / estimated_hosts.max(1)
}

/// What a host should do this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalancePlan {
    /// Try these partitions in order
    Acquire(Vec<String>),
    /// Give up this many partitions, most recently acquired first
    Release(usize),
    Hold,
}

/// One host's classification of a lease snapshot
#[derive(Debug, Clone)]
pub struct OwnershipView {
    host: String,
    total_partitions: usize,
    /// Active leases owned by this host, plus expired ones it still runs a pump for
    pub mine: Vec<Lease>,
    /// Unowned or expired leases
    pub free: Vec<Lease>,
    /// Active leases owned by other hosts
    pub theirs: Vec<Lease>,
    /// Partitions held by each visible host, including this one
    holdings: BTreeMap<String, usize>,
}

impl OwnershipView {
    /// Split `leases` into mine, free and theirs
    ///
    /// Only leases for `partition_ids` count as partitions. Presence leases
    /// make their owners visible without adding to any partition set. A lease
    /// owned by `host` that has expired stays in `mine` when `held` contains
    /// it, so the caller can renew it late instead of racing others for it.
    pub fn classify(
        host: &HostName,
        partition_ids: &[String],
        leases: &[Lease],
        held: &HashSet<String>,
        now_ms: i64,
    ) -> Self {
        let universe: HashSet<&str> = partition_ids.iter().map(String::as_str).collect();
        let mut view = Self {
            host: host.to_string(),
            total_partitions: universe.len(),
            mine: Vec::new(),
            free: Vec::new(),
            theirs: Vec::new(),
            holdings: BTreeMap::new(),
        };
        view.holdings.insert(view.host.clone(), 0);

        for lease in leases {
            if is_presence_key(&lease.partition_id) {
                if !lease.is_free_at(now_ms) {
                    view.holdings.entry(lease.owner.clone()).or_insert(0);
                }
                continue;
            }
            if !universe.contains(lease.partition_id.as_str()) {
                continue;
            }

            let is_mine = lease.owner == view.host
                && (!lease.is_expired_at(now_ms) || held.contains(&lease.partition_id));
            if is_mine {
                *view.holdings.entry(view.host.clone()).or_insert(0) += 1;
                view.mine.push(lease.clone());
            } else if lease.is_free_at(now_ms) {
                view.free.push(lease.clone());
            } else {
                *view.holdings.entry(lease.owner.clone()).or_insert(0) += 1;
                view.theirs.push(lease.clone());
            }
        }

        view.mine.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        view.free.sort_by(|a, b| {
            (a.expires_at_ms, &a.partition_id).cmp(&(b.expires_at_ms, &b.partition_id))
        });
        view.theirs.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        view
    }

    pub fn total_partitions(&self) -> usize {
        self.total_partitions
    }

    /// Number of distinct active owners, counting this host
    pub fn estimated_hosts(&self) -> usize {
        self.holdings.len().max(1)
    }

    pub fn fair_share(&self) -> usize {
        fair_share(self.total_partitions, self.estimated_hosts())
    }

    pub fn floor_share(&self) -> usize {
        floor_share(self.total_partitions, self.estimated_hosts())
    }

    /// Partitions held per visible host
    pub fn holdings(&self) -> &BTreeMap<String, usize> {
        &self.holdings
    }

    /// True if some other visible host holds fewer than the floor share
    pub fn another_host_starved(&self) -> bool {
        let floor = self.floor_share();
        self.holdings
            .iter()
            .any(|(owner, held)| *owner != self.host && *held < floor)
    }

    /// Decide this cycle's single direction of change
    pub fn plan(&self, max_acquire: usize, max_release: usize) -> BalancePlan {
        let mine = self.mine.len();
        let fair = self.fair_share();
        let floor = self.floor_share();

        if mine < fair {
            if mine >= floor && self.another_host_starved() {
                return BalancePlan::Hold;
            }
            let wanted = (fair - mine).min(max_acquire);
            let candidates: Vec<String> = self
                .free
                .iter()
                .take(wanted)
                .map(|lease| lease.partition_id.clone())
                .collect();
            if candidates.is_empty() {
                BalancePlan::Hold
            } else {
                BalancePlan::Acquire(candidates)
            }
        } else if mine > fair {
            BalancePlan::Release((mine - fair).min(max_release))
        } else if self.free.is_empty() && mine > floor && self.another_host_starved() {
            BalancePlan::Release(1)
        } else {
            BalancePlan::Hold
        }
    }
}
