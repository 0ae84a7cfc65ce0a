//! Shared test fixtures for partition-host integration tests
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```
//!
//! - `TestCluster`: shared stores plus a manual clock
//! - `TestHost`: a balancer with its recording pump
//! - Helpers to run cycles in rounds and inspect ownership

#![allow(dead_code)]

use partition_host::storage::{
    CheckpointStore, InMemoryCheckpointStore, InMemoryLeaseStore, LeaseStore,
};
use partition_host::testing::RecordingPump;
use partition_host::{
    BalancerConfig, Clock, HostName, ManualClock, PartitionBalancer, StaticPartitions,
    PRESENCE_PREFIX,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Stores and clock shared by every host in a test
pub struct TestCluster {
    pub clock: ManualClock,
    pub config: BalancerConfig,
    pub leases: Arc<InMemoryLeaseStore>,
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    pub partitions: u32,
}

/// One balancer and its pump
pub struct TestHost {
    pub balancer: Arc<PartitionBalancer>,
    pub pump: Arc<RecordingPump>,
}

impl TestHost {
    pub fn name(&self) -> String {
        self.balancer.host().to_string()
    }

    pub fn owned(&self) -> Vec<String> {
        self.balancer.owned_partitions()
    }
}

impl TestCluster {
    pub fn new(partitions: u32) -> Self {
        Self::with_config(partitions, BalancerConfig::for_testing())
    }

    pub fn with_config(partitions: u32, config: BalancerConfig) -> Self {
        let clock = ManualClock::default();
        let leases = Arc::new(InMemoryLeaseStore::with_clock(
            config.lease_duration(),
            Arc::new(clock.clone()),
        ));
        Self {
            clock,
            config,
            leases,
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            partitions,
        }
    }

    /// A host on the cluster's shared stores
    pub fn host(&self, name: &str) -> TestHost {
        self.host_with_stores(name, self.leases.clone(), self.checkpoints.clone())
    }

    /// A host on custom stores, e.g. fault-injecting wrappers
    pub fn host_with_stores(
        &self,
        name: &str,
        lease_store: Arc<dyn LeaseStore>,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> TestHost {
        let pump = Arc::new(RecordingPump::new());
        let balancer = PartitionBalancer::new(
            HostName::new(name).unwrap(),
            self.config.clone(),
            lease_store,
            checkpoint_store,
            pump.clone(),
            Arc::new(StaticPartitions::count(self.partitions)),
        )
        .unwrap()
        .with_clock(Arc::new(self.clock.clone()));
        TestHost {
            balancer: Arc::new(balancer),
            pump,
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.balance_interval()
    }

    /// Run one cycle on every host in order, then advance the clock by one
    /// balance interval
    pub async fn round(&self, hosts: &[&TestHost]) {
        for host in hosts {
            let _ = host.balancer.run_cycle().await;
        }
        self.clock.advance(self.interval());
    }

    /// Run rounds until ownership is fair and complete, returning the number
    /// of rounds it took
    pub async fn settle(&self, hosts: &[&TestHost], max_rounds: usize) -> Option<usize> {
        for round in 1..=max_rounds {
            self.round(hosts).await;
            if self.is_fair(hosts.len()).await {
                return Some(round);
            }
        }
        None
    }

    /// Live owner per partition; free partitions are absent
    pub async fn owners(&self) -> BTreeMap<String, String> {
        let now = self.clock.now_ms();
        self.leases
            .list_leases()
            .await
            .unwrap()
            .into_iter()
            .filter(|l| !l.partition_id.starts_with(PRESENCE_PREFIX) && !l.is_free_at(now))
            .map(|l| (l.partition_id, l.owner))
            .collect()
    }

    /// Number of live partitions per owner
    pub async fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for owner in self.owners().await.into_values() {
            *counts.entry(owner).or_insert(0) += 1;
        }
        counts
    }

    /// Every partition owned and every one of `hosts` holds floor or ceil
    pub async fn is_fair(&self, hosts: usize) -> bool {
        let total = self.partitions as usize;
        let owners = self.owners().await;
        if owners.len() != total {
            return false;
        }
        let counts = self.counts().await;
        let floor = total / hosts;
        let ceil = total.div_ceil(hosts);
        let zero_holders = hosts.saturating_sub(counts.len());
        if zero_holders > 0 && floor > 0 {
            return false;
        }
        counts.values().all(|&n| n >= floor && n <= ceil)
    }
}

pub fn partition_ids(n: u32) -> Vec<String> {
    (0..n).map(|i| i.to_string()).collect()
}
