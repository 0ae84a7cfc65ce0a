//! Multi-host balancing tests
//!
//! Every test drives hosts cycle by cycle against shared in-memory stores and
//! a manual clock, so joins, departures and crashes play out
//! deterministically.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test balancer_test
//! ```

mod common;

use async_trait::async_trait;
use common::*;
use partition_host::storage::{CheckpointStore, LeaseStore};
use partition_host::testing::{FlakyLeaseStore, RecordingPump};
use partition_host::{
    BalancerState, HostError, HostHealth, HostName, Lease, LossReason, OwnershipEvent,
    PartitionBalancer, PartitionDiscovery, Result,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lease store that lets a rival win the first acquire of one partition
#[derive(Debug)]
struct RacingLeaseStore {
    inner: Arc<dyn LeaseStore>,
    rival: HostName,
    contested: String,
    raced: AtomicBool,
}

#[async_trait]
impl LeaseStore for RacingLeaseStore {
    async fn ensure_store(&self) -> Result<()> {
        self.inner.ensure_store().await
    }

    async fn store_exists(&self) -> Result<bool> {
        self.inner.store_exists().await
    }

    async fn delete_store(&self) -> Result<()> {
        self.inner.delete_store().await
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        self.inner.list_leases().await
    }

    async fn ensure_lease(&self, partition_id: &str) -> Result<Lease> {
        self.inner.ensure_lease(partition_id).await
    }

    async fn acquire(&self, partition_id: &str, requester: &HostName) -> Result<Lease> {
        if partition_id == self.contested && !self.raced.swap(true, Ordering::SeqCst) {
            self.inner.acquire(partition_id, &self.rival).await?;
        }
        self.inner.acquire(partition_id, requester).await
    }

    async fn renew(&self, partition_id: &str, requester: &HostName) -> Result<Lease> {
        self.inner.renew(partition_id, requester).await
    }

    async fn release(&self, partition_id: &str, requester: &HostName) -> Result<bool> {
        self.inner.release(partition_id, requester).await
    }

    async fn bump_epoch(&self, partition_id: &str, requester: &HostName) -> Result<Lease> {
        self.inner.bump_epoch(partition_id, requester).await
    }

    async fn delete_lease(&self, partition_id: &str) -> Result<()> {
        self.inner.delete_lease(partition_id).await
    }

    fn lease_duration(&self) -> Duration {
        self.inner.lease_duration()
    }
}

/// Discovery whose partition count can grow between cycles
#[derive(Debug)]
struct GrowingPartitions {
    count: AtomicU32,
}

#[async_trait]
impl PartitionDiscovery for GrowingPartitions {
    async fn partition_ids(&self) -> Result<Vec<String>> {
        Ok(partition_ids(self.count.load(Ordering::SeqCst)))
    }
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<OwnershipEvent>) -> Vec<OwnershipEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_single_host_owns_everything() {
    let cluster = TestCluster::new(4);
    let a = cluster.host("a");

    let report = a.balancer.run_cycle().await.unwrap();

    assert_eq!(report.acquired.len(), 4);
    assert_eq!(report.fair_share, 4);
    assert_eq!(report.estimated_hosts, 1);
    assert_eq!(a.owned(), partition_ids(4));
    assert_eq!(a.pump.running_partitions(), partition_ids(4));
    assert_eq!(cluster.counts().await.get("a"), Some(&4));

    for partition_id in partition_ids(4) {
        assert_eq!(a.balancer.owned_epoch(&partition_id), Some(1));
    }
}

#[tokio::test(start_paused = true)]
async fn test_second_host_joins_and_splits_evenly() {
    let cluster = TestCluster::new(4);
    let a = cluster.host("a");
    cluster.round(&[&a]).await;

    let b = cluster.host("b");
    let rounds = cluster.settle(&[&a, &b], 10).await;
    assert!(rounds.is_some(), "hosts never reached a fair split");

    let counts = cluster.counts().await;
    assert_eq!(counts.get("a"), Some(&2));
    assert_eq!(counts.get("b"), Some(&2));
    assert_eq!(a.owned().len(), 2);
    assert_eq!(b.owned().len(), 2);

    // The newest acquisitions are the ones handed over
    assert_eq!(a.owned(), vec!["0".to_string(), "1".to_string()]);
    assert_eq!(b.owned(), vec!["2".to_string(), "3".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_handoff_resumes_from_flushed_checkpoint() {
    let cluster = TestCluster::new(4);
    let a = cluster.host("a");
    cluster.round(&[&a]).await;
    let b = cluster.host("b");
    cluster.settle(&[&a, &b], 10).await.unwrap();

    // a stopped "3" with 10 events processed and flushed under epoch 1
    let stop = a
        .pump
        .stops()
        .into_iter()
        .find(|s| s.partition_id == "3")
        .unwrap();
    assert_eq!(stop.epoch, 1);
    assert_eq!(stop.position.sequence_number, 10);

    let start = b
        .pump
        .starts()
        .into_iter()
        .find(|s| s.partition_id == "3")
        .unwrap();
    assert_eq!(start.epoch, 2);
    assert_eq!(start.sequence_number, 10);
    assert_eq!(start.offset, "10");

    let checkpoint = cluster.checkpoints.get_checkpoint("3").await.unwrap().unwrap();
    assert_eq!(checkpoint.writer_epoch, 2);
}

#[tokio::test(start_paused = true)]
async fn test_three_hosts_converge_to_floor_or_ceil() {
    let cluster = TestCluster::new(4);
    let a = cluster.host("a");
    let b = cluster.host("b");
    let c = cluster.host("c");

    let rounds = cluster.settle(&[&a, &b, &c], 15).await;
    assert!(rounds.is_some(), "hosts never reached a fair split");

    let mut counts: Vec<usize> = cluster.counts().await.into_values().collect();
    counts.sort();
    assert_eq!(counts, vec![1, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_fair_split_is_stable() {
    let cluster = TestCluster::new(10);
    let a = cluster.host("a");
    let b = cluster.host("b");
    let c = cluster.host("c");
    cluster.settle(&[&a, &b, &c], 15).await.unwrap();

    let mut counts: Vec<usize> = cluster.counts().await.into_values().collect();
    counts.sort();
    assert_eq!(counts, vec![3, 3, 4]);

    for _ in 0..5 {
        for host in [&a, &b, &c] {
            let report = host.balancer.run_cycle().await.unwrap();
            assert!(report.is_steady(), "{} moved partitions: {:?}", host.name(), report);
        }
        cluster.clock.advance(cluster.interval());
    }
}

#[tokio::test(start_paused = true)]
async fn test_graceful_leave_hands_everything_over() {
    let cluster = TestCluster::new(4);
    let a = cluster.host("a");
    cluster.round(&[&a]).await;
    let b = cluster.host("b");
    cluster.settle(&[&a, &b], 10).await.unwrap();

    let mut events = b.balancer.subscribe();
    a.balancer.shutdown().await;

    assert_eq!(a.balancer.state(), BalancerState::Stopped);
    assert!(a.owned().is_empty());
    assert!(a.pump.running_partitions().is_empty());
    assert_eq!(cluster.counts().await.get("a"), None);

    // b picks the released partitions up on its very next cycle
    let report = b.balancer.run_cycle().await.unwrap();
    assert_eq!(report.estimated_hosts, 1);
    assert_eq!(report.acquired, vec!["0".to_string(), "1".to_string()]);
    assert_eq!(b.owned(), partition_ids(4));
    assert_eq!(cluster.counts().await.get("b"), Some(&4));

    let acquired: Vec<OwnershipEvent> = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, OwnershipEvent::Acquired { .. }))
        .collect();
    assert_eq!(
        acquired,
        vec![
            OwnershipEvent::Acquired {
                partition_id: "0".to_string(),
                epoch: 2
            },
            OwnershipEvent::Acquired {
                partition_id: "1".to_string(),
                epoch: 2
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_crashed_host_is_replaced_after_lease_expiry() {
    let cluster = TestCluster::new(4);
    let a = cluster.host("a");
    cluster.round(&[&a]).await;
    let b = cluster.host("b");
    cluster.settle(&[&a, &b], 10).await.unwrap();
    let orphaned = a.owned();

    a.balancer.abort().await;
    assert_eq!(a.balancer.state(), BalancerState::Stopped);
    // Pumps keep running as they would in a process that has not noticed yet
    assert_eq!(a.pump.running_partitions(), orphaned);

    let bound = cluster.config.lease_duration() + cluster.interval();
    let mut waited = Duration::ZERO;
    while b.owned().len() < 4 {
        assert!(waited <= bound, "takeover took longer than {:?}", bound);
        cluster.round(&[&b]).await;
        waited += cluster.interval();
    }

    assert_eq!(cluster.counts().await.get("b"), Some(&4));
    for partition_id in &orphaned {
        assert_eq!(b.balancer.owned_epoch(partition_id), Some(2));
    }
}

#[tokio::test(start_paused = true)]
async fn test_zombie_pump_is_fenced_after_takeover() {
    let cluster = TestCluster::new(4);
    let a = cluster.host("a");
    cluster.round(&[&a]).await;
    let b = cluster.host("b");
    cluster.settle(&[&a, &b], 10).await.unwrap();
    let orphaned = a.owned();

    a.balancer.abort().await;
    for _ in 0..6 {
        cluster.round(&[&b]).await;
    }
    assert_eq!(b.owned().len(), 4);

    let zombie = &orphaned[0];
    let err = a.pump.process(zombie, 5).await.unwrap_err();
    assert!(matches!(
        err,
        HostError::StaleWriter {
            writer_epoch: 1,
            stored_epoch: 2,
            ..
        }
    ));

    // The new owner's progress is untouched and keeps moving
    let stored = cluster.checkpoints.get_checkpoint(zombie).await.unwrap().unwrap();
    assert_eq!(stored.writer_epoch, 2);
    assert_eq!(stored.sequence_number, 0);

    let written = b.pump.process(zombie, 5).await.unwrap();
    assert_eq!(written.writer_epoch, 2);
    assert_eq!(written.sequence_number, 5);
}

#[tokio::test(start_paused = true)]
async fn test_restart_under_same_name_adopts_live_leases() {
    let cluster = TestCluster::new(3);
    let a = cluster.host("a");
    cluster.round(&[&a]).await;
    a.balancer.abort().await;

    let restarted = cluster.host("a");
    let report = restarted.balancer.run_cycle().await.unwrap();

    // Adopted through renew, so no other host could have slipped in
    assert_eq!(report.acquired, partition_ids(3));
    assert_eq!(restarted.balancer.stats().acquire_conflicts, 0);
    assert_eq!(restarted.owned(), partition_ids(3));
    assert_eq!(restarted.pump.running_partitions(), partition_ids(3));
    for partition_id in partition_ids(3) {
        assert_eq!(restarted.balancer.owned_epoch(&partition_id), Some(1));
    }
}

#[tokio::test(start_paused = true)]
async fn test_lost_acquire_race_leaves_ownership_unchanged() {
    let cluster = TestCluster::new(2);
    let racing = Arc::new(RacingLeaseStore {
        inner: cluster.leases.clone(),
        rival: HostName::new("rival").unwrap(),
        contested: "1".to_string(),
        raced: AtomicBool::new(false),
    });
    let a = cluster.host_with_stores("a", racing, cluster.checkpoints.clone());

    let report = a.balancer.run_cycle().await.unwrap();

    assert_eq!(report.acquired, vec!["0".to_string()]);
    assert_eq!(a.owned(), vec!["0".to_string()]);
    assert!(!a.pump.is_running("1"));
    assert_eq!(a.balancer.stats().acquire_conflicts, 1);
    assert_eq!(cluster.owners().await.get("1").map(String::as_str), Some("rival"));
}

#[tokio::test(start_paused = true)]
async fn test_pump_start_failure_leaves_partition_for_others() {
    let cluster = TestCluster::new(2);
    let a = cluster.host("a");
    a.pump.fail_starts_for("1");

    let report = a.balancer.run_cycle().await.unwrap();
    assert_eq!(report.acquired, vec!["0".to_string()]);
    assert_eq!(cluster.owners().await.get("1"), None);

    let b = cluster.host("b");
    b.balancer.run_cycle().await.unwrap();
    assert_eq!(b.owned(), vec!["1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_degrades_and_recovers() {
    let cluster = TestCluster::new(4);
    let flaky = Arc::new(FlakyLeaseStore::new(cluster.leases.clone()));
    let a = cluster.host_with_stores("a", flaky.clone(), cluster.checkpoints.clone());
    let health = a.balancer.watch_health();

    a.balancer.run_cycle().await.unwrap();
    assert_eq!(a.owned().len(), 4);

    flaky.set_unavailable(true);
    let err = a.balancer.run_cycle().await.unwrap_err();
    assert!(matches!(err, HostError::BackendUnavailable { .. }));
    assert!(health.borrow().is_healthy());
    // Still within the local expiry, so nothing is dropped yet
    assert_eq!(a.owned().len(), 4);

    a.balancer.run_cycle().await.unwrap_err();
    assert_eq!(
        *health.borrow(),
        HostHealth::Degraded {
            consecutive_failures: 2
        }
    );
    assert!(a.balancer.stats().retries > 0);

    cluster.clock.advance(cluster.config.lease_duration() + cluster.interval());
    let mut events = a.balancer.subscribe();
    a.balancer.run_cycle().await.unwrap_err();
    assert!(a.owned().is_empty());
    assert!(a.pump.running_partitions().is_empty());
    let lost = drain_events(&mut events)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                OwnershipEvent::Lost {
                    reason: LossReason::LocalExpiry,
                    ..
                }
            )
        })
        .count();
    assert_eq!(lost, 4);

    flaky.set_unavailable(false);
    a.balancer.run_cycle().await.unwrap();
    assert_eq!(a.balancer.health(), HostHealth::Healthy);
    assert_eq!(a.owned().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_outage_gives_partitions_up_before_others_can_take_them() {
    let cluster = TestCluster::new(2);
    let flaky = Arc::new(FlakyLeaseStore::new(cluster.leases.clone()));
    let a = cluster.host_with_stores("a", flaky.clone(), cluster.checkpoints.clone());
    a.balancer.run_cycle().await.unwrap();
    assert_eq!(a.owned().len(), 2);

    flaky.set_unavailable(true);
    let last_safe_cycle = cluster.config.lease_duration() - cluster.interval();
    cluster.clock.advance(last_safe_cycle - Duration::from_millis(1));
    a.balancer.run_cycle().await.unwrap_err();
    assert_eq!(a.owned().len(), 2);

    cluster.clock.advance(Duration::from_millis(1));
    a.balancer.run_cycle().await.unwrap_err();
    assert!(a.owned().is_empty());
    assert!(a.pump.running_partitions().is_empty());

    // The leases are still live in the store, so nobody else has started yet
    flaky.set_unavailable(false);
    let b = cluster.host("b");
    let report = b.balancer.run_cycle().await.unwrap();
    assert!(report.acquired.is_empty());
    assert!(b.owned().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_store_calls_time_out() {
    let cluster = TestCluster::new(2);
    let flaky = Arc::new(FlakyLeaseStore::new(cluster.leases.clone()));
    let a = cluster.host_with_stores("a", flaky.clone(), cluster.checkpoints.clone());
    a.balancer.run_cycle().await.unwrap();

    flaky.set_latency(Some(Duration::from_secs(2)));
    let err = a.balancer.run_cycle().await.unwrap_err();
    assert!(matches!(err, HostError::Timeout { .. }));
    assert_eq!(a.balancer.stats().failed_cycles, 1);
}

#[tokio::test(start_paused = true)]
async fn test_new_partitions_are_picked_up() {
    let cluster = TestCluster::new(4);
    let discovery = Arc::new(GrowingPartitions {
        count: AtomicU32::new(4),
    });
    let pump = Arc::new(RecordingPump::new());
    let balancer = PartitionBalancer::new(
        HostName::new("a").unwrap(),
        cluster.config.clone(),
        cluster.leases.clone(),
        cluster.checkpoints.clone(),
        pump.clone(),
        discovery.clone(),
    )
    .unwrap()
    .with_clock(Arc::new(cluster.clock.clone()));

    balancer.run_cycle().await.unwrap();
    assert_eq!(balancer.owned_partitions().len(), 4);

    discovery.count.store(6, Ordering::SeqCst);
    let report = balancer.run_cycle().await.unwrap();
    assert_eq!(report.acquired, vec!["4".to_string(), "5".to_string()]);
    assert_eq!(pump.running_partitions().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_runs_and_drains() {
    let cluster = TestCluster::new(4);
    let a = cluster.host("a");
    let mut state = a.balancer.watch_state();

    a.balancer.start().unwrap();
    assert_eq!(*state.borrow_and_update(), BalancerState::Running);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.owned().len(), 4);

    a.balancer.shutdown().await;
    assert_eq!(a.balancer.state(), BalancerState::Stopped);
    assert!(a.owned().is_empty());
    assert!(a.pump.running_partitions().is_empty());
    assert!(cluster.owners().await.is_empty());
    assert_eq!(a.balancer.stats().releases, 4);
}

#[tokio::test(start_paused = true)]
async fn test_drain_timeout_still_stops_every_pump() {
    let cluster = TestCluster::new(4);
    let flaky = Arc::new(FlakyLeaseStore::new(cluster.leases.clone()));
    let a = cluster.host_with_stores("a", flaky.clone(), cluster.checkpoints.clone());
    a.balancer.run_cycle().await.unwrap();
    assert_eq!(a.pump.running_partitions(), partition_ids(4));

    // Every release now outlives the per-call timeout, so the drain budget runs out
    flaky.set_latency(Some(
        cluster.config.store_call_timeout() + Duration::from_millis(100),
    ));
    a.balancer.shutdown().await;

    assert_eq!(a.balancer.state(), BalancerState::Stopped);
    assert!(a.owned().is_empty());
    assert_eq!(a.pump.running_partitions(), Vec::<String>::new());
    assert_eq!(a.pump.stops().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_cycles_refused_after_stop_until_restarted() {
    let cluster = TestCluster::new(4);
    let a = cluster.host("a");
    a.balancer.run_cycle().await.unwrap();

    a.balancer.abort().await;
    assert!(matches!(
        a.balancer.run_cycle().await,
        Err(HostError::ShuttingDown)
    ));
    assert!(a.owned().is_empty());

    a.balancer.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.owned(), partition_ids(4));

    a.balancer.shutdown().await;
    assert!(matches!(
        a.balancer.run_cycle().await,
        Err(HostError::ShuttingDown)
    ));
    assert!(cluster.owners().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cycle_refused_while_draining() {
    let cluster = TestCluster::new(2);
    let a = cluster.host("a");
    a.balancer.start().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let balancer = a.balancer.clone();
    let draining = tokio::spawn(async move { balancer.shutdown().await });
    tokio::task::yield_now().await;

    if a.balancer.state() == BalancerState::Draining {
        assert!(matches!(
            a.balancer.run_cycle().await,
            Err(HostError::ShuttingDown)
        ));
        assert!(matches!(a.balancer.start(), Err(HostError::ShuttingDown)));
    }
    draining.await.unwrap();
    assert_eq!(a.balancer.state(), BalancerState::Stopped);
}
