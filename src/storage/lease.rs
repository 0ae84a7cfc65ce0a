//! Lease records and the lease store contract
//!
//! A [`Lease`] is a time-bounded ownership claim over one partition. The
//! [`LeaseStore`] is the only mutual-exclusion primitive in the system: every
//! ownership change is an atomic compare-and-swap on a single record, so any
//! backend (in-process, or a durable table with conditional writes) can be
//! substituted without touching the balancer.
//!
//! ## Backends
//!
//! - **InMemory**: a single `parking_lot::Mutex` guards the whole record set.
//!   Safe for any number of hosts inside one process; not shared across
//!   processes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let store = InMemoryLeaseStore::new(Duration::from_secs(30));
//! store.ensure_store().await?;
//! store.ensure_lease("0").await?;
//!
//! let host = HostName::new("host-a")?;
//! let lease = store.acquire("0", &host).await?;
//! assert_eq!(lease.epoch, 1);
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::{HostError, Result};
use crate::host::HostName;

const STORE_NAME: &str = "lease";

/// Ownership record for one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Partition identifier (immutable after creation)
    pub partition_id: String,

    /// Current owner, empty when unowned
    pub owner: String,

    /// Fencing token, incremented on every ownership change
    pub epoch: u64,

    /// Expiration in milliseconds since the Unix epoch
    pub expires_at_ms: i64,
}

impl Lease {
    /// Create an unowned, already expired lease at epoch 0
    pub fn new(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            owner: String::new(),
            epoch: 0,
            expires_at_ms: 0,
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at_ms
    }

    /// A lease is free iff it is unowned or expired
    pub fn is_free_at(&self, now_ms: i64) -> bool {
        self.owner.is_empty() || self.is_expired_at(now_ms)
    }

    /// True if `host` is the active (unexpired) owner
    pub fn is_owned_by_at(&self, host: &str, now_ms: i64) -> bool {
        !self.owner.is_empty() && self.owner == host && !self.is_expired_at(now_ms)
    }
}

/// Shared repository of lease records
///
/// Every mutating operation must be atomic per partition at the backend.
#[async_trait]
pub trait LeaseStore: Send + Sync + Debug {
    /// Idempotently provision the backing repository
    async fn ensure_store(&self) -> Result<()>;

    /// Whether the repository has been provisioned
    async fn store_exists(&self) -> Result<bool>;

    /// Destroy all lease records (full reset path)
    async fn delete_store(&self) -> Result<()>;

    /// Snapshot of all known leases
    async fn list_leases(&self) -> Result<Vec<Lease>>;

    /// Create an unowned lease at epoch 0 if absent, otherwise return the
    /// current record
    async fn ensure_lease(&self, partition_id: &str) -> Result<Lease>;

    /// Take ownership if the lease is free or already owned by `requester`
    ///
    /// Returns `Err(HostError::LeaseHeldByOther)` without changing the record
    /// when another host holds an unexpired lease.
    async fn acquire(&self, partition_id: &str, requester: &HostName) -> Result<Lease>;

    /// Extend the expiration of a lease owned by `requester`
    ///
    /// Returns `Err(HostError::NotOwner)` if the lease has been reassigned.
    async fn renew(&self, partition_id: &str, requester: &HostName) -> Result<Lease>;

    /// Clear ownership and expire the lease immediately
    ///
    /// Best-effort: returns `Ok(false)` when `requester` is not the current,
    /// unexpired owner.
    async fn release(&self, partition_id: &str, requester: &HostName) -> Result<bool>;

    /// Renew and increment the epoch in one step
    async fn bump_epoch(&self, partition_id: &str, requester: &HostName) -> Result<Lease>;

    /// Remove the record entirely (reset path only)
    async fn delete_lease(&self, partition_id: &str) -> Result<()>;

    /// Duration granted by `acquire` and `renew`
    fn lease_duration(&self) -> Duration;
}

/// Statistics for a lease store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseStoreStats {
    /// Total read operations
    pub reads: u64,
    /// Total write operations
    pub writes: u64,
    /// Acquire attempts rejected because another host held the lease
    pub conflicts: u64,
    /// Successful lease acquisitions
    pub acquisitions: u64,
    /// Successful lease renewals (including epoch bumps)
    pub renewals: u64,
}

/// In-memory lease store for testing and single-process deployments
#[derive(Debug)]
pub struct InMemoryLeaseStore {
    /// `None` until `ensure_store` is called
    leases: parking_lot::Mutex<Option<HashMap<String, Lease>>>,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
    stats: InMemoryLeaseStoreStats,
}

#[derive(Debug, Default)]
struct InMemoryLeaseStoreStats {
    reads: AtomicU64,
    writes: AtomicU64,
    conflicts: AtomicU64,
    acquisitions: AtomicU64,
    renewals: AtomicU64,
}

impl InMemoryLeaseStore {
    /// Create a new in-memory lease store using the system clock
    pub fn new(lease_duration: Duration) -> Self {
        Self::with_clock(lease_duration, Arc::new(SystemClock))
    }

    /// Create a new in-memory lease store with an explicit clock
    pub fn with_clock(lease_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: parking_lot::Mutex::new(None),
            lease_duration,
            clock,
            stats: InMemoryLeaseStoreStats::default(),
        }
    }

    pub fn stats(&self) -> LeaseStoreStats {
        LeaseStoreStats {
            reads: self.stats.reads.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            conflicts: self.stats.conflicts.load(Ordering::Relaxed),
            acquisitions: self.stats.acquisitions.load(Ordering::Relaxed),
            renewals: self.stats.renewals.load(Ordering::Relaxed),
        }
    }

    fn expiry_from(&self, now_ms: i64) -> i64 {
        now_ms + self.lease_duration.as_millis() as i64
    }

    /// Run `f` against the record for `partition_id` under the store lock
    fn with_lease<T>(
        &self,
        partition_id: &str,
        f: impl FnOnce(&mut Lease, i64) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.leases.lock();
        let leases = guard
            .as_mut()
            .ok_or_else(|| HostError::StoreNotProvisioned(STORE_NAME.to_string()))?;
        let lease = leases
            .get_mut(partition_id)
            .ok_or_else(|| HostError::LeaseNotFound(partition_id.to_string()))?;
        f(lease, self.clock.now_ms())
    }

    fn not_owner(lease: &Lease, requester: &HostName) -> HostError {
        HostError::NotOwner {
            partition_id: lease.partition_id.clone(),
            requester: requester.to_string(),
            owner: lease.owner.clone(),
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn ensure_store(&self) -> Result<()> {
        let mut guard = self.leases.lock();
        if guard.is_none() {
            *guard = Some(HashMap::new());
        }
        Ok(())
    }

    async fn store_exists(&self) -> Result<bool> {
        Ok(self.leases.lock().is_some())
    }

    async fn delete_store(&self) -> Result<()> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        *self.leases.lock() = None;
        Ok(())
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let guard = self.leases.lock();
        let leases = guard
            .as_ref()
            .ok_or_else(|| HostError::StoreNotProvisioned(STORE_NAME.to_string()))?;
        Ok(leases.values().cloned().collect())
    }

    async fn ensure_lease(&self, partition_id: &str) -> Result<Lease> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.leases.lock();
        let leases = guard
            .as_mut()
            .ok_or_else(|| HostError::StoreNotProvisioned(STORE_NAME.to_string()))?;
        Ok(leases
            .entry(partition_id.to_string())
            .or_insert_with(|| Lease::new(partition_id))
            .clone())
    }

    async fn acquire(&self, partition_id: &str, requester: &HostName) -> Result<Lease> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let result = self.with_lease(partition_id, |lease, now_ms| {
            if !lease.is_free_at(now_ms) && lease.owner != requester.as_str() {
                return Err(HostError::LeaseHeldByOther {
                    partition_id: lease.partition_id.clone(),
                    owner: lease.owner.clone(),
                    expires_at_ms: lease.expires_at_ms,
                });
            }

            if lease.owner != requester.as_str() {
                lease.owner = requester.to_string();
                lease.epoch += 1;
            }
            lease.expires_at_ms = self.expiry_from(now_ms);
            Ok(lease.clone())
        });

        match &result {
            Ok(_) => self.stats.acquisitions.fetch_add(1, Ordering::Relaxed),
            Err(HostError::LeaseHeldByOther { .. }) => {
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed)
            }
            Err(_) => 0,
        };
        result
    }

    async fn renew(&self, partition_id: &str, requester: &HostName) -> Result<Lease> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let lease = self.with_lease(partition_id, |lease, now_ms| {
            if lease.owner != requester.as_str() {
                return Err(Self::not_owner(lease, requester));
            }
            lease.expires_at_ms = self.expiry_from(now_ms);
            Ok(lease.clone())
        })?;
        self.stats.renewals.fetch_add(1, Ordering::Relaxed);
        Ok(lease)
    }

    async fn release(&self, partition_id: &str, requester: &HostName) -> Result<bool> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.with_lease(partition_id, |lease, now_ms| {
            if !lease.is_owned_by_at(requester.as_str(), now_ms) {
                return Ok(false);
            }
            lease.owner.clear();
            lease.expires_at_ms = now_ms - 1;
            Ok(true)
        })
    }

    async fn bump_epoch(&self, partition_id: &str, requester: &HostName) -> Result<Lease> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let lease = self.with_lease(partition_id, |lease, now_ms| {
            if lease.owner != requester.as_str() {
                return Err(Self::not_owner(lease, requester));
            }
            lease.expires_at_ms = self.expiry_from(now_ms);
            lease.epoch += 1;
            Ok(lease.clone())
        })?;
        self.stats.renewals.fetch_add(1, Ordering::Relaxed);
        Ok(lease)
    }

    async fn delete_lease(&self, partition_id: &str) -> Result<()> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.leases.lock();
        let leases = guard
            .as_mut()
            .ok_or_else(|| HostError::StoreNotProvisioned(STORE_NAME.to_string()))?;
        leases.remove(partition_id);
        Ok(())
    }

    fn lease_duration(&self) -> Duration {
        self.lease_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const LEASE: Duration = Duration::from_secs(30);

    fn host(name: &str) -> HostName {
        HostName::new(name).unwrap()
    }

    async fn create_test_store() -> (InMemoryLeaseStore, ManualClock) {
        let clock = ManualClock::default();
        let store = InMemoryLeaseStore::with_clock(LEASE, Arc::new(clock.clone()));
        store.ensure_store().await.unwrap();
        (store, clock)
    }

    #[test]
    fn test_lease_freeness() {
        let mut lease = Lease::new("0");
        assert!(lease.is_free_at(0));

        lease.owner = "a".to_string();
        lease.expires_at_ms = 100;
        assert!(!lease.is_free_at(100));
        assert!(lease.is_owned_by_at("a", 100));
        assert!(lease.is_free_at(101));
        assert!(!lease.is_owned_by_at("a", 101));
        assert!(!lease.is_owned_by_at("b", 50));
    }

    #[tokio::test]
    async fn test_store_lifecycle() {
        let store = InMemoryLeaseStore::new(LEASE);
        assert!(!store.store_exists().await.unwrap());
        assert!(matches!(
            store.list_leases().await,
            Err(HostError::StoreNotProvisioned(_))
        ));

        store.ensure_store().await.unwrap();
        store.ensure_store().await.unwrap();
        assert!(store.store_exists().await.unwrap());

        store.ensure_lease("0").await.unwrap();
        store.delete_store().await.unwrap();
        assert!(!store.store_exists().await.unwrap());

        store.ensure_store().await.unwrap();
        assert!(store.list_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_lease_is_idempotent() {
        let (store, _clock) = create_test_store().await;

        let first = store.ensure_lease("0").await.unwrap();
        assert_eq!(first, Lease::new("0"));

        store.acquire("0", &host("a")).await.unwrap();
        let second = store.ensure_lease("0").await.unwrap();
        assert_eq!(second.owner, "a");
        assert_eq!(second.epoch, 1);
        assert_eq!(store.list_leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_free_lease() {
        let (store, clock) = create_test_store().await;
        store.ensure_lease("0").await.unwrap();

        let lease = store.acquire("0", &host("a")).await.unwrap();
        assert_eq!(lease.owner, "a");
        assert_eq!(lease.epoch, 1);
        assert_eq!(lease.expires_at_ms, clock.now_ms() + 30_000);
    }

    #[tokio::test]
    async fn test_acquire_held_by_other_fails() {
        let (store, _clock) = create_test_store().await;
        store.ensure_lease("0").await.unwrap();
        let held = store.acquire("0", &host("a")).await.unwrap();

        let result = store.acquire("0", &host("b")).await;
        assert!(matches!(
            result,
            Err(HostError::LeaseHeldByOther { ref owner, .. }) if owner == "a"
        ));

        let leases = store.list_leases().await.unwrap();
        assert_eq!(leases, vec![held]);
        assert_eq!(store.stats().conflicts, 1);
    }

    #[tokio::test]
    async fn test_reacquire_by_owner_keeps_epoch() {
        let (store, clock) = create_test_store().await;
        store.ensure_lease("0").await.unwrap();
        store.acquire("0", &host("a")).await.unwrap();

        clock.advance(Duration::from_secs(10));
        let lease = store.acquire("0", &host("a")).await.unwrap();
        assert_eq!(lease.epoch, 1);
        assert_eq!(lease.expires_at_ms, clock.now_ms() + 30_000);
    }

    #[tokio::test]
    async fn test_acquire_expired_lease_bumps_epoch() {
        let (store, clock) = create_test_store().await;
        store.ensure_lease("0").await.unwrap();
        store.acquire("0", &host("a")).await.unwrap();

        clock.advance(LEASE + Duration::from_millis(1));
        let lease = store.acquire("0", &host("b")).await.unwrap();
        assert_eq!(lease.owner, "b");
        assert_eq!(lease.epoch, 2);
    }

    #[tokio::test]
    async fn test_acquire_unknown_partition() {
        let (store, _clock) = create_test_store().await;
        let result = store.acquire("missing", &host("a")).await;
        assert!(matches!(result, Err(HostError::LeaseNotFound(_))));
    }

    #[tokio::test]
    async fn test_renew() {
        let (store, clock) = create_test_store().await;
        store.ensure_lease("0").await.unwrap();
        store.acquire("0", &host("a")).await.unwrap();

        clock.advance(Duration::from_secs(5));
        let renewed = store.renew("0", &host("a")).await.unwrap();
        assert_eq!(renewed.expires_at_ms, clock.now_ms() + 30_000);
        assert_eq!(renewed.epoch, 1);

        let result = store.renew("0", &host("b")).await;
        assert!(matches!(result, Err(HostError::NotOwner { .. })));
    }

    #[tokio::test]
    async fn test_renew_after_steal_fails() {
        let (store, clock) = create_test_store().await;
        store.ensure_lease("0").await.unwrap();
        store.acquire("0", &host("a")).await.unwrap();

        clock.advance(LEASE + Duration::from_millis(1));
        store.acquire("0", &host("b")).await.unwrap();

        let result = store.renew("0", &host("a")).await;
        assert!(matches!(
            result,
            Err(HostError::NotOwner { ref owner, .. }) if owner == "b"
        ));
    }

    #[tokio::test]
    async fn test_release() {
        let (store, _clock) = create_test_store().await;
        store.ensure_lease("0").await.unwrap();
        store.acquire("0", &host("a")).await.unwrap();

        // Someone else releasing is a no-op
        assert!(!store.release("0", &host("b")).await.unwrap());

        assert!(store.release("0", &host("a")).await.unwrap());
        let lease = store.ensure_lease("0").await.unwrap();
        assert!(lease.owner.is_empty());

        // Now immediately acquirable by another host, with a new epoch
        let lease = store.acquire("0", &host("b")).await.unwrap();
        assert_eq!(lease.owner, "b");
        assert_eq!(lease.epoch, 2);
    }

    #[tokio::test]
    async fn test_release_expired_is_noop() {
        let (store, clock) = create_test_store().await;
        store.ensure_lease("0").await.unwrap();
        store.acquire("0", &host("a")).await.unwrap();

        clock.advance(LEASE + Duration::from_millis(1));
        assert!(!store.release("0", &host("a")).await.unwrap());
        assert_eq!(store.ensure_lease("0").await.unwrap().owner, "a");
    }

    #[tokio::test]
    async fn test_bump_epoch() {
        let (store, _clock) = create_test_store().await;
        store.ensure_lease("0").await.unwrap();
        store.acquire("0", &host("a")).await.unwrap();

        let lease = store.bump_epoch("0", &host("a")).await.unwrap();
        assert_eq!(lease.epoch, 2);
        assert_eq!(lease.owner, "a");

        let result = store.bump_epoch("0", &host("b")).await;
        assert!(matches!(result, Err(HostError::NotOwner { .. })));
    }

    #[tokio::test]
    async fn test_delete_lease() {
        let (store, _clock) = create_test_store().await;
        store.ensure_lease("0").await.unwrap();
        store.ensure_lease("1").await.unwrap();

        store.delete_lease("0").await.unwrap();
        let leases = store.list_leases().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].partition_id, "1");
    }

    #[tokio::test]
    async fn test_stats() {
        let (store, _clock) = create_test_store().await;
        store.ensure_lease("0").await.unwrap();
        store.acquire("0", &host("a")).await.unwrap();
        store.renew("0", &host("a")).await.unwrap();
        store.list_leases().await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 3);
        assert_eq!(stats.acquisitions, 1);
        assert_eq!(stats.renewals, 1);
    }
}
