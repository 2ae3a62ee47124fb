//! Agent ownership leases.
//!
//! A lease maps an agent key to the node running it, with a TTL enforced by
//! the store. There is no sweeper: an expired lease simply lets the next
//! claim succeed for a new owner.
//!
//! ```text
//! UNCLAIMED -> CLAIMED(owner, expiry) -> [renew]* -> released | expired -> UNCLAIMED
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::store::{CoordinationStore, LeaseRecord};

/// Ownership-checked lease operations against the coordination store.
#[derive(Clone)]
pub struct AgentLeaseManager {
    store: Arc<dyn CoordinationStore>,
}

impl AgentLeaseManager {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Takes the lease for `key` unless another owner holds a live one.
    pub async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let claimed = self.store.claim_lease(key, owner, ttl).await?;
        if !claimed {
            debug!(agent = %key, owner = %owner, "Lease held by another owner");
        }
        Ok(claimed)
    }

    /// Extends the lease only if `owner` still holds it.
    ///
    /// A stale owner renewing after its lease was taken over changes nothing
    /// and gets `false`.
    pub async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.store.renew_lease(key, owner, ttl).await
    }

    /// Drops the lease only if `owner` holds it.
    pub async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        self.store.release_lease(key, owner).await
    }

    pub async fn owner_of(&self, key: &str) -> Result<Option<LeaseRecord>, StoreError> {
        self.store.lease_of(key).await
    }
}

/// Outcome of one renewal pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalReport {
    pub renewed: Vec<String>,
    /// Keys whose lease now belongs to someone else (or expired).
    pub lost: Vec<String>,
    /// Keys whose renewal could not reach the store; still tracked.
    pub errored: Vec<String>,
}

/// Keeps the leases of in-flight agents alive for one owner.
pub struct LeaseRenewer {
    manager: AgentLeaseManager,
    owner: String,
    ttl: Duration,
    held: Mutex<HashSet<String>>,
    metrics: MetricsCollector,
}

impl LeaseRenewer {
    pub fn new(manager: AgentLeaseManager, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            manager,
            owner: owner.into(),
            ttl,
            held: Mutex::new(HashSet::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn track(&self, key: &str) {
        self.held.lock().await.insert(key.to_string());
    }

    /// Stops renewing `key`. Returns whether it was tracked.
    pub async fn untrack(&self, key: &str) -> bool {
        self.held.lock().await.remove(key)
    }

    pub async fn is_tracked(&self, key: &str) -> bool {
        self.held.lock().await.contains(key)
    }

    /// Tracked keys, sorted.
    pub async fn held_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.held.lock().await.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Renews every tracked lease once.
    ///
    /// A lease that can no longer be renewed is untracked; its run keeps
    /// going, and its completion will be refused by the store if another
    /// owner took over in the meantime.
    pub async fn renew_all(&self) -> RenewalReport {
        let mut report = RenewalReport::default();

        for key in self.held_keys().await {
            match self.manager.renew(&key, &self.owner, self.ttl).await {
                Ok(true) => report.renewed.push(key),
                Ok(false) => {
                    warn!(agent = %key, owner = %self.owner, "Lost lease on running agent");
                    self.metrics.record_lease_lost(&key);
                    self.untrack(&key).await;
                    report.lost.push(key);
                }
                Err(e) => {
                    warn!(agent = %key, owner = %self.owner, error = %e, "Failed to renew lease");
                    report.errored.push(key);
                }
            }
        }

        if !report.renewed.is_empty() {
            debug!(renewed = report.renewed.len(), "Renewed agent leases");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const TTL: Duration = Duration::from_secs(10);

    fn setup() -> (AgentLeaseManager, MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_secs(1_000));
        let store = MemoryStore::with_clock(clock.clone());
        (AgentLeaseManager::new(Arc::new(store.clone())), store, clock)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (leases, _, _) = setup();
        assert!(leases.claim("job-7", "node-a", TTL).await.unwrap());
        assert!(!leases.claim("job-7", "node-b", TTL).await.unwrap());
        // Re-claiming an owned lease extends it.
        assert!(leases.claim("job-7", "node-a", TTL).await.unwrap());

        let record = leases.owner_of("job-7").await.unwrap().unwrap();
        assert_eq!(record.owner, "node-a");
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let (leases, _, clock) = setup();
        assert!(leases.claim("job-7", "node-a", TTL).await.unwrap());

        clock.advance_ms(10_001);
        assert!(leases.claim("job-7", "node-b", TTL).await.unwrap());
        assert_eq!(leases.owner_of("job-7").await.unwrap().unwrap().owner, "node-b");
    }

    #[tokio::test]
    async fn test_stale_renew_does_not_touch_new_owner() {
        let (leases, _, clock) = setup();
        leases.claim("job-7", "node-a", TTL).await.unwrap();
        clock.advance_ms(10_001);
        leases.claim("job-7", "node-b", TTL).await.unwrap();
        clock.advance_ms(2_000);

        let before = leases.owner_of("job-7").await.unwrap().unwrap();
        assert!(!leases.renew("job-7", "node-a", Duration::from_secs(60)).await.unwrap());
        let after = leases.owner_of("job-7").await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_release_checks_owner() {
        let (leases, _, _) = setup();
        leases.claim("job-7", "node-a", TTL).await.unwrap();
        assert!(!leases.release("job-7", "node-b").await.unwrap());
        assert!(leases.release("job-7", "node-a").await.unwrap());
        assert!(leases.owner_of("job-7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renewer_drops_lost_leases() {
        let (leases, _, clock) = setup();
        let renewer = LeaseRenewer::new(leases.clone(), "node-a", TTL);

        leases.claim("a", "node-a", TTL).await.unwrap();
        leases.claim("b", "node-a", TTL).await.unwrap();
        renewer.track("a").await;
        renewer.track("b").await;

        // "b" expires and is taken over while "a" is renewed in time.
        clock.advance_ms(5_000);
        leases.renew("a", "node-a", TTL).await.unwrap();
        clock.advance_ms(5_001);
        leases.claim("b", "node-b", TTL).await.unwrap();

        let report = renewer.renew_all().await;
        assert_eq!(report.renewed, vec!["a".to_string()]);
        assert_eq!(report.lost, vec!["b".to_string()]);
        assert_eq!(renewer.held_keys().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_renewer_keeps_keys_on_store_errors() {
        let (leases, store, _) = setup();
        let renewer = LeaseRenewer::new(leases.clone(), "node-a", TTL);
        leases.claim("a", "node-a", TTL).await.unwrap();
        renewer.track("a").await;

        store.set_unavailable(true);
        let report = renewer.renew_all().await;
        assert_eq!(report.errored, vec!["a".to_string()]);
        assert!(renewer.is_tracked("a").await);
    }
}
