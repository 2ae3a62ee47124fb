//! Priority ready-queue of agent keys.
//!
//! A thin, typed layer over the coordination store's sorted set. Every
//! operation here is a single atomic store call, so several schedulers can
//! share the queue without any extra locking.
//!
//! # Queue Structure
//!
//! - waiting: agent key scored by next eligible run time (epoch seconds)
//! - registered: every key known to the cluster
//!
//! A key present in waiting is pending. A key absent from waiting but
//! registered is either running (it holds a lease), between claim and
//! lease, or orphaned (its owner died). Orphans are restored by
//! [`DistributedQueue::restore_orphans`] once their last claim is old enough
//! that the claimer would have leased them by then.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::store::{
    is_valid_agent_key, ClaimedAgent, CoordinationStore, RemovalCondition, RemovalResult,
    RescheduleOutcome, Score,
};

/// Seconds to add to an agent's initial score, stable per key.
///
/// Spreads first runs of a large registration across `window` so the whole
/// fleet does not become due in the same second.
pub fn registration_offset_secs(key: &str, window: Duration) -> i64 {
    let window_secs = window.as_secs();
    if window_secs == 0 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % window_secs) as i64
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Agents waiting in the queue.
    pub pending: usize,
    /// Pending agents whose score has passed.
    pub due: usize,
    /// Agents known to the cluster.
    pub registered: usize,
}

impl QueueStats {
    /// Registered agents that are not pending (running or orphaned).
    pub fn not_pending(&self) -> usize {
        self.registered.saturating_sub(self.pending)
    }
}

/// Ready-queue backed by a [`CoordinationStore`].
#[derive(Clone)]
pub struct DistributedQueue {
    store: Arc<dyn CoordinationStore>,
    registration_jitter: Duration,
    metrics: MetricsCollector,
}

impl DistributedQueue {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            registration_jitter: Duration::ZERO,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the window across which initial scores are spread.
    pub fn with_registration_jitter(mut self, jitter: Duration) -> Self {
        self.registration_jitter = jitter;
        self
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Registers `keys` and queues the ones not already pending or running.
    ///
    /// Each key is scored `initial_score` plus its registration offset.
    /// Keys that are empty or purely numeric are skipped. Returns how many
    /// keys were queued.
    pub async fn add_agents(
        &self,
        keys: &[String],
        initial_score: Score,
    ) -> Result<usize, StoreError> {
        let entries: Vec<(String, Score)> = keys
            .iter()
            .filter(|key| {
                let valid = is_valid_agent_key(key);
                if !valid {
                    warn!(agent = %key, "Skipping agent with an invalid key");
                }
                valid
            })
            .map(|key| {
                let offset = registration_offset_secs(key, self.registration_jitter);
                (key.clone(), initial_score.saturating_add(offset))
            })
            .collect();

        if entries.is_empty() {
            return Ok(0);
        }

        let added = self.store.add_agents(&entries).await?;
        debug!(requested = entries.len(), added = added, "Added agents to queue");
        Ok(added)
    }

    /// Removes up to `limit` due agents (at least one) from the queue.
    pub async fn claim_due(
        &self,
        now: Score,
        limit: usize,
    ) -> Result<Vec<ClaimedAgent>, StoreError> {
        let claimed = self.store.claim_due(now, limit.max(1)).await?;
        if !claimed.is_empty() {
            self.metrics.record_claimed(claimed.len());
        }
        Ok(claimed)
    }

    /// Queues `key` at `score`, whether or not it was pending.
    pub async fn release(&self, key: &str, score: Score) -> Result<(), StoreError> {
        self.store.release(key, score).await
    }

    /// Queues `key` at `score` and drops `owner`'s lease, unless someone else
    /// owns it now.
    pub async fn reschedule(
        &self,
        key: &str,
        owner: &str,
        score: Score,
    ) -> Result<RescheduleOutcome, StoreError> {
        self.store.reschedule_owned(key, owner, score).await
    }

    /// Removes the keys matching `condition`.
    pub async fn remove_conditional(
        &self,
        keys: &[String],
        condition: &RemovalCondition,
    ) -> Result<RemovalResult, StoreError> {
        self.store.remove_conditional(keys, condition).await
    }

    /// Removes `keys` for good, whatever their state.
    pub async fn deregister(&self, keys: &[String]) -> Result<RemovalResult, StoreError> {
        self.remove_conditional(keys, &RemovalCondition::Unconditional)
            .await
    }

    /// Removes the `keys` that are not running anywhere. Running agents stay
    /// registered and keep their next run.
    pub async fn deregister_idle(&self, keys: &[String]) -> Result<RemovalResult, StoreError> {
        self.remove_conditional(keys, &RemovalCondition::NotLeased)
            .await
    }

    /// Re-queues at `now` up to `limit` registered agents that are neither
    /// pending nor leased, skipping any claimed within `min_age`.
    pub async fn restore_orphans(
        &self,
        now: Score,
        min_age: Duration,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let claimed_before = now.saturating_sub(min_age.as_secs() as i64);
        let restored = self
            .store
            .restore_orphans(now, claimed_before, limit)
            .await?;
        if !restored.is_empty() {
            self.metrics.record_orphans_recovered(restored.len());
        }
        Ok(restored)
    }

    pub async fn score_of(&self, key: &str) -> Result<Option<Score>, StoreError> {
        self.store.score_of(key).await
    }

    pub async fn pending_count(&self) -> Result<usize, StoreError> {
        self.store.pending_count().await
    }

    pub async fn registered_agents(&self) -> Result<Vec<String>, StoreError> {
        self.store.registered_agents().await
    }

    /// Returns queue statistics as of `now`.
    pub async fn stats(&self, now: Score) -> Result<QueueStats, StoreError> {
        let (pending, due, registered) = tokio::try_join!(
            self.store.pending_count(),
            self.store.due_count(now),
            self.store.registered_agents()
        )?;
        self.metrics.update_pending_agents(pending);

        Ok(QueueStats {
            pending,
            due,
            registered: registered.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn queue() -> (DistributedQueue, MemoryStore) {
        let store = MemoryStore::with_clock(Arc::new(ManualClock::at_secs(1_000)));
        (DistributedQueue::new(Arc::new(store.clone())), store)
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_registration_offset() {
        let window = Duration::from_secs(30);
        let a = registration_offset_secs("AwsCachingAgent/us-east-1", window);
        assert!((0..30).contains(&a));
        assert_eq!(a, registration_offset_secs("AwsCachingAgent/us-east-1", window));
        assert_eq!(registration_offset_secs("anything", Duration::ZERO), 0);
        assert_eq!(registration_offset_secs("anything", Duration::from_millis(999)), 0);
    }

    #[test]
    fn test_registration_offsets_spread() {
        let window = Duration::from_secs(60);
        let distinct: std::collections::HashSet<i64> = (0..50)
            .map(|i| registration_offset_secs(&format!("agent-{}", i), window))
            .collect();
        assert!(distinct.len() > 10);
    }

    #[tokio::test]
    async fn test_add_agents_idempotent() {
        let (queue, _) = queue();
        let names = keys(&["a", "b", "c"]);

        assert_eq!(queue.add_agents(&names, 1_000).await.unwrap(), 3);
        assert_eq!(queue.add_agents(&names, 1_000).await.unwrap(), 0);
        assert_eq!(queue.pending_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_add_agents_skips_invalid_keys() {
        let (queue, _) = queue();
        let added = queue
            .add_agents(&keys(&["", "123", "valid"]), 1_000)
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(queue.registered_agents().await.unwrap(), keys(&["valid"]));
    }

    #[tokio::test]
    async fn test_add_agents_applies_jitter() {
        let (queue, _) = queue();
        let queue = queue.with_registration_jitter(Duration::from_secs(30));
        queue.add_agents(&keys(&["job-7"]), 1_000).await.unwrap();

        let expected = 1_000 + registration_offset_secs("job-7", Duration::from_secs(30));
        assert_eq!(queue.score_of("job-7").await.unwrap(), Some(expected));
    }

    #[tokio::test]
    async fn test_claim_release_and_stats() {
        let (queue, _) = queue();
        queue.add_agents(&keys(&["a", "b"]), 1_000).await.unwrap();
        queue.release("c", 2_000).await.unwrap();

        let claimed = queue.claim_due(1_000, 0).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let stats = queue.stats(1_000).await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending: 2,
                due: 1,
                registered: 3
            }
        );
        assert_eq!(stats.not_pending(), 1);
    }

    #[tokio::test]
    async fn test_deregister_removes_registration() {
        let (queue, _) = queue();
        queue.add_agents(&keys(&["a", "b"]), 1_000).await.unwrap();

        let result = queue.deregister(&keys(&["a", "zzz"])).await.unwrap();
        assert_eq!(result.removed, keys(&["a"]));
        assert_eq!(queue.registered_agents().await.unwrap(), keys(&["b"]));
    }

    #[tokio::test]
    async fn test_deregister_idle_keeps_running_agents() {
        let (queue, store) = queue();
        queue.add_agents(&keys(&["a", "b"]), 1_000).await.unwrap();
        store
            .claim_lease("a", "node-a", Duration::from_secs(30))
            .await
            .unwrap();

        let result = queue.deregister_idle(&keys(&["a", "b"])).await.unwrap();
        assert_eq!(result.removed, keys(&["b"]));
        assert_eq!(queue.registered_agents().await.unwrap(), keys(&["a"]));
    }

    #[tokio::test]
    async fn test_restore_orphans_waits_for_min_age() {
        let (queue, _) = queue();
        queue.add_agents(&keys(&["a"]), 1_000).await.unwrap();
        queue.claim_due(1_000, 1).await.unwrap();

        let min_age = Duration::from_secs(60);
        assert!(queue.restore_orphans(1_030, min_age, 10).await.unwrap().is_empty());
        assert_eq!(
            queue.restore_orphans(1_060, min_age, 10).await.unwrap(),
            keys(&["a"])
        );
        assert_eq!(queue.score_of("a").await.unwrap(), Some(1_060));
    }
}
