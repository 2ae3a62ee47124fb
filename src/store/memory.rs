//! In-memory coordination store.
//!
//! Mirrors the semantics of the Redis scripts, holding one lock for the whole
//! of each operation. Lease expiry is evaluated against an injected clock,
//! so tests can move time forward without sleeping. Clones share state,
//! which lets several schedulers in one process contend like separate nodes.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    is_valid_agent_key, ClaimedAgent, CoordinationStore, LeaseRecord, RemovalCondition,
    RemovalResult, RescheduleOutcome, Score,
};
use crate::clock::{ClockSource, SystemClock};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct State {
    waiting: HashMap<String, Score>,
    order: BTreeSet<(Score, String)>,
    registered: BTreeSet<String>,
    /// agent -> score of its last claim
    claimed_at: HashMap<String, Score>,
    /// agent -> (owner, expires at epoch ms)
    leases: HashMap<String, (String, i64)>,
}

impl State {
    fn zadd(&mut self, key: &str, score: Score) {
        if let Some(prev) = self.waiting.insert(key.to_string(), score) {
            self.order.remove(&(prev, key.to_string()));
        }
        self.order.insert((score, key.to_string()));
    }

    fn zrem(&mut self, key: &str) -> bool {
        match self.waiting.remove(key) {
            Some(prev) => {
                self.order.remove(&(prev, key.to_string()));
                true
            }
            None => false,
        }
    }

    /// Returns the live lease for `key`, dropping it first if expired.
    fn live_lease(&mut self, key: &str, now_ms: i64) -> Option<&(String, i64)> {
        let expired = matches!(self.leases.get(key), Some((_, expires)) if *expires <= now_ms);
        if expired {
            self.leases.remove(key);
        }
        self.leases.get(key)
    }

    fn is_leased(&mut self, key: &str, now_ms: i64) -> bool {
        self.live_lease(key, now_ms).is_some()
    }
}

/// Coordination store held in process memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn ClockSource>,
    claim_calls: Arc<AtomicUsize>,
    failing_lease_claims: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store whose leases expire on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store whose leases expire on `clock`.
    pub fn with_clock(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            claim_calls: Arc::new(AtomicUsize::new(0)),
            failing_lease_claims: Arc::new(AtomicUsize::new(0)),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of `claim_due` calls that reached the store.
    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }

    /// Makes the next `count` lease claims fail with a connection error.
    pub fn fail_lease_claims(&self, count: usize) {
        self.failing_lease_claims.store(count, Ordering::SeqCst);
    }

    /// Makes every following call fail with a connection error, as if the
    /// store went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionFailed(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn add_agents(&self, entries: &[(String, Score)]) -> Result<usize, StoreError> {
        self.check_available()?;
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;

        let mut added = 0;
        for (agent, score) in entries {
            if !is_valid_agent_key(agent) {
                continue;
            }
            state.registered.insert(agent.clone());
            if !state.waiting.contains_key(agent) && !state.is_leased(agent, now_ms) {
                state.zadd(agent, *score);
                added += 1;
            }
        }
        Ok(added)
    }

    async fn claim_due(&self, now: Score, limit: usize) -> Result<Vec<ClaimedAgent>, StoreError> {
        self.check_available()?;
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        let due: Vec<(Score, String)> = state
            .order
            .iter()
            .take_while(|(score, _)| *score <= now)
            .take(limit)
            .cloned()
            .collect();

        Ok(due
            .into_iter()
            .filter_map(|(score, key)| {
                if !state.zrem(&key) {
                    return None;
                }
                state.claimed_at.insert(key.clone(), now);
                Some(ClaimedAgent { key, score })
            })
            .collect())
    }

    async fn release(&self, key: &str, score: Score) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.registered.insert(key.to_string());
        state.zadd(key, score);
        state.claimed_at.remove(key);
        Ok(())
    }

    async fn reschedule_owned(
        &self,
        key: &str,
        owner: &str,
        score: Score,
    ) -> Result<RescheduleOutcome, StoreError> {
        self.check_available()?;
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;

        let current = state.live_lease(key, now_ms).map(|(o, _)| o.clone());
        if let Some(current) = &current {
            if current != owner {
                return Ok(RescheduleOutcome::NotOwner);
            }
        }
        state.claimed_at.remove(key);
        if !state.registered.contains(key) {
            state.leases.remove(key);
            return Ok(RescheduleOutcome::Deregistered);
        }
        state.zadd(key, score);
        if current.is_some() {
            state.leases.remove(key);
            return Ok(RescheduleOutcome::Rescheduled);
        }
        Ok(RescheduleOutcome::Requeued)
    }

    async fn remove_conditional(
        &self,
        keys: &[String],
        condition: &RemovalCondition,
    ) -> Result<RemovalResult, StoreError> {
        self.check_available()?;
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;

        let mut result = RemovalResult::default();
        for key in keys {
            let matched = match condition {
                RemovalCondition::Unconditional => true,
                RemovalCondition::NotLeased => !state.is_leased(key, now_ms),
            };
            if !matched {
                continue;
            }
            state.claimed_at.remove(key);
            let from_waiting = state.zrem(key);
            let from_registered = state.registered.remove(key);
            if from_waiting || from_registered {
                result.removed.push(key.clone());
                result.removed_count += 1;
            }
        }
        Ok(result)
    }

    async fn restore_orphans(
        &self,
        score: Score,
        claimed_before: Score,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;

        let candidates: Vec<String> = state.registered.iter().cloned().collect();
        let mut restored = Vec::new();
        for agent in candidates {
            if restored.len() >= limit {
                break;
            }
            let settled = state
                .claimed_at
                .get(&agent)
                .map_or(true, |claimed| *claimed <= claimed_before);
            if settled && !state.waiting.contains_key(&agent) && !state.is_leased(&agent, now_ms)
            {
                state.zadd(&agent, score);
                state.claimed_at.remove(&agent);
                restored.push(agent);
            }
        }
        Ok(restored)
    }

    async fn claim_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let failing = self.failing_lease_claims.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |left| left.checked_sub(1),
        );
        if failing.is_ok() {
            return Err(StoreError::ConnectionFailed(
                "in-memory lease claim failed".to_string(),
            ));
        }
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;

        let expires = now_ms + ttl.as_millis().max(1) as i64;
        match state.live_lease(key, now_ms).map(|(o, _)| o.clone()) {
            Some(current) if current != owner => Ok(false),
            _ => {
                state
                    .leases
                    .insert(key.to_string(), (owner.to_string(), expires));
                Ok(true)
            }
        }
    }

    async fn renew_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;

        let expires = now_ms + ttl.as_millis().max(1) as i64;
        match state.live_lease(key, now_ms).map(|(o, _)| o.clone()) {
            Some(current) if current == owner => {
                state
                    .leases
                    .insert(key.to_string(), (owner.to_string(), expires));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;

        match state.live_lease(key, now_ms).map(|(o, _)| o.clone()) {
            Some(current) if current == owner => {
                state.leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lease_of(&self, key: &str) -> Result<Option<LeaseRecord>, StoreError> {
        self.check_available()?;
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;

        Ok(state
            .live_lease(key, now_ms)
            .map(|(owner, expires)| LeaseRecord {
                owner: owner.clone(),
                ttl_remaining_ms: expires - now_ms,
            }))
    }

    async fn score_of(&self, key: &str) -> Result<Option<Score>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.waiting.get(key).copied())
    }

    async fn pending_count(&self) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.waiting.len())
    }

    async fn due_count(&self, now: Score) -> Result<usize, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .take_while(|(score, _)| *score <= now)
            .count())
    }

    async fn registered_agents(&self) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.registered.iter().cloned().collect())
    }

    async fn server_time_ms(&self) -> Result<i64, StoreError> {
        self.check_available()?;
        Ok(self.now_ms())
    }
}
