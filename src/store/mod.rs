//! Coordination store: the single source of truth for the ready-queue and
//! lease ownership.
//!
//! Every mutating operation on [`CoordinationStore`] is one atomic round
//! trip. The Redis implementation executes a Lua script per operation; the
//! in-memory implementation holds a single lock for the whole operation.
//!
//! # Data layout
//!
//! - **waiting**: sorted set of agent keys scored by next eligible run time
//!   (epoch seconds). A key present here is pending.
//! - **registered**: set of every agent key known to the cluster. Used to
//!   recover agents whose owner crashed and to refuse resurrecting agents
//!   that were deregistered while running.
//! - **claimed**: hash of agent key to the score at which it was last
//!   claimed. Orphan recovery leaves recently claimed keys alone, since
//!   their claimer may not have taken the lease yet.
//! - **lease**: per-agent owner record with a TTL. A key absent from
//!   waiting but holding a live lease is running.

pub mod memory;
pub mod parser;
pub mod redis_store;
pub mod scripts;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Sorted-set score: target execution time in epoch seconds.
pub type Score = i64;

/// An agent key removed from the waiting set by `claim_due`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedAgent {
    /// Agent identity.
    pub key: String,
    /// Score the agent held before it was claimed.
    pub score: Score,
}

/// Current holder of an agent lease as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: String,
    /// Remaining time to live in milliseconds.
    pub ttl_remaining_ms: i64,
}

/// Outcome of a conditional batch removal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalResult {
    pub removed_count: usize,
    pub removed: Vec<String>,
}

/// Predicate evaluated per key, inside the atomic removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCondition {
    /// Drop the key whatever its state.
    Unconditional,
    /// Drop keys nobody currently holds a lease for, leaving agents that are
    /// running somewhere in place.
    NotLeased,
}

impl RemovalCondition {
    /// Wire name used by the removal script.
    pub fn mode(&self) -> &'static str {
        match self {
            RemovalCondition::Unconditional => "any",
            RemovalCondition::NotLeased => "not_leased",
        }
    }
}

/// Result of an ownership-checked completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RescheduleOutcome {
    /// Caller owned the lease; the agent was requeued and the lease dropped.
    Rescheduled,
    /// Nobody held the lease any more; the agent was requeued.
    Requeued,
    /// Another owner holds the lease; nothing changed.
    NotOwner,
    /// The agent was deregistered while running; it was not requeued.
    Deregistered,
}

impl RescheduleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RescheduleOutcome::Rescheduled => "rescheduled",
            RescheduleOutcome::Requeued => "requeued",
            RescheduleOutcome::NotOwner => "not_owner",
            RescheduleOutcome::Deregistered => "deregistered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rescheduled" => Some(RescheduleOutcome::Rescheduled),
            "requeued" => Some(RescheduleOutcome::Requeued),
            "not_owner" => Some(RescheduleOutcome::NotOwner),
            "deregistered" => Some(RescheduleOutcome::Deregistered),
            _ => None,
        }
    }
}

impl std::fmt::Display for RescheduleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic operations the scheduler needs from its backing store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Registers every key and inserts the ones that are neither pending nor
    /// leased. Returns how many were inserted.
    async fn add_agents(&self, entries: &[(String, Score)]) -> Result<usize, StoreError>;

    /// Removes up to `limit` members scored at or before `now` and returns
    /// them with their prior scores. Each is stamped as claimed at `now`.
    ///
    /// Not idempotent: a retried call after a lost reply claims more work.
    async fn claim_due(&self, now: Score, limit: usize) -> Result<Vec<ClaimedAgent>, StoreError>;

    /// Inserts or rescores a member and registers it.
    async fn release(&self, key: &str, score: Score) -> Result<(), StoreError>;

    /// Requeues `key` at `score` and drops the lease, only if `owner` still
    /// holds it (or nobody does).
    async fn reschedule_owned(
        &self,
        key: &str,
        owner: &str,
        score: Score,
    ) -> Result<RescheduleOutcome, StoreError>;

    /// Removes the keys matching `condition` from both the waiting and the
    /// registered sets.
    async fn remove_conditional(
        &self,
        keys: &[String],
        condition: &RemovalCondition,
    ) -> Result<RemovalResult, StoreError>;

    /// Re-inserts, at `score`, up to `limit` registered keys that are
    /// neither pending nor leased and were last claimed at or before
    /// `claimed_before` (or never claimed).
    async fn restore_orphans(
        &self,
        score: Score,
        claimed_before: Score,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Takes the lease unless a live lease belongs to someone else. Claiming
    /// a lease the caller already owns extends it.
    async fn claim_lease(&self, key: &str, owner: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Extends the lease only if `owner` holds it.
    async fn renew_lease(&self, key: &str, owner: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Drops the lease only if `owner` holds it.
    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, StoreError>;

    async fn lease_of(&self, key: &str) -> Result<Option<LeaseRecord>, StoreError>;

    async fn score_of(&self, key: &str) -> Result<Option<Score>, StoreError>;

    async fn pending_count(&self) -> Result<usize, StoreError>;

    async fn due_count(&self, now: Score) -> Result<usize, StoreError>;

    async fn registered_agents(&self) -> Result<Vec<String>, StoreError>;

    /// Authoritative store time in epoch milliseconds.
    async fn server_time_ms(&self) -> Result<i64, StoreError>;
}

/// Agent keys must not be purely numeric; such members are indistinguishable
/// from scores in flattened script arguments.
pub fn is_valid_agent_key(key: &str) -> bool {
    !key.is_empty() && key.trim().parse::<f64>().is_err()
}
