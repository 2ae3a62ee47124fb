//! Redis-backed coordination store.
//!
//! Each mutating operation is a Lua script run through [`redis::Script`],
//! which sends `EVALSHA` and falls back to loading the body when the server
//! has not cached it yet. Read-only queries use plain commands.
//!
//! Calls are bounded by an operation timeout and transient failures
//! (dropped connections, IO errors, timeouts) are retried with exponential
//! backoff. Deterministic failures are returned immediately. `claimDue` is
//! the exception: a claim whose reply was lost has already removed members,
//! so it is never retried.
//!
//! Keys are laid out as `{prefix}:waiting`, `{prefix}:registered`,
//! `{prefix}:claimed` and `{prefix}:lease:<agent>`. The braces are a Redis
//! Cluster hash tag that puts all of them in one slot.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, Script, ScriptInvocation, Value};
use tracing::{debug, warn};

use super::parser;
use super::scripts;
use super::{
    ClaimedAgent, CoordinationStore, LeaseRecord, RemovalCondition, RemovalResult,
    RescheduleOutcome, Score,
};
use crate::error::StoreError;
use crate::metrics::MetricsCollector;

/// Default key prefix for every key this store touches.
pub const DEFAULT_KEY_PREFIX: &str = "scheduler";

/// Maximum number of attempts for a transient failure.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff in milliseconds.
const DEFAULT_BASE_RETRY_DELAY_MS: u64 = 100;

/// Per-call timeout in seconds.
const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 5;

/// A lost `claimDue` reply may already have removed members.
const CLAIM_DUE_ATTEMPTS: u32 = 1;

/// Wraps `prefix` in a Redis Cluster hash tag.
fn hash_tag(prefix: &str) -> String {
    format!("{{{}}}", prefix)
}

/// Connection-independent settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreOptions {
    /// Prefix for every key; wrapped in a hash tag when the keys are built.
    pub key_prefix: String,
    /// Attempts per call, first try included.
    pub max_retries: u32,
    /// Delay before the second attempt; doubles for every further attempt.
    pub base_retry_delay: Duration,
    /// Upper bound for a single round trip.
    pub operation_timeout: Duration,
}

impl Default for RedisStoreOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay: Duration::from_millis(DEFAULT_BASE_RETRY_DELAY_MS),
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
        }
    }
}

impl RedisStoreOptions {
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
struct Scripts {
    add_agents: Script,
    claim_due: Script,
    release: Script,
    reschedule_owned: Script,
    remove_conditional: Script,
    restore_orphans: Script,
    claim_lease: Script,
    renew_lease: Script,
    release_lease: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            add_agents: Script::new(scripts::ADD_AGENTS),
            claim_due: Script::new(scripts::CLAIM_DUE),
            release: Script::new(scripts::RELEASE),
            reschedule_owned: Script::new(scripts::RESCHEDULE_OWNED),
            remove_conditional: Script::new(scripts::REMOVE_AGENTS_CONDITIONAL),
            restore_orphans: Script::new(scripts::RESTORE_ORPHANS),
            claim_lease: Script::new(scripts::CLAIM_LEASE),
            renew_lease: Script::new(scripts::RENEW_LEASE),
            release_lease: Script::new(scripts::RELEASE_LEASE),
        }
    }
}

/// Coordination store backed by a Redis sorted set, a set and lease keys.
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    waiting_key: String,
    registered_key: String,
    claimed_key: String,
    lease_prefix: String,
    scripts: Scripts,
    options: RedisStoreOptions,
}

impl RedisStore {
    /// Connects to Redis and creates a store.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, options: RedisStoreOptions) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, options))
    }

    /// Creates a store from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, options: RedisStoreOptions) -> Self {
        let tag = hash_tag(&options.key_prefix);
        Self {
            redis,
            waiting_key: format!("{}:waiting", tag),
            registered_key: format!("{}:registered", tag),
            claimed_key: format!("{}:claimed", tag),
            lease_prefix: format!("{}:lease:", tag),
            scripts: Scripts::load(),
            options,
        }
    }

    fn lease_key(&self, agent: &str) -> String {
        format!("{}{}", self.lease_prefix, agent)
    }

    /// Runs `call` with a timeout, retrying transient failures.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, redis::RedisError>>,
    {
        self.with_retry_attempts(operation, self.options.max_retries, call)
            .await
    }

    async fn with_retry_attempts<T, F, Fut>(
        &self,
        operation: &'static str,
        attempts: u32,
        call: F,
    ) -> Result<T, StoreError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, redis::RedisError>>,
    {
        let max_retries = attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_retries {
            if attempt > 0 {
                let delay = self.options.base_retry_delay * (1u32 << (attempt - 1));
                tokio::time::sleep(delay).await;
                debug!(
                    operation = operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying store operation after transient failure"
                );
            }

            let result =
                match tokio::time::timeout(self.options.operation_timeout, call(self.redis.clone()))
                    .await
                {
                    Ok(result) => result.map_err(StoreError::from),
                    Err(_) => Err(StoreError::Timeout(self.options.operation_timeout)),
                };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    warn!(
                        operation = operation,
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        error = %err,
                        "Transient store error, will retry"
                    );
                    MetricsCollector::new().record_store_error(operation);
                    last_error = Some(err);
                }
                Err(err) => {
                    MetricsCollector::new().record_store_error(operation);
                    return Err(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            StoreError::ConnectionFailed("Max retries exceeded with no error captured".to_string())
        }))
    }

    async fn run_script(
        &self,
        operation: &'static str,
        invocation: &ScriptInvocation<'_>,
    ) -> Result<Value, StoreError> {
        self.run_script_attempts(operation, self.options.max_retries, invocation)
            .await
    }

    async fn run_script_attempts(
        &self,
        operation: &'static str,
        attempts: u32,
        invocation: &ScriptInvocation<'_>,
    ) -> Result<Value, StoreError> {
        self.with_retry_attempts(operation, attempts, move |mut conn| async move {
            invocation.invoke_async::<_, Value>(&mut conn).await
        })
        .await
    }

    async fn run_cmd<T: FromRedisValue>(
        &self,
        operation: &'static str,
        cmd: &redis::Cmd,
    ) -> Result<T, StoreError> {
        self.with_retry(operation, move |mut conn| async move {
            cmd.query_async::<_, T>(&mut conn).await
        })
        .await
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn add_agents(&self, entries: &[(String, Score)]) -> Result<usize, StoreError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut invocation = self.scripts.add_agents.prepare_invoke();
        invocation.key(&self.waiting_key).key(&self.registered_key);
        for (agent, score) in entries {
            invocation.key(self.lease_key(agent)).arg(agent).arg(*score);
        }

        let reply = self.run_script("addAgents", &invocation).await?;
        Ok(parser::parse_add_agents_count(&reply))
    }

    async fn claim_due(&self, now: Score, limit: usize) -> Result<Vec<ClaimedAgent>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut invocation = self.scripts.claim_due.prepare_invoke();
        invocation
            .key(&self.waiting_key)
            .key(&self.claimed_key)
            .arg(now)
            .arg(limit);

        let reply = self
            .run_script_attempts("claimDue", CLAIM_DUE_ATTEMPTS, &invocation)
            .await?;
        Ok(parser::parse_claimed(&reply))
    }

    async fn release(&self, key: &str, score: Score) -> Result<(), StoreError> {
        let mut invocation = self.scripts.release.prepare_invoke();
        invocation
            .key(&self.waiting_key)
            .key(&self.registered_key)
            .key(&self.claimed_key)
            .arg(key)
            .arg(score);

        self.run_script("release", &invocation).await?;
        Ok(())
    }

    async fn reschedule_owned(
        &self,
        key: &str,
        owner: &str,
        score: Score,
    ) -> Result<RescheduleOutcome, StoreError> {
        let mut invocation = self.scripts.reschedule_owned.prepare_invoke();
        invocation
            .key(&self.waiting_key)
            .key(&self.registered_key)
            .key(&self.claimed_key)
            .key(self.lease_key(key))
            .arg(key)
            .arg(owner)
            .arg(score);

        let reply = self.run_script("rescheduleOwned", &invocation).await?;
        Ok(parser::parse_reschedule_outcome(&reply))
    }

    async fn remove_conditional(
        &self,
        keys: &[String],
        condition: &RemovalCondition,
    ) -> Result<RemovalResult, StoreError> {
        if keys.is_empty() {
            return Ok(RemovalResult::default());
        }

        let mut invocation = self.scripts.remove_conditional.prepare_invoke();
        invocation
            .key(&self.waiting_key)
            .key(&self.registered_key)
            .key(&self.claimed_key)
            .arg(condition.mode());
        for key in keys {
            invocation.key(self.lease_key(key)).arg(key);
        }

        let reply = self.run_script("removeAgentsConditional", &invocation).await?;
        Ok(parser::parse_remove_agents_conditional(&reply))
    }

    async fn restore_orphans(
        &self,
        score: Score,
        claimed_before: Score,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut invocation = self.scripts.restore_orphans.prepare_invoke();
        invocation
            .key(&self.waiting_key)
            .key(&self.registered_key)
            .key(&self.claimed_key)
            .arg(&self.lease_prefix)
            .arg(score)
            .arg(claimed_before)
            .arg(limit);

        let reply = self.run_script("restoreOrphans", &invocation).await?;
        Ok(parser::parse_restored_orphans(&reply))
    }

    async fn claim_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut invocation = self.scripts.claim_lease.prepare_invoke();
        invocation
            .key(self.lease_key(key))
            .arg(owner)
            .arg(ttl.as_millis().max(1) as u64);

        let reply = self.run_script("claimLease", &invocation).await?;
        Ok(parser::parse_flag("claimLease", &reply))
    }

    async fn renew_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut invocation = self.scripts.renew_lease.prepare_invoke();
        invocation
            .key(self.lease_key(key))
            .arg(owner)
            .arg(ttl.as_millis().max(1) as u64);

        let reply = self.run_script("renewLease", &invocation).await?;
        Ok(parser::parse_flag("renewLease", &reply))
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut invocation = self.scripts.release_lease.prepare_invoke();
        invocation.key(self.lease_key(key)).arg(owner);

        let reply = self.run_script("releaseLease", &invocation).await?;
        Ok(parser::parse_flag("releaseLease", &reply))
    }

    async fn lease_of(&self, key: &str) -> Result<Option<LeaseRecord>, StoreError> {
        let lease_key = self.lease_key(key);
        let mut pipe = redis::pipe();
        pipe.atomic().get(&lease_key).pttl(&lease_key);
        let pipe = &pipe;

        let (owner, ttl): (Option<String>, i64) = self
            .with_retry("leaseOf", move |mut conn| async move {
                pipe.query_async(&mut conn).await
            })
            .await?;

        // PTTL answers -2 for a missing key and -1 for a key without expiry.
        Ok(owner.map(|owner| LeaseRecord {
            owner,
            ttl_remaining_ms: ttl.max(0),
        }))
    }

    async fn score_of(&self, key: &str) -> Result<Option<Score>, StoreError> {
        let mut cmd = redis::cmd("ZSCORE");
        cmd.arg(&self.waiting_key).arg(key);
        let score: Option<f64> = self.run_cmd("scoreOf", &cmd).await?;
        Ok(score.map(|s| s.floor() as Score))
    }

    async fn pending_count(&self) -> Result<usize, StoreError> {
        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(&self.waiting_key);
        self.run_cmd("pendingCount", &cmd).await
    }

    async fn due_count(&self, now: Score) -> Result<usize, StoreError> {
        let mut cmd = redis::cmd("ZCOUNT");
        cmd.arg(&self.waiting_key).arg("-inf").arg(now);
        self.run_cmd("dueCount", &cmd).await
    }

    async fn registered_agents(&self) -> Result<Vec<String>, StoreError> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(&self.registered_key);
        let mut agents: Vec<String> = self.run_cmd("registeredAgents", &cmd).await?;
        agents.sort();
        Ok(agents)
    }

    async fn server_time_ms(&self) -> Result<i64, StoreError> {
        let cmd = redis::cmd("TIME");
        let (secs, micros): (i64, i64) = self.run_cmd("serverTime", &cmd).await?;
        Ok(secs * 1000 + micros / 1000)
    }
}
