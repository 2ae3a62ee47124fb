//! Scheduler configuration.
//!
//! Every setting has a documented default and can be overridden through
//! `SCHEDULER_*` environment variables. Numeric settings that would make the
//! loop degenerate (zero batch size, zero lease TTL) are floor-clamped by the
//! `effective_*` accessors rather than rejected, so a bad value slows the
//! scheduler down instead of stopping it. Settings without a sensible clamp
//! (empty redis url, empty node id) fail fast in [`SchedulerConfig::validate`].

use std::time::Duration;

use regex::Regex;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::store::redis_store::{RedisStoreOptions, DEFAULT_KEY_PREFIX};

/// Smallest lease TTL the scheduler will use, in milliseconds.
pub const MIN_LEASE_TTL_MS: i64 = 1_000;

/// Configuration for the priority scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    // Store settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix of every key the scheduler touches.
    pub key_prefix: String,
    /// Identity written into leases held by this process.
    pub node_id: String,
    /// Attempts per store call for transient failures.
    pub store_max_retries: u32,
    /// Delay before the second store attempt; doubles afterwards.
    pub store_retry_base_delay: Duration,
    /// Upper bound for a single store round trip.
    pub store_operation_timeout: Duration,

    // Loop settings
    /// Fixed delay between loop iterations.
    pub poll_interval: Duration,
    /// Minimum elapsed time between two polling cycles, in milliseconds.
    pub min_poll_interval_ms: i64,
    /// Per-cycle claiming budget in milliseconds; zero or negative disables it.
    pub cycle_budget_ms: i64,
    /// Maximum agents claimed per cycle. Clamped to at least 1.
    pub batch_limit: i64,
    /// Maximum agents executing at once on this node.
    pub max_concurrent_agents: usize,

    // Lease settings
    /// Lease time to live in milliseconds. Clamped to at least one second.
    pub lease_ttl_ms: i64,
    /// Lease renewal period in milliseconds; zero or negative means TTL/3.
    pub renewal_interval_ms: i64,

    // Cadence settings
    /// Interval used when an agent gives no next-run hint.
    pub default_agent_interval: Duration,
    /// Delay after the first consecutive failure.
    pub failure_backoff_base: Duration,
    /// Growth factor applied per further consecutive failure.
    pub failure_backoff_multiplier: f64,
    /// Longest failure delay.
    pub failure_backoff_cap: Duration,
    /// Consecutive failures scored with the backoff delay before reverting
    /// to the normal interval.
    pub failure_max_retries: u32,
    /// Window across which initial scores of new agents are spread.
    pub registration_jitter: Duration,

    // Maintenance settings
    /// Period of the orphan recovery pass.
    pub orphan_recovery_interval: Duration,
    /// Maximum agents restored per recovery pass.
    pub orphan_recovery_batch: usize,
    /// How long after its last claim an unleased agent counts as orphaned.
    /// Covers the gap between claiming an agent and taking its lease.
    pub orphan_min_age: Duration,
    /// Longest an agent may run before the zombie pass aborts it; zero
    /// disables the pass.
    pub max_execution: Duration,
    /// Grace added to the execution limit before a run counts as a zombie.
    pub zombie_buffer: Duration,
    /// Period of the zombie pass.
    pub zombie_check_interval: Duration,
    /// Agents whose key matches this regex get `exceptional_max_execution`.
    pub exceptional_agent_pattern: Option<String>,
    /// Execution limit for agents matching `exceptional_agent_pattern`.
    pub exceptional_max_execution: Duration,
    /// Period of the health summary log line.
    pub health_summary_interval: Duration,
    /// How long a measured server clock offset is trusted.
    pub time_sync_cache: Duration,
    /// How long shutdown waits for in-flight agents.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            // Store defaults
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            node_id: format!("node-{}", Uuid::new_v4()),
            store_max_retries: 3,
            store_retry_base_delay: Duration::from_millis(100),
            store_operation_timeout: Duration::from_secs(5),

            // Loop defaults
            poll_interval: Duration::from_secs(1),
            min_poll_interval_ms: 1_000,
            cycle_budget_ms: 10_000,
            batch_limit: 50,
            max_concurrent_agents: 16,

            // Lease defaults
            lease_ttl_ms: 60_000,
            renewal_interval_ms: 0,

            // Cadence defaults
            default_agent_interval: Duration::from_secs(60),
            failure_backoff_base: Duration::from_secs(30),
            failure_backoff_multiplier: 2.0,
            failure_backoff_cap: Duration::from_secs(600),
            failure_max_retries: 3,
            registration_jitter: Duration::from_secs(30),

            // Maintenance defaults
            orphan_recovery_interval: Duration::from_secs(30),
            orphan_recovery_batch: 100,
            orphan_min_age: Duration::from_secs(120),
            max_execution: Duration::from_secs(600),
            zombie_buffer: Duration::from_secs(30),
            zombie_check_interval: Duration::from_secs(300),
            exceptional_agent_pattern: None,
            exceptional_max_execution: Duration::from_secs(3_600),
            health_summary_interval: Duration::from_secs(60),
            time_sync_cache: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SCHEDULER_REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `SCHEDULER_KEY_PREFIX`: Key prefix (default: scheduler)
    /// - `SCHEDULER_NODE_ID`: Lease owner identity (default: random)
    /// - `SCHEDULER_STORE_MAX_RETRIES`: Store call attempts (default: 3)
    /// - `SCHEDULER_STORE_RETRY_BASE_MS`: Store retry base delay (default: 100)
    /// - `SCHEDULER_STORE_TIMEOUT_MS`: Store call timeout (default: 5000)
    /// - `SCHEDULER_POLL_INTERVAL_MS`: Loop delay (default: 1000)
    /// - `SCHEDULER_MIN_POLL_INTERVAL_MS`: Cadence gate (default: 1000)
    /// - `SCHEDULER_CYCLE_BUDGET_MS`: Cycle budget, <= 0 disables (default: 10000)
    /// - `SCHEDULER_BATCH_LIMIT`: Claims per cycle (default: 50)
    /// - `SCHEDULER_MAX_CONCURRENT_AGENTS`: Parallel executions (default: 16)
    /// - `SCHEDULER_LEASE_TTL_MS`: Lease TTL (default: 60000)
    /// - `SCHEDULER_RENEWAL_INTERVAL_MS`: Renewal period, <= 0 means TTL/3 (default: 0)
    /// - `SCHEDULER_DEFAULT_INTERVAL_MS`: Default agent interval (default: 60000)
    /// - `SCHEDULER_FAILURE_BACKOFF_BASE_MS`: First failure delay (default: 30000)
    /// - `SCHEDULER_FAILURE_BACKOFF_MULTIPLIER`: Failure delay growth (default: 2.0)
    /// - `SCHEDULER_FAILURE_BACKOFF_CAP_MS`: Longest failure delay (default: 600000)
    /// - `SCHEDULER_FAILURE_MAX_RETRIES`: Backed-off failures (default: 3)
    /// - `SCHEDULER_REGISTRATION_JITTER_MS`: Initial score spread (default: 30000)
    /// - `SCHEDULER_ORPHAN_RECOVERY_INTERVAL_MS`: Recovery period (default: 30000)
    /// - `SCHEDULER_ORPHAN_RECOVERY_BATCH`: Restores per pass (default: 100)
    /// - `SCHEDULER_ORPHAN_MIN_AGE_MS`: Claim age before recovery (default: 120000)
    /// - `SCHEDULER_MAX_EXECUTION_MS`: Zombie limit, 0 disables (default: 600000)
    /// - `SCHEDULER_ZOMBIE_BUFFER_MS`: Grace over the limit (default: 30000)
    /// - `SCHEDULER_ZOMBIE_CHECK_INTERVAL_MS`: Zombie pass period (default: 300000)
    /// - `SCHEDULER_EXCEPTIONAL_AGENT_PATTERN`: Regex of long-running agents (default: unset)
    /// - `SCHEDULER_EXCEPTIONAL_MAX_EXECUTION_MS`: Their limit (default: 3600000)
    /// - `SCHEDULER_HEALTH_INTERVAL_MS`: Health summary period (default: 60000)
    /// - `SCHEDULER_TIME_SYNC_CACHE_MS`: Clock offset lifetime (default: 60000)
    /// - `SCHEDULER_SHUTDOWN_TIMEOUT_MS`: Shutdown wait (default: 30000)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Store settings
        if let Ok(val) = std::env::var("SCHEDULER_REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("SCHEDULER_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Ok(val) = std::env::var("SCHEDULER_NODE_ID") {
            config.node_id = val;
        }

        if let Ok(val) = std::env::var("SCHEDULER_STORE_MAX_RETRIES") {
            config.store_max_retries = parse_env_value(&val, "SCHEDULER_STORE_MAX_RETRIES")?;
        }

        if let Some(d) = env_millis("SCHEDULER_STORE_RETRY_BASE_MS")? {
            config.store_retry_base_delay = d;
        }

        if let Some(d) = env_millis("SCHEDULER_STORE_TIMEOUT_MS")? {
            config.store_operation_timeout = d;
        }

        // Loop settings
        if let Some(d) = env_millis("SCHEDULER_POLL_INTERVAL_MS")? {
            config.poll_interval = d;
        }

        if let Ok(val) = std::env::var("SCHEDULER_MIN_POLL_INTERVAL_MS") {
            config.min_poll_interval_ms = parse_env_value(&val, "SCHEDULER_MIN_POLL_INTERVAL_MS")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_CYCLE_BUDGET_MS") {
            config.cycle_budget_ms = parse_env_value(&val, "SCHEDULER_CYCLE_BUDGET_MS")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_BATCH_LIMIT") {
            config.batch_limit = parse_env_value(&val, "SCHEDULER_BATCH_LIMIT")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_MAX_CONCURRENT_AGENTS") {
            config.max_concurrent_agents =
                parse_env_value(&val, "SCHEDULER_MAX_CONCURRENT_AGENTS")?;
        }

        // Lease settings
        if let Ok(val) = std::env::var("SCHEDULER_LEASE_TTL_MS") {
            config.lease_ttl_ms = parse_env_value(&val, "SCHEDULER_LEASE_TTL_MS")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_RENEWAL_INTERVAL_MS") {
            config.renewal_interval_ms = parse_env_value(&val, "SCHEDULER_RENEWAL_INTERVAL_MS")?;
        }

        // Cadence settings
        if let Some(d) = env_millis("SCHEDULER_DEFAULT_INTERVAL_MS")? {
            config.default_agent_interval = d;
        }

        if let Some(d) = env_millis("SCHEDULER_FAILURE_BACKOFF_BASE_MS")? {
            config.failure_backoff_base = d;
        }

        if let Ok(val) = std::env::var("SCHEDULER_FAILURE_BACKOFF_MULTIPLIER") {
            config.failure_backoff_multiplier =
                parse_env_value(&val, "SCHEDULER_FAILURE_BACKOFF_MULTIPLIER")?;
        }

        if let Some(d) = env_millis("SCHEDULER_FAILURE_BACKOFF_CAP_MS")? {
            config.failure_backoff_cap = d;
        }

        if let Ok(val) = std::env::var("SCHEDULER_FAILURE_MAX_RETRIES") {
            config.failure_max_retries = parse_env_value(&val, "SCHEDULER_FAILURE_MAX_RETRIES")?;
        }

        if let Some(d) = env_millis("SCHEDULER_REGISTRATION_JITTER_MS")? {
            config.registration_jitter = d;
        }

        // Maintenance settings
        if let Some(d) = env_millis("SCHEDULER_ORPHAN_RECOVERY_INTERVAL_MS")? {
            config.orphan_recovery_interval = d;
        }

        if let Ok(val) = std::env::var("SCHEDULER_ORPHAN_RECOVERY_BATCH") {
            config.orphan_recovery_batch =
                parse_env_value(&val, "SCHEDULER_ORPHAN_RECOVERY_BATCH")?;
        }

        if let Some(d) = env_millis("SCHEDULER_ORPHAN_MIN_AGE_MS")? {
            config.orphan_min_age = d;
        }

        if let Some(d) = env_millis("SCHEDULER_MAX_EXECUTION_MS")? {
            config.max_execution = d;
        }

        if let Some(d) = env_millis("SCHEDULER_ZOMBIE_BUFFER_MS")? {
            config.zombie_buffer = d;
        }

        if let Some(d) = env_millis("SCHEDULER_ZOMBIE_CHECK_INTERVAL_MS")? {
            config.zombie_check_interval = d;
        }

        if let Ok(val) = std::env::var("SCHEDULER_EXCEPTIONAL_AGENT_PATTERN") {
            if !val.trim().is_empty() {
                config.exceptional_agent_pattern = Some(val);
            }
        }

        if let Some(d) = env_millis("SCHEDULER_EXCEPTIONAL_MAX_EXECUTION_MS")? {
            config.exceptional_max_execution = d;
        }

        if let Some(d) = env_millis("SCHEDULER_HEALTH_INTERVAL_MS")? {
            config.health_summary_interval = d;
        }

        if let Some(d) = env_millis("SCHEDULER_TIME_SYNC_CACHE_MS")? {
            config.time_sync_cache = d;
        }

        if let Some(d) = env_millis("SCHEDULER_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = d;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates settings that have no safe clamp.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid, or
    /// `ConfigError::InvalidValue` for a pattern that does not compile.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.key_prefix.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        if self.node_id.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "node_id cannot be empty".to_string(),
            ));
        }

        if self.max_concurrent_agents == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_agents must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if !self.failure_backoff_multiplier.is_finite() || self.failure_backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "failure_backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.orphan_recovery_batch == 0 {
            return Err(ConfigError::ValidationFailed(
                "orphan_recovery_batch must be greater than 0".to_string(),
            ));
        }

        self.exceptional_agent_regex()?;

        Ok(())
    }

    /// Compiles `exceptional_agent_pattern`, if set.
    pub fn exceptional_agent_regex(&self) -> Result<Option<Regex>, ConfigError> {
        self.exceptional_agent_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| ConfigError::InvalidValue {
                    key: "exceptional_agent_pattern".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    /// Whether the zombie pass runs at all.
    pub fn zombie_reaping_enabled(&self) -> bool {
        !self.max_execution.is_zero()
    }

    /// Claim batch size, never below 1.
    pub fn effective_batch_limit(&self) -> usize {
        self.batch_limit.max(1) as usize
    }

    /// Lease TTL, never below one second.
    pub fn effective_lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms.max(MIN_LEASE_TTL_MS) as u64)
    }

    /// Renewal period: the configured value, or TTL/3 when unset, always
    /// strictly shorter than the TTL.
    pub fn effective_renewal_interval(&self) -> Duration {
        let ttl_ms = self.lease_ttl_ms.max(MIN_LEASE_TTL_MS);
        let interval_ms = if self.renewal_interval_ms > 0 {
            self.renewal_interval_ms.min(ttl_ms - 1)
        } else {
            ttl_ms / 3
        };
        Duration::from_millis(interval_ms.max(1) as u64)
    }

    /// Whether the per-cycle budget check is active.
    pub fn budget_enabled(&self) -> bool {
        self.cycle_budget_ms > 0
    }

    /// Options for a [`crate::store::RedisStore`] built from this config.
    pub fn store_options(&self) -> RedisStoreOptions {
        RedisStoreOptions {
            key_prefix: self.key_prefix.clone(),
            max_retries: self.store_max_retries.max(1),
            base_retry_delay: self.store_retry_base_delay,
            operation_timeout: self.store_operation_timeout,
        }
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Builder method to set the node identity.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Builder method to set the loop delay.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the cadence gate.
    pub fn with_min_poll_interval_ms(mut self, ms: i64) -> Self {
        self.min_poll_interval_ms = ms;
        self
    }

    /// Builder method to set the cycle budget.
    pub fn with_cycle_budget_ms(mut self, ms: i64) -> Self {
        self.cycle_budget_ms = ms;
        self
    }

    /// Builder method to set the claim batch size.
    pub fn with_batch_limit(mut self, limit: i64) -> Self {
        self.batch_limit = limit;
        self
    }

    /// Builder method to set the number of parallel executions.
    pub fn with_max_concurrent_agents(mut self, max: usize) -> Self {
        self.max_concurrent_agents = max;
        self
    }

    /// Builder method to set the lease TTL.
    pub fn with_lease_ttl_ms(mut self, ms: i64) -> Self {
        self.lease_ttl_ms = ms;
        self
    }

    /// Builder method to set the lease renewal period.
    pub fn with_renewal_interval_ms(mut self, ms: i64) -> Self {
        self.renewal_interval_ms = ms;
        self
    }

    /// Builder method to set the default agent interval.
    pub fn with_default_agent_interval(mut self, interval: Duration) -> Self {
        self.default_agent_interval = interval;
        self
    }

    /// Builder method to set the failure backoff curve.
    pub fn with_failure_backoff(
        mut self,
        base: Duration,
        multiplier: f64,
        cap: Duration,
        max_retries: u32,
    ) -> Self {
        self.failure_backoff_base = base;
        self.failure_backoff_multiplier = multiplier;
        self.failure_backoff_cap = cap;
        self.failure_max_retries = max_retries;
        self
    }

    /// Builder method to set the registration jitter window.
    pub fn with_registration_jitter(mut self, jitter: Duration) -> Self {
        self.registration_jitter = jitter;
        self
    }

    /// Builder method to set the orphan recovery period.
    pub fn with_orphan_recovery_interval(mut self, interval: Duration) -> Self {
        self.orphan_recovery_interval = interval;
        self
    }

    /// Builder method to set how old a claim must be before recovery.
    pub fn with_orphan_min_age(mut self, age: Duration) -> Self {
        self.orphan_min_age = age;
        self
    }

    /// Builder method to set the execution limits used by the zombie pass.
    pub fn with_max_execution(mut self, limit: Duration, buffer: Duration) -> Self {
        self.max_execution = limit;
        self.zombie_buffer = buffer;
        self
    }

    /// Builder method to set the zombie pass period.
    pub fn with_zombie_check_interval(mut self, interval: Duration) -> Self {
        self.zombie_check_interval = interval;
        self
    }

    /// Builder method to give agents matching `pattern` their own limit.
    pub fn with_exceptional_agents(mut self, pattern: impl Into<String>, limit: Duration) -> Self {
        self.exceptional_agent_pattern = Some(pattern.into());
        self.exceptional_max_execution = limit;
        self
    }

    /// Builder method to set the health summary period.
    pub fn with_health_summary_interval(mut self, interval: Duration) -> Self {
        self.health_summary_interval = interval;
        self
    }

    /// Builder method to set the clock offset lifetime.
    pub fn with_time_sync_cache(mut self, cache: Duration) -> Self {
        self.time_sync_cache = cache;
        self
    }

    /// Builder method to set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Reads a millisecond duration variable, if set.
fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => {
            let ms: u64 = parse_env_value(&val, key)?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}
