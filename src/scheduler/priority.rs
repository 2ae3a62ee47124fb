//! The scheduling control loop.
//!
//! Each polling cycle:
//!
//! 1. refuses to start if the previous cycle is still running or if less
//!    than the minimum poll interval has passed since it started;
//! 2. refreshes the cached server clock offset;
//! 3. claims up to `min(batch limit, free pool slots)` due agents;
//! 4. for each, takes the agent lease and dispatches it onto the worker
//!    pool, or puts it back when the lease is held elsewhere or this node
//!    is still running it;
//! 5. stops dispatching once the cycle budget is spent, returning the rest
//!    of the claimed agents at the score they held. A store error part way
//!    through returns them the same way before the cycle fails.
//!
//! A finished run is rescheduled in one ownership-checked store operation,
//! scored from the agent's hint, its interval, or the failure backoff. Lease
//! renewal, orphan recovery, the zombie pass and the health summary run as
//! periodic tasks independent of how long agents take.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use super::backoff::{FailureBackoff, FailureStreaks};
use super::cadence::{CadenceGuard, CycleBudget};
use super::executor::{ExecutorFactory, SingleFlight};
use super::lease::{AgentLeaseManager, LeaseRenewer, RenewalReport};
use super::queue::DistributedQueue;
use super::score::TimeScoreComputer;
use super::worker_pool::{PoolStats, WorkerPool};
use crate::agent::{Agent, ExecutionContext};
use crate::clock::{ClockSource, OffsetClock};
use crate::config::SchedulerConfig;
use crate::error::{AgentError, SchedulerError};
use crate::metrics::MetricsCollector;
use crate::store::{
    is_valid_agent_key, ClaimedAgent, CoordinationStore, RemovalResult, RescheduleOutcome,
};

/// Why a polling cycle did not claim anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The previous cycle is still running.
    InProgress,
    /// The minimum poll interval has not elapsed.
    Cadence,
    /// Every worker slot is busy.
    Saturated,
    /// The scheduler has been shut down.
    Stopped,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::InProgress => "in_progress",
            SkipReason::Cadence => "cadence",
            SkipReason::Saturated => "saturated",
            SkipReason::Stopped => "stopped",
        }
    }
}

/// What one polling cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub skipped: Option<SkipReason>,
    /// Agents removed from the queue by the claim.
    pub claimed: usize,
    /// Agents handed to the worker pool.
    pub dispatched: Vec<String>,
    /// Agents put back because another owner holds their lease.
    pub contended: Vec<String>,
    /// Agents put back because this node has no implementation for them.
    pub unknown: Vec<String>,
    /// Agents put back unexecuted because the cycle budget ran out.
    pub deferred: Vec<String>,
    /// Agents put back because a run of theirs is still executing here.
    pub already_running: Vec<String>,
}

impl TickReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// Lifetime counters of one scheduler.
#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    claimed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    contention: AtomicU64,
    orphans_recovered: AtomicU64,
    zombies_reaped: AtomicU64,
}

/// Point-in-time view of the scheduler and its queue.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub node_id: String,
    pub registered: usize,
    pub pending: usize,
    pub due: usize,
    pub local_agents: usize,
    pub active: usize,
    pub held_leases: usize,
    pub cycles: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub contention: u64,
    pub orphans_recovered: u64,
    pub zombies_reaped: u64,
}

impl HealthSummary {
    /// Due work is waiting while every local slot is busy.
    pub fn is_degraded(&self, max_concurrent: usize) -> bool {
        self.due > 0 && self.active >= max_concurrent
    }
}

struct Inner {
    config: SchedulerConfig,
    queue: DistributedQueue,
    leases: AgentLeaseManager,
    renewer: LeaseRenewer,
    scores: TimeScoreComputer,
    offset_clock: Arc<OffsetClock>,
    local_clock: Arc<dyn ClockSource>,
    cadence: CadenceGuard,
    tick_flight: SingleFlight,
    recovery_flight: SingleFlight,
    zombie_flight: SingleFlight,
    exceptional_agents: Option<Regex>,
    executors: ExecutorFactory,
    pool: WorkerPool,
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
    backoff: FailureBackoff,
    streaks: FailureStreaks,
    running: AtomicBool,
    stopped: AtomicBool,
    counters: Counters,
    metrics: MetricsCollector,
}

/// Distributed priority scheduler for one node.
///
/// Cheap to clone; clones drive the same scheduler.
#[derive(Clone)]
pub struct PriorityScheduler {
    inner: Arc<Inner>,
}

impl PriorityScheduler {
    /// Creates a scheduler, failing fast on invalid configuration.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let exceptional_agents = config.exceptional_agent_regex()?;

        let offset_clock = Arc::new(OffsetClock::new(Arc::clone(&clock)));
        let offset_source: Arc<dyn ClockSource> = offset_clock.clone();
        let scores = TimeScoreComputer::new(Some(offset_source), Arc::clone(&store), Arc::clone(&clock));
        let queue = DistributedQueue::new(Arc::clone(&store))
            .with_registration_jitter(config.registration_jitter);
        let leases = AgentLeaseManager::new(store);
        let renewer = LeaseRenewer::new(
            leases.clone(),
            config.node_id.clone(),
            config.effective_lease_ttl(),
        );
        let executors = ExecutorFactory::new();
        let pool = executors.worker_pool(config.max_concurrent_agents);

        Ok(Self {
            inner: Arc::new(Inner {
                cadence: CadenceGuard::new(config.min_poll_interval_ms),
                backoff: FailureBackoff::from_config(&config),
                tick_flight: executors.single_flight(),
                recovery_flight: executors.single_flight(),
                zombie_flight: executors.single_flight(),
                exceptional_agents,
                config,
                queue,
                leases,
                renewer,
                scores,
                offset_clock,
                local_clock: clock,
                executors,
                pool,
                agents: RwLock::new(HashMap::new()),
                streaks: FailureStreaks::new(),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                counters: Counters::default(),
                metrics: MetricsCollector::new(),
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &DistributedQueue {
        &self.inner.queue
    }

    pub fn leases(&self) -> &AgentLeaseManager {
        &self.inner.leases
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Keys of the agents this node can execute, sorted.
    pub async fn local_agents(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.agents.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Makes `agents` executable on this node and queues the ones the
    /// cluster does not know yet. Returns how many were queued.
    pub async fn register(&self, agents: Vec<Arc<dyn Agent>>) -> Result<usize, SchedulerError> {
        let inner = &self.inner;
        let mut keys = Vec::with_capacity(agents.len());
        {
            let mut local = inner.agents.write().await;
            for agent in agents {
                let key = agent.key().to_string();
                if !is_valid_agent_key(&key) {
                    warn!(agent = %key, "Refusing to register agent with an invalid key");
                    continue;
                }
                if local.insert(key.clone(), agent).is_some() {
                    warn!(agent = %key, "Replaced an agent already registered on this node");
                }
                keys.push(key);
            }
        }

        let now = inner.scores.now_score().await;
        let added = inner.queue.add_agents(&keys, now).await?;
        info!(local = keys.len(), added = added, "Registered agents");
        Ok(added)
    }

    /// Removes `keys` from this node and from the cluster. Agents running
    /// right now finish but are not requeued.
    pub async fn deregister(&self, keys: &[String]) -> Result<RemovalResult, SchedulerError> {
        let inner = &self.inner;
        {
            let mut local = inner.agents.write().await;
            for key in keys {
                local.remove(key);
            }
        }
        for key in keys {
            inner.streaks.forget(key).await;
        }

        let result = inner.queue.deregister(keys).await?;
        info!(requested = keys.len(), removed = result.removed_count, "Deregistered agents");
        Ok(result)
    }

    /// Runs one polling cycle.
    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Ok(self.skip(SkipReason::Stopped));
        }
        let Some(_flight) = inner.tick_flight.try_enter() else {
            return Ok(self.skip(SkipReason::InProgress));
        };

        let started_ms = inner.local_clock.now_ms();
        if !inner.cadence.try_enter(started_ms) {
            return Ok(self.skip(SkipReason::Cadence));
        }
        let timer = Instant::now();
        inner.counters.cycles.fetch_add(1, Ordering::Relaxed);

        self.sync_clock().await;
        let budget = if inner.config.budget_enabled() {
            CycleBudget::start(started_ms, inner.config.cycle_budget_ms)
        } else {
            CycleBudget::unbounded()
        };

        let limit = inner.config.effective_batch_limit().min(inner.pool.available());
        if limit == 0 {
            return Ok(self.skip(SkipReason::Saturated));
        }

        let now = inner.scores.now_score().await;
        let claimed = inner.queue.claim_due(now, limit).await?;
        inner
            .counters
            .claimed
            .fetch_add(claimed.len() as u64, Ordering::Relaxed);

        let mut report = TickReport {
            claimed: claimed.len(),
            ..TickReport::default()
        };
        let mut remaining = claimed.into_iter();
        while let Some(agent) = remaining.next() {
            if budget.over_budget(inner.local_clock.now_ms()) {
                let deferred: Vec<ClaimedAgent> =
                    std::iter::once(agent).chain(remaining.by_ref()).collect();
                warn!(
                    deferred = deferred.len(),
                    budget_ms = inner.config.cycle_budget_ms,
                    "Cycle budget exhausted, returning claimed agents"
                );
                report.deferred = self.return_claimed(deferred).await;
                break;
            }
            let current = agent.clone();
            if let Err(e) = self.dispatch(agent, &mut report).await {
                let undispatched: Vec<ClaimedAgent> =
                    std::iter::once(current).chain(remaining.by_ref()).collect();
                let returned = self.return_claimed(undispatched).await;
                warn!(
                    error = %e,
                    returned = returned.len(),
                    "Store error while dispatching, returned claimed agents"
                );
                return Err(e);
            }
        }

        inner.metrics.update_active_agents(inner.pool.active());
        inner.metrics.record_cycle(timer.elapsed().as_secs_f64());
        if report.claimed > 0 {
            debug!(
                claimed = report.claimed,
                dispatched = report.dispatched.len(),
                contended = report.contended.len(),
                "Polling cycle finished"
            );
        }
        Ok(report)
    }

    /// Puts claimed agents back at the score they held. Best effort: a key
    /// that cannot be released is left for orphan recovery. Returns the keys
    /// released.
    async fn return_claimed(&self, claimed: Vec<ClaimedAgent>) -> Vec<String> {
        let mut returned = Vec::with_capacity(claimed.len());
        for entry in claimed {
            match self.inner.queue.release(&entry.key, entry.score).await {
                Ok(()) => returned.push(entry.key),
                Err(e) => warn!(
                    agent = %entry.key,
                    score = entry.score,
                    error = %e,
                    "Failed to return claimed agent, orphan recovery will restore it"
                ),
            }
        }
        returned
    }

    fn skip(&self, reason: SkipReason) -> TickReport {
        self.inner.metrics.record_cycle_skipped(reason.as_str());
        TickReport::skipped(reason)
    }

    async fn dispatch(
        &self,
        claimed: ClaimedAgent,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let key = claimed.key;

        let agent = inner.agents.read().await.get(&key).cloned();
        let Some(agent) = agent else {
            warn!(agent = %key, "Claimed an agent this node cannot run, returning it");
            let score = inner.scores.score_from_delay(inner.config.poll_interval).await;
            inner.queue.release(&key, score).await?;
            report.unknown.push(key);
            return Ok(());
        };

        // The key reached the queue again while a run of it is in flight here,
        // e.g. restored by another node's recovery pass. The lease would not
        // stop a second run since this node already owns it.
        if inner.pool.is_running(&key) || inner.renewer.is_tracked(&key).await {
            debug!(agent = %key, "Agent still running on this node, returning it");
            inner.queue.release(&key, claimed.score).await?;
            report.already_running.push(key);
            return Ok(());
        }

        let Some(permit) = inner.pool.try_acquire() else {
            inner.queue.release(&key, claimed.score).await?;
            report.deferred.push(key);
            return Ok(());
        };

        let owner = inner.config.node_id.as_str();
        if !inner
            .leases
            .claim(&key, owner, inner.config.effective_lease_ttl())
            .await?
        {
            inner.metrics.record_lease_contention(&key);
            inner.counters.contention.fetch_add(1, Ordering::Relaxed);
            let now = inner.scores.now_score().await;
            inner.queue.release(&key, now).await?;
            report.contended.push(key);
            return Ok(());
        }

        inner.renewer.track(&key).await;
        let ctx = ExecutionContext {
            agent_key: key.clone(),
            owner_id: owner.to_string(),
            attempt: inner.streaks.current(&key).await,
            claimed_score: claimed.score,
            started_at_ms: inner.local_clock.now_ms(),
        };

        let scheduler = self.clone();
        inner
            .pool
            .spawn(key.clone(), permit, async move { scheduler.run_agent(agent, ctx).await });
        report.dispatched.push(key);
        Ok(())
    }

    /// Executes one claimed agent and reschedules it. Returns whether the
    /// run succeeded; panics count as failures.
    async fn run_agent(&self, agent: Arc<dyn Agent>, ctx: ExecutionContext) -> bool {
        let inner = &self.inner;
        let key = ctx.agent_key.as_str();
        let started = Instant::now();

        let outcome = match AssertUnwindSafe(agent.execute(&ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(AgentError::Panicked(panic_message(payload.as_ref()))),
        };
        let elapsed = started.elapsed();

        let normal = agent
            .interval()
            .unwrap_or(inner.config.default_agent_interval);
        let (delay, success) = match &outcome {
            Ok(result) => {
                inner.streaks.record_success(key).await;
                inner.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                (result.next_delay.unwrap_or(normal), true)
            }
            Err(e) => {
                let streak = inner.streaks.record_failure(key).await;
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    agent = %key,
                    owner = %ctx.owner_id,
                    streak = streak,
                    error = %e,
                    "Agent execution failed"
                );
                (inner.backoff.delay_for(streak, normal), false)
            }
        };

        inner.renewer.untrack(key).await;
        self.complete(key, delay).await;

        let outcome_label = if success { "success" } else { "failure" };
        inner
            .metrics
            .record_execution(key, outcome_label, elapsed.as_secs_f64());
        success
    }

    /// Requeues a finished agent `delay` from now, releasing its lease.
    async fn complete(&self, key: &str, delay: Duration) {
        let inner = &self.inner;
        let owner = inner.config.node_id.as_str();
        let score = inner.scores.score_from_delay(delay).await;

        match inner.queue.reschedule(key, owner, score).await {
            Ok(RescheduleOutcome::Rescheduled) => {
                debug!(agent = %key, score = score, "Rescheduled agent");
            }
            Ok(RescheduleOutcome::Requeued) => {
                debug!(agent = %key, score = score, "Lease had expired, requeued agent");
            }
            Ok(RescheduleOutcome::NotOwner) => {
                warn!(agent = %key, owner = %owner, "Lease taken over during execution, completion ignored");
            }
            Ok(RescheduleOutcome::Deregistered) => {
                inner.streaks.forget(key).await;
                info!(agent = %key, "Agent deregistered while running, not requeued");
            }
            Err(e) => {
                error!(
                    agent = %key,
                    owner = %owner,
                    error = %e,
                    "Failed to reschedule agent, orphan recovery will restore it"
                );
            }
        }
    }

    /// Refreshes the server clock offset when the cached one is stale.
    /// Returns whether a new offset was recorded.
    pub async fn sync_clock(&self) -> bool {
        let inner = &self.inner;
        let cache_ms = i64::try_from(inner.config.time_sync_cache.as_millis()).unwrap_or(i64::MAX);
        if !inner.offset_clock.needs_sync(cache_ms) {
            return false;
        }

        let local_ms = inner.local_clock.now_ms();
        match inner.queue.store().server_time_ms().await {
            Ok(server_ms) if server_ms > 0 => {
                inner.offset_clock.record_server_time(server_ms, local_ms);
                debug!(offset_ms = server_ms - local_ms, "Synced clock with store");
                true
            }
            Ok(server_ms) => {
                warn!(server_ms = server_ms, "Store reported a non-positive time, keeping offset");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to sync clock with store");
                false
            }
        }
    }

    /// Renews the leases of every agent running on this node.
    pub async fn renew_leases(&self) -> RenewalReport {
        self.inner.renewer.renew_all().await
    }

    /// Requeues registered agents nobody is running or waiting on.
    ///
    /// Passes never overlap; a pass requested while another runs returns
    /// nothing.
    pub async fn recover_orphans(&self) -> Result<Vec<String>, SchedulerError> {
        let inner = &self.inner;
        let Some(_flight) = inner.recovery_flight.try_enter() else {
            return Ok(Vec::new());
        };

        let now = inner.scores.now_score().await;
        let restored = inner
            .queue
            .restore_orphans(
                now,
                inner.config.orphan_min_age,
                inner.config.orphan_recovery_batch,
            )
            .await?;
        if !restored.is_empty() {
            inner
                .counters
                .orphans_recovered
                .fetch_add(restored.len() as u64, Ordering::Relaxed);
            info!(count = restored.len(), agents = ?restored, "Restored orphaned agents");
        }
        Ok(restored)
    }

    /// Execution limit for `key`, before the zombie buffer.
    fn execution_limit(&self, key: &str) -> Duration {
        let inner = &self.inner;
        match &inner.exceptional_agents {
            Some(pattern) if pattern.is_match(key) => inner.config.exceptional_max_execution,
            _ => inner.config.max_execution,
        }
    }

    /// Aborts runs that have outlived their execution limit plus the zombie
    /// buffer and requeues them with the failure backoff. Returns the keys
    /// aborted.
    ///
    /// An abort takes effect at the agent's next await point.
    pub async fn reap_zombies(&self) -> Vec<String> {
        let inner = &self.inner;
        if !inner.config.zombie_reaping_enabled() {
            return Vec::new();
        }
        let Some(_flight) = inner.zombie_flight.try_enter() else {
            return Vec::new();
        };

        let mut reaped = Vec::new();
        for (key, elapsed) in inner.pool.running_for() {
            let limit = self.execution_limit(&key) + inner.config.zombie_buffer;
            if elapsed <= limit || !inner.pool.abort(&key) {
                continue;
            }
            warn!(
                agent = %key,
                elapsed_ms = elapsed.as_millis() as u64,
                limit_ms = limit.as_millis() as u64,
                "Aborted agent running past its execution limit"
            );

            inner.renewer.untrack(&key).await;
            let streak = inner.streaks.record_failure(&key).await;
            let normal = inner
                .agents
                .read()
                .await
                .get(&key)
                .and_then(|agent| agent.interval())
                .unwrap_or(inner.config.default_agent_interval);
            self.complete(&key, inner.backoff.delay_for(streak, normal))
                .await;

            inner.counters.zombies_reaped.fetch_add(1, Ordering::Relaxed);
            inner.metrics.record_zombie_reaped(&key);
            reaped.push(key);
        }
        reaped
    }

    pub async fn health(&self) -> Result<HealthSummary, SchedulerError> {
        let inner = &self.inner;
        let now = inner.scores.now_score().await;
        let stats = inner.queue.stats(now).await?;
        let counters = &inner.counters;

        Ok(HealthSummary {
            node_id: inner.config.node_id.clone(),
            registered: stats.registered,
            pending: stats.pending,
            due: stats.due,
            local_agents: inner.agents.read().await.len(),
            active: inner.pool.active(),
            held_leases: inner.renewer.held_keys().await.len(),
            cycles: counters.cycles.load(Ordering::Relaxed),
            claimed: counters.claimed.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            contention: counters.contention.load(Ordering::Relaxed),
            orphans_recovered: counters.orphans_recovered.load(Ordering::Relaxed),
            zombies_reaped: counters.zombies_reaped.load(Ordering::Relaxed),
        })
    }

    async fn log_health(&self) {
        match self.health().await {
            Ok(h) if h.is_degraded(self.inner.pool.max_concurrent()) => warn!(
                node = %h.node_id,
                registered = h.registered,
                pending = h.pending,
                due = h.due,
                active = h.active,
                "Scheduler saturated with due work waiting"
            ),
            Ok(h) => info!(
                node = %h.node_id,
                registered = h.registered,
                pending = h.pending,
                due = h.due,
                active = h.active,
                succeeded = h.succeeded,
                failed = h.failed,
                contention = h.contention,
                orphans_recovered = h.orphans_recovered,
                zombies_reaped = h.zombies_reaped,
                "Scheduler health"
            ),
            Err(e) => warn!(error = %e, "Failed to collect scheduler health"),
        }
    }

    /// Waits until no agent is executing on this node.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.pool.wait_idle(timeout).await
    }

    async fn start_background(&self) {
        let inner = &self.inner;
        let config = &inner.config;

        let scheduler = self.clone();
        inner
            .executors
            .spawn_periodic("lease-renewal", config.effective_renewal_interval(), move || {
                let scheduler = scheduler.clone();
                async move {
                    scheduler.renew_leases().await;
                }
            })
            .await;

        let scheduler = self.clone();
        inner
            .executors
            .spawn_periodic("orphan-recovery", config.orphan_recovery_interval, move || {
                let scheduler = scheduler.clone();
                async move {
                    if let Err(e) = scheduler.recover_orphans().await {
                        warn!(error = %e, "Orphan recovery failed");
                    }
                }
            })
            .await;

        if config.zombie_reaping_enabled() {
            let scheduler = self.clone();
            inner
                .executors
                .spawn_periodic("zombie-reaper", config.zombie_check_interval, move || {
                    let scheduler = scheduler.clone();
                    async move {
                        scheduler.reap_zombies().await;
                    }
                })
                .await;
        }

        let scheduler = self.clone();
        inner
            .executors
            .spawn_periodic("health-summary", config.health_summary_interval, move || {
                let scheduler = scheduler.clone();
                async move {
                    scheduler.log_health().await;
                }
            })
            .await;
    }

    /// Runs polling cycles on a fixed delay until `shutdown` fires, then
    /// shuts down gracefully.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        self.start_background().await;
        info!(
            node = %inner.config.node_id,
            poll_interval_ms = inner.config.poll_interval.as_millis() as u64,
            max_concurrent = inner.pool.max_concurrent(),
            "Priority scheduler started"
        );

        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Polling cycle failed");
                inner.metrics.record_cycle_skipped("store_error");
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(inner.config.poll_interval) => {}
            }
        }

        self.shutdown().await
    }

    /// Stops claiming, stops background tasks and waits for in-flight agents.
    ///
    /// Agents still running after the shutdown timeout are aborted and put
    /// back in the queue, due now, if this node still owns them.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        let timeout = inner.config.shutdown_timeout;
        info!(node = %inner.config.node_id, active = inner.pool.active(), "Shutting down scheduler");

        inner.executors.shutdown(timeout).await;
        let idle = inner.pool.wait_idle(timeout).await;
        inner.running.store(false, Ordering::SeqCst);
        if idle {
            info!("Scheduler stopped");
            return Ok(());
        }

        let aborted = inner.pool.abort_all();
        warn!(count = aborted.len(), "Agents still running at shutdown, aborting");
        inner.pool.wait_idle(Duration::from_secs(1)).await;

        let mut held: BTreeSet<String> = aborted.into_iter().collect();
        held.extend(inner.renewer.held_keys().await);
        let now = inner.scores.now_score().await;
        for key in held {
            inner.renewer.untrack(&key).await;
            match inner.queue.reschedule(&key, &inner.config.node_id, now).await {
                Ok(outcome) => debug!(agent = %key, outcome = %outcome, "Requeued aborted agent"),
                Err(e) => warn!(agent = %key, error = %e, "Failed to requeue aborted agent"),
            }
        }
        Err(SchedulerError::ShutdownTimeout(timeout))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ExecutionResult, FlakyAgent, NoopAgent, SleepAgent};
    use crate::clock::{ManualClock, SystemClock};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicI64;

    const START_SECS: i64 = 1_700_000_000;

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_node_id("node-a")
            .with_registration_jitter(Duration::ZERO)
            .with_min_poll_interval_ms(1_000)
            .with_default_agent_interval(Duration::from_secs(60))
            .with_shutdown_timeout(Duration::from_millis(50))
    }

    fn scheduler_with(
        config: SchedulerConfig,
    ) -> (PriorityScheduler, MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_secs(START_SECS));
        let store = MemoryStore::with_clock(clock.clone());
        let scheduler =
            PriorityScheduler::new(config, Arc::new(store.clone()), clock.clone()).unwrap();
        (scheduler, store, clock)
    }

    struct HintAgent;

    #[async_trait]
    impl Agent for HintAgent {
        fn key(&self) -> &str {
            "hinted"
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionResult, AgentError> {
            Ok(ExecutionResult::after(Duration::from_millis(1_500)))
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let clock = Arc::new(ManualClock::at_secs(START_SECS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let result = PriorityScheduler::new(config().with_node_id(""), store, clock);
        assert!(matches!(result.err(), Some(SchedulerError::Config(_))));
    }

    #[tokio::test]
    async fn test_successful_run_uses_hint_or_interval() {
        let (scheduler, store, _) = scheduler_with(config());
        scheduler
            .register(vec![
                Arc::new(HintAgent) as Arc<dyn Agent>,
                Arc::new(NoopAgent::new("plain")),
            ])
            .await
            .unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.dispatched.len(), 2);
        assert!(scheduler.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(store.score_of("hinted").await.unwrap(), Some(START_SECS + 2));
        assert_eq!(store.score_of("plain").await.unwrap(), Some(START_SECS + 60));
        assert!(store.lease_of("plain").await.unwrap().is_none());
        assert_eq!(scheduler.pool_stats().completed, 2);
    }

    #[tokio::test]
    async fn test_failures_back_off_then_revert() {
        let config = config().with_failure_backoff(
            Duration::from_secs(10),
            2.0,
            Duration::from_secs(600),
            2,
        );
        let (scheduler, store, clock) = scheduler_with(config);
        scheduler
            .register(vec![Arc::new(FlakyAgent::new("broken", 1)) as Arc<dyn Agent>])
            .await
            .unwrap();

        let mut scores = Vec::new();
        for _ in 0..3 {
            let now = clock.now_ms() / 1000;
            let report = scheduler.tick().await.unwrap();
            assert_eq!(report.dispatched, vec!["broken".to_string()]);
            assert!(scheduler.wait_idle(Duration::from_secs(5)).await);
            let score = store.score_of("broken").await.unwrap().unwrap();
            scores.push(score - now);
            clock.set_ms(score * 1000);
        }
        assert_eq!(scores, vec![10, 20, 60]);
        assert_eq!(scheduler.pool_stats().failed, 3);
    }

    #[tokio::test]
    async fn test_panic_is_a_failure_and_agent_is_kept() {
        let (scheduler, store, _) = scheduler_with(config());
        scheduler
            .register(vec![
                Arc::new(FlakyAgent::new("panicky", 1).panicking()) as Arc<dyn Agent>
            ])
            .await
            .unwrap();

        scheduler.tick().await.unwrap();
        assert!(scheduler.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(store.score_of("panicky").await.unwrap(), Some(START_SECS + 30));
        assert_eq!(scheduler.health().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_contended_agent_is_returned_due_now() {
        let (scheduler, store, _) = scheduler_with(config());
        scheduler
            .register(vec![Arc::new(NoopAgent::new("shared")) as Arc<dyn Agent>])
            .await
            .unwrap();
        store
            .claim_lease("shared", "node-b", Duration::from_secs(60))
            .await
            .unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.contended, vec!["shared".to_string()]);
        assert!(report.dispatched.is_empty());
        assert_eq!(store.score_of("shared").await.unwrap(), Some(START_SECS));
        assert_eq!(store.lease_of("shared").await.unwrap().unwrap().owner, "node-b");
    }

    #[tokio::test]
    async fn test_unknown_agent_is_returned_later() {
        let (scheduler, store, _) = scheduler_with(config());
        store
            .add_agents(&[("elsewhere".to_string(), START_SECS)])
            .await
            .unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.unknown, vec!["elsewhere".to_string()]);
        assert_eq!(store.score_of("elsewhere").await.unwrap(), Some(START_SECS + 1));
    }

    #[tokio::test]
    async fn test_cadence_and_stop_skip_cycles() {
        let (scheduler, store, clock) = scheduler_with(config());
        assert!(scheduler.tick().await.unwrap().skipped.is_none());
        assert_eq!(store.claim_calls(), 1);

        clock.advance_ms(500);
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::Cadence));
        assert_eq!(store.claim_calls(), 1);

        scheduler.shutdown().await.unwrap();
        clock.advance_ms(5_000);
        assert_eq!(
            scheduler.tick().await.unwrap().skipped,
            Some(SkipReason::Stopped)
        );
        assert!(matches!(
            scheduler.shutdown().await,
            Err(SchedulerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_saturated_pool_skips_and_shutdown_requeues() {
        let (scheduler, store, clock) = scheduler_with(config().with_max_concurrent_agents(1));
        scheduler
            .register(vec![
                Arc::new(SleepAgent::new("slow", Duration::from_secs(3_600))) as Arc<dyn Agent>,
            ])
            .await
            .unwrap();

        assert_eq!(scheduler.tick().await.unwrap().dispatched.len(), 1);
        clock.advance_ms(2_000);
        assert_eq!(
            scheduler.tick().await.unwrap().skipped,
            Some(SkipReason::Saturated)
        );

        let result = scheduler.shutdown().await;
        assert!(matches!(result, Err(SchedulerError::ShutdownTimeout(_))));
        assert_eq!(store.score_of("slow").await.unwrap(), Some(START_SECS + 2));
        assert!(store.lease_of("slow").await.unwrap().is_none());
    }

    /// Clock that moves forward on every read.
    #[derive(Debug)]
    struct SteppingClock {
        now_ms: AtomicI64,
        step_ms: i64,
    }

    impl ClockSource for SteppingClock {
        fn now_ms(&self) -> i64 {
            self.now_ms.fetch_add(self.step_ms, Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_claimed_agents() {
        let clock = Arc::new(SteppingClock {
            now_ms: AtomicI64::new(START_SECS * 1000),
            step_ms: 1_000,
        });
        let store = MemoryStore::with_clock(clock.clone());
        let scheduler = PriorityScheduler::new(
            config().with_cycle_budget_ms(500),
            Arc::new(store.clone()),
            clock,
        )
        .unwrap();
        store
            .add_agents(&[("a".to_string(), START_SECS - 5), ("b".to_string(), START_SECS - 3)])
            .await
            .unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.claimed, 2);
        assert!(report.dispatched.is_empty());
        assert_eq!(report.deferred, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.score_of("a").await.unwrap(), Some(START_SECS - 5));
        assert_eq!(store.score_of("b").await.unwrap(), Some(START_SECS - 3));
    }

    #[tokio::test]
    async fn test_deregistered_while_running_is_not_requeued() {
        let (scheduler, store, _) = scheduler_with(config());
        scheduler
            .register(vec![
                Arc::new(SleepAgent::new("retiring", Duration::from_millis(50))) as Arc<dyn Agent>,
            ])
            .await
            .unwrap();

        scheduler.tick().await.unwrap();
        scheduler.deregister(&["retiring".to_string()]).await.unwrap();
        assert!(scheduler.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(store.score_of("retiring").await.unwrap(), None);
        assert!(store.registered_agents().await.unwrap().is_empty());
        assert!(scheduler.local_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_recover_orphans() {
        let (scheduler, store, clock) =
            scheduler_with(config().with_orphan_min_age(Duration::ZERO));
        store
            .add_agents(&[("job-7".to_string(), START_SECS)])
            .await
            .unwrap();
        store.claim_due(START_SECS, 10).await.unwrap();
        store
            .claim_lease("job-7", "crashed-node", Duration::from_secs(10))
            .await
            .unwrap();

        assert!(scheduler.recover_orphans().await.unwrap().is_empty());
        clock.advance_ms(10_001);
        assert_eq!(
            scheduler.recover_orphans().await.unwrap(),
            vec!["job-7".to_string()]
        );
        assert_eq!(scheduler.health().await.unwrap().orphans_recovered, 1);
    }

    #[tokio::test]
    async fn test_recovery_leaves_fresh_claims_alone() {
        let config = config().with_orphan_min_age(Duration::from_secs(120));
        let (scheduler, store, clock) = scheduler_with(config);
        store
            .add_agents(&[("job-8".to_string(), START_SECS)])
            .await
            .unwrap();
        // Claimed, but the claimer has not taken the lease yet.
        store.claim_due(START_SECS, 10).await.unwrap();

        assert!(scheduler.recover_orphans().await.unwrap().is_empty());
        clock.advance_ms(119_000);
        assert!(scheduler.recover_orphans().await.unwrap().is_empty());
        clock.advance_ms(1_000);
        assert_eq!(
            scheduler.recover_orphans().await.unwrap(),
            vec!["job-8".to_string()]
        );
    }

    #[tokio::test]
    async fn test_agent_running_here_is_not_dispatched_again() {
        let (scheduler, store, clock) = scheduler_with(config());
        scheduler
            .register(vec![
                Arc::new(SleepAgent::new("busy", Duration::from_millis(300))) as Arc<dyn Agent>,
            ])
            .await
            .unwrap();
        assert_eq!(
            scheduler.tick().await.unwrap().dispatched,
            vec!["busy".to_string()]
        );

        // Another node's recovery pass puts the running key back in the queue.
        store.release("busy", START_SECS).await.unwrap();
        clock.advance_ms(2_000);

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert!(report.dispatched.is_empty());
        assert_eq!(report.already_running, vec!["busy".to_string()]);
        assert_eq!(store.score_of("busy").await.unwrap(), Some(START_SECS));

        assert!(scheduler.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(scheduler.pool_stats().completed, 1);
        assert_eq!(scheduler.health().await.unwrap().succeeded, 1);
    }

    #[tokio::test]
    async fn test_store_error_mid_dispatch_returns_claimed_agents() {
        let (scheduler, store, _) = scheduler_with(config());
        scheduler
            .register(vec![
                Arc::new(NoopAgent::new("a")) as Arc<dyn Agent>,
                Arc::new(NoopAgent::new("b")),
            ])
            .await
            .unwrap();
        store.fail_lease_claims(1);

        let result = scheduler.tick().await;
        assert!(matches!(result, Err(SchedulerError::Store(_))));
        assert_eq!(store.score_of("a").await.unwrap(), Some(START_SECS));
        assert_eq!(store.score_of("b").await.unwrap(), Some(START_SECS));
        assert!(store.lease_of("a").await.unwrap().is_none());
        assert_eq!(scheduler.pool_stats().active, 0);
    }

    #[tokio::test]
    async fn test_zombie_run_is_aborted_and_requeued() {
        let config = config()
            .with_max_execution(Duration::from_millis(50), Duration::from_millis(20))
            .with_exceptional_agents("^report-", Duration::from_secs(3_600));
        let (scheduler, store, _) = scheduler_with(config);
        scheduler
            .register(vec![
                Arc::new(SleepAgent::new("stuck", Duration::from_secs(3_600))) as Arc<dyn Agent>,
                Arc::new(SleepAgent::new("report-yearly", Duration::from_secs(3_600))),
            ])
            .await
            .unwrap();
        assert_eq!(scheduler.tick().await.unwrap().dispatched.len(), 2);

        assert!(scheduler.reap_zombies().await.is_empty());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(scheduler.reap_zombies().await, vec!["stuck".to_string()]);

        // Requeued with the first failure delay, lease dropped.
        assert_eq!(store.score_of("stuck").await.unwrap(), Some(START_SECS + 30));
        assert!(store.lease_of("stuck").await.unwrap().is_none());
        assert_eq!(
            store.lease_of("report-yearly").await.unwrap().unwrap().owner,
            "node-a"
        );
        let health = scheduler.health().await.unwrap();
        assert_eq!(health.zombies_reaped, 1);
        assert_eq!(health.held_leases, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.pool_stats().active, 1);
    }

    #[tokio::test]
    async fn test_run_keeps_long_agent_leased_and_requeues_on_shutdown() {
        let store = MemoryStore::new();
        let config = config()
            .with_lease_ttl_ms(1_000)
            .with_poll_interval(Duration::from_millis(100))
            .with_min_poll_interval_ms(0)
            .with_shutdown_timeout(Duration::from_secs(5));
        let scheduler =
            PriorityScheduler::new(config, Arc::new(store.clone()), Arc::new(SystemClock)).unwrap();
        scheduler
            .register(vec![
                Arc::new(SleepAgent::new("long", Duration::from_millis(2_500))) as Arc<dyn Agent>,
            ])
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = scheduler.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        // Well past the one second TTL, so only renewal keeps the lease alive.
        tokio::time::sleep(Duration::from_millis(1_800)).await;
        let lease = store.lease_of("long").await.unwrap();
        assert_eq!(lease.map(|l| l.owner), Some("node-a".to_string()));
        assert_eq!(store.score_of("long").await.unwrap(), None);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert!(store.score_of("long").await.unwrap().is_some());
        assert!(store.lease_of("long").await.unwrap().is_none());
        assert_eq!(scheduler.pool_stats().completed, 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
