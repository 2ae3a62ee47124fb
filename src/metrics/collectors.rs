//! High-level recording interface for scheduler metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus statics so call sites never
//! deal with label ordering or uninitialized registries.

use super::prometheus::{
    ACTIVE_AGENTS, AGENTS_CLAIMED, CYCLES_SKIPPED, CYCLE_DURATION, EXECUTIONS_TOTAL,
    EXECUTION_DURATION, LEASES_LOST, LEASE_CONTENTION, ORPHANS_RECOVERED, PENDING_AGENTS,
    SCRIPT_PARSE_ERRORS, STORE_ERRORS, ZOMBIES_REAPED,
};

/// Metrics collector for recording scheduler operational metrics.
///
/// Every method is a no-op until `init_metrics()` has been called.
///
/// # Example
///
/// ```ignore
/// use priority_scheduler::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_claimed(3);
/// collector.record_execution("AwsCachingAgent/us-east-1", "success", 1.2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record agents claimed by one `claim_due` call.
    pub fn record_claimed(&self, count: usize) {
        if let Some(claimed) = AGENTS_CLAIMED.get() {
            claimed.inc_by(count as f64);
        }
        tracing::trace!(count = count, "Recorded claimed agents metric");
    }

    /// Record a claimed agent released because another owner holds its lease.
    pub fn record_lease_contention(&self, agent: &str) {
        if let Some(contention) = LEASE_CONTENTION.get() {
            contention.inc();
        }
        tracing::trace!(agent = agent, "Recorded lease contention metric");
    }

    /// Record a lease lost while its agent was executing.
    pub fn record_lease_lost(&self, agent: &str) {
        if let Some(lost) = LEASES_LOST.get() {
            lost.inc();
        }
        tracing::trace!(agent = agent, "Recorded lease lost metric");
    }

    pub fn record_orphans_recovered(&self, count: usize) {
        if let Some(recovered) = ORPHANS_RECOVERED.get() {
            recovered.inc_by(count as f64);
        }
        tracing::trace!(count = count, "Recorded orphans recovered metric");
    }

    /// Record a local run aborted for running past its limit.
    pub fn record_zombie_reaped(&self, agent: &str) {
        if let Some(reaped) = ZOMBIES_REAPED.get() {
            reaped.inc();
        }
        tracing::trace!(agent = agent, "Recorded zombie reaped metric");
    }

    /// Record one finished agent run.
    ///
    /// # Arguments
    ///
    /// * `agent` - Agent key
    /// * `outcome` - "success", "failure" or "panic"
    /// * `duration_secs` - Wall time of the run
    pub fn record_execution(&self, agent: &str, outcome: &str, duration_secs: f64) {
        if let Some(executions) = EXECUTIONS_TOTAL.get() {
            executions.with_label_values(&[agent, outcome]).inc();
        }

        if let Some(duration) = EXECUTION_DURATION.get() {
            duration.with_label_values(&[agent]).observe(duration_secs);
        }

        tracing::trace!(
            agent = agent,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded execution metric"
        );
    }

    pub fn record_cycle(&self, duration_secs: f64) {
        if let Some(cycle) = CYCLE_DURATION.get() {
            cycle.observe(duration_secs);
        }
    }

    /// Record a polling cycle that did not claim, e.g. "cadence" or "store_error".
    pub fn record_cycle_skipped(&self, reason: &str) {
        if let Some(skipped) = CYCLES_SKIPPED.get() {
            skipped.with_label_values(&[reason]).inc();
        }
        tracing::trace!(reason = reason, "Recorded skipped cycle metric");
    }

    pub fn record_script_parse_error(&self, script: &str) {
        if let Some(errors) = SCRIPT_PARSE_ERRORS.get() {
            errors.with_label_values(&[script]).inc();
        }
    }

    pub fn record_store_error(&self, operation: &str) {
        if let Some(errors) = STORE_ERRORS.get() {
            errors.with_label_values(&[operation]).inc();
        }
    }

    pub fn update_active_agents(&self, count: usize) {
        if let Some(active) = ACTIVE_AGENTS.get() {
            active.set(count as f64);
        }
    }

    pub fn update_pending_agents(&self, count: usize) {
        if let Some(pending) = PENDING_AGENTS.get() {
            pending.set(count as f64);
        }
        tracing::trace!(count = count, "Updated pending agents metric");
    }
}
