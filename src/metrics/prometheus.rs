//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by priority_scheduler and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all priority_scheduler metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total agents claimed from the ready-queue.
pub static AGENTS_CLAIMED: OnceLock<Counter> = OnceLock::new();

/// Claimed agents released unexecuted because another owner held the lease.
pub static LEASE_CONTENTION: OnceLock<Counter> = OnceLock::new();

/// Leases lost during execution (renewal refused or failed).
pub static LEASES_LOST: OnceLock<Counter> = OnceLock::new();

/// Agents returned to the ready-queue by orphan recovery.
pub static ORPHANS_RECOVERED: OnceLock<Counter> = OnceLock::new();

/// Local runs aborted for exceeding their execution limit.
pub static ZOMBIES_REAPED: OnceLock<Counter> = OnceLock::new();

/// Agent executions, labeled by agent and outcome.
pub static EXECUTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Agent execution duration in seconds, labeled by agent.
pub static EXECUTION_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Polling cycle duration in seconds.
pub static CYCLE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Polling cycles skipped, labeled by reason.
pub static CYCLES_SKIPPED: OnceLock<IntCounterVec> = OnceLock::new();

/// Script replies that could not be decoded, labeled by script.
pub static SCRIPT_PARSE_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

/// Failed store calls, labeled by operation.
pub static STORE_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

/// Agents currently executing on this node.
pub static ACTIVE_AGENTS: OnceLock<Gauge> = OnceLock::new();

/// Agents waiting in the ready-queue.
pub static PENDING_AGENTS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Recording
/// methods on [`super::MetricsCollector`] are no-ops until it has run.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Queue and lease metrics
    let agents_claimed = Counter::new(
        "priority_scheduler_agents_claimed_total",
        "Total agents claimed from the ready-queue",
    )?;

    let lease_contention = Counter::new(
        "priority_scheduler_lease_contention_total",
        "Claimed agents released because another owner held the lease",
    )?;

    let leases_lost = Counter::new(
        "priority_scheduler_leases_lost_total",
        "Leases lost while the agent was executing",
    )?;

    let orphans_recovered = Counter::new(
        "priority_scheduler_orphans_recovered_total",
        "Agents returned to the ready-queue by orphan recovery",
    )?;

    // Execution metrics
    let zombies_reaped = Counter::new(
        "priority_scheduler_zombies_reaped_total",
        "Local agent runs aborted for exceeding their execution limit",
    )?;

    let executions_total = CounterVec::new(
        Opts::new(
            "priority_scheduler_executions_total",
            "Total agent executions",
        ),
        &["agent", "outcome"],
    )?;

    let execution_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "priority_scheduler_execution_duration_seconds",
            "Agent execution duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["agent"],
    )?;

    // Loop metrics
    let cycle_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "priority_scheduler_cycle_duration_seconds",
            "Polling cycle duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
    )?;

    let cycles_skipped = IntCounterVec::new(
        Opts::new(
            "priority_scheduler_cycles_skipped_total",
            "Polling cycles skipped",
        ),
        &["reason"],
    )?;

    // Store metrics
    let script_parse_errors = IntCounterVec::new(
        Opts::new(
            "priority_scheduler_script_parse_errors_total",
            "Script replies with an unexpected shape",
        ),
        &["script"],
    )?;

    let store_errors = IntCounterVec::new(
        Opts::new(
            "priority_scheduler_store_errors_total",
            "Failed coordination store calls",
        ),
        &["operation"],
    )?;

    let active_agents = Gauge::new(
        "priority_scheduler_active_agents",
        "Agents currently executing on this node",
    )?;

    let pending_agents = Gauge::new(
        "priority_scheduler_pending_agents",
        "Agents waiting in the ready-queue",
    )?;

    registry.register(Box::new(agents_claimed.clone()))?;
    registry.register(Box::new(lease_contention.clone()))?;
    registry.register(Box::new(leases_lost.clone()))?;
    registry.register(Box::new(orphans_recovered.clone()))?;
    registry.register(Box::new(zombies_reaped.clone()))?;
    registry.register(Box::new(executions_total.clone()))?;
    registry.register(Box::new(execution_duration.clone()))?;
    registry.register(Box::new(cycle_duration.clone()))?;
    registry.register(Box::new(cycles_skipped.clone()))?;
    registry.register(Box::new(script_parse_errors.clone()))?;
    registry.register(Box::new(store_errors.clone()))?;
    registry.register(Box::new(active_agents.clone()))?;
    registry.register(Box::new(pending_agents.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = AGENTS_CLAIMED.set(agents_claimed);
    let _ = LEASE_CONTENTION.set(lease_contention);
    let _ = LEASES_LOST.set(leases_lost);
    let _ = ORPHANS_RECOVERED.set(orphans_recovered);
    let _ = ZOMBIES_REAPED.set(zombies_reaped);
    let _ = EXECUTIONS_TOTAL.set(executions_total);
    let _ = EXECUTION_DURATION.set(execution_duration);
    let _ = CYCLE_DURATION.set(cycle_duration);
    let _ = CYCLES_SKIPPED.set(cycles_skipped);
    let _ = SCRIPT_PARSE_ERRORS.set(script_parse_errors);
    let _ = STORE_ERRORS.set(store_errors);
    let _ = ACTIVE_AGENTS.set(active_agents);
    let _ = PENDING_AGENTS.set(pending_agents);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        // First call should succeed or metrics already initialized
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        if REGISTRY.get().is_some() {
            assert!(!metrics.starts_with("# Error"));
        }
    }
}
