//! Metrics module for Prometheus-based monitoring.
//!
//! Counters, gauges and histograms for the scheduling loop, the ready-queue,
//! lease ownership and agent executions.
//!
//! # Example
//!
//! ```ignore
//! use priority_scheduler::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_execution("job-7", "success", 0.4);
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_AGENTS, AGENTS_CLAIMED, CYCLES_SKIPPED, CYCLE_DURATION, EXECUTIONS_TOTAL,
    EXECUTION_DURATION, LEASES_LOST, LEASE_CONTENTION, ORPHANS_RECOVERED, PENDING_AGENTS,
    REGISTRY, SCRIPT_PARSE_ERRORS, STORE_ERRORS,
};
