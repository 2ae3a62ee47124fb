//! priority_scheduler: distributed priority scheduling of recurring agents.
//!
//! Agents are kept in a Redis sorted set scored by their next run time.
//! Every node polls the set for due agents, takes a per-agent lease so each
//! agent runs on at most one node at a time, and requeues the agent when its
//! run completes. Agents of crashed nodes come back once their leases
//! expire.

pub mod agent;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use agent::{Agent, ExecutionContext, ExecutionResult};
pub use config::SchedulerConfig;
pub use error::{AgentError, ConfigError, RegistryError, SchedulerError, StoreError};
pub use scheduler::PriorityScheduler;
