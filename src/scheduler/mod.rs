//! Distributed priority scheduling of recurring agents.
//!
//! This module provides the pieces that spread periodic agent work across a
//! fleet of nodes sharing one coordination store:
//!
//! - **DistributedQueue**: sorted-set ready-queue scored by next run time
//! - **AgentLeaseManager**: per-agent ownership with TTL and renewal
//! - **TimeScoreComputer**: delay to score conversion against a shared clock
//! - **ExecutorFactory**: single-flight guards, periodic tasks, worker pool
//! - **PriorityScheduler**: the polling loop tying them together
//!
//! # Architecture
//!
//! ```text
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Node A  │         │ Node B  │         │ Node N  │
//!    │scheduler│         │scheduler│         │scheduler│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         │ claim / lease     │                   │
//!         └───────────────────┼───────────────────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │    Redis     │
//!                      │ waiting zset │
//!                      │ registered   │
//!                      │ lease:<key>  │
//!                      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use priority_scheduler::agent::{Agent, NoopAgent};
//! use priority_scheduler::clock::SystemClock;
//! use priority_scheduler::config::SchedulerConfig;
//! use priority_scheduler::scheduler::PriorityScheduler;
//! use priority_scheduler::store::RedisStore;
//! use std::sync::Arc;
//!
//! let config = SchedulerConfig::from_env()?;
//! let store = RedisStore::connect(&config.redis_url, config.store_options()).await?;
//! let scheduler = PriorityScheduler::new(config, Arc::new(store), Arc::new(SystemClock))?;
//!
//! scheduler
//!     .register(vec![Arc::new(NoopAgent::new("heartbeat")) as Arc<dyn Agent>])
//!     .await?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//! let handle = tokio::spawn({
//!     let scheduler = scheduler.clone();
//!     async move { scheduler.run(shutdown_rx).await }
//! });
//!
//! // Graceful shutdown
//! shutdown_tx.send(())?;
//! handle.await??;
//! ```

pub mod backoff;
pub mod cadence;
pub mod executor;
pub mod lease;
pub mod priority;
pub mod queue;
pub mod score;
pub mod worker_pool;

pub use backoff::{FailureBackoff, FailureStreaks};
pub use cadence::{CadenceGuard, CycleBudget};
pub use executor::{ExecutorFactory, SingleFlight, SingleFlightGuard};
pub use lease::{AgentLeaseManager, LeaseRenewer, RenewalReport};
pub use priority::{HealthSummary, PriorityScheduler, SkipReason, TickReport};
pub use queue::{registration_offset_secs, DistributedQueue, QueueStats};
pub use score::{score_at, score_floor, TimeScoreComputer, TimeTier};
pub use worker_pool::{PoolStats, WorkerPool};
