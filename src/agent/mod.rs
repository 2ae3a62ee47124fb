//! Units of recurring work run by the scheduler.
//!
//! An [`Agent`] has a stable key and knows how to execute itself. Each run
//! receives an [`ExecutionContext`] describing who is running it and why,
//! and may ask for a specific delay before its next run.

pub mod builtin;
pub mod registry;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::store::Score;

pub use builtin::{FlakyAgent, NoopAgent, SleepAgent};
pub use registry::{AgentDefinition, AgentFile, AgentRegistry};

/// Per-run information handed to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub agent_key: String,
    /// Node holding the lease for this run.
    pub owner_id: String,
    /// Consecutive failures before this run (0 after a success).
    pub attempt: u32,
    /// Score the agent held when it was claimed.
    pub claimed_score: Score,
    /// Epoch milliseconds at dispatch.
    pub started_at_ms: i64,
}

/// What a successful run reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Delay before the next run; falls back to the agent's interval.
    pub next_delay: Option<Duration>,
}

impl ExecutionResult {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn after(delay: Duration) -> Self {
        Self {
            next_delay: Some(delay),
        }
    }
}

/// A named, idempotent unit of recurring work.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable identity, unique across the cluster.
    fn key(&self) -> &str;

    /// Normal delay between runs. `None` uses the scheduler default.
    fn interval(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_result_builders() {
        assert_eq!(ExecutionResult::done().next_delay, None);
        assert_eq!(
            ExecutionResult::after(Duration::from_secs(5)).next_delay,
            Some(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn test_default_interval() {
        let agent = NoopAgent::new("noop-1");
        assert_eq!(agent.interval(), None);
        assert_eq!(agent.key(), "noop-1");
    }
}
