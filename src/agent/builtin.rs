//! Built-in agent kinds, used by the CLI and in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Agent, ExecutionContext, ExecutionResult};
use crate::error::AgentError;

/// Does nothing and succeeds.
#[derive(Debug, Clone)]
pub struct NoopAgent {
    key: String,
    interval: Option<Duration>,
}

impl NoopAgent {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            interval: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

#[async_trait]
impl Agent for NoopAgent {
    fn key(&self) -> &str {
        &self.key
    }

    fn interval(&self) -> Option<Duration> {
        self.interval
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, AgentError> {
        debug!(agent = %ctx.agent_key, owner = %ctx.owner_id, "Noop agent ran");
        Ok(ExecutionResult::done())
    }
}

/// Sleeps for a fixed duration, simulating a slow poll.
#[derive(Debug, Clone)]
pub struct SleepAgent {
    key: String,
    interval: Option<Duration>,
    duration: Duration,
}

impl SleepAgent {
    pub fn new(key: impl Into<String>, duration: Duration) -> Self {
        Self {
            key: key.into(),
            interval: None,
            duration,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

#[async_trait]
impl Agent for SleepAgent {
    fn key(&self) -> &str {
        &self.key
    }

    fn interval(&self) -> Option<Duration> {
        self.interval
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionResult, AgentError> {
        tokio::time::sleep(self.duration).await;
        Ok(ExecutionResult::done())
    }
}

/// Fails every `fail_every`-th run, optionally by panicking.
#[derive(Debug)]
pub struct FlakyAgent {
    key: String,
    interval: Option<Duration>,
    fail_every: u64,
    panic: bool,
    runs: AtomicU64,
}

impl FlakyAgent {
    /// `fail_every` of 0 or 1 fails every run.
    pub fn new(key: impl Into<String>, fail_every: u64) -> Self {
        Self {
            key: key.into(),
            interval: None,
            fail_every: fail_every.max(1),
            panic: false,
            runs: AtomicU64::new(0),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Panic instead of returning an error.
    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for FlakyAgent {
    fn key(&self) -> &str {
        &self.key
    }

    fn interval(&self) -> Option<Duration> {
        self.interval
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, AgentError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if run % self.fail_every != 0 {
            return Ok(ExecutionResult::done());
        }
        if self.panic {
            panic!("agent {} panicked on run {}", ctx.agent_key, run);
        }
        Err(AgentError::Failed(format!("run {} failed", run)))
    }
}
