//! Rescheduling delays for failing agents.
//!
//! The first `max_retries` consecutive failures are retried sooner than the
//! normal cadence, on an exponential curve capped both by `cap` and by the
//! normal interval. After that the agent falls back to its normal interval,
//! so a permanently broken agent neither spins nor disappears.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::SchedulerConfig;

/// Failure delay curve.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub max_retries: u32,
}

impl FailureBackoff {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            base: config.failure_backoff_base,
            multiplier: config.failure_backoff_multiplier.max(1.0),
            cap: config.failure_backoff_cap,
            max_retries: config.failure_max_retries,
        }
    }

    /// Delay after the `streak`-th consecutive failure of an agent whose
    /// normal interval is `normal`.
    pub fn delay_for(&self, streak: u32, normal: Duration) -> Duration {
        if streak == 0 || streak > self.max_retries {
            return normal;
        }
        let factor = self.multiplier.powi(streak.saturating_sub(1) as i32);
        let scaled = self.base.as_secs_f64() * factor;
        let delay = if scaled.is_finite() && scaled < self.cap.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.cap
        };
        delay.min(self.cap).min(normal)
    }
}

/// Consecutive failure counts per agent.
#[derive(Debug, Default)]
pub struct FailureStreaks {
    streaks: Mutex<HashMap<String, u32>>,
}

impl FailureStreaks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure and returns the new streak length.
    pub async fn record_failure(&self, key: &str) -> u32 {
        let mut streaks = self.streaks.lock().await;
        let streak = streaks.entry(key.to_string()).or_insert(0);
        *streak = streak.saturating_add(1);
        *streak
    }

    pub async fn record_success(&self, key: &str) {
        self.streaks.lock().await.remove(key);
    }

    pub async fn forget(&self, key: &str) {
        self.streaks.lock().await.remove(key);
    }

    pub async fn current(&self, key: &str) -> u32 {
        self.streaks.lock().await.get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> FailureBackoff {
        FailureBackoff {
            base: Duration::from_secs(30),
            multiplier: 2.0,
            cap: Duration::from_secs(100),
            max_retries: 3,
        }
    }

    #[test]
    fn test_backoff_curve() {
        let normal = Duration::from_secs(600);
        let b = backoff();
        assert_eq!(b.delay_for(0, normal), normal);
        assert_eq!(b.delay_for(1, normal), Duration::from_secs(30));
        assert_eq!(b.delay_for(2, normal), Duration::from_secs(60));
        assert_eq!(b.delay_for(3, normal), Duration::from_secs(100));
        assert_eq!(b.delay_for(4, normal), normal);
    }

    #[test]
    fn test_backoff_never_exceeds_normal_interval() {
        let b = backoff();
        let normal = Duration::from_secs(10);
        assert_eq!(b.delay_for(1, normal), normal);
        assert_eq!(b.delay_for(3, normal), normal);
    }

    #[test]
    fn test_backoff_handles_huge_multiplier() {
        let b = FailureBackoff {
            multiplier: f64::MAX,
            ..backoff()
        };
        assert_eq!(b.delay_for(3, Duration::from_secs(600)), Duration::from_secs(100));
    }

    #[tokio::test]
    async fn test_streaks() {
        let streaks = FailureStreaks::new();
        assert_eq!(streaks.record_failure("a").await, 1);
        assert_eq!(streaks.record_failure("a").await, 2);
        assert_eq!(streaks.current("b").await, 0);

        streaks.record_success("a").await;
        assert_eq!(streaks.current("a").await, 0);

        streaks.record_failure("a").await;
        streaks.forget("a").await;
        assert_eq!(streaks.current("a").await, 0);
    }
}
