//! Conversion of delays into sorted-set scores.
//!
//! A score is a target epoch second. "Now" comes from the first usable of
//! three sources:
//!
//! 1. the offset clock (local time shifted by the last measured server
//!    offset), when it reports a positive value;
//! 2. the coordination store's own clock;
//! 3. the local clock, when the store cannot be reached.
//!
//! All three feed the same rounding, so the tier that answered never changes
//! what a score means. The local fallback trades cross-node skew tolerance
//! for availability while the store is down.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::clock::ClockSource;
use crate::store::{CoordinationStore, Score};

/// Which source produced "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeTier {
    Offset,
    Store,
    Local,
}

/// Score for a target `delay_ms` after `now_ms`.
///
/// Non-negative delays round the target up to the next whole second so an
/// agent never becomes due before its requested delay. Negative delays round
/// down.
pub fn score_at(now_ms: i64, delay_ms: i64) -> Score {
    let target_ms = now_ms.saturating_add(delay_ms);
    if delay_ms >= 0 {
        -((-target_ms).div_euclid(1000))
    } else {
        target_ms.div_euclid(1000)
    }
}

/// Whole epoch second containing `now_ms`.
pub fn score_floor(now_ms: i64) -> Score {
    now_ms.div_euclid(1000)
}

/// Computes scores against the preferred time source.
#[derive(Clone)]
pub struct TimeScoreComputer {
    offset: Option<Arc<dyn ClockSource>>,
    store: Arc<dyn CoordinationStore>,
    local: Arc<dyn ClockSource>,
}

impl TimeScoreComputer {
    pub fn new(
        offset: Option<Arc<dyn ClockSource>>,
        store: Arc<dyn CoordinationStore>,
        local: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            offset,
            store,
            local,
        }
    }

    /// Current time in epoch milliseconds and the tier that produced it.
    pub async fn now_ms_with_tier(&self) -> (i64, TimeTier) {
        if let Some(offset) = &self.offset {
            let now = offset.now_ms();
            if now > 0 {
                return (now, TimeTier::Offset);
            }
        }

        match self.store.server_time_ms().await {
            Ok(now) if now > 0 => (now, TimeTier::Store),
            Ok(now) => {
                warn!(server_ms = now, "Store reported a non-positive time, using local clock");
                (self.local.now_ms(), TimeTier::Local)
            }
            Err(e) => {
                warn!(error = %e, "Failed to read store time, using local clock");
                (self.local.now_ms(), TimeTier::Local)
            }
        }
    }

    pub async fn now_ms(&self) -> i64 {
        self.now_ms_with_tier().await.0
    }

    /// Score of "now", used as the claim threshold.
    pub async fn now_score(&self) -> Score {
        score_floor(self.now_ms().await)
    }

    /// Score `delay_ms` milliseconds from now.
    pub async fn score_from_ms_delay(&self, delay_ms: i64) -> Score {
        score_at(self.now_ms().await, delay_ms)
    }

    pub async fn score_from_delay(&self, delay: Duration) -> Score {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        self.score_from_ms_delay(delay_ms).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, OffsetClock};
    use crate::store::MemoryStore;

    #[test]
    fn test_score_rounding() {
        let t = 1_700_000_000;
        assert_eq!(score_at(t * 1000, 1500), t + 2);
        assert_eq!(score_at(t * 1000, 0), t);
        assert_eq!(score_at(t * 1000, 1), t + 1);
        assert_eq!(score_at(t * 1000, 1000), t + 1);
        assert_eq!(score_at(t * 1000 + 200, 800), t + 1);
        assert_eq!(score_at(t * 1000 + 200, 801), t + 2);
    }

    #[test]
    fn test_negative_delay_rounds_down() {
        let t = 1_700_000_000;
        assert_eq!(score_at(t * 1000, -1), t - 1);
        assert_eq!(score_at(t * 1000, -1500), t - 2);
        assert_eq!(score_floor(-1), -1);
    }

    #[tokio::test]
    async fn test_store_tier_used_before_sync() {
        let store_clock = Arc::new(ManualClock::at_secs(500));
        let local = Arc::new(ManualClock::at_secs(100));
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::with_clock(store_clock));
        let offset = Arc::new(OffsetClock::new(local.clone()));

        let scores = TimeScoreComputer::new(Some(offset), store, local);
        assert_eq!(scores.now_ms_with_tier().await, (500_000, TimeTier::Store));
        assert_eq!(scores.score_from_ms_delay(1500).await, 502);
    }

    #[tokio::test]
    async fn test_offset_tier_preferred_once_synced() {
        let store_clock = Arc::new(ManualClock::at_secs(500));
        let local = Arc::new(ManualClock::at_secs(100));
        let store: Arc<dyn CoordinationStore> =
            Arc::new(MemoryStore::with_clock(store_clock.clone()));
        let offset = Arc::new(OffsetClock::new(local.clone()));
        offset.record_server_time(500_000, 100_000);

        let scores = TimeScoreComputer::new(Some(offset), store, local.clone());
        local.advance_ms(2_000);
        assert_eq!(scores.now_ms_with_tier().await, (502_000, TimeTier::Offset));
        assert_eq!(scores.now_score().await, 502);
    }

    #[tokio::test]
    async fn test_local_tier_when_store_unavailable() {
        let local = Arc::new(ManualClock::at_secs(100));
        let memory = MemoryStore::with_clock(Arc::new(ManualClock::at_secs(500)));
        memory.set_unavailable(true);
        let store: Arc<dyn CoordinationStore> = Arc::new(memory);

        let scores = TimeScoreComputer::new(None, store, local);
        assert_eq!(scores.now_ms_with_tier().await, (100_000, TimeTier::Local));
        assert_eq!(scores.score_from_ms_delay(0).await, 100);
    }
}
