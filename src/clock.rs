//! Wall-clock access for cadence checks and score computation.
//!
//! All times are epoch milliseconds. `SystemClock` reads the real clock,
//! `ManualClock` is driven by tests, and `OffsetClock` applies the
//! server-client offset learned from the coordination store so every node
//! computes scores against the same authoritative time.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;

/// Source of "now" in epoch milliseconds.
pub trait ClockSource: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> i64;
}

/// Real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock whose time only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    /// Creates a clock frozen at `now_ms`.
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    /// Creates a clock frozen at whole epoch seconds.
    pub fn at_secs(secs: i64) -> Self {
        Self::new(secs * 1000)
    }

    pub fn set_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Local clock shifted by the last observed server-client offset.
///
/// Until the first sync `now_ms` returns 0, which score computation treats
/// as "no offset available" and moves on to the next time source.
#[derive(Debug)]
pub struct OffsetClock {
    local: Arc<dyn ClockSource>,
    offset_ms: AtomicI64,
    synced: AtomicBool,
    last_sync_ms: AtomicI64,
}

impl OffsetClock {
    pub fn new(local: Arc<dyn ClockSource>) -> Self {
        Self {
            local,
            offset_ms: AtomicI64::new(0),
            synced: AtomicBool::new(false),
            last_sync_ms: AtomicI64::new(0),
        }
    }

    /// Records a server time observation taken at local time `local_ms`.
    pub fn record_server_time(&self, server_ms: i64, local_ms: i64) {
        self.offset_ms.store(server_ms - local_ms, Ordering::SeqCst);
        self.last_sync_ms.store(local_ms, Ordering::SeqCst);
        self.synced.store(true, Ordering::SeqCst);
    }

    /// Returns whether the offset is older than `cache_ms` (or was never set).
    pub fn needs_sync(&self, cache_ms: i64) -> bool {
        if !self.synced.load(Ordering::SeqCst) {
            return true;
        }
        let now = self.local.now_ms();
        now - self.last_sync_ms.load(Ordering::SeqCst) > cache_ms
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }

    pub fn local(&self) -> &Arc<dyn ClockSource> {
        &self.local
    }
}

impl ClockSource for OffsetClock {
    fn now_ms(&self) -> i64 {
        if !self.synced.load(Ordering::SeqCst) {
            return 0;
        }
        self.local.now_ms() + self.offset_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_secs(100);
        assert_eq!(clock.now_ms(), 100_000);
        clock.advance_ms(1500);
        assert_eq!(clock.now_ms(), 101_500);
        clock.set_ms(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn test_offset_clock_unsynced_reports_zero() {
        let local = Arc::new(ManualClock::new(10_000));
        let clock = OffsetClock::new(local);
        assert_eq!(clock.now_ms(), 0);
        assert!(clock.needs_sync(1_000));
    }

    #[test]
    fn test_offset_clock_applies_offset_and_expires() {
        let local = Arc::new(ManualClock::new(10_000));
        let clock = OffsetClock::new(local.clone());
        clock.record_server_time(12_500, 10_000);

        assert_eq!(clock.offset_ms(), 2_500);
        assert_eq!(clock.now_ms(), 12_500);
        assert!(!clock.needs_sync(1_000));

        local.advance_ms(1_001);
        assert_eq!(clock.now_ms(), 13_501);
        assert!(clock.needs_sync(1_000));
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }
}
