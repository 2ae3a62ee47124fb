//! Elapsed-time gates for the polling loop.

use std::sync::atomic::{AtomicI64, Ordering};

/// Never-run marker for the last cycle timestamp.
const NEVER: i64 = i64::MIN;

/// Refuses a cycle when less than `min_interval_ms` has passed since the
/// last admitted one.
#[derive(Debug)]
pub struct CadenceGuard {
    min_interval_ms: i64,
    last_cycle_ms: AtomicI64,
}

impl CadenceGuard {
    pub fn new(min_interval_ms: i64) -> Self {
        Self {
            min_interval_ms: min_interval_ms.max(0),
            last_cycle_ms: AtomicI64::new(NEVER),
        }
    }

    pub fn min_interval_ms(&self) -> i64 {
        self.min_interval_ms
    }

    /// Returns whether a new cycle may start at `now_ms`.
    pub fn is_period_elapsed(&self, now_ms: i64) -> bool {
        let last = self.last_cycle_ms.load(Ordering::SeqCst);
        last == NEVER || now_ms.saturating_sub(last) >= self.min_interval_ms
    }

    /// Admits a cycle at `now_ms` and records it, or refuses it.
    ///
    /// Concurrent callers racing for the same period see exactly one `true`.
    pub fn try_enter(&self, now_ms: i64) -> bool {
        let mut last = self.last_cycle_ms.load(Ordering::SeqCst);
        loop {
            if last != NEVER && now_ms.saturating_sub(last) < self.min_interval_ms {
                return false;
            }
            match self.last_cycle_ms.compare_exchange(
                last,
                now_ms,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(current) => last = current,
            }
        }
    }

    /// Forgets the last cycle so the next one is admitted immediately.
    pub fn reset(&self) {
        self.last_cycle_ms.store(NEVER, Ordering::SeqCst);
    }
}

/// Claiming deadline for one polling cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleBudget {
    deadline_ms: Option<i64>,
}

impl CycleBudget {
    /// Starts a budget at `now_ms`. A budget of zero or less never expires.
    pub fn start(now_ms: i64, budget_ms: i64) -> Self {
        Self {
            deadline_ms: (budget_ms > 0).then(|| now_ms.saturating_add(budget_ms)),
        }
    }

    pub fn unbounded() -> Self {
        Self { deadline_ms: None }
    }

    pub fn over_budget(&self, now_ms: i64) -> bool {
        matches!(self.deadline_ms, Some(deadline) if now_ms >= deadline)
    }

    pub fn deadline_ms(&self) -> Option<i64> {
        self.deadline_ms
    }
}
