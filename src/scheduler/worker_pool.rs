//! Bounded pool for parallel agent execution.
//!
//! Capacity is a semaphore: the scheduler takes a permit before it claims
//! an agent, so it never claims more work than it can start. Each run is an
//! independent tokio task tracked by agent key, which lets shutdown wait
//! for in-flight runs and abort the stragglers.
//!
//! # Features
//!
//! - Fixed concurrency limit
//! - Idle wait with timeout
//! - Abort of in-flight runs on forced shutdown
//! - Pool statistics tracking

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    /// Maximum parallel runs.
    pub max_concurrent: usize,
    /// Runs currently executing.
    pub active: usize,
    /// Total runs that succeeded.
    pub completed: u64,
    /// Total runs that failed or panicked.
    pub failed: u64,
    /// Average run duration.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of runs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.completed + self.failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    completed: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, success: bool, duration: Duration) {
        if success {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, max_concurrent: usize, active: usize) -> PoolStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            max_concurrent,
            active,
            completed,
            failed,
            average_duration,
        }
    }
}

/// Tracking entry of one in-flight run.
struct RunEntry {
    /// Distinguishes successive runs of the same key.
    run_id: u64,
    handle: AbortHandle,
    started: Instant,
}

type HandleMap = Arc<Mutex<HashMap<String, RunEntry>>>;

/// Removes a finished (or aborted) run from the pool bookkeeping.
struct RunGuard {
    key: String,
    run_id: u64,
    handles: HandleMap,
    active: watch::Sender<usize>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        // A later run of the same key owns the entry now; leave it alone.
        if handles.get(&self.key).map(|entry| entry.run_id) == Some(self.run_id) {
            handles.remove(&self.key);
        }
        drop(handles);
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Semaphore-bounded set of running agent tasks.
pub struct WorkerPool {
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    handles: HandleMap,
    next_run_id: AtomicU64,
    active: watch::Sender<usize>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Creates a pool running at most `max_concurrent` tasks (at least one).
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (active, _) = watch::channel(0);
        Self {
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            handles: Arc::new(Mutex::new(HashMap::new())),
            next_run_id: AtomicU64::new(0),
            active,
            stats: Arc::new(SharedPoolStats::new()),
        }
    }

    /// Free execution slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Reserves a slot without waiting.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    /// Runs `task` for `key` on its own tokio task, holding `permit` until
    /// it finishes. The task resolves to whether the run succeeded.
    pub fn spawn<F>(&self, key: String, permit: OwnedSemaphorePermit, task: F)
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        self.active.send_modify(|n| *n += 1);
        let guard = RunGuard {
            key: key.clone(),
            run_id,
            handles: Arc::clone(&self.handles),
            active: self.active.clone(),
        };
        let stats = Arc::clone(&self.stats);

        // Hold the map lock across spawn so a fast task cannot remove its
        // entry before it is inserted.
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _permit = permit;
            let started = Instant::now();
            let success = task.await;
            stats.record(success, started.elapsed());
        });
        let entry = RunEntry {
            run_id,
            handle: handle.abort_handle(),
            started: Instant::now(),
        };
        if handles.insert(key.clone(), entry).is_some() {
            warn!(agent = %key, "Replaced tracking of an agent already running in this pool");
        }
    }

    /// Number of runs currently executing.
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Whether a run of `key` is executing.
    pub fn is_running(&self, key: &str) -> bool {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Executing runs with how long each has been running, sorted by key.
    pub fn running_for(&self) -> Vec<(String, Duration)> {
        let mut runs: Vec<(String, Duration)> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, entry)| (key.clone(), entry.started.elapsed()))
            .collect();
        runs.sort();
        runs
    }

    /// Waits until no run is executing. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Aborts the executing run of `key`. Returns whether one was running.
    ///
    /// The slot frees once the task has unwound, not when this returns.
    pub fn abort(&self, key: &str) -> bool {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        match handles.get(key) {
            Some(entry) => {
                debug!(agent = %key, "Aborting agent run");
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Aborts every executing run and returns their keys.
    pub fn abort_all(&self) -> Vec<String> {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys = Vec::with_capacity(handles.len());
        for (key, entry) in handles.iter() {
            debug!(agent = %key, "Aborting in-flight agent run");
            entry.handle.abort();
            keys.push(key.clone());
        }
        keys.sort();
        keys
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.max_concurrent, self.active())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();

        assert_eq!(stats.max_concurrent, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_processed(), 0);
        assert!((stats.success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            max_concurrent: 4,
            active: 2,
            completed: 80,
            failed: 20,
            average_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record(true, Duration::from_secs(10));
        stats.record(true, Duration::from_secs(20));
        stats.record(false, Duration::from_secs(5));

        let pool_stats = stats.to_pool_stats(4, 1);

        assert_eq!(pool_stats.max_concurrent, 4);
        assert_eq!(pool_stats.active, 1);
        assert_eq!(pool_stats.completed, 2);
        assert_eq!(pool_stats.failed, 1);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_duration.as_millis() > 11000);
        assert!(pool_stats.average_duration.as_millis() < 12000);
    }

    #[tokio::test]
    async fn test_permits_bound_concurrency() {
        let pool = WorkerPool::new(2);
        let first = pool.try_acquire().unwrap();
        let _second = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.available(), 0);

        drop(first);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_spawn_and_wait_idle() {
        let pool = WorkerPool::new(4);
        for (i, success) in [true, false, true].into_iter().enumerate() {
            let permit = pool.try_acquire().unwrap();
            pool.spawn(format!("job-{}", i), permit, async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                success
            });
        }

        assert!(pool.wait_idle(Duration::from_secs(5)).await);
        let stats = pool.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(pool.available(), 4);
        assert!(pool.running_for().is_empty());
    }

    #[tokio::test]
    async fn test_abort_all_releases_slots() {
        let pool = WorkerPool::new(1);
        let permit = pool.try_acquire().unwrap();
        pool.spawn("stuck".to_string(), permit, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            true
        });

        assert!(pool.is_running("stuck"));
        assert!(!pool.wait_idle(Duration::from_millis(20)).await);

        assert_eq!(pool.abort_all(), vec!["stuck".to_string()]);
        assert!(pool.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_finished_run_keeps_later_run_of_same_key_tracked() {
        let pool = WorkerPool::new(2);
        let (release_first, first_done) = tokio::sync::oneshot::channel::<()>();

        let permit = pool.try_acquire().unwrap();
        pool.spawn("job-7".to_string(), permit, async move {
            let _ = first_done.await;
            true
        });
        let permit = pool.try_acquire().unwrap();
        pool.spawn("job-7".to_string(), permit, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            true
        });

        release_first.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.active(), 1);
        assert!(pool.is_running("job-7"));

        // The surviving entry still aborts the long run.
        assert_eq!(pool.abort_all(), vec!["job-7".to_string()]);
        assert!(pool.wait_idle(Duration::from_secs(5)).await);
        assert!(!pool.is_running("job-7"));
    }

    #[tokio::test]
    async fn test_abort_single_run_and_elapsed() {
        let pool = WorkerPool::new(2);
        for key in ["slow", "quick"] {
            let permit = pool.try_acquire().unwrap();
            pool.spawn(key.to_string(), permit, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                true
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let runs = pool.running_for();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].0, "quick");
        assert!(runs.iter().all(|(_, elapsed)| *elapsed >= Duration::from_millis(20)));

        assert!(pool.abort("slow"));
        assert!(!pool.abort("missing"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pool.is_running("slow"));
        assert!(pool.is_running("quick"));
        assert_eq!(pool.stats().total_processed(), 0);
        pool.abort_all();
    }
}
