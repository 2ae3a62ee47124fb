//! Execution primitives for the scheduler.
//!
//! [`ExecutorFactory`] hands out the three kinds of executor the scheduler
//! runs on: a single-flight guard for loops that must never overlap
//! themselves (the polling cycle, orphan recovery), periodic background
//! tasks (lease renewal, recovery, health summary) and the bounded pool
//! that runs agents. Periodic tasks share one broadcast shutdown channel.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::worker_pool::WorkerPool;

/// Admits at most one holder at a time without waiting.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    busy: Arc<AtomicBool>,
}

/// Held while a single-flight section runs; releases it on drop.
#[derive(Debug)]
pub struct SingleFlightGuard {
    busy: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the section, or returns `None` if someone else is inside.
    pub fn try_enter(&self) -> Option<SingleFlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SingleFlightGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl Drop for SingleFlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Creates executors and owns the background tasks it spawned.
pub struct ExecutorFactory {
    shutdown_tx: broadcast::Sender<()>,
    periodic: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Default for ExecutorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorFactory {
    pub fn new() -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            periodic: Mutex::new(Vec::new()),
        }
    }

    pub fn single_flight(&self) -> SingleFlight {
        SingleFlight::new()
    }

    pub fn worker_pool(&self, max_concurrent: usize) -> WorkerPool {
        WorkerPool::new(max_concurrent)
    }

    /// Receiver that fires when [`ExecutorFactory::shutdown`] is called.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Runs `task` every `period` on its own tokio task until shutdown.
    ///
    /// The first run happens one period after spawning. A run that overruns
    /// its period delays the next one rather than bunching runs up.
    pub async fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => task().await,
                }
            }
            debug!(task = name, "Periodic task stopped");
        });

        self.periodic.lock().await.push((name, handle));
    }

    /// Stops every periodic task, waiting up to `timeout` for each to exit.
    pub async fn shutdown(&self, timeout: Duration) {
        // Ignore send error - tasks may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.periodic.lock().await.drain(..).collect();
        for (name, handle) in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!(task = name, error = %e, "Periodic task panicked"),
                Err(_) => {
                    info!(task = name, "Periodic task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
    }

    /// Number of periodic tasks still registered.
    pub async fn periodic_count(&self) -> usize {
        self.periodic.lock().await.len()
    }
}
