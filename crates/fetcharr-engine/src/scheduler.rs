//! Process-wide worker scheduler.
//!
//! Each registered worker gets its own spawned loop driven by a
//! `tokio::time::interval` with skipped missed ticks, so a batch that
//! outlives its interval suppresses the overlapping ticks instead of piling
//! up. Shutdown is signalled through a watch channel and joined.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::workers::StageWorker;

/// Snapshot of one registered worker's scheduling state.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    /// Worker name.
    pub name: &'static str,
    /// Poll interval in seconds.
    pub interval_seconds: u64,
    /// When the most recent batch started.
    pub last_started: Option<DateTime<Utc>>,
    /// Outcome of the most recent batch.
    pub last_outcome: Option<String>,
    /// Completed batch count.
    pub runs: u64,
}

/// Registers workers and drives their batch methods on their intervals.
pub struct Scheduler {
    workers: Vec<Arc<dyn StageWorker>>,
    state: Arc<RwLock<HashMap<&'static str, TaskStatus>>>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Construct an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            workers: Vec::new(),
            state: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Register a worker; call before [`Scheduler::start`].
    pub fn register(&mut self, worker: Arc<dyn StageWorker>) {
        self.workers.push(worker);
    }

    /// Spawn one loop per registered worker.
    pub async fn start(&mut self) {
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            let state = Arc::clone(&self.state);
            let mut shutdown = self.shutdown.subscribe();
            state.write().await.insert(
                worker.name(),
                TaskStatus {
                    name: worker.name(),
                    interval_seconds: worker.poll_interval().as_secs(),
                    last_started: None,
                    last_outcome: None,
                    runs: 0,
                },
            );

            self.handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(worker.poll_interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let started = Utc::now();
                            let outcome = match worker.process_batch().await {
                                Ok(stats) => {
                                    debug!(
                                        worker = worker.name(),
                                        claimed = stats.claimed,
                                        succeeded = stats.succeeded,
                                        failed = stats.failed,
                                        "batch complete"
                                    );
                                    format!(
                                        "ok: {}/{} items",
                                        stats.succeeded, stats.claimed
                                    )
                                }
                                Err(err) => {
                                    warn!(worker = worker.name(), error = %err, "batch failed");
                                    format!("error: {err}")
                                }
                            };
                            let mut state = state.write().await;
                            if let Some(entry) = state.get_mut(worker.name()) {
                                entry.last_started = Some(started);
                                entry.last_outcome = Some(outcome);
                                entry.runs += 1;
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }
    }

    /// Scheduling snapshot for every registered worker.
    pub async fn status(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<_> = self.state.read().await.values().cloned().collect();
        statuses.sort_by_key(|status| status.name);
        statuses
    }

    /// Signal shutdown and join every loop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::BatchStats;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct CountingWorker {
        ticks: AtomicU64,
        delay: Duration,
    }

    #[async_trait]
    impl StageWorker for CountingWorker {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_millis(20)
        }

        async fn process_batch(&self) -> anyhow::Result<BatchStats> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(BatchStats::default())
        }
    }

    #[tokio::test]
    async fn ticks_fire_and_shutdown_joins() {
        let worker = Arc::new(CountingWorker {
            ticks: AtomicU64::new(0),
            delay: Duration::from_millis(1),
        });
        let mut scheduler = Scheduler::new();
        scheduler.register(Arc::clone(&worker) as Arc<dyn StageWorker>);
        scheduler.start().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = scheduler.status().await;
        assert_eq!(status.len(), 1);
        assert!(status[0].runs >= 2, "expected multiple runs");
        scheduler.shutdown().await;

        let after = worker.ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(worker.ticks.load(Ordering::SeqCst), after, "no ticks after shutdown");
    }

    #[tokio::test]
    async fn slow_batches_suppress_overlapping_ticks() {
        let worker = Arc::new(CountingWorker {
            ticks: AtomicU64::new(0),
            delay: Duration::from_millis(80),
        });
        let mut scheduler = Scheduler::new();
        scheduler.register(Arc::clone(&worker) as Arc<dyn StageWorker>);
        scheduler.start().await;

        tokio::time::sleep(Duration::from_millis(170)).await;
        scheduler.shutdown().await;

        // With a 20 ms interval and an 80 ms batch, overlapped ticks must be
        // dropped rather than queued: at most ~3 runs fit in 170 ms.
        assert!(worker.ticks.load(Ordering::SeqCst) <= 3);
    }
}
