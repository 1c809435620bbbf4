//! Scheduler for recurring link health checks.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use crate::clock::Clock;
use crate::db::{DbError, HealthStatus, Link, Store};
use crate::health::HealthChecker;

/// Supplies the links that are due for a check.
pub trait DueLinkSource: Send + Sync {
    /// Active links never checked or last checked before `cutoff`, at most `limit`.
    fn due_links(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Link>, DbError>;
}

impl DueLinkSource for Store {
    fn due_links(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Link>, DbError> {
        self.get_links_due_for_check(cutoff, limit)
    }
}

/// Counts from one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub selected: usize,
    pub healthy: usize,
    pub warning: usize,
    pub error: usize,
    /// Check tasks that did not complete (panicked or cancelled)
    pub failed: usize,
}

/// Runs the health checker over due links on a fixed interval.
pub struct HealthScheduler {
    checker: Arc<HealthChecker>,
    source: Arc<dyn DueLinkSource>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: usize,
    max_jitter: Duration,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl HealthScheduler {
    pub fn new(
        checker: Arc<HealthChecker>,
        source: Arc<dyn DueLinkSource>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            checker,
            source,
            clock,
            interval,
            batch_size,
            max_jitter: Duration::ZERO,
            stop: Mutex::new(None),
        }
    }

    /// Delay each probe in a batch by a random amount up to `max`, so a batch
    /// does not hit shared hosts at the same instant.
    pub fn with_jitter(mut self, max: Duration) -> Self {
        self.max_jitter = max;
        self
    }

    /// Run one tick: select due links and check them concurrently.
    pub async fn run_batch(&self) -> BatchSummary {
        let staleness = ChronoDuration::from_std(self.interval).unwrap_or(ChronoDuration::minutes(5));
        let cutoff = self.clock.now() - staleness;

        let links = match self.source.due_links(cutoff, self.batch_size) {
            Ok(links) => links,
            Err(e) => {
                tracing::error!("HealthScheduler: Failed to load due links: {}", e);
                return BatchSummary::default();
            }
        };

        let mut summary = BatchSummary {
            selected: links.len(),
            ..Default::default()
        };
        if links.is_empty() {
            return summary;
        }

        tracing::info!("HealthScheduler: Checking health for {} links", links.len());

        let jitter_ms = self.max_jitter.as_millis() as u64;
        let mut tasks = JoinSet::new();
        for link in links {
            let checker = self.checker.clone();
            tasks.spawn(async move {
                if jitter_ms > 0 {
                    let jitter = rand::random::<u64>() % jitter_ms;
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                }
                checker.check(link.id, &link.original_url).await.status
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(HealthStatus::Healthy) => summary.healthy += 1,
                Ok(HealthStatus::Warning) => summary.warning += 1,
                Ok(HealthStatus::Error) => summary.error += 1,
                Ok(HealthStatus::Unknown) => {}
                Err(e) => {
                    tracing::error!("HealthScheduler: Health check task failed: {}", e);
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            "HealthScheduler: Health checks completed ({} healthy, {} warning, {} error, {} failed)",
            summary.healthy,
            summary.warning,
            summary.error,
            summary.failed
        );
        summary
    }

    /// Start the recurring background task.
    ///
    /// The stop channel is registered before the task is spawned, so a
    /// `stop` issued right after `start` is never lost.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        let (tx, mut rx) = broadcast::channel(1);
        *self.stop.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(
                "HealthScheduler: Started (interval {:?}, batch size {})",
                scheduler.interval,
                scheduler.batch_size
            );

            loop {
                tokio::select! {
                    biased;
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        scheduler.run_batch().await;
                    }
                }
            }

            tracing::info!("HealthScheduler: Stopped");
        })
    }

    /// Stop the background task after the current batch.
    pub async fn stop(&self) {
        let tx = self.stop.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}
