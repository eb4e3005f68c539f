//! Background retry scheduler.
//!
//! Polls the engine on a fixed interval. Each tick clears elapsed cooldowns,
//! runs the execution watchdog, and retries eligible auto-mode entries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::jobs::engine::ReindexEngine;

/// Counters shared between the scheduler loop and its handle.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    ticks: Arc<AtomicU64>,
    retried: Arc<AtomicU64>,
    timed_out: Arc<AtomicU64>,
}

impl SchedulerStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running scheduler.
pub struct SchedulerHandle {
    shutdown: tokio::sync::watch::Sender<bool>,
    stats: SchedulerStats,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop to stop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Retry scheduler task ended abnormally");
        }
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

/// Periodic driver for automatic retries and the watchdog.
pub struct RetryScheduler {
    engine: Arc<ReindexEngine>,
    poll_interval: Duration,
}

impl RetryScheduler {
    pub fn new(engine: Arc<ReindexEngine>, poll_interval: Duration) -> Self {
        Self {
            engine,
            poll_interval,
        }
    }

    pub fn from_config(engine: Arc<ReindexEngine>, config: &SchedulerConfig) -> Self {
        Self::new(engine, config.poll_interval)
    }

    /// Start the loop, returning a handle for control.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let stats = SchedulerStats::default();
        let loop_stats = stats.clone();

        let join = tokio::spawn(async move {
            tracing::info!(
                poll_interval_ms = self.poll_interval.as_millis() as u64,
                "Retry scheduler started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Retry scheduler shutting down");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {
                        let report = self.engine.tick();
                        loop_stats.ticks.fetch_add(1, Ordering::Relaxed);
                        loop_stats.retried.fetch_add(report.retried.len() as u64, Ordering::Relaxed);
                        loop_stats.timed_out.fetch_add(report.timed_out.len() as u64, Ordering::Relaxed);

                        if !report.retried.is_empty() || !report.timed_out.is_empty() {
                            tracing::info!(
                                retried = report.retried.len(),
                                timed_out = report.timed_out.len(),
                                skipped = report.skipped.len(),
                                cooldowns_cleared = report.cooldowns_cleared,
                                "Scheduler tick"
                            );
                        }
                    }
                }
            }

            tracing::info!("Retry scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            stats,
            join,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::runner::NoopRunner;

    #[tokio::test]
    async fn test_scheduler_ticks_and_stops() {
        let engine = ReindexEngine::builder(Arc::new(NoopRunner)).build();
        let handle = RetryScheduler::new(engine, Duration::from_millis(5)).start();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.stats().ticks() > 0);
        handle.shutdown().await;
    }
}
