//! Background worker that finalizes idle sessions.
//!
//! Each cycle scans the last-activity records, picks the sessions whose idle
//! marker has lapsed and runs [`SessionLifecycle::finalize`] on them. The
//! worker holds no state of its own, so any number of sweepers may run
//! against the same store: the `Active -> Finalizing` claim lets only one of
//! them finalize a given session. A session left in `Finalizing` by a worker
//! that died mid-way is handed back once its last activity is older than the
//! idle timeout plus the reclaim grace.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::memory::core::config::SweepConfig;
use crate::memory::core::errors::MemoryResult;
use crate::memory::core::ids::UserId;
use crate::memory::engine::lifecycle::{FinalizeOutcome, SessionLifecycle};

/// Statistics from a sweep run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Sessions found idle.
    pub expired: usize,
    /// Sessions this sweeper finalized.
    pub finalized: usize,
    /// Sessions claimed by someone else.
    pub skipped: usize,
    /// Stuck sessions taken over and finalized.
    pub reclaimed: usize,
    /// Sessions whose finalization returned an error.
    pub failed: usize,
    /// Total sweep duration in milliseconds.
    pub duration_ms: u64,
}

/// Periodic idle-session sweeper.
pub struct IdleSweeper {
    lifecycle: Arc<SessionLifecycle>,
    config: SweepConfig,
    idle_timeout: Duration,
    shutdown: Arc<Notify>,
}

impl IdleSweeper {
    /// Create a sweeper for sessions idle longer than `idle_timeout`.
    #[must_use]
    pub fn new(lifecycle: Arc<SessionLifecycle>, config: SweepConfig, idle_timeout: Duration) -> Self {
        Self {
            lifecycle,
            config,
            idle_timeout,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a shutdown notifier to stop the worker.
    #[must_use]
    pub fn shutdown_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Spawn the worker as a tokio task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        if !self.config.enabled {
            info!("idle sweeper is disabled");
            return;
        }

        let interval = Duration::from_secs(self.config.interval_seconds.max(1));
        info!(?interval, idle_timeout = ?self.idle_timeout, "starting idle sweeper");

        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {
                    match self.run_sweep().await {
                        Ok(stats) if stats.expired > 0 => info!(
                            expired = stats.expired,
                            finalized = stats.finalized,
                            skipped = stats.skipped,
                            reclaimed = stats.reclaimed,
                            failed = stats.failed,
                            duration_ms = stats.duration_ms,
                            "sweep completed"
                        ),
                        Ok(_) => debug!("sweep found no idle sessions"),
                        Err(err) => warn!(?err, "sweep failed"),
                    }
                }
                () = self.shutdown.notified() => {
                    info!("idle sweeper shutting down");
                    break;
                }
            }
        }
    }

    /// Run a single sweep against the wall clock.
    ///
    /// # Errors
    /// Returns an error if the activity records cannot be scanned.
    pub async fn run_sweep(&self) -> MemoryResult<SweepStats> {
        self.run_sweep_at(Utc::now()).await
    }

    /// Run a single sweep as of `now`.
    ///
    /// Finalization errors are counted, not returned.
    ///
    /// # Errors
    /// Returns an error if the activity records cannot be scanned.
    pub async fn run_sweep_at(&self, now: DateTime<Utc>) -> MemoryResult<SweepStats> {
        let start = Instant::now();
        let mut stats = SweepStats::default();

        let expired = self.lifecycle.expired_sessions(now, self.idle_timeout).await?;
        stats.expired = expired.len();

        for user in expired {
            match self.lifecycle.finalize(&user).await {
                Ok(FinalizeOutcome::Finalized(report)) => {
                    stats.finalized += 1;
                    if let Some(error) = report.error {
                        warn!(user = %user, %error, "session finalized with errors");
                    }
                }
                Ok(FinalizeOutcome::NotClaimed) => match self.reclaim(&user, now).await {
                    Ok(true) => {
                        stats.reclaimed += 1;
                        stats.finalized += 1;
                    }
                    Ok(false) => {
                        debug!(user = %user, "session claimed elsewhere");
                        stats.skipped += 1;
                    }
                    Err(err) => {
                        warn!(user = %user, ?err, "reclaim failed");
                        stats.failed += 1;
                    }
                },
                Err(err) => {
                    warn!(user = %user, ?err, "finalize failed");
                    stats.failed += 1;
                }
            }
        }

        stats.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(stats)
    }

    /// Take over a stale `Finalizing` session and finalize it again.
    async fn reclaim(&self, user: &UserId, now: DateTime<Utc>) -> MemoryResult<bool> {
        let stale_after = self.idle_timeout + self.config.reclaim_grace();
        if !self.lifecycle.reclaim_stale(user, now, stale_after).await? {
            return Ok(false);
        }
        Ok(matches!(
            self.lifecycle.finalize(user).await?,
            FinalizeOutcome::Finalized(_)
        ))
    }
}
