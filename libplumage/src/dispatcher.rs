//! Periodic discovery and execution of due posts
//!
//! One logical dispatcher per deployment. Each tick scans for pending
//! posts that have come due, executes them in small concurrent
//! sub-batches, and swallows per-post errors so a bad post never takes
//! the batch down. Safety against a second dispatcher comes from the
//! claim CAS in the posting service, at the cost of wasted scans.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Timelike};
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::oauth::OAuthClient;
use crate::post_service::{ExecutionOutcome, PostingService};
use crate::token_store::TokenStore;
use crate::error::Result;

const DAY_SECS: i64 = 24 * 3600;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Time between scans
    pub poll_interval: Duration,
    /// Maximum due posts fetched per scan
    pub batch_size: u32,
    /// Posts executed concurrently within a scan
    pub sub_batch_size: usize,
    /// Pause between sub-batches, to smooth rate pressure
    pub sub_batch_pause: Duration,
    /// Posts stuck in executing longer than this are reclaimed
    pub executing_timeout: Duration,
    /// How long shutdown waits for an in-flight scan
    pub shutdown_grace: Duration,
    /// How often the supervisor verifies the scan loop is alive
    pub supervision_interval: Duration,
    /// Local hour (0-23) at which daily maintenance runs
    pub maintenance_hour: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 100,
            sub_batch_size: 10,
            sub_batch_pause: Duration::from_secs(1),
            executing_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(30),
            supervision_interval: Duration::from_secs(30 * 60),
            maintenance_hour: 3,
        }
    }
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size,
            sub_batch_size: config.sub_batch_size.max(1),
            shutdown_grace: config.shutdown_grace(),
            ..Self::default()
        }
    }
}

/// Point-in-time view of dispatcher liveness, for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub loop_alive: bool,
    pub ticks: u64,
    pub last_tick_at: Option<i64>,
    pub posts_completed: u64,
    pub posts_failed: u64,
    pub posts_rescheduled: u64,
}

pub struct Dispatcher {
    db: Database,
    service: PostingService,
    store: TokenStore,
    oauth: Arc<OAuthClient>,
    config: DispatcherConfig,
    is_running: AtomicBool,
    loop_alive: AtomicBool,
    ticks: AtomicU64,
    last_tick_at: AtomicI64,
    completed: AtomicU64,
    failed: AtomicU64,
    rescheduled: AtomicU64,
    last_maintenance_day: AtomicI64,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        service: PostingService,
        store: TokenStore,
        oauth: Arc<OAuthClient>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            db,
            service,
            store,
            oauth,
            config,
            is_running: AtomicBool::new(false),
            loop_alive: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            last_tick_at: AtomicI64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rescheduled: AtomicU64::new(0),
            last_maintenance_day: AtomicI64::new(-1),
        }
    }

    pub fn health(&self) -> HealthSnapshot {
        let last_tick_at = self.last_tick_at.load(Ordering::SeqCst);
        HealthSnapshot {
            loop_alive: self.loop_alive.load(Ordering::SeqCst),
            ticks: self.ticks.load(Ordering::SeqCst),
            last_tick_at: (last_tick_at > 0).then_some(last_tick_at),
            posts_completed: self.completed.load(Ordering::SeqCst),
            posts_failed: self.failed.load(Ordering::SeqCst),
            posts_rescheduled: self.rescheduled.load(Ordering::SeqCst),
        }
    }

    /// Run until `cancel` fires: the scan loop, a supervisor that
    /// restarts it if it ever dies, and the daily maintenance check.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Dispatcher starting"
        );

        let mut scan_task = self.clone().spawn_scan_loop(cancel.clone());
        let mut supervision = tokio::time::interval(self.config.supervision_interval);
        supervision.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                _ = supervision.tick() => {
                    if scan_task.is_finished() && !cancel.is_cancelled() {
                        error!("Scan loop died, restarting");
                        scan_task = self.clone().spawn_scan_loop(cancel.clone());
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        // Drain the in-flight scan, bounded by the grace period
        info!("Dispatcher stopping, draining in-flight scan");
        if tokio::time::timeout(self.config.shutdown_grace, &mut scan_task)
            .await
            .is_err()
        {
            warn!("In-flight scan did not drain in time, aborting");
            scan_task.abort();
        }
        info!("Dispatcher stopped");
    }

    fn spawn_scan_loop(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.loop_alive.store(true, Ordering::SeqCst);
            let mut interval = tokio::time::interval(self.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancel.cancelled() => break,
                }

                match self.tick(&cancel).await {
                    Ok(true) => {}
                    Ok(false) => debug!("Previous tick still running, skipped"),
                    Err(e) => error!("Tick failed: {}", e),
                }

                if let Err(e) = self.run_maintenance_if_due().await {
                    error!("Maintenance failed: {}", e);
                }
            }

            self.loop_alive.store(false, Ordering::SeqCst);
        })
    }

    /// One scan. Returns false when a previous tick still holds the
    /// re-entrancy guard.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<bool> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("Tick requested while previous tick is still running");
            return Ok(false);
        }

        // Finish within the interval, leaving headroom before the next
        // tick is due
        let deadline = self
            .config
            .poll_interval
            .saturating_sub(Duration::from_secs(5));
        let result = if deadline.is_zero() {
            self.tick_inner(cancel).await
        } else {
            match tokio::time::timeout(deadline, self.tick_inner(cancel)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Tick hit its soft deadline, yielding to the next scan");
                    Ok(())
                }
            }
        };

        self.is_running.store(false, Ordering::SeqCst);
        self.ticks.fetch_add(1, Ordering::SeqCst);
        self.last_tick_at
            .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
        result.map(|_| true)
    }

    async fn tick_inner(&self, cancel: &CancellationToken) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        // Reclaim posts orphaned mid-execution by a crash or kill
        let cutoff = now - self.config.executing_timeout.as_secs() as i64;
        let reclaimed = self.db.revert_stale_executing(cutoff, now).await?;
        if reclaimed > 0 {
            warn!(count = reclaimed, "Reclaimed posts stuck in executing");
        }

        let due = self.db.due_posts(now, self.config.batch_size).await?;
        if due.is_empty() {
            return Ok(());
        }
        info!(count = due.len(), "Found due post(s)");

        let chunks: Vec<_> = due.chunks(self.config.sub_batch_size).collect();
        let chunk_count = chunks.len();

        for (i, chunk) in chunks.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let executions = chunk.iter().map(|post| async {
                match self.service.execute(post, &post.user_id, cancel).await {
                    Ok(ExecutionOutcome::Completed) => {
                        self.completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(ExecutionOutcome::Failed) => {
                        self.failed.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(ExecutionOutcome::Rescheduled) => {
                        self.rescheduled.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(ExecutionOutcome::AlreadyClaimed | ExecutionOutcome::Cancelled) => {}
                    // Already recorded against the post; never let one
                    // post abort the batch
                    Err(e) => warn!(post_id = %post.id, "Execution error: {}", e),
                }
            });
            join_all(executions).await;

            if i + 1 < chunk_count && !cancel.is_cancelled() {
                tokio::time::sleep(self.config.sub_batch_pause).await;
            }
        }

        Ok(())
    }

    async fn run_maintenance_if_due(&self) -> Result<()> {
        let local = chrono::Local::now();
        if local.hour() != self.config.maintenance_hour {
            return Ok(());
        }
        let today = local.date_naive().num_days_from_ce() as i64;
        if self.last_maintenance_day.swap(today, Ordering::SeqCst) == today {
            return Ok(());
        }
        self.maintenance().await
    }

    /// Daily housekeeping: close dead sessions, archive old terminal
    /// posts, purge stale failure records, sweep abandoned
    /// authorization attempts.
    pub async fn maintenance(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        let sessions = self.store.purge_expired(now).await?;
        let completed = self.db.archive_completed_before(now - 30 * DAY_SECS).await?;
        let failed = self.db.archive_failed_before(now - 7 * DAY_SECS).await?;
        let failures = self
            .db
            .purge_failure_records_before(now - 90 * DAY_SECS)
            .await?;
        let states = self.oauth.state_cache().sweep(now);

        info!(
            sessions, completed, failed, failures, states,
            "Maintenance pass complete"
        );
        Ok(())
    }
}
