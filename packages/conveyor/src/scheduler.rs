//! Cron-driven schedules producing jobs at due times.
//!
//! The scheduler is an independent loop: every `check_interval` it asks the
//! driver for enabled schedules whose `next_run_at` has matured, enqueues a
//! job per matured boundary (or one per catch-up window, see
//! [`CatchupPolicy`]), and advances the schedule. Each enqueued job carries
//! the key `<schedule key>:<boundary RFC3339>` with [`ReplacePolicy::Never`],
//! so re-running the scheduler - or running several instances - never
//! double-fires a boundary.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{system_clock, Clock};
use crate::driver::Driver;
use crate::error::{QueueError, Result};
use crate::job::{EnqueueOptions, ReplacePolicy, Schedule};

/// Upper bound on boundaries fired for one schedule in one tick, so a
/// schedule that was down for a long time cannot monopolize the loop.
const MAX_REPLAY_PER_TICK: usize = 1000;

/// A parsed cron expression.
///
/// Accepts classic 5-field crontab strings as well as the 6/7-field variant
/// with a leading seconds column; 5-field input is pinned to second zero.
#[derive(Debug, Clone)]
pub struct CronExpr {
    schedule: cron::Schedule,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let normalized = if expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            QueueError::InvalidCron {
                expr: expr.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Self { schedule })
    }

    /// First occurrence strictly after the given instant.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// How to handle cron boundaries that elapsed while the scheduler was down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatchupPolicy {
    /// Enqueue once for the first matured boundary and jump to the first
    /// future one.
    #[default]
    Coalesce,
    /// Enqueue one job per elapsed boundary.
    Replay,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub check_interval: Duration,
    pub catchup: CatchupPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            catchup: CatchupPolicy::default(),
        }
    }
}

struct SchedulerInner {
    driver: Arc<dyn Driver>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

/// Periodic loop turning due schedules into jobs.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(driver: Arc<dyn Driver>, config: SchedulerConfig) -> Self {
        Self::with_clock(driver, config, system_clock())
    }

    pub fn with_clock(
        driver: Arc<dyn Driver>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                driver,
                config,
                clock,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
            join: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Start the check loop. Idempotent.
    pub async fn start(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run_loop().await });
        *self.join.lock().await = Some(handle);
    }

    /// Stop the check loop. Idempotent.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.join.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.started.store(false, Ordering::SeqCst);
    }

    /// Run one check pass immediately. The loop calls this; tests and
    /// embedders may call it directly.
    pub async fn run_once(&self) -> Result<()> {
        self.inner.tick().await
    }
}

impl SchedulerInner {
    async fn run_loop(self: Arc<Self>) {
        info!(check_interval_ms = self.config.check_interval.as_millis() as u64, "scheduler starting");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "schedule check failed");
            }
        }
        info!("scheduler stopped");
    }

    async fn tick(&self) -> Result<()> {
        let now = self.clock.now();
        let due = self.driver.due_schedules(now).await?;
        for schedule in due {
            if let Err(e) = self.fire(&schedule, now).await {
                error!(schedule = %schedule.key, error = %e, "failed to fire schedule");
            }
        }
        Ok(())
    }

    async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<()> {
        let cron = CronExpr::parse(&schedule.cron)?;

        let mut fired_boundary = schedule.next_run_at;
        match self.config.catchup {
            CatchupPolicy::Coalesce => {
                self.enqueue_boundary(schedule, fired_boundary).await?;
            }
            CatchupPolicy::Replay => {
                let mut boundary = schedule.next_run_at;
                let mut fired = 0;
                loop {
                    self.enqueue_boundary(schedule, boundary).await?;
                    fired_boundary = boundary;
                    fired += 1;
                    match cron.next_after(boundary) {
                        Some(next) if next <= now && fired < MAX_REPLAY_PER_TICK => {
                            boundary = next;
                        }
                        _ => break,
                    }
                }
            }
        }

        match cron.next_after(now) {
            Some(next) => {
                self.driver
                    .mark_schedule_run(&schedule.key, fired_boundary, next)
                    .await?;
                debug!(schedule = %schedule.key, next_run_at = %next, "schedule advanced");
            }
            None => {
                // the expression has no future occurrences; park the schedule
                warn!(schedule = %schedule.key, "cron expression exhausted, disabling schedule");
                self.driver
                    .mark_schedule_run(&schedule.key, fired_boundary, schedule.next_run_at)
                    .await?;
                self.driver
                    .set_schedule_enabled(&schedule.key, false)
                    .await?;
            }
        }
        Ok(())
    }

    async fn enqueue_boundary(
        &self,
        schedule: &Schedule,
        boundary: DateTime<Utc>,
    ) -> Result<()> {
        let key = format!(
            "{}:{}",
            schedule.key,
            boundary.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let opts = EnqueueOptions::builder()
            .key(key.clone())
            .replace(ReplacePolicy::Never)
            .build();
        let id = self
            .driver
            .enqueue(&schedule.queue, schedule.data.clone(), opts)
            .await?;
        debug!(schedule = %schedule.key, job_id = %id, job_key = %key, "schedule fired");
        Ok(())
    }
}
