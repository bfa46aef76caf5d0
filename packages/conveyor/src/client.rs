//! Driver-independent client facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::driver::Driver;
use crate::error::{QueueError, Result};
use crate::job::{EnqueueOptions, Job, QueueStats, Schedule, ScheduleSpec};
use crate::redis::{RedisConfig, RedisDriver};
use crate::scheduler::CronExpr;
use crate::sql::postgres::PostgresDriver;
use crate::sql::sqlite::SqliteDriver;

/// Public entry point for producers: enqueue, inspect, retry, cancel, and
/// manage schedules over any [`Driver`].
pub struct Client {
    driver: Arc<dyn Driver>,
    closed: AtomicBool,
}

impl Client {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn connect_postgres(url: &str) -> Result<Self> {
        Ok(Self::new(Arc::new(PostgresDriver::connect(url).await?)))
    }

    pub async fn connect_sqlite(url: &str) -> Result<Self> {
        Ok(Self::new(Arc::new(SqliteDriver::connect(url).await?)))
    }

    pub async fn connect_redis(url: &str) -> Result<Self> {
        Ok(Self::new(Arc::new(RedisDriver::connect(url).await?)))
    }

    pub async fn connect_redis_with(url: &str, config: RedisConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(
            RedisDriver::connect_with(url, config).await?,
        )))
    }

    /// Shared driver handle, for wiring up workers and schedulers against
    /// the same backend.
    pub fn driver(&self) -> Arc<dyn Driver> {
        self.driver.clone()
    }

    /// Enqueue a job. Returns the new job's id, or the existing job's id
    /// when a deduplication key matched.
    pub async fn enqueue(
        &self,
        queue: &str,
        data: Value,
        opts: EnqueueOptions,
    ) -> Result<String> {
        self.driver.enqueue(queue, data, opts).await
    }

    /// Look up a job by id, falling back to deduplication key.
    pub async fn get_job(&self, id_or_key: &str) -> Result<Option<Job>> {
        self.driver.get_job(id_or_key).await
    }

    /// Re-run a failed job from scratch. Returns `false` for jobs that are
    /// missing or not in the failed state.
    pub async fn retry(&self, id_or_key: &str) -> Result<bool> {
        self.driver.retry(id_or_key).await
    }

    /// Cancel a pending or processing job. A job processing on this or
    /// another instance observes the cancellation through its next
    /// heartbeat; its final commit is rejected by the ownership guard.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        self.driver.cancel(id).await
    }

    /// Snapshot counts for a queue.
    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        self.driver.stats(queue).await
    }

    /// Create or update a schedule. The cron expression is validated here
    /// and the first run boundary computed from the current time.
    pub async fn upsert_schedule(&self, spec: ScheduleSpec) -> Result<Schedule> {
        let cron = CronExpr::parse(&spec.cron)?;
        let next_run_at = cron.next_after(Utc::now()).ok_or_else(|| {
            QueueError::InvalidCron {
                expr: spec.cron.clone(),
                message: "expression has no upcoming occurrence".into(),
            }
        })?;
        self.driver.upsert_schedule(spec, next_run_at).await
    }

    pub async fn get_schedule(&self, key: &str) -> Result<Option<Schedule>> {
        self.driver.get_schedule(key).await
    }

    pub async fn set_schedule_enabled(&self, key: &str, enabled: bool) -> Result<bool> {
        self.driver.set_schedule_enabled(key, enabled).await
    }

    /// Release driver resources. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("client already closed");
            return Ok(());
        }
        self.driver.close().await
    }
}
