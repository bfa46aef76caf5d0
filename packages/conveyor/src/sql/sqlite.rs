//! SQLite-backed driver.
//!
//! Same row layout and visible semantics as the PostgreSQL driver. SQLite
//! serializes writers, so the claim is a single `UPDATE ... WHERE id IN
//! (SELECT ...) RETURNING` statement; no two connections can interleave
//! inside it. SQLite has no server clock, so every timestamp comes from the
//! driver's [`Clock`], which tests may pin.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use super::{stages_to_value, JobRow, ScheduleRow, JOB_COLUMNS, SCHEDULE_COLUMNS};
use crate::clock::{job_id, system_clock, Clock};
use crate::driver::Driver;
use crate::error::{QueueError, Result};
use crate::job::{EnqueueOptions, Job, QueueStats, ReplacePolicy, Schedule, ScheduleSpec, Stage};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        queue TEXT NOT NULL,
        key TEXT,
        data TEXT NOT NULL,
        metadata TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        scheduled_for TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL DEFAULT 'pending',
        locked_by TEXT,
        locked_at TEXT,
        expires_at TEXT,
        last_error TEXT,
        stages TEXT,
        overall_progress INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_queue_key ON jobs (queue, key) WHERE key IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (queue, status, scheduled_for, priority, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs (status, expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS schedules (
        key TEXT PRIMARY KEY,
        queue TEXT NOT NULL,
        cron TEXT NOT NULL,
        data TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_run_at TEXT,
        next_run_at TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (enabled, next_run_at)",
];

/// SQLite driver.
#[derive(Clone)]
pub struct SqliteDriver {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteDriver {
    /// Open (creating if missing) and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, ensuring the schema exists. In-memory pools
    /// must be limited to a single connection or each connection sees its
    /// own empty database.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        Self::from_pool_with_clock(pool, system_clock()).await
    }

    /// As [`Self::from_pool`] with an explicit time source.
    pub async fn from_pool_with_clock(pool: SqlitePool, clock: Arc<dyn Clock>) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, clock })
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE key = ? ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn existing_id(&self, queue: &str, key: &str) -> Result<String> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT id FROM jobs WHERE queue = ? AND key = ?",
        )
        .bind(queue)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    async fn enqueue(&self, queue: &str, data: Value, opts: EnqueueOptions) -> Result<String> {
        let id = job_id();
        let now = self.now();
        let scheduled_for = opts.scheduled_for(now);
        let stages = match opts.stages() {
            Some(stages) => Some(serde_json::to_value(stages)?),
            None => None,
        };

        let Some(key) = opts.key.as_deref() else {
            let id = sqlx::query_scalar::<_, String>(
                r#"
                INSERT INTO jobs (id, queue, key, data, metadata, priority, scheduled_for,
                                  attempts, max_attempts, status, stages, overall_progress,
                                  created_at, updated_at)
                VALUES (?, ?, NULL, ?, ?, ?, ?, 0, ?, 'pending', ?, 0, ?, ?)
                RETURNING id
                "#,
            )
            .bind(&id)
            .bind(queue)
            .bind(&data)
            .bind(&opts.metadata)
            .bind(opts.priority)
            .bind(scheduled_for)
            .bind(opts.max_attempts)
            .bind(&stages)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
            return Ok(id);
        };

        if opts.replace == ReplacePolicy::Never {
            let inserted = sqlx::query_scalar::<_, String>(
                r#"
                INSERT INTO jobs (id, queue, key, data, metadata, priority, scheduled_for,
                                  attempts, max_attempts, status, stages, overall_progress,
                                  created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, 'pending', ?, 0, ?, ?)
                ON CONFLICT (queue, key) WHERE key IS NOT NULL DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&id)
            .bind(queue)
            .bind(key)
            .bind(&data)
            .bind(&opts.metadata)
            .bind(opts.priority)
            .bind(scheduled_for)
            .bind(opts.max_attempts)
            .bind(&stages)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            return match inserted {
                Some(id) => Ok(id),
                None => self.existing_id(queue, key).await,
            };
        }

        let upserted = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO jobs (id, queue, key, data, metadata, priority, scheduled_for,
                              attempts, max_attempts, status, stages, overall_progress,
                              created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, 'pending', ?, 0, ?, ?)
            ON CONFLICT (queue, key) WHERE key IS NOT NULL DO UPDATE SET
                data = excluded.data,
                metadata = excluded.metadata,
                priority = excluded.priority,
                scheduled_for = excluded.scheduled_for,
                attempts = 0,
                max_attempts = excluded.max_attempts,
                status = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                expires_at = NULL,
                last_error = NULL,
                stages = excluded.stages,
                overall_progress = 0,
                updated_at = excluded.updated_at
            WHERE jobs.status <> 'processing'
            RETURNING id
            "#,
        )
        .bind(&id)
        .bind(queue)
        .bind(key)
        .bind(&data)
        .bind(&opts.metadata)
        .bind(opts.priority)
        .bind(scheduled_for)
        .bind(opts.max_attempts)
        .bind(&stages)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match upserted {
            Some(id) => Ok(id),
            None if opts.replace == ReplacePolicy::Always => Err(QueueError::ReplaceActive {
                key: key.to_string(),
            }),
            None => self.existing_id(queue, key).await,
        }
    }

    async fn get_job(&self, id_or_key: &str) -> Result<Option<Job>> {
        if let Some(job) = self.find_by_id(id_or_key).await? {
            return Ok(Some(job));
        }
        self.find_by_key(id_or_key).await
    }

    async fn retry(&self, id_or_key: &str) -> Result<bool> {
        let Some(job) = self.get_job(id_or_key).await? else {
            return Ok(false);
        };
        let now = self.now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = 0,
                scheduled_for = ?,
                locked_by = NULL,
                locked_at = NULL,
                expires_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                last_error = 'cancelled',
                locked_by = NULL,
                locked_at = NULL,
                expires_at = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(self.now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let now = self.now();
        let (pending, processing, completed, failed, delayed) =
            sqlx::query_as::<_, (i64, i64, i64, i64, i64)>(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'pending' AND scheduled_for <= ?),
                    COUNT(*) FILTER (WHERE status = 'processing'),
                    COUNT(*) FILTER (WHERE status = 'completed'),
                    COUNT(*) FILTER (WHERE status = 'failed'),
                    COUNT(*) FILTER (WHERE status = 'pending' AND scheduled_for > ?)
                FROM jobs
                WHERE queue = ?
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(QueueStats {
            pending,
            processing,
            completed,
            failed,
            delayed,
        })
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        limit: i64,
        lease_ms: i64,
    ) -> Result<Vec<Job>> {
        let now = self.now();
        let expires_at = now + chrono::Duration::milliseconds(lease_ms);
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                locked_by = ?,
                locked_at = ?,
                expires_at = ?,
                attempts = attempts + 1,
                updated_at = ?
            WHERE id IN (
                SELECT id
                FROM jobs
                WHERE queue = ?
                  AND (
                    (status = 'pending' AND scheduled_for <= ?)
                    OR (status = 'processing' AND expires_at < ?)
                  )
                ORDER BY priority ASC, scheduled_for ASC, created_at ASC
                LIMIT ?
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .bind(queue)
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn renew_lease(&self, id: &str, worker_id: &str, lease_ms: i64) -> Result<bool> {
        let now = self.now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET expires_at = ?, updated_at = ?
            WHERE id = ? AND locked_by = ? AND status = 'processing'
            "#,
        )
        .bind(now + chrono::Duration::milliseconds(lease_ms))
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete(&self, id: &str, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                locked_by = NULL,
                locked_at = NULL,
                expires_at = NULL,
                overall_progress = 100,
                updated_at = ?
            WHERE id = ? AND locked_by = ? AND status = 'processing'
            "#,
        )
        .bind(self.now())
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        requeue_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let now = self.now();
        let result = match requeue_at {
            Some(requeue_at) => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'pending',
                        scheduled_for = ?,
                        locked_by = NULL,
                        locked_at = NULL,
                        expires_at = NULL,
                        last_error = ?,
                        updated_at = ?
                    WHERE id = ? AND locked_by = ? AND status = 'processing'
                    "#,
                )
                .bind(requeue_at)
                .bind(error)
                .bind(now)
                .bind(id)
                .bind(worker_id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'failed',
                        locked_by = NULL,
                        locked_at = NULL,
                        expires_at = NULL,
                        last_error = ?,
                        updated_at = ?
                    WHERE id = ? AND locked_by = ? AND status = 'processing'
                    "#,
                )
                .bind(error)
                .bind(now)
                .bind(id)
                .bind(worker_id)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn update_stages(
        &self,
        id: &str,
        worker_id: &str,
        stages: &[Stage],
        overall_progress: i32,
    ) -> Result<bool> {
        let stages = stages_to_value(stages)?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET stages = ?, overall_progress = ?, updated_at = ?
            WHERE id = ? AND locked_by = ? AND status = 'processing'
            "#,
        )
        .bind(&stages)
        .bind(overall_progress)
        .bind(self.now())
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_schedule(
        &self,
        spec: ScheduleSpec,
        next_run_at: DateTime<Utc>,
    ) -> Result<Schedule> {
        let now = self.now();
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            INSERT INTO schedules (key, queue, cron, data, enabled, next_run_at,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                queue = excluded.queue,
                cron = excluded.cron,
                data = excluded.data,
                enabled = excluded.enabled,
                next_run_at = excluded.next_run_at,
                updated_at = excluded.updated_at
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(&spec.key)
        .bind(&spec.queue)
        .bind(&spec.cron)
        .bind(&spec.data)
        .bind(spec.enabled)
        .bind(next_run_at)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_schedule())
    }

    async fn get_schedule(&self, key: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE key = ?"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ScheduleRow::into_schedule))
    }

    async fn set_schedule_enabled(&self, key: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE schedules SET enabled = ?, updated_at = ? WHERE key = ?",
        )
        .bind(enabled)
        .bind(self.now())
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM schedules
            WHERE enabled = 1 AND next_run_at <= ?
            ORDER BY next_run_at ASC
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ScheduleRow::into_schedule).collect())
    }

    async fn mark_schedule_run(
        &self,
        key: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE schedules
            SET last_run_at = ?, next_run_at = ?, updated_at = ?
            WHERE key = ?
            "#,
        )
        .bind(last_run_at)
        .bind(next_run_at)
        .bind(self.now())
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
