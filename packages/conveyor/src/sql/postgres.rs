//! PostgreSQL-backed driver.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` inside a CTE so concurrent workers
//! never hand out the same row twice. All commits are conditional on the
//! caller still holding the lease.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::{stages_to_value, JobRow, ScheduleRow, JOB_COLUMNS, SCHEDULE_COLUMNS};
use crate::clock::job_id;
use crate::driver::Driver;
use crate::error::{QueueError, Result};
use crate::job::{EnqueueOptions, Job, QueueStats, ReplacePolicy, Schedule, ScheduleSpec, Stage};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        queue TEXT NOT NULL,
        key TEXT,
        data JSONB NOT NULL,
        metadata JSONB,
        priority INTEGER NOT NULL DEFAULT 0,
        scheduled_for TIMESTAMPTZ NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL DEFAULT 'pending',
        locked_by TEXT,
        locked_at TIMESTAMPTZ,
        expires_at TIMESTAMPTZ,
        last_error TEXT,
        stages JSONB,
        overall_progress INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
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
        data JSONB NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        last_run_at TIMESTAMPTZ,
        next_run_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (enabled, next_run_at)",
];

/// PostgreSQL driver.
#[derive(Clone)]
pub struct PostgresDriver {
    pool: PgPool,
}

impl PostgresDriver {
    /// Connect and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, ensuring the schema exists.
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE key = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn existing_id(&self, queue: &str, key: &str) -> Result<String> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT id FROM jobs WHERE queue = $1 AND key = $2",
        )
        .bind(queue)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    async fn enqueue(&self, queue: &str, data: Value, opts: EnqueueOptions) -> Result<String> {
        let id = job_id();
        let scheduled_for = opts.scheduled_for(Utc::now());
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
                VALUES ($1, $2, NULL, $3, $4, $5, $6, 0, $7, 'pending', $8, 0, NOW(), NOW())
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
                VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, 'pending', $9, 0, NOW(), NOW())
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
            .fetch_optional(&self.pool)
            .await?;
            return match inserted {
                Some(id) => Ok(id),
                None => self.existing_id(queue, key).await,
            };
        }

        // IfNotActive and Always both replace in place unless the existing
        // row is mid-execution; they differ only in how that case surfaces.
        let upserted = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO jobs (id, queue, key, data, metadata, priority, scheduled_for,
                              attempts, max_attempts, status, stages, overall_progress,
                              created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, 'pending', $9, 0, NOW(), NOW())
            ON CONFLICT (queue, key) WHERE key IS NOT NULL DO UPDATE SET
                data = EXCLUDED.data,
                metadata = EXCLUDED.metadata,
                priority = EXCLUDED.priority,
                scheduled_for = EXCLUDED.scheduled_for,
                attempts = 0,
                max_attempts = EXCLUDED.max_attempts,
                status = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                expires_at = NULL,
                last_error = NULL,
                stages = EXCLUDED.stages,
                overall_progress = 0,
                updated_at = NOW()
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
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = 0,
                scheduled_for = NOW(),
                locked_by = NULL,
                locked_at = NULL,
                expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            "#,
        )
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
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let (pending, processing, completed, failed, delayed) =
            sqlx::query_as::<_, (i64, i64, i64, i64, i64)>(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'pending' AND scheduled_for <= NOW()),
                    COUNT(*) FILTER (WHERE status = 'processing'),
                    COUNT(*) FILTER (WHERE status = 'completed'),
                    COUNT(*) FILTER (WHERE status = 'failed'),
                    COUNT(*) FILTER (WHERE status = 'pending' AND scheduled_for > NOW())
                FROM jobs
                WHERE queue = $1
                "#,
            )
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
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM jobs
                WHERE queue = $1
                  AND (
                    (status = 'pending' AND scheduled_for <= NOW())
                    OR (status = 'processing' AND expires_at < NOW())
                  )
                ORDER BY priority ASC, scheduled_for ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing',
                locked_by = $3,
                locked_at = NOW(),
                expires_at = NOW() + ($4 || ' milliseconds')::INTERVAL,
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(limit)
        .bind(worker_id)
        .bind(lease_ms.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn renew_lease(&self, id: &str, worker_id: &str, lease_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND locked_by = $3 AND status = 'processing'
            "#,
        )
        .bind(lease_ms.to_string())
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
                updated_at = NOW()
            WHERE id = $1 AND locked_by = $2 AND status = 'processing'
            "#,
        )
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
        let result = match requeue_at {
            Some(requeue_at) => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'pending',
                        scheduled_for = $1,
                        locked_by = NULL,
                        locked_at = NULL,
                        expires_at = NULL,
                        last_error = $2,
                        updated_at = NOW()
                    WHERE id = $3 AND locked_by = $4 AND status = 'processing'
                    "#,
                )
                .bind(requeue_at)
                .bind(error)
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
                        last_error = $1,
                        updated_at = NOW()
                    WHERE id = $2 AND locked_by = $3 AND status = 'processing'
                    "#,
                )
                .bind(error)
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
            SET stages = $1,
                overall_progress = $2,
                updated_at = NOW()
            WHERE id = $3 AND locked_by = $4 AND status = 'processing'
            "#,
        )
        .bind(&stages)
        .bind(overall_progress)
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
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            INSERT INTO schedules (key, queue, cron, data, enabled, next_run_at,
                                   created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (key) DO UPDATE SET
                queue = EXCLUDED.queue,
                cron = EXCLUDED.cron,
                data = EXCLUDED.data,
                enabled = EXCLUDED.enabled,
                next_run_at = EXCLUDED.next_run_at,
                updated_at = NOW()
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(&spec.key)
        .bind(&spec.queue)
        .bind(&spec.cron)
        .bind(&spec.data)
        .bind(spec.enabled)
        .bind(next_run_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_schedule())
    }

    async fn get_schedule(&self, key: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ScheduleRow::into_schedule))
    }

    async fn set_schedule_enabled(&self, key: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE schedules SET enabled = $1, updated_at = NOW() WHERE key = $2",
        )
        .bind(enabled)
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
            WHERE enabled = TRUE AND next_run_at <= $1
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
            SET last_run_at = $1, next_run_at = $2, updated_at = NOW()
            WHERE key = $3
            "#,
        )
        .bind(last_run_at)
        .bind(next_run_at)
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
