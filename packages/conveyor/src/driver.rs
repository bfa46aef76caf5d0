//! The storage/coordination interface implemented by every backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::job::{EnqueueOptions, Job, QueueStats, Schedule, ScheduleSpec, Stage};

/// Backend-specific implementation of job storage and coordination.
///
/// The client and worker only ever talk to this trait; the relational
/// (PostgreSQL/SQLite) and Redis drivers implement identical semantics
/// behind it.
///
/// Methods returning `bool` report whether a state change occurred.
/// `false` means an ownership or state mismatch (for example a commit with
/// a stale lease) - callers log it and move on, they do not treat it as an
/// error or retry the write.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Persist a new pending job, or resolve against an existing one when a
    /// deduplication key matches (see [`crate::ReplacePolicy`]). Returns the
    /// id of the inserted or existing job.
    async fn enqueue(&self, queue: &str, data: Value, opts: EnqueueOptions) -> Result<String>;

    /// Look up by id first, then by deduplication key.
    async fn get_job(&self, id_or_key: &str) -> Result<Option<Job>>;

    /// Re-target a failed job: attempts back to 0, status to pending,
    /// eligible immediately. `false` unless the job exists and is failed.
    async fn retry(&self, id_or_key: &str) -> Result<bool>;

    /// Move a pending or processing job to failed with `last_error =
    /// "cancelled"`. No-op (`false`) on terminal or missing jobs.
    async fn cancel(&self, id: &str) -> Result<bool>;

    /// Snapshot counts for a queue. Advisory, not transactional.
    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Atomically claim up to `limit` eligible jobs for `worker_id`,
    /// moving them to processing with a lease of `lease_ms`. Eligible means
    /// pending and due, or processing with an expired lease (crash
    /// recovery). No job is ever handed to two workers.
    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        limit: i64,
        lease_ms: i64,
    ) -> Result<Vec<Job>>;

    /// Extend the lease. `false` means ownership was lost and the caller
    /// must stop working on the job.
    async fn renew_lease(&self, id: &str, worker_id: &str, lease_ms: i64) -> Result<bool>;

    /// Commit success. Conditional on the caller still owning the job.
    async fn complete(&self, id: &str, worker_id: &str) -> Result<bool>;

    /// Commit failure. With `requeue_at` the job returns to pending for a
    /// retry at that time; without it the job fails terminally. Conditional
    /// on ownership.
    async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        requeue_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Persist the stage list and derived overall progress. Conditional on
    /// ownership.
    async fn update_stages(
        &self,
        id: &str,
        worker_id: &str,
        stages: &[Stage],
        overall_progress: i32,
    ) -> Result<bool>;

    /// Create or update a schedule. `next_run_at` is computed by the caller
    /// from the cron expression.
    async fn upsert_schedule(
        &self,
        spec: ScheduleSpec,
        next_run_at: DateTime<Utc>,
    ) -> Result<Schedule>;

    async fn get_schedule(&self, key: &str) -> Result<Option<Schedule>>;

    /// Schedules are never deleted; they are disabled.
    async fn set_schedule_enabled(&self, key: &str, enabled: bool) -> Result<bool>;

    /// Enabled schedules whose `next_run_at` has matured.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;

    /// Record a fired run and the next boundary.
    async fn mark_schedule_run(
        &self,
        key: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Release backend resources. Idempotent.
    async fn close(&self) -> Result<()>;
}
