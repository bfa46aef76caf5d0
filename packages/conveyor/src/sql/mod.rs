//! Relational backends.
//!
//! Both engines share one row layout (identical column names, defaults, and
//! nullability) and one mapping back to the domain types; only the claim
//! statement and the time source differ:
//! - PostgreSQL claims via `FOR UPDATE SKIP LOCKED` inside a CTE and uses
//!   the database clock (`NOW()`).
//! - SQLite claims via a single `UPDATE ... WHERE id IN (SELECT ...)
//!   RETURNING` statement (one statement, one writer, atomic) and binds the
//!   process clock, which is injectable for tests.

pub mod postgres;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

use crate::error::{QueueError, Result};
use crate::job::{Job, JobStatus, Schedule, Stage};

/// Column list shared by every job query, in table order.
pub(crate) const JOB_COLUMNS: &str = "id, queue, key, data, metadata, priority, scheduled_for, \
     attempts, max_attempts, status, locked_by, locked_at, expires_at, \
     last_error, stages, overall_progress, created_at, updated_at";

pub(crate) const SCHEDULE_COLUMNS: &str =
    "key, queue, cron, data, enabled, last_run_at, next_run_at, created_at, updated_at";

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub queue: String,
    pub key: Option<String>,
    pub data: Value,
    pub metadata: Option<Value>,
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub status: String,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stages: Option<Value>,
    pub overall_progress: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub(crate) fn into_job(self) -> Result<Job> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| QueueError::Decode(format!("unknown job status {:?}", self.status)))?;
        let stages: Vec<Stage> = match self.stages {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        Ok(Job {
            id: self.id,
            queue: self.queue,
            key: self.key,
            data: self.data,
            metadata: self.metadata,
            priority: self.priority,
            scheduled_for: self.scheduled_for,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            status,
            locked_by: self.locked_by,
            locked_at: self.locked_at,
            expires_at: self.expires_at,
            last_error: self.last_error,
            stages,
            overall_progress: self.overall_progress,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ScheduleRow {
    pub key: String,
    pub queue: String,
    pub cron: String,
    pub data: Value,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRow {
    pub(crate) fn into_schedule(self) -> Schedule {
        Schedule {
            key: self.key,
            queue: self.queue,
            cron: self.cron,
            data: self.data,
            enabled: self.enabled,
            last_run_at: self.last_run_at,
            next_run_at: self.next_run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Serialize a stage list for storage. Empty lists store as NULL so a job
/// without stages stays distinguishable from one with an emptied list.
pub(crate) fn stages_to_value(stages: &[Stage]) -> Result<Option<Value>> {
    if stages.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_value(stages)?))
}
