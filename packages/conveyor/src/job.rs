//! Job, stage, and schedule models.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Completed and failed jobs only move again via explicit retry or
    /// keyed re-enqueue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Deduplication behavior when enqueueing with a key that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacePolicy {
    /// Keep the existing job untouched and return its id.
    Never,
    /// Replace the existing job in place unless it is currently processing;
    /// a processing job is left alone and its id returned.
    #[default]
    IfNotActive,
    /// As `IfNotActive`, but a currently-processing job is an error
    /// rather than a silent no-op.
    Always,
}

// ============================================================================
// Stages
// ============================================================================

/// A named sub-step of a job, tracked for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub status: StageStatus,
    #[serde(default)]
    pub progress: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            progress: 0,
            started_at: None,
            completed_at: None,
            artifacts: None,
            error: None,
        }
    }
}

/// Arithmetic mean of stage progress, rounded. Zero when no stages exist.
/// Stored on the job row so callers can read progress without deserializing
/// the stage list.
pub fn overall_progress(stages: &[Stage]) -> i32 {
    if stages.is_empty() {
        return 0;
    }
    let sum: i64 = stages.iter().map(|s| s.progress as i64).sum();
    (sum as f64 / stages.len() as f64).round() as i32
}

// ============================================================================
// Job
// ============================================================================

/// A persistent unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Driver-assigned, stable across state transitions.
    pub id: String,
    pub queue: String,
    /// Optional user-supplied deduplication key, unique per queue.
    pub key: Option<String>,
    pub data: Value,
    /// Opaque tagging propagated unchanged to event callbacks.
    pub metadata: Option<Value>,
    /// Lower numbers run first. Default 0.
    pub priority: i32,
    /// The job is ineligible for claiming before this instant.
    pub scheduled_for: DateTime<Utc>,
    /// Attempts begun so far; incremented on claim.
    pub attempts: i32,
    pub max_attempts: i32,
    pub status: JobStatus,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stages: Vec<Stage>,
    pub overall_progress: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Enqueue options
// ============================================================================

/// Options accepted by `enqueue`.
#[derive(Debug, Clone, TypedBuilder)]
pub struct EnqueueOptions {
    /// Deduplication key, unique within the queue.
    #[builder(default, setter(strip_option, into))]
    pub key: Option<String>,

    /// Lower numbers run first.
    #[builder(default = 0)]
    pub priority: i32,

    /// Run no earlier than now + delay. Ignored when `run_at` is set.
    #[builder(default, setter(strip_option))]
    pub delay: Option<Duration>,

    /// Absolute earliest run time. Takes precedence over `delay`.
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,

    /// Maximum attempts before the job fails for good.
    #[builder(default = 1)]
    pub max_attempts: i32,

    #[builder(default, setter(strip_option))]
    pub metadata: Option<Value>,

    /// Names of stages to pre-create in `pending` state.
    #[builder(default)]
    pub initial_stages: Vec<String>,

    #[builder(default)]
    pub replace: ReplacePolicy,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EnqueueOptions {
    /// Resolve the effective `scheduled_for` against the given now.
    pub fn scheduled_for(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(run_at) = self.run_at {
            return run_at;
        }
        match self.delay {
            Some(delay) => {
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
            }
            None => now,
        }
    }

    /// Materialize the initial stage list, if any.
    pub fn stages(&self) -> Option<Vec<Stage>> {
        if self.initial_stages.is_empty() {
            return None;
        }
        Some(self.initial_stages.iter().map(Stage::new).collect())
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Advisory per-queue counts. `pending` counts only jobs that are ready now;
/// jobs waiting on a future `scheduled_for` show up under `delayed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
}

// ============================================================================
// Schedules
// ============================================================================

/// A cron-driven job factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
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

/// User-facing schedule definition; the stored record adds run bookkeeping.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ScheduleSpec {
    #[builder(setter(into))]
    pub key: String,
    #[builder(setter(into))]
    pub queue: String,
    #[builder(setter(into))]
    pub cron: String,
    #[builder(default = Value::Null)]
    pub data: Value,
    #[builder(default = true)]
    pub enabled: bool,
}
