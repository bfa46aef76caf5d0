//! Handler-facing job context.
//!
//! A [`JobContext`] is handed to the handler for each claimed job. It
//! mediates everything the handler may do besides its own work: explicit
//! heartbeats, cooperative cancellation checks, and the stage machinery.
//!
//! Stage mutations are serialized through an internal mutex, persisted via
//! the driver under the ownership guard, and only then fanned out to the
//! event callbacks. If a stage write is rejected because the lease was lost,
//! the context cancels itself so the handler can wind down; the commit path
//! handles the job state.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::Driver;
use crate::error::{JobError, QueueError, Result};
use crate::events::{EventCallbacks, StageEvent};
use crate::job::{overall_progress, Job, Stage, StageStatus};

#[derive(Default)]
struct StageState {
    stages: Vec<Stage>,
    /// Index of the stage implicit `progress()` calls apply to.
    current: Option<usize>,
}

/// Per-job context threaded into the handler.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    queue: String,
    data: Value,
    metadata: Option<Value>,
    attempt: i32,
    max_attempts: i32,
    worker_id: String,
    lease_ms: i64,
    driver: Arc<dyn Driver>,
    cancel: CancellationToken,
    callbacks: Arc<EventCallbacks>,
    stages: Arc<Mutex<StageState>>,
}

impl JobContext {
    pub(crate) fn new(
        job: &Job,
        worker_id: &str,
        lease_ms: i64,
        driver: Arc<dyn Driver>,
        cancel: CancellationToken,
        callbacks: Arc<EventCallbacks>,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            data: job.data.clone(),
            metadata: job.metadata.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            worker_id: worker_id.to_string(),
            lease_ms,
            driver,
            cancel,
            callbacks,
            stages: Arc::new(Mutex::new(StageState {
                stages: job.stages.clone(),
                current: None,
            })),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    /// 1-based attempt number of this run.
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// Whether this run should stop: explicit cancel, lease loss, or
    /// worker shutdown. Handlers are expected to check this around I/O and
    /// batch boundaries; nothing forcibly kills them.
    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token for `select!`-style cancellation handling.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bail out with [`JobError::Cancelled`] when cancellation was signalled.
    pub fn check_cancelled(&self) -> std::result::Result<(), JobError> {
        if self.cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Explicitly renew the lease. Safe to omit while the worker's automatic
    /// heartbeat runs. Returns `false` (and cancels the context) when
    /// ownership was lost.
    pub async fn heartbeat(&self) -> Result<bool> {
        let renewed = self
            .driver
            .renew_lease(&self.job_id, &self.worker_id, self.lease_ms)
            .await?;
        if !renewed {
            warn!(job_id = %self.job_id, "lease lost on explicit heartbeat");
            self.cancel.cancel();
        }
        Ok(renewed)
    }

    /// Observational log line attributed to the job.
    pub fn log(&self, message: &str) {
        info!(job_id = %self.job_id, queue = %self.queue, "{message}");
    }

    /// Report progress. Applies to the stage most recently started, if any;
    /// otherwise it is log-only.
    pub async fn progress(&self, percent: i32) -> Result<()> {
        let name = {
            let state = self.stages.lock().await;
            state
                .current
                .and_then(|idx| state.stages.get(idx))
                .map(|stage| stage.name.clone())
        };
        match name {
            Some(name) => self.update_stage_progress(&name, percent).await,
            None => {
                debug!(job_id = %self.job_id, percent, "progress reported without a current stage");
                Ok(())
            }
        }
    }

    /// Create the stage list. Only permitted while the list is empty.
    pub async fn init_stages(&self, names: &[&str]) -> Result<()> {
        let mut state = self.stages.lock().await;
        if !state.stages.is_empty() {
            return Err(QueueError::StagesAlreadyInitialized);
        }
        state.stages = build_stages(&[], names)?;
        self.persist(&state).await
    }

    /// Append stages. Allowed mid-flight; existing stages never reorder.
    pub async fn add_stages(&self, names: &[&str]) -> Result<()> {
        let mut state = self.stages.lock().await;
        let mut added = build_stages(&state.stages, names)?;
        state.stages.append(&mut added);
        self.persist(&state).await
    }

    /// Mark a stage processing and make it the current stage.
    pub async fn start_stage(&self, name: &str) -> Result<()> {
        let mut state = self.stages.lock().await;
        let idx = find_stage(&state.stages, name)?;
        {
            let stage = &mut state.stages[idx];
            stage.status = StageStatus::Processing;
            stage.started_at = Some(Utc::now());
        }
        state.current = Some(idx);
        let stage = state.stages[idx].clone();
        self.persist(&state).await?;
        self.callbacks.stage_start(&self.stage_event(stage));
        Ok(())
    }

    /// Update a stage's progress percentage (clamped to 0..=100).
    pub async fn update_stage_progress(&self, name: &str, percent: i32) -> Result<()> {
        let mut state = self.stages.lock().await;
        let idx = find_stage(&state.stages, name)?;
        state.stages[idx].progress = percent.clamp(0, 100);
        let stage = state.stages[idx].clone();
        self.persist(&state).await?;
        self.callbacks.stage_progress(&self.stage_event(stage));
        Ok(())
    }

    /// Mark a stage completed at 100%, optionally attaching artifacts.
    pub async fn complete_stage(&self, name: &str, artifacts: Option<Value>) -> Result<()> {
        let mut state = self.stages.lock().await;
        let idx = find_stage(&state.stages, name)?;
        {
            let stage = &mut state.stages[idx];
            stage.status = StageStatus::Completed;
            stage.progress = 100;
            stage.completed_at = Some(Utc::now());
            if artifacts.is_some() {
                stage.artifacts = artifacts;
            }
        }
        if state.current == Some(idx) {
            state.current = None;
        }
        let stage = state.stages[idx].clone();
        self.persist(&state).await?;
        self.callbacks.stage_complete(&self.stage_event(stage));
        Ok(())
    }

    /// Mark a stage failed with an error message.
    pub async fn fail_stage(&self, name: &str, error: &str) -> Result<()> {
        let mut state = self.stages.lock().await;
        let idx = find_stage(&state.stages, name)?;
        {
            let stage = &mut state.stages[idx];
            stage.status = StageStatus::Failed;
            stage.error = Some(error.to_string());
            stage.completed_at = Some(Utc::now());
        }
        if state.current == Some(idx) {
            state.current = None;
        }
        let stage = state.stages[idx].clone();
        self.persist(&state).await?;
        self.callbacks.stage_fail(&self.stage_event(stage));
        Ok(())
    }

    /// Snapshot of the stage list as last mutated by this context.
    pub async fn stages(&self) -> Vec<Stage> {
        self.stages.lock().await.stages.clone()
    }

    async fn persist(&self, state: &StageState) -> Result<()> {
        let overall = overall_progress(&state.stages);
        let committed = self
            .driver
            .update_stages(&self.job_id, &self.worker_id, &state.stages, overall)
            .await?;
        if !committed {
            warn!(job_id = %self.job_id, "stage update rejected, ownership lost");
            self.cancel.cancel();
        }
        Ok(())
    }

    fn stage_event(&self, stage: Stage) -> StageEvent {
        StageEvent {
            job_id: self.job_id.clone(),
            queue: self.queue.clone(),
            stage,
            metadata: self.metadata.clone(),
        }
    }
}

fn find_stage(stages: &[Stage], name: &str) -> Result<usize> {
    stages
        .iter()
        .position(|stage| stage.name == name)
        .ok_or_else(|| QueueError::UnknownStage(name.to_string()))
}

fn build_stages(existing: &[Stage], names: &[&str]) -> Result<Vec<Stage>> {
    let mut stages = Vec::with_capacity(names.len());
    for name in names {
        let duplicate = existing.iter().any(|stage| stage.name == *name)
            || stages.iter().any(|stage: &Stage| stage.name == *name);
        if duplicate {
            return Err(QueueError::DuplicateStage(name.to_string()));
        }
        stages.push(Stage::new(*name));
    }
    Ok(stages)
}
