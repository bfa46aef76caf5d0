//! Event callbacks for job and stage lifecycle transitions.
//!
//! Callbacks are a record of optional function values, not a trait object
//! hierarchy. They run synchronously on the worker task that performed the
//! transition, after the state change has been persisted. A panicking
//! callback is caught and logged; it never rolls back the transition or
//! takes down the worker.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::error;

use crate::job::Stage;

/// Payload for stage-level callbacks.
#[derive(Debug, Clone)]
pub struct StageEvent {
    pub job_id: String,
    pub queue: String,
    pub stage: Stage,
    /// The job's metadata, passed through unchanged.
    pub metadata: Option<Value>,
}

/// Payload for job-level callbacks.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: String,
    pub queue: String,
    /// Set for `on_job_fail`, `None` on completion.
    pub error: Option<String>,
    pub metadata: Option<Value>,
}

pub type StageHook = Arc<dyn Fn(&StageEvent) + Send + Sync>;
pub type JobHook = Arc<dyn Fn(&JobEvent) + Send + Sync>;

/// Optional per-transition hooks.
#[derive(Clone, Default)]
pub struct EventCallbacks {
    pub on_stage_start: Option<StageHook>,
    pub on_stage_progress: Option<StageHook>,
    pub on_stage_complete: Option<StageHook>,
    pub on_stage_fail: Option<StageHook>,
    pub on_job_complete: Option<JobHook>,
    pub on_job_fail: Option<JobHook>,
}

impl std::fmt::Debug for EventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCallbacks")
            .field("on_stage_start", &self.on_stage_start.is_some())
            .field("on_stage_progress", &self.on_stage_progress.is_some())
            .field("on_stage_complete", &self.on_stage_complete.is_some())
            .field("on_stage_fail", &self.on_stage_fail.is_some())
            .field("on_job_complete", &self.on_job_complete.is_some())
            .field("on_job_fail", &self.on_job_fail.is_some())
            .finish()
    }
}

impl EventCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stage_start(&self, event: &StageEvent) {
        if let Some(hook) = &self.on_stage_start {
            guarded("on_stage_start", || hook(event));
        }
    }

    pub(crate) fn stage_progress(&self, event: &StageEvent) {
        if let Some(hook) = &self.on_stage_progress {
            guarded("on_stage_progress", || hook(event));
        }
    }

    pub(crate) fn stage_complete(&self, event: &StageEvent) {
        if let Some(hook) = &self.on_stage_complete {
            guarded("on_stage_complete", || hook(event));
        }
    }

    pub(crate) fn stage_fail(&self, event: &StageEvent) {
        if let Some(hook) = &self.on_stage_fail {
            guarded("on_stage_fail", || hook(event));
        }
    }

    pub(crate) fn job_complete(&self, event: &JobEvent) {
        if let Some(hook) = &self.on_job_complete {
            guarded("on_job_complete", || hook(event));
        }
    }

    pub(crate) fn job_fail(&self, event: &JobEvent) {
        if let Some(hook) = &self.on_job_fail {
            guarded("on_job_fail", || hook(event));
        }
    }
}

/// Run a callback, containing panics.
fn guarded(name: &'static str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(callback = name, "event callback panicked");
    }
}
