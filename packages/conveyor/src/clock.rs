//! Time source and ID generation.
//!
//! Drivers and loops never call `Utc::now()` directly where the result is
//! persisted or compared against persisted values; they go through [`Clock`]
//! so tests can pin time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Injectable time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared handle to the default clock.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// New job ID. UUIDv7 so IDs sort by creation time, which keeps
/// equal-priority ordering FIFO in backends that order lexicographically.
pub fn job_id() -> String {
    Uuid::now_v7().to_string()
}

/// Stable per-process worker identity.
pub fn worker_id() -> String {
    format!("worker-{}", Uuid::new_v4())
}
