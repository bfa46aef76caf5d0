//! Durable job queue with interchangeable backends.
//!
//! One [`Driver`] interface, two families of backends with identical
//! semantics: a relational backend (PostgreSQL and SQLite over the same row
//! layout) and a Redis backend speaking the BullMQ key layout. On top of the
//! driver sit a [`Client`] for producers, a [`Worker`] that claims jobs
//! under a heartbeat-renewed lease, and a [`Scheduler`] that turns cron
//! schedules into jobs.
//!
//! # Architecture
//!
//! ```text
//! Client.enqueue(queue, data, opts)
//!     │
//!     └─► Driver persists a pending job (keyed dedup, delay, priority)
//!
//! Worker (one per queue)
//!     │
//!     ├─► claim due jobs, status -> processing + lease
//!     ├─► handler runs with a JobContext
//!     │       ├─► heartbeat keeps the lease alive
//!     │       ├─► stages persist + fire event callbacks
//!     │       └─► cooperative cancellation via the context token
//!     └─► commit completed / failed / retry-with-backoff,
//!         guarded by the lease owner
//!
//! Scheduler
//!     │
//!     └─► due schedules -> keyed enqueue (idempotent across instances)
//! ```
//!
//! Delivery is at-least-once: a crashed worker's lease expires and the job
//! is claimed again, so handlers must tolerate re-execution.

pub mod client;
pub mod clock;
pub mod context;
pub mod driver;
pub mod error;
pub mod events;
pub mod job;
pub mod redis;
pub mod scheduler;
pub mod sql;
pub mod worker;

pub use self::client::Client;
pub use self::clock::{Clock, SystemClock};
pub use self::context::JobContext;
pub use self::driver::Driver;
pub use self::error::{JobError, QueueError, Result};
pub use self::events::{EventCallbacks, JobEvent, StageEvent};
pub use self::job::{
    overall_progress, EnqueueOptions, Job, JobStatus, QueueStats, ReplacePolicy, Schedule,
    ScheduleSpec, Stage, StageStatus,
};
pub use self::redis::{RedisConfig, RedisDriver};
pub use self::scheduler::{CatchupPolicy, CronExpr, Scheduler, SchedulerConfig};
pub use self::sql::postgres::PostgresDriver;
pub use self::sql::sqlite::SqliteDriver;
pub use self::worker::{BackoffPolicy, JobHandler, Worker, WorkerConfig};
