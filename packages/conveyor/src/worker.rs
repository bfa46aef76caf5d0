//! Job worker: poll, claim, execute, commit.
//!
//! A worker binds to one queue and runs a single poll loop plus up to
//! `concurrency` handler tasks:
//!
//! ```text
//! Worker
//!     │
//!     ├─► claim up to free slots (driver.claim)
//!     ├─► spawn handler task per job
//!     │       ├─► heartbeat ticker renews the lease
//!     │       ├─► handler runs with a JobContext
//!     │       └─► commit completed / failed / requeued-with-backoff,
//!     │           conditional on still owning the lease
//!     └─► sleep poll_interval, or wake when a slot frees up
//! ```
//!
//! Lease loss cancels the handler's context but never writes job state from
//! the heartbeat path; the commit's ownership guard decides what sticks.
//! `stop()` cancels polling immediately, signals in-flight handlers, and
//! waits for them to return.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::worker_id;
use crate::context::JobContext;
use crate::driver::Driver;
use crate::error::{JobError, QueueError, Result};
use crate::events::{EventCallbacks, JobEvent};
use crate::job::Job;

/// Exponential backoff with jitter for retries.
///
/// The delay before attempt `n + 1` is `base * 2^(n-1)` capped at `max`,
/// scaled by a uniform factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(3600),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay to apply after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let exponent = (attempt.max(1) - 1).min(31) as u32;
        let base_ms = self.base.as_millis() as u128;
        let max_ms = self.max.as_millis() as u128;
        let raw_ms = base_ms.saturating_mul(1u128 << exponent).min(max_ms);
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_millis((raw_ms as f64 * factor).max(0.0) as u64)
    }
}

/// Worker configuration.
///
/// `heartbeat_interval` must stay below half of `lock_duration` so a lease
/// survives a missed beat. The Redis backend's stall limit is configured on
/// [`crate::RedisConfig`], where the reaper lives.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of handler slots. Default 1.
    pub concurrency: usize,
    /// How long to sleep when there is nothing to claim.
    pub poll_interval: Duration,
    /// Lease duration for claimed jobs.
    pub lock_duration: Duration,
    /// Cadence of automatic lease renewal.
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
    pub callbacks: EventCallbacks,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
            lock_duration: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            backoff: BackoffPolicy::default(),
            callbacks: EventCallbacks::default(),
        }
    }
}

impl WorkerConfig {
    fn validate(&self) -> Result<()> {
        if self.concurrency < 1 {
            return Err(QueueError::Config("concurrency must be at least 1".into()));
        }
        if self.heartbeat_interval >= self.lock_duration / 2 {
            return Err(QueueError::Config(
                "heartbeat_interval must be less than half of lock_duration".into(),
            ));
        }
        Ok(())
    }
}

/// Implemented by the application; runs one job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> std::result::Result<(), JobError>;
}

struct WorkerInner {
    driver: Arc<dyn Driver>,
    queue: String,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    worker_id: String,
    callbacks: Arc<EventCallbacks>,
    shutdown: CancellationToken,
    /// Cancellation tokens of currently-executing jobs, for local cancel
    /// injection and shutdown signalling.
    running: RwLock<HashMap<String, CancellationToken>>,
    inflight: AtomicUsize,
    slot_freed: Notify,
    started: AtomicBool,
}

/// A worker bound to one queue.
pub struct Worker {
    inner: Arc<WorkerInner>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        driver: Arc<dyn Driver>,
        queue: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let callbacks = Arc::new(config.callbacks.clone());
        Ok(Self {
            inner: Arc::new(WorkerInner {
                driver,
                queue: queue.into(),
                handler,
                config,
                worker_id: worker_id(),
                callbacks,
                shutdown: CancellationToken::new(),
                running: RwLock::new(HashMap::new()),
                inflight: AtomicUsize::new(0),
                slot_freed: Notify::new(),
                started: AtomicBool::new(false),
            }),
            join: Mutex::new(None),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Start the poll loop. Idempotent.
    pub async fn start(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run_loop().await });
        *self.join.lock().await = Some(handle);
    }

    /// Stop polling, signal in-flight handlers, and wait for them to
    /// return. Idempotent.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.join.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.started.store(false, Ordering::SeqCst);
    }

    /// Inject cancellation into a job currently executing on this worker.
    /// Returns `false` when the job is not running here.
    pub async fn cancel_local(&self, job_id: &str) -> bool {
        match self.inner.running.read().await.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl WorkerInner {
    fn lease_ms(&self) -> i64 {
        self.config.lock_duration.as_millis() as i64
    }

    async fn run_loop(self: Arc<Self>) {
        info!(
            worker_id = %self.worker_id,
            queue = %self.queue,
            concurrency = self.config.concurrency,
            "worker starting"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let free = self
                .config
                .concurrency
                .saturating_sub(self.inflight.load(Ordering::SeqCst));
            if free == 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.slot_freed.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            let jobs = match self
                .driver
                .claim(&self.queue, &self.worker_id, free as i64, self.lease_ms())
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "failed to claim jobs");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.slot_freed.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            // claim batches do not guarantee row order; restore it so a
            // single-slot worker runs strictly by priority and schedule
            let mut jobs = jobs;
            jobs.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.scheduled_for.cmp(&b.scheduled_for))
                    .then(a.created_at.cmp(&b.created_at))
            });
            debug!(count = jobs.len(), queue = %self.queue, "claimed jobs");

            for job in jobs {
                self.inflight.fetch_add(1, Ordering::SeqCst);
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.process_job(job).await;
                    inner.inflight.fetch_sub(1, Ordering::SeqCst);
                    inner.slot_freed.notify_one();
                });
            }
        }

        let remaining = self.inflight.load(Ordering::SeqCst);
        if remaining > 0 {
            info!(count = remaining, "waiting for in-flight jobs to finish");
            while self.inflight.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        info!(worker_id = %self.worker_id, queue = %self.queue, "worker stopped");
    }

    async fn process_job(&self, job: Job) {
        let job_id = job.id.clone();
        let job_cancel = self.shutdown.child_token();
        self.running
            .write()
            .await
            .insert(job_id.clone(), job_cancel.clone());

        let ctx = JobContext::new(
            &job,
            &self.worker_id,
            self.lease_ms(),
            self.driver.clone(),
            job_cancel.clone(),
            self.callbacks.clone(),
        );

        let heartbeat = self.spawn_heartbeat(&job_id, job_cancel.clone());

        let result = AssertUnwindSafe(self.handler.run(ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(job_id = %job_id, "handler panicked");
                Err(JobError::retryable("handler panicked"))
            });

        job_cancel.cancel();
        let _ = heartbeat.await;

        self.commit(&job, result).await;
        self.running.write().await.remove(&job_id);
    }

    fn spawn_heartbeat(&self, job_id: &str, cancel: CancellationToken) -> JoinHandle<()> {
        let driver = self.driver.clone();
        let job_id = job_id.to_string();
        let worker_id = self.worker_id.clone();
        let lease_ms = self.lease_ms();
        let heartbeat_interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // skip the immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match driver.renew_lease(&job_id, &worker_id, lease_ms).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(job_id = %job_id, "lease lost, cancelling handler");
                                cancel.cancel();
                                break;
                            }
                            // transient driver errors do not void the lease;
                            // if they persist the lease expires on its own
                            Err(e) => warn!(job_id = %job_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        })
    }

    async fn commit(&self, job: &Job, result: std::result::Result<(), JobError>) {
        match result {
            Ok(()) => match self.driver.complete(&job.id, &self.worker_id).await {
                Ok(true) => {
                    debug!(job_id = %job.id, "job completed");
                    self.callbacks.job_complete(&JobEvent {
                        job_id: job.id.clone(),
                        queue: job.queue.clone(),
                        error: None,
                        metadata: job.metadata.clone(),
                    });
                }
                Ok(false) => warn!(job_id = %job.id, "completion rejected, ownership lost"),
                Err(e) => error!(job_id = %job.id, error = %e, "failed to commit completion"),
            },
            Err(err) => {
                let message = err.to_string();
                if err.should_retry() && job.attempts < job.max_attempts {
                    let delay = self.config.backoff.delay_for_attempt(job.attempts);
                    let requeue_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    match self
                        .driver
                        .fail(&job.id, &self.worker_id, &message, Some(requeue_at))
                        .await
                    {
                        Ok(true) => debug!(
                            job_id = %job.id,
                            attempt = job.attempts,
                            delay_ms = delay.as_millis() as u64,
                            "job requeued with backoff"
                        ),
                        Ok(false) => warn!(job_id = %job.id, "requeue rejected, ownership lost"),
                        Err(e) => error!(job_id = %job.id, error = %e, "failed to commit retry"),
                    }
                } else {
                    match self.driver.fail(&job.id, &self.worker_id, &message, None).await {
                        Ok(true) => {
                            warn!(job_id = %job.id, error = %message, "job failed");
                            self.callbacks.job_fail(&JobEvent {
                                job_id: job.id.clone(),
                                queue: job.queue.clone(),
                                error: Some(message),
                                metadata: job.metadata.clone(),
                            });
                        }
                        Ok(false) => warn!(job_id = %job.id, "failure commit rejected, ownership lost"),
                        Err(e) => error!(job_id = %job.id, error = %e, "failed to commit failure"),
                    }
                }
            }
        }
    }
}
