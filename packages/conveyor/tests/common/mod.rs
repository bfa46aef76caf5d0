//! Common test utilities.

#![allow(dead_code)]

pub mod contract;

use std::future::Future;
use std::time::{Duration, Instant};

use conveyor::{Driver, Job, JobStatus, SqliteDriver};
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

/// Initialize tracing for tests; respects RUST_LOG.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fresh in-memory SQLite driver. A single connection keeps every query on
/// the same in-memory database.
pub async fn sqlite_driver() -> SqliteDriver {
    init_tracing();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory sqlite");
    SqliteDriver::from_pool(pool)
        .await
        .expect("failed to initialize sqlite schema")
}

/// Unique queue name so tests sharing one backend never interfere.
pub fn unique_queue(label: &str) -> String {
    format!("{label}-{}", Uuid::new_v4())
}

/// Poll until the condition holds or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Wait for a job to reach the given status, returning its final record.
pub async fn wait_for_status(
    driver: &dyn Driver,
    id: &str,
    status: JobStatus,
    timeout: Duration,
) -> Job {
    let reached = wait_until(timeout, move || async move {
        matches!(
            driver.get_job(id).await.expect("get_job failed"),
            Some(job) if job.status == status
        )
    })
    .await;
    assert!(reached, "job {id} never reached {status:?}");
    driver
        .get_job(id)
        .await
        .expect("get_job failed")
        .expect("job disappeared")
}
