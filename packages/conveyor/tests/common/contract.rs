//! Driver contract suite.
//!
//! Every backend must pass these assertions unchanged; the per-backend test
//! files run them against SQLite, PostgreSQL, and Redis. Queue names are
//! randomized so suites can share one backend instance.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use conveyor::{
    Driver, EnqueueOptions, JobStatus, QueueError, ReplacePolicy, ScheduleSpec, Stage, StageStatus,
};
use serde_json::json;

use super::unique_queue;

/// Keyed enqueue is idempotent: the same key resolves to one job.
pub async fn enqueue_dedup(driver: Arc<dyn Driver>) {
    let queue = unique_queue("dedup");

    let first = driver
        .enqueue(
            &queue,
            json!({"v": 1}),
            EnqueueOptions::builder().key("k1").build(),
        )
        .await
        .expect("first enqueue failed");
    let second = driver
        .enqueue(
            &queue,
            json!({"v": 2}),
            EnqueueOptions::builder().key("k1").build(),
        )
        .await
        .expect("second enqueue failed");
    assert_eq!(first, second, "same key must resolve to one job");

    // the default policy replaced the pending job in place
    let job = driver.get_job(&first).await.unwrap().expect("job missing");
    assert_eq!(job.data["v"], 2);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);

    // replace: never keeps the existing payload
    let third = driver
        .enqueue(
            &queue,
            json!({"v": 3}),
            EnqueueOptions::builder()
                .key("k1")
                .replace(ReplacePolicy::Never)
                .build(),
        )
        .await
        .expect("never-policy enqueue failed");
    assert_eq!(third, first);
    let job = driver.get_job(&first).await.unwrap().expect("job missing");
    assert_eq!(job.data["v"], 2);

    // lookup by key resolves the same record
    let by_key = driver.get_job("k1").await.unwrap().expect("key lookup failed");
    assert_eq!(by_key.id, first);
}

/// Replacing a processing job is refused for `Always` and a no-op for the
/// default policy.
pub async fn replace_processing(driver: Arc<dyn Driver>) {
    let queue = unique_queue("replace");
    let id = driver
        .enqueue(
            &queue,
            json!({"v": 1}),
            EnqueueOptions::builder().key("busy").build(),
        )
        .await
        .unwrap();
    let claimed = driver.claim(&queue, "worker-a", 1, 60_000).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let same = driver
        .enqueue(
            &queue,
            json!({"v": 2}),
            EnqueueOptions::builder().key("busy").build(),
        )
        .await
        .expect("if-not-active against processing must not error");
    assert_eq!(same, id);
    let job = driver.get_job(&id).await.unwrap().expect("job missing");
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.data["v"], 1, "processing job must not be replaced");

    let err = driver
        .enqueue(
            &queue,
            json!({"v": 3}),
            EnqueueOptions::builder()
                .key("busy")
                .replace(ReplacePolicy::Always)
                .build(),
        )
        .await
        .expect_err("always-policy against processing must be refused");
    assert!(matches!(err, QueueError::ReplaceActive { .. }));
}

/// Claims respect priority order and hand out each job exactly once.
pub async fn claim_exclusive_and_ordered(driver: Arc<dyn Driver>) {
    let queue = unique_queue("claim");
    for (priority, order) in [(10, 3), (1, 1), (5, 2)] {
        driver
            .enqueue(
                &queue,
                json!({"o": order}),
                EnqueueOptions::builder().priority(priority).build(),
            )
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let jobs = driver.claim(&queue, "worker-a", 1, 60_000).await.unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.locked_by.as_deref(), Some("worker-a"));
        assert_eq!(job.attempts, 1);
        assert!(job.expires_at.is_some());
        seen.push(job.data["o"].as_i64().unwrap());
    }
    assert_eq!(seen, vec![1, 2, 3]);

    // everything is leased out; another worker gets nothing
    let empty = driver.claim(&queue, "worker-b", 10, 60_000).await.unwrap();
    assert!(empty.is_empty());
}

/// Delayed jobs are invisible until their scheduled time.
pub async fn delayed_jobs_mature(driver: Arc<dyn Driver>) {
    let queue = unique_queue("delay");
    driver
        .enqueue(
            &queue,
            json!({}),
            EnqueueOptions::builder()
                .delay(Duration::from_millis(200))
                .build(),
        )
        .await
        .unwrap();

    let early = driver.claim(&queue, "worker-a", 1, 60_000).await.unwrap();
    assert!(early.is_empty(), "job claimed before its delay elapsed");

    tokio::time::sleep(Duration::from_millis(250)).await;
    let due = driver.claim(&queue, "worker-a", 1, 60_000).await.unwrap();
    assert_eq!(due.len(), 1);
}

/// Lease renewal works while owned and fails once ownership moved; an
/// expired lease makes the job claimable again (crash recovery).
pub async fn lease_lifecycle(driver: Arc<dyn Driver>) {
    let queue = unique_queue("lease");
    let id = driver
        .enqueue(
            &queue,
            json!({}),
            EnqueueOptions::builder().max_attempts(3).build(),
        )
        .await
        .unwrap();

    let claimed = driver.claim(&queue, "worker-a", 1, 100).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(driver.renew_lease(&id, "worker-a", 100).await.unwrap());

    // let the lease lapse, then another worker recovers the job
    tokio::time::sleep(Duration::from_millis(200)).await;
    let recovered = driver.claim(&queue, "worker-b", 1, 60_000).await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, id);
    assert_eq!(recovered[0].attempts, 2);
    assert_eq!(recovered[0].locked_by.as_deref(), Some("worker-b"));

    // the original owner must observe the loss
    assert!(!driver.renew_lease(&id, "worker-a", 60_000).await.unwrap());
    assert!(!driver.complete(&id, "worker-a").await.unwrap());

    assert!(driver.complete(&id, "worker-b").await.unwrap());
    let job = driver.get_job(&id).await.unwrap().expect("job missing");
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.attempts <= job.max_attempts);
}

/// Commits are conditional on ownership; a retry requeue returns the job to
/// pending with the error recorded.
pub async fn commit_guards(driver: Arc<dyn Driver>) {
    let queue = unique_queue("commit");
    let id = driver
        .enqueue(
            &queue,
            json!({}),
            EnqueueOptions::builder().max_attempts(2).build(),
        )
        .await
        .unwrap();

    driver.claim(&queue, "worker-a", 1, 60_000).await.unwrap();
    assert!(!driver.complete(&id, "worker-z").await.unwrap());
    assert!(!driver.fail(&id, "worker-z", "boom", None).await.unwrap());

    // retryable failure: back to pending, eligible immediately
    let requeue_at = Utc::now() - chrono::Duration::milliseconds(1);
    assert!(driver
        .fail(&id, "worker-a", "first failure", Some(requeue_at))
        .await
        .unwrap());
    let job = driver.get_job(&id).await.unwrap().expect("job missing");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("first failure"));
    assert!(job.locked_by.is_none());
    assert!(job.expires_at.is_none());

    // second attempt fails terminally
    let reclaimed = driver.claim(&queue, "worker-a", 1, 60_000).await.unwrap();
    assert_eq!(reclaimed[0].attempts, 2);
    assert!(driver.fail(&id, "worker-a", "final failure", None).await.unwrap());
    let job = driver.get_job(&id).await.unwrap().expect("job missing");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("final failure"));

    // terminal jobs reject further commits
    assert!(!driver.complete(&id, "worker-a").await.unwrap());
}

/// Retry re-arms failed jobs only; cancel fails pending and processing jobs.
pub async fn retry_and_cancel(driver: Arc<dyn Driver>) {
    let queue = unique_queue("retry");

    // cancel a pending job
    let pending = driver
        .enqueue(&queue, json!({"n": 1}), EnqueueOptions::default())
        .await
        .unwrap();
    assert!(driver.cancel(&pending).await.unwrap());
    let job = driver.get_job(&pending).await.unwrap().expect("job missing");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("cancelled"));
    // terminal now, cancel again is a no-op
    assert!(!driver.cancel(&pending).await.unwrap());

    // retry only applies to failed jobs
    assert!(driver.retry(&pending).await.unwrap());
    let job = driver.get_job(&pending).await.unwrap().expect("job missing");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert!(!driver.retry(&pending).await.unwrap(), "pending jobs cannot be retried");
    assert!(!driver.retry("no-such-job").await.unwrap());

    // cancel a processing job; the owner's commit becomes a no-op
    let claimed = driver.claim(&queue, "worker-a", 1, 60_000).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(driver.cancel(&claimed[0].id).await.unwrap());
    assert!(!driver.complete(&claimed[0].id, "worker-a").await.unwrap());
    let job = driver.get_job(&claimed[0].id).await.unwrap().expect("job missing");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("cancelled"));
}

/// Stage updates persist under the ownership guard and roll up progress.
pub async fn stage_updates(driver: Arc<dyn Driver>) {
    let queue = unique_queue("stages");
    let id = driver
        .enqueue(&queue, json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    driver.claim(&queue, "worker-a", 1, 60_000).await.unwrap();

    let mut stages = vec![Stage::new("a"), Stage::new("b"), Stage::new("c")];
    stages[0].status = StageStatus::Completed;
    stages[0].progress = 100;
    stages[1].status = StageStatus::Processing;
    stages[1].progress = 50;

    assert!(!driver.update_stages(&id, "worker-z", &stages, 50).await.unwrap());
    assert!(driver.update_stages(&id, "worker-a", &stages, 50).await.unwrap());

    let job = driver.get_job(&id).await.unwrap().expect("job missing");
    assert_eq!(job.overall_progress, 50);
    assert_eq!(job.stages.len(), 3);
    assert_eq!(job.stages[1].progress, 50);
    assert_eq!(job.stages[1].status, StageStatus::Processing);
    assert_eq!(job.stages[2].status, StageStatus::Pending);

    // completion leaves the stage list as the handler left it
    assert!(driver.complete(&id, "worker-a").await.unwrap());
    let job = driver.get_job(&id).await.unwrap().expect("job missing");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.overall_progress, 100);
    assert_eq!(job.stages[1].progress, 50);
    assert_eq!(job.stages[2].status, StageStatus::Pending);
}

/// Stats reflect the queue's composition.
pub async fn stats_snapshot(driver: Arc<dyn Driver>) {
    let queue = unique_queue("stats");

    let running = driver
        .enqueue(&queue, json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let done = driver
        .enqueue(&queue, json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let failed = driver
        .enqueue(&queue, json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    // move the first three into distinct states
    let claimed = driver.claim(&queue, "worker-a", 3, 60_000).await.unwrap();
    assert_eq!(claimed.len(), 3);
    assert!(driver.complete(&done, "worker-a").await.unwrap());
    assert!(driver.fail(&failed, "worker-a", "boom", None).await.unwrap());
    let _ = running;

    // one ready and one delayed job on top
    driver
        .enqueue(&queue, json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    driver
        .enqueue(
            &queue,
            json!({}),
            EnqueueOptions::builder().delay(Duration::from_secs(3600)).build(),
        )
        .await
        .unwrap();

    let stats = driver.stats(&queue).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
}

/// Schedule storage round trip: upsert, due filtering, advancement,
/// disable.
pub async fn schedule_roundtrip(driver: Arc<dyn Driver>) {
    let queue = unique_queue("sched");
    let key = unique_queue("schedule-key");
    let first_run = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

    let spec = ScheduleSpec::builder()
        .key(key.clone())
        .queue(queue.clone())
        .cron("0 * * * *")
        .data(json!({"task": "sync"}))
        .build();
    let schedule = driver.upsert_schedule(spec, first_run).await.unwrap();
    assert!(schedule.enabled);
    assert_eq!(schedule.next_run_at, first_run);
    assert!(schedule.last_run_at.is_none());

    let fetched = driver.get_schedule(&key).await.unwrap().expect("schedule missing");
    assert_eq!(fetched.cron, "0 * * * *");
    assert_eq!(fetched.data["task"], "sync");

    // not due before the boundary, due after
    let before = first_run - chrono::Duration::seconds(1);
    assert!(!driver
        .due_schedules(before)
        .await
        .unwrap()
        .iter()
        .any(|s| s.key == key));
    let after = first_run + chrono::Duration::seconds(1);
    assert!(driver
        .due_schedules(after)
        .await
        .unwrap()
        .iter()
        .any(|s| s.key == key));

    // advancing moves it out of the due window
    let next_run = Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap();
    driver.mark_schedule_run(&key, first_run, next_run).await.unwrap();
    let advanced = driver.get_schedule(&key).await.unwrap().expect("schedule missing");
    assert_eq!(advanced.last_run_at, Some(first_run));
    assert_eq!(advanced.next_run_at, next_run);
    assert!(!driver
        .due_schedules(after)
        .await
        .unwrap()
        .iter()
        .any(|s| s.key == key));

    // disabled schedules never fire, but survive
    assert!(driver.set_schedule_enabled(&key, false).await.unwrap());
    let late = next_run + chrono::Duration::hours(1);
    assert!(!driver
        .due_schedules(late)
        .await
        .unwrap()
        .iter()
        .any(|s| s.key == key));
    assert!(driver.get_schedule(&key).await.unwrap().is_some());
}

/// Run the full contract against one driver.
pub async fn run_all(driver: Arc<dyn Driver>) {
    enqueue_dedup(driver.clone()).await;
    replace_processing(driver.clone()).await;
    claim_exclusive_and_ordered(driver.clone()).await;
    delayed_jobs_mature(driver.clone()).await;
    lease_lifecycle(driver.clone()).await;
    commit_guards(driver.clone()).await;
    retry_and_cancel(driver.clone()).await;
    stage_updates(driver.clone()).await;
    stats_snapshot(driver.clone()).await;
    schedule_roundtrip(driver).await;
}
