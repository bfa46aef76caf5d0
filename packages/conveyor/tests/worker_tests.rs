//! End-to-end worker behavior over the SQLite driver: retry classification,
//! ordering, delays, mutual exclusion, stages, callbacks, and shutdown.

mod common;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{sqlite_driver, unique_queue, wait_for_status, wait_until};
use conveyor::{
    BackoffPolicy, Driver, EnqueueOptions, EventCallbacks, JobContext, JobError, JobHandler,
    JobStatus, StageStatus, Worker, WorkerConfig,
};
use serde_json::json;

/// Adapter so tests can write handlers as closures.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        (self.0)(ctx).await
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(20),
        backoff: BackoffPolicy {
            base: Duration::from_millis(50),
            max: Duration::from_secs(5),
            jitter: 0.0,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn permanent_error_fails_without_retry() {
    let driver: Arc<dyn Driver> = Arc::new(sqlite_driver().await);
    let queue = unique_queue("permanent");

    let invocations = Arc::new(AtomicUsize::new(0));
    let fail_events = Arc::new(AtomicUsize::new(0));

    let handler_invocations = invocations.clone();
    let handler = Arc::new(FnHandler(move |_ctx: JobContext| {
        let invocations = handler_invocations.clone();
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            Err(JobError::permanent("boom"))
        }
    }));

    let callback_fails = fail_events.clone();
    let mut config = fast_config();
    config.callbacks = EventCallbacks {
        on_job_fail: Some(Arc::new(move |_| {
            callback_fails.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };

    let worker = Worker::new(driver.clone(), queue.clone(), handler, config).unwrap();
    worker.start().await;

    let id = driver
        .enqueue(
            &queue,
            json!({"v": 42}),
            EnqueueOptions::builder().key("k1").build(),
        )
        .await
        .unwrap();

    let job = wait_for_status(driver.as_ref(), &id, JobStatus::Failed, Duration::from_secs(5)).await;
    worker.stop().await;

    assert_eq!(job.last_error.as_deref(), Some("boom"));
    assert_eq!(job.attempts, 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(fail_events.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn jobs_run_in_priority_order_on_a_single_slot() {
    let driver: Arc<dyn Driver> = Arc::new(sqlite_driver().await);
    let queue = unique_queue("priority");

    // enqueued in reverse priority order, before the worker starts
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

    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = seen.clone();
    let handler = Arc::new(FnHandler(move |ctx: JobContext| {
        let seen = handler_seen.clone();
        async move {
            seen.lock().unwrap().push(ctx.data()["o"].as_i64().unwrap());
            Ok(())
        }
    }));

    let worker = Worker::new(driver.clone(), queue.clone(), handler, fast_config()).unwrap();
    worker.start().await;

    let watch = seen.clone();
    let done = wait_until(Duration::from_secs(5), move || {
        let seen = watch.clone();
        async move { seen.lock().unwrap().len() == 3 }
    })
    .await;
    worker.stop().await;

    assert!(done, "not all jobs ran");
    assert_eq!(seen.lock().unwrap().as_slice(), [1, 2, 3]);
}

#[tokio::test]
async fn retryable_failures_back_off_until_attempts_are_exhausted() {
    let driver: Arc<dyn Driver> = Arc::new(sqlite_driver().await);
    let queue = unique_queue("retry");

    let invocations: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let fail_events = Arc::new(AtomicUsize::new(0));

    let handler_invocations = invocations.clone();
    let handler = Arc::new(FnHandler(move |_ctx: JobContext| {
        let invocations = handler_invocations.clone();
        async move {
            invocations.lock().unwrap().push(Instant::now());
            Err(JobError::retryable("flaky"))
        }
    }));

    let callback_fails = fail_events.clone();
    let mut config = fast_config();
    config.backoff = BackoffPolicy {
        base: Duration::from_millis(120),
        max: Duration::from_secs(5),
        jitter: 0.0,
    };
    config.callbacks = EventCallbacks {
        on_job_fail: Some(Arc::new(move |_| {
            callback_fails.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };

    let worker = Worker::new(driver.clone(), queue.clone(), handler, config).unwrap();
    worker.start().await;

    let id = driver
        .enqueue(
            &queue,
            json!({}),
            EnqueueOptions::builder().max_attempts(3).build(),
        )
        .await
        .unwrap();

    let job = wait_for_status(driver.as_ref(), &id, JobStatus::Failed, Duration::from_secs(10)).await;
    worker.stop().await;

    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("flaky"));
    assert_eq!(fail_events.load(Ordering::SeqCst), 1, "only the final failure fires the callback");

    let timestamps = invocations.lock().unwrap().clone();
    assert_eq!(timestamps.len(), 3, "handler must run exactly max_attempts times");
    let gap1 = timestamps[1] - timestamps[0];
    let gap2 = timestamps[2] - timestamps[1];
    // base * 2^(n-1) with no jitter; small slack for timer coarseness
    assert!(gap1 >= Duration::from_millis(100), "first backoff too short: {gap1:?}");
    assert!(gap2 >= Duration::from_millis(200), "second backoff too short: {gap2:?}");
}

#[tokio::test]
async fn one_job_runs_on_exactly_one_worker() {
    let driver: Arc<dyn Driver> = Arc::new(sqlite_driver().await);
    let queue = unique_queue("exclusive");

    let invocations = Arc::new(AtomicUsize::new(0));
    let make_handler = |invocations: Arc<AtomicUsize>| {
        Arc::new(FnHandler(move |_ctx: JobContext| {
            let invocations = invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            }
        }))
    };

    let worker_a = Worker::new(
        driver.clone(),
        queue.clone(),
        make_handler(invocations.clone()),
        fast_config(),
    )
    .unwrap();
    let worker_b = Worker::new(
        driver.clone(),
        queue.clone(),
        make_handler(invocations.clone()),
        fast_config(),
    )
    .unwrap();
    worker_a.start().await;
    worker_b.start().await;

    let id = driver
        .enqueue(&queue, json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    wait_for_status(driver.as_ref(), &id, JobStatus::Completed, Duration::from_secs(5)).await;
    // give a would-be duplicate invocation time to show up
    tokio::time::sleep(Duration::from_millis(300)).await;
    worker_a.stop().await;
    worker_b.stop().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn delayed_jobs_are_not_picked_up_early() {
    let driver: Arc<dyn Driver> = Arc::new(sqlite_driver().await);
    let queue = unique_queue("delayed");

    let started_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let handler_started = started_at.clone();
    let handler = Arc::new(FnHandler(move |_ctx: JobContext| {
        let started_at = handler_started.clone();
        async move {
            *started_at.lock().unwrap() = Some(Instant::now());
            Ok(())
        }
    }));

    let mut config = fast_config();
    config.poll_interval = Duration::from_millis(50);
    let worker = Worker::new(driver.clone(), queue.clone(), handler, config).unwrap();
    worker.start().await;

    let enqueued_at = Instant::now();
    let id = driver
        .enqueue(
            &queue,
            json!({}),
            EnqueueOptions::builder()
                .delay(Duration::from_millis(200))
                .build(),
        )
        .await
        .unwrap();

    wait_for_status(driver.as_ref(), &id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker.stop().await;

    let started = started_at.lock().unwrap().expect("handler never ran");
    let elapsed = started - enqueued_at;
    assert!(elapsed >= Duration::from_millis(180), "picked up after {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(500), "picked up after {elapsed:?}");
}

#[tokio::test]
async fn stages_survive_job_completion_as_the_handler_left_them() {
    let driver: Arc<dyn Driver> = Arc::new(sqlite_driver().await);
    let queue = unique_queue("stages");

    let handler = Arc::new(FnHandler(move |ctx: JobContext| async move {
        ctx.init_stages(&["a", "b", "c"]).await?;
        ctx.start_stage("a").await?;
        ctx.complete_stage("a", None).await?;
        ctx.start_stage("b").await?;
        ctx.update_stage_progress("b", 50).await?;
        Ok(())
    }));

    let worker = Worker::new(driver.clone(), queue.clone(), handler, fast_config()).unwrap();
    worker.start().await;

    let id = driver
        .enqueue(&queue, json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let job = wait_for_status(driver.as_ref(), &id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker.stop().await;

    // completion does not touch the stage list
    assert_eq!(job.overall_progress, 100);
    assert_eq!(job.stages.len(), 3);
    assert_eq!(job.stages[0].status, StageStatus::Completed);
    assert_eq!(job.stages[0].progress, 100);
    assert_eq!(job.stages[1].status, StageStatus::Processing);
    assert_eq!(job.stages[1].progress, 50);
    assert_eq!(job.stages[2].status, StageStatus::Pending);
    assert_eq!(job.stages[2].progress, 0);
}

#[tokio::test]
async fn stages_can_be_added_failed_and_progressed_mid_flight() {
    let driver: Arc<dyn Driver> = Arc::new(sqlite_driver().await);
    let queue = unique_queue("midflight");

    let stage_failures = Arc::new(AtomicUsize::new(0));
    let callback_failures = stage_failures.clone();
    let mut config = fast_config();
    config.callbacks = EventCallbacks {
        on_stage_fail: Some(Arc::new(move |ev| {
            assert_eq!(ev.stage.name, "a");
            callback_failures.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };

    let handler = Arc::new(FnHandler(move |ctx: JobContext| async move {
        ctx.init_stages(&["a"]).await?;
        ctx.start_stage("a").await?;
        // progress() applies to the current stage
        ctx.progress(30).await?;
        ctx.add_stages(&["b"]).await?;
        ctx.fail_stage("a", "bad input").await?;
        ctx.start_stage("b").await?;
        ctx.complete_stage("b", Some(json!({"rows": 12}))).await?;
        assert!(ctx.heartbeat().await?);
        Ok(())
    }));

    let worker = Worker::new(driver.clone(), queue.clone(), handler, config).unwrap();
    worker.start().await;

    let id = driver
        .enqueue(&queue, json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let job = wait_for_status(driver.as_ref(), &id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker.stop().await;

    // a failed stage does not fail the job; the handler decides
    assert_eq!(job.stages.len(), 2);
    assert_eq!(job.stages[0].status, StageStatus::Failed);
    assert_eq!(job.stages[0].progress, 30);
    assert_eq!(job.stages[0].error.as_deref(), Some("bad input"));
    assert_eq!(job.stages[1].status, StageStatus::Completed);
    assert_eq!(job.stages[1].artifacts, Some(json!({"rows": 12})));
    assert_eq!(stage_failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn callbacks_fire_in_order_with_metadata() {
    let driver: Arc<dyn Driver> = Arc::new(sqlite_driver().await);
    let queue = unique_queue("callbacks");

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let record = |events: &Arc<Mutex<Vec<String>>>, label: &'static str| {
        let events = events.clone();
        move |name: String, metadata_present: bool| {
            assert!(metadata_present, "{label} lost the job metadata");
            events.lock().unwrap().push(format!("{label}:{name}"));
        }
    };

    let on_stage_start = record(&events, "start");
    let on_stage_complete = record(&events, "complete");
    let on_job_complete = record(&events, "job");

    let mut config = fast_config();
    config.callbacks = EventCallbacks {
        on_stage_start: Some(Arc::new(move |ev| {
            on_stage_start(ev.stage.name.clone(), ev.metadata.is_some())
        })),
        on_stage_complete: Some(Arc::new(move |ev| {
            on_stage_complete(ev.stage.name.clone(), ev.metadata.is_some())
        })),
        on_job_complete: Some(Arc::new(move |ev| {
            on_job_complete("done".to_string(), ev.metadata.is_some())
        })),
        ..Default::default()
    };

    let handler = Arc::new(FnHandler(move |ctx: JobContext| async move {
        ctx.init_stages(&["s1", "s2"]).await?;
        ctx.start_stage("s1").await?;
        ctx.complete_stage("s1", None).await?;
        ctx.start_stage("s2").await?;
        ctx.complete_stage("s2", None).await?;
        Ok(())
    }));

    let worker = Worker::new(driver.clone(), queue.clone(), handler, config).unwrap();
    worker.start().await;

    let id = driver
        .enqueue(
            &queue,
            json!({}),
            EnqueueOptions::builder()
                .metadata(json!({"userId": "u-1"}))
                .build(),
        )
        .await
        .unwrap();
    wait_for_status(driver.as_ref(), &id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker.stop().await;

    assert_eq!(
        events.lock().unwrap().as_slice(),
        [
            "start:s1",
            "complete:s1",
            "start:s2",
            "complete:s2",
            "job:done"
        ]
    );
}

#[tokio::test]
async fn external_cancel_reaches_the_handler_within_a_heartbeat() {
    let driver: Arc<dyn Driver> = Arc::new(sqlite_driver().await);
    let queue = unique_queue("cancel");

    let entered = Arc::new(AtomicBool::new(false));
    let observed_cancel = Arc::new(AtomicBool::new(false));

    let handler_entered = entered.clone();
    let handler_observed = observed_cancel.clone();
    let handler = Arc::new(FnHandler(move |ctx: JobContext| {
        let entered = handler_entered.clone();
        let observed = handler_observed.clone();
        async move {
            entered.store(true, Ordering::SeqCst);
            for _ in 0..250 {
                if ctx.cancelled() {
                    observed.store(true, Ordering::SeqCst);
                    return Err(JobError::Cancelled);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok(())
        }
    }));

    let mut config = fast_config();
    config.lock_duration = Duration::from_millis(400);
    config.heartbeat_interval = Duration::from_millis(100);
    let worker = Worker::new(driver.clone(), queue.clone(), handler, config).unwrap();
    worker.start().await;

    let id = driver
        .enqueue(&queue, json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let watch = entered.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            let entered = watch.clone();
            async move { entered.load(Ordering::SeqCst) }
        })
        .await,
        "handler never started"
    );

    assert!(driver.cancel(&id).await.unwrap());

    // the next heartbeat renewal fails and cancels the context
    let watch = observed_cancel.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            let observed = watch.clone();
            async move { observed.load(Ordering::SeqCst) }
        })
        .await,
        "handler never observed cancellation"
    );

    let job = wait_for_status(driver.as_ref(), &id, JobStatus::Failed, Duration::from_secs(2)).await;
    worker.stop().await;
    assert_eq!(job.last_error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn heartbeats_keep_long_handlers_alive_past_the_lock_duration() {
    let driver: Arc<dyn Driver> = Arc::new(sqlite_driver().await);
    let queue = unique_queue("longrun");

    let invocations = Arc::new(AtomicUsize::new(0));
    let make_handler = |invocations: Arc<AtomicUsize>| {
        Arc::new(FnHandler(move |_ctx: JobContext| {
            let invocations = invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(800)).await;
                Ok(())
            }
        }))
    };

    let mut config = fast_config();
    config.lock_duration = Duration::from_millis(300);
    config.heartbeat_interval = Duration::from_millis(100);

    let worker_a = Worker::new(
        driver.clone(),
        queue.clone(),
        make_handler(invocations.clone()),
        config.clone(),
    )
    .unwrap();
    let worker_b = Worker::new(
        driver.clone(),
        queue.clone(),
        make_handler(invocations.clone()),
        config,
    )
    .unwrap();
    worker_a.start().await;
    worker_b.start().await;

    let id = driver
        .enqueue(&queue, json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let job = wait_for_status(driver.as_ref(), &id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker_a.stop().await;
    worker_b.stop().await;

    assert_eq!(job.attempts, 1, "job must not be reclaimed while heartbeating");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_is_idempotent_and_drains_in_flight_jobs() {
    let driver: Arc<dyn Driver> = Arc::new(sqlite_driver().await);
    let queue = unique_queue("shutdown");

    let entered = Arc::new(AtomicBool::new(false));
    let handler_entered = entered.clone();
    let handler = Arc::new(FnHandler(move |_ctx: JobContext| {
        let entered = handler_entered.clone();
        async move {
            entered.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        }
    }));

    let worker = Worker::new(driver.clone(), queue.clone(), handler, fast_config()).unwrap();
    assert!(!worker.is_running());
    worker.start().await;
    worker.start().await; // second start is a no-op
    assert!(worker.is_running());

    let id = driver
        .enqueue(&queue, json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let watch = entered.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            let entered = watch.clone();
            async move { entered.load(Ordering::SeqCst) }
        })
        .await
    );

    worker.stop().await;
    assert!(!worker.is_running());

    // the in-flight job finished and committed before stop returned
    let job = driver.get_job(&id).await.unwrap().expect("job missing");
    assert_eq!(job.status, JobStatus::Completed);

    worker.stop().await;
    assert!(!worker.is_running());
}
