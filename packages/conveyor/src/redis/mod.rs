//! Redis-backed driver.
//!
//! Uses the BullMQ key layout under a configurable prefix:
//! `{prefix}:{queue}:wait` (list, priority-0 FIFO), `:priority` (zset scored
//! by priority), `:delayed` (zset scored by run-at millis), `:active` (list),
//! `:completed` / `:failed` (zsets scored by finish time), a per-job hash at
//! `{prefix}:{queue}:{id}`, and a per-queue `:dedup` hash for keyed
//! uniqueness. Two driver-level hashes (`{prefix}:ids`, `{prefix}:bykey`)
//! resolve bare ids and keys back to their queue.
//!
//! Jobs with the same priority score pop FIFO because ids are UUIDv7 and the
//! zset breaks score ties lexicographically. Stalled jobs (lease expired
//! while listed in `active`) are swept back to `wait` on every claim, up to
//! `max_stalled_count` times before failing for good.

mod scripts;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;

use self::scripts::Scripts;
use crate::clock::{job_id, system_clock, Clock};
use crate::driver::Driver;
use crate::error::{QueueError, Result};
use crate::job::{
    EnqueueOptions, Job, JobStatus, QueueStats, ReplacePolicy, Schedule, ScheduleSpec, Stage,
};

/// Redis driver settings.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Key namespace; test harnesses isolate runs with a random prefix.
    pub prefix: String,
    /// How many times a job may stall (lease expired while active) before
    /// it fails instead of returning to the wait list.
    pub max_stalled_count: i32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            prefix: "conveyor".to_string(),
            max_stalled_count: 1,
        }
    }
}

/// Per-queue key bundle.
struct QueueKeys {
    wait: String,
    priority: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
    dedup: String,
    job_prefix: String,
}

/// Redis driver.
#[derive(Clone)]
pub struct RedisDriver {
    conn: ConnectionManager,
    config: RedisConfig,
    clock: Arc<dyn Clock>,
    scripts: Arc<Scripts>,
}

impl RedisDriver {
    /// Connect with default settings.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, RedisConfig::default()).await
    }

    /// Connect with explicit settings.
    pub async fn connect_with(url: &str, config: RedisConfig) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            config,
            clock: system_clock(),
            scripts: Arc::new(Scripts::new()),
        })
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        let base = format!("{}:{}", self.config.prefix, queue);
        QueueKeys {
            wait: format!("{base}:wait"),
            priority: format!("{base}:priority"),
            delayed: format!("{base}:delayed"),
            active: format!("{base}:active"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
            dedup: format!("{base}:dedup"),
            job_prefix: format!("{base}:"),
        }
    }

    fn ids_key(&self) -> String {
        format!("{}:ids", self.config.prefix)
    }

    fn bykey_key(&self) -> String {
        format!("{}:bykey", self.config.prefix)
    }

    fn schedules_key(&self) -> String {
        format!("{}:schedules", self.config.prefix)
    }

    fn schedules_next_key(&self) -> String {
        format!("{}:schedules:next", self.config.prefix)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Resolve an id or user key to `(queue, id)`.
    async fn resolve(&self, id_or_key: &str) -> Result<Option<(String, String)>> {
        let mut conn = self.conn.clone();
        let queue: Option<String> = conn.hget(self.ids_key(), id_or_key).await?;
        if let Some(queue) = queue {
            return Ok(Some((queue, id_or_key.to_string())));
        }
        let id: Option<String> = conn.hget(self.bykey_key(), id_or_key).await?;
        let Some(id) = id else {
            return Ok(None);
        };
        let queue: Option<String> = conn.hget(self.ids_key(), &id).await?;
        Ok(queue.map(|queue| (queue, id)))
    }

    async fn fetch_job(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let key = format!("{}{}", self.keys(queue).job_prefix, id);
        let map: HashMap<String, String> = conn.hgetall(&key).await?;
        if map.is_empty() {
            return Ok(None);
        }
        job_from_hash(&map).map(Some)
    }
}

fn field<'a>(map: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    map.get(name)
        .map(String::as_str)
        .ok_or_else(|| QueueError::Decode(format!("job hash missing field {name:?}")))
}

fn opt_field<'a>(map: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    map.get(name).map(String::as_str).filter(|v| !v.is_empty())
}

fn parse_i32(map: &HashMap<String, String>, name: &str) -> Result<i32> {
    field(map, name)?
        .parse()
        .map_err(|_| QueueError::Decode(format!("field {name:?} is not an integer")))
}

fn millis_to_datetime(raw: &str, name: &str) -> Result<DateTime<Utc>> {
    let millis: i64 = raw
        .parse()
        .map_err(|_| QueueError::Decode(format!("field {name:?} is not a timestamp")))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| QueueError::Decode(format!("field {name:?} is out of range")))
}

fn job_from_hash(map: &HashMap<String, String>) -> Result<Job> {
    let status_raw = field(map, "status")?;
    let status = JobStatus::parse(status_raw)
        .ok_or_else(|| QueueError::Decode(format!("unknown job status {status_raw:?}")))?;
    let stages: Vec<Stage> = match opt_field(map, "stages") {
        Some(raw) => serde_json::from_str(raw)?,
        None => Vec::new(),
    };
    let metadata: Option<Value> = match opt_field(map, "metadata") {
        Some(raw) => Some(serde_json::from_str(raw)?),
        None => None,
    };
    let opt_ts = |name: &str| -> Result<Option<DateTime<Utc>>> {
        opt_field(map, name)
            .map(|raw| millis_to_datetime(raw, name))
            .transpose()
    };
    Ok(Job {
        id: field(map, "id")?.to_string(),
        queue: field(map, "queue")?.to_string(),
        key: opt_field(map, "key").map(str::to_string),
        data: serde_json::from_str(field(map, "data")?)?,
        metadata,
        priority: parse_i32(map, "priority")?,
        scheduled_for: millis_to_datetime(field(map, "scheduled_for")?, "scheduled_for")?,
        attempts: parse_i32(map, "attempts")?,
        max_attempts: parse_i32(map, "max_attempts")?,
        status,
        locked_by: opt_field(map, "locked_by").map(str::to_string),
        locked_at: opt_ts("locked_at")?,
        expires_at: opt_ts("expires_at")?,
        last_error: opt_field(map, "last_error").map(str::to_string),
        stages,
        overall_progress: parse_i32(map, "overall_progress")?,
        created_at: millis_to_datetime(field(map, "created_at")?, "created_at")?,
        updated_at: millis_to_datetime(field(map, "updated_at")?, "updated_at")?,
    })
}

#[async_trait]
impl Driver for RedisDriver {
    async fn enqueue(&self, queue: &str, data: Value, opts: EnqueueOptions) -> Result<String> {
        let keys = self.keys(queue);
        let now = self.clock.now();
        let scheduled_for = opts.scheduled_for(now);
        let stages = match opts.stages() {
            Some(stages) => serde_json::to_string(&stages)?,
            None => String::new(),
        };
        let metadata = match &opts.metadata {
            Some(metadata) => serde_json::to_string(metadata)?,
            None => String::new(),
        };
        let replace = match opts.replace {
            ReplacePolicy::Never => "never",
            ReplacePolicy::IfNotActive => "if_not_active",
            ReplacePolicy::Always => "always",
        };
        let key = opts.key.clone().unwrap_or_default();

        let mut conn = self.conn.clone();
        let result: Vec<String> = self
            .scripts
            .enqueue
            .key(&keys.wait)
            .key(&keys.priority)
            .key(&keys.delayed)
            .key(&keys.dedup)
            .key(self.ids_key())
            .key(self.bykey_key())
            .key(&keys.completed)
            .key(&keys.failed)
            .arg(&keys.job_prefix)
            .arg(queue)
            .arg(job_id())
            .arg(&key)
            .arg(serde_json::to_string(&data)?)
            .arg(&metadata)
            .arg(opts.priority)
            .arg(scheduled_for.timestamp_millis())
            .arg(opts.max_attempts)
            .arg(&stages)
            .arg(now.timestamp_millis())
            .arg(replace)
            .invoke_async(&mut conn)
            .await?;

        let [id, code] = result.as_slice() else {
            return Err(QueueError::Decode("enqueue script returned malformed reply".into()));
        };
        if code.as_str() == "active" && opts.replace == ReplacePolicy::Always {
            return Err(QueueError::ReplaceActive { key });
        }
        Ok(id.clone())
    }

    async fn get_job(&self, id_or_key: &str) -> Result<Option<Job>> {
        let Some((queue, id)) = self.resolve(id_or_key).await? else {
            return Ok(None);
        };
        self.fetch_job(&queue, &id).await
    }

    async fn retry(&self, id_or_key: &str) -> Result<bool> {
        let Some((queue, id)) = self.resolve(id_or_key).await? else {
            return Ok(false);
        };
        let keys = self.keys(&queue);
        let mut conn = self.conn.clone();
        let changed: i32 = self
            .scripts
            .retry
            .key(format!("{}{}", keys.job_prefix, id))
            .key(&keys.wait)
            .key(&keys.priority)
            .key(&keys.failed)
            .arg(&id)
            .arg(self.now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }

    async fn cancel(&self, id: &str) -> Result<bool> {
        let Some((queue, id)) = self.resolve(id).await? else {
            return Ok(false);
        };
        let keys = self.keys(&queue);
        let mut conn = self.conn.clone();
        let changed: i32 = self
            .scripts
            .cancel
            .key(format!("{}{}", keys.job_prefix, id))
            .key(&keys.wait)
            .key(&keys.priority)
            .key(&keys.delayed)
            .key(&keys.active)
            .key(&keys.failed)
            .arg(&id)
            .arg(self.now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let wait: i64 = conn.llen(&keys.wait).await?;
        let prioritized: i64 = conn.zcard(&keys.priority).await?;
        let delayed: i64 = conn.zcard(&keys.delayed).await?;
        let processing: i64 = conn.llen(&keys.active).await?;
        let completed: i64 = conn.zcard(&keys.completed).await?;
        let failed: i64 = conn.zcard(&keys.failed).await?;
        Ok(QueueStats {
            pending: wait + prioritized,
            processing,
            completed,
            failed,
            delayed,
        })
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        limit: i64,
        lease_ms: i64,
    ) -> Result<Vec<Job>> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = self
            .scripts
            .claim
            .key(&keys.wait)
            .key(&keys.priority)
            .key(&keys.delayed)
            .key(&keys.active)
            .key(&keys.failed)
            .arg(&keys.job_prefix)
            .arg(self.now_ms())
            .arg(limit)
            .arg(worker_id)
            .arg(lease_ms)
            .arg(self.config.max_stalled_count)
            .invoke_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.fetch_job(queue, &id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn renew_lease(&self, id: &str, worker_id: &str, lease_ms: i64) -> Result<bool> {
        let Some((queue, id)) = self.resolve(id).await? else {
            return Ok(false);
        };
        let keys = self.keys(&queue);
        let mut conn = self.conn.clone();
        let renewed: i32 = self
            .scripts
            .renew_lease
            .key(format!("{}{}", keys.job_prefix, id))
            .arg(worker_id)
            .arg(lease_ms)
            .arg(self.now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn complete(&self, id: &str, worker_id: &str) -> Result<bool> {
        let Some((queue, id)) = self.resolve(id).await? else {
            return Ok(false);
        };
        let keys = self.keys(&queue);
        let mut conn = self.conn.clone();
        let committed: i32 = self
            .scripts
            .complete
            .key(format!("{}{}", keys.job_prefix, id))
            .key(&keys.active)
            .key(&keys.completed)
            .arg(&id)
            .arg(worker_id)
            .arg(self.now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(committed == 1)
    }

    async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        requeue_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let Some((queue, id)) = self.resolve(id).await? else {
            return Ok(false);
        };
        let keys = self.keys(&queue);
        let requeue_arg = requeue_at
            .map(|at| at.timestamp_millis().to_string())
            .unwrap_or_default();
        let mut conn = self.conn.clone();
        let committed: i32 = self
            .scripts
            .fail
            .key(format!("{}{}", keys.job_prefix, id))
            .key(&keys.active)
            .key(&keys.delayed)
            .key(&keys.failed)
            .arg(&id)
            .arg(worker_id)
            .arg(error)
            .arg(&requeue_arg)
            .arg(self.now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(committed == 1)
    }

    async fn update_stages(
        &self,
        id: &str,
        worker_id: &str,
        stages: &[Stage],
        overall_progress: i32,
    ) -> Result<bool> {
        let Some((queue, id)) = self.resolve(id).await? else {
            return Ok(false);
        };
        let keys = self.keys(&queue);
        let stages_json = if stages.is_empty() {
            String::new()
        } else {
            serde_json::to_string(stages)?
        };
        let mut conn = self.conn.clone();
        let committed: i32 = self
            .scripts
            .update_stages
            .key(format!("{}{}", keys.job_prefix, id))
            .arg(worker_id)
            .arg(&stages_json)
            .arg(overall_progress)
            .arg(self.now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(committed == 1)
    }

    async fn upsert_schedule(
        &self,
        spec: ScheduleSpec,
        next_run_at: DateTime<Utc>,
    ) -> Result<Schedule> {
        let mut conn = self.conn.clone();
        let existing: Option<String> = conn.hget(self.schedules_key(), &spec.key).await?;
        let now = self.clock.now();
        let (created_at, last_run_at) = match existing {
            Some(raw) => {
                let previous: Schedule = serde_json::from_str(&raw)?;
                (previous.created_at, previous.last_run_at)
            }
            None => (now, None),
        };
        let schedule = Schedule {
            key: spec.key,
            queue: spec.queue,
            cron: spec.cron,
            data: spec.data,
            enabled: spec.enabled,
            last_run_at,
            next_run_at,
            created_at,
            updated_at: now,
        };
        let raw = serde_json::to_string(&schedule)?;
        let _: () = conn.hset(self.schedules_key(), &schedule.key, raw).await?;
        let _: () = conn
            .zadd(
                self.schedules_next_key(),
                &schedule.key,
                next_run_at.timestamp_millis(),
            )
            .await?;
        Ok(schedule)
    }

    async fn get_schedule(&self, key: &str) -> Result<Option<Schedule>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(self.schedules_key(), key).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(QueueError::from))
            .transpose()
    }

    async fn set_schedule_enabled(&self, key: &str, enabled: bool) -> Result<bool> {
        let Some(mut schedule) = self.get_schedule(key).await? else {
            return Ok(false);
        };
        schedule.enabled = enabled;
        schedule.updated_at = self.clock.now();
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(self.schedules_key(), key, serde_json::to_string(&schedule)?)
            .await?;
        Ok(true)
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let mut conn = self.conn.clone();
        let due_keys: Vec<String> = conn
            .zrangebyscore(
                self.schedules_next_key(),
                i64::MIN,
                now.timestamp_millis(),
            )
            .await?;
        let mut due = Vec::new();
        for key in due_keys {
            if let Some(schedule) = self.get_schedule(&key).await? {
                if schedule.enabled {
                    due.push(schedule);
                }
            }
        }
        Ok(due)
    }

    async fn mark_schedule_run(
        &self,
        key: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let Some(mut schedule) = self.get_schedule(key).await? else {
            return Ok(());
        };
        schedule.last_run_at = Some(last_run_at);
        schedule.next_run_at = next_run_at;
        schedule.updated_at = self.clock.now();
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(self.schedules_key(), key, serde_json::to_string(&schedule)?)
            .await?;
        let _: () = conn
            .zadd(
                self.schedules_next_key(),
                key,
                next_run_at.timestamp_millis(),
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // the multiplexed connection shuts down when the last clone drops
        Ok(())
    }
}
