//! Redis-backed broker client.
//!
//! A thin client over a Redis keyspace; durability and cross-process
//! semantics belong to the Redis server. Per queue the client maintains:
//!
//! - `{prefix}:{queue}:wait`      list of pending job envelopes
//! - `{prefix}:{queue}:active`    hash of in-flight envelopes keyed by job id
//! - `{prefix}:{queue}:delayed`   zset of envelopes scored by ready-time (ms)
//! - `{prefix}:{queue}:paused`    flag key; present while the queue is paused
//! - `{prefix}:{queue}:stalls`    hash of stall counts keyed by job id
//! - `{prefix}:{queue}:completed` / `{prefix}:{queue}:failed` bounded trails
//!
//! Workers renew their active entry while processing; the stall-recovery
//! task requeues entries whose renewals stopped.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::broker::{
    Broker, BrokerQueue, Job, JobContext, JobHandler, QueueOptions, StallPolicy, WorkerEvent,
    WorkerHandle, WorkerOptions,
};
use crate::error::{AnthillError, ErrorCode, Result};

/// Completed/failed envelopes retained per queue.
const RETAINED_JOBS: isize = 512;
/// Delayed entries promoted per poll iteration.
const PROMOTE_BATCH: isize = 16;

type Connection = ::redis::aio::MultiplexedConnection;

async fn connection(client: &::redis::Client) -> Result<Connection> {
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(AnthillError::from)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Keyspace
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct QueueKeys {
    wait: String,
    active: String,
    delayed: String,
    paused: String,
    stalls: String,
    completed: String,
    failed: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: &str) -> Self {
        let prefix = if prefix.is_empty() { "anthill" } else { prefix };
        let base = format!("{prefix}:{queue}");
        Self {
            wait: format!("{base}:wait"),
            active: format!("{base}:active"),
            delayed: format!("{base}:delayed"),
            paused: format!("{base}:paused"),
            stalls: format!("{base}:stalls"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
        }
    }
}

/// In-flight envelope stored in the active hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActiveEntry {
    job: Job,
    /// Last renewal timestamp in epoch milliseconds
    touched_ms: i64,
}

impl ActiveEntry {
    fn now(job: Job) -> Self {
        Self {
            job,
            touched_ms: Utc::now().timestamp_millis(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Handle
// ═══════════════════════════════════════════════════════════════════════════════

struct RedisQueue {
    name: String,
    keys: QueueKeys,
    stall: Option<StallPolicy>,
    client: ::redis::Client,
    stall_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for RedisQueue {
    fn drop(&mut self) {
        if let Some(task) = self.stall_task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl BrokerQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, job: Job) -> Result<crate::broker::JobId> {
        let id = job.id;
        let serialized = serde_json::to_string(&job)?;
        let mut conn = connection(&self.client).await?;
        ::redis::cmd("RPUSH")
            .arg(&self.keys.wait)
            .arg(serialized)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(AnthillError::from)?;
        debug!(queue = %self.name, job = %id, "job enqueued");
        Ok(id)
    }

    async fn pause(&self) -> Result<()> {
        let mut conn = connection(&self.client).await?;
        ::redis::cmd("SET")
            .arg(&self.keys.paused)
            .arg(1)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(AnthillError::from)
    }

    async fn resume(&self) -> Result<()> {
        let mut conn = connection(&self.client).await?;
        ::redis::cmd("DEL")
            .arg(&self.keys.paused)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(AnthillError::from)?;
        Ok(())
    }

    async fn active_count(&self) -> Result<usize> {
        let mut conn = connection(&self.client).await?;
        ::redis::cmd("HLEN")
            .arg(&self.keys.active)
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(AnthillError::from)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Broker
// ═══════════════════════════════════════════════════════════════════════════════

/// Broker client for a Redis instance.
pub struct RedisBroker {
    client: ::redis::Client,
    queues: DashMap<String, Arc<RedisQueue>>,
}

impl RedisBroker {
    /// Create a client for the given Redis URL.
    ///
    /// Connections are established lazily per operation; establishment
    /// failures surface as [`ErrorCode::BrokerConnectionFailed`].
    pub fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url).map_err(AnthillError::from)?;
        Ok(Self {
            client,
            queues: DashMap::new(),
        })
    }

    fn queue_entry(&self, name: &str, options: &QueueOptions) -> Arc<RedisQueue> {
        let entry = self.queues.entry(name.to_string()).or_insert_with(|| {
            let keys = QueueKeys::new(&options.prefix, name);
            let stall_task = options.stall.clone().map(|policy| {
                tokio::spawn(stall_loop(
                    self.client.clone(),
                    keys.clone(),
                    policy,
                    name.to_string(),
                ))
            });
            Arc::new(RedisQueue {
                name: name.to_string(),
                keys,
                stall: options.stall.clone(),
                client: self.client.clone(),
                stall_task: parking_lot::Mutex::new(stall_task),
            })
        });
        Arc::clone(entry.value())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn queue(&self, name: &str, options: QueueOptions) -> Result<Arc<dyn BrokerQueue>> {
        Ok(self.queue_entry(name, &options))
    }

    async fn run_worker(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<WorkerHandle> {
        let queue = self.queue_entry(queue, &QueueOptions::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(worker_loop(
            self.client.clone(),
            queue.keys.clone(),
            queue.stall.clone(),
            handler,
            options,
            events,
            shutdown_rx,
        ));

        Ok(WorkerHandle::new(shutdown_tx))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Loop
// ═══════════════════════════════════════════════════════════════════════════════

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    client: ::redis::Client,
    keys: QueueKeys,
    stall: Option<StallPolicy>,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    events: mpsc::Sender<WorkerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut saw_work = false;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut conn = match connection(&client).await {
            Ok(conn) => conn,
            Err(error) => {
                let _ = events.send(WorkerEvent::Error { error }).await;
                idle(&options, &mut shutdown).await;
                continue;
            }
        };

        let paused: i64 = ::redis::cmd("EXISTS")
            .arg(&keys.paused)
            .query_async(&mut conn)
            .await
            .unwrap_or(0);
        if paused > 0 {
            idle(&options, &mut shutdown).await;
            continue;
        }

        if let Err(error) = promote_delayed(&mut conn, &keys).await {
            warn!(error = %error, "could not promote delayed jobs");
        }

        let raw: Option<String> = match ::redis::cmd("LPOP")
            .arg(&keys.wait)
            .query_async(&mut conn)
            .await
        {
            Ok(raw) => raw,
            Err(redis_error) => {
                let _ = events
                    .send(WorkerEvent::Error {
                        error: AnthillError::from(redis_error),
                    })
                    .await;
                idle(&options, &mut shutdown).await;
                continue;
            }
        };

        let Some(raw) = raw else {
            if saw_work {
                saw_work = false;
                let _ = events.send(WorkerEvent::Drained).await;
            }
            idle(&options, &mut shutdown).await;
            continue;
        };

        let mut job: Job = match serde_json::from_str(&raw) {
            Ok(job) => job,
            Err(parse_error) => {
                let _ = events
                    .send(WorkerEvent::Error {
                        error: AnthillError::from(parse_error),
                    })
                    .await;
                continue;
            }
        };

        saw_work = true;
        job.attempts_made += 1;

        let entry = ActiveEntry::now(job.clone());
        if let Ok(serialized) = serde_json::to_string(&entry) {
            let _ = ::redis::cmd("HSET")
                .arg(&keys.active)
                .arg(job.id.to_string())
                .arg(serialized)
                .query_async::<_, i64>(&mut conn)
                .await;
        }

        // Renew the active entry while the handler runs so the stall checker
        // can tell a long job from an abandoned one.
        let renewal = stall.as_ref().map(|policy| {
            tokio::spawn(renew_loop(
                client.clone(),
                keys.clone(),
                job.clone(),
                policy.check_interval / 2,
            ))
        });

        let task = {
            let handler = Arc::clone(&handler);
            let job = job.clone();
            let ctx = JobContext::new(job.clone(), events.clone());
            tokio::spawn(async move { handler.handle(&job, &ctx).await })
        };
        let outcome = task.await;

        if let Some(renewal) = renewal {
            renewal.abort();
        }

        let removed: i64 = ::redis::cmd("HDEL")
            .arg(&keys.active)
            .arg(job.id.to_string())
            .query_async(&mut conn)
            .await
            .unwrap_or(0);
        if removed == 0 {
            // The stall checker reclaimed this job; it owns it now.
            continue;
        }

        match outcome {
            Ok(Ok(return_value)) => {
                settle_completed(&mut conn, &keys, &events, job, return_value).await;
            }
            Ok(Err(error)) => {
                settle_failed(&mut conn, &keys, &events, job, error).await;
            }
            Err(join_error) => {
                let error = AnthillError::with_internal(
                    ErrorCode::JobHandlerFailed,
                    "Job handler panicked",
                    join_error.to_string(),
                );
                settle_failed(&mut conn, &keys, &events, job, error).await;
            }
        }
    }
}

async fn idle(options: &WorkerOptions, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = sleep(options.poll_interval) => {}
        _ = shutdown.changed() => {}
    }
}

/// Move due entries from the delayed zset onto the wait list.
async fn promote_delayed(conn: &mut Connection, keys: &QueueKeys) -> Result<()> {
    let now_ms = Utc::now().timestamp_millis();
    let due: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
        .arg(&keys.delayed)
        .arg("-inf")
        .arg(now_ms)
        .arg("LIMIT")
        .arg(0)
        .arg(PROMOTE_BATCH)
        .query_async(conn)
        .await
        .map_err(AnthillError::from)?;

    for member in due {
        // ZREM arbitrates between concurrent promoters.
        let removed: i64 = ::redis::cmd("ZREM")
            .arg(&keys.delayed)
            .arg(&member)
            .query_async(conn)
            .await
            .map_err(AnthillError::from)?;
        if removed == 1 {
            ::redis::cmd("RPUSH")
                .arg(&keys.wait)
                .arg(&member)
                .query_async::<_, i64>(conn)
                .await
                .map_err(AnthillError::from)?;
        }
    }

    Ok(())
}

async fn renew_loop(client: ::redis::Client, keys: QueueKeys, job: Job, every: Duration) {
    let every = every.max(Duration::from_millis(50));
    loop {
        sleep(every).await;
        let Ok(mut conn) = connection(&client).await else {
            continue;
        };
        let entry = ActiveEntry::now(job.clone());
        if let Ok(serialized) = serde_json::to_string(&entry) {
            let _ = ::redis::cmd("HSET")
                .arg(&keys.active)
                .arg(job.id.to_string())
                .arg(serialized)
                .query_async::<_, i64>(&mut conn)
                .await;
        }
    }
}

async fn settle_completed(
    conn: &mut Connection,
    keys: &QueueKeys,
    events: &mpsc::Sender<WorkerEvent>,
    job: Job,
    return_value: serde_json::Value,
) {
    let _ = ::redis::cmd("HDEL")
        .arg(&keys.stalls)
        .arg(job.id.to_string())
        .query_async::<_, i64>(conn)
        .await;

    if let Some(repeat) = &job.options.repeat {
        let due_again = repeat
            .limit
            .map_or(true, |limit| job.repeats_made + 1 < limit);
        if due_again {
            let next = job.next_repeat();
            let ready_ms = Utc::now().timestamp_millis() + repeat.every.as_millis() as i64;
            if let Ok(serialized) = serde_json::to_string(&next) {
                let _ = ::redis::cmd("ZADD")
                    .arg(&keys.delayed)
                    .arg(ready_ms)
                    .arg(serialized)
                    .query_async::<_, i64>(conn)
                    .await;
            }
        }
    }

    if !job.options.remove_on_complete {
        push_trail(conn, &keys.completed, &job).await;
    }

    let _ = events
        .send(WorkerEvent::Completed { job, return_value })
        .await;
}

async fn settle_failed(
    conn: &mut Connection,
    keys: &QueueKeys,
    events: &mpsc::Sender<WorkerEvent>,
    job: Job,
    error: AnthillError,
) {
    if job.can_retry() {
        let delay = job
            .options
            .backoff
            .as_ref()
            .map(|backoff| backoff.delay_for_attempt(job.attempts_made))
            .unwrap_or(Duration::ZERO);
        let ready_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        if let Ok(serialized) = serde_json::to_string(&job) {
            let _ = ::redis::cmd("ZADD")
                .arg(&keys.delayed)
                .arg(ready_ms)
                .arg(serialized)
                .query_async::<_, i64>(conn)
                .await;
        }
    } else {
        let _ = ::redis::cmd("HDEL")
            .arg(&keys.stalls)
            .arg(job.id.to_string())
            .query_async::<_, i64>(conn)
            .await;
        if !job.options.remove_on_fail {
            push_trail(conn, &keys.failed, &job).await;
        }
    }

    let _ = events.send(WorkerEvent::Failed { job, error }).await;
}

async fn push_trail(conn: &mut Connection, key: &str, job: &Job) {
    if let Ok(serialized) = serde_json::to_string(job) {
        let _ = ::redis::cmd("RPUSH")
            .arg(key)
            .arg(serialized)
            .query_async::<_, i64>(conn)
            .await;
        let _ = ::redis::cmd("LTRIM")
            .arg(key)
            .arg(-RETAINED_JOBS)
            .arg(-1)
            .query_async::<_, ()>(conn)
            .await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stall Recovery
// ═══════════════════════════════════════════════════════════════════════════════

/// Requeue active entries whose renewals stopped.
async fn stall_loop(
    client: ::redis::Client,
    keys: QueueKeys,
    policy: StallPolicy,
    queue: String,
) {
    let mut interval = tokio::time::interval(policy.check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let Ok(mut conn) = connection(&client).await else {
            continue;
        };

        let entries: Vec<(String, String)> = match ::redis::cmd("HGETALL")
            .arg(&keys.active)
            .query_async(&mut conn)
            .await
        {
            Ok(entries) => entries,
            Err(error) => {
                warn!(queue = %queue, error = %error, "stall check could not read active set");
                continue;
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        let stale_after_ms = (policy.check_interval.as_millis() as i64) * 2;

        for (field, raw) in entries {
            let Ok(entry) = serde_json::from_str::<ActiveEntry>(&raw) else {
                continue;
            };
            if now_ms - entry.touched_ms < stale_after_ms {
                continue;
            }

            // HDEL arbitrates with the worker settling the job normally.
            let removed: i64 = ::redis::cmd("HDEL")
                .arg(&keys.active)
                .arg(&field)
                .query_async(&mut conn)
                .await
                .unwrap_or(0);
            if removed != 1 {
                continue;
            }

            let stalls: i64 = ::redis::cmd("HINCRBY")
                .arg(&keys.stalls)
                .arg(&field)
                .arg(1)
                .query_async(&mut conn)
                .await
                .unwrap_or(i64::MAX);

            if stalls > i64::from(policy.max_stalled_count) {
                warn!(queue = %queue, job = %field, stalls, "job exceeded max stall count, marking failed");
                let _ = ::redis::cmd("HDEL")
                    .arg(&keys.stalls)
                    .arg(&field)
                    .query_async::<_, i64>(&mut conn)
                    .await;
                if !entry.job.options.remove_on_fail {
                    push_trail(&mut conn, &keys.failed, &entry.job).await;
                }
            } else {
                debug!(queue = %queue, job = %field, stalls, "requeueing stalled job");
                if let Ok(serialized) = serde_json::to_string(&entry.job) {
                    let _ = ::redis::cmd("RPUSH")
                        .arg(&keys.wait)
                        .arg(serialized)
                        .query_async::<_, i64>(&mut conn)
                        .await;
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
