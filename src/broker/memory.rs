//! In-memory broker for development and tests.
//!
//! Single-process, no durability. Queue semantics mirror the production
//! client: paused queues stop handing out work, failed attempts are
//! re-enqueued per the job's retry options, repeatable jobs re-add
//! themselves, and a stall-recovery task requeues jobs whose worker task
//! died mid-processing.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::broker::{
    Broker, BrokerQueue, Job, JobContext, JobHandler, JobId, QueueOptions, StallPolicy,
    WorkerEvent, WorkerHandle, WorkerOptions,
};
use crate::error::{AnthillError, ErrorCode, Result};

/// Completed/failed jobs retained per queue when removal is not requested.
const RETAINED_JOBS: usize = 512;

// ═══════════════════════════════════════════════════════════════════════════════
// Queue State
// ═══════════════════════════════════════════════════════════════════════════════

struct ActiveJob {
    job: Job,
    /// Dead once the processing task finished, panicked or was aborted.
    token: Weak<()>,
    started: Instant,
}

#[derive(Default)]
struct QueueState {
    pending: parking_lot::Mutex<VecDeque<Job>>,
    active: parking_lot::Mutex<HashMap<JobId, ActiveJob>>,
    paused: AtomicBool,
    completed: parking_lot::Mutex<VecDeque<Job>>,
    failed: parking_lot::Mutex<VecDeque<Job>>,
    stall_counts: parking_lot::Mutex<HashMap<JobId, u32>>,
}

fn retain(list: &parking_lot::Mutex<VecDeque<Job>>, job: Job) {
    let mut list = list.lock();
    list.push_back(job);
    if list.len() > RETAINED_JOBS {
        list.pop_front();
    }
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryQueueStats {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Handle
// ═══════════════════════════════════════════════════════════════════════════════

struct MemoryQueue {
    name: String,
    state: Arc<QueueState>,
    stall_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for MemoryQueue {
    fn drop(&mut self) {
        if let Some(task) = self.stall_task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl BrokerQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, job: Job) -> Result<JobId> {
        let id = job.id;
        self.state.pending.lock().push_back(job);
        Ok(id)
    }

    async fn pause(&self) -> Result<()> {
        self.state.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.state.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn active_count(&self) -> Result<usize> {
        Ok(self.state.active.lock().len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Broker
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process broker backed by plain collections.
#[derive(Default)]
pub struct InMemoryBroker {
    queues: DashMap<String, Arc<MemoryQueue>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_entry(&self, name: &str, options: &QueueOptions) -> Arc<MemoryQueue> {
        let entry = self.queues.entry(name.to_string()).or_insert_with(|| {
            let state = Arc::new(QueueState::default());
            let stall_task = options.stall.clone().map(|policy| {
                tokio::spawn(stall_loop(Arc::clone(&state), policy, name.to_string()))
            });
            Arc::new(MemoryQueue {
                name: name.to_string(),
                state,
                stall_task: parking_lot::Mutex::new(stall_task),
            })
        });
        Arc::clone(entry.value())
    }

    /// Inspect a queue's counters (test/diagnostic helper).
    pub fn stats(&self, name: &str) -> Option<MemoryQueueStats> {
        let queue = self.queues.get(name)?;
        let state = &queue.state;
        let pending = state.pending.lock().len();
        let active = state.active.lock().len();
        let completed = state.completed.lock().len();
        let failed = state.failed.lock().len();
        Some(MemoryQueueStats {
            pending,
            active,
            completed,
            failed,
        })
    }

    /// Names of completed jobs retained for a queue, oldest first.
    pub fn completed_jobs(&self, name: &str) -> Vec<Job> {
        self.queues
            .get(name)
            .map(|queue| queue.state.completed.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Failed (exhausted) jobs retained for a queue, oldest first.
    pub fn failed_jobs(&self, name: &str) -> Vec<Job> {
        self.queues
            .get(name)
            .map(|queue| queue.state.failed.lock().iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
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
            Arc::clone(&queue.state),
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

async fn worker_loop(
    state: Arc<QueueState>,
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

        if state.paused.load(Ordering::Acquire) {
            idle(&options, &mut shutdown).await;
            continue;
        }

        let Some(mut job) = state.pending.lock().pop_front() else {
            if saw_work {
                saw_work = false;
                let _ = events.send(WorkerEvent::Drained).await;
            }
            idle(&options, &mut shutdown).await;
            continue;
        };

        saw_work = true;
        job.attempts_made += 1;

        let token = Arc::new(());
        state.active.lock().insert(
            job.id,
            ActiveJob {
                job: job.clone(),
                token: Arc::downgrade(&token),
                started: Instant::now(),
            },
        );

        let ctx = JobContext::new(job.clone(), events.clone());
        let task = {
            let handler = Arc::clone(&handler);
            let job = job.clone();
            tokio::spawn(async move {
                let _token = token;
                handler.handle(&job, &ctx).await
            })
        };

        let outcome = task.await;

        if state.active.lock().remove(&job.id).is_none() {
            // The stall checker already reclaimed this job; it owns it now.
            continue;
        }

        match outcome {
            Ok(Ok(return_value)) => {
                state.stall_counts.lock().remove(&job.id);
                settle_completed(&state, &events, job, return_value).await;
            }
            Ok(Err(error)) => {
                settle_failed(&state, &events, job, error).await;
            }
            Err(join_error) => {
                let error = AnthillError::with_internal(
                    ErrorCode::JobHandlerFailed,
                    "Job handler panicked",
                    join_error.to_string(),
                );
                settle_failed(&state, &events, job, error).await;
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

async fn settle_completed(
    state: &Arc<QueueState>,
    events: &mpsc::Sender<WorkerEvent>,
    job: Job,
    return_value: serde_json::Value,
) {
    if let Some(repeat) = &job.options.repeat {
        let due_again = repeat
            .limit
            .map_or(true, |limit| job.repeats_made + 1 < limit);
        if due_again {
            let next = job.next_repeat();
            let delay = repeat.every;
            let state = Arc::clone(state);
            tokio::spawn(async move {
                sleep(delay).await;
                state.pending.lock().push_back(next);
            });
        }
    }

    if !job.options.remove_on_complete {
        retain(&state.completed, job.clone());
    }

    let _ = events
        .send(WorkerEvent::Completed { job, return_value })
        .await;
}

async fn settle_failed(
    state: &Arc<QueueState>,
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
        let retry = job.clone();
        let state = Arc::clone(state);
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            state.pending.lock().push_back(retry);
        });
    } else {
        state.stall_counts.lock().remove(&job.id);
        if !job.options.remove_on_fail {
            retain(&state.failed, job.clone());
        }
    }

    let _ = events.send(WorkerEvent::Failed { job, error }).await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stall Recovery
// ═══════════════════════════════════════════════════════════════════════════════

/// Requeue jobs whose processing task died without settling them.
async fn stall_loop(state: Arc<QueueState>, policy: StallPolicy, queue: String) {
    let mut interval = tokio::time::interval(policy.check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let stalled: Vec<Job> = {
            let mut active = state.active.lock();
            let ids: Vec<JobId> = active
                .iter()
                .filter(|(_, entry)| {
                    entry.token.strong_count() == 0
                        && entry.started.elapsed() >= policy.check_interval
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| active.remove(&id).map(|entry| entry.job))
                .collect()
        };

        for job in stalled {
            let stalls = {
                let mut counts = state.stall_counts.lock();
                let count = counts.entry(job.id).or_insert(0);
                *count += 1;
                *count
            };

            if stalls > policy.max_stalled_count {
                state.stall_counts.lock().remove(&job.id);
                warn!(queue = %queue, job = %job.id, stalls, "job exceeded max stall count, marking failed");
                if !job.options.remove_on_fail {
                    retain(&state.failed, job);
                }
            } else {
                debug!(queue = %queue, job = %job.id, stalls, "requeueing stalled job");
                state.pending.lock().push_back(job);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::JobOptions;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, job: &Job, _ctx: &JobContext) -> Result<serde_json::Value> {
            Ok(job.payload.clone())
        }
    }

    struct AlwaysFails {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for AlwaysFails {
        async fn handle(&self, _job: &Job, _ctx: &JobContext) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AnthillError::new(ErrorCode::JobHandlerFailed, "nope"))
        }
    }

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_millis(10),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn test_job_is_processed_and_completed_event_emitted() {
        let broker = InMemoryBroker::new();
        let queue = broker.queue("mail", QueueOptions::default()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);

        let _handle = broker
            .run_worker("mail", Arc::new(Echo), fast_options(), tx)
            .await
            .unwrap();

        queue
            .add(Job::new("send", json!({"to": "a"}), JobOptions::default()))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            WorkerEvent::Completed { job, return_value } => {
                assert_eq!(job.name, "send");
                assert_eq!(job.attempts_made, 1);
                assert_eq!(return_value, json!({"to": "a"}));
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        wait_until(|| broker.stats("mail").map(|s| s.completed) == Some(1)).await;
    }

    #[tokio::test]
    async fn test_failed_job_retries_until_attempts_exhausted() {
        let broker = InMemoryBroker::new();
        let queue = broker.queue("jobs", QueueOptions::default()).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(64);

        let _handle = broker
            .run_worker(
                "jobs",
                Arc::new(AlwaysFails {
                    calls: Arc::clone(&calls),
                }),
                fast_options(),
                tx,
            )
            .await
            .unwrap();

        queue
            .add(Job::new("doomed", json!({}), JobOptions::default()))
            .await
            .unwrap();

        wait_until(|| calls.load(Ordering::SeqCst) == 3).await;
        wait_until(|| broker.stats("jobs").map(|s| s.failed) == Some(1)).await;

        // Exactly the configured number of attempts ran.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let mut failed_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, WorkerEvent::Failed { .. }) {
                failed_events += 1;
            }
        }
        assert_eq!(failed_events, 3, "one Failed event per attempt");
    }

    #[tokio::test]
    async fn test_drained_emitted_on_empty_transition() {
        let broker = InMemoryBroker::new();
        let queue = broker.queue("q", QueueOptions::default()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);

        let _handle = broker
            .run_worker("q", Arc::new(Echo), fast_options(), tx)
            .await
            .unwrap();

        queue
            .add(Job::new("only", json!(1), JobOptions::default()))
            .await
            .unwrap();

        let mut drained = false;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(WorkerEvent::Drained)) => {
                    drained = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(drained, "expected a Drained event after the queue emptied");
    }

    #[tokio::test]
    async fn test_paused_queue_is_not_processed() {
        let broker = InMemoryBroker::new();
        let queue = broker.queue("q", QueueOptions::default()).await.unwrap();
        queue.pause().await.unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let _handle = broker
            .run_worker("q", Arc::new(Echo), fast_options(), tx)
            .await
            .unwrap();

        queue
            .add(Job::new("held", json!(1), JobOptions::default()))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.stats("q").unwrap().pending, 1);

        queue.resume().await.unwrap();
        wait_until(|| broker.stats("q").map(|s| s.completed) == Some(1)).await;
    }

    #[tokio::test]
    async fn test_remove_on_complete_drops_retention() {
        let broker = InMemoryBroker::new();
        let queue = broker.queue("q", QueueOptions::default()).await.unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let _handle = broker
            .run_worker("q", Arc::new(Echo), fast_options(), tx)
            .await
            .unwrap();

        queue
            .add(Job::new(
                "gone",
                json!(1),
                JobOptions {
                    remove_on_complete: true,
                    ..JobOptions::default()
                },
            ))
            .await
            .unwrap();

        wait_until(|| {
            broker
                .stats("q")
                .map(|s| s.pending == 0 && s.active == 0)
                .unwrap_or(false)
        })
        .await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.stats("q").unwrap().completed, 0);
    }

    #[tokio::test]
    async fn test_repeatable_job_readds_until_limit() {
        let broker = InMemoryBroker::new();
        let queue = broker.queue("beat", QueueOptions::default()).await.unwrap();
        let (tx, _rx) = mpsc::channel(64);

        let _handle = broker
            .run_worker("beat", Arc::new(Echo), fast_options(), tx)
            .await
            .unwrap();

        queue
            .add(Job::new(
                "tick",
                json!(1),
                JobOptions {
                    repeat: Some(crate::broker::RepeatOptions {
                        every: Duration::from_millis(20),
                        limit: Some(2),
                    }),
                    ..JobOptions::default()
                },
            ))
            .await
            .unwrap();

        wait_until(|| broker.stats("beat").map(|s| s.completed) == Some(2)).await;

        // The recurrence limit caps further re-adds.
        sleep(Duration::from_millis(150)).await;
        assert_eq!(broker.stats("beat").unwrap().completed, 2);
        let runs = broker.completed_jobs("beat");
        assert_eq!(runs[0].repeats_made, 0);
        assert_eq!(runs[1].repeats_made, 1);
    }

    #[tokio::test]
    async fn test_stall_checker_requeues_abandoned_job() {
        let broker = InMemoryBroker::new();
        let options = QueueOptions {
            prefix: String::new(),
            stall: Some(StallPolicy {
                check_interval: Duration::from_millis(30),
                max_stalled_count: 10,
            }),
        };
        broker.queue("q", options).await.unwrap();

        let queue = Arc::clone(broker.queues.get("q").unwrap().value());
        let job = Job::new("lost", json!(1), JobOptions::default());
        queue.state.active.lock().insert(
            job.id,
            ActiveJob {
                job: job.clone(),
                token: Weak::new(),
                started: Instant::now() - Duration::from_secs(5),
            },
        );

        sleep(Duration::from_millis(150)).await;
        let stats = broker.stats("q").unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.pending, 1, "abandoned job should be requeued");
    }
}
