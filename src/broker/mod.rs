//! Broker boundary: the queue/worker collaborator contract.
//!
//! The durable broker itself is an external collaborator. This module defines
//! what the rest of the crate consumes from it:
//!
//! - **Job**: the wire envelope (name, payload, options, attempt count)
//! - **JobOptions / Backoff / RepeatOptions**: per-job retry, retention and
//!   recurrence policy understood by the broker
//! - **QueueOptions / StallPolicy**: per-queue creation options, including
//!   the stall-recovery companion configuration
//! - **BrokerQueue / Broker**: named-queue handles and worker binding
//! - **WorkerEvent**: the `completed | progress | failed | drained | error`
//!   stream a bound worker emits
//!
//! Two implementations ship with the crate: [`memory::InMemoryBroker`] for
//! development and tests, and [`redis::RedisBroker`], a thin client over a
//! Redis keyspace.

pub mod memory;
pub mod redis;

pub use self::memory::InMemoryBroker;
pub use self::redis::RedisBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::{AnthillError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Envelope
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The job envelope handed to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique instance id
    pub id: JobId,
    /// Job name (handler routing key)
    pub name: String,
    /// Serialized job data
    pub payload: serde_json::Value,
    /// Retry/retention/recurrence policy
    pub options: JobOptions,
    /// Attempts started so far
    #[serde(default)]
    pub attempts_made: u32,
    /// Recurrences produced so far (repeatable jobs)
    #[serde(default)]
    pub repeats_made: u32,
    /// When the job was enqueued
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(name: impl Into<String>, payload: serde_json::Value, options: JobOptions) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            payload,
            options,
            attempts_made: 0,
            repeats_made: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Whether another attempt may be started after a failure.
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.options.attempts
    }

    /// A fresh envelope for the next recurrence of a repeatable job.
    pub fn next_repeat(&self) -> Self {
        Self {
            id: JobId::new(),
            name: self.name.clone(),
            payload: self.payload.clone(),
            options: self.options.clone(),
            attempts_made: 0,
            repeats_made: self.repeats_made + 1,
            enqueued_at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Delay policy applied between retry attempts of a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    Fixed,
    /// Delay doubles per completed attempt
    Exponential,
}

/// Backoff configuration attached to a job when a retry strategy is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            delay,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            delay,
        }
    }

    /// Delay before retrying after `attempts_made` attempts have failed.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempts_made.saturating_sub(1));
                self.delay.saturating_mul(factor)
            }
        }
    }
}

/// Recurrence schedule for repeatable jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// Interval between recurrences
    #[serde(with = "duration_ms")]
    pub every: Duration,
    /// Maximum number of recurrences (None = unbounded)
    pub limit: Option<u32>,
}

/// Per-job policy submitted alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Attempts before the job is considered permanently failed
    pub attempts: u32,
    /// Drop the job from the broker once completed
    pub remove_on_complete: bool,
    /// Drop the job from the broker once permanently failed
    pub remove_on_fail: bool,
    /// Retry delay policy; absent means the broker default (no delay)
    pub backoff: Option<Backoff>,
    /// Recurrence schedule; absent for one-shot jobs
    pub repeat: Option<RepeatOptions>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            remove_on_complete: false,
            remove_on_fail: false,
            backoff: None,
            repeat: None,
        }
    }
}

/// Caller-supplied overrides merged over computed default options.
#[derive(Debug, Clone, Default)]
pub struct JobOptionsPatch {
    pub attempts: Option<u32>,
    pub remove_on_complete: Option<bool>,
    pub remove_on_fail: Option<bool>,
    pub backoff: Option<Backoff>,
    pub repeat: Option<RepeatOptions>,
}

impl JobOptionsPatch {
    /// Merge this patch over a base set of options.
    pub fn apply(self, mut base: JobOptions) -> JobOptions {
        if let Some(attempts) = self.attempts {
            base.attempts = attempts;
        }
        if let Some(remove_on_complete) = self.remove_on_complete {
            base.remove_on_complete = remove_on_complete;
        }
        if let Some(remove_on_fail) = self.remove_on_fail {
            base.remove_on_fail = remove_on_fail;
        }
        if let Some(backoff) = self.backoff {
            base.backoff = Some(backoff);
        }
        if let Some(repeat) = self.repeat {
            base.repeat = Some(repeat);
        }
        base
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Stall-recovery companion configuration.
///
/// Jobs whose worker died mid-processing are requeued until they have
/// stalled `max_stalled_count` times, then considered permanently failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallPolicy {
    /// How often the active set is checked for abandoned jobs
    pub check_interval: Duration,
    /// Stall occurrences before a job is failed instead of requeued
    pub max_stalled_count: u32,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(1000),
            max_stalled_count: 10,
        }
    }
}

/// Options for creating a named queue.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Key prefix namespacing this process group's queues
    pub prefix: String,
    /// Attach a stall-recovery companion when set
    pub stall: Option<StallPolicy>,
}

/// Options for binding one worker puller.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Poll interval while the queue is empty or paused
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Events and Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle events emitted by a bound worker puller.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A job finished successfully
    Completed {
        job: Job,
        return_value: serde_json::Value,
    },
    /// A handler reported intermediate progress
    Progress {
        job: Job,
        progress: serde_json::Value,
    },
    /// A job attempt failed (it may still be retried per its options)
    Failed { job: Job, error: AnthillError },
    /// The queue has no pending work
    Drained,
    /// A broker-level error outside any particular job
    Error { error: AnthillError },
}

/// Execution context handed to job handlers.
pub struct JobContext {
    job: Job,
    events: mpsc::Sender<WorkerEvent>,
}

impl JobContext {
    pub fn new(job: Job, events: mpsc::Sender<WorkerEvent>) -> Self {
        Self { job, events }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Surface intermediate progress; purely observational.
    pub async fn report_progress(&self, progress: serde_json::Value) {
        let _ = self
            .events
            .send(WorkerEvent::Progress {
                job: self.job.clone(),
                progress,
            })
            .await;
    }
}

/// The function a bound worker runs per job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<serde_json::Value>;
}

/// Control handle for one bound worker puller.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
}

impl WorkerHandle {
    pub fn new(shutdown: watch::Sender<bool>) -> Self {
        Self { shutdown }
    }

    /// Signal the puller to stop after its current job.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Broker Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// A named queue handle obtained from the broker.
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    /// The queue name.
    fn name(&self) -> &str;

    /// Persist a job.
    async fn add(&self, job: Job) -> Result<JobId>;

    /// Stop pullers from taking new jobs; in-flight jobs keep running.
    async fn pause(&self) -> Result<()>;

    /// Resume a paused queue.
    async fn resume(&self) -> Result<()>;

    /// Number of jobs currently being processed.
    async fn active_count(&self) -> Result<usize>;
}

/// The broker client boundary.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create or fetch the named queue. Creation is idempotent per name.
    async fn queue(&self, name: &str, options: QueueOptions) -> Result<Arc<dyn BrokerQueue>>;

    /// Bind one independent worker puller to a queue.
    ///
    /// The puller pulls jobs, runs `handler`, applies the job's retry options
    /// and emits [`WorkerEvent`]s on `events` until shut down.
    async fn run_worker(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<WorkerHandle>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
