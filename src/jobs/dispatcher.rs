//! Job dispatch facade and queue registry.
//!
//! [`QueueRegistry`] lazily creates and caches one broker-queue handle per
//! name and owns the cooperative drain. [`JobDispatcher`] builds job options
//! from configured defaults, merges caller overrides and submits to the
//! resolved queue.

use dashmap::DashMap;
use metrics::counter;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::broker::{
    Backoff, Broker, BrokerQueue, Job, JobId, JobOptions, JobOptionsPatch, QueueOptions,
    RepeatOptions, StallPolicy,
};
use crate::config::{snake_case, QueueSettings, RetryStrategyKind};
use crate::error::{AnthillError, ErrorCode, Result};
use crate::logging::{LogPayload, LogPipeline};

/// Interval between active-count polls while draining.
const DRAIN_POLL: Duration = Duration::from_millis(100);

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// A cached broker-queue handle. One instance per name per registry.
pub struct QueueHandle {
    name: String,
    queue: Arc<dyn BrokerQueue>,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<dyn BrokerQueue> {
        &self.queue
    }
}

/// Lazily creates and caches broker queues by name, and coordinates the
/// cooperative shutdown drain.
pub struct QueueRegistry {
    broker: Arc<dyn Broker>,
    settings: QueueSettings,
    pipeline: Arc<LogPipeline>,
    handles: DashMap<String, Arc<QueueHandle>>,
    draining: AtomicBool,
}

impl QueueRegistry {
    pub fn new(
        broker: Arc<dyn Broker>,
        settings: QueueSettings,
        pipeline: Arc<LogPipeline>,
    ) -> Self {
        Self {
            broker,
            settings,
            pipeline,
            handles: DashMap::new(),
            draining: AtomicBool::new(false),
        }
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// The configured default queue name, normalized for broker keys.
    pub fn default_queue(&self) -> String {
        snake_case(&self.settings.default_queue)
    }

    /// Whether [`stop`](Self::stop) has begun; new dispatches are rejected.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Create the named queue if it does not exist yet; idempotent.
    ///
    /// Without caller-supplied options the queue is created with the
    /// configured group prefix. A stall-recovery policy is attached whenever
    /// a retry strategy is configured, regardless of where the options came
    /// from.
    pub async fn boot_queue(
        &self,
        name: &str,
        options: Option<QueueOptions>,
    ) -> Result<Arc<QueueHandle>> {
        if let Some(handle) = self.handles.get(name) {
            return Ok(Arc::clone(handle.value()));
        }

        let mut options = options.unwrap_or_else(|| self.fallback_queue_options());
        if !self.settings.retry_strategy.is_none() && options.stall.is_none() {
            options.stall = Some(StallPolicy::default());
        }

        let queue = self.broker.queue(name, options).await?;
        let entry = self.handles.entry(name.to_string()).or_insert_with(|| {
            Arc::new(QueueHandle {
                name: name.to_string(),
                queue,
            })
        });
        Ok(Arc::clone(entry.value()))
    }

    fn fallback_queue_options(&self) -> QueueOptions {
        QueueOptions {
            prefix: snake_case(&self.settings.group),
            stall: None,
        }
    }

    /// Compute the default job options from configuration.
    ///
    /// `backoff` is present only when a retry strategy other than `none` is
    /// configured.
    pub fn job_options(&self) -> JobOptions {
        let delay = Duration::from_millis(self.settings.retry_delay_ms);
        let backoff = match self.settings.retry_strategy {
            RetryStrategyKind::None => None,
            RetryStrategyKind::Fixed => Some(Backoff::fixed(delay)),
            RetryStrategyKind::Exponential => Some(Backoff::exponential(delay)),
        };

        JobOptions {
            attempts: self.settings.attempts,
            remove_on_complete: self.settings.remove_on_complete,
            remove_on_fail: self.settings.remove_on_fail,
            backoff,
            repeat: None,
        }
    }

    /// Cooperatively drain every registered queue.
    ///
    /// Per queue: log intent, pause, then poll the active-job count on a
    /// fixed interval until it reaches zero. In-flight jobs are never
    /// dropped; a job that never completes blocks this call (job-level
    /// timeouts are the broker's concern).
    pub async fn stop(&self) {
        self.draining.store(true, Ordering::Release);

        let handles: Vec<Arc<QueueHandle>> = self
            .handles
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for handle in handles {
            self.pipeline
                .audit(format!("Stopping queue [{}].", handle.name()))
                .await;

            if let Err(pause_error) = handle.queue().pause().await {
                self.pipeline.capture_error(&pause_error).await;
                continue;
            }

            loop {
                match handle.queue().active_count().await {
                    Ok(0) => break,
                    Ok(_) => sleep(DRAIN_POLL).await,
                    Err(count_error) => {
                        self.pipeline.capture_error(&count_error).await;
                        break;
                    }
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Submits jobs to named queues with computed default options.
pub struct JobDispatcher {
    registry: Arc<QueueRegistry>,
    pipeline: Arc<LogPipeline>,
}

impl JobDispatcher {
    pub fn new(registry: Arc<QueueRegistry>, pipeline: Arc<LogPipeline>) -> Self {
        Self { registry, pipeline }
    }

    /// Pin a target queue for the returned dispatch chain.
    pub fn queue(&self, name: &str) -> BoundQueue<'_> {
        BoundQueue {
            dispatcher: self,
            name: name.to_string(),
        }
    }

    /// Dispatch to the configured default queue with default options.
    pub async fn dispatch(&self, job_name: &str, payload: Value) -> Result<JobId> {
        self.dispatch_to(None, job_name, payload, JobOptionsPatch::default())
            .await
    }

    /// Dispatch to the default queue, merging `patch` over default options.
    pub async fn dispatch_with(
        &self,
        job_name: &str,
        payload: Value,
        patch: JobOptionsPatch,
    ) -> Result<JobId> {
        self.dispatch_to(None, job_name, payload, patch).await
    }

    /// Dispatch a repeatable job; `repeat` encodes the recurrence schedule
    /// the broker applies after each completion.
    pub async fn repeat(
        &self,
        job_name: &str,
        payload: Value,
        repeat: RepeatOptions,
    ) -> Result<JobId> {
        let patch = JobOptionsPatch {
            repeat: Some(repeat),
            ..JobOptionsPatch::default()
        };
        self.dispatch_to(None, job_name, payload, patch).await
    }

    async fn dispatch_to(
        &self,
        queue: Option<&str>,
        job_name: &str,
        payload: Value,
        patch: JobOptionsPatch,
    ) -> Result<JobId> {
        if self.registry.is_draining() {
            return Err(AnthillError::new(
                ErrorCode::QueueDraining,
                "Queues are draining; dispatch rejected",
            ));
        }

        let queue_name = queue
            .map(str::to_string)
            .unwrap_or_else(|| self.registry.default_queue());

        self.pipeline
            .debug(format!(
                "Dispatching job [{job_name}] to queue [{queue_name}]."
            ))
            .await;
        self.pipeline.trace("Job payload:").await;
        self.pipeline
            .trace(LogPayload::Json(payload.clone()))
            .await;

        let options = patch.apply(self.registry.job_options());
        let handle = self.registry.boot_queue(&queue_name, None).await?;
        let job = Job::new(job_name, payload, options);

        match handle.queue().add(job).await {
            Ok(id) => {
                counter!("anthill_jobs_dispatched_total", "queue" => queue_name).increment(1);
                Ok(id)
            }
            Err(dispatch_error) => {
                self.pipeline.capture_error(&dispatch_error).await;
                Err(dispatch_error)
            }
        }
    }
}

/// A dispatcher view pinned to one target queue.
pub struct BoundQueue<'a> {
    dispatcher: &'a JobDispatcher,
    name: String,
}

impl BoundQueue<'_> {
    pub async fn dispatch(&self, job_name: &str, payload: Value) -> Result<JobId> {
        self.dispatcher
            .dispatch_to(Some(&self.name), job_name, payload, JobOptionsPatch::default())
            .await
    }

    pub async fn dispatch_with(
        &self,
        job_name: &str,
        payload: Value,
        patch: JobOptionsPatch,
    ) -> Result<JobId> {
        self.dispatcher
            .dispatch_to(Some(&self.name), job_name, payload, patch)
            .await
    }

    pub async fn repeat(
        &self,
        job_name: &str,
        payload: Value,
        repeat: RepeatOptions,
    ) -> Result<JobId> {
        let patch = JobOptionsPatch {
            repeat: Some(repeat),
            ..JobOptionsPatch::default()
        };
        self.dispatcher
            .dispatch_to(Some(&self.name), job_name, payload, patch)
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{JobHandler, WorkerEvent, WorkerHandle, WorkerOptions};
    use crate::logging::PipelineSettings;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, watch};

    /// Queue fake recording adds/pauses and replaying scripted active counts.
    struct FakeQueue {
        name: String,
        added: parking_lot::Mutex<Vec<Job>>,
        paused: AtomicBool,
        active_counts: parking_lot::Mutex<VecDeque<usize>>,
    }

    impl FakeQueue {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                added: parking_lot::Mutex::new(Vec::new()),
                paused: AtomicBool::new(false),
                active_counts: parking_lot::Mutex::new(VecDeque::new()),
            }
        }
    }

    #[async_trait]
    impl BrokerQueue for FakeQueue {
        fn name(&self) -> &str {
            &self.name
        }

        async fn add(&self, job: Job) -> Result<JobId> {
            let id = job.id;
            self.added.lock().push(job);
            Ok(id)
        }

        async fn pause(&self) -> Result<()> {
            self.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn resume(&self) -> Result<()> {
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn active_count(&self) -> Result<usize> {
            Ok(self.active_counts.lock().pop_front().unwrap_or(0))
        }
    }

    struct CountingBroker {
        created: AtomicUsize,
        queues: DashMap<String, Arc<FakeQueue>>,
        last_options: parking_lot::Mutex<Option<QueueOptions>>,
    }

    impl CountingBroker {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                queues: DashMap::new(),
                last_options: parking_lot::Mutex::new(None),
            }
        }

        fn fake(&self, name: &str) -> Arc<FakeQueue> {
            let entry = self
                .queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(FakeQueue::new(name)));
            Arc::clone(entry.value())
        }
    }

    #[async_trait]
    impl Broker for CountingBroker {
        async fn queue(
            &self,
            name: &str,
            options: QueueOptions,
        ) -> Result<Arc<dyn BrokerQueue>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            *self.last_options.lock() = Some(options);
            Ok(self.fake(name))
        }

        async fn run_worker(
            &self,
            _queue: &str,
            _handler: Arc<dyn JobHandler>,
            _options: WorkerOptions,
            _events: mpsc::Sender<WorkerEvent>,
        ) -> Result<WorkerHandle> {
            let (shutdown, _) = watch::channel(false);
            Ok(WorkerHandle::new(shutdown))
        }
    }

    fn pipeline() -> Arc<LogPipeline> {
        Arc::new(LogPipeline::new(PipelineSettings::default()))
    }

    fn registry_with(
        broker: Arc<CountingBroker>,
        settings: QueueSettings,
    ) -> Arc<QueueRegistry> {
        Arc::new(QueueRegistry::new(broker, settings, pipeline()))
    }

    #[tokio::test]
    async fn test_boot_queue_is_idempotent() {
        let broker = Arc::new(CountingBroker::new());
        let registry = registry_with(Arc::clone(&broker), QueueSettings::default());

        let first = registry.boot_queue("emails", None).await.unwrap();
        let second = registry.boot_queue("emails", None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_options_use_group_prefix() {
        let broker = Arc::new(CountingBroker::new());
        let settings = QueueSettings {
            group: "Acme Corp".to_string(),
            ..QueueSettings::default()
        };
        let registry = registry_with(Arc::clone(&broker), settings);

        registry.boot_queue("emails", None).await.unwrap();

        let options = broker.last_options.lock().clone().unwrap();
        assert_eq!(options.prefix, "acme_corp");
        assert!(options.stall.is_none(), "no retry strategy, no stall policy");
    }

    #[tokio::test]
    async fn test_stall_policy_attached_with_retry_strategy() {
        let broker = Arc::new(CountingBroker::new());
        let settings = QueueSettings {
            retry_strategy: RetryStrategyKind::Fixed,
            ..QueueSettings::default()
        };
        let registry = registry_with(Arc::clone(&broker), settings);

        registry.boot_queue("emails", None).await.unwrap();

        let options = broker.last_options.lock().clone().unwrap();
        let stall = options.stall.expect("stall policy expected");
        assert_eq!(stall.check_interval, Duration::from_millis(1000));
        assert_eq!(stall.max_stalled_count, 10);
    }

    #[tokio::test]
    async fn test_default_job_options_without_retry_strategy() {
        let broker = Arc::new(CountingBroker::new());
        let registry = registry_with(Arc::clone(&broker), QueueSettings::default());
        let dispatcher = JobDispatcher::new(Arc::clone(&registry), pipeline());

        dispatcher.dispatch("x", json!({})).await.unwrap();

        let queue = broker.fake("default");
        let added = queue.added.lock();
        assert_eq!(added.len(), 1);
        let options = &added[0].options;
        assert_eq!(options.attempts, 3);
        assert!(options.backoff.is_none());
        assert!(!options.remove_on_complete);
        assert!(!options.remove_on_fail);
    }

    #[tokio::test]
    async fn test_backoff_present_with_fixed_strategy() {
        let broker = Arc::new(CountingBroker::new());
        let settings = QueueSettings {
            retry_strategy: RetryStrategyKind::Fixed,
            retry_delay_ms: 250,
            ..QueueSettings::default()
        };
        let registry = registry_with(Arc::clone(&broker), settings);
        let dispatcher = JobDispatcher::new(Arc::clone(&registry), pipeline());

        dispatcher.dispatch("x", json!({})).await.unwrap();

        let queue = broker.fake("default");
        let added = queue.added.lock();
        let backoff = added[0].options.backoff.clone().expect("backoff expected");
        assert_eq!(backoff, Backoff::fixed(Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn test_caller_patch_overrides_defaults() {
        let broker = Arc::new(CountingBroker::new());
        let registry = registry_with(Arc::clone(&broker), QueueSettings::default());
        let dispatcher = JobDispatcher::new(Arc::clone(&registry), pipeline());

        let patch = JobOptionsPatch {
            attempts: Some(7),
            remove_on_complete: Some(true),
            ..JobOptionsPatch::default()
        };
        dispatcher.dispatch_with("x", json!({}), patch).await.unwrap();

        let queue = broker.fake("default");
        let added = queue.added.lock();
        assert_eq!(added[0].options.attempts, 7);
        assert!(added[0].options.remove_on_complete);
        assert!(!added[0].options.remove_on_fail);
    }

    #[tokio::test]
    async fn test_bound_queue_targets_named_queue() {
        let broker = Arc::new(CountingBroker::new());
        let registry = registry_with(Arc::clone(&broker), QueueSettings::default());
        let dispatcher = JobDispatcher::new(Arc::clone(&registry), pipeline());

        dispatcher
            .queue("reports")
            .dispatch("monthly", json!({"month": 1}))
            .await
            .unwrap();

        assert_eq!(broker.fake("reports").added.lock().len(), 1);
        assert!(broker.fake("default").added.lock().is_empty());
    }

    #[tokio::test]
    async fn test_repeat_attaches_recurrence() {
        let broker = Arc::new(CountingBroker::new());
        let registry = registry_with(Arc::clone(&broker), QueueSettings::default());
        let dispatcher = JobDispatcher::new(Arc::clone(&registry), pipeline());

        dispatcher
            .repeat(
                "heartbeat",
                json!({}),
                RepeatOptions {
                    every: Duration::from_secs(60),
                    limit: Some(10),
                },
            )
            .await
            .unwrap();

        let queue = broker.fake("default");
        let added = queue.added.lock();
        let repeat = added[0].options.repeat.clone().expect("repeat expected");
        assert_eq!(repeat.every, Duration::from_secs(60));
        assert_eq!(repeat.limit, Some(10));
    }

    #[tokio::test]
    async fn test_stop_pauses_then_polls_until_idle() {
        let broker = Arc::new(CountingBroker::new());
        let registry = registry_with(Arc::clone(&broker), QueueSettings::default());
        let dispatcher = JobDispatcher::new(Arc::clone(&registry), pipeline());

        dispatcher.dispatch("x", json!({})).await.unwrap();
        let queue = broker.fake("default");
        queue
            .active_counts
            .lock()
            .extend([3usize, 2, 1, 0]);

        registry.stop().await;

        assert!(queue.paused.load(Ordering::SeqCst));
        assert!(queue.active_counts.lock().is_empty(), "all polls consumed");

        // New dispatches are rejected once draining.
        let rejected = dispatcher.dispatch("y", json!({})).await;
        assert_eq!(
            rejected.unwrap_err().code(),
            ErrorCode::QueueDraining
        );
    }
}
