//! Worker binding and lifecycle callbacks.
//!
//! A [`Worker`] supplies an explicit name, a handler, and optional lifecycle
//! hooks (all defaulting to no-ops). [`WorkerRunner`] binds one independent
//! broker puller per configured concurrency slot and owns the structured
//! logging around every lifecycle event, so user hooks observe without being
//! able to drop the operational log trail.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::broker::{Job, JobContext, JobHandler, WorkerEvent, WorkerHandle, WorkerOptions};
use crate::error::{AnthillError, Result};
use crate::jobs::dispatcher::QueueRegistry;
use crate::logging::{LogPayload, LogPipeline};

/// Events buffered per slot before the event loop applies backpressure.
const EVENT_BUFFER: usize = 64;

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A queue consumer.
///
/// Override only what you need: `name` and `handle` are required, everything
/// else has a sensible default. Hooks are observational; retry flow is
/// governed solely by the job's options.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Explicit worker identifier used in log correlation.
    fn name(&self) -> &str;

    /// Queue this worker consumes; defaults to the configured default queue.
    fn queue_name(&self) -> Option<&str> {
        None
    }

    /// Concurrency slots for this worker; defaults to the configured value.
    fn concurrency(&self) -> Option<usize> {
        None
    }

    /// Process one job, optionally returning a value for observability.
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<Value>;

    async fn on_completed(&self, _job: &Job, _return_value: &Value) {}

    async fn on_progress(&self, _job: &Job, _progress: &Value) {}

    async fn on_failed(&self, _job: &Job, _error: &AnthillError) {}

    async fn on_drained(&self) {}

    async fn on_error(&self, _error: &AnthillError) {}
}

/// Adapts a [`Worker`] to the broker's [`JobHandler`] seam.
struct HandlerAdapter {
    worker: Arc<dyn Worker>,
}

#[async_trait]
impl JobHandler for HandlerAdapter {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<Value> {
        self.worker.handle(job, ctx).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Runner
// ═══════════════════════════════════════════════════════════════════════════════

/// A bound worker: one broker puller and one event loop per slot.
pub struct WorkerBinding {
    worker_name: String,
    queue_name: String,
    slots: Vec<WorkerHandle>,
    event_loops: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerBinding {
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Signal every slot to stop after its current job.
    pub fn shutdown(&self) {
        for slot in &self.slots {
            slot.shutdown();
        }
    }
}

impl Drop for WorkerBinding {
    fn drop(&mut self) {
        self.shutdown();
        for task in &self.event_loops {
            task.abort();
        }
    }
}

/// Binds workers to their queues through the registry's broker.
pub struct WorkerRunner {
    registry: Arc<QueueRegistry>,
    pipeline: Arc<LogPipeline>,
}

impl WorkerRunner {
    pub fn new(registry: Arc<QueueRegistry>, pipeline: Arc<LogPipeline>) -> Self {
        Self { registry, pipeline }
    }

    /// Bind `worker` with its configured concurrency and default puller
    /// options.
    pub async fn run(&self, worker: Arc<dyn Worker>) -> Result<WorkerBinding> {
        self.run_with(worker, WorkerOptions::default()).await
    }

    /// Bind `worker`, overriding the per-slot puller options.
    ///
    /// Each slot (ordinal ids 1..N) is an independent concurrent puller; the
    /// id exists purely for log correlation, all slots compete for the same
    /// queue.
    pub async fn run_with(
        &self,
        worker: Arc<dyn Worker>,
        options: WorkerOptions,
    ) -> Result<WorkerBinding> {
        let queue_name = worker
            .queue_name()
            .map(str::to_string)
            .unwrap_or_else(|| self.registry.default_queue());

        self.registry.boot_queue(&queue_name, None).await?;

        let concurrency = worker
            .concurrency()
            .unwrap_or(self.registry.settings().concurrency)
            .max(1);
        let broker = self.registry.broker();

        let mut slots = Vec::with_capacity(concurrency);
        let mut event_loops = Vec::with_capacity(concurrency);

        for slot_id in 1..=concurrency {
            let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
            let handler = Arc::new(HandlerAdapter {
                worker: Arc::clone(&worker),
            });

            let handle = broker
                .run_worker(&queue_name, handler, options.clone(), events_tx)
                .await?;
            slots.push(handle);

            event_loops.push(tokio::spawn(event_loop(
                Arc::clone(&worker),
                Arc::clone(&self.pipeline),
                queue_name.clone(),
                slot_id,
                events_rx,
            )));
        }

        self.pipeline
            .debug(format!(
                "Worker [{}] bound to queue [{}] with {} slot(s).",
                worker.name(),
                queue_name,
                concurrency
            ))
            .await;

        Ok(WorkerBinding {
            worker_name: worker.name().to_string(),
            queue_name,
            slots,
            event_loops,
        })
    }
}

/// Per-slot event loop: structured logging first, then the user hook.
/// Nothing in here propagates.
async fn event_loop(
    worker: Arc<dyn Worker>,
    pipeline: Arc<LogPipeline>,
    queue: String,
    slot_id: usize,
    mut events: mpsc::Receiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Completed { job, return_value } => {
                pipeline
                    .debug(format!(
                        "Job [{}(#{})] successfully completed on [{}(#{}):{}].",
                        job.name,
                        job.id,
                        worker.name(),
                        slot_id,
                        queue
                    ))
                    .await;
                pipeline.trace("Worker return:").await;
                pipeline.trace(LogPayload::Json(return_value.clone())).await;
                worker.on_completed(&job, &return_value).await;
            }
            WorkerEvent::Progress { job, progress } => {
                pipeline
                    .debug(format!(
                        "Job [{}(#{})] reported progress on [{}(#{}):{}].",
                        job.name,
                        job.id,
                        worker.name(),
                        slot_id,
                        queue
                    ))
                    .await;
                pipeline.trace(LogPayload::Json(progress.clone())).await;
                worker.on_progress(&job, &progress).await;
            }
            WorkerEvent::Failed { job, error } => {
                pipeline
                    .error(format!(
                        "Job [{}(#{})] failed on [{}(#{}):{}].",
                        job.name,
                        job.id,
                        worker.name(),
                        slot_id,
                        queue
                    ))
                    .await;
                pipeline.capture_error(&error).await;
                pipeline.trace(LogPayload::json(&job)).await;
                worker.on_failed(&job, &error).await;
            }
            WorkerEvent::Drained => {
                pipeline
                    .audit(format!(
                        "Worker [{}(#{}):{}] is empty.",
                        worker.name(),
                        slot_id,
                        queue
                    ))
                    .await;
                worker.on_drained().await;
            }
            WorkerEvent::Error { error } => {
                pipeline.capture_error(&error).await;
                worker.on_error(&error).await;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
