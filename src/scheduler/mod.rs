//! Cron-driven task scheduling with single-flight execution.
//!
//! Each named task is bound to a tick stream from a [`TickSource`]. A tick
//! arriving while the task is idle starts one execution; a tick arriving
//! while it is running is counted as a delay and skipped, so a given task
//! never runs concurrently with itself. Handler failures are caught, logged
//! and never propagate to the tick source, so a failing task keeps its
//! schedule.

pub mod tick;

pub use tick::{CronTickSource, ManualTickSource, TickCallback, TickHandle, TickSource};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{AnthillError, Result};
use crate::logging::LogPipeline;

// ═══════════════════════════════════════════════════════════════════════════════
// Task Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A scheduled task.
///
/// `name` is the unique key for the task's tick handle and counters;
/// `cron_expression` defaults to every second. Hooks default to no-ops.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Explicit unique task identifier.
    fn name(&self) -> &str;

    /// Cron expression with a leading seconds column.
    fn cron_expression(&self) -> &str {
        "* * * * * *"
    }

    /// One execution of the task.
    async fn run(&self, now: DateTime<Utc>) -> Result<()>;

    async fn on_completed(&self) {}

    async fn on_failed(&self, _error: &AnthillError) {}
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task State
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-task execution state.
///
/// `running` is the single-flight guard: set when an execution starts and
/// cleared only when the handler settles, success or failure.
#[derive(Debug, Default)]
struct TaskState {
    running: AtomicBool,
    delayed_times: AtomicU32,
    executed_times: AtomicU32,
}

/// Point-in-time view of a task's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub is_running: bool,
    pub delayed_times: u32,
    pub executed_times: u32,
}

struct ScheduledEntry {
    handle: Box<dyn TickHandle>,
    state: Arc<TaskState>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Binds tasks to cron ticks and enforces at-most-one execution per task.
pub struct TaskScheduler {
    ticks: Arc<dyn TickSource>,
    pipeline: Arc<LogPipeline>,
    entries: DashMap<String, ScheduledEntry>,
}

impl TaskScheduler {
    pub fn new(ticks: Arc<dyn TickSource>, pipeline: Arc<LogPipeline>) -> Self {
        Self {
            ticks,
            pipeline,
            entries: DashMap::new(),
        }
    }

    /// Register a task with the tick source, keyed by its name.
    ///
    /// Re-scheduling an existing name replaces the previous registration and
    /// resets its counters.
    pub fn schedule(&self, task: Arc<dyn Task>) -> Result<()> {
        let name = task.name().to_string();
        let id = self.entries.len() + 1;
        let state = Arc::new(TaskState::default());

        let callback: TickCallback = {
            let task = Arc::clone(&task);
            let state = Arc::clone(&state);
            let pipeline = Arc::clone(&self.pipeline);
            Arc::new(move |now| {
                on_tick(
                    Arc::clone(&task),
                    Arc::clone(&state),
                    Arc::clone(&pipeline),
                    id,
                    now,
                );
            })
        };

        let handle = self.ticks.schedule(task.cron_expression(), callback)?;
        self.entries.insert(name, ScheduledEntry { handle, state });
        Ok(())
    }

    /// Stop delivering ticks to a task without altering its counters.
    pub fn stop(&self, name: &str) -> bool {
        match self.entries.get(name) {
            Some(entry) => {
                entry.handle.stop();
                true
            }
            None => false,
        }
    }

    /// Resume delivering ticks to a stopped task.
    pub fn start(&self, name: &str) -> bool {
        match self.entries.get(name) {
            Some(entry) => {
                entry.handle.start();
                true
            }
            None => false,
        }
    }

    /// Current counters for a task.
    pub fn snapshot(&self, name: &str) -> Option<TaskSnapshot> {
        self.entries.get(name).map(|entry| TaskSnapshot {
            is_running: entry.state.running.load(Ordering::Acquire),
            delayed_times: entry.state.delayed_times.load(Ordering::Acquire),
            executed_times: entry.state.executed_times.load(Ordering::Acquire),
        })
    }
}

/// One tick: run the handler if the task is idle, otherwise count the delay.
fn on_tick(
    task: Arc<dyn Task>,
    state: Arc<TaskState>,
    pipeline: Arc<LogPipeline>,
    id: usize,
    now: DateTime<Utc>,
) {
    let became_runner = state
        .running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();

    if !became_runner {
        let delayed = state.delayed_times.fetch_add(1, Ordering::AcqRel) + 1;
        state.executed_times.store(0, Ordering::Release);
        counter!("anthill_task_overlaps_total", "task" => task.name().to_string()).increment(1);

        tokio::spawn(async move {
            pipeline
                .audit(format!(
                    "Waiting for task [{}(#{id})] to complete; delayed {delayed} time(s).",
                    task.name()
                ))
                .await;
        });
        return;
    }

    counter!("anthill_task_runs_total", "task" => task.name().to_string()).increment(1);

    tokio::spawn(async move {
        pipeline
            .audit(format!(
                "Running task [{}(#{id})] at {}.",
                task.name(),
                now.format("%Y-%m-%dT%H:%M:%S%.3f")
            ))
            .await;

        // The handler runs in its own task so a panic settles as a failure
        // instead of poisoning the guard.
        let run = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.run(now).await })
        };

        let outcome = match run.await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(AnthillError::with_internal(
                crate::error::ErrorCode::TaskFailed,
                "Task handler panicked",
                join_error.to_string(),
            )),
        };

        match outcome {
            Ok(()) => {
                state.executed_times.fetch_add(1, Ordering::AcqRel);
                state.delayed_times.store(0, Ordering::Release);
                state.running.store(false, Ordering::Release);
                task.on_completed().await;
            }
            Err(task_error) => {
                state.executed_times.store(0, Ordering::Release);
                state.delayed_times.store(0, Ordering::Release);
                state.running.store(false, Ordering::Release);
                pipeline.capture_error(&task_error).await;
                task.on_failed(&task_error).await;
            }
        }
    });
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
