//! Scheduler single-flight and counter properties.
//!
//! Tests cover:
//! - Overlapping ticks never start a second execution
//! - Delay/executed counters across skips, successes and failures
//! - The sleeping-handler scenario (handler outlives multiple ticks)
//! - Tick-source start/stop leaving counters untouched

use anthill_core::logging::{LogPipeline, PipelineSettings};
use anthill_core::scheduler::{ManualTickSource, Task, TaskScheduler, TickSource};
use anthill_core::{AnthillError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Harness
// ============================================================================

/// Task whose handler blocks until the test releases it.
struct GatedTask {
    name: String,
    invocations: AtomicUsize,
    gate: Notify,
}

impl GatedTask {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            invocations: AtomicUsize::new(0),
            gate: Notify::new(),
        })
    }

    fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl Task for GatedTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _now: DateTime<Utc>) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        Ok(())
    }
}

fn harness() -> (Arc<ManualTickSource>, TaskScheduler) {
    let ticks = Arc::new(ManualTickSource::new());
    let pipeline = Arc::new(LogPipeline::new(PipelineSettings::default()));
    let scheduler = TaskScheduler::new(Arc::clone(&ticks) as Arc<dyn TickSource>, pipeline);
    (ticks, scheduler)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

// ============================================================================
// Single-flight Properties
// ============================================================================

#[tokio::test]
async fn test_tick_while_running_is_skipped_and_counted() {
    let (ticks, scheduler) = harness();
    let task = GatedTask::new("daily");
    scheduler.schedule(Arc::clone(&task) as Arc<dyn Task>).unwrap();

    ticks.fire_now();
    wait_for(|| task.invocations() == 1).await;
    assert!(scheduler.snapshot("daily").unwrap().is_running);

    // A tick during execution must not start a second invocation.
    ticks.fire_now();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(task.invocations(), 1);

    let snapshot = scheduler.snapshot("daily").unwrap();
    assert!(snapshot.is_running);
    assert_eq!(snapshot.delayed_times, 1);
    assert_eq!(snapshot.executed_times, 0);

    task.release();
    wait_for(|| {
        scheduler
            .snapshot("daily")
            .map(|s| !s.is_running)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_successful_completion_updates_counters() {
    let (ticks, scheduler) = harness();
    let task = GatedTask::new("hourly");
    scheduler.schedule(Arc::clone(&task) as Arc<dyn Task>).unwrap();

    ticks.fire_now();
    wait_for(|| task.invocations() == 1).await;
    task.release();

    wait_for(|| {
        scheduler
            .snapshot("hourly")
            .map(|s| !s.is_running)
            .unwrap_or(false)
    })
    .await;

    let snapshot = scheduler.snapshot("hourly").unwrap();
    assert_eq!(snapshot.executed_times, 1);
    assert_eq!(snapshot.delayed_times, 0);
}

#[tokio::test]
async fn test_sleeping_handler_over_three_ticks() {
    let (ticks, scheduler) = harness();
    let task = GatedTask::new("daily");
    scheduler.schedule(Arc::clone(&task) as Arc<dyn Task>).unwrap();

    // Tick 1 starts the handler, which sleeps across the next two ticks.
    ticks.fire_now();
    wait_for(|| task.invocations() == 1).await;

    // Ticks 2 and 3 are skipped.
    ticks.fire_now();
    ticks.fire_now();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(task.invocations(), 1);
    let during = scheduler.snapshot("daily").unwrap();
    assert_eq!(during.delayed_times, 2);
    assert_eq!(during.executed_times, 0);

    task.release();
    wait_for(|| {
        scheduler
            .snapshot("daily")
            .map(|s| !s.is_running)
            .unwrap_or(false)
    })
    .await;

    // After settling, executed and delayed are mutually exclusive.
    let after = scheduler.snapshot("daily").unwrap();
    assert_eq!(after.executed_times, 1);
    assert_eq!(after.delayed_times, 0);
    assert!(!(after.executed_times > 0 && after.delayed_times > 0));
}

#[tokio::test]
async fn test_consecutive_runs_accumulate_executions() {
    let (ticks, scheduler) = harness();
    let task = GatedTask::new("minutely");
    scheduler.schedule(Arc::clone(&task) as Arc<dyn Task>).unwrap();

    for expected in 1..=3usize {
        ticks.fire_now();
        wait_for(|| task.invocations() == expected).await;
        task.release();
        wait_for(|| {
            scheduler
                .snapshot("minutely")
                .map(|s| !s.is_running && s.executed_times == expected as u32)
                .unwrap_or(false)
        })
        .await;
    }

    let snapshot = scheduler.snapshot("minutely").unwrap();
    assert_eq!(snapshot.executed_times, 3);
    assert_eq!(snapshot.delayed_times, 0);
}

// ============================================================================
// Failure Handling
// ============================================================================

struct FlakyTask {
    runs: AtomicUsize,
    failures_seen: AtomicUsize,
}

#[async_trait]
impl Task for FlakyTask {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn run(&self, _now: DateTime<Utc>) -> Result<()> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        if run % 2 == 0 {
            Err(AnthillError::new(
                anthill_core::ErrorCode::TaskFailed,
                "intermittent",
            ))
        } else {
            Ok(())
        }
    }

    async fn on_failed(&self, _error: &AnthillError) {
        self.failures_seen.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_failure_resets_executed_then_success_rebuilds() {
    let (ticks, scheduler) = harness();
    let task = Arc::new(FlakyTask {
        runs: AtomicUsize::new(0),
        failures_seen: AtomicUsize::new(0),
    });
    scheduler.schedule(Arc::clone(&task) as Arc<dyn Task>).unwrap();

    // First tick fails.
    ticks.fire_now();
    wait_for(|| task.failures_seen.load(Ordering::SeqCst) == 1).await;
    let after_failure = scheduler.snapshot("flaky").unwrap();
    assert_eq!(after_failure.executed_times, 0);
    assert_eq!(after_failure.delayed_times, 0);
    assert!(!after_failure.is_running);

    // Second tick succeeds; the schedule survived the failure.
    ticks.fire_now();
    wait_for(|| {
        scheduler
            .snapshot("flaky")
            .map(|s| s.executed_times == 1)
            .unwrap_or(false)
    })
    .await;
}

// ============================================================================
// Tick Control
// ============================================================================

#[tokio::test]
async fn test_stopped_task_keeps_counters_until_restarted() {
    let (ticks, scheduler) = harness();
    let task = GatedTask::new("controlled");
    scheduler.schedule(Arc::clone(&task) as Arc<dyn Task>).unwrap();

    ticks.fire_now();
    wait_for(|| task.invocations() == 1).await;
    task.release();
    wait_for(|| {
        scheduler
            .snapshot("controlled")
            .map(|s| s.executed_times == 1)
            .unwrap_or(false)
    })
    .await;

    assert!(scheduler.stop("controlled"));
    ticks.fire_now();
    ticks.fire_now();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let stopped = scheduler.snapshot("controlled").unwrap();
    assert_eq!(task.invocations(), 1);
    assert_eq!(stopped.executed_times, 1);
    assert_eq!(stopped.delayed_times, 0);

    assert!(scheduler.start("controlled"));
    ticks.fire_now();
    wait_for(|| task.invocations() == 2).await;
    task.release();
    wait_for(|| {
        scheduler
            .snapshot("controlled")
            .map(|s| s.executed_times == 2)
            .unwrap_or(false)
    })
    .await;
}
