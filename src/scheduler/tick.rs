//! Cron tick sources.
//!
//! The scheduler consumes tick timing from an external primitive behind
//! [`TickSource`]; only the execution-guarding layer above it is part of
//! this crate. [`CronTickSource`] drives ticks from cron expressions,
//! [`ManualTickSource`] fires on demand for deterministic tests.

use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{AnthillError, ErrorCode, Result};

/// Callback invoked at each tick with the fire time.
pub type TickCallback = Arc<dyn Fn(DateTime<Utc>) + Send + Sync>;

/// Control handle for one scheduled tick stream.
pub trait TickHandle: Send + Sync {
    /// Resume delivering ticks.
    fn start(&self);

    /// Stop delivering ticks; the schedule itself stays registered.
    fn stop(&self);

    /// Whether ticks are currently delivered.
    fn is_active(&self) -> bool;
}

/// External source of cron-driven ticks.
pub trait TickSource: Send + Sync {
    /// Register `callback` to fire per the cron `expression`.
    ///
    /// Expressions use the 6/7-field form with a leading seconds column,
    /// e.g. `"0 30 9 * * *"` for 09:30:00 daily.
    fn schedule(&self, expression: &str, callback: TickCallback) -> Result<Box<dyn TickHandle>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cron-driven Source
// ═══════════════════════════════════════════════════════════════════════════════

struct CronHandle {
    active: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl TickHandle for CronHandle {
    fn start(&self) {
        self.active.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for CronHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Tick source computing fire times from cron expressions.
#[derive(Debug, Default, Clone, Copy)]
pub struct CronTickSource;

impl CronTickSource {
    pub fn new() -> Self {
        Self
    }
}

impl TickSource for CronTickSource {
    fn schedule(&self, expression: &str, callback: TickCallback) -> Result<Box<dyn TickHandle>> {
        let schedule = cron::Schedule::from_str(expression).map_err(|parse_error| {
            AnthillError::with_internal(
                ErrorCode::InvalidCronExpression,
                "Invalid cron expression",
                format!("{expression}: {parse_error}"),
            )
        })?;

        let active = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(cron_loop(schedule, callback, Arc::clone(&active)));

        Ok(Box::new(CronHandle { active, task }))
    }
}

async fn cron_loop(schedule: cron::Schedule, callback: TickCallback, active: Arc<AtomicBool>) {
    loop {
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            // The schedule has no future fire times.
            return;
        };

        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        sleep(wait).await;

        // A stopped handle skips ticks without losing its schedule.
        if active.load(Ordering::Acquire) {
            callback(Utc::now());
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Manual Source
// ═══════════════════════════════════════════════════════════════════════════════

struct ManualEntry {
    callback: TickCallback,
    active: Arc<AtomicBool>,
}

struct ManualHandle {
    active: Arc<AtomicBool>,
}

impl TickHandle for ManualHandle {
    fn start(&self) {
        self.active.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Tick source fired explicitly by the caller; for tests and tooling.
#[derive(Default)]
pub struct ManualTickSource {
    entries: parking_lot::Mutex<Vec<ManualEntry>>,
}

impl ManualTickSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire one tick at `now` into every active registration.
    pub fn fire(&self, now: DateTime<Utc>) {
        let callbacks: Vec<TickCallback> = self
            .entries
            .lock()
            .iter()
            .filter(|entry| entry.active.load(Ordering::Acquire))
            .map(|entry| Arc::clone(&entry.callback))
            .collect();

        for callback in callbacks {
            callback(now);
        }
    }

    /// Fire one tick stamped with the current time.
    pub fn fire_now(&self) {
        self.fire(Utc::now());
    }
}

impl TickSource for ManualTickSource {
    fn schedule(&self, _expression: &str, callback: TickCallback) -> Result<Box<dyn TickHandle>> {
        let active = Arc::new(AtomicBool::new(true));
        self.entries.lock().push(ManualEntry {
            callback,
            active: Arc::clone(&active),
        });
        Ok(Box::new(ManualHandle { active }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
