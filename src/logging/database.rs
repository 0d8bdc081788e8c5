//! Database log sink with bounded-retry backpressure.
//!
//! The sink buffers entries in a small FIFO and retries failed saves only
//! within a fixed grace window measured from construction. Once the window
//! has passed, a persistently failing store permanently disables the sink
//! for the process lifetime instead of growing its backlog or blocking the
//! caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::config::LogSettings;
use crate::error::{AnthillError, ErrorCode, Result};
use crate::logging::{LogRecord, LogSink};

// ═══════════════════════════════════════════════════════════════════════════════
// Store Collaborator
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted log entity.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub message: String,
    pub level: String,
    pub logged_at: DateTime<Utc>,
}

impl From<&LogRecord> for LogEntry {
    fn from(record: &LogRecord) -> Self {
        Self {
            message: record.message.clone(),
            level: record.level.label().to_string(),
            logged_at: record.timestamp,
        }
    }
}

/// Persistence collaborator for the database sink.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn save(&self, entry: &LogEntry) -> Result<()>;
}

/// Postgres-backed [`LogStore`] writing one row per entry.
pub struct PostgresLogStore {
    pool: sqlx::PgPool,
    table: String,
}

impl PostgresLogStore {
    /// Wrap an existing pool. The table name must be a plain identifier.
    pub fn new(pool: sqlx::PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(AnthillError::with_internal(
                ErrorCode::InvalidConfiguration,
                "Invalid log table name",
                table,
            ));
        }
        Ok(Self { pool, table })
    }

    /// Connect a fresh pool from a database URL.
    pub async fn connect(url: &str, table: impl Into<String>) -> Result<Self> {
        let pool = sqlx::PgPool::connect(url).await?;
        Self::new(pool, table)
    }
}

#[async_trait]
impl LogStore for PostgresLogStore {
    async fn save(&self, entry: &LogEntry) -> Result<()> {
        let statement = format!(
            "INSERT INTO {} (message, log_level, logged_at) VALUES ($1, $2, $3)",
            self.table
        );
        sqlx::query(&statement)
            .bind(&entry.message)
            .bind(&entry.level)
            .bind(entry.logged_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Database Sink
// ═══════════════════════════════════════════════════════════════════════════════

/// Log sink persisting entries through a [`LogStore`], with a retry-then-
/// disable policy bounded by a monotonic deadline.
pub struct DatabaseSink {
    store: Arc<dyn LogStore>,
    pending: Mutex<VecDeque<LogEntry>>,
    started: Instant,
    retry_window: Duration,
    max_pending: usize,
    running: AtomicBool,
}

impl DatabaseSink {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(VecDeque::new()),
            started: Instant::now(),
            retry_window: Duration::from_millis(5000),
            max_pending: 1024,
            running: AtomicBool::new(true),
        }
    }

    pub fn from_settings(store: Arc<dyn LogStore>, settings: &LogSettings) -> Self {
        Self::new(store)
            .with_retry_window(Duration::from_millis(settings.db_retry_window_ms))
            .with_max_pending(settings.db_max_pending)
    }

    /// Override the grace window measured from construction.
    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = window;
        self
    }

    /// Override the pending-entry cap.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    /// Whether the sink is still persisting entries.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn deadline_passed(&self) -> bool {
        self.started.elapsed() >= self.retry_window
    }

    /// Persist pending entries oldest-first.
    ///
    /// On a save failure before the deadline the entry goes back to the head
    /// of the queue and the pass stops; the next `log` call retries. Past the
    /// deadline the sink disables itself and abandons the backlog.
    async fn flush(&self) -> Result<()> {
        loop {
            let entry = {
                let mut pending = self.pending.lock().await;
                match pending.pop_front() {
                    Some(entry) => entry,
                    None => return Ok(()),
                }
            };

            match self.store.save(&entry).await {
                Ok(()) => continue,
                Err(save_error) => {
                    if self.deadline_passed() {
                        self.running.store(false, Ordering::Release);
                        let abandoned = {
                            let mut pending = self.pending.lock().await;
                            let count = pending.len() + 1;
                            pending.clear();
                            count
                        };
                        counter!("anthill_log_db_abandoned_total").increment(abandoned as u64);
                        error!(
                            error = %save_error,
                            abandoned,
                            "database log sink disabled after exhausting its retry window"
                        );
                        return Err(AnthillError::with_internal(
                            ErrorCode::SinkDisabled,
                            "Database log sink disabled",
                            save_error.to_string(),
                        ));
                    }

                    self.pending.lock().await.push_front(entry);
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl LogSink for DatabaseSink {
    fn name(&self) -> &str {
        "database"
    }

    async fn log(&self, record: &LogRecord) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        {
            let mut pending = self.pending.lock().await;
            if pending.len() >= self.max_pending {
                pending.pop_front();
                counter!("anthill_log_db_dropped_total").increment(1);
                warn!(cap = self.max_pending, "database log backlog full, dropped oldest entry");
            }
            pending.push_back(LogEntry::from(record));
        }

        self.flush().await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
