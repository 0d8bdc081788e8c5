//! Buffered, multi-sink logging pipeline.
//!
//! This module decouples log production from delivery:
//!
//! - **LogRecord**: timestamped, leveled, immutable once enqueued
//! - **LogPipeline**: owns the pending-record buffer, a registry of
//!   (sink, enabled) pairs, and the single global level threshold
//! - **Sinks**: console / file / database destinations behind [`LogSink`]
//!
//! Records are buffered until the pipeline is marked ready, then drained in
//! strict FIFO order, fanning each record out to every enabled sink. A sink
//! failure is isolated: it is reported and the drain continues.

pub mod database;
pub mod sink;

pub use database::{DatabaseSink, LogEntry, LogStore, PostgresLogStore};
pub use sink::{ConsoleSink, FileSink, LogSink};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::error;

use crate::config::Config;
use crate::error::AnthillError;

// ═══════════════════════════════════════════════════════════════════════════════
// Log Levels
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered log levels; a lower number is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Fatal = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
    Audit = 6,
}

impl LogLevel {
    /// Numeric level used for the threshold comparison.
    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Upper-case label used in rendered log lines.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
            Self::Audit => "AUDIT",
        }
    }

    /// Levels routed to stderr by the console sink.
    pub const fn is_severe(&self) -> bool {
        matches!(self, Self::Fatal | Self::Error | Self::Warn)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Payloads and Records
// ═══════════════════════════════════════════════════════════════════════════════

/// A log payload: either plain text or a structured JSON value.
///
/// JSON payloads are serialized at the call site; `Json(Value::Null)` is the
/// "nothing to log" case and produces no record.
#[derive(Debug, Clone)]
pub enum LogPayload {
    Text(String),
    Json(serde_json::Value),
}

impl LogPayload {
    /// Build a JSON payload from any serializable value.
    pub fn json(value: impl Serialize) -> Self {
        Self::Json(serde_json::to_value(value).unwrap_or(serde_json::Value::Null))
    }

    /// Render the payload to the message string, or `None` for empty payloads.
    fn render(&self, pretty: bool) -> Option<String> {
        match self {
            Self::Text(text) => Some(text.clone()),
            Self::Json(serde_json::Value::Null) => None,
            Self::Json(value) if pretty => Some(format!("{value:#}")),
            Self::Json(value) => Some(value.to_string()),
        }
    }
}

impl From<&str> for LogPayload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for LogPayload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<serde_json::Value> for LogPayload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// A buffered log record, immutable once enqueued.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// When the record was created
    pub timestamp: DateTime<Utc>,
    /// Record level
    pub level: LogLevel,
    /// Rendered message
    pub message: String,
}

impl LogRecord {
    /// ISO-8601 timestamp with millisecond precision.
    pub fn formatted_timestamp(&self) -> String {
        self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
    }

    /// Canonical single-line rendering shared by the console and file sinks.
    pub fn line(&self) -> String {
        format!(
            "[{}] | {:<5} | {}",
            self.formatted_timestamp(),
            self.level.label(),
            self.message
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════════════

/// Pipeline settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Maximum level number that is recorded
    pub threshold: u8,
    /// Pretty-print JSON payloads (development mode)
    pub pretty_payloads: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            threshold: config.log.threshold,
            pretty_payloads: config.environment.is_development(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            threshold: 3,
            pretty_payloads: true,
        }
    }
}

/// A registered sink and its enabled flag.
///
/// Disabled sinks are skipped during drain but stay registered so an
/// operator can toggle them back on.
struct SinkRegistration {
    sink: Arc<dyn LogSink>,
    enabled: bool,
}

/// The buffered multi-sink logging pipeline.
///
/// Construct once at the composition root and share via `Arc`; every
/// component that emits operational log lines takes a handle.
pub struct LogPipeline {
    settings: PipelineSettings,
    buffer: Mutex<VecDeque<LogRecord>>,
    sinks: RwLock<Vec<SinkRegistration>>,
    ready: AtomicBool,
    // Serializes drain passes so records stay strictly FIFO across sinks.
    drain_gate: Mutex<()>,
}

impl LogPipeline {
    /// Create a pipeline with the given settings and no sinks.
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            buffer: Mutex::new(VecDeque::new()),
            sinks: RwLock::new(Vec::new()),
            ready: AtomicBool::new(false),
            drain_gate: Mutex::new(()),
        }
    }

    /// Register a sink. Multiple sinks run independently.
    pub async fn push_driver(&self, sink: Arc<dyn LogSink>, enabled: bool) {
        self.sinks.write().await.push(SinkRegistration { sink, enabled });
    }

    /// Toggle a registered sink by name. Returns false if no sink matched.
    pub async fn set_sink_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut sinks = self.sinks.write().await;
        let mut found = false;
        for registration in sinks.iter_mut() {
            if registration.sink.name() == name {
                registration.enabled = enabled;
                found = true;
            }
        }
        found
    }

    /// Open the drain gate and flush anything buffered so far.
    pub async fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
        self.drain().await;
    }

    /// Whether the drain gate is open.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Number of records waiting to be drained.
    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Record a payload at the given level and trigger a drain attempt.
    ///
    /// Empty payloads and records past the configured threshold are dropped
    /// without being enqueued.
    pub async fn log(&self, level: LogLevel, payload: impl Into<LogPayload>) {
        let Some(message) = payload.into().render(self.settings.pretty_payloads) else {
            return;
        };

        if self.settings.threshold < level.as_u8() {
            return;
        }

        let record = LogRecord {
            timestamp: Utc::now(),
            level,
            message,
        };

        counter!("anthill_log_records_total", "level" => level.label()).increment(1);
        self.buffer.lock().await.push_back(record);
        self.drain().await;
    }

    /// Drain buffered records in FIFO order to every enabled sink.
    ///
    /// The enabled-sink set is snapshotted per record; a sink enabled after a
    /// record was popped does not retroactively receive it. Sink failures are
    /// reported and never abort the pass.
    async fn drain(&self) {
        let _pass = self.drain_gate.lock().await;

        loop {
            if !self.is_ready() {
                return;
            }

            let record = match self.buffer.lock().await.pop_front() {
                Some(record) => record,
                None => return,
            };

            let targets: Vec<Arc<dyn LogSink>> = self
                .sinks
                .read()
                .await
                .iter()
                .filter(|registration| registration.enabled)
                .map(|registration| Arc::clone(&registration.sink))
                .collect();

            for sink in targets {
                if let Err(sink_error) = sink.log(&record).await {
                    // Reported through internal diagnostics rather than the
                    // pipeline itself: a failing sink must not generate new
                    // records for itself to fail on.
                    counter!("anthill_log_delivery_failures_total", "sink" => sink.name().to_string())
                        .increment(1);
                    error!(sink = sink.name(), error = %sink_error, "log sink delivery failed");
                }
            }
        }
    }

    /// Fan `clear` out to every registered sink.
    pub async fn clear(&self) {
        for registration in self.sinks.read().await.iter() {
            registration.sink.clear();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Level helpers
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn fatal(&self, payload: impl Into<LogPayload>) {
        self.log(LogLevel::Fatal, payload).await;
    }

    pub async fn error(&self, payload: impl Into<LogPayload>) {
        self.log(LogLevel::Error, payload).await;
    }

    pub async fn warn(&self, payload: impl Into<LogPayload>) {
        self.log(LogLevel::Warn, payload).await;
    }

    pub async fn info(&self, payload: impl Into<LogPayload>) {
        self.log(LogLevel::Info, payload).await;
    }

    pub async fn debug(&self, payload: impl Into<LogPayload>) {
        self.log(LogLevel::Debug, payload).await;
    }

    pub async fn trace(&self, payload: impl Into<LogPayload>) {
        self.log(LogLevel::Trace, payload).await;
    }

    pub async fn audit(&self, payload: impl Into<LogPayload>) {
        self.log(LogLevel::Audit, payload).await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shared error utility
    // ─────────────────────────────────────────────────────────────────────────

    /// Log a caught error: message at error level, the source chain after it,
    /// and a full debug dump in development mode.
    pub async fn capture_error(&self, error: &AnthillError) {
        self.error(error.to_string()).await;

        let mut causes = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            causes.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        for message in causes {
            self.error(message).await;
        }

        if self.settings.pretty_payloads {
            self.debug(format!("{error:#?}")).await;
        }
    }

    /// Log an unrecoverable error and terminate the process with a non-zero
    /// status. This never returns.
    ///
    /// Reserved for composition roots handling fatal-class errors (broker
    /// connection loss); library callbacks never call this.
    pub async fn fatal_shutdown(&self, error: &AnthillError) {
        self.capture_error(error).await;
        self.fatal("An unrecoverable error has occurred. Shutting down.")
            .await;
        std::process::exit(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, Result};
    use async_trait::async_trait;
    use serde_json::json;

    /// Sink that appends (sink name, message) pairs to a shared journal.
    struct RecordingSink {
        id: &'static str,
        journal: Arc<parking_lot::Mutex<Vec<(String, String)>>>,
        fail: bool,
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        fn name(&self) -> &str {
            self.id
        }

        async fn log(&self, record: &LogRecord) -> Result<()> {
            if self.fail {
                return Err(AnthillError::new(ErrorCode::SinkWriteFailed, "forced"));
            }
            self.journal
                .lock()
                .push((self.id.to_string(), record.message.clone()));
            Ok(())
        }
    }

    fn recording_pair() -> (
        Arc<parking_lot::Mutex<Vec<(String, String)>>>,
        Arc<RecordingSink>,
        Arc<RecordingSink>,
    ) {
        let journal = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s1 = Arc::new(RecordingSink {
            id: "s1",
            journal: Arc::clone(&journal),
            fail: false,
        });
        let s2 = Arc::new(RecordingSink {
            id: "s2",
            journal: Arc::clone(&journal),
            fail: false,
        });
        (journal, s1, s2)
    }

    fn pipeline(threshold: u8, pretty: bool) -> LogPipeline {
        LogPipeline::new(PipelineSettings {
            threshold,
            pretty_payloads: pretty,
        })
    }

    #[test]
    fn test_level_numbers_and_labels() {
        assert_eq!(LogLevel::Fatal.as_u8(), 0);
        assert_eq!(LogLevel::Audit.as_u8(), 6);
        assert_eq!(LogLevel::Warn.label(), "WARN");
        assert!(LogLevel::Error.is_severe());
        assert!(!LogLevel::Audit.is_severe());
    }

    #[test]
    fn test_record_line_format() {
        let record = LogRecord {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            message: "hello".to_string(),
        };
        let line = record.line();
        assert!(line.contains("| INFO  |"));
        assert!(line.ends_with("hello"));
        assert!(line.starts_with('['));
    }

    #[tokio::test]
    async fn test_fifo_fan_out_order() {
        let (journal, s1, s2) = recording_pair();
        let pipeline = pipeline(6, false);
        pipeline.push_driver(s1, true).await;
        pipeline.push_driver(s2, true).await;
        pipeline.mark_ready().await;

        pipeline.info("r1").await;
        pipeline.info("r2").await;
        pipeline.info("r3").await;

        let entries = journal.lock().clone();
        let expected: Vec<(String, String)> = [
            ("s1", "r1"),
            ("s2", "r1"),
            ("s1", "r2"),
            ("s2", "r2"),
            ("s1", "r3"),
            ("s2", "r3"),
        ]
        .iter()
        .map(|(sink, msg)| (sink.to_string(), msg.to_string()))
        .collect();
        assert_eq!(entries, expected);
    }

    #[tokio::test]
    async fn test_threshold_suppresses_enqueue() {
        let (journal, s1, _) = recording_pair();
        let pipeline = pipeline(3, false);
        pipeline.push_driver(s1, true).await;
        pipeline.mark_ready().await;

        pipeline.debug("invisible").await;
        pipeline.trace("also invisible").await;

        assert!(journal.lock().is_empty());
        assert_eq!(pipeline.pending().await, 0);

        pipeline.info("visible").await;
        assert_eq!(journal.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_ready_gates_drain() {
        let (journal, s1, _) = recording_pair();
        let pipeline = pipeline(6, false);
        pipeline.push_driver(s1, true).await;

        pipeline.info("early-1").await;
        pipeline.info("early-2").await;
        assert_eq!(pipeline.pending().await, 2);
        assert!(journal.lock().is_empty());

        pipeline.mark_ready().await;
        assert_eq!(pipeline.pending().await, 0);
        let messages: Vec<String> = journal.lock().iter().map(|(_, m)| m.clone()).collect();
        assert_eq!(messages, vec!["early-1", "early-2"]);
    }

    #[tokio::test]
    async fn test_disabled_sink_is_skipped_but_stays_registered() {
        let (journal, s1, s2) = recording_pair();
        let pipeline = pipeline(6, false);
        pipeline.push_driver(s1, true).await;
        pipeline.push_driver(s2, false).await;
        pipeline.mark_ready().await;

        pipeline.info("one").await;
        assert_eq!(journal.lock().len(), 1);

        assert!(pipeline.set_sink_enabled("s2", true).await);
        pipeline.info("two").await;

        let entries = journal.lock().clone();
        assert!(entries.contains(&("s2".to_string(), "two".to_string())));
        assert!(!entries.contains(&("s2".to_string(), "one".to_string())));
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_abort_drain() {
        let journal = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let failing = Arc::new(RecordingSink {
            id: "bad",
            journal: Arc::clone(&journal),
            fail: true,
        });
        let healthy = Arc::new(RecordingSink {
            id: "good",
            journal: Arc::clone(&journal),
            fail: false,
        });

        let pipeline = pipeline(6, false);
        pipeline.push_driver(failing, true).await;
        pipeline.push_driver(healthy, true).await;
        pipeline.mark_ready().await;

        pipeline.info("r1").await;
        pipeline.info("r2").await;

        let messages: Vec<String> = journal.lock().iter().map(|(_, m)| m.clone()).collect();
        assert_eq!(messages, vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_json_payload_rendering() {
        let (journal, s1, _) = recording_pair();
        let dev = pipeline(6, true);
        dev.push_driver(s1, true).await;
        dev.mark_ready().await;

        dev.info(json!({"key": "value"})).await;
        let pretty = journal.lock().last().map(|(_, m)| m.clone());
        assert!(pretty.is_some_and(|m| m.contains('\n')));

        let (journal, s1, _) = recording_pair();
        let prod = pipeline(6, false);
        prod.push_driver(s1, true).await;
        prod.mark_ready().await;

        prod.info(json!({"key": "value"})).await;
        let compact = journal.lock().last().map(|(_, m)| m.clone());
        assert_eq!(compact.as_deref(), Some(r#"{"key":"value"}"#));
    }

    #[tokio::test]
    async fn test_null_payload_is_noop() {
        let (journal, s1, _) = recording_pair();
        let pipeline = pipeline(6, false);
        pipeline.push_driver(s1, true).await;
        pipeline.mark_ready().await;

        pipeline.info(serde_json::Value::Null).await;
        assert!(journal.lock().is_empty());
        assert_eq!(pipeline.pending().await, 0);
    }
}
