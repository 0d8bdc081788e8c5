//! Console and file log sinks.
//!
//! Both sinks are single-attempt: a failed write is reported by the pipeline
//! and never retried.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use colored::Colorize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::LogSettings;
use crate::error::{AnthillError, ErrorCode, Result};
use crate::logging::{LogLevel, LogRecord};

/// A log delivery destination.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Stable sink name used for enable/disable toggling and diagnostics.
    fn name(&self) -> &str;

    /// Deliver one record.
    async fn log(&self, record: &LogRecord) -> Result<()>;

    /// Discard whatever the sink has accumulated. Default: nothing to do.
    fn clear(&self) {}
}

// ═══════════════════════════════════════════════════════════════════════════════
// Console Sink
// ═══════════════════════════════════════════════════════════════════════════════

/// Writes `[timestamp] | LEVEL | message` lines to stdout, with warnings and
/// worse going to stderr. Colored per level.
pub struct ConsoleSink;

impl ConsoleSink {
    fn colorize(level: LogLevel, line: &str) -> String {
        match level {
            LogLevel::Fatal => line.red().reversed().to_string(),
            LogLevel::Error => line.red().to_string(),
            LogLevel::Warn => line.yellow().to_string(),
            LogLevel::Info => line.green().to_string(),
            LogLevel::Debug => line.cyan().to_string(),
            LogLevel::Trace => line.white().dimmed().to_string(),
            LogLevel::Audit => line.bright_black().to_string(),
        }
    }
}

#[async_trait]
impl LogSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn log(&self, record: &LogRecord) -> Result<()> {
        let line = Self::colorize(record.level, &record.line());
        if record.level.is_severe() {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
        Ok(())
    }

    fn clear(&self) {
        // ANSI clear-screen + cursor home.
        print!("\x1B[2J\x1B[1;1H");
        let _ = std::io::stdout().flush();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// File Sink
// ═══════════════════════════════════════════════════════════════════════════════

/// Appends to a date-stamped file, `<dir>/<name>-<YYYY-MM-DD>.log`.
///
/// Housekeeping (age-based deletion, size-based roll) is evaluated only every
/// Nth write to bound the cost of filesystem stat calls.
pub struct FileSink {
    directory: PathBuf,
    base_name: String,
    max_days: Option<u32>,
    max_size_mb: Option<u64>,
    check_every: u32,
    tick: parking_lot::Mutex<u32>,
}

impl FileSink {
    pub fn new(settings: &LogSettings) -> Self {
        Self {
            directory: PathBuf::from(&settings.directory),
            base_name: settings.file_name.clone(),
            max_days: settings.max_days,
            max_size_mb: settings.max_size_mb,
            check_every: settings.rotation_check_every.max(1),
            // Start saturated so the first write runs housekeeping.
            tick: parking_lot::Mutex::new(settings.rotation_check_every.max(1)),
        }
    }

    fn current_file_name(&self) -> String {
        format!(
            "{}-{}.log",
            self.base_name,
            Utc::now().format("%Y-%m-%d")
        )
    }

    fn current_path(&self) -> PathBuf {
        self.directory.join(self.current_file_name())
    }

    /// Extract the `<date>` portion of a `<name>-<date>.log` file name.
    fn dated_suffix<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        file_name
            .strip_prefix(&self.base_name)?
            .strip_prefix('-')?
            .strip_suffix(".log")
    }

    fn housekeeping(&self) -> Result<()> {
        {
            let mut tick = self.tick.lock();
            if *tick < self.check_every {
                *tick += 1;
                return Ok(());
            }
            *tick = 0;
        }

        fs::create_dir_all(&self.directory).map_err(|e| {
            AnthillError::with_internal(
                ErrorCode::SinkWriteFailed,
                "Could not create log directory",
                e.to_string(),
            )
        })?;

        if let Some(max_days) = self.max_days {
            self.delete_expired(max_days);
        }

        if let Some(max_size_mb) = self.max_size_mb {
            self.roll_oversized(max_size_mb);
        }

        Ok(())
    }

    /// Delete date-named log files older than the retention window.
    fn delete_expired(&self, max_days: u32) {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(i64::from(max_days));

        let Ok(entries) = fs::read_dir(&self.directory) else {
            return;
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(suffix) = self.dated_suffix(name) else {
                continue;
            };
            // Rolled files carry a unix-timestamp suffix and are skipped here.
            let Ok(date) = NaiveDate::parse_from_str(suffix, "%Y-%m-%d") else {
                continue;
            };
            if date <= cutoff {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    /// Rename the current file out of the way once it exceeds the size cap.
    fn roll_oversized(&self, max_size_mb: u64) {
        let path = self.current_path();
        let Ok(metadata) = fs::metadata(&path) else {
            return;
        };

        let size_mb = metadata.len() / (1024 * 1024);
        if size_mb >= max_size_mb {
            let rolled = self.directory.join(format!(
                "{}-{}.log",
                self.base_name,
                Utc::now().timestamp()
            ));
            let _ = fs::rename(&path, rolled);
        }
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                AnthillError::with_internal(
                    ErrorCode::SinkWriteFailed,
                    "Could not open log file",
                    format!("{}: {e}", path.display()),
                )
            })?;

        writeln!(file, "{line}").map_err(|e| {
            AnthillError::with_internal(
                ErrorCode::SinkWriteFailed,
                "Could not append to log file",
                format!("{}: {e}", path.display()),
            )
        })
    }
}

#[async_trait]
impl LogSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn log(&self, record: &LogRecord) -> Result<()> {
        self.housekeeping()?;
        self.append_line(&self.current_path(), &record.line())
    }

    fn clear(&self) {
        let path = self.current_path();
        if path.exists() {
            let _ = fs::write(path, b"");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
