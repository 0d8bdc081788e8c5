//! Error handling for Anthill Core.
//!
//! This module provides:
//! - A structured error type with context and chaining
//! - Machine-readable error codes for programmatic handling
//! - Severity classification driving log levels and process-exit policy
//! - Retryable/fatal classification for broker and sink failure paths
//! - Metrics integration for error tracking

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Anthill operations.
pub type Result<T> = std::result::Result<T, AnthillError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by embedding applications for
/// programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Broker Errors (1000-1099)
    BrokerConnectionFailed,
    BrokerError,
    QueueDraining,
    QueueNotFound,

    // Job Errors (1100-1199)
    JobHandlerFailed,
    JobAborted,

    // Scheduler Errors (1200-1299)
    TaskFailed,
    TaskNotFound,
    InvalidCronExpression,

    // Logging Errors (2000-2099)
    SinkWriteFailed,
    SinkDisabled,
    LogStoreFailed,

    // Serialization Errors (2100-2199)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Broker Errors
            Self::BrokerConnectionFailed => 1000,
            Self::BrokerError => 1001,
            Self::QueueDraining => 1002,
            Self::QueueNotFound => 1003,

            // Job Errors
            Self::JobHandlerFailed => 1100,
            Self::JobAborted => 1101,

            // Scheduler Errors
            Self::TaskFailed => 1200,
            Self::TaskNotFound => 1201,
            Self::InvalidCronExpression => 1202,

            // Logging Errors
            Self::SinkWriteFailed => 2000,
            Self::SinkDisabled => 2001,
            Self::LogStoreFailed => 2002,

            // Serialization Errors
            Self::SerializationError => 2100,
            Self::DeserializationError => 2101,

            // Configuration Errors
            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            // Internal Errors
            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Retryable errors are transient: the same operation may succeed on a
    /// later attempt (broker hiccups, sink write failures inside the retry
    /// window, job-level business failures governed by the job's options).
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BrokerError
                | Self::JobHandlerFailed
                | Self::TaskFailed
                | Self::SinkWriteFailed
                | Self::LogStoreFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "broker",
            1100..=1199 => "job",
            1200..=1299 => "scheduler",
            2000..=2099 => "logging",
            2100..=2199 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and process-exit policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected operational noise (draining rejections, missing lookups)
    Low,
    /// Recoverable failures handled by a retry or disable policy
    Medium,
    /// System errors worth paging on
    High,
    /// Unrecoverable: the process should terminate rather than run degraded
    Fatal,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::QueueDraining
            | ErrorCode::QueueNotFound
            | ErrorCode::TaskNotFound => Self::Low,

            ErrorCode::BrokerError
            | ErrorCode::JobHandlerFailed
            | ErrorCode::JobAborted
            | ErrorCode::TaskFailed
            | ErrorCode::SinkWriteFailed
            | ErrorCode::SinkDisabled
            | ErrorCode::LogStoreFailed => Self::Medium,

            ErrorCode::InvalidCronExpression
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::High,

            ErrorCode::BrokerConnectionFailed => Self::Fatal,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Anthill Core.
///
/// Supports structured error codes, a short operator-facing message, a
/// detailed internal message for logs, and source-error chaining.
#[derive(Error, Debug)]
pub struct AnthillError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Short operator-facing message
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for AnthillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl AnthillError {
    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both an operator-facing and an internal message.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal: impl Into<String>,
    ) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: Some(internal.into()),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Attach a source error.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for internal errors.
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_internal(ErrorCode::InternalError, "Internal error", message)
    }

    /// Get the error code.
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the severity for this error.
    pub const fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Check if this error should terminate the process.
    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Fatal
    }

    /// Get the operator-facing message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the internal message, if any.
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    fn record_metrics(&self) {
        counter!(
            "anthill_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for AnthillError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "JSON serialization failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<redis::RedisError> for AnthillError {
    fn from(error: redis::RedisError) -> Self {
        let code = if error.is_connection_refusal() || error.is_io_error() {
            ErrorCode::BrokerConnectionFailed
        } else {
            ErrorCode::BrokerError
        };
        Self::with_internal(code, "Broker operation failed", error.to_string())
            .with_source(error)
    }
}

impl From<sqlx::Error> for AnthillError {
    fn from(error: sqlx::Error) -> Self {
        Self::with_internal(
            ErrorCode::LogStoreFailed,
            "Log store operation failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
