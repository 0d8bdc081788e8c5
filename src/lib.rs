//! # Anthill Core
//!
//! Asynchronous job execution and observability services:
//!
//! - **Jobs**: a dispatch facade over a durable broker with configurable
//!   retry/backoff, lazy per-name queue handles, and a cooperative shutdown
//!   drain
//! - **Workers**: trait-based queue consumers bound with N concurrent slots
//!   and no-throw lifecycle callbacks
//! - **Scheduler**: cron-driven tasks with a single-flight guard and
//!   overlap/delay accounting
//! - **Logging**: a buffered pipeline fanning records out to console, file
//!   and database sinks, isolating sink failures with a bounded
//!   retry-then-disable policy
//!
//! Services are constructed explicitly at the composition root and shared
//! via `Arc`; nothing in the crate is process-global.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use anthill_core::prelude::*;
//!
//! let config = Config::load()?;
//! let pipeline = Arc::new(LogPipeline::new(PipelineSettings::from_config(&config)));
//! pipeline.push_driver(Arc::new(ConsoleSink), true).await;
//! pipeline.push_driver(Arc::new(FileSink::new(&config.log)), true).await;
//! pipeline.mark_ready().await;
//!
//! let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&config.redis.url)?);
//! let registry = Arc::new(QueueRegistry::new(broker, config.queue.clone(), pipeline.clone()));
//! let dispatcher = JobDispatcher::new(registry.clone(), pipeline.clone());
//!
//! dispatcher.queue("emails").dispatch("welcome", serde_json::json!({"user": 7})).await?;
//!
//! let scheduler = TaskScheduler::new(Arc::new(CronTickSource::new()), pipeline.clone());
//! scheduler.schedule(Arc::new(NightlyCleanup))?;
//!
//! // On shutdown: stop dispatch and wait for in-flight jobs.
//! registry.stop().await;
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod scheduler;
pub mod telemetry;

pub use error::{AnthillError, ErrorCode, ErrorSeverity, Result};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::broker::{
        Backoff, BackoffStrategy, Broker, BrokerQueue, InMemoryBroker, Job, JobContext,
        JobHandler, JobId, JobOptions, JobOptionsPatch, QueueOptions, RedisBroker,
        RepeatOptions, StallPolicy, WorkerEvent, WorkerOptions,
    };
    pub use crate::config::{Config, Environment, LogSettings, QueueSettings, RetryStrategyKind};
    pub use crate::error::{AnthillError, ErrorCode, ErrorSeverity, Result};
    pub use crate::jobs::{
        BoundQueue, JobDispatcher, QueueHandle, QueueRegistry, Worker, WorkerBinding,
        WorkerRunner,
    };
    pub use crate::logging::{
        ConsoleSink, DatabaseSink, FileSink, LogEntry, LogLevel, LogPayload, LogPipeline,
        LogRecord, LogSink, LogStore, PipelineSettings, PostgresLogStore,
    };
    pub use crate::scheduler::{
        CronTickSource, ManualTickSource, Task, TaskScheduler, TaskSnapshot, TickHandle,
        TickSource,
    };
}
