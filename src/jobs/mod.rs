//! Background job dispatch and consumption.
//!
//! - **Dispatcher**: builds job options from configured defaults and submits
//!   to a named queue resolved through the registry
//! - **Registry**: one lazily created, cached broker-queue handle per name,
//!   plus the cooperative shutdown drain
//! - **Worker**: trait-based consumers bound with N concurrent slots and
//!   no-throw lifecycle callbacks
//!
//! ```text
//! JobDispatcher ──▶ QueueRegistry ──▶ Broker (external) ──▶ WorkerRunner
//!       │                                                        │
//!       └──────────────────── LogPipeline ◀──────────────────────┘
//! ```

pub mod dispatcher;
pub mod worker;

pub use dispatcher::{BoundQueue, JobDispatcher, QueueHandle, QueueRegistry};
pub use worker::{Worker, WorkerBinding, WorkerRunner};
