//! # Orchestration Core
//!
//! ## Overview
//!
//! The per-message heart of the engine. Each message about an execution is
//! folded into an [`Executor`] working unit, pushed through the
//! [`ExecutorService`] pipeline, and drained back to queues and storage by
//! the coordinator.
//!
//! ## Core Components
//!
//! - **Executor**: one execution plus everything a pass produced for it
//!   (next runs, worker dispatches, subflows, delays, kills, logs)
//! - **ExecutorService**: the stateless orchestration pipeline; resolves
//!   next task runs, folds child results into containers, schedules retries
//!   and pauses, expands subflows
//! - **ExecutionService**: small lifecycle operations shared by the pipeline
//!   and the coordinator (mark, retry, replay, kill, resume)
//! - **SlaService**: condition and max-duration rule evaluation
//! - **Deduplication**: at-least-once delivery means every side effect needs
//!   an idempotence key; this module owns the key shapes

pub mod dedup;
pub mod execution_service;
pub mod executor;
pub mod service;
pub mod sla;

pub use dedup::ExecutorState;
pub use execution_service::ExecutionService;
pub use executor::Executor;
pub use service::{ExecutorService, WorkerGroupRegistry};
pub use sla::{SlaService, Violation};
