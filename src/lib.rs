#![allow(clippy::doc_markdown)] // Allow technical terms like YAML, FIFO in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Weir Core
//!
//! A durable workflow orchestration engine. Flows are declarative task
//! trees; the engine walks them one state change at a time, persisting
//! every change before acting on it.
//!
//! ## Overview
//!
//! Execution progress is driven entirely by messages. Each queue message
//! is a wake-up: the coordinator locks the execution row, folds the
//! message into it, runs one pass of the orchestration pipeline, persists
//! the updated row, and re-emits it for the next pass. The stored row is
//! always authoritative; messages never carry state of their own. This
//! makes every consumer idempotent under redelivery, and crash recovery
//! is just redelivery.
//!
//! ## Architecture
//!
//! - The **orchestration pipeline** ([`orchestration`]) is a pure fold:
//!   given an execution and its flow, it decides which task runs to
//!   create, dispatch, retry, or conclude. It never touches storage.
//! - The **coordinator** ([`coordinator`]) owns the queues and the
//!   stores. It runs the pipeline inside per-execution row locks,
//!   enforces admission (scheduled starts, concurrency limits, SLA
//!   monitors), and drains the pipeline's side effects to the queues.
//! - **Workers** are external: they consume the worker task queue and
//!   answer on the worker task result queue. The in-process harness in
//!   [`testing`] ships a simulated worker for tests.
//!
//! ## Module Organization
//!
//! - [`models`] - flows, executions, task runs and the state machine
//! - [`graph`] - branch resolution over the task tree
//! - [`orchestration`] - pipeline handlers, retries, SLA, deduplication
//! - [`coordinator`] - queue consumers, pollers and flow triggers
//! - [`messaging`] - queue trait, message types, in-memory transport
//! - [`storage`] - repository traits and in-memory implementations
//! - [`render`] - expression templates over the execution context
//! - [`config`] - YAML configuration with environment interpolation
//! - [`error`] - structured error handling
//! - [`logging`] - tracing subscriber setup
//! - [`testing`] - in-process engine harness for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use weir_core::config::WeirConfig;
//! use weir_core::coordinator::{Coordinator, CoordinatorQueues, CoordinatorStores};
//! use weir_core::models::Flow;
//! use weir_core::orchestration::WorkerGroupRegistry;
//! use weir_core::storage::FlowStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WeirConfig::load()?;
//!     weir_core::logging::init(&config.logging);
//!
//!     let flow: Flow = serde_yaml::from_str(std::fs::read_to_string("flow.yaml")?.as_str())?;
//!     let flows = Arc::new(FlowStore::with_flows(vec![flow]));
//!
//!     let queues = CoordinatorQueues::in_memory(config.queues.capacity);
//!     let stores = CoordinatorStores::in_memory(flows);
//!     let workers = Arc::new(WorkerGroupRegistry::new());
//!
//!     let coordinator = Arc::new(Coordinator::new(config, queues, stores, workers));
//!     coordinator.run().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod render;
pub mod storage;
pub mod testing;

pub use config::WeirConfig;
pub use coordinator::{Coordinator, CoordinatorQueues, CoordinatorStores, FlowTriggerService};
pub use error::{WeirError, WeirResult};
pub use models::{Execution, Flow, StateKind, TaskRun};
pub use orchestration::{Executor, ExecutorService, WorkerGroupRegistry};
pub use storage::FlowStore;
