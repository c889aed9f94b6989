//! # Messaging Module
//!
//! Queue-based transport between the coordinator, workers and sibling
//! coordinator processes. The orchestration core only sees the
//! [`MessageQueue`] trait; the bundled implementation is an in-memory
//! bounded queue, and a durable broker can be swapped in per queue.

pub mod memory;
pub mod messages;

pub use memory::InMemoryQueue;
pub use messages::*;

use async_trait::async_trait;

use crate::error::QueueError;

/// Inbound executions (new, restarted, popped from the concurrency queue).
pub const QUEUE_EXECUTION: &str = "execution";
/// Jobs dispatched to workers.
pub const QUEUE_WORKER_TASK: &str = "worker_task";
/// Task runs coming back from workers.
pub const QUEUE_WORKER_TASK_RESULT: &str = "worker_task_result";
/// Child outcomes folded onto parent subflow task runs.
pub const QUEUE_SUBFLOW_RESULT: &str = "subflow_execution_result";
/// Raw child terminal notifications.
pub const QUEUE_SUBFLOW_END: &str = "subflow_execution_end";
/// Kill requests and their executed acknowledgements.
pub const QUEUE_KILL: &str = "kill";
/// Structured execution logs for the log sink.
pub const QUEUE_LOG: &str = "log";
/// Deferred windowed-trigger evaluations.
pub const QUEUE_MULTIPLE_CONDITION: &str = "multiple_condition";

/// At-least-once message transport for one message type.
///
/// `emit` applies backpressure when the queue is full; `receive` yields
/// `None` once every producer handle is gone and the queue drained.
#[async_trait]
pub trait MessageQueue<M>: Send + Sync
where
    M: Send + 'static,
{
    fn name(&self) -> &str;

    async fn emit(&self, message: M) -> Result<(), QueueError>;

    async fn receive(&self) -> Option<M>;
}
