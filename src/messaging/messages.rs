//! # Transport Message Types
//!
//! Message structures flowing between the coordinator, the workers and
//! parent/child executions. Everything here is serializable so a durable
//! transport can replace the in-memory queues without touching the
//! orchestration core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::execution::Execution;
use crate::models::flow::{Flow, TaskDef};
use crate::models::state::StateKind;
use crate::models::task_run::TaskRun;
use crate::models::JsonMap;

/// One job handed to a worker: the task run to advance, its definition and
/// the rendered runtime context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    pub task_run: TaskRun,
    pub task: TaskDef,
    /// Render context snapshot (inputs, upstream outputs, labels).
    pub variables: JsonMap,
    /// Resolved worker group routing key, when the task pins one.
    #[serde(default)]
    pub worker_group_key: Option<String>,
}

/// A task run coming back from a worker (or synthesized by the engine for
/// container tasks), carrying its updated state history and outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTaskResult {
    pub task_run: TaskRun,
}

impl WorkerTaskResult {
    pub fn new(task_run: TaskRun) -> Self {
        WorkerTaskResult { task_run }
    }
}

/// A child execution to start on behalf of a subflow task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubflowExecution {
    pub parent_task_run: TaskRun,
    pub execution: Execution,
}

/// Outcome of a child execution folded back onto the parent's task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubflowExecutionResult {
    /// The child execution this result came from.
    pub child_execution_id: Uuid,
    /// Parent task run carrying the derived state and merged outputs.
    pub parent_task_run: TaskRun,
    pub state: StateKind,
}

/// Raw terminal notification of a child execution, before the parent's
/// subflow task semantics (wait/transmit-failed) are applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubflowExecutionEnd {
    pub child_execution_id: Uuid,
    pub parent_execution_id: Uuid,
    pub parent_task_run_id: Uuid,
    pub task_id: String,
    pub state: StateKind,
    #[serde(default)]
    pub outputs: JsonMap,
}

/// A state change routed to a flow whose trigger carries multi-flow
/// preconditions. Evaluated later against the windowed condition store
/// instead of inline, so each matching execution is counted exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipleConditionEvent {
    /// The flow owning the windowed trigger.
    pub flow: Flow,
    /// The execution whose state change may satisfy one of the filters.
    pub execution: Execution,
}

/// Kill event progression: requested by a user/SLA, then re-published as
/// executed once the coordinator has processed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillPhase {
    Requested,
    Executed,
}

/// Request to kill an execution, optionally cascading to its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionKilled {
    pub execution_id: Uuid,
    pub tenant: String,
    pub phase: KillPhase,
    /// Terminal state to converge to; defaults to KILLED when absent.
    #[serde(default)]
    pub execution_state: Option<StateKind>,
    /// Propagate to non-terminal child executions. Cleared on the
    /// re-published EXECUTED copy so grandchildren are not killed twice.
    pub is_on_kill_cascade: bool,
}

impl ExecutionKilled {
    pub fn requested(execution_id: Uuid, tenant: impl Into<String>) -> Self {
        ExecutionKilled {
            execution_id,
            tenant: tenant.into(),
            phase: KillPhase::Requested,
            execution_state: None,
            is_on_kill_cascade: true,
        }
    }

    /// Copy notified to workers after the coordinator handled the request.
    pub fn as_executed(&self) -> Self {
        ExecutionKilled {
            execution_id: self.execution_id,
            tenant: self.tenant.clone(),
            phase: KillPhase::Executed,
            execution_state: self.execution_state,
            is_on_kill_cascade: false,
        }
    }
}

/// Structured log line shipped on the log queue for the UI/log sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub tenant: String,
    pub namespace: String,
    pub flow_id: String,
    pub execution_id: Uuid,
    #[serde(default)]
    pub task_run_id: Option<Uuid>,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogEntry {
    pub fn of(execution: &Execution, level: LogLevel, message: impl Into<String>) -> Self {
        LogEntry {
            tenant: execution.tenant.clone(),
            namespace: execution.namespace.clone(),
            flow_id: execution.flow_id.clone(),
            execution_id: execution.id,
            task_run_id: None,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_task_run(mut self, task_run_id: Uuid) -> Self {
        self.task_run_id = Some(task_run_id);
        self
    }
}
