//! # Executor Snapshot
//!
//! One execution mid-processing: the current execution value plus every side
//! effect the pipeline handlers accumulated while looking at it. Handlers
//! never touch a queue or a store directly; they mutate this snapshot and the
//! coordinator drains the vectors inside the execution lock afterwards, which
//! is what makes a crashed-and-redelivered message safe to reprocess.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{WeirError, WeirResult};
use crate::messaging::messages::{
    ExecutionKilled, LogEntry, SubflowExecution, SubflowExecutionResult, WorkerTask,
};
use crate::models::execution::Execution;
use crate::models::flow::Flow;
use crate::models::state::StateKind;
use crate::models::task_run::TaskRun;
use crate::storage::ExecutionDelay;

pub struct Executor {
    pub execution: Execution,
    pub flow: Arc<Flow>,
    /// Execution state when the snapshot was taken, for change detection.
    original_state: StateKind,
    /// Candidate task runs to append; dedup-filtered before `on_nexts`.
    pub nexts: Vec<TaskRun>,
    pub worker_tasks: Vec<WorkerTask>,
    pub subflow_executions: Vec<SubflowExecution>,
    pub subflow_execution_results: Vec<SubflowExecutionResult>,
    pub execution_delays: Vec<ExecutionDelay>,
    pub kills: Vec<ExecutionKilled>,
    pub logs: Vec<LogEntry>,
    pub exception: Option<WeirError>,
    from: Vec<&'static str>,
    execution_updated: bool,
}

impl Executor {
    pub fn new(execution: Execution, flow: Arc<Flow>) -> Self {
        let original_state = execution.state.current;
        Executor {
            execution,
            flow,
            original_state,
            nexts: Vec::new(),
            worker_tasks: Vec::new(),
            subflow_executions: Vec::new(),
            subflow_execution_results: Vec::new(),
            execution_delays: Vec::new(),
            kills: Vec::new(),
            logs: Vec::new(),
            exception: None,
            from: Vec::new(),
            execution_updated: false,
        }
    }

    /// Replace the execution snapshot, recording which handler changed it.
    pub fn set_execution(&mut self, execution: Execution, from: &'static str) {
        self.execution = execution;
        self.from.push(from);
        self.execution_updated = true;
    }

    /// Update a single task run in place.
    pub fn set_task_run(&mut self, task_run: TaskRun, from: &'static str) -> WeirResult<()> {
        let updated = self.execution.with_task_run(task_run)?;
        self.set_execution(updated, from);
        Ok(())
    }

    pub fn add_nexts(&mut self, nexts: Vec<TaskRun>) {
        self.nexts.extend(nexts);
    }

    pub fn add_worker_task(&mut self, worker_task: WorkerTask) {
        self.worker_tasks.push(worker_task);
    }

    pub fn add_subflow_execution(&mut self, subflow_execution: SubflowExecution) {
        self.subflow_executions.push(subflow_execution);
    }

    pub fn add_subflow_execution_result(&mut self, result: SubflowExecutionResult) {
        self.subflow_execution_results.push(result);
    }

    pub fn add_delay(&mut self, delay: ExecutionDelay) {
        self.execution_delays.push(delay);
    }

    pub fn add_kill(&mut self, kill: ExecutionKilled) {
        self.kills.push(kill);
    }

    pub fn add_log(&mut self, log: LogEntry) {
        self.logs.push(log);
    }

    pub fn set_exception(&mut self, error: WeirError, from: &'static str) {
        self.exception = Some(error);
        self.from.push(from);
    }

    /// A snapshot carrying an exception is done being processed.
    pub fn can_be_processed(&self) -> bool {
        self.exception.is_none()
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution.id
    }

    pub fn original_state(&self) -> StateKind {
        self.original_state
    }

    /// True when the execution left the state it was delivered in.
    pub fn state_changed(&self) -> bool {
        self.execution.state.current != self.original_state
    }

    pub fn execution_updated(&self) -> bool {
        self.execution_updated
    }

    /// Handler trace, for debug logs.
    pub fn sources(&self) -> String {
        self.from.join(", ")
    }
}
