//! # Execution Lifecycle Service
//!
//! State surgery applied to executions outside the per-message pipeline:
//! resuming paused runs, rearming failed runs for retry, replaying whole
//! executions, and converging kills across the parent/child graph.
//!
//! ## Overview
//!
//! Every operation is pure with respect to its inputs: it takes an
//! [`Execution`] snapshot and returns the updated copy, leaving persistence
//! and queue emission to the coordinator. That keeps these transitions
//! testable without any storage behind them.

use uuid::Uuid;

use crate::error::{WeirError, WeirResult};
use crate::graph;
use crate::messaging::messages::ExecutionKilled;
use crate::models::execution::Execution;
use crate::models::flow::Flow;
use crate::models::label::{self, Label};
use crate::models::state::{State, StateKind};
use crate::models::task_run::TaskRun;
use crate::storage::ExecutionRepository;

/// Lifecycle transitions shared by the executor pipeline, the delay pollers
/// and the kill consumer.
#[derive(Debug, Default, Clone)]
pub struct ExecutionService;

impl ExecutionService {
    pub fn new() -> Self {
        ExecutionService
    }

    /// Move one task run to `state` and rewind the execution to RESTARTED so
    /// the next pipeline pass re-evaluates the graph from that point.
    ///
    /// This is the resume path: a fired pause delay lands here with RUNNING
    /// (or the configured pause behavior state).
    pub fn mark_as(
        &self,
        execution: &Execution,
        task_run_id: Uuid,
        state: StateKind,
    ) -> WeirResult<Execution> {
        let run = execution.find_task_run(task_run_id).ok_or_else(|| {
            WeirError::not_found(format!(
                "task run '{task_run_id}' on execution '{}'",
                execution.id
            ))
        })?;
        let updated = with_attempt_state(run, state);
        Ok(execution
            .with_task_run(updated)?
            .with_state(StateKind::Restarted))
    }

    /// Move one task run to `state` without touching its attempts, optionally
    /// mirroring the state onto the execution itself.
    ///
    /// Used by the retry handler: RETRYING stays run-local, RETRIED (new
    /// execution ahead) is mirrored so the whole execution leaves the running
    /// set.
    pub fn mark_with_task_run_as(
        &self,
        execution: &Execution,
        task_run_id: Uuid,
        state: StateKind,
        mark_execution: bool,
    ) -> WeirResult<Execution> {
        let run = execution.find_task_run(task_run_id).ok_or_else(|| {
            WeirError::not_found(format!(
                "task run '{task_run_id}' on execution '{}'",
                execution.id
            ))
        })?;
        let mut next = execution.with_task_run(run.with_state(state))?;
        if mark_execution {
            next = next.with_state(state);
        }
        Ok(next)
    }

    /// Rearm a failed task run for another in-place attempt.
    ///
    /// The run goes back to CREATED so the dispatcher picks it up again;
    /// recorded attempts are kept, they are what bounds the retry policy.
    /// The execution itself is rewound to RESTARTED: by the time the retry
    /// delay fires it has usually been concluded FAILED, and a restarted
    /// execution re-enters the concurrency gate before running again.
    pub fn retry_task(&self, execution: &Execution, task_run_id: Uuid) -> WeirResult<Execution> {
        let run = execution.find_task_run(task_run_id).ok_or_else(|| {
            WeirError::not_found(format!(
                "task run '{task_run_id}' on execution '{}'",
                execution.id
            ))
        })?;
        Ok(execution
            .with_task_run(run.with_state(StateKind::Created))?
            .with_state(StateKind::Restarted))
    }

    /// Brand-new CREATED execution replaying this one from the start.
    ///
    /// Inputs, labels, trigger and parent linkage are carried over; the
    /// task run list is reset and the attempt number advances, which is what
    /// bounds create-new-execution retry policies. The source execution is
    /// recorded in a system label.
    pub fn replay(&self, execution: &Execution) -> Execution {
        let mut next = execution.clone();
        next.id = Uuid::new_v4();
        next.task_run_list = Vec::new();
        next.outputs = None;
        next.state = State::new(StateKind::Created);
        next.attempt_number = execution.attempt_number + 1;
        next.labels = label::merge(
            &execution.labels,
            &[Label::new(label::REPLAY_OF, execution.id.to_string())],
        );
        next
    }

    /// Request-phase kill: mark the execution KILLING so the pipeline starts
    /// converging. Terminal executions are left untouched, workers are still
    /// notified by the executed-phase event.
    pub fn kill(&self, execution: &Execution) -> Execution {
        if execution.is_terminated() {
            return execution.clone();
        }
        execution.with_state(StateKind::Killing)
    }

    /// Kill events for every non-terminal child execution spawned by this
    /// one, used to cascade a kill through subflows.
    pub async fn kill_subflow_executions(
        &self,
        repository: &dyn ExecutionRepository,
        tenant: &str,
        execution_id: Uuid,
    ) -> WeirResult<Vec<ExecutionKilled>> {
        let children = repository.find_active_children(execution_id).await?;
        Ok(children
            .iter()
            .map(|child| ExecutionKilled::requested(child.id, tenant))
            .collect())
    }

    /// Propagate a KILLED child up its parent chain: every non-terminal
    /// ancestor container is killed too, so flowables whose children died in
    /// a worker do not stay RUNNING forever.
    pub fn kill_parent_task_runs(
        &self,
        execution: &Execution,
        child: &TaskRun,
    ) -> WeirResult<Execution> {
        let mut next = execution.clone();
        let mut parent_id = child.parent_task_run_id;
        while let Some(id) = parent_id {
            let Some(parent) = next.find_task_run(id) else {
                break;
            };
            parent_id = parent.parent_task_run_id;
            if parent.is_terminated() {
                continue;
            }
            let killed = parent.with_state(StateKind::Killed);
            next = next.with_task_run(killed)?;
        }
        Ok(next)
    }

    /// Wake a loop parent paused between iterations. The iteration counter
    /// was already advanced when the continuation delay was scheduled.
    pub fn continue_loop(&self, execution: &Execution, task_run_id: Uuid) -> WeirResult<Execution> {
        let run = execution.find_task_run(task_run_id).ok_or_else(|| {
            WeirError::not_found(format!(
                "task run '{task_run_id}' on execution '{}'",
                execution.id
            ))
        })?;
        execution.with_task_run(run.with_state(StateKind::Running))
    }

    /// Fully over: the execution is terminal and nothing post-terminal
    /// (listeners, after-execution tasks) is still outstanding.
    pub fn is_terminated(&self, flow: &Flow, execution: &Execution) -> bool {
        if !execution.is_terminated() {
            return false;
        }
        let listeners = graph::resolve_tasks(&flow.listeners, None);
        if !graph::is_terminated(execution, &listeners) {
            return false;
        }
        let after = graph::resolve_tasks(&flow.after_execution, None);
        graph::is_terminated(execution, &after)
    }
}

/// Update the latest attempt to `state` (appending one when the run has
/// none yet) and transition the run itself.
pub(crate) fn with_attempt_state(run: &TaskRun, state: StateKind) -> TaskRun {
    use crate::models::task_run::TaskRunAttempt;

    let mut next = run.clone();
    match next.attempts.last_mut() {
        Some(attempt) => *attempt = attempt.with_state(state),
        None => next.attempts.push(TaskRunAttempt::new(state)),
    }
    next.with_state(state)
}
