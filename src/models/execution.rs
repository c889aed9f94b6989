//! # Execution Model
//!
//! One run of a flow, the unit everything else orchestrates around.
//!
//! ## Overview
//!
//! An [`Execution`] is a persistent immutable value: every mutation goes
//! through a `with_*` constructor returning a new value, which keeps the
//! before/after snapshots of the locked critical section unambiguous. The
//! ordered task run list plus the append-only [`State`] history fully
//! describe progress; there is no hidden mutable bookkeeping.
//!
//! ## Lifecycle
//!
//! Created by a trigger, an API call or a parent subflow task; advanced
//! exclusively by the orchestration core; never deleted while non-terminal.
//! Terminal executions become eligible for dedup-state purge except KILLED
//! ones, which are retained for restart and audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{WeirError, WeirResult};
use crate::models::flow::{Flow, FlowIdent};
use crate::models::label::{self, Label};
use crate::models::state::{State, StateKind};
use crate::models::task_run::TaskRun;
use crate::models::JsonMap;

/// Debug breakpoint: suspend before dispatching a matching task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub task_id: String,
    /// When set, only the expansion with this value suspends.
    #[serde(default)]
    pub value: Option<String>,
}

/// Link from a child execution back to the subflow task that spawned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionParent {
    pub execution_id: Uuid,
    pub task_run_id: Uuid,
    pub task_id: String,
    /// Whether the parent task waits for this child to terminate.
    pub waits: bool,
}

/// Trigger provenance carried for audit and trigger-state reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrigger {
    pub id: String,
    #[serde(default)]
    pub variables: serde_json::Value,
}

/// One run of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub tenant: String,
    pub namespace: String,
    pub flow_id: String,
    pub flow_revision: u32,
    #[serde(default)]
    pub task_run_list: Vec<TaskRun>,
    pub state: State,
    #[serde(default)]
    pub inputs: JsonMap,
    #[serde(default)]
    pub outputs: Option<JsonMap>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub trigger: Option<ExecutionTrigger>,
    #[serde(default)]
    pub parent: Option<ExecutionParent>,
    /// Start no earlier than this; enforced by the coordinator via a delay.
    #[serde(default)]
    pub scheduled_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub breakpoints: Vec<Breakpoint>,
    /// 1 for a fresh execution, incremented on each whole-execution replay.
    #[serde(default = "default_attempt_number")]
    pub attempt_number: u32,
}

fn default_attempt_number() -> u32 {
    1
}

impl Execution {
    /// New CREATED execution of `flow`.
    pub fn create(flow: &Flow, inputs: JsonMap, labels: Vec<Label>) -> Self {
        Execution {
            id: Uuid::new_v4(),
            tenant: flow.tenant.clone(),
            namespace: flow.namespace.clone(),
            flow_id: flow.id.clone(),
            flow_revision: flow.revision,
            task_run_list: Vec::new(),
            state: State::new(StateKind::Created),
            inputs,
            outputs: None,
            labels,
            trigger: None,
            parent: None,
            scheduled_date: None,
            breakpoints: Vec::new(),
            attempt_number: 1,
        }
    }

    pub fn with_state(&self, kind: StateKind) -> Self {
        let mut next = self.clone();
        next.state = self.state.with_state(kind);
        next
    }

    /// Replace the task run matching `run` (same id/value/iteration).
    ///
    /// A result for a run this execution never created is a `NotFound`: the
    /// engine does not support workers inventing task runs.
    pub fn with_task_run(&self, run: TaskRun) -> WeirResult<Self> {
        let mut next = self.clone();
        let slot = next
            .task_run_list
            .iter_mut()
            .find(|existing| existing.is_same(&run))
            .ok_or_else(|| {
                WeirError::not_found(format!(
                    "task run '{}' on execution '{}'",
                    run.id, self.id
                ))
            })?;
        *slot = run;
        Ok(next)
    }

    pub fn with_task_run_list(&self, task_run_list: Vec<TaskRun>) -> Self {
        let mut next = self.clone();
        next.task_run_list = task_run_list;
        next
    }

    pub fn with_appended_task_runs(&self, runs: Vec<TaskRun>) -> Self {
        let mut next = self.clone();
        next.task_run_list.extend(runs);
        next
    }

    pub fn with_labels(&self, labels: Vec<Label>) -> Self {
        let mut next = self.clone();
        next.labels = labels;
        next
    }

    pub fn with_merged_labels(&self, updates: &[Label]) -> Self {
        self.with_labels(label::merge(&self.labels, updates))
    }

    pub fn with_outputs(&self, outputs: JsonMap) -> Self {
        let mut next = self.clone();
        next.outputs = Some(outputs);
        next
    }

    pub fn with_parent(&self, parent: ExecutionParent) -> Self {
        let mut next = self.clone();
        next.parent = Some(parent);
        next
    }

    pub fn with_trigger(&self, trigger: ExecutionTrigger) -> Self {
        let mut next = self.clone();
        next.trigger = Some(trigger);
        next
    }

    pub fn with_scheduled_date(&self, date: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.scheduled_date = Some(date);
        next
    }

    pub fn find_task_run(&self, task_run_id: Uuid) -> Option<&TaskRun> {
        self.task_run_list.iter().find(|run| run.id == task_run_id)
    }

    /// Child runs owned by a composite task run.
    pub fn find_children(&self, parent_task_run_id: Uuid) -> Vec<&TaskRun> {
        self.task_run_list
            .iter()
            .filter(|run| run.parent_task_run_id == Some(parent_task_run_id))
            .collect()
    }

    /// Runs of one task id, any expansion.
    pub fn find_task_runs_by_task(&self, task_id: &str) -> Vec<&TaskRun> {
        self.task_run_list
            .iter()
            .filter(|run| run.task_id == task_id)
            .collect()
    }

    /// Last run in list order that has not terminated.
    pub fn find_last_not_terminated(&self) -> Option<&TaskRun> {
        self.task_run_list
            .iter()
            .rev()
            .find(|run| !run.is_terminated())
    }

    /// Whether an inbound result can still be folded into this execution.
    ///
    /// Rejects results for unknown runs and late transient states arriving
    /// after the run already terminated (a RUNNING result after SUCCESS).
    pub fn has_task_run_joinable(&self, incoming: &TaskRun) -> bool {
        match self
            .task_run_list
            .iter()
            .find(|existing| existing.is_same(incoming))
        {
            None => false,
            Some(existing) => {
                !(existing.is_terminated() && !incoming.is_terminated())
            }
        }
    }

    /// Any FAILED run among the given task ids.
    pub fn has_failed_for(&self, task_ids: &[&str]) -> bool {
        self.task_run_list.iter().any(|run| {
            run.state.current.is_failed() && task_ids.contains(&run.task_id.as_str())
        })
    }

    /// Any run still in CREATED.
    pub fn has_created(&self) -> bool {
        self.task_run_list
            .iter()
            .any(|run| run.state.current.is_created())
    }

    pub fn non_terminated_count(&self) -> usize {
        self.task_run_list
            .iter()
            .filter(|run| !run.is_terminated())
            .count()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminated()
    }

    /// Identity of the flow this execution belongs to, revision dropped.
    pub fn flow_ident(&self) -> FlowIdent {
        FlowIdent::new(&self.tenant, &self.namespace, &self.flow_id)
    }

    /// Whether this execution was counted against its flow's concurrency
    /// limit. Only executions that actually reached RUNNING hold a slot; one
    /// killed straight out of the concurrency queue, or cancelled at
    /// admission, never did, so its termination must not decrement the
    /// counter.
    pub fn held_concurrency_slot(&self) -> bool {
        self.state.has_been(StateKind::Running)
    }

    /// Dedup state may be dropped once terminal; KILLED executions keep
    /// theirs for restart and audit.
    pub fn can_be_purged(&self) -> bool {
        self.state.is_terminated() && self.state.current != StateKind::Killed
    }

    /// Degrade to FAILED after an internal orchestration error, marking the
    /// last non-terminated run as failed too. Returns the execution plus the
    /// synthetic diagnostic message for the log sink.
    pub fn fail_on_internal_error(&self, error: &WeirError) -> (Self, String) {
        let message = format!(
            "Execution '{}' failed from an internal error: {error}",
            self.id
        );
        let next = match self.find_last_not_terminated() {
            Some(run) => {
                let failed_run = run.with_state(StateKind::Failed);
                self.with_task_run(failed_run)
                    .unwrap_or_else(|_| self.clone())
            }
            None => self.clone(),
        };
        (next.with_state(StateKind::Failed), message)
    }
}

/// Final-state precedence over a set of sibling runs: KILLED beats FAILED
/// beats WARNING beats SUCCESS, with `allow_failure` downgrading FAILED to
/// WARNING and `allow_warning` downgrading WARNING to SUCCESS.
pub fn guess_final_state<'a>(
    runs: impl Iterator<Item = &'a TaskRun>,
    allow_failure: bool,
    allow_warning: bool,
) -> StateKind {
    let mut has_failed = false;
    let mut has_warning = false;
    for run in runs {
        match run.state.current {
            StateKind::Killed => return StateKind::Killed,
            StateKind::Failed => has_failed = true,
            StateKind::Warning => has_warning = true,
            _ => {}
        }
    }
    if has_failed {
        if allow_failure {
            StateKind::Warning
        } else {
            StateKind::Failed
        }
    } else if has_warning {
        if allow_warning {
            StateKind::Success
        } else {
            StateKind::Warning
        }
    } else {
        StateKind::Success
    }
}
