//! # Task Run Model
//!
//! One instantiation of a task inside an execution.
//!
//! A task run is keyed by `(task_id, value, iteration)` plus the owning
//! parent task run for nested containers. Attempts are appended by workers,
//! one per try, each carrying its own state history; the engine reads
//! `attempts.len()` as the try count for retry bounds and dedup keys and
//! resets `state` to CREATED when an in-place retry fires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::state::{State, StateKind};

/// Task and flow outputs are free-form JSON maps.
pub type Outputs = serde_json::Map<String, serde_json::Value>;

/// One worker try of a task run, with its own state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunAttempt {
    pub state: State,
}

impl TaskRunAttempt {
    pub fn new(kind: StateKind) -> Self {
        TaskRunAttempt {
            state: State::new(kind),
        }
    }

    pub fn with_state(&self, kind: StateKind) -> Self {
        TaskRunAttempt {
            state: self.state.with_state(kind),
        }
    }
}

/// One instantiation of a task within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub task_id: String,
    /// Owning composite task run for nested/looping structures.
    #[serde(default)]
    pub parent_task_run_id: Option<Uuid>,
    /// Value for each-style expansions.
    #[serde(default)]
    pub value: Option<String>,
    /// Iteration counter for loop-style expansions.
    #[serde(default)]
    pub iteration: Option<u32>,
    pub state: State,
    #[serde(default)]
    pub attempts: Vec<TaskRunAttempt>,
    #[serde(default)]
    pub outputs: Option<Outputs>,
    /// After-execution tasks run even while the execution is being killed.
    #[serde(default)]
    pub force_execution: bool,
}

impl TaskRun {
    /// Fresh CREATED task run.
    pub fn create(
        execution_id: Uuid,
        task_id: impl Into<String>,
        parent_task_run_id: Option<Uuid>,
        value: Option<String>,
        iteration: Option<u32>,
    ) -> Self {
        TaskRun {
            id: Uuid::new_v4(),
            execution_id,
            task_id: task_id.into(),
            parent_task_run_id,
            value,
            iteration,
            state: State::new(StateKind::Created),
            attempts: Vec::new(),
            outputs: None,
            force_execution: false,
        }
    }

    pub fn with_state(&self, kind: StateKind) -> Self {
        let mut next = self.clone();
        next.state = self.state.with_state(kind);
        next
    }

    pub fn with_outputs(&self, outputs: Outputs) -> Self {
        let mut next = self.clone();
        next.outputs = Some(outputs);
        next
    }

    pub fn with_attempt(&self, attempt: TaskRunAttempt) -> Self {
        let mut next = self.clone();
        next.attempts.push(attempt);
        next
    }

    pub fn with_iteration(&self, iteration: u32) -> Self {
        let mut next = self.clone();
        next.iteration = Some(iteration);
        next
    }

    pub fn with_force_execution(&self) -> Self {
        let mut next = self.clone();
        next.force_execution = true;
        next
    }

    /// Number of worker tries so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// End timestamp of the latest attempt, falling back to the run's own
    /// last transition; anchor for retry backoff scheduling.
    pub fn last_activity_date(&self) -> DateTime<Utc> {
        self.attempts
            .last()
            .map(|attempt| attempt.state.max_date())
            .unwrap_or_else(|| self.state.max_date())
    }

    /// Same logical run: identity plus expansion coordinates.
    pub fn is_same(&self, other: &TaskRun) -> bool {
        self.id == other.id && self.value == other.value && self.iteration == other.iteration
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminated()
    }
}
