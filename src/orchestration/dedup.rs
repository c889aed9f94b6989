//! # Deduplication State
//!
//! Per-execution markers defending the core against at-least-once delivery.
//!
//! ## Overview
//!
//! Every execution row carries an [`ExecutorState`] that is loaded and
//! persisted under the same lock as the execution itself. Three marker maps
//! cover the three double-processing hazards:
//!
//! - **task run creation**: a re-delivered execution message must not append
//!   the same next task runs twice
//! - **worker dispatch**: a re-processed snapshot must not submit the same
//!   task run attempt to a worker twice
//! - **subflow creation**: a re-processed snapshot must not start the same
//!   child execution twice
//!
//! Rejections are logged and dropped; they are expected under duplicate
//! delivery, never an error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::models::state::StateKind;
use crate::models::task_run::TaskRun;

/// Dedup markers for one execution, persisted with the execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorState {
    pub execution_id: Uuid,
    /// Next-task-run creation markers: slot key to created task run id.
    child_dedup: HashMap<String, Uuid>,
    /// Worker dispatch markers: attempt key to last dispatched state.
    worker_task_dedup: HashMap<String, StateKind>,
    /// Subflow creation markers: attempt key to last seen parent state.
    subflow_dedup: HashMap<String, StateKind>,
}

fn opt_string<T: ToString>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "null".to_string())
}

impl ExecutorState {
    pub fn new(execution_id: Uuid) -> Self {
        ExecutorState {
            execution_id,
            child_dedup: HashMap::new(),
            worker_task_dedup: HashMap::new(),
            subflow_dedup: HashMap::new(),
        }
    }

    fn nexts_key(run: &TaskRun) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            opt_string(&run.parent_task_run_id),
            run.task_id,
            opt_string(&run.value),
            run.attempt_count(),
            opt_string(&run.iteration),
        )
    }

    fn worker_task_key(run: &TaskRun) -> String {
        format!(
            "{}-{}-{}",
            run.id,
            run.attempt_count(),
            opt_string(&run.iteration)
        )
    }

    /// Keep only the task runs whose creation slot has not been recorded yet,
    /// recording the survivors.
    pub fn filter_new_nexts(&mut self, nexts: Vec<TaskRun>) -> Vec<TaskRun> {
        nexts
            .into_iter()
            .filter(|run| {
                let key = Self::nexts_key(run);
                if self.child_dedup.contains_key(&key) {
                    warn!(
                        execution_id = %self.execution_id,
                        key = %key,
                        "duplicate next task run creation, skipping"
                    );
                    false
                } else {
                    self.child_dedup.insert(key, run.id);
                    true
                }
            })
            .collect()
    }

    /// Whether this task run may be dispatched to a worker in its current
    /// state. A second dispatch of the same attempt in the same state is a
    /// duplicate; a new attempt (or a state change) is legitimate.
    pub fn accept_worker_task(&mut self, run: &TaskRun) -> bool {
        let key = Self::worker_task_key(run);
        if self.worker_task_dedup.get(&key) == Some(&run.state.current) {
            warn!(
                execution_id = %self.execution_id,
                task_run_id = %run.id,
                task_id = %run.task_id,
                state = %run.state.current,
                "duplicate worker task dispatch, skipping"
            );
            false
        } else {
            self.worker_task_dedup.insert(key, run.state.current);
            true
        }
    }

    /// Whether a subflow may be started for this parent task run state.
    pub fn accept_subflow_execution(&mut self, run: &TaskRun) -> bool {
        let mut key = run.id.to_string();
        if !run.attempts.is_empty() {
            key.push_str(&format!("-{}", run.attempts.len()));
        }
        if let Some(iteration) = run.iteration {
            key.push_str(&format!("-{iteration}"));
        }

        if self.subflow_dedup.get(&key) == Some(&run.state.current) {
            warn!(
                execution_id = %self.execution_id,
                task_run_id = %run.id,
                task_id = %run.task_id,
                state = %run.state.current,
                "duplicate subflow execution, skipping"
            );
            false
        } else {
            self.subflow_dedup.insert(key, run.state.current);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::state::State;

    fn created_run(task_id: &str) -> TaskRun {
        TaskRun::create(Uuid::new_v4(), task_id, None, None, None)
    }

    #[test]
    fn test_nexts_filtered_on_second_delivery() {
        let mut state = ExecutorState::new(Uuid::new_v4());
        let run = created_run("a");

        let first = state.filter_new_nexts(vec![run.clone()]);
        assert_eq!(first.len(), 1);

        // same slot again, even with a fresh task run id
        let mut replay = created_run("a");
        replay.value = run.value.clone();
        assert!(state.filter_new_nexts(vec![replay]).is_empty());
    }

    #[test]
    fn test_nexts_distinct_values_accepted() {
        let mut state = ExecutorState::new(Uuid::new_v4());
        let mut x = created_run("each-child");
        x.value = Some("x".to_string());
        let mut y = created_run("each-child");
        y.value = Some("y".to_string());

        assert_eq!(state.filter_new_nexts(vec![x, y]).len(), 2);
    }

    #[test]
    fn test_worker_task_same_state_rejected() {
        let mut state = ExecutorState::new(Uuid::new_v4());
        let run = created_run("a");

        assert!(state.accept_worker_task(&run));
        assert!(!state.accept_worker_task(&run));

        // retry resets the run to CREATED with one more attempt: new key
        let retried = run.with_attempt(crate::models::task_run::TaskRunAttempt::new(
            StateKind::Failed,
        ));
        assert!(state.accept_worker_task(&retried));
    }

    #[test]
    fn test_subflow_state_change_accepted() {
        let mut state = ExecutorState::new(Uuid::new_v4());
        let run = created_run("sub");

        assert!(state.accept_subflow_execution(&run));
        assert!(!state.accept_subflow_execution(&run));

        let mut running = run.clone();
        running.state = State::new(StateKind::Created).with_state(StateKind::Running);
        assert!(state.accept_subflow_execution(&running));
    }
}
