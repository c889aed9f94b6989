//! # SLA Evaluation
//!
//! ## Overview
//!
//! Flows declare service-level rules of two kinds. Execution-condition rules
//! are re-evaluated by the coordinator on every state change, before the
//! orchestration pipeline runs. Max-duration rules become durable
//! [`SlaMonitor`] rows when the execution starts; a poller fires the ones
//! whose deadline passed and folds the violation back through the same
//! processing as condition rules.
//!
//! Only the first violation found in a pass updates the execution; further
//! ones are logged and dropped.

use chrono::{Duration, Utc};
use tracing::{error, warn};

use crate::messaging::messages::{ExecutionKilled, KillPhase, LogEntry, LogLevel};
use crate::models::execution::Execution;
use crate::models::flow::{Flow, Sla, SlaBehavior};
use crate::models::label::{self, Label};
use crate::models::state::StateKind;
use crate::render::{build_context, Renderer};
use crate::storage::SlaMonitor;

use super::executor::Executor;

/// A violated rule with everything needed to apply its behavior.
#[derive(Debug, Clone)]
pub struct Violation {
    pub sla_id: String,
    pub behavior: SlaBehavior,
    pub labels: Vec<Label>,
    pub reason: String,
}

pub struct SlaService {
    renderer: Renderer,
}

impl Default for SlaService {
    fn default() -> Self {
        Self::new()
    }
}

impl SlaService {
    pub fn new() -> Self {
        SlaService {
            renderer: Renderer::new(),
        }
    }

    /// Re-evaluate the flow's execution-condition rules after a state change.
    pub fn handle_execution_changed(&self, executor: &mut Executor) {
        if executor.flow.sla.is_empty() || executor.execution.state.is_terminated() {
            return;
        }
        let violations = self.evaluate_execution_changed(&executor.flow, &executor.execution);
        // Only the first violation is allowed to update the execution.
        let mut violations = violations.into_iter();
        if let Some(violation) = violations.next() {
            self.process_violation(executor, &violation);
        }
        for ignored in violations {
            warn!(
                execution_id = %executor.execution.id,
                sla_id = %ignored.sla_id,
                reason = %ignored.reason,
                "Further SLA violation ignored",
            );
        }
    }

    fn evaluate_execution_changed(&self, flow: &Flow, execution: &Execution) -> Vec<Violation> {
        let context = build_context(flow, execution, None);
        flow.sla
            .iter()
            .filter_map(|sla| {
                let Sla::ExecutionCondition {
                    id,
                    condition,
                    behavior,
                    labels,
                } = sla
                else {
                    return None;
                };
                match self.renderer.render_condition(condition, &context) {
                    Ok(true) => Some(Violation {
                        sla_id: id.clone(),
                        behavior: *behavior,
                        labels: labels.clone(),
                        reason: format!("condition '{condition}' evaluated to true"),
                    }),
                    Ok(false) => None,
                    Err(err) => {
                        warn!(
                            execution_id = %execution.id,
                            sla_id = %id,
                            error = %err,
                            "Unable to evaluate the SLA condition",
                        );
                        None
                    }
                }
            })
            .collect()
    }

    /// Check one max-duration rule against the wall clock. Returns `None`
    /// when the execution already terminated, whatever the deadline says.
    pub fn evaluate_monitoring(&self, execution: &Execution, sla: &Sla) -> Option<Violation> {
        let Sla::MaxDuration {
            id,
            duration_ms,
            behavior,
            labels,
        } = sla
        else {
            return None;
        };
        if execution.state.is_terminated() {
            return None;
        }
        let elapsed = Utc::now() - execution.state.started_date();
        if elapsed <= Duration::milliseconds(*duration_ms as i64) {
            return None;
        }
        Some(Violation {
            sla_id: id.clone(),
            behavior: *behavior,
            labels: labels.clone(),
            reason: format!(
                "execution duration of {}ms exceeded the maximum duration of {duration_ms}ms",
                elapsed.num_milliseconds()
            ),
        })
    }

    /// Durable deadline timers for the flow's max-duration rules, anchored at
    /// the execution's start date.
    pub fn monitors_for(flow: &Flow, execution: &Execution) -> Vec<SlaMonitor> {
        flow.sla
            .iter()
            .filter_map(|sla| {
                let Sla::MaxDuration {
                    id, duration_ms, ..
                } = sla
                else {
                    return None;
                };
                Some(SlaMonitor {
                    execution_id: execution.id,
                    sla_id: id.clone(),
                    deadline: execution.state.started_date()
                        + Duration::milliseconds(*duration_ms as i64),
                })
            })
            .collect()
    }

    /// Apply a violation: FAIL and CANCEL converge the execution (and kill
    /// its in-flight work), NONE only attaches the rule's labels.
    pub fn process_violation(&self, executor: &mut Executor, violation: &Violation) {
        let mut changed = false;
        let mut next = match violation.behavior {
            SlaBehavior::Fail => {
                let message = format!(
                    "Execution failed due to SLA '{}' violated: {}",
                    violation.sla_id, violation.reason
                );
                error!(execution_id = %executor.execution.id, "{message}");
                executor.add_log(LogEntry::of(&executor.execution, LogLevel::Error, message));
                changed = true;
                self.mark_as(executor, StateKind::Failed)
            }
            SlaBehavior::Cancel => {
                changed = true;
                self.mark_as(executor, StateKind::Cancelled)
            }
            SlaBehavior::None => executor.execution.clone(),
        };

        if !violation.labels.is_empty()
            && !label::contains_all(&executor.execution.labels, &violation.labels)
        {
            changed = true;
            next = next.with_merged_labels(&violation.labels);
        }

        if changed {
            executor.set_execution(next, "sla_violation");
        }
    }

    /// Converge the execution and its last live task run to `state`, and
    /// request a cascading kill so workers drop the in-flight tasks.
    fn mark_as(&self, executor: &mut Executor, state: StateKind) -> Execution {
        let next = match executor.execution.find_last_not_terminated() {
            // A run that cannot be swapped in is left alone.
            Some(run) => executor
                .execution
                .with_task_run(run.with_state(state))
                .unwrap_or_else(|_| executor.execution.clone()),
            None => executor.execution.clone(),
        }
        .with_state(state);
        executor.add_kill(ExecutionKilled {
            execution_id: executor.execution.id,
            tenant: executor.execution.tenant.clone(),
            phase: KillPhase::Requested,
            execution_state: Some(state),
            is_on_kill_cascade: true,
        });
        next
    }
}
