//! # Flow Triggers
//!
//! Starts new executions when other flows' executions change state.
//!
//! Every persisted state change is matched against the latest revision of
//! every flow in the same tenant. A trigger whose conditions are plain
//! per-execution filters fires inline; a trigger carrying multi-flow
//! preconditions is deferred through the multiple-condition queue and a
//! windowed store, and fires only once every filter matched inside the
//! window.
//!
//! Firing is gated by the [`TriggerStateStore`]: while a fired execution is
//! still in flight the trigger stays armed-but-held, and the coordinator
//! releases it when that execution terminates.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::error::WeirResult;
use crate::messaging::messages::MultipleConditionEvent;
use crate::models::execution::{Execution, ExecutionTrigger};
use crate::models::flow::{Flow, FlowTrigger};
use crate::models::JsonMap;
use crate::storage::{
    FlowStore, MultipleConditionStore, MultipleConditionWindow, TriggerStateStore,
};

/// Evaluates flow triggers against execution state changes.
pub struct FlowTriggerService {
    flow_store: Arc<FlowStore>,
    trigger_state: Arc<dyn TriggerStateStore>,
    condition_store: Arc<dyn MultipleConditionStore>,
}

impl FlowTriggerService {
    pub fn new(
        flow_store: Arc<FlowStore>,
        trigger_state: Arc<dyn TriggerStateStore>,
        condition_store: Arc<dyn MultipleConditionStore>,
    ) -> Self {
        FlowTriggerService {
            flow_store,
            trigger_state,
            condition_store,
        }
    }

    /// Evaluate one state change against every flow of the tenant.
    ///
    /// Returns the executions fired by simple-condition triggers plus the
    /// events to defer for windowed triggers. Windowed triggers are always
    /// deferred, even when the current change matches no filter: the
    /// consumer owns the window bookkeeping and filtering.
    pub async fn process_state_change(
        &self,
        execution: &Execution,
    ) -> WeirResult<(Vec<Execution>, Vec<MultipleConditionEvent>)> {
        let mut fired = Vec::new();
        let mut deferred = Vec::new();

        for flow in self.flow_store.all_latest() {
            if flow.tenant != execution.tenant || flow.disabled {
                continue;
            }
            // A flow listening to itself would loop forever.
            if flow.namespace == execution.namespace && flow.id == execution.flow_id {
                continue;
            }

            for trigger in &flow.triggers {
                if trigger.preconditions.is_some() {
                    deferred.push(MultipleConditionEvent {
                        flow: (*flow).clone(),
                        execution: execution.clone(),
                    });
                    continue;
                }

                let matched = trigger.conditions.iter().any(|condition| {
                    condition.matches(
                        &execution.namespace,
                        &execution.flow_id,
                        execution.state.current,
                    )
                });
                if !matched {
                    continue;
                }

                if let Some(new_execution) = self.fire(&flow, trigger, execution).await? {
                    fired.push(new_execution);
                }
            }
        }

        Ok((fired, deferred))
    }

    /// Fold one deferred event into the trigger's window, firing the flow
    /// when every precondition filter has matched inside it.
    ///
    /// An expired window is dropped first, so the current change starts a
    /// fresh one instead of completing a stale accumulation.
    pub async fn evaluate_multiple_condition(
        &self,
        event: &MultipleConditionEvent,
    ) -> WeirResult<Vec<Execution>> {
        let mut fired = Vec::new();
        let now = Utc::now();

        for trigger in &event.flow.triggers {
            let Some(preconditions) = &trigger.preconditions else {
                continue;
            };
            let uid = trigger_uid(&event.flow, trigger);

            let mut window = match self.condition_store.find(&uid).await? {
                Some(existing) if existing.is_expired(now) => {
                    debug!(trigger_uid = %uid, "expired multiple-condition window dropped");
                    self.condition_store.delete(&uid).await?;
                    MultipleConditionWindow::new(&uid, now, preconditions.window_ms)
                }
                Some(existing) => existing,
                None => MultipleConditionWindow::new(&uid, now, preconditions.window_ms),
            };

            for (index, filter) in preconditions.flows.iter().enumerate() {
                if filter.matches(
                    &event.execution.namespace,
                    &event.execution.flow_id,
                    event.execution.state.current,
                ) {
                    window.mark(index);
                }
            }

            if window.is_complete(preconditions.flows.len()) {
                self.condition_store.delete(&uid).await?;
                if let Some(new_execution) =
                    self.fire(&event.flow, trigger, &event.execution).await?
                {
                    fired.push(new_execution);
                }
            } else {
                self.condition_store.save(window).await?;
            }
        }

        Ok(fired)
    }

    /// Drop windows whose deadline passed without completing.
    pub async fn purge_expired_windows(&self) -> WeirResult<usize> {
        let expired = self.condition_store.pop_expired(Utc::now()).await?;
        for window in &expired {
            debug!(trigger_uid = %window.trigger_uid, "multiple-condition window expired");
        }
        Ok(expired.len())
    }

    /// Release the in-flight marker once a fired execution terminates.
    pub async fn release(&self, execution: &Execution) -> WeirResult<()> {
        self.trigger_state.release_by_execution(execution.id).await
    }

    /// Build and arm the triggered execution; `None` when the trigger is
    /// already in flight for a previous execution.
    async fn fire(
        &self,
        flow: &Flow,
        trigger: &FlowTrigger,
        source: &Execution,
    ) -> WeirResult<Option<Execution>> {
        let new_execution = Execution::create(flow, JsonMap::new(), Vec::new()).with_trigger(
            ExecutionTrigger {
                id: trigger.id.clone(),
                variables: serde_json::json!({
                    "namespace": source.namespace,
                    "flowId": source.flow_id,
                    "executionId": source.id,
                    "state": source.state.current,
                }),
            },
        );

        let uid = trigger_uid(flow, trigger);
        if !self.trigger_state.acquire(&uid, new_execution.id).await? {
            debug!(trigger_uid = %uid, "trigger already in flight, not firing");
            return Ok(None);
        }
        Ok(Some(new_execution))
    }
}

fn trigger_uid(flow: &Flow, trigger: &FlowTrigger) -> String {
    format!("{}/{}/{}/{}", flow.tenant, flow.namespace, flow.id, trigger.id)
}
