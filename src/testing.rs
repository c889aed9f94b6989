//! # Testing
//!
//! In-process harness for exercising the engine end to end. [`TestEngine`]
//! wires a [`Coordinator`] to in-memory queues and stores, spawns its
//! consumer loops, and runs a simulated worker that answers every
//! dispatched task, so integration tests can submit an execution and
//! simply await its terminal state.
//!
//! By default the simulated worker answers SUCCESS with no outputs;
//! [`TestEngine::with_outcome`] and [`TestEngine::with_outputs`] override
//! that per task id. [`TestEngine::without_worker`] leaves dispatched
//! tasks on the queue for tests that play the worker themselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::error;
use uuid::Uuid;

use crate::config::WeirConfig;
use crate::coordinator::{Coordinator, CoordinatorQueues, CoordinatorStores};
use crate::error::{WeirError, WeirResult};
use crate::messaging::{WorkerTask, WorkerTaskResult};
use crate::models::{
    Execution, Flow, FlowableDef, JsonMap, Outputs, RunnableDef, StateKind, TaskDef, TaskKind,
};
use crate::orchestration::execution_service::with_attempt_state;
use crate::orchestration::WorkerGroupRegistry;
use crate::storage::FlowStore;

/// A leaf task the simulated worker will answer.
pub fn runnable(id: &str) -> TaskDef {
    TaskDef {
        id: id.to_string(),
        kind: TaskKind::Runnable(RunnableDef {
            plugin: "noop".to_string(),
            params: serde_json::Value::Null,
        }),
        retry: None,
        allow_failure: false,
        allow_warning: false,
        worker_group: None,
    }
}

/// A container whose children run one at a time, in order.
pub fn sequential(id: &str, tasks: Vec<TaskDef>) -> TaskDef {
    TaskDef {
        id: id.to_string(),
        kind: TaskKind::Flowable(FlowableDef::Sequential { tasks }),
        retry: None,
        allow_failure: false,
        allow_warning: false,
        worker_group: None,
    }
}

/// A container whose children run concurrently, capped by `concurrency`
/// (0 = unbounded).
pub fn parallel(id: &str, concurrency: usize, tasks: Vec<TaskDef>) -> TaskDef {
    TaskDef {
        id: id.to_string(),
        kind: TaskKind::Flowable(FlowableDef::Parallel { tasks, concurrency }),
        retry: None,
        allow_failure: false,
        allow_warning: false,
        worker_group: None,
    }
}

/// A single-revision flow in the `main` tenant and `dev` namespace.
pub fn flow(id: &str, tasks: Vec<TaskDef>) -> Flow {
    namespaced_flow("dev", id, tasks)
}

/// A single-revision flow in the `main` tenant and the given namespace.
pub fn namespaced_flow(namespace: &str, id: &str, tasks: Vec<TaskDef>) -> Flow {
    Flow {
        tenant: "main".to_string(),
        namespace: namespace.to_string(),
        id: id.to_string(),
        revision: 1,
        tasks,
        errors: vec![],
        finally_tasks: vec![],
        listeners: vec![],
        after_execution: vec![],
        outputs: vec![],
        retry: None,
        concurrency: None,
        sla: vec![],
        triggers: vec![],
        disabled: false,
    }
}

/// What the simulated worker answers for one task id.
#[derive(Debug, Clone)]
struct TaskOutcome {
    state: StateKind,
    outputs: Option<Outputs>,
}

impl Default for TaskOutcome {
    fn default() -> Self {
        TaskOutcome {
            state: StateKind::Success,
            outputs: None,
        }
    }
}

/// A coordinator plus a simulated worker, running in-process.
pub struct TestEngine {
    coordinator: Arc<Coordinator>,
    outcomes: HashMap<String, TaskOutcome>,
    worker_latency: Option<Duration>,
    run_worker: bool,
    handles: Vec<JoinHandle<()>>,
}

impl TestEngine {
    /// An engine over the given flows with the default configuration.
    pub fn new(flows: Vec<Flow>) -> Self {
        Self::with_config(WeirConfig::default(), flows)
    }

    pub fn with_config(config: WeirConfig, flows: Vec<Flow>) -> Self {
        let capacity = config.queues.capacity;
        let flow_store = Arc::new(FlowStore::with_flows(flows));
        let coordinator = Arc::new(Coordinator::new(
            config,
            CoordinatorQueues::in_memory(capacity),
            CoordinatorStores::in_memory(flow_store),
            Arc::new(WorkerGroupRegistry::new()),
        ));
        TestEngine {
            coordinator,
            outcomes: HashMap::new(),
            worker_latency: None,
            run_worker: true,
            handles: Vec::new(),
        }
    }

    /// Answer `task_id` with `state` instead of SUCCESS.
    pub fn with_outcome(mut self, task_id: &str, state: StateKind) -> Self {
        self.outcomes.entry(task_id.to_string()).or_default().state = state;
        self
    }

    /// Attach `outputs` to the result for `task_id`.
    pub fn with_outputs(mut self, task_id: &str, outputs: Outputs) -> Self {
        self.outcomes.entry(task_id.to_string()).or_default().outputs = Some(outputs);
        self
    }

    /// Delay every simulated worker answer, to hold executions in RUNNING
    /// long enough for a test to observe or interrupt them.
    pub fn with_worker_latency(mut self, latency: Duration) -> Self {
        self.worker_latency = Some(latency);
        self
    }

    /// Leave dispatched worker tasks on the queue; the test plays the
    /// worker itself.
    pub fn without_worker(mut self) -> Self {
        self.run_worker = false;
        self
    }

    /// Spawn the coordinator loops and, unless disabled, the simulated
    /// worker.
    pub fn start(mut self) -> Self {
        let coordinator = Arc::clone(&self.coordinator);
        self.handles.push(tokio::spawn(coordinator.run()));
        if self.run_worker {
            let worker = SimulatedWorker {
                coordinator: Arc::clone(&self.coordinator),
                outcomes: Arc::new(std::mem::take(&mut self.outcomes)),
                latency: self.worker_latency,
            };
            self.handles.push(tokio::spawn(worker.run()));
        }
        self
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn queues(&self) -> &CoordinatorQueues {
        self.coordinator.queues()
    }

    pub fn stores(&self) -> &CoordinatorStores {
        self.coordinator.stores()
    }

    /// Create an execution of `flow` and enqueue it.
    pub async fn submit(&self, flow: &Flow, inputs: JsonMap) -> WeirResult<Execution> {
        let execution = Execution::create(flow, inputs, Vec::new());
        self.submit_execution(execution.clone()).await?;
        Ok(execution)
    }

    /// Enqueue a pre-built execution (scheduled date, labels, trigger).
    pub async fn submit_execution(&self, execution: Execution) -> WeirResult<()> {
        self.coordinator
            .queues()
            .execution
            .emit(execution)
            .await
            .map_err(WeirError::from)
    }

    /// Poll the store until the execution reaches a terminal state.
    pub async fn await_terminal(
        &self,
        execution_id: Uuid,
        timeout: Duration,
    ) -> WeirResult<Execution> {
        self.await_matching(execution_id, timeout, |execution| {
            execution.state.is_terminated()
        })
        .await
    }

    /// Poll the store until the execution has passed through `state`.
    pub async fn await_state(
        &self,
        execution_id: Uuid,
        state: StateKind,
        timeout: Duration,
    ) -> WeirResult<Execution> {
        self.await_matching(execution_id, timeout, move |execution| {
            execution.state.has_been(state)
        })
        .await
    }

    /// Poll until some execution of the given flow exists and return the
    /// first match. `flow_uid` is the revision-less flow identity, for
    /// example `main/dev/etl`.
    pub async fn await_flow_execution(
        &self,
        flow_uid: &str,
        timeout: Duration,
    ) -> WeirResult<Execution> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found = self.coordinator.stores().executions.find_by_flow(flow_uid).await?;
            if let Some(execution) = found.into_iter().next() {
                return Ok(execution);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WeirError::internal(format!(
                    "timed out waiting for an execution of flow {flow_uid}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the execution has a live child, returning it.
    pub async fn await_active_child(
        &self,
        parent_execution_id: Uuid,
        timeout: Duration,
    ) -> WeirResult<Execution> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let children = self
                .coordinator
                .stores()
                .executions
                .find_active_children(parent_execution_id)
                .await?;
            if let Some(child) = children.into_iter().next() {
                return Ok(child);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WeirError::internal(format!(
                    "timed out waiting for a child of execution {parent_execution_id}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn await_matching(
        &self,
        execution_id: Uuid,
        timeout: Duration,
        predicate: impl Fn(&Execution) -> bool,
    ) -> WeirResult<Execution> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(execution) = self.coordinator.stores().executions.find(execution_id).await?
            {
                if predicate(&execution) {
                    return Ok(execution);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WeirError::internal(format!(
                    "timed out waiting for execution {execution_id}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop the engine and wait for every spawned loop to exit.
    pub async fn shutdown(mut self) {
        self.coordinator.shutdown();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Consumes the worker task queue and answers each task with its
/// configured outcome, default SUCCESS.
struct SimulatedWorker {
    coordinator: Arc<Coordinator>,
    outcomes: Arc<HashMap<String, TaskOutcome>>,
    latency: Option<Duration>,
}

impl SimulatedWorker {
    async fn run(self) {
        let queue = Arc::clone(&self.coordinator.queues().worker_task);
        let results = Arc::clone(&self.coordinator.queues().worker_task_result);
        let shutdown = self.coordinator.shutdown_token();
        loop {
            tokio::select! {
                message = queue.receive() => {
                    let Some(task) = message else { break };
                    if let Some(latency) = self.latency {
                        tokio::time::sleep(latency).await;
                    }
                    if let Err(error) = results.emit(self.answer(task)).await {
                        error!(error = %error, "simulated worker could not emit a result");
                        break;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    fn answer(&self, task: WorkerTask) -> WorkerTaskResult {
        let outcome = self
            .outcomes
            .get(&task.task_run.task_id)
            .cloned()
            .unwrap_or_default();
        let running = with_attempt_state(&task.task_run, StateKind::Running);
        let mut finished = with_attempt_state(&running, outcome.state);
        if let Some(outputs) = outcome.outputs {
            finished = finished.with_outputs(outputs);
        }
        WorkerTaskResult::new(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_runs_a_flow_to_success() {
        let target = flow("smoke", vec![runnable("only")]);
        let engine = TestEngine::new(vec![target.clone()]).start();

        let execution = engine
            .submit(&target, JsonMap::new())
            .await
            .unwrap();
        let finished = engine
            .await_terminal(execution.id, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(finished.state.current, StateKind::Success);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_applies_configured_outcomes() {
        let target = flow("smoke", vec![runnable("breaks")]);
        let engine = TestEngine::new(vec![target.clone()])
            .with_outcome("breaks", StateKind::Failed)
            .start();

        let execution = engine
            .submit(&target, JsonMap::new())
            .await
            .unwrap();
        let finished = engine
            .await_terminal(execution.id, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(finished.state.current, StateKind::Failed);
        engine.shutdown().await;
    }
}
