//! # Orchestration Pipeline
//!
//! The per-message heart of the engine: one pass over an [`Executor`]
//! snapshot, advancing the execution as far as the current task run states
//! allow and collecting every side effect (new runs, worker dispatches,
//! subflow starts, delays, kills, logs) for the coordinator to apply.
//!
//! ## Overview
//!
//! [`ExecutorService::process`] runs a fixed sequence of handlers. Each one
//! inspects the execution and mutates the snapshot through the executor's
//! recording methods, so a pass stays a pure function of (execution, flow)
//! modulo clock reads. Any handler error is parked on the executor as its
//! exception; the coordinator turns that into a failed execution rather than
//! crashing the loop.
//!
//! Handlers are deliberately single-pass: a transition applied in pass N is
//! often what unlocks the next handler in pass N+1, with the coordinator
//! re-emitting the execution between passes. Convergence, not completeness,
//! is the contract of one call.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::error::{WeirError, WeirResult};
use crate::graph::{self, ResolvedTask};
use crate::messaging::messages::{
    LogEntry, LogLevel, SubflowExecution, SubflowExecutionResult, WorkerTask, WorkerTaskResult,
};
use crate::models::execution::{Execution, ExecutionParent};
use crate::models::flow::{
    ConcurrencyBehavior, Flow, FlowIdent, FlowableDef, RetryBehavior, SubflowDef, TaskDef,
    TaskKind, UpdateLabelsDef, WorkerGroupFallback,
};
use crate::models::label::{self, Label};
use crate::models::state::StateKind;
use crate::models::task_run::{TaskRun, TaskRunAttempt};
use crate::models::{guess_final_state, JsonMap};
use crate::render::{build_context, Renderer};
use crate::storage::{ConcurrencyDecision, DelayType, ExecutionDelay, FlowStore};

use super::execution_service::{with_attempt_state, ExecutionService};
use super::executor::Executor;

/// Output key carrying a loop parent's current iteration counter.
///
/// Kept in the run's outputs rather than its `iteration` field: the field is
/// part of slot identity and changing it would orphan the parent's own slot.
const LOOP_ITERATION_KEY: &str = "iteration";

/// Live worker-group membership, fed by worker registration heartbeats.
///
/// Tasks pinned to a group are only dispatched while the group has at least
/// one worker; what happens otherwise is the task's fallback decision.
#[derive(Debug, Default)]
pub struct WorkerGroupRegistry {
    groups: DashMap<String, usize>,
}

impl WorkerGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<String>, workers: usize) {
        self.groups.insert(key.into(), workers);
    }

    pub fn deregister(&self, key: &str) {
        self.groups.remove(key);
    }

    /// The group is declared, whether or not any worker is up.
    pub fn exists(&self, key: &str) -> bool {
        self.groups.contains_key(key)
    }

    /// At least one worker currently serves the group.
    pub fn has_capacity(&self, key: &str) -> bool {
        self.groups.get(key).map(|count| *count > 0).unwrap_or(false)
    }
}

/// Whether a loop may start another iteration, finish, or fail out.
enum LoopOutcome {
    /// Neither the until condition nor the iteration bound is met.
    Continue,
    /// Done; the terminal state comes from the children.
    Finished,
    /// Iteration bound hit with the until condition still false.
    ExhaustedUnmet,
}

/// Stateless orchestration pass over one execution snapshot.
pub struct ExecutorService {
    renderer: Renderer,
    execution_service: ExecutionService,
    flow_store: Arc<FlowStore>,
    worker_groups: Arc<WorkerGroupRegistry>,
}

impl ExecutorService {
    pub fn new(flow_store: Arc<FlowStore>, worker_groups: Arc<WorkerGroupRegistry>) -> Self {
        ExecutorService {
            renderer: Renderer::new(),
            execution_service: ExecutionService::new(),
            flow_store,
            worker_groups,
        }
    }

    pub fn execution_service(&self) -> &ExecutionService {
        &self.execution_service
    }

    /// One full pipeline pass. Errors never escape: they are recorded as the
    /// executor's exception and resolved by the coordinator.
    pub fn process(&self, executor: &mut Executor) {
        if !executor.can_be_processed()
            || self
                .execution_service
                .is_terminated(&executor.flow, &executor.execution)
        {
            return;
        }
        if let Err(err) = self.run_pipeline(executor) {
            executor.set_exception(err, "process");
        }
    }

    fn run_pipeline(&self, executor: &mut Executor) -> WeirResult<()> {
        self.handle_restart(executor);
        self.handle_end(executor)?;
        self.handle_created_killing(executor)?;
        self.handle_killing(executor);

        if !matches!(
            executor.execution.state.current,
            StateKind::Killing | StateKind::Killed | StateKind::Queued
        ) {
            self.handle_next(executor);
            self.handle_child_next(executor);
        }

        self.handle_after_execution(executor);
        self.handle_worker_task(executor)?;
        self.handle_child_worker_task_result(executor)?;
        self.handle_execution_updating_task(executor)?;
        self.handle_executable_task(executor);
        Ok(())
    }

    /// A restarted execution (resume, rearmed retry) goes back to RUNNING.
    fn handle_restart(&self, executor: &mut Executor) {
        if executor.execution.state.current != StateKind::Restarted {
            return;
        }
        executor.add_log(LogEntry::of(
            &executor.execution,
            LogLevel::Info,
            "Flow restarted",
        ));
        info!(execution_id = %executor.execution.id, "Flow restarted");
        let next = executor.execution.with_state(StateKind::Running);
        executor.set_execution(next, "handle_restart");
    }

    /// Conclude the execution once every top-level slot of the active branch
    /// holds a terminated run.
    fn handle_end(&self, executor: &mut Executor) -> WeirResult<()> {
        let state = &executor.execution.state;
        if state.is_terminated() || state.is_paused() || state.is_retrying() {
            return Ok(());
        }
        let flow = Arc::clone(&executor.flow);
        let scope = graph::find_tasks_depending_flow_state(
            &executor.execution,
            &flow.tasks,
            &flow.errors,
            &flow.finally_tasks,
            None,
        );
        if !graph::is_terminated(&executor.execution, &scope) {
            return Ok(());
        }
        self.on_end(executor)
    }

    fn on_end(&self, executor: &mut Executor) -> WeirResult<()> {
        let flow = Arc::clone(&executor.flow);
        // Only top-level runs of the main tasks decide the final state; a
        // child failure that its container absorbed must not resurface here.
        let scope = graph::resolve_tasks(&flow.tasks, None);
        let final_state = guess_final_state(
            graph::find_task_runs(&executor.execution, &scope).into_iter(),
            false,
            false,
        );
        let mut next = executor.execution.with_state(final_state);

        if !flow.outputs.is_empty() {
            let context = build_context(&flow, &next, None);
            match self.render_flow_outputs(&flow, &context) {
                Ok(outputs) => next = next.with_outputs(outputs),
                Err(err) => {
                    error!(execution_id = %next.id, error = %err, "Failed to render output values");
                    executor.add_log(LogEntry::of(
                        &next,
                        LogLevel::Error,
                        format!("Failed to render output values: {err}"),
                    ));
                    next = next.with_state(StateKind::Failed);
                }
            }
        }

        let duration = next.state.duration();
        executor.add_log(LogEntry::of(
            &next,
            LogLevel::Info,
            format!(
                "Flow completed with state {} in {}ms",
                next.state.current,
                duration.num_milliseconds()
            ),
        ));
        info!(
            execution_id = %next.id,
            state = %next.state.current,
            duration_ms = duration.num_milliseconds(),
            "Flow completed",
        );
        executor.set_execution(next, "on_end");
        Ok(())
    }

    fn render_flow_outputs(
        &self,
        flow: &Flow,
        context: &serde_json::Value,
    ) -> WeirResult<JsonMap> {
        let mut outputs = JsonMap::new();
        for output in &flow.outputs {
            let rendered = self.renderer.render_value(&output.value, context)?;
            let typed = output.output_type.resolve(&output.id, rendered)?;
            outputs.insert(output.id.clone(), typed);
        }
        Ok(outputs)
    }

    /// Under a kill, runs that never started are killed synthetically; they
    /// have no worker to report back for them. Post-terminal runs flagged
    /// force-execution are exempt.
    fn handle_created_killing(&self, executor: &mut Executor) -> WeirResult<()> {
        if executor.execution.state.current != StateKind::Killing {
            return Ok(());
        }
        let results: Vec<WorkerTaskResult> = executor
            .execution
            .task_run_list
            .iter()
            .filter(|run| run.state.current.is_created() && !run.force_execution)
            .map(|run| WorkerTaskResult::new(run.with_state(StateKind::Killed)))
            .collect();
        self.add_worker_task_results(executor, results)
    }

    /// A KILLING execution becomes KILLED only once no task run is left
    /// running; in-flight work gets to report its own terminal state first.
    fn handle_killing(&self, executor: &mut Executor) {
        if executor.execution.state.current != StateKind::Killing {
            return;
        }
        if executor.execution.non_terminated_count() > 0 {
            return;
        }
        let next = executor.execution.with_state(StateKind::Killed);
        executor.set_execution(next, "handle_killing");
    }

    /// Create the next top-level task runs of the active branch.
    fn handle_next(&self, executor: &mut Executor) {
        let flow = Arc::clone(&executor.flow);
        let scope = graph::find_tasks_depending_flow_state(
            &executor.execution,
            &flow.tasks,
            &flow.errors,
            &flow.finally_tasks,
            None,
        );
        let nexts = graph::resolve_sequential_nexts(&executor.execution, &scope);
        if nexts.is_empty() {
            return;
        }
        let prepared = self.save_flowable_output(executor, nexts);
        executor.add_nexts(prepared);
    }

    /// Create child task runs for every running container, each container
    /// kind deciding its own next slots.
    fn handle_child_next(&self, executor: &mut Executor) {
        let running: Vec<TaskRun> = executor
            .execution
            .task_run_list
            .iter()
            .filter(|run| run.state.is_running())
            .cloned()
            .collect();
        if running.is_empty() {
            return;
        }

        let mut nexts = Vec::new();
        for run in &running {
            match self.child_nexts(executor, run) {
                Ok(resolved) => nexts.extend(resolved),
                Err(err) => {
                    // A broken expression inside a container must not sink the
                    // whole execution; the container simply creates nothing.
                    warn!(
                        execution_id = %executor.execution.id,
                        task_run_id = %run.id,
                        error = %err,
                        "Unable to resolve the next tasks to run",
                    );
                }
            }
        }
        if nexts.is_empty() {
            return;
        }
        let prepared = self.save_flowable_output(executor, nexts);
        executor.add_nexts(prepared);
    }

    fn child_nexts(&self, executor: &Executor, parent: &TaskRun) -> WeirResult<Vec<TaskRun>> {
        let flow = Arc::clone(&executor.flow);
        let Some(task) = flow.find_task(&parent.task_id) else {
            return Ok(Vec::new());
        };
        let Some(flowable) = task.as_flowable() else {
            return Ok(Vec::new());
        };
        let scope = self.flowable_scope(flowable, executor, parent)?;
        let nexts = match flowable {
            FlowableDef::Parallel { concurrency, .. } => {
                graph::resolve_parallel_nexts(&executor.execution, &scope, *concurrency)
            }
            _ => graph::resolve_sequential_nexts(&executor.execution, &scope),
        };
        Ok(nexts)
    }

    /// Resolve a container's child slots. Each/If render against the parent's
    /// task run context; Loop scopes to the current iteration.
    fn flowable_scope<'a>(
        &self,
        flowable: &'a FlowableDef,
        executor: &Executor,
        parent: &TaskRun,
    ) -> WeirResult<Vec<ResolvedTask<'a>>> {
        match flowable {
            FlowableDef::Sequential { tasks } | FlowableDef::Parallel { tasks, .. } => {
                Ok(graph::resolve_tasks(tasks, Some(parent)))
            }
            FlowableDef::Each { values, tasks } => {
                let context = build_context(&executor.flow, &executor.execution, Some(parent));
                let rendered: Vec<String> = values
                    .iter()
                    .map(|value| self.renderer.render_str(value, &context))
                    .collect::<Result<_, _>>()?;
                graph::resolve_each_tasks(&rendered, tasks, parent)
            }
            FlowableDef::If {
                condition,
                then_tasks,
                else_tasks,
            } => {
                let context = build_context(&executor.flow, &executor.execution, Some(parent));
                let branch = if self.renderer.render_condition(condition, &context)? {
                    then_tasks
                } else {
                    else_tasks
                };
                Ok(graph::resolve_tasks(branch, Some(parent)))
            }
            FlowableDef::Loop { tasks, .. } => Ok(graph::resolve_iteration_tasks(
                tasks,
                parent,
                loop_iteration(parent),
            )),
        }
    }

    /// Prepare freshly resolved runs: containers get their initial CREATED
    /// attempt, loop parents get their iteration counter seeded.
    fn save_flowable_output(&self, executor: &Executor, nexts: Vec<TaskRun>) -> Vec<TaskRun> {
        nexts
            .into_iter()
            .map(|run| {
                let Some(task) = executor.flow.find_task(&run.task_id) else {
                    return run;
                };
                match &task.kind {
                    TaskKind::Flowable(def) => {
                        let mut next = run;
                        if matches!(def, FlowableDef::Loop { .. }) {
                            next = with_loop_iteration(&next, 1);
                        }
                        if next.state.current.is_created() {
                            next = next.with_attempt(TaskRunAttempt::new(StateKind::Created));
                        }
                        next
                    }
                    TaskKind::Pause(_) if run.state.current.is_created() => {
                        run.with_attempt(TaskRunAttempt::new(StateKind::Created))
                    }
                    _ => run,
                }
            })
            .collect()
    }

    /// Post-terminal phase: listeners first, sequentially, then the
    /// after-execution tasks, which run even under a kill.
    fn handle_after_execution(&self, executor: &mut Executor) {
        if !executor.execution.state.is_terminated() {
            return;
        }
        let flow = Arc::clone(&executor.flow);

        let listener_scope = graph::resolve_tasks(&flow.listeners, None);
        let listener_nexts = graph::resolve_sequential_nexts(&executor.execution, &listener_scope);
        if !listener_nexts.is_empty() {
            let prepared = self.save_flowable_output(executor, listener_nexts);
            executor.add_nexts(prepared);
            return;
        }
        if !graph::is_terminated(&executor.execution, &listener_scope) {
            return;
        }

        let after_scope = graph::resolve_tasks(&flow.after_execution, None);
        let after_nexts: Vec<TaskRun> =
            graph::resolve_sequential_nexts(&executor.execution, &after_scope)
                .into_iter()
                .map(|run| run.with_force_execution())
                .collect();
        if !after_nexts.is_empty() {
            let prepared = self.save_flowable_output(executor, after_nexts);
            executor.add_nexts(prepared);
        }
    }

    /// Turn CREATED task runs into worker dispatches, applying worker-group
    /// routing and breakpoint suspension on the way.
    fn handle_worker_task(&self, executor: &mut Executor) -> WeirResult<()> {
        if executor.execution.state.current == StateKind::Killing {
            return Ok(());
        }
        let flow = Arc::clone(&executor.flow);
        let created: Vec<TaskRun> = executor
            .execution
            .task_run_list
            .iter()
            .filter(|run| run.state.current.is_created())
            .cloned()
            .collect();
        if created.is_empty() {
            return Ok(());
        }

        let mut ended: Vec<WorkerTaskResult> = Vec::new();
        let mut processing: Vec<WorkerTask> = Vec::new();

        for run in created {
            let Some(task) = flow.find_task(&run.task_id) else {
                return Err(WeirError::internal(format!(
                    "task '{}' not found in flow '{}'",
                    run.task_id, flow.id
                )));
            };
            let context = build_context(&flow, &executor.execution, Some(&run));
            let variables = context.as_object().cloned().unwrap_or_default();
            let mut worker_task = WorkerTask {
                task_run: run.clone(),
                task: task.clone(),
                variables,
                worker_group_key: None,
            };

            if let Some(group) = &task.worker_group {
                let key = self.renderer.render_str(&group.key, &context)?;
                if !self.worker_groups.exists(&key) {
                    let message = format!(
                        "Cannot run the task '{}': no worker group exists for key '{key}'",
                        task.id
                    );
                    error!(execution_id = %executor.execution.id, task_id = %task.id, "{message}");
                    executor.add_log(
                        LogEntry::of(&executor.execution, LogLevel::Error, message)
                            .with_task_run(run.id),
                    );
                    worker_task.task_run = with_attempt_state(&run, StateKind::Failed);
                } else if !self.worker_groups.has_capacity(&key) {
                    match group.fallback {
                        WorkerGroupFallback::Wait => {
                            // Leave the run CREATED; a later pass dispatches it
                            // once a worker joins the group.
                            debug!(
                                execution_id = %executor.execution.id,
                                task_id = %task.id,
                                worker_group = %key,
                                "No worker available, task stays pending",
                            );
                            continue;
                        }
                        WorkerGroupFallback::Fail => {
                            let message = format!(
                                "No worker available in group '{key}', failing the task '{}'",
                                task.id
                            );
                            executor.add_log(
                                LogEntry::of(&executor.execution, LogLevel::Error, message)
                                    .with_task_run(run.id),
                            );
                            worker_task.task_run = with_attempt_state(&run, StateKind::Failed);
                        }
                        WorkerGroupFallback::Cancel => {
                            let message = format!(
                                "No worker available in group '{key}', cancelling the task '{}'",
                                task.id
                            );
                            executor.add_log(
                                LogEntry::of(&executor.execution, LogLevel::Info, message)
                                    .with_task_run(run.id),
                            );
                            worker_task.task_run = with_attempt_state(&run, StateKind::Cancelled);
                        }
                    }
                } else {
                    worker_task.worker_group_key = Some(key);
                }
            }

            if matches!(
                worker_task.task_run.state.current,
                StateKind::Failed | StateKind::Cancelled
            ) {
                ended.push(WorkerTaskResult::new(worker_task.task_run));
            } else {
                processing.push(worker_task);
            }
        }

        self.suspend_on_breakpoints(executor);

        if !ended.is_empty() {
            self.add_worker_task_results(executor, ended)?;
        }
        if !processing.is_empty() && executor.execution.state.current != StateKind::Breakpoint {
            for worker_task in processing {
                executor.add_worker_task(worker_task);
            }
        }
        Ok(())
    }

    /// Suspend the execution when a CREATED run matches a registered
    /// breakpoint. Dispatch is withheld until the breakpoint is released.
    fn suspend_on_breakpoints(&self, executor: &mut Executor) {
        if executor.execution.breakpoints.is_empty() {
            return;
        }
        let breakpoints = executor.execution.breakpoints.clone();
        let matches_breakpoint = |run: &TaskRun| {
            run.state.current.is_created()
                && breakpoints
                    .iter()
                    .any(|bp| bp.task_id == run.task_id && (bp.value.is_none() || bp.value == run.value))
        };
        if !executor.execution.task_run_list.iter().any(matches_breakpoint) {
            return;
        }

        let updated: Vec<TaskRun> = executor
            .execution
            .task_run_list
            .iter()
            .map(|run| {
                if matches_breakpoint(run) {
                    run.with_state(StateKind::Breakpoint)
                } else {
                    run.clone()
                }
            })
            .collect();
        let next = executor
            .execution
            .with_task_run_list(updated)
            .with_state(StateKind::Breakpoint);
        executor.add_log(LogEntry::of(
            &next,
            LogLevel::Info,
            "Flow is suspended at a breakpoint.",
        ));
        info!(execution_id = %next.id, "Flow is suspended at a breakpoint");
        executor.set_execution(next, "suspend_on_breakpoints");
    }

    /// Fold child states up into container results, arm retries for failed
    /// runs, pace loop iterations and schedule pause delays.
    fn handle_child_worker_task_result(&self, executor: &mut Executor) -> WeirResult<()> {
        let flow = Arc::clone(&executor.flow);
        // Deliberately iterate a snapshot: transitions applied mid-loop settle
        // on the next pass instead of cascading inside this one.
        let runs: Vec<TaskRun> = executor.execution.task_run_list.clone();
        let mut results: Vec<WorkerTaskResult> = Vec::new();
        let mut delays: Vec<ExecutionDelay> = Vec::new();

        for run in &runs {
            let task = flow.find_task(&run.task_id);

            if run.state.is_running() {
                if let Some(task) = task {
                    if let Some(result) = self.child_worker_task_result(executor, task, run)? {
                        results.push(result);
                    }
                }
            }

            let retryable = task
                .map(|t| matches!(t.kind, TaskKind::Runnable(_) | TaskKind::Subflow(_)))
                .unwrap_or(false);
            if !executor.execution.state.is_retrying()
                && run.state.current.is_failed()
                && retryable
            {
                if let Some(task) = task {
                    self.handle_retry_task(executor, task, run, &mut delays, &mut results)?;
                }
            } else if run.state.current == StateKind::Running {
                if let Some(task) = task {
                    if matches!(task.kind, TaskKind::Flowable(FlowableDef::Loop { .. })) {
                        self.handle_loop_continuation(executor, task, run, &mut delays)?;
                    }
                }
            }

            // A retrying child's parent must not conclude off its old failure.
            if run.state.is_retrying() {
                if let Some(parent_id) = run.parent_task_run_id {
                    results.retain(|result| result.task_run.id != parent_id);
                }
            }

            // A container forced terminal (kill, SLA) drags its still-open
            // children to the same state so nothing dangles.
            if task.map(|t| t.is_flowable()).unwrap_or(false) && run.is_terminated() {
                let stuck: Vec<TaskRun> = executor
                    .execution
                    .find_children(run.id)
                    .into_iter()
                    .filter(|child| !child.is_terminated())
                    .map(|child| child.with_state(run.state.current))
                    .collect();
                for child in stuck {
                    executor.set_task_run(child, "terminate_stuck_children")?;
                }
            }
        }

        for delay in delays {
            executor.add_delay(delay);
        }
        if results.is_empty() {
            return Ok(());
        }
        self.handle_paused_delay(executor, &results)?;
        self.add_worker_task_results(executor, results)
    }

    /// State a running container (or pause task) should take now, if any.
    fn child_worker_task_result(
        &self,
        executor: &mut Executor,
        task: &TaskDef,
        parent: &TaskRun,
    ) -> WeirResult<Option<WorkerTaskResult>> {
        if let TaskKind::Pause(_) = &task.kind {
            let state = match parent.state.current {
                // A pause that already went through PAUSED is a resumed one.
                StateKind::Running if parent.state.has_been(StateKind::Paused) => {
                    StateKind::Success
                }
                StateKind::Running => StateKind::Paused,
                _ => return Ok(None),
            };
            return Ok(Some(WorkerTaskResult::new(with_attempt_state(
                parent, state,
            ))));
        }

        let Some(flowable) = task.as_flowable() else {
            return Ok(None);
        };

        let resolved = match self.resolve_container_state(executor, task, flowable, parent) {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    execution_id = %executor.execution.id,
                    task_id = %task.id,
                    error = %err,
                    "Unable to resolve the container state, failing it",
                );
                executor.add_log(
                    LogEntry::of(
                        &executor.execution,
                        LogLevel::Error,
                        format!("Unable to resolve the state of task '{}': {err}", task.id),
                    )
                    .with_task_run(parent.id),
                );
                Some(StateKind::Failed)
            }
        };
        if let Some(state) = resolved {
            return Ok(Some(WorkerTaskResult::new(with_attempt_state(
                parent, state,
            ))));
        }

        if executor.execution.state.current == StateKind::Killing {
            if parent.state.current != StateKind::Killing {
                return Ok(Some(WorkerTaskResult::new(with_attempt_state(
                    parent,
                    StateKind::Killing,
                ))));
            }
            let scope = self.flowable_scope(flowable, executor, parent)?;
            let children = graph::find_task_runs(&executor.execution, &scope);
            if children.iter().all(|child| child.is_terminated()) {
                return Ok(Some(WorkerTaskResult::new(with_attempt_state(
                    parent,
                    StateKind::Killed,
                ))));
            }
        }
        Ok(None)
    }

    fn resolve_container_state(
        &self,
        executor: &Executor,
        task: &TaskDef,
        flowable: &FlowableDef,
        parent: &TaskRun,
    ) -> WeirResult<Option<StateKind>> {
        if let FlowableDef::Loop {
            tasks,
            max_iterations,
            until,
            ..
        } = flowable
        {
            let iteration = loop_iteration(parent);
            let scope = graph::resolve_iteration_tasks(tasks, parent, iteration);
            if !graph::is_terminated(&executor.execution, &scope) {
                return Ok(None);
            }
            if graph::has_failed(&executor.execution, &scope) {
                return Ok(graph::resolve_scope_state(
                    &executor.execution,
                    &scope,
                    parent,
                    task.allow_failure,
                    task.allow_warning,
                ));
            }
            return match self.loop_outcome(executor, parent, until.as_deref(), iteration, *max_iterations)? {
                LoopOutcome::Finished => Ok(graph::resolve_scope_state(
                    &executor.execution,
                    &scope,
                    parent,
                    task.allow_failure,
                    task.allow_warning,
                )
                .or(Some(StateKind::Success))),
                LoopOutcome::ExhaustedUnmet => Ok(Some(StateKind::Failed)),
                LoopOutcome::Continue => Ok(None),
            };
        }

        let scope = self.flowable_scope(flowable, executor, parent)?;
        Ok(graph::resolve_scope_state(
            &executor.execution,
            &scope,
            parent,
            task.allow_failure,
            task.allow_warning,
        ))
    }

    /// Schedule the next loop iteration once the current one is fully
    /// terminated without failure and the loop is not done yet.
    fn handle_loop_continuation(
        &self,
        executor: &mut Executor,
        task: &TaskDef,
        parent: &TaskRun,
        delays: &mut Vec<ExecutionDelay>,
    ) -> WeirResult<()> {
        let Some(FlowableDef::Loop {
            tasks,
            max_iterations,
            until,
            interval_ms,
        }) = task.as_flowable()
        else {
            return Ok(());
        };

        let iteration = loop_iteration(parent);
        let scope = graph::resolve_iteration_tasks(tasks, parent, iteration);
        if !graph::is_terminated(&executor.execution, &scope)
            || graph::has_failed(&executor.execution, &scope)
        {
            return Ok(());
        }
        if !matches!(
            self.loop_outcome(executor, parent, until.as_deref(), iteration, *max_iterations)?,
            LoopOutcome::Continue
        ) {
            return Ok(());
        }

        // Counter advances now; firing the delay only has to wake the run.
        let advanced = with_loop_iteration(parent, iteration + 1);
        match interval_ms {
            Some(interval) => {
                delays.push(ExecutionDelay {
                    execution_id: executor.execution.id,
                    task_run_id: Some(parent.id),
                    date: Utc::now() + Duration::milliseconds(*interval as i64),
                    state: StateKind::Running,
                    delay_type: DelayType::ContinueFlowable,
                });
                executor.set_task_run(
                    advanced.with_state(StateKind::Paused),
                    "pause_loop_between_iterations",
                )?;
            }
            None => executor.set_task_run(advanced, "handle_loop_continuation")?,
        }
        Ok(())
    }

    fn loop_outcome(
        &self,
        executor: &Executor,
        parent: &TaskRun,
        until: Option<&str>,
        iteration: u32,
        max_iterations: u32,
    ) -> WeirResult<LoopOutcome> {
        let exhausted = max_iterations > 0 && iteration >= max_iterations;
        let Some(condition) = until else {
            return Ok(if exhausted {
                LoopOutcome::Finished
            } else {
                LoopOutcome::Continue
            });
        };
        let context = build_context(&executor.flow, &executor.execution, Some(parent));
        if self.renderer.render_condition(condition, &context)? {
            Ok(LoopOutcome::Finished)
        } else if exhausted {
            Ok(LoopOutcome::ExhaustedUnmet)
        } else {
            Ok(LoopOutcome::Continue)
        }
    }

    /// Arm a retry for a failed run when its effective policy still has
    /// attempts left; otherwise apply the allow-failure downgrade.
    fn handle_retry_task(
        &self,
        executor: &mut Executor,
        task: &TaskDef,
        run: &TaskRun,
        delays: &mut Vec<ExecutionDelay>,
        results: &mut Vec<WorkerTaskResult>,
    ) -> WeirResult<()> {
        let Some(policy) = executor.flow.retry_policy_for(&task.id).cloned() else {
            return Ok(());
        };
        let next_date = match policy.behavior() {
            RetryBehavior::CreateNewExecution => {
                policy.next_retry_date(executor.execution.attempt_number, Utc::now())
            }
            RetryBehavior::RetryFailedTask => {
                policy.next_retry_date(run.attempt_count(), run.last_activity_date())
            }
        };
        let Some(date) = next_date else {
            return Ok(());
        };

        let (delay_type, run_state, mark_execution) = match policy.behavior() {
            RetryBehavior::CreateNewExecution => {
                (DelayType::RestartFailedFlow, StateKind::Retried, true)
            }
            RetryBehavior::RetryFailedTask => {
                (DelayType::RestartFailedTask, StateKind::Retrying, false)
            }
        };
        delays.push(ExecutionDelay {
            execution_id: executor.execution.id,
            task_run_id: Some(run.id),
            date,
            state: StateKind::Running,
            delay_type,
        });
        let marked = self.execution_service.mark_with_task_run_as(
            &executor.execution,
            run.id,
            run_state,
            mark_execution,
        )?;
        executor.set_execution(marked, "handle_retry_task");
        debug!(
            execution_id = %executor.execution.id,
            task_run_id = %run.id,
            retry_at = %date,
            "Retry scheduled",
        );

        // The parent must not conclude from a failure that is being retried.
        if let Some(parent_id) = run.parent_task_run_id {
            results.retain(|result| result.task_run.id != parent_id);
        }
        Ok(())
    }

    /// Whether a retry policy would still grant this failure another attempt.
    fn has_remaining_retry(
        &self,
        flow: &Flow,
        task: &TaskDef,
        run: &TaskRun,
        execution: &Execution,
    ) -> bool {
        let Some(policy) = flow.retry_policy_for(&task.id) else {
            return false;
        };
        match policy.behavior() {
            RetryBehavior::CreateNewExecution => policy
                .next_retry_date(execution.attempt_number, Utc::now())
                .is_some(),
            RetryBehavior::RetryFailedTask => policy
                .next_retry_date(run.attempt_count(), run.last_activity_date())
                .is_some(),
        }
    }

    /// Turn PAUSED results into resume/timeout delays and pause the
    /// execution itself.
    fn handle_paused_delay(
        &self,
        executor: &mut Executor,
        results: &[WorkerTaskResult],
    ) -> WeirResult<()> {
        let flow = Arc::clone(&executor.flow);
        let mut any_paused = false;
        for result in results {
            if result.task_run.state.current != StateKind::Paused {
                continue;
            }
            any_paused = true;
            let Some(task) = flow.find_task(&result.task_run.task_id) else {
                continue;
            };
            let Some(pause) = task.as_pause() else {
                continue;
            };
            let (duration_ms, target) = match (pause.delay_ms, pause.timeout_ms) {
                (Some(delay), _) => (delay, pause.behavior.target_state()),
                (None, Some(timeout)) => (timeout, StateKind::Failed),
                (None, None) => continue,
            };
            executor.add_delay(ExecutionDelay {
                execution_id: executor.execution.id,
                task_run_id: Some(result.task_run.id),
                date: result.task_run.state.max_date() + Duration::milliseconds(duration_ms as i64),
                state: target,
                delay_type: DelayType::ResumeFlow,
            });
        }

        if any_paused && executor.execution.state.current != StateKind::Paused {
            let next = executor.execution.with_state(StateKind::Paused);
            executor.set_execution(next, "handle_paused_delay");
        }
        Ok(())
    }

    /// Start child executions for pending subflow dispatches.
    fn handle_executable_task(&self, executor: &mut Executor) {
        if executor.worker_tasks.is_empty() {
            return;
        }
        let flow = Arc::clone(&executor.flow);
        let mut kept: Vec<WorkerTask> = Vec::new();
        let mut started: Vec<SubflowExecution> = Vec::new();
        let mut immediate: Vec<SubflowExecutionResult> = Vec::new();

        for worker_task in std::mem::take(&mut executor.worker_tasks) {
            let Some(subflow) = worker_task.task.as_subflow().cloned() else {
                kept.push(worker_task);
                continue;
            };
            if let Err(err) = self.start_subflow_execution(
                executor,
                &flow,
                &worker_task,
                &subflow,
                &mut started,
                &mut immediate,
            ) {
                let failed = with_attempt_state(&worker_task.task_run, StateKind::Failed);
                if let Err(inner) = executor.set_task_run(failed, "handle_executable_task") {
                    error!(
                        execution_id = %executor.execution.id,
                        error = %inner,
                        "Unable to fail the subflow task run",
                    );
                }
                executor.set_exception(err, "handle_executable_task");
            }
        }

        executor.worker_tasks = kept;
        for subflow_execution in started {
            executor.add_subflow_execution(subflow_execution);
        }
        for result in immediate {
            executor.add_subflow_execution_result(result);
        }
    }

    fn start_subflow_execution(
        &self,
        executor: &mut Executor,
        flow: &Flow,
        worker_task: &WorkerTask,
        subflow: &SubflowDef,
        started: &mut Vec<SubflowExecution>,
        immediate: &mut Vec<SubflowExecutionResult>,
    ) -> WeirResult<()> {
        // Mark the parent running first so a late failure cannot re-dispatch.
        let running = with_attempt_state(&worker_task.task_run, StateKind::Running);
        executor.set_task_run(running.clone(), "start_subflow_execution")?;
        let context = build_context(flow, &executor.execution, Some(&running));

        let namespace = self.renderer.render_str(&subflow.namespace, &context)?;
        let flow_id = self.renderer.render_str(&subflow.flow_id, &context)?;
        let ident = FlowIdent::new(&flow.tenant, &namespace, &flow_id);
        let child_flow = match subflow.revision {
            Some(revision) => self.flow_store.find_revision(&ident, revision),
            None => self.flow_store.find_latest(&ident),
        }
        .ok_or_else(|| WeirError::not_found(format!("flow '{}'", ident.uid())))?;
        if child_flow.disabled {
            return Err(WeirError::internal(format!(
                "cannot start an execution of the disabled flow '{}'",
                ident.uid()
            )));
        }

        let mut inputs = JsonMap::new();
        for (key, value) in &subflow.inputs {
            inputs.insert(key.clone(), self.renderer.render_value(value, &context)?);
        }

        let mut labels: Vec<Label> = Vec::new();
        if subflow.inherit_labels {
            labels.extend(
                executor
                    .execution
                    .labels
                    .iter()
                    .filter(|l| !l.is_system())
                    .cloned(),
            );
        }
        for declared in &subflow.labels {
            let rendered = Label::new(
                self.renderer.render_str(&declared.key, &context)?,
                self.renderer.render_str(&declared.value, &context)?,
            );
            labels = label::merge(&labels, &[rendered]);
        }

        let mut child = Execution::create(&child_flow, inputs, labels).with_parent(ExecutionParent {
            execution_id: executor.execution.id,
            task_run_id: running.id,
            task_id: worker_task.task.id.clone(),
            waits: subflow.wait,
        });
        if let Some(template) = &subflow.schedule_date {
            let rendered = self.renderer.render_str(template, &context)?;
            let date = DateTime::parse_from_rfc3339(&rendered)
                .map_err(|err| {
                    WeirError::internal(format!(
                        "invalid schedule date '{rendered}' on task '{}': {err}",
                        worker_task.task.id
                    ))
                })?
                .with_timezone(&Utc);
            child = child.with_scheduled_date(date);
        }

        started.push(SubflowExecution {
            parent_task_run: running.clone(),
            execution: child.clone(),
        });

        if !subflow.wait {
            // Fire-and-forget: the parent task succeeds as soon as the child
            // is created.
            immediate.push(SubflowExecutionResult {
                child_execution_id: child.id,
                parent_task_run: with_attempt_state(&running, StateKind::Success),
                state: StateKind::Success,
            });
        }
        Ok(())
    }

    /// Apply label-updating tasks synchronously; they never reach a worker.
    fn handle_execution_updating_task(&self, executor: &mut Executor) -> WeirResult<()> {
        if executor.worker_tasks.is_empty() {
            return Ok(());
        }
        let flow = Arc::clone(&executor.flow);
        let mut kept: Vec<WorkerTask> = Vec::new();
        let mut results: Vec<WorkerTaskResult> = Vec::new();

        for worker_task in std::mem::take(&mut executor.worker_tasks) {
            let TaskKind::UpdateLabels(def) = worker_task.task.kind.clone() else {
                kept.push(worker_task);
                continue;
            };
            let mut running = worker_task.task_run.clone();
            running.attempts = vec![TaskRunAttempt::new(StateKind::Running)];
            let running = running.with_state(StateKind::Running);

            match self.apply_label_updates(executor, &flow, &def, &running) {
                Ok(()) => {
                    results.push(WorkerTaskResult::new(with_attempt_state(
                        &running,
                        StateKind::Success,
                    )));
                }
                Err(err) => {
                    results.push(WorkerTaskResult::new(with_attempt_state(
                        &running,
                        StateKind::Failed,
                    )));
                    executor.set_exception(err, "handle_execution_updating_task");
                }
            }
        }

        executor.worker_tasks = kept;
        self.add_worker_task_results(executor, results)
    }

    fn apply_label_updates(
        &self,
        executor: &mut Executor,
        flow: &Flow,
        def: &UpdateLabelsDef,
        running: &TaskRun,
    ) -> WeirResult<()> {
        let context = build_context(flow, &executor.execution, Some(running));
        let mut rendered: Vec<Label> = Vec::new();
        for declared in &def.labels {
            let key = self.renderer.render_str(&declared.key, &context)?;
            if key.starts_with(label::SYSTEM_PREFIX) {
                return Err(WeirError::internal(format!(
                    "system labels cannot be set from a task: '{key}'"
                )));
            }
            rendered.push(Label::new(
                key,
                self.renderer.render_str(&declared.value, &context)?,
            ));
        }
        let next = executor
            .execution
            .with_merged_labels(&rendered)
            .with_task_run(running.clone())?;
        executor.set_execution(next, "handle_execution_updating_task");
        Ok(())
    }

    /// Join one result into the execution: allow-warning downgrade, slot
    /// replacement and kill propagation up the parent chain.
    pub fn add_worker_task_result(
        &self,
        executor: &mut Executor,
        result: WorkerTaskResult,
    ) -> WeirResult<()> {
        let flow = Arc::clone(&executor.flow);
        let mut task_run = result.task_run;

        // Downgrades happen at the join so the raw FAILED never lands in the
        // execution, where it would decide the final state. Retries win over
        // allow-failure: the failure stays raw while attempts remain.
        if task_run.state.current == StateKind::Failed {
            if let Some(task) = flow.find_task(&task_run.task_id) {
                if task.allow_failure
                    && !self.has_remaining_retry(&flow, task, &task_run, &executor.execution)
                {
                    let target = if task.allow_warning {
                        StateKind::Success
                    } else {
                        StateKind::Warning
                    };
                    task_run = with_attempt_state(&task_run, target);
                }
            }
        }
        if task_run.state.current == StateKind::Warning {
            if let Some(task) = flow.find_task(&task_run.task_id) {
                if task.allow_warning {
                    task_run = with_attempt_state(&task_run, StateKind::Success);
                }
            }
        }

        let cascade_kill =
            task_run.state.current == StateKind::Killed && task_run.parent_task_run_id.is_some();
        let mut next = executor.execution.with_task_run(task_run.clone())?;
        if cascade_kill {
            next = self
                .execution_service
                .kill_parent_task_runs(&next, &task_run)?;
        }
        executor.set_execution(next, "add_worker_task_result");
        Ok(())
    }

    pub fn add_worker_task_results(
        &self,
        executor: &mut Executor,
        results: Vec<WorkerTaskResult>,
    ) -> WeirResult<()> {
        for result in results {
            self.add_worker_task_result(executor, result)?;
        }
        Ok(())
    }

    /// Concurrency gate for an execution about to start: decide against the
    /// live running count, inside the storage's count-then-apply critical
    /// section.
    pub fn process_execution_running(
        &self,
        flow: &Flow,
        running_count: usize,
        execution: Execution,
    ) -> ConcurrencyDecision {
        let Some(concurrency) = &flow.concurrency else {
            return ConcurrencyDecision::Proceed(execution.with_state(StateKind::Running));
        };
        if running_count < concurrency.limit {
            return ConcurrencyDecision::Proceed(execution.with_state(StateKind::Running));
        }
        match concurrency.behavior {
            ConcurrencyBehavior::Queue => {
                ConcurrencyDecision::Queue(execution.with_state(StateKind::Queued))
            }
            ConcurrencyBehavior::Cancel => {
                ConcurrencyDecision::Reject(execution.with_state(StateKind::Cancelled))
            }
            ConcurrencyBehavior::Fail => {
                let (failed, _) = execution.fail_on_internal_error(&WeirError::internal(
                    "Execution is FAILED due to concurrency limit exceeded",
                ));
                ConcurrencyDecision::Reject(failed)
            }
        }
    }

    /// Append deduplicated next runs and start the execution on its first
    /// ones.
    pub fn on_nexts(&self, executor: &mut Executor, nexts: Vec<TaskRun>) {
        if nexts.is_empty() {
            return;
        }
        let mut next = executor.execution.with_appended_task_runs(nexts);
        if executor.execution.state.current.is_created() {
            executor.add_log(LogEntry::of(
                &executor.execution,
                LogLevel::Info,
                "Flow started",
            ));
            info!(
                execution_id = %executor.execution.id,
                flow_id = %executor.execution.flow_id,
                "Flow started",
            );
            next = next.with_state(StateKind::Running);
        }
        executor.set_execution(next, "on_nexts");
    }
}

/// Current iteration of a loop parent, defaulting to the first.
fn loop_iteration(run: &TaskRun) -> u32 {
    run.outputs
        .as_ref()
        .and_then(|outputs| outputs.get(LOOP_ITERATION_KEY))
        .and_then(|value| value.as_u64())
        .map(|value| value as u32)
        .unwrap_or(1)
}

fn with_loop_iteration(run: &TaskRun, iteration: u32) -> TaskRun {
    let mut outputs = run.outputs.clone().unwrap_or_default();
    outputs.insert(
        LOOP_ITERATION_KEY.to_string(),
        serde_json::Value::from(iteration),
    );
    run.with_outputs(outputs)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::models::execution::Breakpoint;
    use crate::models::flow::{
        Concurrency, PauseBehavior, PauseDef, RetryPolicy, RunnableDef, WorkerGroup,
    };

    fn task(id: &str, kind: TaskKind) -> TaskDef {
        TaskDef {
            id: id.to_string(),
            kind,
            retry: None,
            allow_failure: false,
            allow_warning: false,
            worker_group: None,
        }
    }

    fn runnable(id: &str) -> TaskDef {
        task(
            id,
            TaskKind::Runnable(RunnableDef {
                plugin: "noop".to_string(),
                params: serde_json::Value::Null,
            }),
        )
    }

    fn flow_of(id: &str, tasks: Vec<TaskDef>) -> Flow {
        Flow {
            tenant: "main".to_string(),
            namespace: "dev".to_string(),
            id: id.to_string(),
            revision: 1,
            tasks,
            errors: Vec::new(),
            finally_tasks: Vec::new(),
            listeners: Vec::new(),
            after_execution: Vec::new(),
            outputs: Vec::new(),
            retry: None,
            concurrency: None,
            sla: Vec::new(),
            triggers: Vec::new(),
            disabled: false,
        }
    }

    fn service() -> ExecutorService {
        ExecutorService::new(
            Arc::new(FlowStore::new()),
            Arc::new(WorkerGroupRegistry::new()),
        )
    }

    fn running_execution(flow: &Flow) -> Execution {
        Execution::create(flow, JsonMap::new(), Vec::new()).with_state(StateKind::Running)
    }

    #[test]
    fn first_pass_resolves_only_the_first_task() {
        let flow = flow_of("pipeline", vec![runnable("a"), runnable("b")]);
        let execution = Execution::create(&flow, JsonMap::new(), Vec::new());
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        assert!(executor.exception.is_none());
        assert_eq!(executor.nexts.len(), 1);
        assert_eq!(executor.nexts[0].task_id, "a");
        assert!(executor.worker_tasks.is_empty());
    }

    #[test]
    fn on_nexts_starts_a_created_execution() {
        let flow = flow_of("pipeline", vec![runnable("a")]);
        let execution = Execution::create(&flow, JsonMap::new(), Vec::new());
        let svc = service();
        let mut executor = Executor::new(execution, Arc::new(flow));
        svc.process(&mut executor);
        let nexts = std::mem::take(&mut executor.nexts);

        svc.on_nexts(&mut executor, nexts);

        assert_eq!(executor.execution.state.current, StateKind::Running);
        assert_eq!(executor.execution.task_run_list.len(), 1);
        assert!(executor
            .logs
            .iter()
            .any(|log| log.message.contains("Flow started")));
    }

    #[test]
    fn created_runs_are_dispatched_to_workers() {
        let flow = flow_of("pipeline", vec![runnable("a"), runnable("b")]);
        let execution = running_execution(&flow);
        let run = TaskRun::create(execution.id, "a", None, None, None);
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        assert_eq!(executor.worker_tasks.len(), 1);
        assert_eq!(executor.worker_tasks[0].task_run.task_id, "a");
        assert!(executor.worker_tasks[0].worker_group_key.is_none());
        // Dispatch does not advance the run; the worker's own transitions do.
        assert_eq!(
            executor.execution.task_run_list[0].state.current,
            StateKind::Created
        );
    }

    #[test]
    fn sequential_flow_completes_with_success() {
        let flow = flow_of("pipeline", vec![runnable("a"), runnable("b")]);
        let execution = running_execution(&flow);
        let runs = vec![
            TaskRun::create(execution.id, "a", None, None, None).with_state(StateKind::Success),
            TaskRun::create(execution.id, "b", None, None, None).with_state(StateKind::Success),
        ];
        let execution = execution.with_appended_task_runs(runs);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        assert_eq!(executor.execution.state.current, StateKind::Success);
        assert!(executor
            .logs
            .iter()
            .any(|log| log.message.contains("Flow completed with state SUCCESS")));
    }

    #[test]
    fn failure_switches_to_the_error_branch() {
        let mut flow = flow_of("pipeline", vec![runnable("a")]);
        flow.errors = vec![runnable("rescue")];
        let execution = running_execution(&flow);
        let run =
            TaskRun::create(execution.id, "a", None, None, None).with_state(StateKind::Failed);
        let execution = execution.with_appended_task_runs(vec![run]);
        let svc = service();
        let mut executor = Executor::new(execution, Arc::new(flow.clone()));

        svc.process(&mut executor);

        assert_eq!(executor.nexts.len(), 1);
        assert_eq!(executor.nexts[0].task_id, "rescue");
        assert_eq!(executor.execution.state.current, StateKind::Running);

        // Once the error branch is done, the raw failure still decides the
        // final state.
        let rescue = TaskRun::create(executor.execution.id, "rescue", None, None, None)
            .with_state(StateKind::Success);
        let execution = executor.execution.with_appended_task_runs(vec![rescue]);
        let mut executor = Executor::new(execution, Arc::new(flow));
        svc.process(&mut executor);

        assert_eq!(executor.execution.state.current, StateKind::Failed);
    }

    #[test]
    fn container_children_fold_into_the_parent() {
        let wrap = task(
            "wrap",
            TaskKind::Flowable(FlowableDef::Sequential {
                tasks: vec![runnable("a")],
            }),
        );
        let flow = flow_of("pipeline", vec![wrap]);
        let execution = running_execution(&flow);
        let parent = TaskRun::create(execution.id, "wrap", None, None, None)
            .with_state(StateKind::Running)
            .with_attempt(TaskRunAttempt::new(StateKind::Running));
        let parent_id = parent.id;
        let child = TaskRun::create(execution.id, "a", Some(parent_id), None, None)
            .with_state(StateKind::Success);
        let execution = execution.with_appended_task_runs(vec![parent, child]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        let folded = executor.execution.find_task_run(parent_id).unwrap();
        assert_eq!(folded.state.current, StateKind::Success);
        assert!(executor.nexts.is_empty());
    }

    #[test]
    fn each_expands_one_slot_per_value_in_order() {
        let fan = task(
            "fan",
            TaskKind::Flowable(FlowableDef::Each {
                values: vec!["x".to_string(), "y".to_string()],
                tasks: vec![runnable("child")],
            }),
        );
        let flow = flow_of("pipeline", vec![fan]);
        let execution = running_execution(&flow);
        let parent = TaskRun::create(execution.id, "fan", None, None, None)
            .with_state(StateKind::Running)
            .with_attempt(TaskRunAttempt::new(StateKind::Running));
        let parent_id = parent.id;
        let execution = execution.with_appended_task_runs(vec![parent]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        assert_eq!(executor.nexts.len(), 1);
        assert_eq!(executor.nexts[0].task_id, "child");
        assert_eq!(executor.nexts[0].value.as_deref(), Some("x"));
        assert_eq!(executor.nexts[0].parent_task_run_id, Some(parent_id));
    }

    #[test]
    fn pause_task_pauses_the_execution() {
        let hold = task(
            "hold",
            TaskKind::Pause(PauseDef {
                delay_ms: Some(60_000),
                timeout_ms: None,
                behavior: PauseBehavior::Resume,
            }),
        );
        let flow = flow_of("pipeline", vec![hold]);
        let execution = running_execution(&flow);
        let run = TaskRun::create(execution.id, "hold", None, None, None)
            .with_state(StateKind::Running)
            .with_attempt(TaskRunAttempt::new(StateKind::Running));
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        let paused = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(paused.state.current, StateKind::Paused);
        assert_eq!(executor.execution.state.current, StateKind::Paused);
        assert_eq!(executor.execution_delays.len(), 1);
        let delay = &executor.execution_delays[0];
        assert_eq!(delay.delay_type, DelayType::ResumeFlow);
        assert_eq!(delay.state, StateKind::Running);
        assert_eq!(delay.task_run_id, Some(run_id));
        assert_eq!(
            delay.date,
            paused.state.max_date() + Duration::milliseconds(60_000)
        );
    }

    #[test]
    fn resumed_pause_completes_on_the_next_pass() {
        let hold = task(
            "hold",
            TaskKind::Pause(PauseDef {
                delay_ms: None,
                timeout_ms: None,
                behavior: PauseBehavior::Resume,
            }),
        );
        let flow = flow_of("pipeline", vec![hold]);
        let execution = Execution::create(&flow, JsonMap::new(), Vec::new())
            .with_state(StateKind::Running)
            .with_state(StateKind::Paused)
            .with_state(StateKind::Restarted);
        let run = TaskRun::create(execution.id, "hold", None, None, None)
            .with_state(StateKind::Running)
            .with_state(StateKind::Paused)
            .with_state(StateKind::Running)
            .with_attempt(TaskRunAttempt::new(StateKind::Running));
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run]);
        let flow = Arc::new(flow);
        let svc = service();
        let mut executor = Executor::new(execution, Arc::clone(&flow));

        svc.process(&mut executor);

        assert!(executor
            .logs
            .iter()
            .any(|log| log.message.contains("Flow restarted")));
        let resumed = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(resumed.state.current, StateKind::Success);

        let mut executor = Executor::new(executor.execution.clone(), flow);
        svc.process(&mut executor);
        assert_eq!(executor.execution.state.current, StateKind::Success);
    }

    #[test]
    fn failed_run_with_retries_left_schedules_a_restart() {
        let mut flaky = runnable("a");
        flaky.retry = Some(RetryPolicy::Constant {
            interval_ms: 1_000,
            max_attempts: 3,
            behavior: RetryBehavior::RetryFailedTask,
        });
        let flow = flow_of("pipeline", vec![flaky]);
        let execution = running_execution(&flow);
        let run = with_attempt_state(
            &TaskRun::create(execution.id, "a", None, None, None).with_state(StateKind::Running),
            StateKind::Failed,
        );
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        // The pass concludes the execution off the raw failure; the delay
        // later revives it through a restart.
        assert_eq!(executor.execution.state.current, StateKind::Failed);
        let retrying = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(retrying.state.current, StateKind::Retrying);
        assert_eq!(executor.execution_delays.len(), 1);
        let delay = &executor.execution_delays[0];
        assert_eq!(delay.delay_type, DelayType::RestartFailedTask);
        assert_eq!(delay.state, StateKind::Running);
        assert_eq!(delay.task_run_id, Some(run_id));
    }

    #[test]
    fn exhausted_retries_leave_the_failure_standing() {
        let mut flaky = runnable("a");
        flaky.retry = Some(RetryPolicy::Constant {
            interval_ms: 1_000,
            max_attempts: 3,
            behavior: RetryBehavior::RetryFailedTask,
        });
        let flow = flow_of("pipeline", vec![flaky]);
        let execution = running_execution(&flow);
        let run = TaskRun::create(execution.id, "a", None, None, None)
            .with_state(StateKind::Running)
            .with_attempt(TaskRunAttempt::new(StateKind::Failed))
            .with_attempt(TaskRunAttempt::new(StateKind::Failed))
            .with_attempt(TaskRunAttempt::new(StateKind::Failed))
            .with_state(StateKind::Failed);
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        assert!(executor.execution_delays.is_empty());
        let run = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(run.state.current, StateKind::Failed);
        assert_eq!(executor.execution.state.current, StateKind::Failed);
    }

    #[test]
    fn allowed_failure_joins_as_a_warning() {
        let mut soft = runnable("soft");
        soft.allow_failure = true;
        let flow = flow_of("pipeline", vec![soft]);
        let execution = running_execution(&flow);
        let run = TaskRun::create(execution.id, "soft", None, None, None)
            .with_state(StateKind::Running);
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run.clone()]);
        let mut executor = Executor::new(execution, Arc::new(flow));
        let svc = service();

        svc.add_worker_task_result(
            &mut executor,
            WorkerTaskResult::new(with_attempt_state(&run, StateKind::Failed)),
        )
        .unwrap();

        let joined = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(joined.state.current, StateKind::Warning);
    }

    #[test]
    fn allowed_failure_and_warning_join_as_success() {
        let mut soft = runnable("soft");
        soft.allow_failure = true;
        soft.allow_warning = true;
        let flow = flow_of("pipeline", vec![soft]);
        let execution = running_execution(&flow);
        let run = TaskRun::create(execution.id, "soft", None, None, None)
            .with_state(StateKind::Running);
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run.clone()]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service()
            .add_worker_task_result(
                &mut executor,
                WorkerTaskResult::new(with_attempt_state(&run, StateKind::Failed)),
            )
            .unwrap();

        let joined = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(joined.state.current, StateKind::Success);
    }

    #[test]
    fn pending_retries_outrank_the_failure_downgrade() {
        let mut soft = runnable("soft");
        soft.allow_failure = true;
        soft.retry = Some(RetryPolicy::Constant {
            interval_ms: 1_000,
            max_attempts: 3,
            behavior: RetryBehavior::RetryFailedTask,
        });
        let flow = flow_of("pipeline", vec![soft]);
        let execution = running_execution(&flow);
        let run = TaskRun::create(execution.id, "soft", None, None, None)
            .with_state(StateKind::Running);
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run.clone()]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service()
            .add_worker_task_result(
                &mut executor,
                WorkerTaskResult::new(with_attempt_state(&run, StateKind::Failed)),
            )
            .unwrap();

        // The failure stays raw so the retry pass can pick it up.
        let joined = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(joined.state.current, StateKind::Failed);
    }

    #[test]
    fn loop_parent_schedules_the_next_iteration() {
        let poll = task(
            "poll",
            TaskKind::Flowable(FlowableDef::Loop {
                tasks: vec![runnable("probe")],
                max_iterations: 3,
                until: None,
                interval_ms: Some(5_000),
            }),
        );
        let flow = flow_of("pipeline", vec![poll]);
        let execution = running_execution(&flow);
        let parent = TaskRun::create(execution.id, "poll", None, None, None)
            .with_state(StateKind::Running)
            .with_attempt(TaskRunAttempt::new(StateKind::Running));
        let parent_id = parent.id;
        let probe = TaskRun::create(execution.id, "probe", Some(parent_id), None, Some(1))
            .with_state(StateKind::Success);
        let execution = execution.with_appended_task_runs(vec![parent, probe]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        let paced = executor.execution.find_task_run(parent_id).unwrap();
        assert_eq!(paced.state.current, StateKind::Paused);
        assert_eq!(loop_iteration(paced), 2);
        assert_eq!(executor.execution_delays.len(), 1);
        let delay = &executor.execution_delays[0];
        assert_eq!(delay.delay_type, DelayType::ContinueFlowable);
        assert_eq!(delay.state, StateKind::Running);
        assert_eq!(delay.task_run_id, Some(parent_id));
    }

    #[test]
    fn exhausted_loop_with_unmet_condition_fails() {
        let poll = task(
            "poll",
            TaskKind::Flowable(FlowableDef::Loop {
                tasks: vec![runnable("probe")],
                max_iterations: 2,
                until: Some("{{ false }}".to_string()),
                interval_ms: None,
            }),
        );
        let flow = flow_of("pipeline", vec![poll]);
        let execution = running_execution(&flow);
        let parent = with_loop_iteration(
            &TaskRun::create(execution.id, "poll", None, None, None)
                .with_state(StateKind::Running)
                .with_attempt(TaskRunAttempt::new(StateKind::Running)),
            2,
        );
        let parent_id = parent.id;
        let first = TaskRun::create(execution.id, "probe", Some(parent_id), None, Some(1))
            .with_state(StateKind::Success);
        let second = TaskRun::create(execution.id, "probe", Some(parent_id), None, Some(2))
            .with_state(StateKind::Success);
        let execution = execution.with_appended_task_runs(vec![parent, first, second]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        let failed = executor.execution.find_task_run(parent_id).unwrap();
        assert_eq!(failed.state.current, StateKind::Failed);
        assert!(executor.execution_delays.is_empty());
    }

    #[test]
    fn concurrency_gate_queues_over_the_limit() {
        let mut flow = flow_of("pipeline", vec![runnable("a")]);
        flow.concurrency = Some(Concurrency {
            limit: 1,
            behavior: ConcurrencyBehavior::Queue,
        });
        let execution = Execution::create(&flow, JsonMap::new(), Vec::new());
        let svc = service();

        let proceed = svc.process_execution_running(&flow, 0, execution.clone());
        assert!(matches!(proceed, ConcurrencyDecision::Proceed(_)));
        assert_eq!(proceed.execution().state.current, StateKind::Running);

        let queued = svc.process_execution_running(&flow, 1, execution);
        assert!(matches!(queued, ConcurrencyDecision::Queue(_)));
        assert_eq!(queued.execution().state.current, StateKind::Queued);
    }

    #[test]
    fn concurrency_gate_rejects_per_behavior() {
        let mut flow = flow_of("pipeline", vec![runnable("a")]);
        flow.concurrency = Some(Concurrency {
            limit: 1,
            behavior: ConcurrencyBehavior::Cancel,
        });
        let execution = Execution::create(&flow, JsonMap::new(), Vec::new());
        let svc = service();

        let cancelled = svc.process_execution_running(&flow, 1, execution.clone());
        assert!(matches!(cancelled, ConcurrencyDecision::Reject(_)));
        assert_eq!(cancelled.execution().state.current, StateKind::Cancelled);

        flow.concurrency = Some(Concurrency {
            limit: 1,
            behavior: ConcurrencyBehavior::Fail,
        });
        let failed = svc.process_execution_running(&flow, 1, execution);
        assert!(matches!(failed, ConcurrencyDecision::Reject(_)));
        assert_eq!(failed.execution().state.current, StateKind::Failed);
    }

    #[test]
    fn breakpoints_suspend_instead_of_dispatching() {
        let flow = flow_of("pipeline", vec![runnable("a")]);
        let mut execution = running_execution(&flow);
        execution.breakpoints = vec![Breakpoint {
            task_id: "a".to_string(),
            value: None,
        }];
        let run = TaskRun::create(execution.id, "a", None, None, None);
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        assert!(executor.worker_tasks.is_empty());
        assert_eq!(executor.execution.state.current, StateKind::Breakpoint);
        let suspended = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(suspended.state.current, StateKind::Breakpoint);
        assert!(executor
            .logs
            .iter()
            .any(|log| log.message.contains("suspended at a breakpoint")));
    }

    #[test]
    fn missing_worker_group_fails_the_dispatch() {
        let mut gpu = runnable("a");
        gpu.worker_group = Some(WorkerGroup {
            key: "gpu".to_string(),
            fallback: WorkerGroupFallback::Fail,
        });
        let flow = flow_of("pipeline", vec![gpu]);
        let execution = running_execution(&flow);
        let run = TaskRun::create(execution.id, "a", None, None, None);
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        assert!(executor.worker_tasks.is_empty());
        let failed = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(failed.state.current, StateKind::Failed);
        assert!(executor
            .logs
            .iter()
            .any(|log| log.message.contains("no worker group exists")));
    }

    #[test]
    fn saturated_worker_group_waits_without_dispatching() {
        let mut gpu = runnable("a");
        gpu.worker_group = Some(WorkerGroup {
            key: "gpu".to_string(),
            fallback: WorkerGroupFallback::Wait,
        });
        let flow = flow_of("pipeline", vec![gpu]);
        let execution = running_execution(&flow);
        let run = TaskRun::create(execution.id, "a", None, None, None);
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));
        let groups = WorkerGroupRegistry::new();
        groups.register("gpu", 0);
        let svc = ExecutorService::new(Arc::new(FlowStore::new()), Arc::new(groups));

        svc.process(&mut executor);

        assert!(executor.worker_tasks.is_empty());
        let pending = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(pending.state.current, StateKind::Created);
    }

    #[test]
    fn update_labels_task_applies_rendered_labels() {
        let tag = task(
            "tag",
            TaskKind::UpdateLabels(UpdateLabelsDef {
                labels: vec![Label::new("env", "{{ inputs.env }}")],
            }),
        );
        let flow = flow_of("pipeline", vec![tag]);
        let mut inputs = JsonMap::new();
        inputs.insert("env".to_string(), serde_json::Value::from("prod"));
        let execution =
            Execution::create(&flow, inputs, Vec::new()).with_state(StateKind::Running);
        let run = TaskRun::create(execution.id, "tag", None, None, None);
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        assert!(executor.worker_tasks.is_empty());
        let run = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(run.state.current, StateKind::Success);
        assert!(executor
            .execution
            .labels
            .iter()
            .any(|label| label.key == "env" && label.value == "prod"));
    }

    #[test]
    fn update_labels_rejects_system_labels() {
        let tag = task(
            "tag",
            TaskKind::UpdateLabels(UpdateLabelsDef {
                labels: vec![Label::new("system.owner", "nobody")],
            }),
        );
        let flow = flow_of("pipeline", vec![tag]);
        let execution = running_execution(&flow);
        let run = TaskRun::create(execution.id, "tag", None, None, None);
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        assert!(executor.exception.is_some());
        let run = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(run.state.current, StateKind::Failed);
    }

    #[test]
    fn subflow_task_spawns_a_linked_child_execution() {
        let child_flow = flow_of("child", vec![runnable("inner")]);
        let call = task(
            "call",
            TaskKind::Subflow(SubflowDef {
                namespace: "dev".to_string(),
                flow_id: "child".to_string(),
                revision: None,
                inputs: BTreeMap::new(),
                labels: Vec::new(),
                wait: true,
                transmit_failed: true,
                inherit_labels: false,
                schedule_date: None,
            }),
        );
        let flow = flow_of("parent", vec![call]);
        let execution = running_execution(&flow);
        let run = TaskRun::create(execution.id, "call", None, None, None);
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));
        let svc = ExecutorService::new(
            Arc::new(FlowStore::with_flows(vec![child_flow])),
            Arc::new(WorkerGroupRegistry::new()),
        );

        svc.process(&mut executor);

        assert!(executor.exception.is_none());
        assert_eq!(executor.subflow_executions.len(), 1);
        assert!(executor.subflow_execution_results.is_empty());
        let spawned = &executor.subflow_executions[0];
        assert_eq!(spawned.execution.namespace, "dev");
        assert_eq!(spawned.execution.flow_id, "child");
        let link = spawned.execution.parent.as_ref().unwrap();
        assert_eq!(link.execution_id, executor.execution.id);
        assert_eq!(link.task_run_id, run_id);
        assert!(link.waits);
        let running = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(running.state.current, StateKind::Running);
    }

    #[test]
    fn fire_and_forget_subflow_completes_the_parent_run() {
        let child_flow = flow_of("child", vec![runnable("inner")]);
        let call = task(
            "call",
            TaskKind::Subflow(SubflowDef {
                namespace: "dev".to_string(),
                flow_id: "child".to_string(),
                revision: None,
                inputs: BTreeMap::new(),
                labels: Vec::new(),
                wait: false,
                transmit_failed: true,
                inherit_labels: false,
                schedule_date: None,
            }),
        );
        let flow = flow_of("parent", vec![call]);
        let execution = running_execution(&flow);
        let run = TaskRun::create(execution.id, "call", None, None, None);
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));
        let svc = ExecutorService::new(
            Arc::new(FlowStore::with_flows(vec![child_flow])),
            Arc::new(WorkerGroupRegistry::new()),
        );

        svc.process(&mut executor);

        assert_eq!(executor.subflow_executions.len(), 1);
        assert_eq!(executor.subflow_execution_results.len(), 1);
        let result = &executor.subflow_execution_results[0];
        assert_eq!(result.state, StateKind::Success);
        assert_eq!(result.parent_task_run.state.current, StateKind::Success);
    }

    #[test]
    fn missing_subflow_fails_the_task_run() {
        let call = task(
            "call",
            TaskKind::Subflow(SubflowDef {
                namespace: "dev".to_string(),
                flow_id: "ghost".to_string(),
                revision: None,
                inputs: BTreeMap::new(),
                labels: Vec::new(),
                wait: true,
                transmit_failed: true,
                inherit_labels: false,
                schedule_date: None,
            }),
        );
        let flow = flow_of("parent", vec![call]);
        let execution = running_execution(&flow);
        let run = TaskRun::create(execution.id, "call", None, None, None);
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        assert!(executor.subflow_executions.is_empty());
        assert!(executor.exception.is_some());
        let failed = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(failed.state.current, StateKind::Failed);
    }

    #[test]
    fn killing_execution_cancels_created_runs() {
        let flow = flow_of("pipeline", vec![runnable("a")]);
        let execution = running_execution(&flow).with_state(StateKind::Killing);
        let run = TaskRun::create(execution.id, "a", None, None, None);
        let run_id = run.id;
        let execution = execution.with_appended_task_runs(vec![run]);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        let killed = executor.execution.find_task_run(run_id).unwrap();
        assert_eq!(killed.state.current, StateKind::Killed);
        assert_eq!(executor.execution.state.current, StateKind::Killed);
        assert!(executor.nexts.is_empty());
        assert!(executor.worker_tasks.is_empty());
    }

    #[test]
    fn queued_executions_do_not_resolve_tasks() {
        let flow = flow_of("pipeline", vec![runnable("a")]);
        let execution =
            Execution::create(&flow, JsonMap::new(), Vec::new()).with_state(StateKind::Queued);
        let mut executor = Executor::new(execution, Arc::new(flow));

        service().process(&mut executor);

        assert!(executor.nexts.is_empty());
        assert!(executor.worker_tasks.is_empty());
        assert_eq!(executor.execution.state.current, StateKind::Queued);
    }
}
