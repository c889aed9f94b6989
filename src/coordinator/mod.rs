//! # Coordinator
//!
//! The message-driven control loop of the engine. Eight queues feed it:
//! inbound executions, worker results, subflow results and terminal
//! notifications, kill requests and deferred windowed-trigger events, plus
//! the outbound worker-task and log queues. Every consumer follows the same
//! shape: lock the execution row, fold the message into it, persist, then
//! drain the side effects the handlers accumulated. The stored row is
//! authoritative and messages are wake-ups, so redelivering any message is
//! safe and the engine survives a crash at any point between persist and
//! emit.
//!
//! Delay timers and SLA deadlines are not message-driven; [`pollers`] scans
//! their stores on an interval and funnels due entries through the same
//! lock-fold-persist path.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WeirConfig;
use crate::error::{WeirError, WeirResult};
use crate::messaging::messages::{
    ExecutionKilled, KillPhase, LogEntry, LogLevel, MultipleConditionEvent, SubflowExecutionEnd,
    SubflowExecutionResult, WorkerTask, WorkerTaskResult,
};
use crate::messaging::{
    InMemoryQueue, MessageQueue, QUEUE_EXECUTION, QUEUE_KILL, QUEUE_LOG, QUEUE_MULTIPLE_CONDITION,
    QUEUE_SUBFLOW_END, QUEUE_SUBFLOW_RESULT, QUEUE_WORKER_TASK, QUEUE_WORKER_TASK_RESULT,
};
use crate::models::execution::Execution;
use crate::models::flow::{ConcurrencyBehavior, Flow, TaskKind};
use crate::models::state::StateKind;
use crate::orchestration::dedup::ExecutorState;
use crate::orchestration::execution_service::with_attempt_state;
use crate::orchestration::executor::Executor;
use crate::orchestration::service::{ExecutorService, WorkerGroupRegistry};
use crate::orchestration::sla::SlaService;
use crate::storage::{
    ConcurrencyDecision, ConcurrencyStorage, DelayType, ExecutionDelay, ExecutionDelayStorage,
    ExecutionLock, ExecutionRepository, FlowStore, InMemoryConcurrencyStorage,
    InMemoryDelayStorage, InMemoryExecutionRepository, InMemoryMultipleConditionStore,
    InMemorySlaMonitorStorage, InMemoryTriggerStateStore, MultipleConditionStore, SlaMonitor,
    SlaMonitorStorage, TriggerStateStore,
};

pub mod pollers;
pub mod triggers;

pub use triggers::FlowTriggerService;

/// The message transports the coordinator consumes and produces.
pub struct CoordinatorQueues {
    pub execution: Arc<dyn MessageQueue<Execution>>,
    pub worker_task: Arc<dyn MessageQueue<WorkerTask>>,
    pub worker_task_result: Arc<dyn MessageQueue<WorkerTaskResult>>,
    pub subflow_execution_result: Arc<dyn MessageQueue<SubflowExecutionResult>>,
    pub subflow_execution_end: Arc<dyn MessageQueue<SubflowExecutionEnd>>,
    pub kill: Arc<dyn MessageQueue<ExecutionKilled>>,
    pub log: Arc<dyn MessageQueue<LogEntry>>,
    pub multiple_condition: Arc<dyn MessageQueue<MultipleConditionEvent>>,
}

impl CoordinatorQueues {
    /// Process-local bounded queues, for tests and single-node deployments.
    pub fn in_memory(capacity: usize) -> Self {
        CoordinatorQueues {
            execution: Arc::new(InMemoryQueue::new(QUEUE_EXECUTION, capacity)),
            worker_task: Arc::new(InMemoryQueue::new(QUEUE_WORKER_TASK, capacity)),
            worker_task_result: Arc::new(InMemoryQueue::new(QUEUE_WORKER_TASK_RESULT, capacity)),
            subflow_execution_result: Arc::new(InMemoryQueue::new(QUEUE_SUBFLOW_RESULT, capacity)),
            subflow_execution_end: Arc::new(InMemoryQueue::new(QUEUE_SUBFLOW_END, capacity)),
            kill: Arc::new(InMemoryQueue::new(QUEUE_KILL, capacity)),
            log: Arc::new(InMemoryQueue::new(QUEUE_LOG, capacity)),
            multiple_condition: Arc::new(InMemoryQueue::new(
                QUEUE_MULTIPLE_CONDITION,
                capacity,
            )),
        }
    }
}

/// The durable state the coordinator reads and writes.
pub struct CoordinatorStores {
    pub flow_store: Arc<FlowStore>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub concurrency: Arc<dyn ConcurrencyStorage>,
    pub delays: Arc<dyn ExecutionDelayStorage>,
    pub sla_monitors: Arc<dyn SlaMonitorStorage>,
    pub trigger_state: Arc<dyn TriggerStateStore>,
    pub conditions: Arc<dyn MultipleConditionStore>,
}

impl CoordinatorStores {
    /// Process-local stores backing every storage trait.
    pub fn in_memory(flow_store: Arc<FlowStore>) -> Self {
        CoordinatorStores {
            flow_store,
            executions: Arc::new(InMemoryExecutionRepository::new()),
            concurrency: Arc::new(InMemoryConcurrencyStorage::new()),
            delays: Arc::new(InMemoryDelayStorage::new()),
            sla_monitors: Arc::new(InMemorySlaMonitorStorage::new()),
            trigger_state: Arc::new(InMemoryTriggerStateStore::new()),
            conditions: Arc::new(InMemoryMultipleConditionStore::new()),
        }
    }
}

/// Owns the consumer pool and the pollers, and wires every message back
/// into the orchestration core under the execution's row lock.
pub struct Coordinator {
    config: WeirConfig,
    queues: CoordinatorQueues,
    stores: CoordinatorStores,
    executor_service: Arc<ExecutorService>,
    sla_service: SlaService,
    trigger_service: FlowTriggerService,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(
        config: WeirConfig,
        queues: CoordinatorQueues,
        stores: CoordinatorStores,
        worker_groups: Arc<WorkerGroupRegistry>,
    ) -> Self {
        let executor_service = Arc::new(ExecutorService::new(
            Arc::clone(&stores.flow_store),
            worker_groups,
        ));
        let trigger_service = FlowTriggerService::new(
            Arc::clone(&stores.flow_store),
            Arc::clone(&stores.trigger_state),
            Arc::clone(&stores.conditions),
        );
        Coordinator {
            config,
            queues,
            stores,
            executor_service,
            sla_service: SlaService::new(),
            trigger_service,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn queues(&self) -> &CoordinatorQueues {
        &self.queues
    }

    pub fn stores(&self) -> &CoordinatorStores {
        &self.stores
    }

    pub fn config(&self) -> &WeirConfig {
        &self.config
    }

    /// Token observed by every consumer and poller loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask every loop spawned by [`Coordinator::run`] to stop after the
    /// message currently in hand.
    pub fn shutdown(&self) {
        info!("🛑 coordinator shutdown requested");
        self.shutdown.cancel();
    }

    /// Spawn the consumer pool and the pollers, and wait for all of them.
    ///
    /// Returns once [`Coordinator::shutdown`] is called or every queue
    /// producer is gone. In-flight messages finish processing first.
    pub async fn run(self: Arc<Self>) {
        let pool_size = self.config.orchestrator.effective_worker_pool_size();
        info!(pool_size, "🚀 coordinator starting");

        let mut tasks = JoinSet::new();
        for _ in 0..pool_size {
            let coordinator = Arc::clone(&self);
            tasks.spawn(async move { coordinator.execution_consumer().await });
        }
        let coordinator = Arc::clone(&self);
        tasks.spawn(async move { coordinator.worker_task_result_consumer().await });
        let coordinator = Arc::clone(&self);
        tasks.spawn(async move { coordinator.subflow_execution_result_consumer().await });
        let coordinator = Arc::clone(&self);
        tasks.spawn(async move { coordinator.subflow_execution_end_consumer().await });
        let coordinator = Arc::clone(&self);
        tasks.spawn(async move { coordinator.kill_consumer().await });
        let coordinator = Arc::clone(&self);
        tasks.spawn(async move { coordinator.multiple_condition_consumer().await });
        let coordinator = Arc::clone(&self);
        tasks.spawn(async move { pollers::run_delay_poller(coordinator).await });
        let coordinator = Arc::clone(&self);
        tasks.spawn(async move { pollers::run_sla_poller(coordinator).await });

        while tasks.join_next().await.is_some() {}
        info!("🛑 coordinator stopped");
    }

    async fn execution_consumer(&self) {
        loop {
            tokio::select! {
                message = self.queues.execution.receive() => {
                    let Some(execution) = message else { break };
                    let execution_id = execution.id;
                    if let Err(error) = self.on_execution_message(execution).await {
                        error!(execution_id = %execution_id, error = %error, "execution message handling failed");
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    async fn worker_task_result_consumer(&self) {
        loop {
            tokio::select! {
                message = self.queues.worker_task_result.receive() => {
                    let Some(result) = message else { break };
                    let task_run_id = result.task_run.id;
                    if let Err(error) = self.on_worker_task_result(result).await {
                        error!(task_run_id = %task_run_id, error = %error, "worker task result handling failed");
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    async fn subflow_execution_result_consumer(&self) {
        loop {
            tokio::select! {
                message = self.queues.subflow_execution_result.receive() => {
                    let Some(result) = message else { break };
                    let child = result.child_execution_id;
                    if let Err(error) = self.on_subflow_execution_result(result).await {
                        error!(child_execution_id = %child, error = %error, "subflow execution result handling failed");
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    async fn subflow_execution_end_consumer(&self) {
        loop {
            tokio::select! {
                message = self.queues.subflow_execution_end.receive() => {
                    let Some(end) = message else { break };
                    let child = end.child_execution_id;
                    if let Err(error) = self.on_subflow_execution_end(end).await {
                        error!(child_execution_id = %child, error = %error, "subflow execution end handling failed");
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    async fn kill_consumer(&self) {
        loop {
            tokio::select! {
                message = self.queues.kill.receive() => {
                    let Some(kill) = message else { break };
                    let execution_id = kill.execution_id;
                    if let Err(error) = self.on_kill(kill).await {
                        error!(execution_id = %execution_id, error = %error, "kill request handling failed");
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    async fn multiple_condition_consumer(&self) {
        loop {
            tokio::select! {
                message = self.queues.multiple_condition.receive() => {
                    let Some(event) = message else { break };
                    if let Err(error) = self.on_multiple_condition(event).await {
                        error!(error = %error, "multiple-condition event handling failed");
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    /// One delivery from the execution queue.
    ///
    /// The message body only matters for an execution seen for the first
    /// time; afterwards it is a wake-up and the stored row wins, which is
    /// what makes duplicate deliveries and stale re-emits harmless.
    async fn on_execution_message(&self, message: Execution) -> WeirResult<()> {
        let Some(flow) = self.find_flow(&message) else {
            return Ok(());
        };

        let lock = self.stores.executions.lock_or_insert(&message).await?;
        let mut executor = Executor::new(lock.execution().clone(), Arc::clone(&flow));
        let mut executor_state = lock.executor_state().clone();

        if let Err(error) = self
            .process_inside_lock(&mut executor, &mut executor_state)
            .await
        {
            executor.set_exception(error, "execution_consumer");
        }
        self.resolve_exception(&mut executor);

        lock.persist(executor.execution.clone(), executor_state)
            .await?;
        self.to_execution(executor).await
    }

    /// Admission, pipeline pass and side-effect routing, all under the lock.
    async fn process_inside_lock(
        &self,
        executor: &mut Executor,
        executor_state: &mut ExecutorState,
    ) -> WeirResult<()> {
        // An execution created ahead of its start date sleeps in the delay
        // store; the fired timer re-emits it and admission runs then.
        if executor.execution.state.current.is_created() {
            if let Some(date) = executor.execution.scheduled_date {
                if date > Utc::now() {
                    debug!(
                        execution_id = %executor.execution_id(),
                        scheduled_date = %date,
                        "execution start is scheduled, arming delay"
                    );
                    self.stores
                        .delays
                        .save(ExecutionDelay {
                            execution_id: executor.execution_id(),
                            task_run_id: None,
                            date,
                            state: StateKind::Created,
                            delay_type: DelayType::ResumeFlow,
                        })
                        .await?;
                    return Ok(());
                }
            }
        }

        // Fresh executions and restarted-after-failure ones go through
        // admission: SLA deadline timers are armed and the concurrency
        // limit is applied before any task may start.
        let admission = executor.execution.state.current.is_created()
            || executor.execution.state.failed_then_restarted();

        if admission && executor.flow.sla.iter().any(|sla| sla.is_monitoring()) {
            for monitor in SlaService::monitors_for(&executor.flow, &executor.execution) {
                self.stores.sla_monitors.save(monitor).await?;
            }
        }

        if admission && executor.flow.concurrency.is_some() {
            let service = Arc::clone(&self.executor_service);
            let flow = Arc::clone(&executor.flow);
            let execution = executor.execution.clone();
            let decision = self
                .stores
                .concurrency
                .count_then_apply(
                    &executor.flow,
                    Box::new(move |running| {
                        service.process_execution_running(&flow, running, execution)
                    }),
                )
                .await?;

            match decision {
                ConcurrencyDecision::Proceed(next) => {
                    executor.set_execution(next, "handle_concurrency_limit");
                }
                ConcurrencyDecision::Queue(next) => {
                    info!(
                        execution_id = %next.id,
                        flow_id = %next.flow_id,
                        "execution queued, concurrency limit reached"
                    );
                    executor.add_log(LogEntry::of(
                        &next,
                        LogLevel::Info,
                        "Execution is queued due to concurrency limit exceeded",
                    ));
                    executor.set_execution(next, "handle_concurrency_limit");
                    return Ok(());
                }
                ConcurrencyDecision::Reject(next) => {
                    if next.state.current.is_failed() {
                        executor.add_log(LogEntry::of(
                            &next,
                            LogLevel::Error,
                            "Execution is FAILED due to concurrency limit exceeded",
                        ));
                    }
                    executor.set_execution(next, "handle_concurrency_limit");
                    return Ok(());
                }
            }
        }

        self.sla_service.handle_execution_changed(executor);
        self.executor_service.process(executor);

        let nexts = std::mem::take(&mut executor.nexts);
        if !nexts.is_empty() {
            let fresh = executor_state.filter_new_nexts(nexts);
            if !fresh.is_empty() {
                self.executor_service.on_nexts(executor, fresh);
            }
        }

        // Runnable tasks go to workers exactly once per (run, attempt);
        // container and pause tasks have no worker, their RUNNING result is
        // synthesized and joined in the same pass.
        let worker_tasks = std::mem::take(&mut executor.worker_tasks);
        let mut synthesized = Vec::new();
        for worker_task in worker_tasks {
            if !executor_state.accept_worker_task(&worker_task.task_run) {
                continue;
            }
            if matches!(worker_task.task.kind, TaskKind::Runnable(_)) {
                self.queues.worker_task.emit(worker_task).await?;
            } else {
                synthesized.push(WorkerTaskResult::new(with_attempt_state(
                    &worker_task.task_run,
                    StateKind::Running,
                )));
            }
        }
        if !synthesized.is_empty() {
            if let Err(error) = self
                .executor_service
                .add_worker_task_results(executor, synthesized)
            {
                error!(
                    execution_id = %executor.execution_id(),
                    error = %error,
                    "Unable to add a worker task result to the execution"
                );
            }
        }

        for result in std::mem::take(&mut executor.subflow_execution_results) {
            self.queues.subflow_execution_result.emit(result).await?;
        }

        for delay in std::mem::take(&mut executor.execution_delays) {
            self.stores.delays.save(delay).await?;
        }

        for subflow in std::mem::take(&mut executor.subflow_executions) {
            if !executor_state.accept_subflow_execution(&subflow.parent_task_run) {
                continue;
            }
            info!(
                execution_id = %subflow.execution.id,
                parent_execution_id = %executor.execution_id(),
                namespace = %subflow.execution.namespace,
                flow_id = %subflow.execution.flow_id,
                "created new execution for subflow task"
            );
            executor.add_log(
                LogEntry::of(
                    &executor.execution,
                    LogLevel::Info,
                    format!(
                        "Created new execution '{}' for flow '{}.{}'",
                        subflow.execution.id,
                        subflow.execution.namespace,
                        subflow.execution.flow_id
                    ),
                )
                .with_task_run(subflow.parent_task_run.id),
            );
            self.queues.execution.emit(subflow.execution).await?;
        }

        Ok(())
    }

    /// Degrade an executor exception into a FAILED execution before the row
    /// is persisted. Doing this inside the lock is what keeps the failure
    /// durable: a FAILED state only emitted as a message would lose to the
    /// stored row on redelivery.
    fn resolve_exception(&self, executor: &mut Executor) {
        let Some(cause) = executor.exception.take() else {
            return;
        };
        error!(
            execution_id = %executor.execution_id(),
            error = %cause,
            "unable to process the execution, failing it"
        );
        let (failed, message) = executor.execution.fail_on_internal_error(&cause);
        executor.add_log(LogEntry::of(&failed, LogLevel::Error, message));
        executor.set_execution(failed, "resolve_exception");
    }

    /// Join one worker outcome into the stored row.
    ///
    /// Join-only on purpose: the pipeline pass that reacts to the new run
    /// state happens when the re-emitted execution comes back through the
    /// execution queue, so worker results never race each other through the
    /// graph logic.
    async fn on_worker_task_result(&self, result: WorkerTaskResult) -> WeirResult<()> {
        let Some(lock) = self
            .lock_existing(result.task_run.execution_id, "worker_task_result")
            .await?
        else {
            return Ok(());
        };

        if !lock.execution().has_task_run_joinable(&result.task_run) {
            debug!(
                execution_id = %result.task_run.execution_id,
                task_run_id = %result.task_run.id,
                "worker task result not joinable, skipping"
            );
            return Ok(());
        }

        let Some(flow) = self.find_flow(lock.execution()) else {
            return Ok(());
        };

        let mut executor = Executor::new(lock.execution().clone(), flow);
        let executor_state = lock.executor_state().clone();

        if let Err(error) = self.executor_service.add_worker_task_result(&mut executor, result) {
            executor.set_exception(error, "worker_task_result_consumer");
        }
        self.resolve_exception(&mut executor);

        lock.persist(executor.execution.clone(), executor_state)
            .await?;
        self.to_execution(executor).await
    }

    /// Fold a finished child execution onto its parent's subflow task run.
    async fn on_subflow_execution_result(&self, result: SubflowExecutionResult) -> WeirResult<()> {
        let Some(lock) = self
            .lock_existing(result.parent_task_run.execution_id, "subflow_execution_result")
            .await?
        else {
            return Ok(());
        };

        if !lock.execution().has_task_run_joinable(&result.parent_task_run) {
            debug!(
                execution_id = %result.parent_task_run.execution_id,
                task_run_id = %result.parent_task_run.id,
                "subflow execution result not joinable, skipping"
            );
            return Ok(());
        }

        let Some(flow) = self.find_flow(lock.execution()) else {
            return Ok(());
        };

        let mut executor = Executor::new(lock.execution().clone(), flow);
        let executor_state = lock.executor_state().clone();

        // The join goes through the worker-result path so the parent task's
        // allow-failure/allow-warning downgrades and the killed-child cascade
        // apply to subflow outcomes too.
        let joined = WorkerTaskResult::new(result.parent_task_run);
        if let Err(error) = self.executor_service.add_worker_task_result(&mut executor, joined) {
            executor.set_exception(error, "subflow_result_consumer");
        }
        self.resolve_exception(&mut executor);

        lock.persist(executor.execution.clone(), executor_state)
            .await?;
        self.to_execution(executor).await
    }

    /// Translate a raw child-terminal notification into a subflow result,
    /// applying the parent task's wait/transmit-failed semantics. Reads the
    /// parent row but never writes it.
    async fn on_subflow_execution_end(&self, end: SubflowExecutionEnd) -> WeirResult<()> {
        let Some(lock) = self
            .lock_existing(end.parent_execution_id, "subflow_execution_end")
            .await?
        else {
            return Ok(());
        };
        let parent = lock.execution().clone();
        drop(lock);

        let Some(flow) = self.find_flow(&parent) else {
            return Ok(());
        };
        let Some(task) = flow.find_task(&end.task_id) else {
            warn!(
                execution_id = %parent.id,
                task_id = %end.task_id,
                "subflow end for a task the flow no longer declares, dropping"
            );
            return Ok(());
        };
        let TaskKind::Subflow(subflow) = &task.kind else {
            return Ok(());
        };
        if !subflow.wait {
            // Fire-and-forget children already resolved their parent run
            // when they were created.
            return Ok(());
        }
        let Some(run) = parent.find_task_run(end.parent_task_run_id) else {
            warn!(
                execution_id = %parent.id,
                task_run_id = %end.parent_task_run_id,
                "subflow end for an unknown parent task run, dropping"
            );
            return Ok(());
        };

        let state = if subflow.transmit_failed {
            end.state
        } else {
            StateKind::Success
        };
        let mut joined = with_attempt_state(run, state);
        if !end.outputs.is_empty() {
            joined = joined.with_outputs(end.outputs.clone());
        }

        self.queues
            .subflow_execution_result
            .emit(SubflowExecutionResult {
                child_execution_id: end.child_execution_id,
                parent_task_run: joined,
                state: end.state,
            })
            .await
            .map_err(WeirError::from)
    }

    /// Handle a kill request: notify workers, converge the row, cascade to
    /// children.
    async fn on_kill(&self, message: ExecutionKilled) -> WeirResult<()> {
        if message.phase == KillPhase::Executed {
            return Ok(());
        }
        // Workers watch the queue for the executed-phase copy and stop the
        // matching tasks; it goes out first so they react even while the row
        // is being converged here.
        self.queues.kill.emit(message.as_executed()).await?;

        let outcome = self.killing_or_after_kill_state(&message).await?;

        if message.is_on_kill_cascade {
            let kills = self
                .executor_service
                .execution_service()
                .kill_subflow_executions(
                    self.stores.executions.as_ref(),
                    &message.tenant,
                    message.execution_id,
                )
                .await?;
            for kill in kills {
                self.queues.kill.emit(kill).await?;
            }
        }

        if let Some(executor) = outcome {
            self.to_execution(executor).await?;
        }
        Ok(())
    }

    /// Mark the row KILLING (or converge it straight to the requested
    /// terminal state) under its lock.
    async fn killing_or_after_kill_state(
        &self,
        message: &ExecutionKilled,
    ) -> WeirResult<Option<Executor>> {
        let Some(lock) = self.lock_existing(message.execution_id, "kill").await? else {
            return Ok(None);
        };
        let Some(flow) = self.find_flow(lock.execution()) else {
            return Ok(None);
        };

        let mut executor = Executor::new(lock.execution().clone(), Arc::clone(&flow));
        let executor_state = lock.executor_state().clone();

        // A queued execution never started; drop it from the FIFO so the
        // pop path cannot revive it after the kill.
        if executor.execution.state.current.is_queued() {
            self.stores
                .concurrency
                .remove_queued(&flow.ident().uid(), executor.execution_id())
                .await?;
        }

        let next = match message.execution_state {
            Some(target) if !executor.execution.is_terminated() => {
                let mut next = executor.execution.clone();
                if let Some(run) = next.find_last_not_terminated() {
                    next = next.with_task_run(with_attempt_state(run, target))?;
                }
                next.with_state(target)
            }
            Some(_) => executor.execution.clone(),
            None => self
                .executor_service
                .execution_service()
                .kill(&executor.execution),
        };
        executor.set_execution(next, "join_killing_execution");

        lock.persist(executor.execution.clone(), executor_state)
            .await?;
        Ok(Some(executor))
    }

    /// Evaluate a deferred windowed-trigger event and start whatever fired.
    async fn on_multiple_condition(&self, event: MultipleConditionEvent) -> WeirResult<()> {
        let fired = self.trigger_service.evaluate_multiple_condition(&event).await?;
        for execution in fired {
            info!(
                execution_id = %execution.id,
                namespace = %execution.namespace,
                flow_id = %execution.flow_id,
                "flow trigger fired, window complete"
            );
            self.queues.execution.emit(execution).await?;
        }
        Ok(())
    }

    /// Fire every due delay timer. Called by the delay poller.
    pub(crate) async fn fire_due_delays(&self) -> WeirResult<usize> {
        let due = self.stores.delays.pop_due(Utc::now()).await?;
        let fired = due.len();
        for delay in due {
            if let Err(error) = self.fire_delay(&delay).await {
                error!(
                    execution_id = %delay.execution_id,
                    error = %error,
                    "unable to fire execution delay"
                );
            }
        }
        Ok(fired)
    }

    async fn fire_delay(&self, delay: &ExecutionDelay) -> WeirResult<()> {
        let Some(lock) = self.lock_existing(delay.execution_id, "delay").await? else {
            return Ok(());
        };
        let Some(flow) = self.find_flow(lock.execution()) else {
            return Ok(());
        };

        let mut executor = Executor::new(lock.execution().clone(), flow);
        let executor_state = lock.executor_state().clone();

        match self.apply_delay(&mut executor, delay) {
            Ok(Some(replayed)) => {
                // The replay is a brand-new execution: it is inserted when
                // its first message arrives, and the source row stays as it
                // ended.
                drop(lock);
                info!(
                    execution_id = %replayed.id,
                    replay_of = %delay.execution_id,
                    "restarting failed flow as a new execution"
                );
                return self.queues.execution.emit(replayed).await.map_err(WeirError::from);
            }
            Ok(None) => {}
            Err(error) => executor.set_exception(error, "fire_delay"),
        }
        self.resolve_exception(&mut executor);

        lock.persist(executor.execution.clone(), executor_state)
            .await?;
        self.to_execution(executor).await
    }

    /// Apply one fired timer to the executor. A returned execution is a
    /// replay to emit instead of a row update.
    fn apply_delay(
        &self,
        executor: &mut Executor,
        delay: &ExecutionDelay,
    ) -> WeirResult<Option<Execution>> {
        let service = self.executor_service.execution_service();
        match delay.delay_type {
            DelayType::ResumeFlow => {
                if executor.execution.is_terminated() {
                    // The pause resolved some other way before the timer
                    // fired.
                    return Ok(None);
                }
                let next = match delay.task_run_id {
                    None => executor.execution.with_state(delay.state),
                    Some(task_run_id) => {
                        service.mark_as(&executor.execution, task_run_id, delay.state)?
                    }
                };
                executor.set_execution(next, "paused_restart");
            }
            DelayType::RestartFailedTask => {
                let task_run_id = delay
                    .task_run_id
                    .ok_or_else(|| WeirError::internal("retry delay without a task run"))?;
                let next = service.retry_task(&executor.execution, task_run_id)?;
                executor.set_execution(next, "retry_failed_task");
            }
            DelayType::RestartFailedFlow => {
                return Ok(Some(service.replay(&executor.execution)));
            }
            DelayType::ContinueFlowable => {
                let task_run_id = delay
                    .task_run_id
                    .ok_or_else(|| WeirError::internal("loop continuation without a task run"))?;
                let next = service.continue_loop(&executor.execution, task_run_id)?;
                executor.set_execution(next, "continue_loop");
            }
        }
        Ok(None)
    }

    /// Re-check every expired SLA deadline. Called by the SLA poller.
    pub(crate) async fn fire_expired_sla_monitors(&self) -> WeirResult<usize> {
        let expired = self.stores.sla_monitors.pop_expired(Utc::now()).await?;
        let fired = expired.len();
        for monitor in expired {
            if let Err(error) = self.fire_sla_monitor(&monitor).await {
                error!(
                    execution_id = %monitor.execution_id,
                    sla_id = %monitor.sla_id,
                    error = %error,
                    "unable to evaluate sla deadline"
                );
            }
        }
        Ok(fired)
    }

    async fn fire_sla_monitor(&self, monitor: &SlaMonitor) -> WeirResult<()> {
        let Some(lock) = self.lock_existing(monitor.execution_id, "sla_monitor").await? else {
            return Ok(());
        };
        let Some(flow) = self.find_flow(lock.execution()) else {
            return Ok(());
        };
        let Some(sla) = flow.sla.iter().find(|sla| sla.id() == monitor.sla_id) else {
            debug!(
                execution_id = %monitor.execution_id,
                sla_id = %monitor.sla_id,
                "sla no longer declared on the flow, skipping"
            );
            return Ok(());
        };

        let mut executor = Executor::new(lock.execution().clone(), Arc::clone(&flow));
        let executor_state = lock.executor_state().clone();

        let Some(violation) = self
            .sla_service
            .evaluate_monitoring(&executor.execution, sla)
        else {
            return Ok(());
        };
        self.sla_service.process_violation(&mut executor, &violation);

        lock.persist(executor.execution.clone(), executor_state)
            .await?;
        self.to_execution(executor).await
    }

    /// Drain the side effects of a persisted executor: logs and kill
    /// fan-out always; the re-emit, trigger evaluation and terminal
    /// bookkeeping only when the row actually changed.
    async fn to_execution(&self, mut executor: Executor) -> WeirResult<()> {
        for log in std::mem::take(&mut executor.logs) {
            self.queues.log.emit(log).await?;
        }
        for kill in std::mem::take(&mut executor.kills) {
            self.queues.kill.emit(kill).await?;
        }

        if !executor.execution_updated() {
            // Redelivery of a settled execution: once nothing further can
            // arrive, the dedup markers can go.
            if executor.execution.can_be_purged() {
                self.stores
                    .executions
                    .purge_executor_state(executor.execution_id())
                    .await?;
            }
            // A triggered execution that failed before materializing any
            // task run never passes the terminal block below; release its
            // in-flight marker here or the trigger stays armed forever.
            if executor.execution.trigger.is_some()
                && executor.execution.state.current.is_failed()
                && executor.execution.task_run_list.is_empty()
            {
                self.trigger_service.release(&executor.execution).await?;
            }
            return Ok(());
        }

        debug!(
            execution_id = %executor.execution_id(),
            state = ?executor.execution.state.current,
            from = %executor.sources(),
            "execution updated"
        );
        self.queues
            .execution
            .emit(executor.execution.clone())
            .await?;

        if executor.state_changed() {
            self.process_flow_triggers(&executor.execution).await?;
        }

        if !self
            .executor_service
            .execution_service()
            .is_terminated(&executor.flow, &executor.execution)
        {
            return Ok(());
        }

        if let Some(parent) = &executor.execution.parent {
            self.queues
                .subflow_execution_end
                .emit(SubflowExecutionEnd {
                    child_execution_id: executor.execution_id(),
                    parent_execution_id: parent.execution_id,
                    parent_task_run_id: parent.task_run_id,
                    task_id: parent.task_id.clone(),
                    state: executor.execution.state.current,
                    outputs: executor.execution.outputs.clone().unwrap_or_default(),
                })
                .await?;
        }

        if executor.flow.sla.iter().any(|sla| sla.is_monitoring()) {
            self.stores
                .sla_monitors
                .purge(executor.execution_id())
                .await?;
        }

        if let Some(concurrency) = &executor.flow.concurrency {
            // Only an execution that was actually counted frees a slot; one
            // rejected or killed straight out of the queue never held one.
            if executor.execution.held_concurrency_slot() {
                self.stores
                    .concurrency
                    .decrement(&executor.flow.ident().uid())
                    .await?;
                if matches!(concurrency.behavior, ConcurrencyBehavior::Queue) {
                    self.wake_queued(&executor.flow).await?;
                }
            }
        }

        if executor.execution.trigger.is_some() {
            self.trigger_service.release(&executor.execution).await?;
        }

        Ok(())
    }

    /// Promote the oldest queued execution of the flow now that a slot is
    /// free.
    async fn wake_queued(&self, flow: &Flow) -> WeirResult<()> {
        let Some(popped) = self.stores.concurrency.pop_queued(flow).await? else {
            return Ok(());
        };
        // The row must leave QUEUED before the wake-up lands, otherwise the
        // stored row would win and the execution would stay queued forever.
        let lock = self.stores.executions.lock(popped.id).await?;
        let running = lock.execution().with_state(StateKind::Running);
        let executor_state = lock.executor_state().clone();
        lock.persist(running.clone(), executor_state).await?;

        info!(
            execution_id = %running.id,
            flow_id = %flow.id,
            "execution dequeued, concurrency slot freed"
        );
        self.queues.execution.emit(running.clone()).await?;
        self.process_flow_triggers(&running).await
    }

    /// Route one observed state change through the flow-trigger service.
    async fn process_flow_triggers(&self, execution: &Execution) -> WeirResult<()> {
        let (fired, deferred) = self.trigger_service.process_state_change(execution).await?;
        for event in deferred {
            self.queues.multiple_condition.emit(event).await?;
        }
        for triggered in fired {
            info!(
                execution_id = %triggered.id,
                namespace = %triggered.namespace,
                flow_id = %triggered.flow_id,
                "flow trigger fired"
            );
            self.queues.execution.emit(triggered).await?;
        }
        Ok(())
    }

    /// Lock an execution that must already exist; messages referencing
    /// unknown executions are dropped with a warning.
    async fn lock_existing(
        &self,
        execution_id: Uuid,
        context: &'static str,
    ) -> WeirResult<Option<Box<dyn ExecutionLock>>> {
        match self.stores.executions.lock(execution_id).await {
            Ok(lock) => Ok(Some(lock)),
            Err(error) if error.is_not_found() => {
                warn!(
                    execution_id = %execution_id,
                    context,
                    "message references an unknown execution, dropping"
                );
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    fn find_flow(&self, execution: &Execution) -> Option<Arc<Flow>> {
        let found = self.stores.flow_store.find_by_execution(execution);
        if found.is_none() {
            warn!(
                execution_id = %execution.id,
                namespace = %execution.namespace,
                flow_id = %execution.flow_id,
                revision = execution.flow_revision,
                "flow revision not found, dropping message"
            );
        }
        found
    }
}
