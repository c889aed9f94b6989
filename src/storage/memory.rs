//! # In-Memory Storage
//!
//! Process-local implementations of the storage traits, used by the test
//! harness and by single-node deployments. Per-execution locking is a tokio
//! mutex per row; the concurrency counters keep count and FIFO under one
//! mutex per flow so the limiter decision is atomic.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{WeirError, WeirResult};
use crate::models::execution::Execution;
use crate::models::flow::Flow;
use crate::orchestration::dedup::ExecutorState;

use super::{
    ConcurrencyDecision, ConcurrencyStorage, ExecutionDelay, ExecutionDelayStorage, ExecutionLock,
    ExecutionRepository, MultipleConditionStore, MultipleConditionWindow, SlaMonitor,
    SlaMonitorStorage, TriggerStateStore,
};

#[derive(Debug, Clone)]
struct StoredExecution {
    execution: Execution,
    executor_state: ExecutorState,
}

/// Execution rows keyed by id, each behind its own async mutex.
#[derive(Default)]
pub struct InMemoryExecutionRepository {
    rows: DashMap<Uuid, Arc<Mutex<StoredExecution>>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, execution_id: Uuid) -> Option<Arc<Mutex<StoredExecution>>> {
        self.rows.get(&execution_id).map(|entry| Arc::clone(entry.value()))
    }
}

struct MemoryExecutionLock {
    guard: OwnedMutexGuard<StoredExecution>,
}

#[async_trait]
impl ExecutionLock for MemoryExecutionLock {
    fn execution(&self) -> &Execution {
        &self.guard.execution
    }

    fn executor_state(&self) -> &ExecutorState {
        &self.guard.executor_state
    }

    async fn persist(
        mut self: Box<Self>,
        execution: Execution,
        executor_state: ExecutorState,
    ) -> WeirResult<()> {
        self.guard.execution = execution;
        self.guard.executor_state = executor_state;
        Ok(())
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn find(&self, execution_id: Uuid) -> WeirResult<Option<Execution>> {
        match self.cell(execution_id) {
            Some(cell) => Ok(Some(cell.lock().await.execution.clone())),
            None => Ok(None),
        }
    }

    async fn find_active_children(&self, parent_execution_id: Uuid) -> WeirResult<Vec<Execution>> {
        // snapshot the cells first so no shard guard is held across an await
        let cells: Vec<Arc<Mutex<StoredExecution>>> =
            self.rows.iter().map(|entry| Arc::clone(entry.value())).collect();

        let mut children = Vec::new();
        for cell in cells {
            let stored = cell.lock().await;
            let parent = stored.execution.parent.as_ref();
            if parent.map(|p| p.execution_id) == Some(parent_execution_id)
                && !stored.execution.is_terminated()
            {
                children.push(stored.execution.clone());
            }
        }
        Ok(children)
    }

    async fn find_by_flow(&self, flow_uid: &str) -> WeirResult<Vec<Execution>> {
        let cells: Vec<Arc<Mutex<StoredExecution>>> =
            self.rows.iter().map(|entry| Arc::clone(entry.value())).collect();

        let mut matching = Vec::new();
        for cell in cells {
            let stored = cell.lock().await;
            if stored.execution.flow_ident().uid() == flow_uid {
                matching.push(stored.execution.clone());
            }
        }
        Ok(matching)
    }

    async fn lock(&self, execution_id: Uuid) -> WeirResult<Box<dyn ExecutionLock>> {
        let cell = self
            .cell(execution_id)
            .ok_or_else(|| WeirError::not_found(format!("execution {execution_id}")))?;
        let guard = cell.lock_owned().await;
        Ok(Box::new(MemoryExecutionLock { guard }))
    }

    async fn lock_or_insert(&self, execution: &Execution) -> WeirResult<Box<dyn ExecutionLock>> {
        let cell = {
            let entry = self.rows.entry(execution.id).or_insert_with(|| {
                Arc::new(Mutex::new(StoredExecution {
                    execution: execution.clone(),
                    executor_state: ExecutorState::new(execution.id),
                }))
            });
            Arc::clone(entry.value())
        };
        let guard = cell.lock_owned().await;
        Ok(Box::new(MemoryExecutionLock { guard }))
    }

    async fn purge_executor_state(&self, execution_id: Uuid) -> WeirResult<()> {
        if let Some(cell) = self.cell(execution_id) {
            let mut stored = cell.lock().await;
            stored.executor_state = ExecutorState::new(execution_id);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FlowConcurrency {
    running: usize,
    queued: VecDeque<Execution>,
}

/// Per-flow running counters plus the queued-execution FIFO.
#[derive(Default)]
pub struct InMemoryConcurrencyStorage {
    flows: DashMap<String, Arc<Mutex<FlowConcurrency>>>,
}

impl InMemoryConcurrencyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, flow_uid: &str) -> Arc<Mutex<FlowConcurrency>> {
        let entry = self
            .flows
            .entry(flow_uid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(FlowConcurrency::default())));
        Arc::clone(entry.value())
    }
}

#[async_trait]
impl ConcurrencyStorage for InMemoryConcurrencyStorage {
    async fn count_then_apply(
        &self,
        flow: &Flow,
        decide: Box<dyn FnOnce(usize) -> ConcurrencyDecision + Send>,
    ) -> WeirResult<ConcurrencyDecision> {
        let cell = self.cell(&flow.ident().uid());
        let mut state = cell.lock().await;
        let decision = decide(state.running);
        match &decision {
            ConcurrencyDecision::Proceed(_) => state.running += 1,
            ConcurrencyDecision::Queue(execution) => state.queued.push_back(execution.clone()),
            ConcurrencyDecision::Reject(_) => {}
        }
        Ok(decision)
    }

    async fn decrement(&self, flow_uid: &str) -> WeirResult<()> {
        let cell = self.cell(flow_uid);
        let mut state = cell.lock().await;
        state.running = state.running.saturating_sub(1);
        Ok(())
    }

    async fn pop_queued(&self, flow: &Flow) -> WeirResult<Option<Execution>> {
        let cell = self.cell(&flow.ident().uid());
        let mut state = cell.lock().await;
        match state.queued.pop_front() {
            Some(execution) => {
                state.running += 1;
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }

    async fn remove_queued(&self, flow_uid: &str, execution_id: Uuid) -> WeirResult<bool> {
        let cell = self.cell(flow_uid);
        let mut state = cell.lock().await;
        let before = state.queued.len();
        state.queued.retain(|execution| execution.id != execution_id);
        Ok(state.queued.len() < before)
    }

    async fn running_count(&self, flow_uid: &str) -> WeirResult<usize> {
        let cell = self.cell(flow_uid);
        let state = cell.lock().await;
        Ok(state.running)
    }
}

/// Delay timers in a single vec, scanned by the poller.
#[derive(Default)]
pub struct InMemoryDelayStorage {
    delays: Mutex<Vec<ExecutionDelay>>,
}

impl InMemoryDelayStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionDelayStorage for InMemoryDelayStorage {
    async fn save(&self, delay: ExecutionDelay) -> WeirResult<()> {
        self.delays.lock().await.push(delay);
        Ok(())
    }

    async fn pop_due(&self, now: DateTime<Utc>) -> WeirResult<Vec<ExecutionDelay>> {
        let mut delays = self.delays.lock().await;
        let mut due: Vec<ExecutionDelay> = Vec::new();
        delays.retain(|delay| {
            if delay.date <= now {
                due.push(delay.clone());
                false
            } else {
                true
            }
        });
        due.sort_by_key(|delay| delay.date);
        Ok(due)
    }
}

/// SLA deadlines, upserted by (execution, sla id).
#[derive(Default)]
pub struct InMemorySlaMonitorStorage {
    monitors: Mutex<Vec<SlaMonitor>>,
}

impl InMemorySlaMonitorStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlaMonitorStorage for InMemorySlaMonitorStorage {
    async fn save(&self, monitor: SlaMonitor) -> WeirResult<()> {
        let mut monitors = self.monitors.lock().await;
        monitors.retain(|existing| {
            !(existing.execution_id == monitor.execution_id && existing.sla_id == monitor.sla_id)
        });
        monitors.push(monitor);
        Ok(())
    }

    async fn purge(&self, execution_id: Uuid) -> WeirResult<()> {
        let mut monitors = self.monitors.lock().await;
        monitors.retain(|monitor| monitor.execution_id != execution_id);
        Ok(())
    }

    async fn pop_expired(&self, now: DateTime<Utc>) -> WeirResult<Vec<SlaMonitor>> {
        let mut monitors = self.monitors.lock().await;
        let mut expired = Vec::new();
        monitors.retain(|monitor| {
            if monitor.deadline <= now {
                expired.push(monitor.clone());
                false
            } else {
                true
            }
        });
        Ok(expired)
    }
}

/// In-flight trigger markers.
#[derive(Default)]
pub struct InMemoryTriggerStateStore {
    in_flight: DashMap<String, Uuid>,
}

impl InMemoryTriggerStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerStateStore for InMemoryTriggerStateStore {
    async fn acquire(&self, trigger_uid: &str, execution_id: Uuid) -> WeirResult<bool> {
        match self.in_flight.entry(trigger_uid.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(execution_id);
                Ok(true)
            }
        }
    }

    async fn release_by_execution(&self, execution_id: Uuid) -> WeirResult<()> {
        self.in_flight.retain(|_, owner| *owner != execution_id);
        Ok(())
    }
}

/// Windowed precondition progress keyed by trigger uid.
#[derive(Default)]
pub struct InMemoryMultipleConditionStore {
    windows: DashMap<String, MultipleConditionWindow>,
}

impl InMemoryMultipleConditionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MultipleConditionStore for InMemoryMultipleConditionStore {
    async fn find(&self, trigger_uid: &str) -> WeirResult<Option<MultipleConditionWindow>> {
        Ok(self.windows.get(trigger_uid).map(|entry| entry.value().clone()))
    }

    async fn save(&self, window: MultipleConditionWindow) -> WeirResult<()> {
        self.windows.insert(window.trigger_uid.clone(), window);
        Ok(())
    }

    async fn delete(&self, trigger_uid: &str) -> WeirResult<()> {
        self.windows.remove(trigger_uid);
        Ok(())
    }

    async fn pop_expired(&self, now: DateTime<Utc>) -> WeirResult<Vec<MultipleConditionWindow>> {
        let expired_uids: Vec<String> = self
            .windows
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = Vec::new();
        for uid in expired_uids {
            if let Some((_, window)) = self.windows.remove(&uid) {
                expired.push(window);
            }
        }
        Ok(expired)
    }
}
