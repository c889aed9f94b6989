//! # Storage Module
//!
//! Persistence seams for the orchestration engine: execution rows with their
//! pessimistic per-execution lock, the concurrency limit counters and FIFO,
//! durable timers (delays, SLA deadlines) and trigger bookkeeping.
//!
//! ## Locking model
//!
//! [`ExecutionRepository::lock`] is the single serialization point for one
//! execution: it returns a guard exposing the current execution snapshot and
//! its [`ExecutorState`] dedup markers, and `persist` writes both back before
//! releasing. No execution is ever processed by two callers at once;
//! everything else scales horizontally.
//!
//! The bundled implementations in [`memory`] keep state in process; the
//! traits are written so a SQL-backed variant can honor the same contracts
//! with row locks and transactions.

pub mod memory;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WeirResult;
use crate::models::execution::Execution;
use crate::models::flow::{Flow, FlowIdent};
use crate::models::state::StateKind;
use crate::orchestration::dedup::ExecutorState;

pub use memory::{
    InMemoryConcurrencyStorage, InMemoryDelayStorage, InMemoryExecutionRepository,
    InMemoryMultipleConditionStore, InMemorySlaMonitorStorage, InMemoryTriggerStateStore,
};

/// Why a durable timer exists and what to do when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelayType {
    /// Resume a paused task (or a scheduled execution) into a target state.
    ResumeFlow,
    /// Fire a retry-in-place of a failed task run.
    RestartFailedTask,
    /// Replay the whole execution as a fresh one.
    RestartFailedFlow,
    /// Advance a loop to its next iteration.
    ContinueFlowable,
}

/// A durable one-shot timer, consumed exactly once by the delay poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDelay {
    pub execution_id: Uuid,
    #[serde(default)]
    pub task_run_id: Option<Uuid>,
    pub date: DateTime<Utc>,
    /// Target state applied when the timer fires (RESUME_FLOW only).
    pub state: StateKind,
    pub delay_type: DelayType,
}

/// A pending max-duration SLA deadline for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaMonitor {
    pub execution_id: Uuid,
    pub sla_id: String,
    pub deadline: DateTime<Utc>,
}

/// Progress of a windowed multi-flow trigger precondition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipleConditionWindow {
    pub trigger_uid: String,
    pub start: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Indexes of the precondition filters already satisfied.
    pub matched: BTreeSet<usize>,
}

impl MultipleConditionWindow {
    pub fn new(trigger_uid: impl Into<String>, now: DateTime<Utc>, window_ms: u64) -> Self {
        MultipleConditionWindow {
            trigger_uid: trigger_uid.into(),
            start: now,
            deadline: now + chrono::Duration::milliseconds(window_ms as i64),
            matched: BTreeSet::new(),
        }
    }

    pub fn mark(&mut self, filter_index: usize) {
        self.matched.insert(filter_index);
    }

    pub fn is_complete(&self, filter_count: usize) -> bool {
        (0..filter_count).all(|index| self.matched.contains(&index))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }
}

/// Guard over one locked execution row and its dedup state.
///
/// Dropping the guard releases the lock without writing.
#[async_trait]
pub trait ExecutionLock: Send {
    fn execution(&self) -> &Execution;

    fn executor_state(&self) -> &ExecutorState;

    /// Write both halves back and release the lock.
    async fn persist(
        self: Box<Self>,
        execution: Execution,
        executor_state: ExecutorState,
    ) -> WeirResult<()>;
}

/// Execution rows plus the per-execution pessimistic lock.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Read a snapshot without locking.
    async fn find(&self, execution_id: Uuid) -> WeirResult<Option<Execution>>;

    /// Non-terminal executions whose parent is the given execution.
    async fn find_active_children(&self, parent_execution_id: Uuid) -> WeirResult<Vec<Execution>>;

    /// Every execution of one flow, in any state. `flow_uid` is the
    /// revision-less [`FlowIdent::uid`](crate::models::FlowIdent::uid).
    async fn find_by_flow(&self, flow_uid: &str) -> WeirResult<Vec<Execution>>;

    /// Acquire the row lock for an existing execution.
    async fn lock(&self, execution_id: Uuid) -> WeirResult<Box<dyn ExecutionLock>>;

    /// Acquire the row lock, inserting the row from the delivered message on
    /// first sight. The stored row wins over the message on re-delivery.
    async fn lock_or_insert(&self, execution: &Execution) -> WeirResult<Box<dyn ExecutionLock>>;

    /// Drop the dedup markers of a finished execution.
    async fn purge_executor_state(&self, execution_id: Uuid) -> WeirResult<()>;
}

/// Outcome of the limiter for one execution entering RUNNING.
#[derive(Debug, Clone)]
pub enum ConcurrencyDecision {
    /// Under the limit (or no limit): counted and allowed to run.
    Proceed(Execution),
    /// QUEUE behavior: held in the FIFO, not counted.
    Queue(Execution),
    /// CANCEL or FAIL behavior: terminal immediately, never counted.
    Reject(Execution),
}

impl ConcurrencyDecision {
    pub fn execution(&self) -> &Execution {
        match self {
            ConcurrencyDecision::Proceed(execution)
            | ConcurrencyDecision::Queue(execution)
            | ConcurrencyDecision::Reject(execution) => execution,
        }
    }
}

/// Per-flow running counters and the queued-execution FIFO.
///
/// Both live under one lock per flow so count-read, decision and
/// count-write happen atomically.
#[async_trait]
pub trait ConcurrencyStorage: Send + Sync {
    /// Read the running count, let `decide` pick an outcome, and apply it:
    /// `Proceed` increments, `Queue` appends to the FIFO, `Reject` leaves the
    /// counter untouched. A missing counter row reads as zero.
    async fn count_then_apply(
        &self,
        flow: &Flow,
        decide: Box<dyn FnOnce(usize) -> ConcurrencyDecision + Send>,
    ) -> WeirResult<ConcurrencyDecision>;

    /// Release one slot after a counted execution terminated.
    async fn decrement(&self, flow_uid: &str) -> WeirResult<()>;

    /// Pop the oldest queued execution and count it, atomically.
    async fn pop_queued(&self, flow: &Flow) -> WeirResult<Option<Execution>>;

    /// Remove a queued execution that is being killed before it ever ran.
    async fn remove_queued(&self, flow_uid: &str, execution_id: Uuid) -> WeirResult<bool>;

    async fn running_count(&self, flow_uid: &str) -> WeirResult<usize>;
}

/// Durable delay timers.
#[async_trait]
pub trait ExecutionDelayStorage: Send + Sync {
    async fn save(&self, delay: ExecutionDelay) -> WeirResult<()>;

    /// Remove and return every timer due at `now`, oldest first.
    async fn pop_due(&self, now: DateTime<Utc>) -> WeirResult<Vec<ExecutionDelay>>;
}

/// Durable SLA deadlines.
#[async_trait]
pub trait SlaMonitorStorage: Send + Sync {
    /// Upsert by (execution, sla id).
    async fn save(&self, monitor: SlaMonitor) -> WeirResult<()>;

    /// Drop every monitor of a finished execution.
    async fn purge(&self, execution_id: Uuid) -> WeirResult<()>;

    /// Remove and return every deadline passed at `now`.
    async fn pop_expired(&self, now: DateTime<Utc>) -> WeirResult<Vec<SlaMonitor>>;
}

/// In-flight markers preventing a flow trigger from firing again while the
/// execution it started is still running.
#[async_trait]
pub trait TriggerStateStore: Send + Sync {
    /// Record the trigger as in flight; false when it already is.
    async fn acquire(&self, trigger_uid: &str, execution_id: Uuid) -> WeirResult<bool>;

    /// Clear any in-flight marker owned by this execution.
    async fn release_by_execution(&self, execution_id: Uuid) -> WeirResult<()>;
}

/// Windowed multi-flow precondition progress.
#[async_trait]
pub trait MultipleConditionStore: Send + Sync {
    async fn find(&self, trigger_uid: &str) -> WeirResult<Option<MultipleConditionWindow>>;

    async fn save(&self, window: MultipleConditionWindow) -> WeirResult<()>;

    async fn delete(&self, trigger_uid: &str) -> WeirResult<()>;

    /// Remove and return windows whose deadline passed without completing.
    async fn pop_expired(&self, now: DateTime<Utc>) -> WeirResult<Vec<MultipleConditionWindow>>;
}

/// Process-wide flow definition cache.
///
/// Readers take a cheap snapshot; updates replace the whole map at once, so
/// a reader never observes a partially applied flow change.
pub struct FlowStore {
    flows: RwLock<Arc<HashMap<String, BTreeMap<u32, Arc<Flow>>>>>,
}

impl Default for FlowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowStore {
    pub fn new() -> Self {
        FlowStore {
            flows: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn with_flows(flows: Vec<Flow>) -> Self {
        let store = Self::new();
        store.replace_all(flows);
        store
    }

    /// Swap the whole snapshot for a freshly built one.
    pub fn replace_all(&self, flows: Vec<Flow>) {
        let mut next: HashMap<String, BTreeMap<u32, Arc<Flow>>> = HashMap::new();
        for flow in flows {
            next.entry(flow.ident().uid())
                .or_default()
                .insert(flow.revision, Arc::new(flow));
        }
        *self.flows.write() = Arc::new(next);
    }

    fn snapshot(&self) -> Arc<HashMap<String, BTreeMap<u32, Arc<Flow>>>> {
        Arc::clone(&self.flows.read())
    }

    /// Latest revision of a flow.
    pub fn find_latest(&self, ident: &FlowIdent) -> Option<Arc<Flow>> {
        self.snapshot()
            .get(&ident.uid())
            .and_then(|revisions| revisions.last_key_value().map(|(_, flow)| Arc::clone(flow)))
    }

    /// A specific pinned revision.
    pub fn find_revision(&self, ident: &FlowIdent, revision: u32) -> Option<Arc<Flow>> {
        self.snapshot()
            .get(&ident.uid())
            .and_then(|revisions| revisions.get(&revision).map(Arc::clone))
    }

    /// The exact revision an execution was started against.
    pub fn find_by_execution(&self, execution: &Execution) -> Option<Arc<Flow>> {
        self.snapshot()
            .get(&execution.flow_ident().uid())
            .and_then(|revisions| revisions.get(&execution.flow_revision).map(Arc::clone))
    }

    /// Latest revision of every flow, for trigger evaluation.
    pub fn all_latest(&self) -> Vec<Arc<Flow>> {
        self.snapshot()
            .values()
            .filter_map(|revisions| revisions.last_key_value().map(|(_, flow)| Arc::clone(flow)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(id: &str, revision: u32) -> Flow {
        Flow {
            tenant: "main".to_string(),
            namespace: "dev".to_string(),
            id: id.to_string(),
            revision,
            tasks: vec![],
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

    #[test]
    fn test_flow_store_revisions() {
        let store = FlowStore::with_flows(vec![flow("etl", 1), flow("etl", 2)]);
        let ident = FlowIdent::new("main", "dev", "etl");

        assert_eq!(store.find_latest(&ident).unwrap().revision, 2);

        let mut execution =
            Execution::create(&flow("etl", 1), crate::models::JsonMap::new(), vec![]);
        execution.flow_revision = 1;
        assert_eq!(store.find_by_execution(&execution).unwrap().revision, 1);
    }

    #[test]
    fn test_flow_store_snapshot_swap() {
        let store = FlowStore::with_flows(vec![flow("etl", 1)]);
        let before = store.find_latest(&FlowIdent::new("main", "dev", "etl")).unwrap();

        store.replace_all(vec![flow("reports", 1)]);
        assert!(store.find_latest(&FlowIdent::new("main", "dev", "etl")).is_none());
        assert_eq!(store.all_latest().len(), 1);

        // snapshots taken before the swap stay valid
        assert_eq!(before.id, "etl");
    }

    #[test]
    fn test_window_completion() {
        let now = Utc::now();
        let mut window = MultipleConditionWindow::new("t/dev/fan-in/all", now, 60_000);
        assert!(!window.is_complete(2));

        window.mark(0);
        window.mark(1);
        assert!(window.is_complete(2));
        assert!(!window.is_expired(now));
        assert!(window.is_expired(now + chrono::Duration::milliseconds(60_001)));
    }
}
