//! # Flow Definition Model
//!
//! Immutable flow definitions resolved from the flow metadata store.
//!
//! ## Overview
//!
//! A [`Flow`] is the declared task graph for one (tenant, namespace, id,
//! revision): main tasks, error branch, finally branch, post-terminal
//! listeners and after-execution tasks, plus the policies that shape
//! orchestration (retry, concurrency, SLA rules, triggers, outputs).
//!
//! ## Task Capabilities
//!
//! Task behavior is a closed set of tagged variants ([`TaskKind`]) the
//! orchestration core switches on:
//!
//! - **Runnable** - dispatched to a worker process
//! - **Flowable** - composite container sequencing child task runs
//!   (sequential, parallel, each-value, conditional, loop)
//! - **Subflow** - delegates to a child execution of another flow
//! - **Pause** - suspends the execution, optionally with timers
//! - **UpdateLabels** - mutates the execution itself, synchronously
//!
//! Flow parsing/validation is not this crate's concern; definitions arrive
//! already structured.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::RenderError;
use crate::models::label::Label;
use crate::models::state::StateKind;

/// Identity of a flow, the key for concurrency counters and queued stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowIdent {
    pub tenant: String,
    pub namespace: String,
    pub flow_id: String,
}

impl FlowIdent {
    pub fn new(
        tenant: impl Into<String>,
        namespace: impl Into<String>,
        flow_id: impl Into<String>,
    ) -> Self {
        FlowIdent {
            tenant: tenant.into(),
            namespace: namespace.into(),
            flow_id: flow_id.into(),
        }
    }

    /// Stable uid used in logs and storage keys.
    pub fn uid(&self) -> String {
        format!("{}/{}/{}", self.tenant, self.namespace, self.flow_id)
    }
}

impl std::fmt::Display for FlowIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uid())
    }
}

/// A complete flow definition at one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub tenant: String,
    pub namespace: String,
    pub id: String,
    pub revision: u32,
    pub tasks: Vec<TaskDef>,
    /// Error branch, resolved instead of remaining main tasks after a failure.
    #[serde(default)]
    pub errors: Vec<TaskDef>,
    /// Always resolved once the active branch is terminal.
    #[serde(default, rename = "finally")]
    pub finally_tasks: Vec<TaskDef>,
    /// Post-terminal listeners, resolved sequentially before after-execution.
    #[serde(default)]
    pub listeners: Vec<TaskDef>,
    /// Post-terminal tasks forced to run even under a kill.
    #[serde(default)]
    pub after_execution: Vec<TaskDef>,
    #[serde(default)]
    pub outputs: Vec<OutputDef>,
    /// Flow-level retry, the lowest-precedence policy.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub concurrency: Option<Concurrency>,
    #[serde(default)]
    pub sla: Vec<Sla>,
    #[serde(default)]
    pub triggers: Vec<FlowTrigger>,
    #[serde(default)]
    pub disabled: bool,
}

impl Flow {
    pub fn ident(&self) -> FlowIdent {
        FlowIdent::new(&self.tenant, &self.namespace, &self.id)
    }

    pub fn uid(&self) -> String {
        format!("{}/{}/{}/{}", self.tenant, self.namespace, self.id, self.revision)
    }

    /// Depth-first search across every task list, nested children included.
    pub fn find_task(&self, task_id: &str) -> Option<&TaskDef> {
        fn search<'a>(tasks: &[&'a TaskDef], task_id: &str) -> Option<&'a TaskDef> {
            for task in tasks {
                if task.id == task_id {
                    return Some(task);
                }
                if let Some(found) = search(&task.child_refs(), task_id) {
                    return Some(found);
                }
            }
            None
        }
        for list in [
            &self.tasks,
            &self.errors,
            &self.finally_tasks,
            &self.listeners,
            &self.after_execution,
        ] {
            let refs: Vec<&TaskDef> = list.iter().collect();
            if let Some(found) = search(&refs, task_id) {
                return Some(found);
            }
        }
        None
    }

    /// Ancestor task chain from root to the direct parent of `task_id`.
    pub fn ancestor_chain(&self, task_id: &str) -> Vec<&TaskDef> {
        fn walk<'a>(tasks: &[&'a TaskDef], task_id: &str, path: &mut Vec<&'a TaskDef>) -> bool {
            for task in tasks {
                if task.id == task_id {
                    return true;
                }
                path.push(task);
                if walk(&task.child_refs(), task_id, path) {
                    return true;
                }
                path.pop();
            }
            false
        }
        for list in [&self.tasks, &self.errors, &self.finally_tasks] {
            let refs: Vec<&TaskDef> = list.iter().collect();
            let mut path = Vec::new();
            if walk(&refs, task_id, &mut path) {
                return path;
            }
        }
        Vec::new()
    }

    /// Retry precedence: task policy, then nearest ancestor flowable policy,
    /// then the flow-level policy.
    pub fn retry_policy_for(&self, task_id: &str) -> Option<&RetryPolicy> {
        if let Some(task) = self.find_task(task_id) {
            if let Some(retry) = &task.retry {
                return Some(retry);
            }
        }
        let chain = self.ancestor_chain(task_id);
        for ancestor in chain.iter().rev() {
            if ancestor.is_flowable() {
                if let Some(retry) = &ancestor.retry {
                    return Some(retry);
                }
            }
        }
        self.retry.as_ref()
    }

    /// Monitoring-kind SLA rules, the ones backed by durable deadline timers.
    pub fn monitoring_slas(&self) -> impl Iterator<Item = &Sla> {
        self.sla.iter().filter(|sla| sla.is_monitoring())
    }

    /// Execution-changed SLA rules, evaluated on every orchestration pass.
    pub fn execution_changed_slas(&self) -> impl Iterator<Item = &Sla> {
        self.sla.iter().filter(|sla| !sla.is_monitoring())
    }
}

/// One declared task inside a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
    pub id: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// A failure of this task degrades to WARNING instead of failing the flow.
    #[serde(default)]
    pub allow_failure: bool,
    /// A WARNING outcome of this task is folded as SUCCESS.
    #[serde(default)]
    pub allow_warning: bool,
    #[serde(default)]
    pub worker_group: Option<WorkerGroup>,
}

impl TaskDef {
    pub fn is_flowable(&self) -> bool {
        matches!(self.kind, TaskKind::Flowable(_))
    }

    pub fn as_flowable(&self) -> Option<&FlowableDef> {
        match &self.kind {
            TaskKind::Flowable(def) => Some(def),
            _ => None,
        }
    }

    pub fn as_subflow(&self) -> Option<&SubflowDef> {
        match &self.kind {
            TaskKind::Subflow(def) => Some(def),
            _ => None,
        }
    }

    pub fn as_pause(&self) -> Option<&PauseDef> {
        match &self.kind {
            TaskKind::Pause(def) => Some(def),
            _ => None,
        }
    }

    /// Direct child definitions, empty for leaf tasks.
    pub fn child_refs(&self) -> Vec<&TaskDef> {
        match &self.kind {
            TaskKind::Flowable(def) => match def {
                FlowableDef::Sequential { tasks } => tasks.iter().collect(),
                FlowableDef::Parallel { tasks, .. } => tasks.iter().collect(),
                FlowableDef::Each { tasks, .. } => tasks.iter().collect(),
                FlowableDef::If {
                    then_tasks,
                    else_tasks,
                    ..
                } => then_tasks.iter().chain(else_tasks.iter()).collect(),
                FlowableDef::Loop { tasks, .. } => tasks.iter().collect(),
            },
            _ => Vec::new(),
        }
    }
}

/// The closed capability set for tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Runnable(RunnableDef),
    Flowable(FlowableDef),
    Subflow(SubflowDef),
    Pause(PauseDef),
    UpdateLabels(UpdateLabelsDef),
}

/// Opaque payload handed to workers; the engine never interprets `params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnableDef {
    pub plugin: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Composite container semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowableDef {
    /// Children run one at a time, in declaration order.
    Sequential { tasks: Vec<TaskDef> },
    /// Children run concurrently, optionally capped (0 = unbounded).
    Parallel {
        tasks: Vec<TaskDef>,
        #[serde(default)]
        concurrency: usize,
    },
    /// Children run sequentially once per value, values in order.
    Each {
        values: Vec<String>,
        tasks: Vec<TaskDef>,
    },
    /// One branch chosen by rendering `condition` to a truthy value.
    If {
        condition: String,
        then_tasks: Vec<TaskDef>,
        #[serde(default)]
        else_tasks: Vec<TaskDef>,
    },
    /// Children repeat per iteration until `until` renders truthy or
    /// `max_iterations` is reached; `interval_ms` paces iterations through a
    /// durable delay.
    Loop {
        tasks: Vec<TaskDef>,
        max_iterations: u32,
        #[serde(default)]
        until: Option<String>,
        #[serde(default)]
        interval_ms: Option<u64>,
    },
}

/// Subflow delegation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubflowDef {
    pub namespace: String,
    pub flow_id: String,
    #[serde(default)]
    pub revision: Option<u32>,
    /// Templated inputs rendered against the parent execution.
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub labels: Vec<Label>,
    /// Wait for the child to terminate before finishing the parent task run.
    #[serde(default = "default_true")]
    pub wait: bool,
    /// Propagate a FAILED/KILLED child as a parent failure.
    #[serde(default = "default_true")]
    pub transmit_failed: bool,
    /// Copy the parent execution's labels onto the child.
    #[serde(default)]
    pub inherit_labels: bool,
    /// Templated RFC 3339 date; the child starts no earlier than this.
    #[serde(default)]
    pub schedule_date: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Pause semantics: `delay_ms` auto-advances per `behavior`, `timeout_ms`
/// auto-fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseDef {
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub behavior: PauseBehavior,
}

/// What happens to the paused task when `delay_ms` elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseBehavior {
    #[default]
    Resume,
    Fail,
    Cancel,
}

impl PauseBehavior {
    /// Target state applied when the delay fires.
    pub fn target_state(&self) -> StateKind {
        match self {
            PauseBehavior::Resume => StateKind::Running,
            PauseBehavior::Fail => StateKind::Failed,
            PauseBehavior::Cancel => StateKind::Cancelled,
        }
    }
}

/// Execution-updating task: appends/overrides labels, templated values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateLabelsDef {
    pub labels: Vec<Label>,
}

/// Retry behaviors shared by both policy shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBehavior {
    /// Fire the same task run again in place (RETRYING).
    RetryFailedTask,
    /// Replay through a brand-new execution (RETRIED).
    CreateNewExecution,
}

impl Default for RetryBehavior {
    fn default() -> Self {
        RetryBehavior::RetryFailedTask
    }
}

/// Retry policy with bounded attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    Constant {
        interval_ms: u64,
        max_attempts: u32,
        #[serde(default)]
        behavior: RetryBehavior,
    },
    Exponential {
        interval_ms: u64,
        max_interval_ms: u64,
        multiplier: f64,
        max_attempts: u32,
        #[serde(default)]
        behavior: RetryBehavior,
    },
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::Constant { max_attempts, .. } => *max_attempts,
            RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    pub fn behavior(&self) -> RetryBehavior {
        match self {
            RetryPolicy::Constant { behavior, .. } => *behavior,
            RetryPolicy::Exponential { behavior, .. } => *behavior,
        }
    }

    /// Backoff before attempt `attempts_done + 1`, with the exponential shape
    /// capped at `max_interval_ms`.
    pub fn delay_for(&self, attempts_done: u32) -> Duration {
        match self {
            RetryPolicy::Constant { interval_ms, .. } => {
                Duration::milliseconds(*interval_ms as i64)
            }
            RetryPolicy::Exponential {
                interval_ms,
                max_interval_ms,
                multiplier,
                ..
            } => {
                let exponent = attempts_done.saturating_sub(1).min(63);
                let raw = (*interval_ms as f64) * multiplier.powi(exponent as i32);
                let capped = raw.min(*max_interval_ms as f64);
                Duration::milliseconds(capped as i64)
            }
        }
    }

    /// When the next retry should fire, or `None` once attempts are spent.
    pub fn next_retry_date(
        &self,
        attempts_done: u32,
        from: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if attempts_done >= self.max_attempts() {
            return None;
        }
        Some(from + self.delay_for(attempts_done))
    }
}

/// Behavior when the concurrency limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyBehavior {
    Queue,
    Cancel,
    Fail,
}

impl Default for ConcurrencyBehavior {
    fn default() -> Self {
        ConcurrencyBehavior::Queue
    }
}

/// Per-flow concurrency limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concurrency {
    pub limit: usize,
    #[serde(default)]
    pub behavior: ConcurrencyBehavior,
}

/// Worker-group routing with a fallback when no worker is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerGroup {
    pub key: String,
    #[serde(default)]
    pub fallback: WorkerGroupFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerGroupFallback {
    /// Leave the task run CREATED and retry on a later pass.
    Wait,
    Fail,
    Cancel,
}

impl Default for WorkerGroupFallback {
    fn default() -> Self {
        WorkerGroupFallback::Wait
    }
}

/// SLA behavior on violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaBehavior {
    Fail,
    Cancel,
    None,
}

/// Service-level rules declared on a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sla {
    /// Monitoring rule: a durable deadline timer from execution start.
    MaxDuration {
        id: String,
        duration_ms: u64,
        behavior: SlaBehavior,
        #[serde(default)]
        labels: Vec<Label>,
    },
    /// Execution-changed rule: `condition` rendered truthy means violated.
    ExecutionCondition {
        id: String,
        condition: String,
        behavior: SlaBehavior,
        #[serde(default)]
        labels: Vec<Label>,
    },
}

impl Sla {
    pub fn id(&self) -> &str {
        match self {
            Sla::MaxDuration { id, .. } => id,
            Sla::ExecutionCondition { id, .. } => id,
        }
    }

    pub fn behavior(&self) -> SlaBehavior {
        match self {
            Sla::MaxDuration { behavior, .. } => *behavior,
            Sla::ExecutionCondition { behavior, .. } => *behavior,
        }
    }

    pub fn labels(&self) -> &[Label] {
        match self {
            Sla::MaxDuration { labels, .. } => labels,
            Sla::ExecutionCondition { labels, .. } => labels,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        matches!(self, Sla::MaxDuration { .. })
    }
}

/// Declared flow output with a type the resolver validates against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    pub id: String,
    #[serde(rename = "type")]
    pub output_type: OutputType,
    /// Templated value, usually referencing task outputs.
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    String,
    Int,
    Float,
    Bool,
    Datetime,
    Json,
}

impl OutputType {
    /// Coerce a rendered value into this type, or report the mismatch.
    pub fn resolve(
        &self,
        output_id: &str,
        value: serde_json::Value,
    ) -> Result<serde_json::Value, RenderError> {
        use serde_json::Value;
        let mismatch = |expected: &'static str, value: &Value| RenderError::OutputType {
            output: output_id.to_string(),
            expected,
            value: value.to_string(),
        };
        match self {
            OutputType::String => match value {
                Value::String(_) => Ok(value),
                other => Ok(Value::String(other.to_string())),
            },
            OutputType::Int => match &value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value),
                Value::String(s) => s
                    .parse::<i64>()
                    .map(|n| Value::Number(n.into()))
                    .map_err(|_| mismatch("int", &value)),
                _ => Err(mismatch("int", &value)),
            },
            OutputType::Float => match &value {
                Value::Number(_) => Ok(value),
                Value::String(s) => s
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| mismatch("float", &value)),
                _ => Err(mismatch("float", &value)),
            },
            OutputType::Bool => match &value {
                Value::Bool(_) => Ok(value),
                Value::String(s) => match s.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(mismatch("bool", &value)),
                },
                _ => Err(mismatch("bool", &value)),
            },
            OutputType::Datetime => match &value {
                Value::String(s) => s
                    .parse::<DateTime<Utc>>()
                    .map(|_| value.clone())
                    .map_err(|_| mismatch("datetime", &value)),
                _ => Err(mismatch("datetime", &value)),
            },
            OutputType::Json => Ok(value),
        }
    }
}

/// Filter over another flow's executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowFilter {
    pub namespace: String,
    pub flow_id: String,
    /// Empty means any terminal state.
    #[serde(default)]
    pub states: Vec<StateKind>,
}

impl FlowFilter {
    pub fn matches(&self, namespace: &str, flow_id: &str, state: StateKind) -> bool {
        if self.namespace != namespace || self.flow_id != flow_id {
            return false;
        }
        if self.states.is_empty() {
            state.is_terminated()
        } else {
            self.states.contains(&state)
        }
    }
}

/// Multi-flow preconditions: every filter must match inside the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerPreconditions {
    pub window_ms: u64,
    pub flows: Vec<FlowFilter>,
}

/// Trigger reacting to other flows' execution state changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTrigger {
    pub id: String,
    /// Single-execution conditions; any match fires.
    #[serde(default)]
    pub conditions: Vec<FlowFilter>,
    /// When present, deferred windowed evaluation replaces `conditions`.
    #[serde(default)]
    pub preconditions: Option<TriggerPreconditions>,
}
