pub mod execution;
pub mod flow;
pub mod label;
pub mod state;
pub mod task_run;

/// JSON object map used for inputs, outputs and rendered variables.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// Re-export core models for easy access
pub use execution::{
    guess_final_state, Breakpoint, Execution, ExecutionParent, ExecutionTrigger,
};
pub use flow::{
    Concurrency, ConcurrencyBehavior, Flow, FlowFilter, FlowIdent, FlowTrigger, FlowableDef,
    OutputDef, OutputType, PauseBehavior, PauseDef, RetryBehavior, RetryPolicy, RunnableDef, Sla,
    SlaBehavior, SubflowDef, TaskDef, TaskKind, TriggerPreconditions, UpdateLabelsDef, WorkerGroup,
    WorkerGroupFallback,
};
pub use label::Label;
pub use state::{State, StateHistory, StateKind};
pub use task_run::{Outputs, TaskRun, TaskRunAttempt};
