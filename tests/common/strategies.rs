use proptest::prelude::*;
use uuid::Uuid;
use weir_core::models::{RetryBehavior, RetryPolicy, StateKind, TaskRun};

/// Strategy over every state kind.
pub fn state_kind_strategy() -> impl Strategy<Value = StateKind> {
    prop_oneof![
        Just(StateKind::Created),
        Just(StateKind::Running),
        Just(StateKind::Paused),
        Just(StateKind::Retrying),
        Just(StateKind::Retried),
        Just(StateKind::Queued),
        Just(StateKind::Restarted),
        Just(StateKind::Killing),
        Just(StateKind::Killed),
        Just(StateKind::Success),
        Just(StateKind::Warning),
        Just(StateKind::Failed),
        Just(StateKind::Cancelled),
        Just(StateKind::Breakpoint),
    ]
}

/// Strategy over terminal kinds only.
pub fn terminal_state_strategy() -> impl Strategy<Value = StateKind> {
    prop_oneof![
        Just(StateKind::Success),
        Just(StateKind::Warning),
        Just(StateKind::Failed),
        Just(StateKind::Cancelled),
        Just(StateKind::Killed),
    ]
}

/// Strategy for state transition sequences, as the pipeline or an operator
/// might drive them.
pub fn transition_sequence_strategy() -> impl Strategy<Value = Vec<StateKind>> {
    prop::collection::vec(state_kind_strategy(), 0..12)
}

/// Strategy for task identifiers as they appear in flow definitions.
pub fn task_id_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,31}"
}

/// Strategy for uuids derived deterministically from the proptest rng.
pub fn uuid_strategy() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(Uuid::from_u128)
}

/// Strategy for constant-interval retry policies.
pub fn constant_retry_strategy() -> impl Strategy<Value = RetryPolicy> {
    (1u64..60_000, 1u32..10).prop_map(|(interval_ms, max_attempts)| RetryPolicy::Constant {
        interval_ms,
        max_attempts,
        behavior: RetryBehavior::RetryFailedTask,
    })
}

/// Strategy for exponential retry policies whose cap sits above the base
/// interval.
pub fn exponential_retry_strategy() -> impl Strategy<Value = RetryPolicy> {
    (1u64..10_000, 1.0f64..4.0, 1u32..10).prop_map(
        |(interval_ms, multiplier, max_attempts)| RetryPolicy::Exponential {
            interval_ms,
            max_interval_ms: interval_ms.saturating_mul(1_000),
            multiplier,
            max_attempts,
            behavior: RetryBehavior::RetryFailedTask,
        },
    )
}

/// Strategy over both retry policy shapes.
pub fn retry_policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    prop_oneof![constant_retry_strategy(), exponential_retry_strategy()]
}

/// Strategy for a fresh task run belonging to a synthetic execution.
pub fn task_run_strategy() -> impl Strategy<Value = TaskRun> {
    (uuid_strategy(), task_id_strategy())
        .prop_map(|(execution_id, task_id)| TaskRun::create(execution_id, task_id, None, None, None))
}

/// Strategy for batches of task runs with pairwise-distinct task ids, like
/// the nexts of one pipeline pass.
pub fn distinct_task_runs_strategy() -> impl Strategy<Value = Vec<TaskRun>> {
    (
        uuid_strategy(),
        prop::collection::hash_set(task_id_strategy(), 0..8),
    )
        .prop_map(|(execution_id, task_ids)| {
            task_ids
                .into_iter()
                .map(|task_id| TaskRun::create(execution_id, task_id, None, None, None))
                .collect()
        })
}
