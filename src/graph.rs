//! # Task Graph Resolver
//!
//! Pure functions deciding which tasks of a flow are ready to run next and
//! when a scope of tasks counts as finished.
//!
//! ## Overview
//!
//! Resolution always works on a *scope*: the list of [`ResolvedTask`]s that
//! are candidates under the current branch (main tasks, or the error branch
//! once a main task failed, plus the finally block). A resolved task pairs a
//! task definition with the expansion context it would run under (parent task
//! run, each-value, loop iteration), which is exactly the identity used to
//! match it against existing task runs.
//!
//! Everything here is synchronous and side-effect free; condition rendering
//! for `if`/`loop` branches happens in the orchestration core before these
//! functions are called.

use uuid::Uuid;

use crate::error::{WeirError, WeirResult};
use crate::models::execution::{guess_final_state, Execution};
use crate::models::flow::TaskDef;
use crate::models::state::StateKind;
use crate::models::task_run::TaskRun;

/// A task definition plus the expansion context it would run under.
#[derive(Debug, Clone)]
pub struct ResolvedTask<'a> {
    pub task: &'a TaskDef,
    pub parent_task_run_id: Option<Uuid>,
    pub value: Option<String>,
    pub iteration: Option<u32>,
}

impl<'a> ResolvedTask<'a> {
    pub fn of(task: &'a TaskDef) -> Self {
        ResolvedTask {
            task,
            parent_task_run_id: None,
            value: None,
            iteration: None,
        }
    }

    /// Whether `run` is the task run for this resolved slot.
    pub fn matches(&self, run: &TaskRun) -> bool {
        run.task_id == self.task.id
            && run.parent_task_run_id == self.parent_task_run_id
            && run.value == self.value
            && run.iteration == self.iteration
    }

    pub fn to_task_run(&self, execution_id: Uuid) -> TaskRun {
        TaskRun::create(
            execution_id,
            &self.task.id,
            self.parent_task_run_id,
            self.value.clone(),
            self.iteration,
        )
    }
}

/// Resolve a flat task list, inheriting the parent run's expansion context.
pub fn resolve_tasks<'a>(tasks: &'a [TaskDef], parent: Option<&TaskRun>) -> Vec<ResolvedTask<'a>> {
    tasks
        .iter()
        .map(|task| ResolvedTask {
            task,
            parent_task_run_id: parent.map(|p| p.id),
            value: parent.and_then(|p| p.value.clone()),
            iteration: parent.and_then(|p| p.iteration),
        })
        .collect()
}

/// Cross-product resolution for `each`: every task once per value, in value
/// order. Duplicate values are rejected since they would collapse distinct
/// slots into one task run identity.
pub fn resolve_each_tasks<'a>(
    values: &[String],
    tasks: &'a [TaskDef],
    parent: &TaskRun,
) -> WeirResult<Vec<ResolvedTask<'a>>> {
    let mut seen = std::collections::HashSet::new();
    for value in values {
        if !seen.insert(value.as_str()) {
            return Err(WeirError::internal(format!(
                "duplicate value '{value}' in each task '{}'",
                parent.task_id
            )));
        }
    }

    Ok(values
        .iter()
        .flat_map(|value| {
            tasks.iter().map(move |task| ResolvedTask {
                task,
                parent_task_run_id: Some(parent.id),
                value: Some(value.clone()),
                iteration: parent.iteration,
            })
        })
        .collect())
}

/// Resolution for one loop pass: every task tagged with the loop's current
/// iteration counter. The counter is passed explicitly since the parent run
/// tracks it in its outputs, keeping the parent's own slot identity stable.
pub fn resolve_iteration_tasks<'a>(
    tasks: &'a [TaskDef],
    parent: &TaskRun,
    iteration: u32,
) -> Vec<ResolvedTask<'a>> {
    tasks
        .iter()
        .map(|task| ResolvedTask {
            task,
            parent_task_run_id: Some(parent.id),
            value: parent.value.clone(),
            iteration: Some(iteration),
        })
        .collect()
}

/// Existing task runs occupying slots of `scope`.
pub fn find_task_runs<'e>(execution: &'e Execution, scope: &[ResolvedTask<'_>]) -> Vec<&'e TaskRun> {
    execution
        .task_run_list
        .iter()
        .filter(|run| scope.iter().any(|resolved| resolved.matches(run)))
        .collect()
}

/// Any slot of `scope` holding a FAILED run.
pub fn has_failed(execution: &Execution, scope: &[ResolvedTask<'_>]) -> bool {
    find_task_runs(execution, scope)
        .iter()
        .any(|run| run.state.current.is_failed())
}

/// Every slot of `scope` holds a terminated run. An empty scope is finished.
pub fn is_terminated(execution: &Execution, scope: &[ResolvedTask<'_>]) -> bool {
    scope.iter().all(|resolved| {
        execution
            .task_run_list
            .iter()
            .any(|run| resolved.matches(run) && run.is_terminated())
    })
}

/// Pick the active branch: the error branch replaces the remaining main
/// tasks once any main slot failed; the finally block is appended either way
/// so it runs after the branch completes.
pub fn find_tasks_depending_flow_state<'a>(
    execution: &Execution,
    tasks: &'a [TaskDef],
    errors: &'a [TaskDef],
    finally_tasks: &'a [TaskDef],
    parent: Option<&TaskRun>,
) -> Vec<ResolvedTask<'a>> {
    let main = resolve_tasks(tasks, parent);
    let mut branch = if has_failed(execution, &main) {
        resolve_tasks(errors, parent)
    } else {
        main
    };
    branch.extend(resolve_tasks(finally_tasks, parent));
    branch
}

/// Sequential advance: at most one new task run, and only when nothing in
/// the scope is still pending or active.
pub fn resolve_sequential_nexts(execution: &Execution, scope: &[ResolvedTask<'_>]) -> Vec<TaskRun> {
    if scope.is_empty() {
        return Vec::new();
    }

    let runs = find_task_runs(execution, scope);
    if runs.iter().any(|run| !run.is_terminated()) {
        return Vec::new();
    }

    scope
        .iter()
        .find(|resolved| !runs.iter().any(|run| resolved.matches(run)))
        .map(|resolved| vec![resolved.to_task_run(execution.id)])
        .unwrap_or_default()
}

/// Parallel advance: start every slot without a run, bounded by `concurrency`
/// minus the slots still active (0 = unbounded).
pub fn resolve_parallel_nexts(
    execution: &Execution,
    scope: &[ResolvedTask<'_>],
    concurrency: usize,
) -> Vec<TaskRun> {
    let runs = find_task_runs(execution, scope);
    let active = runs.iter().filter(|run| !run.is_terminated()).count();
    let capacity = if concurrency == 0 {
        usize::MAX
    } else {
        concurrency.saturating_sub(active)
    };

    scope
        .iter()
        .filter(|resolved| !runs.iter().any(|run| resolved.matches(run)))
        .take(capacity)
        .map(|resolved| resolved.to_task_run(execution.id))
        .collect()
}

/// Terminal state of a composite scope, if it can be decided yet.
///
/// An empty scope means a child failed and no error branch exists: the fold
/// then covers every child of the parent so the failure is not lost.
pub fn resolve_scope_state(
    execution: &Execution,
    scope: &[ResolvedTask<'_>],
    parent: &TaskRun,
    allow_failure: bool,
    allow_warning: bool,
) -> Option<StateKind> {
    if scope.is_empty() {
        let children = execution.find_children(parent.id);
        if children.iter().any(|run| !run.is_terminated()) {
            return None;
        }
        return Some(guess_final_state(
            children.into_iter(),
            allow_failure,
            allow_warning,
        ));
    }

    if is_terminated(execution, scope) {
        let runs = find_task_runs(execution, scope);
        return Some(guess_final_state(
            runs.into_iter(),
            allow_failure,
            allow_warning,
        ));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flow::{Flow, RunnableDef, TaskKind};
    use crate::models::state::State;
    use crate::models::JsonMap;

    fn runnable(id: &str) -> TaskDef {
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

    fn flow_with(tasks: Vec<TaskDef>, errors: Vec<TaskDef>, finally_tasks: Vec<TaskDef>) -> Flow {
        Flow {
            tenant: "main".to_string(),
            namespace: "dev".to_string(),
            id: "graph".to_string(),
            revision: 1,
            tasks,
            errors,
            finally_tasks,
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

    fn terminated(execution: &Execution, task_id: &str, kind: StateKind) -> TaskRun {
        let mut run = TaskRun::create(execution.id, task_id, None, None, None);
        run.state = State::new(StateKind::Created)
            .with_state(StateKind::Running)
            .with_state(kind);
        run
    }

    #[test]
    fn test_sequential_starts_first_task() {
        let flow = flow_with(vec![runnable("a"), runnable("b")], vec![], vec![]);
        let execution = Execution::create(&flow, JsonMap::new(), vec![]);
        let scope = resolve_tasks(&flow.tasks, None);

        let nexts = resolve_sequential_nexts(&execution, &scope);
        assert_eq!(nexts.len(), 1);
        assert_eq!(nexts[0].task_id, "a");
    }

    #[test]
    fn test_sequential_blocks_on_active_run() {
        let flow = flow_with(vec![runnable("a"), runnable("b")], vec![], vec![]);
        let execution = Execution::create(&flow, JsonMap::new(), vec![]);
        let running = TaskRun::create(execution.id, "a", None, None, None);
        let execution = execution.with_appended_task_runs(vec![running]);

        let scope = resolve_tasks(&flow.tasks, None);
        assert!(resolve_sequential_nexts(&execution, &scope).is_empty());
    }

    #[test]
    fn test_sequential_advances_after_terminal() {
        let flow = flow_with(vec![runnable("a"), runnable("b")], vec![], vec![]);
        let execution = Execution::create(&flow, JsonMap::new(), vec![]);
        let done = terminated(&execution, "a", StateKind::Success);
        let execution = execution.with_appended_task_runs(vec![done]);

        let scope = resolve_tasks(&flow.tasks, None);
        let nexts = resolve_sequential_nexts(&execution, &scope);
        assert_eq!(nexts.len(), 1);
        assert_eq!(nexts[0].task_id, "b");
    }

    #[test]
    fn test_branch_switches_to_errors_on_failure() {
        let flow = flow_with(
            vec![runnable("a"), runnable("b")],
            vec![runnable("on-error")],
            vec![runnable("cleanup")],
        );
        let execution = Execution::create(&flow, JsonMap::new(), vec![]);
        let failed = terminated(&execution, "a", StateKind::Failed);
        let execution = execution.with_appended_task_runs(vec![failed]);

        let scope = find_tasks_depending_flow_state(
            &execution,
            &flow.tasks,
            &flow.errors,
            &flow.finally_tasks,
            None,
        );
        let ids: Vec<&str> = scope.iter().map(|r| r.task.id.as_str()).collect();
        assert_eq!(ids, vec!["on-error", "cleanup"]);

        // the error task starts; "b" never will
        let nexts = resolve_sequential_nexts(&execution, &scope);
        assert_eq!(nexts.len(), 1);
        assert_eq!(nexts[0].task_id, "on-error");
    }

    #[test]
    fn test_finally_runs_after_main_branch() {
        let flow = flow_with(vec![runnable("a")], vec![], vec![runnable("cleanup")]);
        let execution = Execution::create(&flow, JsonMap::new(), vec![]);
        let done = terminated(&execution, "a", StateKind::Success);
        let execution = execution.with_appended_task_runs(vec![done]);

        let scope = find_tasks_depending_flow_state(
            &execution,
            &flow.tasks,
            &flow.errors,
            &flow.finally_tasks,
            None,
        );
        let nexts = resolve_sequential_nexts(&execution, &scope);
        assert_eq!(nexts.len(), 1);
        assert_eq!(nexts[0].task_id, "cleanup");
    }

    #[test]
    fn test_failure_without_errors_ends_scope() {
        let flow = flow_with(vec![runnable("a"), runnable("b")], vec![], vec![]);
        let execution = Execution::create(&flow, JsonMap::new(), vec![]);
        let failed = terminated(&execution, "a", StateKind::Failed);
        let execution = execution.with_appended_task_runs(vec![failed]);

        let scope = find_tasks_depending_flow_state(
            &execution,
            &flow.tasks,
            &flow.errors,
            &flow.finally_tasks,
            None,
        );
        assert!(scope.is_empty());
        assert!(is_terminated(&execution, &scope));
        assert!(resolve_sequential_nexts(&execution, &scope).is_empty());
    }

    #[test]
    fn test_parallel_respects_concurrency_cap() {
        let flow = flow_with(
            vec![runnable("a"), runnable("b"), runnable("c")],
            vec![],
            vec![],
        );
        let execution = Execution::create(&flow, JsonMap::new(), vec![]);
        let scope = resolve_tasks(&flow.tasks, None);

        let first = resolve_parallel_nexts(&execution, &scope, 2);
        assert_eq!(first.len(), 2);

        let execution = execution.with_appended_task_runs(first);
        assert!(resolve_parallel_nexts(&execution, &scope, 2).is_empty());

        // one slot terminates, one more may start
        let done = execution.task_run_list[0].with_state(StateKind::Success);
        let execution = execution.with_task_run(done).unwrap();
        let second = resolve_parallel_nexts(&execution, &scope, 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].task_id, "c");
    }

    #[test]
    fn test_parallel_unbounded_starts_all() {
        let flow = flow_with(
            vec![runnable("a"), runnable("b"), runnable("c")],
            vec![],
            vec![],
        );
        let execution = Execution::create(&flow, JsonMap::new(), vec![]);
        let scope = resolve_tasks(&flow.tasks, None);
        assert_eq!(resolve_parallel_nexts(&execution, &scope, 0).len(), 3);
    }

    #[test]
    fn test_each_expands_per_value() {
        let flow = flow_with(vec![runnable("each")], vec![], vec![]);
        let execution = Execution::create(&flow, JsonMap::new(), vec![]);
        let parent = TaskRun::create(execution.id, "each", None, None, None);
        let children = vec![runnable("child")];

        let values = vec!["x".to_string(), "y".to_string()];
        let scope = resolve_each_tasks(&values, &children, &parent).unwrap();
        assert_eq!(scope.len(), 2);
        assert_eq!(scope[0].value.as_deref(), Some("x"));
        assert_eq!(scope[1].value.as_deref(), Some("y"));

        // sequential over the expansion: one value at a time
        let execution = execution.with_appended_task_runs(vec![parent]);
        let nexts = resolve_sequential_nexts(&execution, &scope);
        assert_eq!(nexts.len(), 1);
        assert_eq!(nexts[0].value.as_deref(), Some("x"));
    }

    #[test]
    fn test_each_rejects_duplicate_values() {
        let execution = Execution::create(
            &flow_with(vec![runnable("each")], vec![], vec![]),
            JsonMap::new(),
            vec![],
        );
        let parent = TaskRun::create(execution.id, "each", None, None, None);
        let children = vec![runnable("child")];

        let values = vec!["x".to_string(), "x".to_string()];
        assert!(resolve_each_tasks(&values, &children, &parent).is_err());
    }

    #[test]
    fn test_scope_state_folds_children_without_error_branch() {
        let flow = flow_with(vec![runnable("seq")], vec![], vec![]);
        let execution = Execution::create(&flow, JsonMap::new(), vec![]);
        let parent = TaskRun::create(execution.id, "seq", None, None, None);
        let mut child = TaskRun::create(execution.id, "child", Some(parent.id), None, None);
        child.state = State::new(StateKind::Created).with_state(StateKind::Failed);
        let execution = execution.with_appended_task_runs(vec![parent.clone(), child]);

        let state = resolve_scope_state(&execution, &[], &parent, false, false);
        assert_eq!(state, Some(StateKind::Failed));

        let downgraded = resolve_scope_state(&execution, &[], &parent, true, false);
        assert_eq!(downgraded, Some(StateKind::Warning));
    }

    #[test]
    fn test_scope_state_waits_for_all_slots() {
        let flow = flow_with(vec![runnable("a"), runnable("b")], vec![], vec![]);
        let execution = Execution::create(&flow, JsonMap::new(), vec![]);
        let parent = TaskRun::create(execution.id, "par", None, None, None);
        let scope = resolve_tasks(&flow.tasks, Some(&parent));

        let mut done = scope[0].to_task_run(execution.id);
        done.state = State::new(StateKind::Created).with_state(StateKind::Success);
        let execution = execution.with_appended_task_runs(vec![done]);

        assert_eq!(
            resolve_scope_state(&execution, &scope, &parent, false, false),
            None
        );

        let mut other = scope[1].to_task_run(execution.id);
        other.state = State::new(StateKind::Created).with_state(StateKind::Warning);
        let execution = execution.with_appended_task_runs(vec![other]);

        assert_eq!(
            resolve_scope_state(&execution, &scope, &parent, false, false),
            Some(StateKind::Warning)
        );
    }
}
