//! # Expression Rendering
//!
//! Template evaluation for everything a flow author can parameterize:
//! conditional branches, loop exit conditions, SLA assertions, subflow
//! inputs and flow outputs.
//!
//! ## Context
//!
//! Templates render against a JSON context assembled from the execution:
//!
//! - `inputs`: the execution's input map
//! - `outputs.<task_id>`: outputs of finished task runs (keyed once more by
//!   value for each-expansions)
//! - `labels`: label key/value pairs
//! - `flow` / `execution`: identity and state metadata
//! - `trigger`: trigger variables when the execution came from a trigger
//! - `task_run`: id/value/iteration of the run being rendered for
//!
//! Rendering never mutates the execution; a failed render surfaces as a
//! [`RenderError`] and the orchestration core decides what fails with it.

use minijinja::Environment;
use serde_json::{json, Value};

use crate::error::RenderError;
use crate::models::execution::Execution;
use crate::models::flow::Flow;
use crate::models::task_run::TaskRun;
use crate::models::JsonMap;

/// Stateless template engine shared by the orchestration core.
pub struct Renderer {
    env: Environment<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Renderer {
            env: Environment::new(),
        }
    }

    /// Render one template string against a prepared context.
    pub fn render_str(&self, template: &str, context: &Value) -> Result<String, RenderError> {
        let ctx = minijinja::Value::from_serialize(context);
        Ok(self.env.render_str(template, ctx)?)
    }

    /// Render every string leaf of a JSON value, recursing through arrays
    /// and objects. Non-string scalars pass through untouched.
    pub fn render_value(&self, value: &Value, context: &Value) -> Result<Value, RenderError> {
        match value {
            Value::String(template) => Ok(Value::String(self.render_str(template, context)?)),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(key, item)| Ok((key.clone(), self.render_value(item, context)?)))
                .collect::<Result<JsonMap, RenderError>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    pub fn render_map(&self, map: &JsonMap, context: &Value) -> Result<JsonMap, RenderError> {
        map.iter()
            .map(|(key, item)| Ok((key.clone(), self.render_value(item, context)?)))
            .collect()
    }

    /// Render a condition and interpret the result as a boolean.
    pub fn render_condition(&self, condition: &str, context: &Value) -> Result<bool, RenderError> {
        Ok(is_truthy(&self.render_str(condition, context)?))
    }
}

/// Rendered-condition truthiness: empty, `false` and `0` are false,
/// anything else is true.
pub fn is_truthy(rendered: &str) -> bool {
    let trimmed = rendered.trim();
    !(trimmed.is_empty() || trimmed == "false" || trimmed == "0")
}

/// Assemble the render context for an execution, optionally scoped to one
/// task run.
pub fn build_context(flow: &Flow, execution: &Execution, task_run: Option<&TaskRun>) -> Value {
    let mut outputs = JsonMap::new();
    for run in &execution.task_run_list {
        let Some(run_outputs) = &run.outputs else {
            continue;
        };
        let entry = Value::Object(run_outputs.clone());
        match &run.value {
            Some(value) => {
                let slot = outputs
                    .entry(run.task_id.clone())
                    .or_insert_with(|| Value::Object(JsonMap::new()));
                if let Value::Object(by_value) = slot {
                    by_value.insert(value.clone(), entry);
                }
            }
            None => {
                outputs.insert(run.task_id.clone(), entry);
            }
        }
    }

    let labels: JsonMap = execution
        .labels
        .iter()
        .map(|label| (label.key.clone(), Value::String(label.value.clone())))
        .collect();

    let mut context = json!({
        "flow": {
            "tenant": flow.tenant,
            "namespace": flow.namespace,
            "id": flow.id,
            "revision": flow.revision,
        },
        "execution": {
            "id": execution.id.to_string(),
            "state": execution.state.current.to_string(),
            "start_date": execution.state.started_date().to_rfc3339(),
        },
        "inputs": Value::Object(execution.inputs.clone()),
        "outputs": Value::Object(outputs),
        "labels": Value::Object(labels),
    });

    if let Some(trigger) = &execution.trigger {
        context["trigger"] = json!({
            "id": trigger.id,
            "variables": trigger.variables,
        });
    }

    if let Some(run) = task_run {
        context["task_run"] = json!({
            "id": run.id.to_string(),
            "task_id": run.task_id,
            "value": run.value,
            "iteration": run.iteration,
            "attempt": run.attempt_count(),
        });
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flow::{RunnableDef, TaskDef, TaskKind};
    use crate::models::state::StateKind;

    fn test_flow() -> Flow {
        Flow {
            tenant: "main".to_string(),
            namespace: "dev".to_string(),
            id: "render".to_string(),
            revision: 3,
            tasks: vec![TaskDef {
                id: "extract".to_string(),
                kind: TaskKind::Runnable(RunnableDef {
                    plugin: "noop".to_string(),
                    params: Value::Null,
                }),
                retry: None,
                allow_failure: false,
                allow_warning: false,
                worker_group: None,
            }],
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

    fn execution_with_outputs() -> (Flow, Execution) {
        let flow = test_flow();
        let mut inputs = JsonMap::new();
        inputs.insert("count".to_string(), json!(3));
        let execution = Execution::create(&flow, inputs, vec![]);

        let mut outputs = JsonMap::new();
        outputs.insert("rows".to_string(), json!(42));
        let run = TaskRun::create(execution.id, "extract", None, None, None)
            .with_state(StateKind::Success)
            .with_outputs(outputs);
        let execution = execution.with_appended_task_runs(vec![run]);
        (flow, execution)
    }

    #[test]
    fn test_renders_inputs_and_outputs() {
        let (flow, execution) = execution_with_outputs();
        let renderer = Renderer::new();
        let context = build_context(&flow, &execution, None);

        let rendered = renderer
            .render_str("{{ inputs.count }}:{{ outputs.extract.rows }}", &context)
            .unwrap();
        assert_eq!(rendered, "3:42");
    }

    #[test]
    fn test_render_value_recurses() {
        let (flow, execution) = execution_with_outputs();
        let renderer = Renderer::new();
        let context = build_context(&flow, &execution, None);

        let raw = json!({
            "query": "select {{ outputs.extract.rows }}",
            "limit": 10,
            "tags": ["{{ flow.id }}", "static"],
        });
        let rendered = renderer.render_value(&raw, &context).unwrap();
        assert_eq!(rendered["query"], "select 42");
        assert_eq!(rendered["limit"], 10);
        assert_eq!(rendered["tags"][0], "render");
    }

    #[test]
    fn test_condition_truthiness() {
        let (flow, execution) = execution_with_outputs();
        let renderer = Renderer::new();
        let context = build_context(&flow, &execution, None);

        assert!(renderer
            .render_condition("{{ inputs.count > 1 }}", &context)
            .unwrap());
        assert!(!renderer
            .render_condition("{{ inputs.count > 5 }}", &context)
            .unwrap());
        assert!(!is_truthy(""));
        assert!(!is_truthy(" 0 "));
        assert!(is_truthy("yes"));
    }

    #[test]
    fn test_each_outputs_keyed_by_value() {
        let flow = test_flow();
        let execution = Execution::create(&flow, JsonMap::new(), vec![]);
        let mut outputs = JsonMap::new();
        outputs.insert("size".to_string(), json!(7));
        let run = TaskRun::create(execution.id, "split", None, Some("x".to_string()), None)
            .with_outputs(outputs);
        let execution = execution.with_appended_task_runs(vec![run]);

        let renderer = Renderer::new();
        let context = build_context(&flow, &execution, None);
        let rendered = renderer
            .render_str("{{ outputs.split.x.size }}", &context)
            .unwrap();
        assert_eq!(rendered, "7");
    }

    #[test]
    fn test_render_error_surfaces() {
        let (flow, execution) = execution_with_outputs();
        let renderer = Renderer::new();
        let context = build_context(&flow, &execution, None);
        assert!(renderer.render_str("{{ missing.path }}", &context).is_err());
    }

    #[test]
    fn test_task_run_context() {
        let (flow, execution) = execution_with_outputs();
        let run = &execution.task_run_list[0];
        let renderer = Renderer::new();
        let context = build_context(&flow, &execution, Some(run));

        let rendered = renderer
            .render_str("{{ task_run.task_id }}/{{ task_run.attempt }}", &context)
            .unwrap();
        assert_eq!(rendered, "extract/0");
    }
}
