//! Task-Sequence Executor (H, §4.8): runs a labelled list of tool tasks
//! atomically on one worker with local eval-driven control flow.

use std::collections::HashMap;
use std::time::Instant;

use flowline_core::error::TaskError;
use flowline_core::playbook::{CollectStrategy, EvalAction, EvalClause, Task, ToolSpec};
use flowline_render::TemplateRenderer;
use serde::Serialize;
use serde_json::{json, Value};

use crate::outcome::Outcome;
use crate::tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Success,
    Break,
    Failed,
}

impl SequenceStatus {
    fn as_str(self) -> &'static str {
        match self {
            SequenceStatus::Success => "success",
            SequenceStatus::Break => "break",
            SequenceStatus::Failed => "failed",
        }
    }
}

/// A `collect` clause's page of data plus whether the coordinator should
/// reissue the sequence for the next page (§4.7.4).
#[derive(Debug, Clone, Serialize)]
pub struct PaginationReport {
    pub page: Value,
    pub mode: CollectStrategy,
    pub has_next: bool,
    #[serde(default)]
    pub retry_overrides: HashMap<String, Value>,
}

pub struct SequenceResult {
    pub status: SequenceStatus,
    pub prev: Value,
    pub results: HashMap<String, Value>,
    pub step_vars: HashMap<String, Value>,
    pub remaining_actions: Vec<String>,
    pub error: Option<TaskError>,
    pub failed_task: Option<String>,
    pub pagination: Option<PaginationReport>,
}

impl SequenceResult {
    pub fn to_call_done_body(&self) -> Value {
        let mut body = json!({
            "status": self.status.as_str(),
            "_prev": self.prev,
            "results": self.results,
            "step_vars": self.step_vars,
        });
        let map = body.as_object_mut().expect("object literal");
        if !self.remaining_actions.is_empty() {
            map.insert("remaining_actions".into(), json!(self.remaining_actions));
        }
        if let Some(error) = &self.error {
            map.insert("error".into(), serde_json::to_value(error).unwrap_or(Value::Null));
        }
        if let Some(failed_task) = &self.failed_task {
            map.insert("failed_task".into(), json!(failed_task));
        }
        if let Some(pagination) = &self.pagination {
            map.insert("pagination".into(), serde_json::to_value(pagination).unwrap_or(Value::Null));
        }
        body
    }
}

/// Dot-notation lookup into a JSON value (`"data.items"` -> `value["data"]["items"]`),
/// used by a `collect` clause's `path` to find the page of data in the tool's result.
fn extract_path(value: &Value, path: &str) -> Value {
    path.split('.')
        .fold(value.clone(), |acc, segment| acc.get(segment).cloned().unwrap_or(Value::Null))
}

fn default_delay(backoff: Option<flowline_core::playbook::RetryBackoff>, delay: Option<f64>, attempt: u32) -> f64 {
    backoff.unwrap_or_default().delay_for_attempt(delay.unwrap_or(0.0), attempt)
}

fn render_tool(renderer: &TemplateRenderer, tool: &ToolSpec, context: &Value) -> Result<ToolSpec, TaskError> {
    let render = |config: &Value| -> Result<Value, TaskError> {
        renderer
            .render_value(config, context)
            .map_err(|e| TaskError::new(flowline_core::error::ErrorKind::Transform, "TEMPLATE_ERROR", e.to_string(), "renderer"))
    };
    Ok(match tool {
        ToolSpec::Http { config } => ToolSpec::Http { config: render(config)? },
        ToolSpec::Postgres { config } => ToolSpec::Postgres { config: render(config)? },
        ToolSpec::Duckdb { config } => ToolSpec::Duckdb { config: render(config)? },
        ToolSpec::Python { config } => ToolSpec::Python { config: render(config)? },
        other => other.clone(),
    })
}

/// Same truthiness rule routing uses for `when` clauses (§4.7.2): a
/// rendered bool passes through, a string is boolean-coerced, null is
/// false, anything else is true.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => flowline_render::coerce_bool(s),
        Value::Null => false,
        _ => true,
    }
}

/// Find an eval clause whose (possibly absent, for the trailing `else`)
/// `expr` matches the current outcome, given no eval = default policy.
fn select_clause<'a>(renderer: &TemplateRenderer, eval: &'a [EvalClause], context: &Value) -> Option<&'a EvalClause> {
    for clause in eval {
        match &clause.expr {
            None => return Some(clause), // trailing else
            Some(expr) => {
                let Ok(rendered) = renderer.render_str(expr, context) else { continue };
                if truthy(&rendered) {
                    return Some(clause);
                }
            }
        }
    }
    None
}

/// Runs `tasks` in order starting at index 0, applying each task's `eval`
/// clauses (or the continue/fail default) to decide the next step.
pub async fn run(renderer: &TemplateRenderer, tasks: &[Task], base_context: Value, initial_vars: HashMap<String, Value>, iter: HashMap<String, Value>) -> SequenceResult {
    let mut vars = initial_vars;
    let mut iter = iter;
    let mut results: HashMap<String, Value> = HashMap::new();
    let mut prev = Value::Null;
    let mut index = 0usize;
    let mut pagination: Option<PaginationReport> = None;

    while index < tasks.len() {
        let task = &tasks[index];
        let mut attempt = 1u32;

        loop {
            let context = build_context(&base_context, task, &prev, attempt, &vars, &iter, &results, None);
            let tool = match render_tool(renderer, &task.tool, &context) {
                Ok(t) => t,
                Err(error) => {
                    return SequenceResult {
                        status: SequenceStatus::Failed,
                        prev,
                        results,
                        step_vars: vars,
                        remaining_actions: remaining(tasks, index),
                        error: Some(error),
                        failed_task: Some(task.name.clone()),
                        pagination: None,
                    };
                }
            };

            let started = Instant::now();
            let call_result = tool::dispatch(&tool, &context).await;
            let duration_ms = started.elapsed().as_millis() as i64;

            let outcome = match &call_result {
                Ok(value) => Outcome::success(value.clone(), attempt, duration_ms),
                Err(error) => Outcome::failure(error.clone(), attempt, duration_ms),
            };
            let outcome_value = outcome.to_render_value();
            let eval_context = build_context(&base_context, task, &prev, attempt, &vars, &iter, &results, Some(&outcome_value));

            let default_action = if call_result.is_ok() { EvalAction::Continue } else { EvalAction::Fail };
            let clause = select_clause(renderer, &task.eval, &eval_context);

            let action = clause.map(|c| c.action).unwrap_or(default_action);

            if let Some(clause) = clause {
                for (k, v) in &clause.set_vars {
                    vars.insert(k.clone(), render_value_or_keep(renderer, v, &eval_context));
                }
                for (k, v) in &clause.set_iter {
                    iter.insert(k.clone(), render_value_or_keep(renderer, v, &eval_context));
                }
            }

            match action {
                EvalAction::Continue => {
                    if let Ok(value) = &call_result {
                        prev = value.clone();
                        results.insert(task.name.clone(), value.clone());
                    }
                    break; // advance to next task
                }
                EvalAction::Retry => {
                    let max_attempts = clause.and_then(|c| c.attempts).unwrap_or(1);
                    if attempt >= max_attempts {
                        let error = call_result.err().unwrap_or_else(|| TaskError::new(
                            flowline_core::error::ErrorKind::Unknown,
                            "RETRY_EXHAUSTED",
                            "retry budget exhausted with no recorded error",
                            "sequence",
                        ));
                        return SequenceResult {
                            status: SequenceStatus::Failed,
                            prev,
                            results,
                            step_vars: vars,
                            remaining_actions: remaining(tasks, index),
                            error: Some(error),
                            failed_task: Some(task.name.clone()),
                            pagination: None,
                        };
                    }
                    let delay = default_delay(clause.and_then(|c| c.backoff), clause.and_then(|c| c.delay), attempt);
                    if delay > 0.0 {
                        tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                    }
                    attempt += 1;
                    continue;
                }
                EvalAction::Jump => {
                    if let Ok(value) = &call_result {
                        prev = value.clone();
                        results.insert(task.name.clone(), value.clone());
                    }
                    let target = clause.and_then(|c| c.to.as_deref());
                    let Some(target_index) = target.and_then(|t| tasks.iter().position(|t2| t2.name == t)) else {
                        return SequenceResult {
                            status: SequenceStatus::Failed,
                            prev,
                            results,
                            step_vars: vars,
                            remaining_actions: remaining(tasks, index),
                            error: Some(TaskError::new(flowline_core::error::ErrorKind::Unknown, "JUMP_TARGET_MISSING", "jump 'to' does not name a task in this sequence", "sequence")),
                            failed_task: Some(task.name.clone()),
                            pagination: None,
                        };
                    };
                    index = target_index;
                    attempt = 1;
                    continue;
                }
                EvalAction::Break => {
                    if let Ok(value) = &call_result {
                        prev = value.clone();
                        results.insert(task.name.clone(), value.clone());
                    }
                    return SequenceResult {
                        status: SequenceStatus::Break,
                        prev,
                        results,
                        step_vars: vars,
                        remaining_actions: remaining(tasks, index + 1),
                        error: None,
                        failed_task: None,
                        pagination: None,
                    };
                }
                EvalAction::Collect => {
                    if let Ok(value) = &call_result {
                        prev = value.clone();
                        results.insert(task.name.clone(), value.clone());
                    }
                    let spec = clause.and_then(|c| c.collect.as_ref());
                    let page = match (spec, &call_result) {
                        (Some(spec), Ok(value)) => extract_path(value, &spec.path),
                        (None, Ok(value)) => value.clone(),
                        (_, Err(_)) => Value::Null,
                    };
                    let mode = spec.map(|s| s.mode).unwrap_or_default();
                    let retry_overrides = clause.map(|c| c.retry_overrides.clone()).unwrap_or_default();
                    let has_next = !retry_overrides.is_empty();
                    pagination = Some(PaginationReport { page, mode, has_next, retry_overrides });
                    break; // treat like continue: advance to next task
                }
                EvalAction::Fail => {
                    let error = call_result.err().unwrap_or_else(|| TaskError::new(
                        flowline_core::error::ErrorKind::Unknown,
                        "TASK_FAIL_NO_ERROR",
                        "fail action reached without a recorded error",
                        "sequence",
                    ));
                    return SequenceResult {
                        status: SequenceStatus::Failed,
                        prev,
                        results,
                        step_vars: vars,
                        remaining_actions: remaining(tasks, index),
                        error: Some(error),
                        failed_task: Some(task.name.clone()),
                        pagination: None,
                    };
                }
            }
        }

        index += 1;
    }

    SequenceResult {
        status: SequenceStatus::Success,
        prev,
        results,
        step_vars: vars,
        remaining_actions: Vec::new(),
        error: None,
        failed_task: None,
        pagination,
    }
}

fn remaining(tasks: &[Task], from: usize) -> Vec<String> {
    tasks.iter().skip(from + 1).map(|t| t.name.clone()).collect()
}

fn render_value_or_keep(renderer: &TemplateRenderer, value: &Value, context: &Value) -> Value {
    renderer.render_value(value, context).unwrap_or_else(|_| value.clone())
}

#[allow(clippy::too_many_arguments)]
fn build_context(
    base: &Value,
    task: &Task,
    prev: &Value,
    attempt: u32,
    vars: &HashMap<String, Value>,
    iter: &HashMap<String, Value>,
    results: &HashMap<String, Value>,
    outcome: Option<&Value>,
) -> Value {
    let mut map = match base {
        Value::Object(m) => m.clone(),
        _ => serde_json::Map::new(),
    };
    map.insert("_task".into(), json!(task.name));
    map.insert("_prev".into(), prev.clone());
    map.insert("_attempt".into(), json!(attempt));
    map.insert("results".into(), json!(results));
    map.insert("vars".into(), json!(vars));
    map.insert("iter".into(), json!(iter));
    if let Some(outcome) = outcome {
        map.insert("outcome".into(), outcome.clone());
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::playbook::{EvalAction, EvalClause, RetryBackoff, Task, ToolSpec};

    fn renderer() -> TemplateRenderer {
        TemplateRenderer::new(50)
    }

    fn missing_url_http_task(name: &str, eval: Vec<EvalClause>) -> Task {
        Task {
            name: name.to_string(),
            tool: ToolSpec::Http { config: json!({}) },
            eval,
        }
    }

    #[tokio::test]
    async fn default_policy_fails_sequence_on_first_error() {
        let tasks = vec![missing_url_http_task("fetch", Vec::new())];
        let result = run(&renderer(), &tasks, json!({}), HashMap::new(), HashMap::new()).await;
        assert_eq!(result.status, SequenceStatus::Failed);
        assert_eq!(result.failed_task.as_deref(), Some("fetch"));
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn continue_clause_swallows_error_and_completes() {
        let eval = vec![EvalClause {
            expr: Some("{{ outcome.status == \"error\" }}".to_string()),
            action: EvalAction::Continue,
            attempts: None,
            backoff: None,
            delay: None,
            to: None,
            set_vars: HashMap::new(),
            set_iter: HashMap::new(),
            collect: None,
            retry_overrides: HashMap::new(),
        }];
        let tasks = vec![missing_url_http_task("fetch", eval)];
        let result = run(&renderer(), &tasks, json!({}), HashMap::new(), HashMap::new()).await;
        assert_eq!(result.status, SequenceStatus::Success);
        assert!(!result.results.contains_key("fetch")); // error was swallowed, no stored result
    }

    #[tokio::test]
    async fn retry_clause_exhausts_attempts_then_fails() {
        let eval = vec![EvalClause {
            expr: Some("{{ outcome.status == \"error\" }}".to_string()),
            action: EvalAction::Retry,
            attempts: Some(2),
            backoff: Some(RetryBackoff::None),
            delay: Some(0.0),
            to: None,
            set_vars: HashMap::new(),
            set_iter: HashMap::new(),
            collect: None,
            retry_overrides: HashMap::new(),
        }];
        let tasks = vec![missing_url_http_task("fetch", eval)];
        let result = run(&renderer(), &tasks, json!({}), HashMap::new(), HashMap::new()).await;
        assert_eq!(result.status, SequenceStatus::Failed);
    }

    #[tokio::test]
    async fn collect_clause_reports_pagination_and_continues() {
        let eval = vec![EvalClause {
            expr: Some("{{ outcome.status == \"error\" }}".to_string()),
            action: EvalAction::Collect,
            attempts: None,
            backoff: None,
            delay: None,
            to: None,
            set_vars: HashMap::new(),
            set_iter: HashMap::new(),
            collect: Some(flowline_core::playbook::CollectSpec {
                path: "data.items".to_string(),
                mode: CollectStrategy::Extend,
            }),
            retry_overrides: HashMap::from([("page".to_string(), json!(2))]),
        }];
        let tasks = vec![missing_url_http_task("fetch", eval)];
        let result = run(&renderer(), &tasks, json!({}), HashMap::new(), HashMap::new()).await;
        assert_eq!(result.status, SequenceStatus::Success);
        let pagination = result.pagination.expect("collect clause reports a pagination page");
        assert!(pagination.has_next);
        assert_eq!(pagination.retry_overrides.get("page"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn set_iter_updates_iter_context_for_next_task() {
        let eval = vec![EvalClause {
            expr: Some("{{ outcome.status == \"error\" }}".to_string()),
            action: EvalAction::Continue,
            attempts: None,
            backoff: None,
            delay: None,
            to: None,
            set_vars: HashMap::new(),
            set_iter: HashMap::from([("cursor".to_string(), json!("next-page"))]),
            collect: None,
            retry_overrides: HashMap::new(),
        }];
        let tasks = vec![missing_url_http_task("fetch", eval)];
        let result = run(&renderer(), &tasks, json!({}), HashMap::new(), HashMap::from([("cursor".to_string(), json!("first-page"))])).await;
        assert_eq!(result.status, SequenceStatus::Success);
    }
}
