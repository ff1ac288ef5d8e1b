//! The declarative, validated playbook document a workflow executes.
//!
//! Playbooks arrive already parsed from YAML by an external collaborator;
//! this crate only defines the validated in-memory shape and the
//! resolution rules that depend on it (entry step, routing targets).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::id::Id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookMetadata {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutorSpec {
    pub entry_step: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub metadata: PlaybookMetadata,
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(default)]
    pub workload: HashMap<String, Value>,
    pub workflow: Vec<Step>,
    #[serde(default)]
    pub keychain: Option<Value>,
    #[serde(default)]
    pub executor: Option<ExecutorSpec>,
    pub final_step: Option<String>,
    /// Catalog identity, if this playbook was loaded from a catalog store
    /// rather than a bare path. Authoritative for reconstruction (§4.5).
    #[serde(default)]
    pub catalog_id: Option<Id>,
}

impl Playbook {
    /// Resolve the entry step per §3: `executor.spec.entry_step` wins,
    /// else the first workflow step, with a legacy fallback to a step
    /// literally named `start`.
    pub fn entry_step(&self) -> Option<&str> {
        if let Some(name) = self
            .executor
            .as_ref()
            .and_then(|e| e.entry_step.as_deref())
        {
            if self.step(name).is_some() {
                return Some(name);
            }
        }
        if let Some(first) = self.workflow.first() {
            return Some(&first.step);
        }
        self.workflow
            .iter()
            .find(|s| s.step == "start")
            .map(|s| s.step.as_str())
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| s.step == name)
    }

    /// Validate step-name uniqueness and that every `next` arc target
    /// resolves to a real step. Returns the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for s in &self.workflow {
            if !seen.insert(s.step.as_str()) {
                return Err(format!("duplicate step name: {}", s.step));
            }
        }
        for s in &self.workflow {
            if let Some(next) = &s.next {
                for arc in &next.arcs {
                    if self.step(&arc.step).is_none() {
                        return Err(format!(
                            "step '{}' routes to undefined step '{}'",
                            s.step, arc.step
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopSpec {
    #[serde(default)]
    pub max_in_flight: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loop {
    /// Template expression that renders to the collection being iterated.
    #[serde(rename = "in")]
    pub source: String,
    pub iterator: String,
    pub mode: LoopMode,
    #[serde(default)]
    pub spec: LoopSpec,
}

impl Loop {
    /// 1 for sequential, the configured bound (>=1) for parallel.
    pub fn max_in_flight(&self) -> u32 {
        match self.mode {
            LoopMode::Sequential => 1,
            LoopMode::Parallel => self.spec.max_in_flight.unwrap_or(1).max(1),
        }
    }
}

/// One labelled entry in a task sequence (`tool:` given as a list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub tool: ToolSpec,
    #[serde(default)]
    pub eval: Vec<EvalClause>,
}

/// Ordered `eval` clause attached to a task; see the worker crate for the
/// execution semantics of each `do` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalClause {
    /// `None` marks the trailing `else` clause.
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(rename = "do")]
    pub action: EvalAction,
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<RetryBackoff>,
    #[serde(default)]
    pub delay: Option<f64>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub set_vars: HashMap<String, Value>,
    #[serde(default)]
    pub set_iter: HashMap<String, Value>,
    /// Present on a `collect` clause: where to read the page of data from
    /// and how to fold it into `pagination_state[step].collected_data`.
    #[serde(default)]
    pub collect: Option<CollectSpec>,
    /// HTTP-parameter overrides (`params`/`headers`/`body`/`data`/`url`)
    /// the engine merges into the reissued command's args for the next
    /// page when a `collect` clause keeps `pagination_state` open.
    #[serde(default)]
    pub retry_overrides: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CollectStrategy {
    Append,
    #[default]
    Extend,
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectSpec {
    pub path: String,
    #[serde(default)]
    pub mode: CollectStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalAction {
    Continue,
    Retry,
    Jump,
    Break,
    Fail,
    /// Accumulates a page of paginated results and, when paired with
    /// `retry_overrides`, asks the engine to reissue the task for the
    /// next page (§4.7.4).
    Collect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    #[default]
    None,
    Linear,
    Exponential,
}

impl RetryBackoff {
    pub fn delay_for_attempt(self, base_delay: f64, attempt: u32) -> f64 {
        match self {
            RetryBackoff::None => 0.0,
            RetryBackoff::Linear => base_delay * attempt as f64,
            RetryBackoff::Exponential => base_delay * 2f64.powi(attempt as i32 - 1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySpec {
    #[serde(default)]
    pub rules: Vec<Value>,
}

/// A pluggable unit of work. `task_sequence` is synthesized by the engine
/// (never present in a parsed playbook) when a step's `tool:` is given as
/// a list, or when a single tool carries `spec.policy.rules`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolSpec {
    Http {
        config: Value,
    },
    Postgres {
        config: Value,
    },
    Duckdb {
        config: Value,
    },
    Python {
        config: Value,
    },
    /// Reference into a playbook-local task catalog.
    Workbook {
        name: String,
    },
    /// Sub-execution of another playbook.
    Playbook {
        path: Option<String>,
        catalog_id: Option<Id>,
    },
    TaskSequence {
        tasks: Vec<Task>,
    },
}

impl ToolSpec {
    /// `spec.policy.rules` on a single tool forces conversion to a
    /// one-element task sequence so retry semantics are uniform.
    pub fn policy_rules(&self) -> Option<&[Value]> {
        let config = match self {
            ToolSpec::Http { config }
            | ToolSpec::Postgres { config }
            | ToolSpec::Duckdb { config }
            | ToolSpec::Python { config } => config,
            _ => return None,
        };
        config
            .get("policy")
            .and_then(|p| p.get("rules"))
            .and_then(|r| r.as_array())
            .map(|v| v.as_slice())
    }

    /// `config.retry.{max_attempts,delay,backoff}` on a single tool,
    /// falling back to the engine-wide defaults when absent or when the
    /// tool kind carries no config (catalog/sub-playbook/task-sequence).
    pub fn retry_policy(&self) -> RetryPolicy {
        let config = match self {
            ToolSpec::Http { config }
            | ToolSpec::Postgres { config }
            | ToolSpec::Duckdb { config }
            | ToolSpec::Python { config } => config,
            _ => return RetryPolicy::default(),
        };
        let Some(retry) = config.get("retry") else {
            return RetryPolicy::default();
        };
        RetryPolicy {
            max_attempts: retry
                .get("max_attempts")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(3),
            delay: retry.get("delay").and_then(Value::as_f64).unwrap_or(0.0),
            backoff: retry
                .get("backoff")
                .and_then(Value::as_str)
                .and_then(|s| match s {
                    "none" => Some(RetryBackoff::None),
                    "linear" => Some(RetryBackoff::Linear),
                    "exponential" => Some(RetryBackoff::Exponential),
                    _ => None,
                })
                .unwrap_or_default(),
        }
    }
}

/// Resolved `attempt/max_attempts/retry_delay/retry_backoff` for a command,
/// derived from a tool's `config.retry` block (§4.7.4).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: f64,
    pub backoff: RetryBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: 0.0,
            backoff: RetryBackoff::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NextMode {
    #[default]
    Exclusive,
    Inclusive,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NextSpec {
    #[serde(default)]
    pub mode: NextMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arc {
    pub step: String,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub args: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Next {
    #[serde(default)]
    pub spec: NextSpec,
    pub arcs: Vec<Arc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step: String,
    #[serde(default)]
    #[serde(rename = "loop")]
    pub loop_: Option<Loop>,
    pub tool: Option<ToolSpec>,
    #[serde(default)]
    pub args: HashMap<String, Value>,
    #[serde(default)]
    pub set_ctx: HashMap<String, Value>,
    #[serde(default)]
    pub next: Option<Next>,
    #[serde(default)]
    pub output_select: Vec<String>,
}

impl Step {
    /// True once `tool` resolves to a task sequence, whether it was
    /// authored as a list directly or synthesized from `policy.rules`.
    pub fn is_task_sequence(&self) -> bool {
        matches!(self.tool, Some(ToolSpec::TaskSequence { .. }))
    }
}
