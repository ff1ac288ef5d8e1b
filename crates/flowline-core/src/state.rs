//! `ExecutionState`: derived, never persisted (§3). Rebuilt by the state
//! reconstructor from the event log and mutated only by the control-flow
//! engine while it holds the per-execution logical critical section.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

use crate::event::pending_step_key;
use crate::id::Id;
use crate::playbook::LoopMode;

/// Compact a loop iteration result past `max_bytes` into a preview tuple
/// (§5 resource bounds), leaving small results untouched.
pub fn compact_loop_result(value: Value, max_bytes: usize, preview_keys: usize, preview_items: usize) -> Value {
    let original_size = serde_json::to_vec(&value).map(|b| b.len()).unwrap_or(0);
    if original_size <= max_bytes {
        return value;
    }
    let mut preview = serde_json::Map::new();
    preview.insert("truncated".to_string(), Value::Bool(true));
    preview.insert("original_size".to_string(), json!(original_size));
    match &value {
        Value::Object(map) => {
            let sample_keys: Vec<Value> = map.keys().take(preview_keys).cloned().map(Value::String).collect();
            preview.insert("sample_keys".to_string(), Value::Array(sample_keys));
        }
        Value::Array(items) => {
            let sample_items: Vec<Value> = items.iter().take(preview_items).cloned().collect();
            preview.insert("sample_items".to_string(), Value::Array(sample_items));
        }
        _ => {}
    }
    Value::Object(preview)
}

/// A step result exceeding the externalization threshold is replaced by
/// this handle; `output_select` fields stay inline for routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRef {
    #[serde(rename = "_ref")]
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepResult {
    Inline(Value),
    External(ExternalRef),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopState {
    pub collection: Vec<Value>,
    pub iterator: String,
    pub mode: Option<LoopMode>,
    pub index: u32,
    pub completed: u32,
    pub results: Vec<Value>,
    pub failed_count: u32,
    pub scheduled_count: u32,
    pub aggregation_finalized: bool,
    pub event_id: Option<Id>,
    /// Iteration indices already tail-repaired (§4.7.5 step 4), so a
    /// second stall detection pass never reissues the same slot twice.
    #[serde(default)]
    pub reissued_indices: HashSet<u32>,
}

impl LoopState {
    pub fn collection_size(&self) -> u32 {
        self.collection.len() as u32
    }

    pub fn is_done(&self) -> bool {
        self.completed >= self.collection_size()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaginationState {
    pub collected_data: Vec<Value>,
    pub iteration_count: u32,
    pub pending_retry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingNextAction {
    pub step: String,
    pub args: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: Option<Id>,
    pub variables: HashMap<String, Value>,
    pub current_step: Option<String>,
    pub last_event_id: Option<Id>,
    pub step_event_ids: HashMap<String, Id>,
    pub step_results: HashMap<String, StepResult>,
    pub completed_steps: HashSet<String>,
    pub issued_steps: HashSet<String>,
    pub loop_state: HashMap<String, LoopState>,
    pub pagination_state: HashMap<String, PaginationState>,
    pub pending_next_actions: Vec<PendingNextAction>,
    pub root_event_id: Option<Id>,
    pub parent_execution_id: Option<Id>,
    pub failed: bool,
    pub completed: bool,
    pub cancelled: bool,
}

impl ExecutionState {
    pub fn mark_issued(&mut self, step: &str) {
        self.issued_steps.insert(pending_step_key(step).to_string());
    }

    pub fn mark_step_completed(&mut self, step: &str) {
        let key = pending_step_key(step);
        self.issued_steps.remove(key);
        self.completed_steps.insert(key.to_string());
    }

    /// Discard a pending key without marking it completed (`command.completed`
    /// during replay just clears the in-flight marker; `step.exit` is what
    /// actually records completion).
    pub fn remove_issued(&mut self, step: &str) {
        self.issued_steps.remove(pending_step_key(step));
    }

    pub fn is_step_completed(&self, step: &str) -> bool {
        self.completed_steps.contains(pending_step_key(step))
    }

    pub fn has_pending(&self) -> bool {
        self.issued_steps
            .iter()
            .any(|s| !self.completed_steps.contains(s))
    }

    pub fn get_step_result(&self, step: &str) -> Option<&StepResult> {
        self.step_results.get(step)
    }

    /// Inlines `value` unless its serialized size exceeds `max_bytes`, in
    /// which case it is replaced by an `ExternalRef` pointing at `reference`
    /// (typically `{execution_id}/{step}`) and the caller is responsible for
    /// having already durably stored `value` under that reference.
    pub fn set_step_result_bounded(&mut self, step: &str, value: Value, max_bytes: usize, reference: impl FnOnce() -> String) {
        let oversized = serde_json::to_vec(&value)
            .map(|bytes| bytes.len() > max_bytes)
            .unwrap_or(false);
        let result = if oversized {
            StepResult::External(ExternalRef { reference: reference() })
        } else {
            StepResult::Inline(value)
        };
        self.step_results.insert(step.to_string(), result);
    }

    pub fn set_step_result(&mut self, step: &str, value: Value) {
        self.step_results
            .insert(step.to_string(), StepResult::Inline(value));
    }

    /// Start a brand new loop epoch for `step`, discarding any prior
    /// counters and results — used on re-entry after a prior loop fully
    /// finalized.
    pub fn init_loop(&mut self, step: &str, collection: Vec<Value>, iterator: String, mode: LoopMode, event_id: Id) {
        self.loop_state.insert(
            step.to_string(),
            LoopState {
                collection,
                iterator,
                mode: Some(mode),
                event_id: Some(event_id),
                ..Default::default()
            },
        );
        self.step_results.remove(step);
    }

    pub fn get_render_context(&self) -> Value {
        let mut ctx = serde_json::Map::new();
        for (k, v) in &self.variables {
            ctx.insert(k.clone(), v.clone());
        }
        for (step, result) in &self.step_results {
            if let StepResult::Inline(v) = result {
                ctx.insert(step.clone(), v.clone());
            }
        }
        Value::Object(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_issued_then_completed_normalizes_task_sequence_suffix() {
        let mut state = ExecutionState::default();
        state.mark_issued("fetch:task_sequence");
        assert!(state.issued_steps.contains("fetch"));
        state.mark_step_completed("fetch:task_sequence");
        assert!(!state.has_pending());
        assert!(state.is_step_completed("fetch"));
    }

    #[test]
    fn has_pending_true_until_completed() {
        let mut state = ExecutionState::default();
        state.mark_issued("a");
        assert!(state.has_pending());
        state.mark_step_completed("a");
        assert!(!state.has_pending());
    }
}
