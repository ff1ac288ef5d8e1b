//! The append-only event record (Event Log row shape, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::id::Id;

/// Closed set of event names the engine ever appends or consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    PlaybookInitialized,
    PlaybookCompleted,
    PlaybookFailed,
    WorkflowInitialized,
    WorkflowCompleted,
    WorkflowFailed,
    ExecutionCancelled,
    CommandIssued,
    CommandCompleted,
    CommandFailed,
    StepEnter,
    StepExit,
    CallDone,
    CallError,
    LoopItem,
    LoopDone,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        use EventName::*;
        match self {
            PlaybookInitialized => "playbook.initialized",
            PlaybookCompleted => "playbook.completed",
            PlaybookFailed => "playbook.failed",
            WorkflowInitialized => "workflow.initialized",
            WorkflowCompleted => "workflow.completed",
            WorkflowFailed => "workflow.failed",
            ExecutionCancelled => "execution.cancelled",
            CommandIssued => "command.issued",
            CommandCompleted => "command.completed",
            CommandFailed => "command.failed",
            StepEnter => "step.enter",
            StepExit => "step.exit",
            CallDone => "call.done",
            CallError => "call.error",
            LoopItem => "loop.item",
            LoopDone => "loop.done",
        }
    }

    pub fn workflow_terminal(status: CompletionStatus) -> Self {
        match status {
            CompletionStatus::Completed => EventName::WorkflowCompleted,
            CompletionStatus::Failed => EventName::WorkflowFailed,
            CompletionStatus::Cancelled => EventName::ExecutionCancelled,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        use EventName::*;
        Some(match s {
            "playbook.initialized" => PlaybookInitialized,
            "playbook.completed" => PlaybookCompleted,
            "playbook.failed" => PlaybookFailed,
            "workflow.initialized" => WorkflowInitialized,
            "workflow.completed" => WorkflowCompleted,
            "workflow.failed" => WorkflowFailed,
            "execution.cancelled" => ExecutionCancelled,
            "command.issued" => CommandIssued,
            "command.completed" => CommandCompleted,
            "command.failed" => CommandFailed,
            "step.enter" => StepEnter,
            "step.exit" => StepExit,
            "call.done" => CallDone,
            "call.error" => CallError,
            "loop.item" => LoopItem,
            "loop.done" => LoopDone,
            _ => return None,
        })
    }

    pub fn playbook_terminal(status: CompletionStatus) -> Self {
        match status {
            CompletionStatus::Completed => EventName::PlaybookCompleted,
            CompletionStatus::Failed => EventName::PlaybookFailed,
            CompletionStatus::Cancelled => EventName::PlaybookFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompletionStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Running => "RUNNING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
            EventStatus::Cancelled => "CANCELLED",
            EventStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "RUNNING" => EventStatus::Running,
            "COMPLETED" => EventStatus::Completed,
            "FAILED" => EventStatus::Failed,
            "CANCELLED" => EventStatus::Cancelled,
            "SKIPPED" => EventStatus::Skipped,
            _ => return None,
        })
    }
}

/// `meta` payload carried on every event, per §3.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMeta {
    pub execution_id: Option<Id>,
    pub catalog_id: Option<Id>,
    pub root_event_id: Option<Id>,
    #[serde(default)]
    pub event_chain: Vec<Id>,
    pub step: Option<String>,
    pub previous_step_event_id: Option<Id>,
    pub parent_execution_id: Option<Id>,
    /// Loop bookkeeping; present only on loop-iteration-related events.
    pub loop_step: Option<String>,
    pub loop_event_id: Option<Id>,
    pub loop_iteration_index: Option<u32>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub execution_id: Id,
    pub event_id: Id,
    pub parent_event_id: Option<Id>,
    pub parent_execution_id: Option<Id>,
    pub catalog_id: Option<Id>,
    pub name: EventName,
    /// `node_name` in the row layout: the step (possibly `parent:task_sequence`).
    pub step: Option<String>,
    pub status: EventStatus,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub meta: EventMeta,
    pub created_at: DateTime<Utc>,
}

/// A new event not yet assigned an `event_id`, as produced by the engine
/// before it is handed to the Event Log for durable append.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub execution_id: Id,
    pub parent_event_id: Option<Id>,
    pub parent_execution_id: Option<Id>,
    pub catalog_id: Option<Id>,
    pub name: EventName,
    pub step: Option<String>,
    pub status: EventStatus,
    pub context: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub stack_trace: Option<String>,
    pub worker_id: Option<String>,
    pub duration_ms: Option<i64>,
    pub meta: EventMeta,
}

/// Strip a `:task_sequence` suffix from a step key so pending tracking
/// is keyed on the parent step, never the synthetic per-iteration name.
///
/// Task-sequence commands are emitted as `<parent_step>:task_sequence`
/// but step completion is tracked on the parent step name; leaving the
/// suffix in `issued_steps` would block terminal completion forever.
pub fn pending_step_key(step_name: &str) -> &str {
    match step_name.rsplit_once(':') {
        Some((parent, "task_sequence")) => parent,
        _ => step_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_task_sequence_suffix() {
        assert_eq!(pending_step_key("fetch:task_sequence"), "fetch");
    }

    #[test]
    fn leaves_plain_step_names_alone() {
        assert_eq!(pending_step_key("fetch"), "fetch");
    }

    #[test]
    fn does_not_strip_unrelated_colons() {
        assert_eq!(pending_step_key("ns:fetch"), "ns:fetch");
    }
}
