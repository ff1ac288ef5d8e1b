//! The worker-visible unit of work (Command Store row shape, §3/§4.2).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::id::Id;
use crate::playbook::{NextMode, RetryBackoff, ToolSpec};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopCommandMeta {
    pub loop_step: String,
    pub loop_event_id: Id,
    pub loop_iteration_index: u32,
    /// Marks a reissue of an already-attempted index rather than a fresh
    /// claim, so the worker can distinguish a retry from first execution.
    #[serde(default)]
    pub loop_retry: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSequenceCommandMeta {
    pub parent_step: String,
    pub task_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandMetadata {
    #[serde(default)]
    pub command_id: Option<Id>,
    #[serde(default)]
    pub loop_: Option<LoopCommandMeta>,
    #[serde(default)]
    pub task_sequence: Option<TaskSequenceCommandMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    pub next_mode: NextMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub execution_id: Id,
    /// Possibly `parent:task_sequence` for a synthesized pipeline command.
    pub step: String,
    pub tool: ToolSpec,
    #[serde(default)]
    pub args: HashMap<String, Value>,
    pub render_context_snapshot: Value,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub retry_delay: f64,
    #[serde(default)]
    pub retry_backoff: RetryBackoff,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub next_targets: Vec<String>,
    #[serde(default)]
    pub spec: CommandSpec,
    #[serde(default)]
    pub metadata: CommandMetadata,
}

fn default_max_attempts() -> u32 {
    3
}

impl Command {
    /// The step key used for `issued_steps`/`completed_steps` bookkeeping:
    /// always the parent, never a `:task_sequence` suffix.
    pub fn pending_key(&self) -> &str {
        crate::event::pending_step_key(&self.step)
    }

    pub fn delay_for_next_attempt(&self) -> f64 {
        self.retry_backoff
            .delay_for_attempt(self.retry_delay, self.attempt)
    }
}

/// A fully durable, claimable command row (Command Store, §4.2). Identical
/// to `Command` plus the identity and claim-lease fields the store adds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub command_id: Id,
    #[serde(flatten)]
    pub command: Command,
    pub claimed_by: Option<String>,
}
