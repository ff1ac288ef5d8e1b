//! State Reconstructor (E): rebuild `ExecutionState` by replaying the
//! event log in ascending `event_id` order (§4.5).

use flowline_core::event::{pending_step_key, Event, EventName};
use flowline_core::id::Id;
use flowline_core::playbook::Playbook;
use flowline_core::state::ExecutionState;
use flowline_store::{EventFilter, EventLog};

use crate::error::EngineResult;

const REPLAY_PAGE_SIZE: i64 = 500;

/// Look up the first `playbook.initialized` event and extract the
/// `catalog_id`/workload snapshot needed to resolve the playbook, without
/// replaying the whole log — used by callers that need the playbook
/// before they can reconstruct state (mirrors §4.5 step 1-2).
pub async fn load_initialization(
    events: &dyn EventLog,
    execution_id: Id,
) -> EngineResult<Option<Event>> {
    Ok(events.first_playbook_initialized(execution_id).await?)
}

/// Replay the full event log for `execution_id` into a fresh
/// `ExecutionState`. Returns `None` if no `playbook.initialized` exists.
pub async fn load_state(
    events: &dyn EventLog,
    execution_id: Id,
    playbook: &Playbook,
) -> EngineResult<Option<ExecutionState>> {
    let Some(init) = load_initialization(events, execution_id).await? else {
        return Ok(None);
    };

    let mut state = ExecutionState {
        execution_id: Some(execution_id),
        ..Default::default()
    };
    if let Some(workload) = init.result.as_ref().and_then(|v| v.as_object()) {
        for (k, v) in workload {
            state.variables.insert(k.clone(), v.clone());
        }
    }
    state.root_event_id = Some(init.event_id);
    state.parent_execution_id = init.parent_execution_id;

    let mut page = 1;
    loop {
        let batch = events
            .read(execution_id, EventFilter::default(), page, REPLAY_PAGE_SIZE)
            .await?;
        let fetched = batch.len();
        for event in &batch {
            apply_event(&mut state, event, playbook);
        }
        if (fetched as i64) < REPLAY_PAGE_SIZE {
            break;
        }
        page += 1;
    }

    Ok(Some(state))
}

fn apply_event(state: &mut ExecutionState, event: &Event, playbook: &Playbook) {
    state.last_event_id = Some(event.event_id);
    if let Some(step) = &event.step {
        state.step_event_ids.insert(step.clone(), event.event_id);
    }

    match event.name {
        EventName::PlaybookInitialized | EventName::WorkflowInitialized => {}
        EventName::CommandIssued => {
            if let Some(step) = &event.step {
                state.mark_issued(step);
                if let Some(loop_event_id) = event.meta.loop_event_id {
                    let parent = pending_step_key(step).to_string();
                    state.loop_state.entry(parent).or_default().event_id = Some(loop_event_id);
                }
            }
        }
        EventName::CommandCompleted | EventName::CommandFailed => {
            if let Some(step) = &event.step {
                state.remove_issued(step);
            }
        }
        EventName::CallDone => {
            if let Some(step) = &event.step {
                if let Some(result) = &event.result {
                    state.set_step_result(pending_step_key(step), result.clone());
                }
            }
        }
        EventName::CallError => {
            if let Some(step) = &event.step {
                state.mark_step_completed(step);
            }
            state.failed = true;
        }
        EventName::StepExit => {
            let Some(step) = &event.step else { return };
            if step.ends_with(":task_sequence") {
                return; // iteration-informative only (§4.7.1 step 4)
            }
            let is_looped = playbook
                .step(step)
                .map(|s| s.loop_.is_some())
                .unwrap_or(false);
            if is_looped {
                let loop_state = state.loop_state.entry(step.clone()).or_default();
                if let Some(result) = &event.result {
                    loop_state.results.push(result.clone());
                }
                loop_state.completed += 1;
            } else {
                if let Some(result) = &event.result {
                    state.set_step_result(step, result.clone());
                }
                state.mark_step_completed(step);
            }
        }
        EventName::LoopDone => {
            if let Some(step) = &event.step {
                state.mark_step_completed(step);
                if let Some(loop_state) = state.loop_state.get_mut(step) {
                    loop_state.aggregation_finalized = true;
                }
                if let Some(result) = &event.result {
                    state.set_step_result(step, result.clone());
                }
            }
        }
        EventName::ExecutionCancelled => {
            state.cancelled = true;
            state.completed = true;
        }
        EventName::WorkflowCompleted | EventName::WorkflowFailed => {
            state.failed = matches!(event.name, EventName::WorkflowFailed);
        }
        EventName::PlaybookCompleted | EventName::PlaybookFailed => {
            state.completed = true;
        }
        EventName::LoopItem => {}
        EventName::StepEnter => {} // claim-time marker only, never drives state
    }
}
