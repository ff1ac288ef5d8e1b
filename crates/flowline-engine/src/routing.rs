//! Conditional routing (§4.7.2) and loop-slot claiming (§4.7.3), kept
//! free of storage/bus I/O so they can be exercised without mocks beyond
//! a `TemplateRenderer`.

use std::collections::HashMap;

use flowline_bus::{LoopKey, LoopKv};
use flowline_core::event::pending_step_key;
use flowline_core::playbook::{Next, NextMode};
use flowline_core::state::ExecutionState;
use flowline_render::TemplateRenderer;
use serde_json::Value;

use crate::error::EngineResult;

pub struct RouteTarget {
    pub step: String,
    pub args: HashMap<String, Value>,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => flowline_render::coerce_bool(s),
        Value::Null => false,
        _ => true,
    }
}

/// Evaluate one step's `next` block against the current render context.
/// Clears `completed_steps` for a matched target before the dedup check
/// so loopbacks onto an already-completed step are legal (§4.7.2 step 2).
pub fn evaluate_next(
    renderer: &TemplateRenderer,
    next: &Next,
    context: &Value,
    state: &mut ExecutionState,
    loop_done_results: Option<&Value>,
) -> EngineResult<Vec<RouteTarget>> {
    let mut targets = Vec::new();
    for arc in &next.arcs {
        let matched = match &arc.when {
            Some(expr) => truthy(&renderer.render_str(expr, context)?),
            None => true,
        };
        if !matched {
            continue;
        }

        state.completed_steps.remove(pending_step_key(&arc.step));
        if state.issued_steps.contains(pending_step_key(&arc.step)) {
            continue;
        }

        let rendered_args = renderer.render_value(
            &Value::Object(arc.args.clone().into_iter().collect()),
            context,
        )?;
        let mut args: HashMap<String, Value> = rendered_args
            .as_object()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect();

        if let Some(loop_results) = loop_done_results {
            args.entry("loop_results".to_string())
                .or_insert_with(|| loop_results.clone());
        }

        targets.push(RouteTarget {
            step: arc.step.clone(),
            args,
        });

        if next.spec.mode == NextMode::Exclusive {
            break;
        }
    }
    Ok(targets)
}

/// Claim as many loop slots as `D` currently allows, up to
/// `max_in_flight`, returning the claimed iteration indices in order.
pub async fn claim_loop_slots(
    loop_kv: &dyn LoopKv,
    key: &LoopKey,
    collection_size: u32,
    max_in_flight: u32,
) -> EngineResult<Vec<u32>> {
    let mut claimed = Vec::new();
    for _ in 0..max_in_flight {
        match loop_kv
            .claim_next_loop_index(key, collection_size, max_in_flight)
            .await?
        {
            Some(index) => claimed.push(index),
            None => break,
        }
    }
    Ok(claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::playbook::{Arc as RouteArc, NextSpec};
    use serde_json::json;

    fn renderer() -> TemplateRenderer {
        TemplateRenderer::new(50)
    }

    #[test]
    fn exclusive_mode_stops_at_first_match() {
        let r = renderer();
        let next = Next {
            spec: NextSpec {
                mode: NextMode::Exclusive,
            },
            arcs: vec![
                RouteArc {
                    step: "t".into(),
                    when: Some("{{ flag }}".into()),
                    args: Default::default(),
                },
                RouteArc {
                    step: "f".into(),
                    when: Some("{{ not_flag }}".into()),
                    args: Default::default(),
                },
                RouteArc {
                    step: "d".into(),
                    when: None,
                    args: Default::default(),
                },
            ],
        };
        let ctx = json!({"flag": true, "not_flag": false});
        let mut state = ExecutionState::default();
        let targets = evaluate_next(&r, &next, &ctx, &mut state, None).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].step, "t");
    }

    #[test]
    fn inclusive_mode_fires_every_matching_arc() {
        let r = renderer();
        let next = Next {
            spec: NextSpec {
                mode: NextMode::Inclusive,
            },
            arcs: vec![
                RouteArc {
                    step: "a".into(),
                    when: None,
                    args: Default::default(),
                },
                RouteArc {
                    step: "b".into(),
                    when: None,
                    args: Default::default(),
                },
            ],
        };
        let ctx = json!({});
        let mut state = ExecutionState::default();
        let targets = evaluate_next(&r, &next, &ctx, &mut state, None).unwrap();
        assert_eq!(targets.len(), 2);
    }

    #[tokio::test]
    async fn claim_loop_slots_stops_at_back_pressure() {
        use flowline_bus::{LocalLoopKv, LoopCounters, LoopKv as _, LoopMode};
        let kv = LocalLoopKv::new();
        let key = LoopKey {
            execution_id: flowline_core::Id::from_raw(1),
            step_name: "fanout".into(),
            event_id: flowline_core::Id::from_raw(2),
        };
        kv.set(
            &key,
            LoopCounters {
                collection_size: 10,
                completed_count: 0,
                scheduled_count: 0,
                iterator: "item".into(),
                mode: LoopMode::Parallel,
                event_id: key.event_id,
            },
        )
        .await
        .unwrap();
        let claimed = claim_loop_slots(&kv, &key, 10, 3).await.unwrap();
        assert_eq!(claimed, vec![0, 1, 2]);
    }
}
