//! Control-Flow Engine (G): the hot path. Accepts an event, advances
//! derived state, evaluates routing, and emits commands plus lifecycle
//! events (§4.7).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use flowline_bus::{LoopCounters, LoopKey, LoopKv, LoopMode as BusLoopMode, Notification, NotificationPublisher};
use flowline_core::command::{Command, CommandMetadata, CommandSpec, LoopCommandMeta, TaskSequenceCommandMeta};
use flowline_core::event::{pending_step_key, CompletionStatus, EventMeta, EventName, EventStatus, NewEvent};
use flowline_core::id::{Id, IdGenerator};
use flowline_core::playbook::{CollectStrategy, Loop, LoopMode, Playbook, Step, ToolSpec};
use flowline_core::state::{compact_loop_result, ExecutionState, StepResult};
use flowline_render::{EngineConfig, TemplateRenderer};
use flowline_store::{CommandStore, EventFilter, EventLog, TransientVarStore, VarKind};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::cache::{PlaybookCache, StateCache};
use crate::error::{EngineError, EngineResult};
use crate::playbook_source::PlaybookSource;
use crate::reconstruct;
use crate::routing::{self, RouteTarget};

pub enum PlaybookRef {
    Path(String),
    CatalogId(Id),
}

/// The worker-reported inbound event the HTTP façade's `POST /events`
/// hands to the engine. `step`/`name` double as routing keys; everything
/// else rides on `result`/`error`/`meta_extra`.
#[derive(Debug, Clone, Default)]
pub struct IncomingEvent {
    pub execution_id: Id,
    pub step: Option<String>,
    pub name: Option<EventName>,
    pub status: EventStatus2,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub worker_id: Option<String>,
    pub duration_ms: Option<i64>,
    pub loop_event_id: Option<Id>,
    pub loop_iteration_index: Option<u32>,
}

/// Newtype avoiding an `Option<EventStatus>` default-derive footgun:
/// `EventStatus` has no meaningful default, so callers are forced to be
/// explicit.
#[derive(Debug, Clone, Copy)]
pub struct EventStatus2(pub EventStatus);

impl Default for EventStatus2 {
    fn default() -> Self {
        EventStatus2(EventStatus::Running)
    }
}

#[derive(Debug, Clone)]
pub struct IssuedCommand {
    pub command_id: Id,
    pub command: Command,
}

pub struct Engine {
    events: Arc<dyn EventLog>,
    commands: Arc<dyn CommandStore>,
    loop_kv: Arc<dyn LoopKv>,
    bus: Arc<dyn NotificationPublisher>,
    playbooks: Arc<dyn PlaybookSource>,
    vars: Arc<dyn TransientVarStore>,
    renderer: TemplateRenderer,
    state_cache: StateCache,
    playbook_cache: PlaybookCache,
    ids: IdGenerator,
    server_url: String,
    loop_result_max_bytes: usize,
    loop_result_preview_keys: usize,
    loop_result_preview_items: usize,
    taskseq_loop_repair_threshold: u32,
    pagination_max_pages: u32,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: Arc<dyn EventLog>,
        commands: Arc<dyn CommandStore>,
        loop_kv: Arc<dyn LoopKv>,
        bus: Arc<dyn NotificationPublisher>,
        playbooks: Arc<dyn PlaybookSource>,
        vars: Arc<dyn TransientVarStore>,
        config: &EngineConfig,
        worker_id: i64,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            events,
            commands,
            loop_kv,
            bus,
            playbooks,
            vars,
            renderer: TemplateRenderer::new(config.template_cache_size),
            state_cache: StateCache::new(config.state_cache_size, config.state_cache_ttl),
            playbook_cache: PlaybookCache::new(config.playbook_cache_size, config.playbook_cache_ttl),
            ids: IdGenerator::new(worker_id),
            server_url: server_url.into(),
            loop_result_max_bytes: config.loop_result_max_bytes,
            loop_result_preview_keys: config.loop_result_preview_keys,
            loop_result_preview_items: config.loop_result_preview_items,
            taskseq_loop_repair_threshold: config.taskseq_loop_repair_threshold,
            pagination_max_pages: config.pagination_max_pages,
        }
    }

    async fn resolve_playbook(&self, catalog_id: Option<Id>, path: Option<&str>) -> EngineResult<Arc<Playbook>> {
        let cache_key = catalog_id
            .map(|c| c.to_string())
            .or_else(|| path.map(str::to_string))
            .ok_or(EngineError::NoEntryStep)?;
        if let Some(cached) = self.playbook_cache.get(&cache_key).await {
            return Ok(cached);
        }
        let playbook = self.playbooks.resolve(catalog_id, path).await?;
        self.playbook_cache.insert(cache_key, playbook.clone()).await;
        Ok(playbook)
    }

    async fn load_or_reconstruct_state(
        &self,
        execution_id: Id,
        playbook: &Playbook,
    ) -> EngineResult<Arc<Mutex<ExecutionState>>> {
        if let Some(handle) = self.state_cache.get(execution_id).await {
            return Ok(handle);
        }
        let state = reconstruct::load_state(self.events.as_ref(), execution_id, playbook)
            .await?
            .ok_or(EngineError::UnknownExecution(execution_id))?;
        Ok(self.state_cache.insert(execution_id, state).await)
    }

    /// `start_execution` (§4.7): create a new execution, append the two
    /// opening lifecycle events, and issue the entry step's command(s).
    pub async fn start_execution(
        &self,
        playbook_ref: PlaybookRef,
        payload: Value,
        parent_execution_id: Option<Id>,
    ) -> EngineResult<(Id, Vec<IssuedCommand>)> {
        let (catalog_id, path) = match &playbook_ref {
            PlaybookRef::Path(p) => (None, Some(p.as_str())),
            PlaybookRef::CatalogId(c) => (Some(*c), None),
        };
        let playbook = self.resolve_playbook(catalog_id, path).await?;
        playbook
            .validate()
            .map_err(EngineError::UnknownStep)?;

        let execution_id = self.ids.next();

        let mut workload = serde_json::Map::new();
        for (k, v) in &playbook.workload {
            workload.insert(k.clone(), v.clone());
        }
        if let Value::Object(extra) = &payload {
            for (k, v) in extra {
                workload.insert(k.clone(), v.clone());
            }
        }
        let workload = Value::Object(workload);

        let root_event_id = self
            .events
            .append(NewEvent {
                execution_id,
                parent_event_id: None,
                parent_execution_id,
                catalog_id: playbook.catalog_id,
                name: EventName::PlaybookInitialized,
                step: None,
                status: EventStatus::Running,
                context: None,
                result: Some(workload.clone()),
                error: None,
                stack_trace: None,
                worker_id: None,
                duration_ms: None,
                meta: EventMeta {
                    execution_id: Some(execution_id),
                    catalog_id: playbook.catalog_id,
                    parent_execution_id,
                    extra: HashMap::from([(
                        "playbook_path".to_string(),
                        json!(playbook.metadata.path),
                    )]),
                    ..Default::default()
                },
            })
            .await?;

        let workflow_event_id = self
            .events
            .append(NewEvent {
                execution_id,
                parent_event_id: Some(root_event_id),
                parent_execution_id,
                catalog_id: playbook.catalog_id,
                name: EventName::WorkflowInitialized,
                step: None,
                status: EventStatus::Running,
                context: None,
                result: Some(workload.clone()),
                error: None,
                stack_trace: None,
                worker_id: None,
                duration_ms: None,
                meta: EventMeta {
                    execution_id: Some(execution_id),
                    catalog_id: playbook.catalog_id,
                    root_event_id: Some(root_event_id),
                    parent_execution_id,
                    ..Default::default()
                },
            })
            .await?;

        let mut state = ExecutionState {
            execution_id: Some(execution_id),
            root_event_id: Some(root_event_id),
            last_event_id: Some(workflow_event_id),
            parent_execution_id,
            ..Default::default()
        };
        if let Value::Object(map) = &workload {
            for (k, v) in map {
                state.variables.insert(k.clone(), v.clone());
            }
        }

        let entry_step = playbook.entry_step().ok_or(EngineError::NoEntryStep)?.to_string();
        let mut issued = Vec::new();
        issued.extend(
            self.issue_step(&mut state, &playbook, &entry_step, HashMap::new(), workflow_event_id)
                .await?,
        );

        self.state_cache.insert(execution_id, state).await;
        Ok((execution_id, issued))
    }

    /// `handle_event` (§4.7.1): the hot path.
    pub async fn handle_event(&self, incoming: IncomingEvent) -> EngineResult<Vec<IssuedCommand>> {
        let execution_id = incoming.execution_id;

        let Some(init) = reconstruct::load_initialization(self.events.as_ref(), execution_id).await? else {
            tracing::warn!(%execution_id, "orphan event for unknown execution, dropping");
            return Ok(vec![]);
        };
        let path_hint = init.meta.extra.get("playbook_path").and_then(|v| v.as_str());
        let playbook = self
            .resolve_playbook(init.catalog_id, path_hint)
            .await
            .map_err(|_| EngineError::UnknownExecution(execution_id))?;

        let state_handle = self.load_or_reconstruct_state(execution_id, &playbook).await?;
        let mut state = state_handle.lock().await;

        if state.completed {
            return Ok(vec![]); // idempotent under at-least-once delivery
        }

        let Some(name) = incoming.name else {
            return Ok(vec![]);
        };
        let step_key = incoming.step.clone();

        let event_id = self
            .persist_incoming(&mut state, &playbook, execution_id, name, &step_key, &incoming)
            .await?;

        let mut issued = Vec::new();

        let Some(step_key) = step_key else {
            self.check_completion(&mut state, &playbook, event_id).await?;
            return Ok(issued);
        };

        // `step.enter` is the worker's claim-time marker (§8 S1); it never
        // drives routing or completion, only the event log.
        if name == EventName::StepEnter {
            return Ok(issued);
        }

        // §4.7.1 step 4: per-iteration step.exit on a task-sequence command
        // is informative only.
        if name == EventName::StepExit && step_key.ends_with(":task_sequence") {
            return Ok(issued);
        }

        // §4.7.1 step 3: task-sequence completion.
        if name == EventName::CallDone && step_key.ends_with(":task_sequence") {
            issued.extend(
                self.handle_task_sequence_completion(&mut state, &playbook, &step_key, event_id, &incoming)
                    .await?,
            );
            self.check_completion(&mut state, &playbook, event_id).await?;
            return Ok(issued);
        }

        let resolved = pending_step_key(&step_key).to_string();
        let Some(step_def) = playbook.step(&resolved).cloned() else {
            // §4.7.1 step 2: inline synthetic step.
            if name == EventName::StepExit {
                state.mark_step_completed(&step_key);
            }
            self.check_completion(&mut state, &playbook, event_id).await?;
            return Ok(issued);
        };

        match name {
            EventName::CallDone => {
                if let Some(result) = &incoming.result {
                    self.store_step_result(&mut state, &resolved, result.clone()).await?;
                }
            }
            EventName::CallError => {
                state.mark_step_completed(&resolved);
                state.failed = true;
            }
            _ => {}
        }

        self.apply_set_ctx(&mut state, &step_def)?;

        let loop_active = step_def.loop_.is_some()
            && state
                .loop_state
                .get(&resolved)
                .map(|l| !l.is_done())
                .unwrap_or(true);
        let should_route = !(name == EventName::CallDone && loop_active);

        if should_route {
            if let Some(next) = &step_def.next {
                let context = state.get_render_context();
                let targets = routing::evaluate_next(&self.renderer, next, &context, &mut state, None)?;
                for target in targets {
                    issued.extend(
                        self.issue_step(&mut state, &playbook, &target.step, target.args, event_id)
                            .await?,
                    );
                }
            }
        }

        if name == EventName::StepExit {
            issued.extend(
                self.handle_step_exit(&mut state, &playbook, &step_def, &resolved, incoming.status.0, event_id)
                    .await?,
            );
        }

        self.check_completion(&mut state, &playbook, event_id).await?;
        Ok(issued)
    }

    async fn persist_incoming(
        &self,
        state: &mut ExecutionState,
        playbook: &Playbook,
        execution_id: Id,
        name: EventName,
        step: &Option<String>,
        incoming: &IncomingEvent,
    ) -> EngineResult<Id> {
        let event_id = self
            .events
            .append(NewEvent {
                execution_id,
                parent_event_id: state.last_event_id,
                parent_execution_id: state.parent_execution_id,
                catalog_id: playbook.catalog_id,
                name,
                step: step.clone(),
                status: incoming.status.0,
                context: None,
                result: incoming.result.clone(),
                error: incoming.error.clone(),
                stack_trace: None,
                worker_id: incoming.worker_id.clone(),
                duration_ms: incoming.duration_ms,
                meta: EventMeta {
                    execution_id: Some(execution_id),
                    catalog_id: playbook.catalog_id,
                    root_event_id: state.root_event_id,
                    step: step.clone(),
                    parent_execution_id: state.parent_execution_id,
                    loop_event_id: incoming.loop_event_id,
                    loop_iteration_index: incoming.loop_iteration_index,
                    ..Default::default()
                },
            })
            .await?;
        state.last_event_id = Some(event_id);
        if let Some(s) = step {
            state.step_event_ids.insert(s.clone(), event_id);
            if name == EventName::CommandIssued {
                state.mark_issued(s);
            } else if matches!(name, EventName::CommandCompleted | EventName::CommandFailed) {
                state.remove_issued(s);
            }
        }
        Ok(event_id)
    }

    fn apply_set_ctx(&self, state: &mut ExecutionState, step_def: &Step) -> EngineResult<()> {
        if step_def.set_ctx.is_empty() {
            return Ok(());
        }
        let context = state.get_render_context();
        for (name, template) in &step_def.set_ctx {
            let value = self.renderer.render_value(template, &context)?;
            state.variables.insert(name.clone(), value);
        }
        Ok(())
    }

    /// Resolve the tool a command should carry: a step authored with a
    /// list of tasks is already a task sequence; a single tool carrying
    /// `spec.policy.rules` is synthesized into a one-element one so retry
    /// semantics are uniform (§3, Open Question 3).
    fn effective_tool(&self, step_name: &str, tool: &ToolSpec) -> (ToolSpec, bool) {
        if let ToolSpec::TaskSequence { .. } = tool {
            return (tool.clone(), true);
        }
        if tool.policy_rules().is_some() {
            let task = flowline_core::playbook::Task {
                name: step_name.to_string(),
                tool: tool.clone(),
                eval: Vec::new(),
            };
            return (ToolSpec::TaskSequence { tasks: vec![task] }, true);
        }
        (tool.clone(), false)
    }

    /// Issue command(s) for `step_name`, honoring loop semantics
    /// (§4.7.3). `extra_args` come from the triggering routing arc (or
    /// are empty for the initial entry-step activation).
    async fn issue_step(
        &self,
        state: &mut ExecutionState,
        playbook: &Playbook,
        step_name: &str,
        extra_args: HashMap<String, Value>,
        triggering_event_id: Id,
    ) -> EngineResult<Vec<IssuedCommand>> {
        let Some(step_def) = playbook.step(step_name) else {
            return Err(EngineError::UnknownStep(step_name.to_string()));
        };
        let Some(tool) = &step_def.tool else {
            return Err(EngineError::UnknownStep(step_name.to_string()));
        };
        let (tool, is_task_sequence) = self.effective_tool(step_name, tool);

        if let Some(loop_spec) = &step_def.loop_ {
            return self
                .issue_loop_commands(state, step_name, step_def, loop_spec, &tool, is_task_sequence, extra_args, triggering_event_id)
                .await;
        }

        let context = self.merged_context(state, &step_def.args, &extra_args)?;
        let args = self.render_args(&step_def.args, &extra_args, &context)?;

        let command_step = if is_task_sequence {
            format!("{step_name}:task_sequence")
        } else {
            step_name.to_string()
        };
        let metadata = CommandMetadata {
            command_id: None,
            loop_: None,
            task_sequence: is_task_sequence.then(|| TaskSequenceCommandMeta {
                parent_step: step_name.to_string(),
                task_names: task_names(&tool),
            }),
        };
        let retry = tool.retry_policy();
        let command = Command {
            execution_id: state.execution_id.expect("state always carries execution_id"),
            step: command_step,
            tool,
            args,
            render_context_snapshot: context,
            attempt: 0,
            max_attempts: retry.max_attempts,
            retry_delay: retry.delay,
            retry_backoff: retry.backoff,
            priority: 0,
            next_targets: Vec::new(),
            spec: CommandSpec {
                next_mode: step_def.next.as_ref().map(|n| n.spec.mode).unwrap_or_default(),
            },
            metadata,
        };

        self.publish_command_unchecked(state, command, triggering_event_id).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn issue_loop_commands(
        &self,
        state: &mut ExecutionState,
        step_name: &str,
        step_def: &Step,
        loop_spec: &flowline_core::playbook::Loop,
        tool: &ToolSpec,
        is_task_sequence: bool,
        extra_args: HashMap<String, Value>,
        triggering_event_id: Id,
    ) -> EngineResult<Vec<IssuedCommand>> {
        let needs_new_epoch = state
            .loop_state
            .get(step_name)
            .map(|l| l.aggregation_finalized || l.is_done())
            .unwrap_or(true);

        if needs_new_epoch {
            let context = state.get_render_context();
            let rendered = self.renderer.render_str(&loop_spec.source, &context)?;
            let collection = flowline_render::normalize_loop_collection(&rendered);
            let loop_event_id = self.ids.next();
            state.init_loop(
                step_name,
                collection,
                loop_spec.iterator.clone(),
                loop_spec.mode,
                loop_event_id,
            );
            let key = LoopKey {
                execution_id: state.execution_id.expect("state always carries execution_id"),
                step_name: step_name.to_string(),
                event_id: loop_event_id,
            };
            self.loop_kv
                .set(
                    &key,
                    LoopCounters {
                        collection_size: state.loop_state[step_name].collection_size(),
                        completed_count: 0,
                        scheduled_count: 0,
                        iterator: loop_spec.iterator.clone(),
                        mode: bus_loop_mode(loop_spec.mode),
                        event_id: loop_event_id,
                    },
                )
                .await?;
        }

        let loop_state = state.loop_state.get(step_name).cloned().unwrap_or_default();
        let Some(loop_event_id) = loop_state.event_id else {
            return Ok(Vec::new());
        };
        let key = LoopKey {
            execution_id: state.execution_id.expect("state always carries execution_id"),
            step_name: step_name.to_string(),
            event_id: loop_event_id,
        };
        let max_in_flight = loop_spec.max_in_flight();
        let claimed = routing::claim_loop_slots(
            self.loop_kv.as_ref(),
            &key,
            loop_state.collection_size(),
            max_in_flight,
        )
        .await?;

        let mut issued = Vec::new();
        for index in claimed {
            let Some(item) = loop_state.collection.get(index as usize).cloned() else {
                continue;
            };
            let command = self.build_loop_iteration_command(
                state,
                step_name,
                step_def,
                &loop_spec.iterator,
                tool,
                is_task_sequence,
                loop_event_id,
                index,
                &item,
                loop_state.collection_size(),
                &extra_args,
                false,
            )?;
            issued.extend(self.publish_command_unchecked(state, command, triggering_event_id).await?);
        }
        Ok(issued)
    }

    /// Build the command for one loop iteration. Shared by the normal
    /// claim-driven fan-out and by tail-repair's targeted reissue of a
    /// specific missing index (§4.7.3, §4.7.5 step 4).
    #[allow(clippy::too_many_arguments)]
    fn build_loop_iteration_command(
        &self,
        state: &ExecutionState,
        step_name: &str,
        step_def: &Step,
        iterator: &str,
        tool: &ToolSpec,
        is_task_sequence: bool,
        loop_event_id: Id,
        index: u32,
        item: &Value,
        collection_size: u32,
        extra_args: &HashMap<String, Value>,
        loop_retry: bool,
    ) -> EngineResult<Command> {
        let mut iter_extra = extra_args.clone();
        iter_extra.insert(iterator.to_string(), item.clone());
        iter_extra.insert("loop_index".to_string(), json!(index));
        iter_extra.insert("_first".to_string(), json!(index == 0));
        iter_extra.insert("_last".to_string(), json!(index + 1 == collection_size));
        iter_extra.insert("_index".to_string(), json!(index));

        let context = self.merged_context(state, &step_def.args, &iter_extra)?;
        let args = self.render_args(&step_def.args, &iter_extra, &context)?;

        let command_step = if is_task_sequence {
            format!("{step_name}:task_sequence")
        } else {
            step_name.to_string()
        };
        let retry = tool.retry_policy();
        Ok(Command {
            execution_id: state.execution_id.expect("state always carries execution_id"),
            step: command_step,
            tool: tool.clone(),
            args,
            render_context_snapshot: context,
            attempt: 0,
            max_attempts: retry.max_attempts,
            retry_delay: retry.delay,
            retry_backoff: retry.backoff,
            priority: 0,
            next_targets: Vec::new(),
            spec: CommandSpec {
                next_mode: step_def.next.as_ref().map(|n| n.spec.mode).unwrap_or_default(),
            },
            metadata: CommandMetadata {
                command_id: None,
                loop_: Some(LoopCommandMeta {
                    loop_step: step_name.to_string(),
                    loop_event_id,
                    loop_iteration_index: index,
                    loop_retry,
                }),
                task_sequence: is_task_sequence.then(|| TaskSequenceCommandMeta {
                    parent_step: step_name.to_string(),
                    task_names: task_names(tool),
                }),
            },
        })
    }

    fn merged_context(
        &self,
        state: &ExecutionState,
        step_args: &HashMap<String, Value>,
        extra_args: &HashMap<String, Value>,
    ) -> EngineResult<Value> {
        let mut context = state.get_render_context();
        if let Value::Object(map) = &mut context {
            for (k, v) in step_args {
                map.insert(k.clone(), v.clone());
            }
            for (k, v) in extra_args {
                map.insert(k.clone(), v.clone());
            }
        }
        Ok(context)
    }

    fn render_args(
        &self,
        step_args: &HashMap<String, Value>,
        extra_args: &HashMap<String, Value>,
        context: &Value,
    ) -> EngineResult<HashMap<String, Value>> {
        let mut merged = serde_json::Map::new();
        for (k, v) in step_args {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in extra_args {
            merged.insert(k.clone(), v.clone());
        }
        let rendered = self.renderer.render_value(&Value::Object(merged), context)?;
        Ok(rendered.as_object().cloned().unwrap_or_default().into_iter().collect())
    }

    async fn publish_command_unchecked(
        &self,
        state: &mut ExecutionState,
        command: Command,
        triggering_event_id: Id,
    ) -> EngineResult<Vec<IssuedCommand>> {
        let command_id = self.ids.next();

        let issued_event_id = self
            .events
            .append(NewEvent {
                execution_id: command.execution_id,
                parent_event_id: Some(triggering_event_id),
                parent_execution_id: state.parent_execution_id,
                catalog_id: None,
                name: EventName::CommandIssued,
                step: Some(command.step.clone()),
                status: EventStatus::Running,
                context: None,
                result: None,
                error: None,
                stack_trace: None,
                worker_id: None,
                duration_ms: None,
                meta: EventMeta {
                    execution_id: Some(command.execution_id),
                    root_event_id: state.root_event_id,
                    step: Some(command.step.clone()),
                    loop_event_id: command.metadata.loop_.as_ref().map(|l| l.loop_event_id),
                    loop_iteration_index: command.metadata.loop_.as_ref().map(|l| l.loop_iteration_index),
                    ..Default::default()
                },
            })
            .await?;
        state.last_event_id = Some(issued_event_id);
        state.mark_issued(&command.step);

        self.commands.publish(command_id, &command).await?;
        let _ = self
            .bus
            .publish(&Notification {
                execution_id: command.execution_id,
                queue_id: command_id,
                step: command.step.clone(),
                server_url: self.server_url.clone(),
            })
            .await;

        Ok(vec![IssuedCommand { command_id, command }])
    }

    async fn handle_step_exit(
        &self,
        state: &mut ExecutionState,
        playbook: &Playbook,
        step_def: &Step,
        resolved: &str,
        status: EventStatus,
        event_id: Id,
    ) -> EngineResult<Vec<IssuedCommand>> {
        let pending_retry = state
            .pagination_state
            .get(resolved)
            .map(|p| p.pending_retry)
            .unwrap_or(false);

        if pending_retry {
            return Ok(Vec::new());
        }

        if let Some(pagination) = state.pagination_state.get(resolved) {
            if !pagination.collected_data.is_empty() {
                let merged = json!({
                    "_all_collected_items": pagination.collected_data,
                    "_pagination": { "pages_collected": pagination.iteration_count },
                });
                state.set_step_result(resolved, merged);
            }
        }

        if step_def.loop_.is_some() {
            let Some(loop_event_id) = state.loop_state.get(resolved).and_then(|l| l.event_id) else {
                return Ok(Vec::new());
            };
            let key = LoopKey {
                execution_id: state.execution_id.expect("state always carries execution_id"),
                step_name: resolved.to_string(),
                event_id: loop_event_id,
            };
            let result = state
                .get_step_result(resolved)
                .and_then(|r| match r {
                    StepResult::Inline(v) => Some(v.clone()),
                    StepResult::External(_) => None,
                })
                .unwrap_or(Value::Null);
            let result = compact_loop_result(result, self.loop_result_max_bytes, self.loop_result_preview_keys, self.loop_result_preview_items);
            if let Some(loop_state) = state.loop_state.get_mut(resolved) {
                loop_state.results.push(result);
            }
            self.emit_command_terminal(state, playbook, resolved, status, event_id).await?;
            let completed = self.loop_kv.increment_loop_completed(&key).await?;
            let collection_size = state.loop_state[resolved].collection_size();
            if completed >= 0 && completed as u32 >= collection_size {
                return self.finalize_loop(state, playbook, resolved, event_id).await;
            }
            return Ok(Vec::new());
        }

        state.mark_step_completed(resolved);
        self.emit_command_terminal(state, playbook, resolved, status, event_id).await?;
        Ok(Vec::new())
    }

    /// Append the `command.completed`/`command.failed` terminal marker a
    /// claimed command's outcome owes the event log (§8 S1); pairs with
    /// the `command.issued` appended in `publish_command_unchecked`.
    async fn emit_command_terminal(
        &self,
        state: &mut ExecutionState,
        playbook: &Playbook,
        step: &str,
        status: EventStatus,
        parent_event_id: Id,
    ) -> EngineResult<()> {
        let name = if status == EventStatus::Failed {
            EventName::CommandFailed
        } else {
            EventName::CommandCompleted
        };
        let event_id = self
            .events
            .append(NewEvent {
                execution_id: state.execution_id.expect("state always carries execution_id"),
                parent_event_id: Some(parent_event_id),
                parent_execution_id: state.parent_execution_id,
                catalog_id: playbook.catalog_id,
                name,
                step: Some(step.to_string()),
                status,
                context: None,
                result: None,
                error: None,
                stack_trace: None,
                worker_id: None,
                duration_ms: None,
                meta: EventMeta {
                    execution_id: state.execution_id,
                    root_event_id: state.root_event_id,
                    step: Some(step.to_string()),
                    parent_execution_id: state.parent_execution_id,
                    ..Default::default()
                },
            })
            .await?;
        state.last_event_id = Some(event_id);
        Ok(())
    }

    /// Externalize a step result past `loop_result_max_bytes`, storing the
    /// full value in the Transient Variable Store under a reference the
    /// `_ref` handle points at (§3 result externalization).
    async fn store_step_result(&self, state: &mut ExecutionState, step: &str, value: Value) -> EngineResult<()> {
        let execution_id = state.execution_id.expect("state always carries execution_id");
        let reference = format!("__step_result__{step}");
        let max_bytes = self.loop_result_max_bytes;
        let oversized = serde_json::to_vec(&value).map(|b| b.len() > max_bytes).unwrap_or(false);
        if oversized {
            self.vars
                .set(execution_id, &reference, value.clone(), VarKind::StepResult, Some(step))
                .await?;
        }
        state.set_step_result_bounded(step, value, max_bytes, || format!("var:{execution_id}/{reference}"));
        Ok(())
    }

    async fn finalize_loop(
        &self,
        state: &mut ExecutionState,
        playbook: &Playbook,
        resolved: &str,
        event_id: Id,
    ) -> EngineResult<Vec<IssuedCommand>> {
        if let Some(loop_state) = state.loop_state.get_mut(resolved) {
            loop_state.aggregation_finalized = true;
        }
        let results_value = state
            .loop_state
            .get(resolved)
            .map(|l| Value::Array(l.results.clone()))
            .unwrap_or(Value::Array(Vec::new()));
        state.set_step_result(resolved, results_value.clone());
        state.mark_step_completed(resolved);

        let loop_done_event_id = self
            .events
            .append(NewEvent {
                execution_id: state.execution_id.expect("state always carries execution_id"),
                parent_event_id: Some(event_id),
                parent_execution_id: state.parent_execution_id,
                catalog_id: playbook.catalog_id,
                name: EventName::LoopDone,
                step: Some(resolved.to_string()),
                status: EventStatus::Completed,
                context: None,
                result: Some(results_value.clone()),
                error: None,
                stack_trace: None,
                worker_id: None,
                duration_ms: None,
                meta: EventMeta {
                    execution_id: state.execution_id,
                    root_event_id: state.root_event_id,
                    step: Some(resolved.to_string()),
                    ..Default::default()
                },
            })
            .await?;
        state.last_event_id = Some(loop_done_event_id);

        let mut issued = Vec::new();
        if let Some(step_def) = playbook.step(resolved) {
            if let Some(next) = &step_def.next {
                let context = state.get_render_context();
                let targets = routing::evaluate_next(
                    &self.renderer,
                    next,
                    &context,
                    state,
                    Some(&results_value),
                )?;
                for target in targets {
                    issued.extend(
                        self.issue_step(state, playbook, &target.step, target.args, loop_done_event_id)
                            .await?,
                    );
                }
            }
        }
        Ok(issued)
    }

    /// §4.7.5: task-sequence completion handling.
    async fn handle_task_sequence_completion(
        &self,
        state: &mut ExecutionState,
        playbook: &Playbook,
        step_key: &str,
        event_id: Id,
        incoming: &IncomingEvent,
    ) -> EngineResult<Vec<IssuedCommand>> {
        let parent = pending_step_key(step_key).to_string();

        if let Some(result) = &incoming.result {
            if let Some(ctx_delta) = result.get("ctx").and_then(|v| v.as_object()) {
                for (k, v) in ctx_delta {
                    state.variables.insert(k.clone(), v.clone());
                }
            }
        }

        let Some(step_def) = playbook.step(&parent).cloned() else {
            state.mark_step_completed(step_key);
            self.check_completion(state, playbook, event_id).await?;
            return Ok(Vec::new());
        };

        self.apply_set_ctx(state, &step_def)?;

        if let Some(pagination) = incoming.result.as_ref().and_then(|r| r.get("pagination")) {
            if let Some(issued) = self
                .accumulate_pagination(state, playbook, &parent, pagination.clone(), event_id)
                .await?
            {
                self.check_completion(state, playbook, event_id).await?;
                return Ok(issued);
            }
        }

        let unwrapped = unwrap_task_sequence_result(&step_def, incoming.result.clone());
        if let Some(result) = &unwrapped {
            self.store_step_result(state, &parent, result.clone()).await?;
        }

        let mut issued = Vec::new();

        if step_def.loop_.is_some() {
            issued.extend(
                self.handle_step_exit(state, playbook, &step_def, &parent, incoming.status.0, event_id)
                    .await?,
            );
            issued.extend(self.attempt_tail_repair(state, &step_def, &parent, event_id).await?);
        } else {
            self.emit_command_terminal(state, playbook, &parent, incoming.status.0, event_id).await?;
            state.mark_step_completed(&parent);
            if let Some(next) = &step_def.next {
                let context = state.get_render_context();
                let targets = routing::evaluate_next(&self.renderer, next, &context, state, None)?;
                for target in targets {
                    issued.extend(
                        self.issue_step(state, playbook, &target.step, target.args, event_id)
                            .await?,
                    );
                }
            }
        }

        Ok(issued)
    }

    /// §4.7.4: fold a worker-reported page of paginated data into
    /// `pagination_state` and, unless the page count has hit
    /// `pagination_max_pages`, reissue the task sequence for the next
    /// page instead of treating this completion as terminal.
    async fn accumulate_pagination(
        &self,
        state: &mut ExecutionState,
        playbook: &Playbook,
        resolved: &str,
        pagination: Value,
        event_id: Id,
    ) -> EngineResult<Option<Vec<IssuedCommand>>> {
        let Some(page) = pagination.get("page").cloned() else {
            return Ok(None);
        };
        let mode = pagination
            .get("mode")
            .and_then(Value::as_str)
            .and_then(|s| match s {
                "append" => Some(CollectStrategy::Append),
                "replace" => Some(CollectStrategy::Replace),
                _ => Some(CollectStrategy::Extend),
            })
            .unwrap_or_default();
        let has_next = pagination.get("has_next").and_then(Value::as_bool).unwrap_or(false);

        let entry = state.pagination_state.entry(resolved.to_string()).or_default();
        match mode {
            CollectStrategy::Replace => entry.collected_data = vec![page],
            CollectStrategy::Append => entry.collected_data.push(page),
            CollectStrategy::Extend => match page {
                Value::Array(items) => entry.collected_data.extend(items),
                other => entry.collected_data.push(other),
            },
        }
        entry.iteration_count += 1;

        if !has_next || entry.iteration_count >= self.pagination_max_pages {
            entry.pending_retry = false;
            return Ok(None);
        }
        entry.pending_retry = true;

        let overrides = pagination
            .get("retry_overrides")
            .and_then(|v| v.as_object())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let issued = self.issue_step(state, playbook, resolved, overrides, event_id).await?;
        Ok(Some(issued))
    }

    /// §4.7.5 step 4: when a loop's `scheduled_count` already equals its
    /// collection size but some iteration slots never produced a terminal
    /// event, reissue those specific indices, bounded by
    /// `taskseq_loop_repair_threshold` and deduped via `reissued_indices`.
    async fn attempt_tail_repair(
        &self,
        state: &mut ExecutionState,
        step_def: &Step,
        resolved: &str,
        event_id: Id,
    ) -> EngineResult<Vec<IssuedCommand>> {
        let Some(loop_def) = &step_def.loop_ else {
            return Ok(Vec::new());
        };
        let Some(loop_state) = state.loop_state.get(resolved) else {
            return Ok(Vec::new());
        };
        if loop_state.is_done() || loop_state.aggregation_finalized {
            return Ok(Vec::new());
        }
        let Some(loop_event_id) = loop_state.event_id else {
            return Ok(Vec::new());
        };
        let key = LoopKey {
            execution_id: state.execution_id.expect("state always carries execution_id"),
            step_name: resolved.to_string(),
            event_id: loop_event_id,
        };
        let scheduled = self.loop_kv.get(&key).await?.map(|c| c.scheduled_count).unwrap_or(0);
        let collection_size = loop_state.collection_size();
        if scheduled < collection_size {
            return Ok(Vec::new());
        }

        let execution_id = state.execution_id.expect("state always carries execution_id");
        let issued_events = self
            .events
            .read(execution_id, EventFilter { event_type: Some(EventName::CommandIssued), since_event_id: None }, 1, 500)
            .await?;
        let terminal_events = self
            .events
            .read(execution_id, EventFilter::default(), 1, 2000)
            .await?;

        let outstanding: HashSet<u32> = issued_events
            .iter()
            .filter(|e| e.meta.loop_event_id == Some(loop_event_id))
            .filter_map(|e| e.meta.loop_iteration_index)
            .filter(|idx| {
                !terminal_events.iter().any(|t| {
                    t.meta.loop_event_id == Some(loop_event_id)
                        && t.meta.loop_iteration_index == Some(*idx)
                        && matches!(t.name, EventName::CommandCompleted | EventName::CommandFailed)
                })
            })
            .collect();

        let loop_state = state.loop_state.get_mut(resolved).expect("checked above");
        let candidates: Vec<u32> = outstanding
            .into_iter()
            .filter(|idx| !loop_state.reissued_indices.contains(idx))
            .take(self.taskseq_loop_repair_threshold as usize)
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        for idx in &candidates {
            loop_state.reissued_indices.insert(*idx);
        }

        let tool = step_def.tool.as_ref().ok_or_else(|| EngineError::UnknownStep(resolved.to_string()))?;
        let (tool, is_task_sequence) = self.effective_tool(resolved, tool);

        let mut issued = Vec::new();
        for idx in candidates {
            let Some(item) = state.loop_state[resolved].collection.get(idx as usize).cloned() else {
                continue;
            };
            let command = self.build_loop_iteration_command(
                state,
                resolved,
                step_def,
                &loop_def.iterator,
                &tool,
                is_task_sequence,
                loop_event_id,
                idx,
                &item,
                collection_size,
                &HashMap::new(),
                true,
            )?;
            issued.extend(self.publish_command_unchecked(state, command, event_id).await?);
        }
        Ok(issued)
    }

    /// §4.7.1 step 11: completion check. Pending detection prefers the
    /// in-memory `issued_steps`; only when that's empty does a fallback
    /// event-log scan run.
    async fn check_completion(&self, state: &mut ExecutionState, playbook: &Playbook, event_id: Id) -> EngineResult<()> {
        if state.completed || state.cancelled {
            return Ok(());
        }
        if state.has_pending() {
            return Ok(());
        }
        if state.issued_steps.is_empty() {
            let execution_id = state.execution_id.expect("state always carries execution_id");
            let unmatched = self.events.count_unmatched_issued(execution_id).await?;
            if !unmatched.is_empty() {
                return Ok(());
            }
        }

        state.completed = true;
        let status = if state.failed {
            CompletionStatus::Failed
        } else {
            CompletionStatus::Completed
        };

        let execution_id = state.execution_id.expect("state always carries execution_id");
        let workflow_event_id = self
            .events
            .append(NewEvent {
                execution_id,
                parent_event_id: Some(event_id),
                parent_execution_id: state.parent_execution_id,
                catalog_id: playbook.catalog_id,
                name: EventName::workflow_terminal(status),
                step: None,
                status: terminal_event_status(status),
                context: None,
                result: None,
                error: None,
                stack_trace: None,
                worker_id: None,
                duration_ms: None,
                meta: EventMeta {
                    execution_id: Some(execution_id),
                    root_event_id: state.root_event_id,
                    ..Default::default()
                },
            })
            .await?;

        self.events
            .append(NewEvent {
                execution_id,
                parent_event_id: Some(workflow_event_id),
                parent_execution_id: state.parent_execution_id,
                catalog_id: playbook.catalog_id,
                name: EventName::playbook_terminal(status),
                step: playbook.final_step.clone(),
                status: terminal_event_status(status),
                context: None,
                result: None,
                error: None,
                stack_trace: None,
                worker_id: None,
                duration_ms: None,
                meta: EventMeta {
                    execution_id: Some(execution_id),
                    root_event_id: state.root_event_id,
                    ..Default::default()
                },
            })
            .await?;

        self.state_cache.evict(execution_id).await;
        Ok(())
    }

    /// §4.7.7: mark executions idle past `older_than` as failed and evict
    /// them from the state cache, returning the ids swept.
    pub async fn sweep_stale_executions(&self, older_than: chrono::DateTime<Utc>) -> EngineResult<Vec<Id>> {
        let stale = self.events.find_stale_executions(older_than).await?;
        for execution_id in &stale {
            self.events
                .append(NewEvent {
                    execution_id: *execution_id,
                    parent_event_id: None,
                    parent_execution_id: None,
                    catalog_id: None,
                    name: EventName::ExecutionCancelled,
                    step: None,
                    status: EventStatus::Failed,
                    context: Some(json!({ "reason": "stale execution sweep" })),
                    result: None,
                    error: None,
                    stack_trace: None,
                    worker_id: None,
                    duration_ms: None,
                    meta: EventMeta {
                        execution_id: Some(*execution_id),
                        ..Default::default()
                    },
                })
                .await?;
            self.state_cache.evict(*execution_id).await;
        }
        Ok(stale)
    }

    /// §4.7.6: cancellation.
    pub async fn cancel_execution(&self, execution_id: Id, cascade: bool, reason: Option<String>) -> EngineResult<Vec<Id>> {
        self.events
            .append(NewEvent {
                execution_id,
                parent_event_id: None,
                parent_execution_id: None,
                catalog_id: None,
                name: EventName::ExecutionCancelled,
                step: None,
                status: EventStatus::Cancelled,
                context: reason.map(|r| json!({ "reason": r })),
                result: None,
                error: None,
                stack_trace: None,
                worker_id: None,
                duration_ms: None,
                meta: EventMeta {
                    execution_id: Some(execution_id),
                    ..Default::default()
                },
            })
            .await?;
        self.state_cache.evict(execution_id).await;

        // Descendant discovery by `parent_execution_id` across an entire
        // execution tree is a catalog/execution-index concern that doesn't
        // exist yet; a single-id result is correct until one does.
        let _ = cascade;
        Ok(vec![execution_id])
    }
}

fn bus_loop_mode(mode: LoopMode) -> BusLoopMode {
    match mode {
        LoopMode::Sequential => BusLoopMode::Sequential,
        LoopMode::Parallel => BusLoopMode::Parallel,
    }
}

fn terminal_event_status(status: CompletionStatus) -> EventStatus {
    match status {
        CompletionStatus::Completed => EventStatus::Completed,
        CompletionStatus::Failed => EventStatus::Failed,
        CompletionStatus::Cancelled => EventStatus::Cancelled,
    }
}

fn task_names(tool: &ToolSpec) -> Vec<String> {
    match tool {
        ToolSpec::TaskSequence { tasks } => tasks.iter().map(|t| t.name.clone()).collect(),
        _ => Vec::new(),
    }
}

/// §4.7.5 step 6: a single-task sequence unwraps its one result at the
/// parent step for backward-compatible field access; otherwise the
/// composite `{status, results, ...}` body is stored as-is.
fn unwrap_task_sequence_result(step_def: &Step, result: Option<Value>) -> Option<Value> {
    let result = result?;
    if let Some(ToolSpec::TaskSequence { tasks }) = &step_def.tool {
        if tasks.len() == 1 {
            if let Some(results) = result.get("results").and_then(|r| r.get(&tasks[0].name)) {
                return Some(results.clone());
            }
        }
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryPlaybookSource;
    use flowline_core::playbook::{
        Arc as RouteArc, Loop, LoopSpec, Next, NextMode, NextSpec, PlaybookMetadata,
    };
    use flowline_store::{EventFilter, StoreResult};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeEventLog {
        events: StdMutex<Vec<flowline_core::event::Event>>,
        ids: AtomicI64,
    }

    impl FakeEventLog {
        fn new() -> Self {
            Self {
                events: StdMutex::new(Vec::new()),
                ids: AtomicI64::new(1),
            }
        }
    }

    #[async_trait::async_trait]
    impl EventLog for FakeEventLog {
        async fn append(&self, event: NewEvent) -> StoreResult<Id> {
            let event_id = Id::from_raw(self.ids.fetch_add(1, Ordering::SeqCst));
            self.events.lock().unwrap().push(flowline_core::event::Event {
                execution_id: event.execution_id,
                event_id,
                parent_event_id: event.parent_event_id,
                parent_execution_id: event.parent_execution_id,
                catalog_id: event.catalog_id,
                name: event.name,
                step: event.step,
                status: event.status,
                context: event.context,
                result: event.result,
                error: event.error,
                stack_trace: event.stack_trace,
                worker_id: event.worker_id,
                duration_ms: event.duration_ms,
                meta: event.meta,
                created_at: chrono::Utc::now(),
            });
            Ok(event_id)
        }

        async fn read(&self, execution_id: Id, filter: EventFilter, page: i64, page_size: i64) -> StoreResult<Vec<flowline_core::event::Event>> {
            let mut matched: Vec<_> = self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.execution_id == execution_id)
                .filter(|e| filter.event_type.map_or(true, |t| t == e.name))
                .filter(|e| filter.since_event_id.map_or(true, |s| e.event_id > s))
                .cloned()
                .collect();
            matched.sort_by_key(|e| e.event_id);
            let offset = ((page.max(1) - 1) * page_size) as usize;
            Ok(matched.into_iter().skip(offset).take(page_size as usize).collect())
        }

        async fn first_playbook_initialized(&self, execution_id: Id) -> StoreResult<Option<flowline_core::event::Event>> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.execution_id == execution_id && e.name == EventName::PlaybookInitialized)
                .min_by_key(|e| e.event_id)
                .cloned())
        }

        async fn count_unmatched_issued(&self, execution_id: Id) -> StoreResult<Vec<String>> {
            let events = self.events.lock().unwrap();
            let issued: std::collections::HashSet<String> = events
                .iter()
                .filter(|e| e.execution_id == execution_id && e.name == EventName::CommandIssued)
                .filter_map(|e| e.step.clone())
                .collect();
            let exited: std::collections::HashSet<String> = events
                .iter()
                .filter(|e| e.execution_id == execution_id && e.name == EventName::StepExit)
                .filter_map(|e| e.step.clone())
                .collect();
            Ok(issued.difference(&exited).cloned().collect())
        }

        async fn find_stale_executions(&self, older_than: chrono::DateTime<chrono::Utc>) -> StoreResult<Vec<Id>> {
            let events = self.events.lock().unwrap();
            let mut ids: Vec<Id> = events
                .iter()
                .filter(|e| e.name == EventName::PlaybookInitialized && e.created_at < older_than)
                .filter(|e| {
                    !events.iter().any(|t| {
                        t.execution_id == e.execution_id
                            && matches!(
                                t.name,
                                EventName::PlaybookCompleted | EventName::PlaybookFailed | EventName::ExecutionCancelled
                            )
                    })
                })
                .map(|e| e.execution_id)
                .collect();
            ids.sort();
            ids.dedup();
            Ok(ids)
        }
    }

    #[derive(Default)]
    struct FakeVarStore {
        vars: StdMutex<Vec<(Id, String, Value)>>,
    }

    #[async_trait::async_trait]
    impl flowline_store::TransientVarStore for FakeVarStore {
        async fn set(
            &self,
            execution_id: Id,
            name: &str,
            value: Value,
            _kind: flowline_store::VarKind,
            _source_step: Option<&str>,
        ) -> StoreResult<()> {
            self.vars.lock().unwrap().push((execution_id, name.to_string(), value));
            Ok(())
        }

        async fn get(&self, execution_id: Id, name: &str) -> StoreResult<Option<flowline_store::TransientVar>> {
            Ok(self
                .vars
                .lock()
                .unwrap()
                .iter()
                .find(|(id, n, _)| *id == execution_id && n == name)
                .map(|(id, n, v)| flowline_store::TransientVar {
                    execution_id: *id,
                    name: n.clone(),
                    value: v.clone(),
                    kind: flowline_store::VarKind::StepResult,
                    source_step: None,
                    accessed_at: chrono::Utc::now(),
                    access_count: 0,
                }))
        }

        async fn list(&self, _execution_id: Id) -> StoreResult<Vec<flowline_store::TransientVar>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _execution_id: Id, _name: &str) -> StoreResult<()> {
            Ok(())
        }

        async fn cleanup(&self, _execution_id: Id) -> StoreResult<u64> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct FakeCommandStore {
        published: StdMutex<Vec<(Id, Command)>>,
    }

    #[async_trait::async_trait]
    impl CommandStore for FakeCommandStore {
        async fn publish(&self, command_id: Id, command: &Command) -> StoreResult<()> {
            self.published.lock().unwrap().push((command_id, command.clone()));
            Ok(())
        }

        async fn claim(&self, _worker_id: &str) -> StoreResult<Option<(Id, Command)>> {
            Ok(None)
        }

        async fn release_stale_leases(&self, _older_than_secs: i64) -> StoreResult<u64> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct NoopBus;

    #[async_trait::async_trait]
    impl NotificationPublisher for NoopBus {
        async fn publish(&self, _notification: &Notification) -> flowline_bus::BusResult<()> {
            Ok(())
        }
    }

    fn http_tool() -> ToolSpec {
        ToolSpec::Http { config: json!({}) }
    }

    fn plain_step(name: &str, next: Option<Next>) -> Step {
        Step {
            step: name.to_string(),
            loop_: None,
            tool: Some(http_tool()),
            args: HashMap::new(),
            set_ctx: HashMap::new(),
            next,
            output_select: Vec::new(),
        }
    }

    fn playbook(name: &str, workload: HashMap<String, Value>, workflow: Vec<Step>) -> Playbook {
        Playbook {
            metadata: PlaybookMetadata { name: name.into(), path: name.into() },
            api_version: "v1".into(),
            workload,
            final_step: workflow.last().map(|s| s.step.clone()),
            workflow,
            keychain: None,
            executor: None,
            catalog_id: None,
        }
    }

    async fn build_engine(pb: Playbook) -> (Engine, String) {
        let path = pb.metadata.path.clone();
        let sources = InMemoryPlaybookSource::new();
        sources.register(pb);
        let config = EngineConfig {
            database_url: String::new(),
            bus_url: String::new(),
            bus_subject: "flowline.commands".into(),
            bus_consumer: "flowline-worker-pool".into(),
            bus_max_in_flight: 64,
            loop_result_max_bytes: 65536,
            loop_result_preview_keys: 10,
            loop_result_preview_items: 10,
            taskseq_loop_repair_threshold: 5,
            pagination_max_pages: 100,
            state_cache_size: 100,
            state_cache_ttl: std::time::Duration::from_secs(60),
            playbook_cache_size: 100,
            playbook_cache_ttl: std::time::Duration::from_secs(60),
            template_cache_size: 100,
            http_bind_addr: "0.0.0.0:8080".parse().unwrap(),
        };
        let engine = Engine::new(
            Arc::new(FakeEventLog::new()),
            Arc::new(FakeCommandStore::default()),
            Arc::new(flowline_bus::LocalLoopKv::new()),
            Arc::new(NoopBus),
            Arc::new(sources),
            Arc::new(FakeVarStore::default()),
            &config,
            1,
            "http://coordinator.local",
        );
        (engine, path)
    }

    fn done_event(execution_id: Id, step: &str, name: EventName, result: Option<Value>) -> IncomingEvent {
        IncomingEvent {
            execution_id,
            step: Some(step.to_string()),
            name: Some(name),
            status: EventStatus2(EventStatus::Completed),
            result,
            error: None,
            worker_id: Some("worker-1".into()),
            duration_ms: Some(5),
            loop_event_id: None,
            loop_iteration_index: None,
        }
    }

    #[tokio::test]
    async fn linear_playbook_runs_to_completion() {
        let pb = playbook(
            "linear",
            HashMap::new(),
            vec![
                plain_step(
                    "start",
                    Some(Next {
                        spec: NextSpec { mode: NextMode::Exclusive },
                        arcs: vec![RouteArc { step: "finish".into(), when: None, args: HashMap::new() }],
                    }),
                ),
                plain_step("finish", None),
            ],
        );
        let (engine, path) = build_engine(pb).await;

        let (execution_id, issued) = engine
            .start_execution(PlaybookRef::Path(path), json!({}), None)
            .await
            .unwrap();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].command.step, "start");

        let issued = engine
            .handle_event(done_event(execution_id, "start", EventName::CallDone, Some(json!({"ok": true}))))
            .await
            .unwrap();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].command.step, "finish");

        engine
            .handle_event(done_event(execution_id, "start", EventName::StepExit, Some(json!({"ok": true}))))
            .await
            .unwrap();
        engine
            .handle_event(done_event(execution_id, "finish", EventName::CallDone, Some(json!({"done": true}))))
            .await
            .unwrap();
        let issued = engine
            .handle_event(done_event(execution_id, "finish", EventName::StepExit, Some(json!({"done": true}))))
            .await
            .unwrap();
        assert!(issued.is_empty());
    }

    #[tokio::test]
    async fn exclusive_when_clause_picks_one_branch() {
        let pb = playbook(
            "conditional",
            HashMap::from([("flag".to_string(), json!(true))]),
            vec![
                plain_step(
                    "start",
                    Some(Next {
                        spec: NextSpec { mode: NextMode::Exclusive },
                        arcs: vec![
                            RouteArc { step: "path_a".into(), when: Some("{{ flag }}".into()), args: HashMap::new() },
                            RouteArc { step: "path_b".into(), when: None, args: HashMap::new() },
                        ],
                    }),
                ),
                plain_step("path_a", None),
                plain_step("path_b", None),
            ],
        );
        let (engine, path) = build_engine(pb).await;

        let (execution_id, _) = engine
            .start_execution(PlaybookRef::Path(path), json!({}), None)
            .await
            .unwrap();

        let issued = engine
            .handle_event(done_event(execution_id, "start", EventName::CallDone, Some(json!({}))))
            .await
            .unwrap();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].command.step, "path_a");
    }

    #[tokio::test]
    async fn parallel_loop_respects_max_in_flight() {
        let mut loop_step = plain_step("fanout", None);
        loop_step.loop_ = Some(Loop {
            source: "{{ items }}".into(),
            iterator: "item".into(),
            mode: LoopMode::Parallel,
            spec: LoopSpec { max_in_flight: Some(2) },
        });
        let pb = playbook(
            "fanout",
            HashMap::from([("items".to_string(), json!([1, 2, 3, 4, 5]))]),
            vec![loop_step],
        );
        let (engine, path) = build_engine(pb).await;

        let (execution_id, issued) = engine
            .start_execution(PlaybookRef::Path(path), json!({}), None)
            .await
            .unwrap();
        assert_eq!(issued.len(), 2);
        assert!(issued.iter().all(|c| c.command.step == "fanout:task_sequence"
            || c.command.step == "fanout"));

        let mut remaining: std::collections::VecDeque<u32> = (0..5).collect();
        let mut in_flight = issued.len();
        while in_flight > 0 || !remaining.is_empty() {
            let issued = engine
                .handle_event(done_event(execution_id, "fanout", EventName::CallDone, Some(json!(remaining.pop_front()))))
                .await
                .unwrap();
            let new_issued = engine
                .handle_event(done_event(execution_id, "fanout", EventName::StepExit, Some(json!({}))))
                .await
                .unwrap();
            in_flight = in_flight - 1 + new_issued.len();
            let _ = issued;
        }
    }

    #[tokio::test]
    async fn task_sequence_pagination_reissues_until_exhausted() {
        let mut fetch_step = plain_step("fetch_all", None);
        fetch_step.tool = Some(ToolSpec::TaskSequence {
            tasks: vec![flowline_core::playbook::Task {
                name: "page".into(),
                tool: http_tool(),
                eval: Vec::new(),
            }],
        });
        let pb = playbook("paged", HashMap::new(), vec![fetch_step]);
        let (engine, path) = build_engine(pb).await;
        let (execution_id, issued) = engine
            .start_execution(PlaybookRef::Path(path), json!({}), None)
            .await
            .unwrap();
        assert_eq!(issued.len(), 1);

        let page_one = done_event(
            execution_id,
            "fetch_all:task_sequence",
            EventName::CallDone,
            Some(json!({ "pagination": { "page": [1, 2], "has_next": true } })),
        );
        let issued = engine.handle_event(page_one).await.unwrap();
        assert_eq!(issued.len(), 1, "pagination reissues the task sequence for the next page");

        let page_two = done_event(
            execution_id,
            "fetch_all:task_sequence",
            EventName::CallDone,
            Some(json!({ "pagination": { "page": [3], "has_next": false } })),
        );
        let issued = engine.handle_event(page_two).await.unwrap();
        assert!(issued.is_empty(), "final page completes the step instead of reissuing");
    }
}
