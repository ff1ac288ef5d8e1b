//! The worker's claim-execute-report loop: wakes on a bus notification,
//! claims the named command from the store, runs it, and reports back
//! through the coordinator's HTTP façade (§4.8, §5).

use std::time::Instant;

use flowline_bus::{Notification, NatsNotificationBus};
use flowline_core::command::Command;
use flowline_core::playbook::ToolSpec;
use flowline_render::TemplateRenderer;
use flowline_store::CommandStore;
use serde_json::Value;

use crate::client::CoordinatorClient;
use crate::{sequence, tool};

pub struct Worker {
    worker_id: String,
    command_store: std::sync::Arc<dyn CommandStore>,
    renderer: TemplateRenderer,
}

impl Worker {
    pub fn new(worker_id: impl Into<String>, command_store: std::sync::Arc<dyn CommandStore>, template_cache_size: u64) -> Self {
        Self {
            worker_id: worker_id.into(),
            command_store,
            renderer: TemplateRenderer::new(template_cache_size),
        }
    }

    /// Drive the bus's fetch-and-dispatch loop, claiming and running one
    /// command per notification. Returns `true` (ack) unless the claim
    /// itself failed transiently, in which case the bus redelivers.
    pub async fn run(&self, bus: &NatsNotificationBus) -> flowline_bus::BusResult<()> {
        bus.run(16, |notification: Notification| async move {
            let coordinator = CoordinatorClient::new(notification.server_url.clone(), self.worker_id.clone());
            match self.command_store.claim(&self.worker_id).await {
                Ok(Some((_command_id, command))) => {
                    self.execute(command, &coordinator).await;
                    true
                }
                Ok(None) => true, // already claimed by another worker; nothing to do
                Err(e) => {
                    tracing::warn!(error = %e, "command claim failed");
                    false
                }
            }
        })
        .await
    }

    async fn execute(&self, command: Command, coordinator: &CoordinatorClient) {
        match coordinator.check_cancelled(command.execution_id).await {
            Ok(true) => {
                tracing::info!(execution_id = %command.execution_id, step = %command.step, "execution cancelled, dropping command");
                return;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, execution_id = %command.execution_id, "cancellation check failed, proceeding anyway"),
        }

        let mut context = command.render_context_snapshot.clone();
        if let (Value::Object(ctx), args) = (&mut context, &command.args) {
            for (k, v) in args {
                ctx.insert(k.clone(), v.clone());
            }
        }

        if let Err(e) = coordinator.emit_step_enter(command.execution_id, &command.step).await {
            tracing::warn!(error = %e, execution_id = %command.execution_id, step = %command.step, "failed to report step.enter");
        }

        let started = Instant::now();
        if let ToolSpec::TaskSequence { tasks } = &command.tool {
            let result = sequence::run(&self.renderer, tasks, context, Default::default(), Default::default()).await;
            let duration_ms = started.elapsed().as_millis() as i64;
            let report = match result.status {
                sequence::SequenceStatus::Failed => {
                    let error = result.error.clone().map(|e| serde_json::to_value(e).unwrap_or(Value::Null)).unwrap_or(Value::Null);
                    coordinator.emit_call_error(command.execution_id, &command.step, error, duration_ms).await
                }
                _ => coordinator.emit_call_done(command.execution_id, &command.step, result.to_call_done_body(), duration_ms).await,
            };
            if let Err(e) = report {
                tracing::error!(error = %e, execution_id = %command.execution_id, step = %command.step, "failed to report task-sequence outcome");
            }
            return;
        }

        let rendered_tool = match render_tool(&self.renderer, &command.tool, &context) {
            Ok(t) => t,
            Err(error) => {
                let duration_ms = started.elapsed().as_millis() as i64;
                let _ = coordinator
                    .emit_call_error(command.execution_id, &command.step, serde_json::to_value(error).unwrap_or(Value::Null), duration_ms)
                    .await;
                return;
            }
        };

        // Plain (non-task-sequence) tools retry locally per the command's
        // own policy; `attempt` is 1-based to match `RetryBackoff::delay_for_attempt`,
        // distinct from `Command.attempt`'s 0-based coordinator bookkeeping.
        let mut attempt = 1u32;
        let (call_result, duration_ms) = loop {
            let started = Instant::now();
            let call_result = tool::dispatch(&rendered_tool, &context).await;
            let duration_ms = started.elapsed().as_millis() as i64;

            let Err(error) = &call_result else {
                break (call_result, duration_ms);
            };
            if attempt >= command.max_attempts.max(1) {
                break (call_result, duration_ms);
            }

            let delay = command.retry_backoff.delay_for_attempt(command.retry_delay, attempt);
            if let Err(e) = coordinator
                .emit_call_error_attempt(command.execution_id, &command.step, serde_json::to_value(error).unwrap_or(Value::Null), duration_ms)
                .await
            {
                tracing::warn!(error = %e, execution_id = %command.execution_id, step = %command.step, "failed to report retry attempt");
            }
            if delay > 0.0 {
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
            }
            attempt += 1;
        };

        let report = match call_result {
            Ok(value) => coordinator.emit_call_done(command.execution_id, &command.step, value, duration_ms).await,
            Err(error) => {
                coordinator
                    .emit_call_error(command.execution_id, &command.step, serde_json::to_value(error).unwrap_or(Value::Null), duration_ms)
                    .await
            }
        };
        if let Err(e) = report {
            tracing::error!(error = %e, execution_id = %command.execution_id, step = %command.step, "failed to report tool outcome");
        }
    }
}

fn render_tool(renderer: &TemplateRenderer, tool: &ToolSpec, context: &Value) -> Result<ToolSpec, flowline_core::error::TaskError> {
    use flowline_core::error::{ErrorKind, TaskError};
    let render = |config: &Value| -> Result<Value, TaskError> {
        renderer
            .render_value(config, context)
            .map_err(|e| TaskError::new(ErrorKind::Transform, "TEMPLATE_ERROR", e.to_string(), "renderer"))
    };
    Ok(match tool {
        ToolSpec::Http { config } => ToolSpec::Http { config: render(config)? },
        ToolSpec::Postgres { config } => ToolSpec::Postgres { config: render(config)? },
        ToolSpec::Duckdb { config } => ToolSpec::Duckdb { config: render(config)? },
        ToolSpec::Python { config } => ToolSpec::Python { config: render(config)? },
        other => other.clone(),
    })
}
