//! Pluggable tool adapters. Individual backends (HTTP, Postgres, DuckDB,
//! Python) are boundary-only here: they define the contract the executor
//! dispatches against, not fully worked-out client implementations, same
//! as the keychain boundary in `flowline-core::secret`.

use async_trait::async_trait;
use flowline_core::error::TaskError;
use serde_json::Value;

#[async_trait]
pub trait Tool: Send + Sync {
    /// Run the tool's call against `config` (the playbook-authored tool
    /// spec body) merged with the rendered `args` for this invocation.
    async fn call(&self, config: &Value, args: &Value) -> Result<Value, TaskError>;
}

/// Resolves an HTTP request description (`{method, url, headers?, body?}`)
/// against a real client. Connection handling lives in the adapter crate
/// an operator wires in; this default errors rather than silently no-op.
pub struct HttpTool {
    client: reqwest::Client,
}

impl Default for HttpTool {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl Tool for HttpTool {
    async fn call(&self, config: &Value, _args: &Value) -> Result<Value, TaskError> {
        let method = config.get("method").and_then(Value::as_str).unwrap_or("GET").to_uppercase();
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::new(flowline_core::error::ErrorKind::ClientError, "HTTP_MISSING_URL", "tool config missing 'url'", "http"))?;

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| TaskError::new(flowline_core::error::ErrorKind::ClientError, "HTTP_BAD_METHOD", format!("unsupported method {method}"), "http"))?;

        let mut request = self.client.request(method, url);
        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    request = request.header(k, v);
                }
            }
        }
        if let Some(body) = config.get("body") {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TaskError::new(flowline_core::error::ErrorKind::Timeout, "HTTP_TIMEOUT", e.to_string(), "http")
            } else {
                TaskError::new(flowline_core::error::ErrorKind::Connection, "HTTP_CONNECT", e.to_string(), "http")
            }
        })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(TaskError::from_http_status(status, body));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| TaskError::new(flowline_core::error::ErrorKind::Parse, "HTTP_BAD_BODY", e.to_string(), "http"))
    }
}

/// Postgres/DuckDB/Python adapters are out of scope (§1 Non-goals): this
/// crate defines where they plug in, not how they run. Each stub fails
/// fast with a classified, non-retryable error rather than panicking.
macro_rules! unimplemented_tool {
    ($name:ident, $source:literal) => {
        #[derive(Default)]
        pub struct $name;

        #[async_trait]
        impl Tool for $name {
            async fn call(&self, _config: &Value, _args: &Value) -> Result<Value, TaskError> {
                Err(TaskError::new(
                    flowline_core::error::ErrorKind::Unknown,
                    concat!(stringify!($name), "_UNCONFIGURED"),
                    concat!($source, " adapter is not wired into this deployment"),
                    $source,
                ))
            }
        }
    };
}

unimplemented_tool!(PostgresTool, "postgres");
unimplemented_tool!(DuckdbTool, "duckdb");
unimplemented_tool!(PythonTool, "python");

/// Dispatch a `ToolSpec` leaf (never `TaskSequence`, which the sequence
/// runner unrolls itself) to its adapter.
pub async fn dispatch(tool: &flowline_core::playbook::ToolSpec, args: &Value) -> Result<Value, TaskError> {
    use flowline_core::playbook::ToolSpec;
    match tool {
        ToolSpec::Http { config } => HttpTool::default().call(config, args).await,
        ToolSpec::Postgres { config } => PostgresTool.call(config, args).await,
        ToolSpec::Duckdb { config } => DuckdbTool.call(config, args).await,
        ToolSpec::Python { config } => PythonTool.call(config, args).await,
        ToolSpec::Workbook { name } => Err(TaskError::new(
            flowline_core::error::ErrorKind::Unknown,
            "WORKBOOK_UNRESOLVED",
            format!("workbook task '{name}' has no resolvable tool"),
            "workbook",
        )),
        ToolSpec::Playbook { .. } => Err(TaskError::new(
            flowline_core::error::ErrorKind::Unknown,
            "SUBPLAYBOOK_UNSUPPORTED",
            "sub-playbook invocation is a coordinator-side concern, not a worker tool",
            "playbook",
        )),
        ToolSpec::TaskSequence { .. } => unreachable!("task sequences are unrolled by the sequence runner"),
    }
}
