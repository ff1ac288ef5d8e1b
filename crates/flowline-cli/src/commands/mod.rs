//! CLI command implementations: thin wrappers over the HTTP façade
//! (§6) — this binary carries no engine logic of its own.

pub mod executions;
pub mod vars;

use anyhow::{bail, Context, Result};
use serde_json::Value;

pub(crate) async fn post(api_url: &str, path: &str, body: Value) -> Result<Value> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{api_url}{path}"))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("POST {path}"))?;
    handle_response(resp).await
}

pub(crate) async fn get(api_url: &str, path: &str) -> Result<Value> {
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{api_url}{path}"))
        .send()
        .await
        .with_context(|| format!("GET {path}"))?;
    handle_response(resp).await
}

pub(crate) async fn delete(api_url: &str, path: &str) -> Result<Value> {
    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("{api_url}{path}"))
        .send()
        .await
        .with_context(|| format!("DELETE {path}"))?;
    handle_response(resp).await
}

async fn handle_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("request failed")
            .to_string();
        bail!("{status}: {message}");
    }
    Ok(body)
}
