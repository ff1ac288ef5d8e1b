//! `submit`/`show`/`cancel`/`logs` — execution lifecycle commands.

use anyhow::Result;
use serde_json::{json, Value};

use super::{get, post};

pub async fn submit(api_url: &str, playbook_path: Option<String>, catalog_id: Option<String>, payload: Value) -> Result<()> {
    let mut body = json!({ "payload": payload });
    if let Some(id) = catalog_id {
        body["catalog_id"] = json!(id);
    } else if let Some(path) = playbook_path {
        body["playbook_path"] = json!(path);
    } else {
        anyhow::bail!("either a playbook path or --catalog-id is required");
    }
    let resp = post(api_url, "/executions", body).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

pub async fn show(api_url: &str, id: &str, page: i64, page_size: i64, since_event_id: Option<String>, event_type: Option<String>) -> Result<()> {
    let mut query = format!("?page={page}&page_size={page_size}");
    if let Some(since) = since_event_id {
        query.push_str(&format!("&since_event_id={since}"));
    }
    if let Some(ty) = event_type {
        query.push_str(&format!("&event_type={ty}"));
    }
    let resp = get(api_url, &format!("/executions/{id}{query}")).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

pub async fn logs(api_url: &str, id: &str, follow: bool) -> Result<()> {
    let mut since_event_id: Option<String> = None;
    loop {
        let mut path = format!("/executions/{id}?page=1&page_size=500");
        if let Some(since) = &since_event_id {
            path.push_str(&format!("&since_event_id={since}"));
        }
        let resp = get(api_url, &path).await?;
        let events = resp.get("events").and_then(|e| e.as_array()).cloned().unwrap_or_default();
        for event in &events {
            println!("{}", serde_json::to_string(event)?);
            if let Some(id) = event.get("event_id").and_then(|v| v.as_str()) {
                since_event_id = Some(id.to_string());
            }
        }
        if !follow {
            break;
        }
        if events.is_empty() {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
    }
    Ok(())
}

pub async fn cancel(api_url: &str, id: &str) -> Result<()> {
    let resp = post(api_url, &format!("/executions/{id}/cancel"), json!({})).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}
