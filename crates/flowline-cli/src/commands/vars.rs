//! `vars` — inspect and mutate transient execution variables through
//! the coordinator's façade (§4.9); this CLI never touches the store.

use anyhow::Result;
use serde_json::{json, Value};

use super::{delete, get, post};

pub async fn list(api_url: &str, execution_id: &str) -> Result<()> {
    let resp = get(api_url, &format!("/vars/{execution_id}")).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

pub async fn get_var(api_url: &str, execution_id: &str, name: &str) -> Result<()> {
    let resp = get(api_url, &format!("/vars/{execution_id}/{name}")).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

pub async fn set_var(api_url: &str, execution_id: &str, name: &str, value: Value) -> Result<()> {
    let resp = post(api_url, &format!("/vars/{execution_id}/{name}"), json!({ "value": value })).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

pub async fn delete_var(api_url: &str, execution_id: &str, name: &str) -> Result<()> {
    let resp = delete(api_url, &format!("/vars/{execution_id}/{name}")).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}
