//! Typed configuration loaded from environment variables, per binary.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> ConfigResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("could not parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

/// Knobs shared by the coordinator and worker binaries.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub bus_url: String,
    pub bus_subject: String,
    pub bus_consumer: String,
    pub bus_max_in_flight: i64,
    pub loop_result_max_bytes: usize,
    pub loop_result_preview_keys: usize,
    pub loop_result_preview_items: usize,
    pub taskseq_loop_repair_threshold: u32,
    pub pagination_max_pages: u32,
    pub state_cache_size: u64,
    pub state_cache_ttl: Duration,
    pub playbook_cache_size: u64,
    pub playbook_cache_ttl: Duration,
    pub template_cache_size: u64,
    pub http_bind_addr: SocketAddr,
}

impl EngineConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").map_err(|_| ConfigError::InvalidValue {
                field: "DATABASE_URL".into(),
                message: "not set".into(),
            })?,
            bus_url: env_or("FLOWLINE_BUS_URL", "nats://127.0.0.1:4222"),
            bus_subject: env_or("FLOWLINE_BUS_SUBJECT", "flowline.commands"),
            bus_consumer: env_or("FLOWLINE_BUS_CONSUMER", "flowline-worker-pool"),
            bus_max_in_flight: env_parsed("FLOWLINE_BUS_MAX_IN_FLIGHT", 64)?,
            loop_result_max_bytes: env_parsed("FLOWLINE_LOOP_RESULT_MAX_BYTES", 65536)?,
            loop_result_preview_keys: env_parsed("FLOWLINE_LOOP_RESULT_PREVIEW_KEYS", 10)?,
            loop_result_preview_items: env_parsed("FLOWLINE_LOOP_RESULT_PREVIEW_ITEMS", 10)?,
            taskseq_loop_repair_threshold: env_parsed("FLOWLINE_TASKSEQ_LOOP_REPAIR_THRESHOLD", 5)?,
            pagination_max_pages: env_parsed("FLOWLINE_PAGINATION_MAX_PAGES", 100)?,
            state_cache_size: env_parsed("FLOWLINE_STATE_CACHE_SIZE", 1000)?,
            state_cache_ttl: Duration::from_secs(env_parsed("FLOWLINE_STATE_CACHE_TTL_SECS", 3600)?),
            playbook_cache_size: env_parsed("FLOWLINE_PLAYBOOK_CACHE_SIZE", 500)?,
            playbook_cache_ttl: Duration::from_secs(env_parsed("FLOWLINE_PLAYBOOK_CACHE_TTL_SECS", 1800)?),
            template_cache_size: env_parsed("FLOWLINE_TEMPLATE_CACHE_SIZE", 500)?,
            http_bind_addr: env_or("HTTP_BIND_ADDR", "0.0.0.0:8080")
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "HTTP_BIND_ADDR".into(),
                    message: "not a valid socket address".into(),
                })?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_default_when_unset() {
        unsafe {
            std::env::remove_var("FLOWLINE_TEST_KNOB");
        }
        assert_eq!(env_or("FLOWLINE_TEST_KNOB", "fallback"), "fallback");
    }

    #[test]
    fn env_parsed_rejects_unparseable_values() {
        unsafe {
            std::env::set_var("FLOWLINE_TEST_NUM", "not-a-number");
        }
        let result: ConfigResult<u32> = env_parsed("FLOWLINE_TEST_NUM", 1);
        assert!(result.is_err());
        unsafe {
            std::env::remove_var("FLOWLINE_TEST_NUM");
        }
    }
}
