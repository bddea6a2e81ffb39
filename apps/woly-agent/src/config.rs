use anyhow::{anyhow, Context, Result};
use std::env;
use url::Url;

/// Seconds subtracted from a session token's lifetime to get the refresh
/// deadline.
pub const REFRESH_BUFFER_SECONDS: u64 = 60;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub http_bind: String,
    pub node_id: String,
    pub node_name: String,
    pub location: String,

    /// C&C WebSocket URL (`ws://…/ws/node`). Absent = standalone mode: the
    /// agent serves its local API and scans, but never dials out.
    pub cnc_url: Option<String>,
    pub node_auth_token: Option<String>,
    /// When set, the agent mints short-lived session tokens here instead of
    /// presenting the static token on upgrades.
    pub session_token_url: Option<String>,

    pub reconnect_interval_ms: u64,
    /// 0 = retry forever.
    pub max_reconnect_attempts: u32,

    pub scan_interval_ms: u64,
    pub db_path: String,
    pub seed_path: Option<String>,

    pub api_key: Option<String>,
    pub cors_origins: Vec<String>,
    pub dev_cors: bool,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let port = env_u64("WOLY_AGENT_PORT", Some(8081))? as u16;
        let http_bind = env_string("WOLY_AGENT_BIND", Some(format!("0.0.0.0:{port}")))?;

        let node_name = env_string(
            "WOLY_NODE_NAME",
            Some(
                hostname_fallback().unwrap_or_else(|| "woly-node".to_string()),
            ),
        )?;
        let node_id = env_string("WOLY_NODE_ID", Some(node_name.clone()))?;
        let location = env_string("WOLY_NODE_LOCATION", Some(node_name.clone()))?;

        let cnc_url = env_optional("WOLY_CNC_URL");
        if let Some(url) = cnc_url.as_deref() {
            let parsed = Url::parse(url).context("invalid WOLY_CNC_URL")?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                anyhow::bail!("WOLY_CNC_URL must use the ws:// or wss:// scheme");
            }
        }
        let node_auth_token = env_optional("WOLY_NODE_AUTH_TOKEN");
        if cnc_url.is_some() && node_auth_token.is_none() {
            anyhow::bail!("WOLY_NODE_AUTH_TOKEN must be set when WOLY_CNC_URL is configured");
        }
        let session_token_url = env_optional("WOLY_SESSION_TOKEN_URL");
        if let Some(url) = session_token_url.as_deref() {
            Url::parse(url).context("invalid WOLY_SESSION_TOKEN_URL")?;
        }

        let reconnect_interval_ms = env_u64("WOLY_RECONNECT_INTERVAL_MS", Some(5000))?;
        if reconnect_interval_ms == 0 {
            anyhow::bail!("WOLY_RECONNECT_INTERVAL_MS must be greater than zero");
        }
        let max_reconnect_attempts = env_u64("WOLY_MAX_RECONNECT_ATTEMPTS", Some(0))? as u32;

        let scan_interval_ms = env_u64("WOLY_SCAN_INTERVAL_MS", Some(300_000))?;
        if scan_interval_ms < 10_000 {
            anyhow::bail!("WOLY_SCAN_INTERVAL_MS must be at least 10000ms");
        }

        let db_path = env_string("WOLY_DB_PATH", Some("sqlite://woly-agent.db".to_string()))?;
        let seed_path = env_optional("WOLY_SEED_PATH");

        let api_key = env_optional("NODE_API_KEY");
        let cors_origins = env_list("CORS_ORIGINS");
        let dev_cors = env_bool("WOLY_DEV_CORS", false)?;

        Ok(Self {
            http_bind,
            node_id,
            node_name,
            location,
            cnc_url,
            node_auth_token,
            session_token_url,
            reconnect_interval_ms,
            max_reconnect_attempts,
            scan_interval_ms,
            db_path,
            seed_path,
            api_key,
            cors_origins,
            dev_cors,
        })
    }
}

fn hostname_fallback() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                default.ok_or_else(|| anyhow!("{key} is set but empty"))
            } else {
                Ok(trimmed)
            }
        }
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}: {value:?} is not a non-negative integer")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(anyhow!("invalid {key}: {other:?} is not a boolean")),
        },
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
pub fn test_config() -> AgentConfig {
    AgentConfig {
        http_bind: "127.0.0.1:0".to_string(),
        node_id: "home".to_string(),
        node_name: "home".to_string(),
        location: "home".to_string(),
        cnc_url: None,
        node_auth_token: Some("node-token".to_string()),
        session_token_url: None,
        reconnect_interval_ms: 50,
        max_reconnect_attempts: 1,
        scan_interval_ms: 300_000,
        db_path: "sqlite::memory:".to_string(),
        seed_path: None,
        api_key: None,
        cors_origins: Vec::new(),
        dev_cors: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_u64_rejects_non_numeric() {
        env::set_var("WOLY_AGENT_TEST_U64", "five");
        assert!(env_u64("WOLY_AGENT_TEST_U64", Some(1)).is_err());
        env::remove_var("WOLY_AGENT_TEST_U64");
    }

    #[test]
    fn env_list_splits_origins() {
        env::set_var("WOLY_AGENT_TEST_LIST", "https://a.example, https://b.example");
        assert_eq!(
            env_list("WOLY_AGENT_TEST_LIST"),
            vec!["https://a.example", "https://b.example"]
        );
        env::remove_var("WOLY_AGENT_TEST_LIST");
    }
}
