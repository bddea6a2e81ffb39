use anyhow::{anyhow, Context, Result};
use std::env;

/// Persistence backend selection. The dialect seam is enumerated here; this
/// build wires the SQLite backend and rejects `postgres` at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Sqlite,
    Postgres,
}

impl std::str::FromStr for DbType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(DbType::Sqlite),
            "postgres" | "postgresql" => Ok(DbType::Postgres),
            other => Err(anyhow!("DB_TYPE must be sqlite or postgres, got {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub development: bool,
    pub cors_origins: Vec<String>,

    pub db_type: DbType,
    pub database_url: String,

    pub node_auth_tokens: Vec<String>,
    pub operator_tokens: Vec<String>,
    pub admin_tokens: Vec<String>,

    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_ttl_seconds: u64,

    pub ws_require_tls: bool,
    pub ws_allow_query_token_auth: bool,
    pub ws_session_token_secrets: Vec<String>,
    pub ws_session_token_issuer: String,
    pub ws_session_token_audience: String,
    pub ws_session_token_ttl_seconds: u64,
    pub ws_message_rate_limit_per_second: u32,
    pub ws_max_connections_per_ip: u32,

    pub node_heartbeat_interval_ms: u64,
    pub node_timeout_ms: u64,

    pub command_timeout_ms: u64,
    pub command_retention_days: i64,
    /// Retryable failures (transport send errors) are re-enqueued with
    /// `command_retry_base_delay_ms * 2^attempts` until this cap. The
    /// non-retryable set is fixed: `node_offline` past the offline TTL,
    /// validation failures, unsupported commands, and node error codes in
    /// the denylist (see services::commands).
    pub command_max_retries: u32,
    pub command_retry_base_delay_ms: u64,
    pub offline_command_ttl_ms: u64,

    pub schedule_worker_enabled: bool,
    pub schedule_poll_interval_ms: u64,
    pub schedule_batch_size: u32,

    pub webhook_retry_base_delay_ms: u64,
    pub webhook_delivery_timeout_ms: u64,

    pub host_status_history_retention_days: i64,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let port = env_u64("PORT", Some(8080))? as u16;
        let development = env_string("NODE_ENV", Some("production".to_string()))? != "production";
        let cors_origins = env_list("CORS_ORIGINS");

        let db_type: DbType = env_string("DB_TYPE", Some("sqlite".to_string()))?.parse()?;
        let database_url = env_string("DATABASE_URL", Some("sqlite://woly.db".to_string()))?;
        if db_type == DbType::Postgres {
            anyhow::bail!(
                "DB_TYPE=postgres is not wired in this build; use DB_TYPE=sqlite with a sqlite:// DATABASE_URL"
            );
        }
        if !database_url.starts_with("sqlite:") {
            anyhow::bail!("DATABASE_URL must use the sqlite:// scheme when DB_TYPE=sqlite");
        }

        let node_auth_tokens = env_list("NODE_AUTH_TOKENS");
        let operator_tokens = env_list("OPERATOR_TOKENS");
        let admin_tokens = env_list("ADMIN_TOKENS");

        let jwt_secret = env_string("JWT_SECRET", None).context(
            "JWT_SECRET must be set; operator authentication cannot run without a signing key",
        )?;
        if jwt_secret.len() < 16 {
            anyhow::bail!("JWT_SECRET must be at least 16 characters");
        }
        let jwt_issuer = env_string("JWT_ISSUER", Some("woly-server".to_string()))?;
        let jwt_audience = env_string("JWT_AUDIENCE", Some("woly-api".to_string()))?;
        let jwt_ttl_seconds = env_u64("JWT_TTL_SECONDS", Some(3600))?;
        if jwt_ttl_seconds == 0 {
            anyhow::bail!("JWT_TTL_SECONDS must be greater than zero");
        }

        let ws_require_tls = env_bool("WS_REQUIRE_TLS", false)?;
        let ws_allow_query_token_auth = env_bool("WS_ALLOW_QUERY_TOKEN_AUTH", false)?;
        let ws_session_token_secrets = env_list("WS_SESSION_TOKEN_SECRETS");
        let ws_session_token_issuer =
            env_string("WS_SESSION_TOKEN_ISSUER", Some("woly-server".to_string()))?;
        let ws_session_token_audience =
            env_string("WS_SESSION_TOKEN_AUDIENCE", Some("woly-node".to_string()))?;
        let ws_session_token_ttl_seconds = env_u64("WS_SESSION_TOKEN_TTL_SECONDS", Some(900))?;
        if ws_session_token_ttl_seconds == 0 {
            anyhow::bail!("WS_SESSION_TOKEN_TTL_SECONDS must be greater than zero");
        }
        let ws_message_rate_limit_per_second =
            env_u64("WS_MESSAGE_RATE_LIMIT_PER_SECOND", Some(20))? as u32;
        if ws_message_rate_limit_per_second == 0 {
            anyhow::bail!("WS_MESSAGE_RATE_LIMIT_PER_SECOND must be greater than zero");
        }
        let ws_max_connections_per_ip = env_u64("WS_MAX_CONNECTIONS_PER_IP", Some(8))? as u32;
        if ws_max_connections_per_ip == 0 {
            anyhow::bail!("WS_MAX_CONNECTIONS_PER_IP must be greater than zero");
        }

        let node_heartbeat_interval_ms = env_u64("NODE_HEARTBEAT_INTERVAL", Some(30_000))?;
        if node_heartbeat_interval_ms < 1000 {
            anyhow::bail!("NODE_HEARTBEAT_INTERVAL must be at least 1000ms");
        }
        let node_timeout_ms = env_u64("NODE_TIMEOUT", Some(90_000))?;
        if node_timeout_ms < 2 * node_heartbeat_interval_ms {
            anyhow::bail!(
                "NODE_TIMEOUT ({node_timeout_ms}ms) must be at least twice NODE_HEARTBEAT_INTERVAL ({node_heartbeat_interval_ms}ms)"
            );
        }

        let command_timeout_ms = env_u64("COMMAND_TIMEOUT", Some(30_000))?;
        if command_timeout_ms == 0 {
            anyhow::bail!("COMMAND_TIMEOUT must be greater than zero");
        }
        let command_retention_days = env_i64("COMMAND_RETENTION_DAYS", Some(7))?;
        let command_max_retries = env_u64("COMMAND_MAX_RETRIES", Some(3))? as u32;
        let command_retry_base_delay_ms = env_u64("COMMAND_RETRY_BASE_DELAY_MS", Some(1000))?;
        let offline_command_ttl_ms = env_u64("OFFLINE_COMMAND_TTL_MS", Some(300_000))?;

        let schedule_worker_enabled = env_bool("SCHEDULE_WORKER_ENABLED", true)?;
        let schedule_poll_interval_ms = env_u64("SCHEDULE_POLL_INTERVAL_MS", Some(30_000))?;
        if schedule_poll_interval_ms == 0 {
            anyhow::bail!("SCHEDULE_POLL_INTERVAL_MS must be greater than zero");
        }
        let schedule_batch_size = env_u64("SCHEDULE_BATCH_SIZE", Some(20))? as u32;
        if schedule_batch_size == 0 {
            anyhow::bail!("SCHEDULE_BATCH_SIZE must be greater than zero");
        }

        let webhook_retry_base_delay_ms = env_u64("WEBHOOK_RETRY_BASE_DELAY_MS", Some(1000))?;
        let webhook_delivery_timeout_ms = env_u64("WEBHOOK_DELIVERY_TIMEOUT_MS", Some(5000))?;
        if webhook_delivery_timeout_ms == 0 {
            anyhow::bail!("WEBHOOK_DELIVERY_TIMEOUT_MS must be greater than zero");
        }

        let host_status_history_retention_days =
            env_i64("HOST_STATUS_HISTORY_RETENTION_DAYS", Some(30))?;
        if host_status_history_retention_days < 0 {
            anyhow::bail!("HOST_STATUS_HISTORY_RETENTION_DAYS must not be negative");
        }

        Ok(Self {
            port,
            development,
            cors_origins,
            db_type,
            database_url,
            node_auth_tokens,
            operator_tokens,
            admin_tokens,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            jwt_ttl_seconds,
            ws_require_tls,
            ws_allow_query_token_auth,
            ws_session_token_secrets,
            ws_session_token_issuer,
            ws_session_token_audience,
            ws_session_token_ttl_seconds,
            ws_message_rate_limit_per_second,
            ws_max_connections_per_ip,
            node_heartbeat_interval_ms,
            node_timeout_ms,
            command_timeout_ms,
            command_retention_days,
            command_max_retries,
            command_retry_base_delay_ms,
            offline_command_ttl_ms,
            schedule_worker_enabled,
            schedule_poll_interval_ms,
            schedule_batch_size,
            webhook_retry_base_delay_ms,
            webhook_delivery_timeout_ms,
            host_status_history_retention_days,
        })
    }

    /// Secrets used for WS session tokens; falls back to the JWT secret when
    /// no rotation list is configured.
    pub fn session_token_secrets(&self) -> Vec<String> {
        if self.ws_session_token_secrets.is_empty() {
            vec![self.jwt_secret.clone()]
        } else {
            self.ws_session_token_secrets.clone()
        }
    }
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

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}: {value:?} is not a non-negative integer")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_i64(key: &str, default: Option<i64>) -> Result<i64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<i64>()
            .with_context(|| format!("invalid {key}: {value:?} is not an integer")),
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
mod tests {
    use super::*;

    // Env-var based tests mutate process state; keep them on distinct keys
    // and avoid the shared ones used by from_env.

    #[test]
    fn db_type_parses_known_values() {
        assert_eq!("sqlite".parse::<DbType>().unwrap(), DbType::Sqlite);
        assert_eq!("PostgreSQL".parse::<DbType>().unwrap(), DbType::Postgres);
        assert!("mysql".parse::<DbType>().is_err());
    }

    #[test]
    fn env_u64_rejects_non_numeric() {
        env::set_var("WOLY_TEST_U64", "abc");
        assert!(env_u64("WOLY_TEST_U64", Some(1)).is_err());
        env::set_var("WOLY_TEST_U64", "1.5");
        assert!(env_u64("WOLY_TEST_U64", Some(1)).is_err());
        env::set_var("WOLY_TEST_U64", "42");
        assert_eq!(env_u64("WOLY_TEST_U64", Some(1)).unwrap(), 42);
        env::remove_var("WOLY_TEST_U64");
    }

    #[test]
    fn env_bool_rejects_garbage() {
        env::set_var("WOLY_TEST_BOOL", "maybe");
        assert!(env_bool("WOLY_TEST_BOOL", false).is_err());
        env::set_var("WOLY_TEST_BOOL", "yes");
        assert!(env_bool("WOLY_TEST_BOOL", false).unwrap());
        env::remove_var("WOLY_TEST_BOOL");
    }

    #[test]
    fn env_list_splits_and_trims() {
        env::set_var("WOLY_TEST_LIST", " a , b ,, c ");
        assert_eq!(env_list("WOLY_TEST_LIST"), vec!["a", "b", "c"]);
        env::remove_var("WOLY_TEST_LIST");
    }

    #[test]
    fn session_secrets_fall_back_to_jwt_secret() {
        let config = crate::test_support::test_config();
        assert_eq!(
            config.session_token_secrets(),
            vec!["test-secret-0123456789"]
        );
    }

    // The only test that calls from_env; it owns the process-wide env keys.
    #[test]
    fn startup_fails_when_node_timeout_undercuts_heartbeat() {
        env::set_var("JWT_SECRET", "startup-test-secret-0123456789");
        env::set_var("NODE_HEARTBEAT_INTERVAL", "30000");
        env::set_var("NODE_TIMEOUT", "45000");

        let err = ServerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("NODE_TIMEOUT"));

        env::set_var("NODE_TIMEOUT", "90000");
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.node_timeout_ms, 90_000);
        assert_eq!(config.node_heartbeat_interval_ms, 30_000);

        // Strict numeric parsing: a garbage value fails startup outright.
        env::set_var("COMMAND_TIMEOUT", "soon");
        assert!(ServerConfig::from_env().is_err());

        for key in [
            "JWT_SECRET",
            "NODE_HEARTBEAT_INTERVAL",
            "NODE_TIMEOUT",
            "COMMAND_TIMEOUT",
        ] {
            env::remove_var(key);
        }
    }
}
