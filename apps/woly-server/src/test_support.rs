use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use woly_proto::{HostStatus, WireHost};

use crate::auth::session_tokens::SessionTokenService;
use crate::auth::JwtAuth;
use crate::config::{DbType, ServerConfig};
use crate::events::NodeEvent;
use crate::services::aggregator::HostAggregator;
use crate::services::commands::CommandRouter;
use crate::services::session::SessionManager;
use crate::services::webhooks::WebhookDispatcher;
use crate::state::{AppState, ScanTracker};

pub fn test_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        development: true,
        cors_origins: Vec::new(),
        db_type: DbType::Sqlite,
        database_url: "sqlite::memory:".to_string(),
        node_auth_tokens: vec!["node-token".to_string()],
        operator_tokens: vec!["operator-token".to_string()],
        admin_tokens: vec!["admin-token".to_string()],
        jwt_secret: "test-secret-0123456789".to_string(),
        jwt_issuer: "woly-server".to_string(),
        jwt_audience: "woly-api".to_string(),
        jwt_ttl_seconds: 3600,
        ws_require_tls: false,
        ws_allow_query_token_auth: false,
        ws_session_token_secrets: Vec::new(),
        ws_session_token_issuer: "woly-server".to_string(),
        ws_session_token_audience: "woly-node".to_string(),
        ws_session_token_ttl_seconds: 900,
        ws_message_rate_limit_per_second: 20,
        ws_max_connections_per_ip: 8,
        node_heartbeat_interval_ms: 30_000,
        node_timeout_ms: 90_000,
        command_timeout_ms: 30_000,
        command_retention_days: 7,
        command_max_retries: 3,
        command_retry_base_delay_ms: 10,
        offline_command_ttl_ms: 60_000,
        schedule_worker_enabled: true,
        schedule_poll_interval_ms: 1000,
        schedule_batch_size: 20,
        webhook_retry_base_delay_ms: 10,
        webhook_delivery_timeout_ms: 5000,
        host_status_history_retention_days: 30,
    }
}

pub async fn test_pool() -> SqlitePool {
    crate::db::connect("sqlite::memory:")
        .await
        .expect("in-memory pool")
}

/// Fully wired state over an in-memory database. The session event channel
/// is kept open so host events can be injected through the aggregator.
pub async fn test_state() -> AppState {
    let (state, events_rx) = test_state_with_events().await;
    // Keep the channel open for the lifetime of the test process.
    std::mem::forget(events_rx);
    state
}

pub async fn test_state_with_events() -> (AppState, mpsc::Receiver<NodeEvent>) {
    let config = test_config();
    let db = test_pool().await;
    let jwt = Arc::new(JwtAuth::new(
        &config.jwt_secret,
        config.jwt_issuer.clone(),
        config.jwt_audience.clone(),
        config.jwt_ttl_seconds,
    ));
    let session_tokens = Arc::new(SessionTokenService::new(
        &config.session_token_secrets(),
        config.ws_session_token_issuer.clone(),
        config.ws_session_token_audience.clone(),
        config.ws_session_token_ttl_seconds,
    ));
    let (events_tx, events_rx) = mpsc::channel(256);
    let sessions = Arc::new(SessionManager::new(
        config.clone(),
        db.clone(),
        session_tokens.clone(),
        events_tx,
    ));
    let webhooks = Arc::new(WebhookDispatcher::new(
        db.clone(),
        reqwest::Client::new(),
        config.webhook_retry_base_delay_ms,
        config.webhook_delivery_timeout_ms,
    ));
    let commands = Arc::new(CommandRouter::new(
        db.clone(),
        sessions.clone(),
        webhooks.clone(),
        config.clone(),
        CancellationToken::new(),
    ));
    let aggregator = Arc::new(HostAggregator::new(
        db.clone(),
        config.host_status_history_retention_days,
    ));

    (
        AppState {
            config,
            db,
            jwt,
            session_tokens,
            sessions,
            aggregator,
            commands,
            webhooks,
            scans: Arc::new(ScanTracker::default()),
        },
        events_rx,
    )
}

/// Inject a discovered host into the aggregator projection.
pub async fn seed_aggregated_host(state: &AppState, node_id: &str, name: &str) {
    let host = WireHost {
        name: name.to_string(),
        mac: format!("AA:BB:CC:DD:EE:{:02X}", name.len() as u8),
        ip: "192.168.1.50".to_string(),
        status: HostStatus::Awake,
        ping_responsive: Some(true),
        last_seen: Some(Utc::now()),
        discovered: true,
        notes: None,
        tags: None,
        wol_port: None,
        ports: None,
        ports_scanned_at: None,
        ports_expire_at: None,
    };
    state
        .aggregator
        .apply(&NodeEvent::HostDiscovered {
            node_id: node_id.to_string(),
            location: node_id.to_string(),
            host,
        })
        .await;
}
