use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use woly_agent::cnc::CncClient;
use woly_agent::config::AgentConfig;
use woly_agent::discovery::Scanner;
use woly_agent::hostdb::{HostStore, NewHost};
use woly_agent::http::{self, AgentState};
use woly_agent::events;
use woly_agent::mac_vendor::MacVendorLookup;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,woly_agent=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

async fn load_seeds(path: Option<&str>) -> Result<Vec<NewHost>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read seed file {path}"))?;
    serde_json::from_str(&contents).with_context(|| format!("invalid seed file {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::from_env()?;
    init_tracing()?;

    let store = HostStore::open(&config.db_path).await?;
    let seeds = load_seeds(config.seed_path.as_deref()).await?;
    let seeded = store.seed_if_empty(&seeds).await?;
    if seeded > 0 {
        tracing::info!(seeded, "seeded empty host table");
    }

    let events = events::channel();
    let scanner = Arc::new(Scanner::new(
        store.clone(),
        events.clone(),
        config.scan_interval_ms,
    ));
    let cancel = CancellationToken::new();
    scanner.clone().start(cancel.clone());

    let cnc = Arc::new(CncClient::new(
        config.clone(),
        store.clone(),
        scanner.clone(),
        events.clone(),
    ));
    cnc.start(cancel.clone());

    let state = AgentState {
        config: config.clone(),
        store,
        scanner,
        events,
        vendors: Arc::new(MacVendorLookup::new(reqwest::Client::new())),
    };
    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind woly-agent listener on {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, node_id = %config.node_id, "woly-agent listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown_cancel.cancel();
        })
        .await?;

    cancel.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    Ok(())
}
