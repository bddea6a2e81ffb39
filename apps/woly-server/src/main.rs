use anyhow::{Context, Result};
use axum::http::HeaderValue;
use clap::Parser;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{AllowOrigin, CorsLayer};

use woly_server::auth::session_tokens::SessionTokenService;
use woly_server::auth::JwtAuth;
use woly_server::events::NodeEvent;
use woly_server::services::aggregator::HostAggregator;
use woly_server::services::commands::CommandRouter;
use woly_server::services::schedules::ScheduleWorker;
use woly_server::services::session::SessionManager;
use woly_server::services::webhooks::WebhookDispatcher;
use woly_server::state::{AppState, ScanTracker};
use woly_server::{cli, config, db, routes};

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind woly-server listener on {addr}: port already in use. Stop the other service or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind woly-server listener on {addr}"))
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new();
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

/// The single serialized event stream: everything the session manager emits
/// flows through here, keeping the aggregator single-writer and fanning out
/// to the command router and webhook dispatcher.
fn start_event_loop(
    mut events: mpsc::Receiver<NodeEvent>,
    state: AppState,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match &event {
                NodeEvent::NodeOnline { node_id } => {
                    state.commands.flush_queued(node_id).await;
                    state
                        .webhooks
                        .publish("node.online", json!({"nodeId": node_id}));
                }
                NodeEvent::NodeOffline { node_id } => {
                    state.aggregator.apply(&event).await;
                    state.scans.finish(node_id);
                    state
                        .webhooks
                        .publish("node.offline", json!({"nodeId": node_id}));
                }
                NodeEvent::HostDiscovered {
                    node_id, location, host,
                } => {
                    let transition = state.aggregator.apply(&event).await;
                    let fqn = woly_server::services::aggregator::fqn(&host.name, location);
                    state.webhooks.publish(
                        "host.discovered",
                        json!({"fqn": fqn, "nodeId": node_id, "status": host.status}),
                    );
                    if let Some(transition) = transition {
                        publish_transition(&state, &transition);
                    }
                }
                NodeEvent::HostUpdated { .. } => {
                    if let Some(transition) = state.aggregator.apply(&event).await {
                        publish_transition(&state, &transition);
                    }
                }
                NodeEvent::HostRemoved {
                    node_id, location, host,
                } => {
                    state.aggregator.apply(&event).await;
                    let fqn = woly_server::services::aggregator::fqn(&host.name, location);
                    state
                        .webhooks
                        .publish("host.removed", json!({"fqn": fqn, "nodeId": node_id}));
                }
                NodeEvent::ScanComplete {
                    node_id, hosts_found,
                } => {
                    state.scans.finish(node_id);
                    tracing::info!(node_id = %node_id, hosts_found = *hosts_found, "scan complete");
                }
                NodeEvent::CommandResult(result) => {
                    state.commands.handle_result(result).await;
                }
            }
        }
    });
}

fn publish_transition(
    state: &AppState,
    transition: &woly_server::services::aggregator::StatusTransition,
) {
    state.webhooks.publish(
        "host.status-changed",
        json!({
            "fqn": transition.fqn,
            "from": transition.from,
            "to": transition.to,
        }),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::ServerConfig::from_env()?;
    let pool = db::connect(&config.database_url).await?;

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

    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel::<NodeEvent>(1024);

    let sessions = Arc::new(SessionManager::new(
        config.clone(),
        pool.clone(),
        session_tokens.clone(),
        events_tx,
    ));
    let webhooks = Arc::new(WebhookDispatcher::new(
        pool.clone(),
        reqwest::Client::new(),
        config.webhook_retry_base_delay_ms,
        config.webhook_delivery_timeout_ms,
    ));
    let commands = Arc::new(CommandRouter::new(
        pool.clone(),
        sessions.clone(),
        webhooks.clone(),
        config.clone(),
        cancel.clone(),
    ));
    let aggregator = Arc::new(HostAggregator::new(
        pool.clone(),
        config.host_status_history_retention_days,
    ));

    let state = AppState {
        config: config.clone(),
        db: pool.clone(),
        jwt,
        session_tokens,
        sessions: sessions.clone(),
        aggregator: aggregator.clone(),
        commands: commands.clone(),
        webhooks: webhooks.clone(),
        scans: Arc::new(ScanTracker::default()),
    };

    // Restart reconciliation before anything can mutate command state.
    commands.reconcile().await.context("command reconciliation failed")?;
    commands.start_pruning(config.command_retention_days).await;

    start_event_loop(events_rx, state.clone(), cancel.clone());
    sessions.clone().start(cancel.clone());
    aggregator.clone().start(cancel.clone());
    webhooks.clone().start(cancel.clone());
    ScheduleWorker::new(
        pool.clone(),
        commands.clone(),
        aggregator.clone(),
        webhooks.clone(),
        config.clone(),
    )
    .start(cancel.clone());

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(60)
            .use_headers()
            .finish()
            .context("failed to build rate limiter config")?,
    );
    let governor_limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(60));
        governor_limiter.retain_recent();
    });

    let app = routes::rate_limited_router(state)?
        .layer(GovernorLayer::new(governor_conf))
        .layer(cors_layer(&config.cors_origins));

    let port = args.port.unwrap_or(config.port);
    let addr = format!("{}:{}", args.host, port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(addr = %addr, "woly-server listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_cancel.cancel();
    })
    .await?;

    cancel.cancel();
    // Bounded grace period for close frames and timer teardown.
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bind_listener;
    use anyhow::Result;

    #[tokio::test]
    async fn reports_port_in_use_with_actionable_message() -> Result<()> {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // Sandbox environments can block binding attempts.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;

        let err = bind_listener(&addr.to_string()).await.unwrap_err();
        let message = err.to_string().to_lowercase();
        if message.contains("operation not permitted") {
            return Ok(());
        }
        assert!(message.contains("port already in use"));
        assert!(message.contains("--port"));

        drop(listener);
        Ok(())
    }
}
