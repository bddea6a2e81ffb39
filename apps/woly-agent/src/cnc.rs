use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use woly_proto::{
    close_code, decode_server_frame, CommandResultData, HeartbeatData, HostEventData, NetworkInfo,
    NodeMessage, NodeMetadata, RegisterData, ScanCompleteData, ServerFrame, ServerMessage,
    PROTOCOL_VERSION,
};

use crate::config::{AgentConfig, REFRESH_BUFFER_SECONDS};
use crate::discovery::Scanner;
use crate::events::{EventSender, HostEvent};
use crate::hostdb::{HostPatch, HostStore, StoreError};
use crate::{discovery, wol};

/// How long to wait for the `registered` handshake answer.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle, driven by [`CncClient::run`]. Timers live and die
/// with the state that owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Authenticating,
    Open,
    Closing,
}

/// Why an open session ended; decides what happens before the reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Close code 4001: refresh the session token before dialing again.
    AuthExpired,
    /// Credentials rejected outright; reconnecting is pointless.
    AuthRevoked,
    Closed,
    Shutdown,
}

#[derive(Debug)]
enum AuthOutcome {
    Token(String),
    Revoked,
    Unavailable,
}

struct SessionToken {
    token: String,
    refresh_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MintResponse {
    token: String,
    expires_in_seconds: u64,
}

/// Outbound persistent connection to the C&C: session-token lifecycle,
/// reconnect with backoff, heartbeats at the negotiated interval, command
/// execution, and host event streaming.
pub struct CncClient {
    config: AgentConfig,
    store: HostStore,
    scanner: Arc<Scanner>,
    events: EventSender,
    http: reqwest::Client,
    session: Mutex<Option<SessionToken>>,
}

impl CncClient {
    pub fn new(
        config: AgentConfig,
        store: HostStore,
        scanner: Arc<Scanner>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            store,
            scanner,
            events,
            http: reqwest::Client::new(),
            session: Mutex::new(None),
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        if self.config.cnc_url.is_none() {
            tracing::info!("no C&C configured; running standalone");
            return;
        }
        tokio::spawn(async move {
            self.run(cancel).await;
        });
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            tracing::debug!(state = ?ConnState::Authenticating, "dialing C&C");
            let token = match self.acquire_token().await {
                AuthOutcome::Token(token) => token,
                AuthOutcome::Revoked => {
                    tracing::error!("auth-revoked: credentials rejected; giving up");
                    break;
                }
                AuthOutcome::Unavailable => {
                    tracing::warn!("auth-unavailable: token endpoint unreachable; backing off");
                    if self.wait_reconnect(&cancel, &mut attempts).await {
                        break;
                    }
                    continue;
                }
            };

            let end = match self.connect_and_run(&token, &cancel).await {
                Ok(end) => end,
                Err(err) => {
                    tracing::warn!(error = %err, "C&C connection failed");
                    SessionEnd::Closed
                }
            };
            tracing::debug!(state = ?ConnState::Disconnected, reason = ?end, "session ended");

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::AuthRevoked => {
                    tracing::error!("auth-revoked: server rejected the session; giving up");
                    break;
                }
                SessionEnd::AuthExpired => {
                    // Force a fresh mint before the next dial.
                    self.session.lock().await.take();
                }
                SessionEnd::Closed => {}
            }

            if self.wait_reconnect(&cancel, &mut attempts).await {
                break;
            }
        }
        tracing::info!("C&C client stopped");
    }

    /// Sleep the reconnect interval; returns true when the client should
    /// stop (cancelled or out of attempts).
    async fn wait_reconnect(&self, cancel: &CancellationToken, attempts: &mut u32) -> bool {
        *attempts += 1;
        let max = self.config.max_reconnect_attempts;
        if max != 0 && *attempts >= max {
            tracing::error!(attempts = *attempts, "reconnect attempts exhausted");
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(Duration::from_millis(self.config.reconnect_interval_ms)) => false,
        }
    }

    /// Session-token mode when a mint URL is configured, static token
    /// otherwise.
    async fn acquire_token(&self) -> AuthOutcome {
        let Some(mint_url) = self.config.session_token_url.clone() else {
            return match self.config.node_auth_token.clone() {
                Some(token) => AuthOutcome::Token(token),
                None => AuthOutcome::Revoked,
            };
        };

        {
            let session = self.session.lock().await;
            if let Some(session) = session.as_ref() {
                if Utc::now() < session.refresh_at {
                    return AuthOutcome::Token(session.token.clone());
                }
            }
        }

        let Some(static_token) = self.config.node_auth_token.clone() else {
            return AuthOutcome::Revoked;
        };
        let response = self
            .http
            .post(&mint_url)
            .timeout(Duration::from_secs(10))
            .header("Authorization", format!("Bearer {static_token}"))
            .json(&serde_json::json!({"nodeId": self.config.node_id}))
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<MintResponse>().await {
                    Ok(minted) => {
                        let refresh_in = minted
                            .expires_in_seconds
                            .saturating_sub(REFRESH_BUFFER_SECONDS)
                            .max(1);
                        let token = minted.token.clone();
                        *self.session.lock().await = Some(SessionToken {
                            token: minted.token,
                            refresh_at: Utc::now() + ChronoDuration::seconds(refresh_in as i64),
                        });
                        tracing::debug!(refresh_in, "session token minted");
                        AuthOutcome::Token(token)
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "malformed session token response");
                        AuthOutcome::Unavailable
                    }
                }
            }
            Ok(response)
                if response.status() == reqwest::StatusCode::UNAUTHORIZED
                    || response.status() == reqwest::StatusCode::FORBIDDEN =>
            {
                AuthOutcome::Revoked
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "session token mint failed");
                AuthOutcome::Unavailable
            }
            Err(err) => {
                tracing::warn!(error = %err, "session token endpoint unreachable");
                AuthOutcome::Unavailable
            }
        }
    }

    async fn connect_and_run(
        self: &Arc<Self>,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd> {
        let url = self
            .config
            .cnc_url
            .clone()
            .context("cnc url not configured")?;
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            AUTHORIZATION,
            format!("Bearer {token}")
                .parse()
                .context("token is not a valid header value")?,
        );

        let (socket, _response) = match tokio_tungstenite::connect_async(request).await {
            Ok(connected) => connected,
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    return Ok(if self.config.session_token_url.is_some() {
                        SessionEnd::AuthExpired
                    } else {
                        SessionEnd::AuthRevoked
                    });
                }
                anyhow::bail!("upgrade rejected with status {status}");
            }
            Err(err) => return Err(err.into()),
        };
        let (mut sink, mut stream) = socket.split();

        // Register and wait for the echo.
        let register = NodeMessage::Register(RegisterData {
            node_id: self.config.node_id.clone(),
            name: self.config.node_name.clone(),
            location: self.config.location.clone(),
            capabilities: vec![
                "wake".to_string(),
                "scan".to_string(),
                "update-host".to_string(),
                "delete-host".to_string(),
                "scan-host-ports".to_string(),
                "ping-host".to_string(),
            ],
            metadata: NodeMetadata {
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
                platform: Some(std::env::consts::OS.to_string()),
                protocol_version: Some(PROTOCOL_VERSION.to_string()),
                network_info: Some(NetworkInfo {
                    subnet: discovery::arp::local_subnets()
                        .first()
                        .map(|base| format!("{base}/24")),
                    gateway: None,
                }),
            },
        });
        sink.send(Message::Text(serde_json::to_string(&register)?.into()))
            .await?;

        let heartbeat_interval = tokio::time::timeout(REGISTER_TIMEOUT, async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match decode_server_frame(&text) {
                        Ok(frame) => {
                            if let ServerMessage::Registered(data) = frame.message {
                                tracing::info!(
                                    node_id = %data.node_id,
                                    heartbeat_interval = data.heartbeat_interval,
                                    protocol_version = data.protocol_version.as_deref().unwrap_or(""),
                                    "registered with C&C"
                                );
                                return Ok(data.heartbeat_interval);
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "dropping invalid frame before registered");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code)).unwrap_or(0);
                        anyhow::bail!("closed during registration with code {code}");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                    None => anyhow::bail!("connection ended during registration"),
                }
            }
        })
        .await
        .context("timed out waiting for registered")??;

        // Open: heartbeats, host-event streaming, and command execution.
        tracing::debug!(state = ?ConnState::Open, "session open");
        let (out_tx, mut out_rx) = mpsc::channel::<NodeMessage>(64);
        let mut host_events = self.events.subscribe();
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(heartbeat_interval.max(1000)));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // the first tick fires immediately

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(state = ?ConnState::Closing, "shutting down session");
                    let _ = sink.send(Message::Close(None)).await;
                    break SessionEnd::Shutdown;
                }
                _ = heartbeat.tick() => {
                    let frame = NodeMessage::Heartbeat(HeartbeatData {
                        node_id: self.config.node_id.clone(),
                        timestamp: Utc::now(),
                    });
                    if send_frame(&mut sink, &frame).await.is_err() {
                        break SessionEnd::Closed;
                    }
                }
                event = host_events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Some(frame) = self.event_frame(event) {
                                if send_frame(&mut sink, &frame).await.is_err() {
                                    break SessionEnd::Closed;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "host event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }
                outbound = out_rx.recv() => {
                    if let Some(frame) = outbound {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break SessionEnd::Closed;
                        }
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            match decode_server_frame(&text) {
                                Ok(frame) => self.execute_command(frame, out_tx.clone()).await,
                                Err(err) => {
                                    tracing::warn!(error = %err, "dropping invalid frame");
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|f| u16::from(f.code)).unwrap_or(close_code::NORMAL);
                            tracing::info!(code, "C&C closed the connection");
                            break match code {
                                close_code::AUTH_EXPIRED => SessionEnd::AuthExpired,
                                close_code::AUTH_REVOKED | close_code::IDENTITY_CONFLICT => {
                                    SessionEnd::AuthRevoked
                                }
                                _ => SessionEnd::Closed,
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "socket error");
                            break SessionEnd::Closed;
                        }
                        None => break SessionEnd::Closed,
                    }
                }
            }
        };
        Ok(end)
    }

    fn event_frame(&self, event: HostEvent) -> Option<NodeMessage> {
        let node_id = self.config.node_id.clone();
        Some(match event {
            HostEvent::Discovered(record) => NodeMessage::HostDiscovered(HostEventData {
                node_id,
                host: record.to_wire(),
            }),
            HostEvent::Updated(record) => NodeMessage::HostUpdated(HostEventData {
                node_id,
                host: record.to_wire(),
            }),
            HostEvent::Removed(record) => NodeMessage::HostRemoved(HostEventData {
                node_id,
                host: record.to_wire(),
            }),
            HostEvent::ScanComplete {
                hosts_found,
                duration_ms,
            } => NodeMessage::ScanComplete(ScanCompleteData {
                node_id,
                hosts_found,
                duration_ms: Some(duration_ms),
                timestamp: Utc::now(),
            }),
        })
    }

    fn result(&self, command_id: Uuid, success: bool, message: Option<String>, error: Option<String>) -> NodeMessage {
        NodeMessage::CommandResult(CommandResultData {
            node_id: self.config.node_id.clone(),
            command_id,
            success,
            message,
            error,
            timestamp: Utc::now(),
        })
    }

    /// Execute one C&C command; every command with an id produces exactly
    /// one command-result carrying that id.
    pub(crate) async fn execute_command(
        self: &Arc<Self>,
        frame: ServerFrame,
        out: mpsc::Sender<NodeMessage>,
    ) {
        let command_id = frame.command_id;
        match frame.message {
            ServerMessage::Registered(_) => {
                tracing::debug!("ignoring duplicate registered frame");
            }
            ServerMessage::Error(data) => {
                tracing::warn!(code = data.code.as_deref().unwrap_or(""), message = %data.message, "error frame from C&C");
            }
            ServerMessage::Ping => {
                if let Some(id) = command_id {
                    let _ = out.send(self.result(id, true, Some("pong".to_string()), None)).await;
                }
            }
            ServerMessage::Wake(data) => {
                let Some(id) = command_id else { return };
                let outcome = wol::send_magic_packet(&data.mac, data.wol_port).await;
                let frame = match outcome {
                    Ok(()) => self.result(
                        id,
                        true,
                        Some(format!("magic packet sent to {}", data.host_name)),
                        None,
                    ),
                    Err(err) => self.result(id, false, None, Some(err.to_string())),
                };
                let _ = out.send(frame).await;
            }
            ServerMessage::Scan(data) => {
                let Some(id) = command_id else { return };
                let client = Arc::clone(self);
                if data.immediate {
                    // Ack follows the sweep.
                    tokio::spawn(async move {
                        let frame = match client.scanner.sync_with_network().await {
                            Ok(_) => client.result(id, true, Some("scan finished".to_string()), None),
                            Err(err) => client.result(id, false, None, Some(err.to_string())),
                        };
                        let _ = out.send(frame).await;
                    });
                } else {
                    // Background: ack now, sweep later.
                    let _ = out
                        .send(self.result(id, true, Some("scan scheduled".to_string()), None))
                        .await;
                    tokio::spawn(async move {
                        if let Err(err) = client.scanner.sync_with_network().await {
                            tracing::warn!(error = %err, "background scan failed");
                        }
                    });
                }
            }
            ServerMessage::UpdateHost(data) => {
                let Some(id) = command_id else { return };
                let lookup = data
                    .current_name
                    .clone()
                    .unwrap_or_else(|| data.name.clone());
                let patch = HostPatch {
                    name: Some(data.name.clone()),
                    mac: data.mac.clone(),
                    ip: data.ip.clone(),
                    status: data.status,
                    notes: data.notes.clone(),
                    tags: data.tags.clone(),
                    wol_port: data.wol_port,
                };
                let frame = match self.store.update(&lookup, patch).await {
                    Ok(record) => {
                        let _ = self.events.send(HostEvent::Updated(record));
                        self.result(id, true, Some(format!("host {} updated", data.name)), None)
                    }
                    Err(err) => self.result(id, false, None, Some(store_error_code(&err))),
                };
                let _ = out.send(frame).await;
            }
            ServerMessage::DeleteHost(data) => {
                let Some(id) = command_id else { return };
                let frame = match self.store.delete_by_name(&data.name).await {
                    Ok(record) => {
                        let _ = self.events.send(HostEvent::Removed(record));
                        self.result(id, true, Some(format!("host {} deleted", data.name)), None)
                    }
                    Err(err) => self.result(id, false, None, Some(store_error_code(&err))),
                };
                let _ = out.send(frame).await;
            }
            ServerMessage::ScanHostPorts(data) => {
                let Some(id) = command_id else { return };
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    let frame = match client.store.get_by_name(&data.name).await {
                        Ok(Some(host)) => {
                            let open = discovery::ports::scan(&host.ip).await;
                            match client.store.set_ports(&data.name, open.clone()).await {
                                Ok(record) => {
                                    let _ = client.events.send(HostEvent::Updated(record));
                                    client.result(
                                        id,
                                        true,
                                        Some(format!("{} open ports", open.len())),
                                        None,
                                    )
                                }
                                Err(err) => {
                                    client.result(id, false, None, Some(store_error_code(&err)))
                                }
                            }
                        }
                        Ok(None) => client.result(id, false, None, Some("host_not_found".to_string())),
                        Err(err) => client.result(id, false, None, Some(err.to_string())),
                    };
                    let _ = out.send(frame).await;
                });
            }
            ServerMessage::PingHost(data) => {
                let Some(id) = command_id else { return };
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    let frame = match client.store.get_by_name(&data.name).await {
                        Ok(Some(host)) => {
                            let responsive = discovery::ping::probe(&host.ip).await;
                            if let Ok(record) =
                                client.store.set_ping_responsive(&data.name, responsive).await
                            {
                                let _ = client.events.send(HostEvent::Updated(record));
                            }
                            if responsive {
                                client.result(id, true, Some("host responded".to_string()), None)
                            } else {
                                client.result(
                                    id,
                                    false,
                                    None,
                                    Some("host unreachable".to_string()),
                                )
                            }
                        }
                        Ok(None) => client.result(id, false, None, Some("host_not_found".to_string())),
                        Err(err) => client.result(id, false, None, Some(err.to_string())),
                    };
                    let _ = out.send(frame).await;
                });
            }
            ServerMessage::SleepHost(_) | ServerMessage::ShutdownHost(_) => {
                if let Some(id) = command_id {
                    let _ = out
                        .send(self.result(id, false, None, Some("not_implemented".to_string())))
                        .await;
                }
            }
        }
    }
}

fn store_error_code(err: &StoreError) -> String {
    match err {
        StoreError::NotFound => "host_not_found".to_string(),
        StoreError::Conflict(_) => "conflict".to_string(),
        StoreError::Invalid { .. } => "validation_failed".to_string(),
        StoreError::Db(err) => err.to_string(),
    }
}

async fn send_frame<S>(sink: &mut S, frame: &NodeMessage) -> Result<()>
where
    S: futures::Sink<Message> + Unpin,
    <S as futures::Sink<Message>>::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
