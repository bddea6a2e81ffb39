use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use woly_proto::{
    close_code, decode_node_frame, frame_type_hint, is_supported_protocol_version, NodeMessage,
    RegisterData, RegisteredData, ServerFrame, ServerMessage, PROTOCOL_VERSION,
};

use crate::auth::session_tokens::{SessionTokenError, SessionTokenService};
use crate::auth::token_in_list;
use crate::config::ServerConfig;
use crate::events::NodeEvent;

/// How long a connection may sit in the Auth state before the first
/// `register` frame must have arrived.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound messages handed to a connection's writer task.
#[derive(Debug)]
enum Outbound {
    Frame(ServerFrame),
    Close { code: u16, reason: String },
}

struct NodeConnection {
    tx: mpsc::Sender<Outbound>,
    connected_at: DateTime<Utc>,
    /// Generation counter distinguishes a reconnect from the connection it
    /// replaced, so late cleanup does not tear down the new session.
    generation: u64,
}

/// Errors surfaced to the command router when transmitting a frame.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("node is not connected")]
    NotConnected,
    #[error("outbound channel full or closed")]
    ChannelClosed,
}

/// Narrow capability the command router consumes: connectivity checks and
/// frame transmission. Keeps the router ↔ session-manager pair acyclic.
pub trait NodeLink: Send + Sync {
    fn is_connected(&self, node_id: &str) -> bool;
    fn send_frame(&self, node_id: &str, frame: ServerFrame) -> Result<(), SendError>;
}

/// Per-node protocol counters (invalid frames, spoof attempts) keyed the way
/// the observability contract requires.
#[derive(Default)]
pub struct ProtocolCounters {
    invalid: DashMap<(String, &'static str, String), u64>,
    spoof: DashMap<String, u64>,
}

impl ProtocolCounters {
    pub fn record_invalid(&self, node_id: &str, direction: &'static str, message_type: &str) {
        *self
            .invalid
            .entry((node_id.to_string(), direction, message_type.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_spoof(&self, node_id: &str) {
        *self.spoof.entry(node_id.to_string()).or_insert(0) += 1;
    }

    pub fn invalid_count(&self, node_id: &str, direction: &'static str, message_type: &str) -> u64 {
        self.invalid
            .get(&(node_id.to_string(), direction, message_type.to_string()))
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn spoof_count(&self, node_id: &str) -> u64 {
        self.spoof.get(node_id).map(|v| *v).unwrap_or(0)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let invalid: Vec<serde_json::Value> = self
            .invalid
            .iter()
            .map(|entry| {
                let ((node, direction, message_type), count) = (entry.key().clone(), *entry.value());
                json!({
                    "nodeId": node,
                    "direction": direction,
                    "type": message_type,
                    "count": count,
                })
            })
            .collect();
        let spoof: Vec<serde_json::Value> = self
            .spoof
            .iter()
            .map(|entry| json!({"nodeId": entry.key(), "count": *entry.value()}))
            .collect();
        json!({"invalidMessages": invalid, "protocolSpoof": spoof})
    }
}

/// Outcome of upgrade-time authentication, before the socket exists.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    /// Subject of a session token; `None` for static node tokens, which may
    /// bind any node id.
    pub subject: Option<String>,
}

/// Why an upgrade was refused, mapped to an HTTP status by the route.
#[derive(Debug, PartialEq, Eq)]
pub enum UpgradeRejection {
    /// 426: TLS required.
    TlsRequired,
    /// 401 + node-side refresh: session token expired.
    AuthExpired,
    /// 401: no acceptable credential.
    Unauthorized,
    /// 429: per-IP connection cap reached.
    TooManyConnections,
}

pub struct SessionManager {
    config: ServerConfig,
    db: SqlitePool,
    session_tokens: Arc<SessionTokenService>,
    connections: DashMap<String, NodeConnection>,
    last_heartbeat: DashMap<String, DateTime<Utc>>,
    per_ip: DashMap<IpAddr, u32>,
    pub counters: ProtocolCounters,
    events: mpsc::Sender<NodeEvent>,
    generation: std::sync::atomic::AtomicU64,
}

impl SessionManager {
    pub fn new(
        config: ServerConfig,
        db: SqlitePool,
        session_tokens: Arc<SessionTokenService>,
        events: mpsc::Sender<NodeEvent>,
    ) -> Self {
        Self {
            config,
            db,
            session_tokens,
            connections: DashMap::new(),
            last_heartbeat: DashMap::new(),
            per_ip: DashMap::new(),
            counters: ProtocolCounters::default(),
            events,
            generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Authenticate an upgrade request. Credential order: Authorization
    /// header, `bearer` subprotocol, then the query parameter when enabled.
    pub fn authorize_upgrade(
        &self,
        bearer_header: Option<&str>,
        subprotocols: Option<&str>,
        query_token: Option<&str>,
        tls: bool,
        remote_ip: IpAddr,
    ) -> Result<AuthGrant, UpgradeRejection> {
        if self.config.ws_require_tls && !tls {
            return Err(UpgradeRejection::TlsRequired);
        }
        let open = self.per_ip.get(&remote_ip).map(|v| *v).unwrap_or(0);
        if open >= self.config.ws_max_connections_per_ip {
            return Err(UpgradeRejection::TooManyConnections);
        }

        let token = bearer_header
            .map(str::to_string)
            .or_else(|| subprotocols.and_then(subprotocol_token))
            .or_else(|| {
                if self.config.ws_allow_query_token_auth {
                    query_token.map(str::to_string)
                } else {
                    None
                }
            })
            .ok_or(UpgradeRejection::Unauthorized)?;

        if token_in_list(&token, &self.config.node_auth_tokens) {
            return Ok(AuthGrant { subject: None });
        }
        match self.session_tokens.verify(&token) {
            Ok(claims) => Ok(AuthGrant {
                subject: Some(claims.sub),
            }),
            Err(SessionTokenError::Expired) => Err(UpgradeRejection::AuthExpired),
            Err(SessionTokenError::Invalid) => Err(UpgradeRejection::Unauthorized),
        }
    }

    /// Drive an accepted socket through register → bound → dispatch until it
    /// closes. Owns the per-IP count for the lifetime of the socket.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, grant: AuthGrant, ip: IpAddr) {
        *self.per_ip.entry(ip).or_insert(0) += 1;
        self.run_socket(socket, grant, ip).await;
        if let Some(mut count) = self.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
    }

    async fn run_socket(self: &Arc<Self>, socket: WebSocket, grant: AuthGrant, ip: IpAddr) {
        let (mut sink, mut stream) = socket.split();

        // Auth state: the first frame must be a valid register.
        let register = match tokio::time::timeout(REGISTER_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match decode_node_frame(&text) {
                Ok(NodeMessage::Register(data)) => data,
                Ok(other) => {
                    self.counters
                        .record_invalid("unbound", "inbound", other.type_tag());
                    tracing::warn!(%ip, message_type = other.type_tag(), "first frame was not register");
                    close_now(&mut sink, close_code::BAD_REGISTER, "expected register").await;
                    return;
                }
                Err(err) => {
                    self.counters
                        .record_invalid("unbound", "inbound", &frame_type_hint(&text));
                    tracing::warn!(%ip, error = %err, "invalid register frame");
                    close_now(&mut sink, close_code::BAD_REGISTER, "invalid register").await;
                    return;
                }
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return,
            Ok(Some(Ok(_))) => {
                close_now(&mut sink, close_code::BAD_REGISTER, "expected text frame").await;
                return;
            }
            Ok(Some(Err(err))) => {
                tracing::debug!(%ip, error = %err, "socket error before register");
                return;
            }
            Err(_) => {
                close_now(&mut sink, close_code::BAD_REGISTER, "register timeout").await;
                return;
            }
        };

        // Identity binding: session-token subject is authoritative.
        if let Some(subject) = &grant.subject {
            if subject != &register.node_id {
                self.counters.record_spoof(&register.node_id);
                tracing::warn!(
                    %ip,
                    subject = %subject,
                    claimed = %register.node_id,
                    "register node id conflicts with token subject"
                );
                close_now(&mut sink, close_code::IDENTITY_CONFLICT, "identity conflict").await;
                return;
            }
        }

        // Version negotiation is exact-match against the supported list.
        let advertised = register.metadata.protocol_version.clone();
        let negotiated = match advertised.as_deref() {
            Some(version) if !is_supported_protocol_version(version) => {
                tracing::warn!(node_id = %register.node_id, version, "unsupported protocol version");
                close_now(
                    &mut sink,
                    close_code::BAD_REGISTER,
                    "unsupported protocol version",
                )
                .await;
                return;
            }
            Some(version) => version.to_string(),
            None => PROTOCOL_VERSION.to_string(),
        };

        let node_id = register.node_id.clone();
        let location = register.location.clone();
        if let Err(err) = self.upsert_node(&register).await {
            tracing::error!(node_id = %node_id, error = %err, "failed to persist node registration");
            close_now(&mut sink, close_code::BAD_REGISTER, "registration failed").await;
            return;
        }

        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Outbound>(64);
        if let Some(previous) = self.connections.insert(
            node_id.clone(),
            NodeConnection {
                tx: tx.clone(),
                connected_at: Utc::now(),
                generation,
            },
        ) {
            // A reconnect supersedes the previous socket.
            let _ = previous.tx.try_send(Outbound::Close {
                code: close_code::NORMAL,
                reason: "superseded by new connection".to_string(),
            });
        }
        self.last_heartbeat.insert(node_id.clone(), Utc::now());

        let registered = ServerFrame::new(ServerMessage::Registered(RegisteredData {
            node_id: node_id.clone(),
            heartbeat_interval: self.config.node_heartbeat_interval_ms,
            protocol_version: Some(negotiated),
        }));
        if tx.try_send(Outbound::Frame(registered)).is_err() {
            self.remove_connection(&node_id, generation);
            return;
        }
        let _ = self
            .events
            .send(NodeEvent::NodeOnline {
                node_id: node_id.clone(),
            })
            .await;
        tracing::info!(node_id = %node_id, %ip, "node registered");

        // Writer task: serializes outbound frames onto the socket.
        let writer = tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                match outbound {
                    Outbound::Frame(frame) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::error!(error = %err, "failed to encode frame");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        // Reader loop: frames dispatched in receive order, one at a time.
        let mut rate_window: VecDeque<Instant> = VecDeque::new();
        let rate_limit = self.config.ws_message_rate_limit_per_second as usize;
        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };

            let now = Instant::now();
            while let Some(front) = rate_window.front() {
                if now.duration_since(*front) > Duration::from_secs(1) {
                    rate_window.pop_front();
                } else {
                    break;
                }
            }
            rate_window.push_back(now);
            if rate_window.len() > rate_limit {
                tracing::warn!(node_id = %node_id, "inbound message rate limit breached");
                let _ = tx.try_send(Outbound::Close {
                    code: close_code::RATE_LIMITED,
                    reason: "message rate limit exceeded".to_string(),
                });
                break;
            }

            match decode_node_frame(&text) {
                Ok(message) => self.dispatch(&node_id, &location, message).await,
                Err(err) => {
                    let hint = frame_type_hint(&text);
                    self.counters.record_invalid(&node_id, "inbound", &hint);
                    tracing::warn!(
                        node_id = %node_id,
                        message_type = %hint,
                        error = %err,
                        "dropping invalid frame"
                    );
                }
            }
        }

        writer.abort();
        self.remove_connection(&node_id, generation);
        self.mark_offline(&node_id).await;
        let _ = self
            .events
            .send(NodeEvent::NodeOffline {
                node_id: node_id.clone(),
            })
            .await;
        tracing::info!(node_id = %node_id, "node disconnected");
    }

    /// Handle one validated frame from a bound connection. The bound
    /// identity is authoritative; payload node ids are compared only to feed
    /// the spoof counter.
    pub(crate) async fn dispatch(&self, node_id: &str, location: &str, message: NodeMessage) {
        match message {
            NodeMessage::Register(_) => {
                tracing::debug!(node_id, "ignoring duplicate register frame");
            }
            NodeMessage::Heartbeat(data) => {
                self.note_spoof(node_id, &data.node_id);
                self.last_heartbeat.insert(node_id.to_string(), Utc::now());
                if let Err(err) = self.touch_heartbeat(node_id).await {
                    tracing::warn!(node_id, error = %err, "failed to persist heartbeat");
                }
            }
            NodeMessage::HostDiscovered(data) => {
                self.note_spoof(node_id, &data.node_id);
                let _ = self
                    .events
                    .send(NodeEvent::HostDiscovered {
                        node_id: node_id.to_string(),
                        location: location.to_string(),
                        host: data.host,
                    })
                    .await;
            }
            NodeMessage::HostUpdated(data) => {
                self.note_spoof(node_id, &data.node_id);
                let _ = self
                    .events
                    .send(NodeEvent::HostUpdated {
                        node_id: node_id.to_string(),
                        location: location.to_string(),
                        host: data.host,
                    })
                    .await;
            }
            NodeMessage::HostRemoved(data) => {
                self.note_spoof(node_id, &data.node_id);
                let _ = self
                    .events
                    .send(NodeEvent::HostRemoved {
                        node_id: node_id.to_string(),
                        location: location.to_string(),
                        host: data.host,
                    })
                    .await;
            }
            NodeMessage::ScanComplete(data) => {
                self.note_spoof(node_id, &data.node_id);
                let _ = self
                    .events
                    .send(NodeEvent::ScanComplete {
                        node_id: node_id.to_string(),
                        hosts_found: data.hosts_found,
                    })
                    .await;
            }
            NodeMessage::CommandResult(data) => {
                self.note_spoof(node_id, &data.node_id);
                let _ = self.events.send(NodeEvent::CommandResult(data)).await;
            }
        }
    }

    fn note_spoof(&self, bound: &str, claimed: &str) {
        if bound != claimed {
            self.counters.record_spoof(bound);
            tracing::warn!(bound, claimed, "payload node id ignored (spoof attempt)");
        }
    }

    fn remove_connection(&self, node_id: &str, generation: u64) {
        // Only remove the entry if it still belongs to this socket.
        self.connections
            .remove_if(node_id, |_, conn| conn.generation == generation);
    }

    /// Background sweep that flips nodes offline once their heartbeat goes
    /// stale, per `NODE_TIMEOUT`.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        let sweep_interval =
            Duration::from_millis((self.config.node_heartbeat_interval_ms / 2).clamp(1000, 30_000));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.shutdown_all().await;
                        break;
                    }
                    _ = interval.tick() => {
                        self.sweep_stale().await;
                    }
                }
            }
        });
    }

    async fn sweep_stale(&self) {
        let timeout = chrono::Duration::milliseconds(self.config.node_timeout_ms as i64);
        let now = Utc::now();
        let stale: Vec<String> = self
            .last_heartbeat
            .iter()
            .filter(|entry| now - *entry.value() > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for node_id in stale {
            self.last_heartbeat.remove(&node_id);
            if let Some((_, conn)) = self.connections.remove(&node_id) {
                let _ = conn.tx.try_send(Outbound::Close {
                    code: close_code::NORMAL,
                    reason: "heartbeat timeout".to_string(),
                });
            }
            self.mark_offline(&node_id).await;
            let _ = self
                .events
                .send(NodeEvent::NodeOffline {
                    node_id: node_id.clone(),
                })
                .await;
            tracing::warn!(node_id = %node_id, "node marked offline (heartbeat timeout)");
        }
    }

    /// Close one node's connection, if present.
    pub fn disconnect(&self, node_id: &str) {
        if let Some((_, conn)) = self.connections.remove(node_id) {
            let _ = conn.tx.try_send(Outbound::Close {
                code: close_code::NORMAL,
                reason: "disconnected by operator".to_string(),
            });
        }
        self.last_heartbeat.remove(node_id);
    }

    /// Send close frames to every connected node; used at shutdown.
    pub async fn shutdown_all(&self) {
        for entry in self.connections.iter() {
            let _ = entry.value().tx.try_send(Outbound::Close {
                code: close_code::NORMAL,
                reason: "server shutting down".to_string(),
            });
        }
        self.connections.clear();
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connected_since(&self, node_id: &str) -> Option<DateTime<Utc>> {
        self.connections.get(node_id).map(|c| c.connected_at)
    }

    pub fn last_heartbeat(&self, node_id: &str) -> Option<DateTime<Utc>> {
        self.last_heartbeat.get(node_id).map(|v| *v)
    }

    async fn upsert_node(&self, register: &RegisterData) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        let capabilities = serde_json::to_string(&register.capabilities).unwrap_or_default();
        let metadata = serde_json::to_string(&register.metadata).unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO nodes (id, name, location, status, last_heartbeat, capabilities, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, 'online', $4, $5, $6, $4, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                location = excluded.location,
                status = 'online',
                last_heartbeat = excluded.last_heartbeat,
                capabilities = excluded.capabilities,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&register.node_id)
        .bind(&register.name)
        .bind(&register.location)
        .bind(now)
        .bind(capabilities)
        .bind(metadata)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn touch_heartbeat(&self, node_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE nodes SET last_heartbeat = $2, status = 'online', updated_at = $2 WHERE id = $1",
        )
        .bind(node_id)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_offline(&self, node_id: &str) {
        if let Err(err) =
            sqlx::query("UPDATE nodes SET status = 'offline', updated_at = $2 WHERE id = $1")
                .bind(node_id)
                .bind(Utc::now())
                .execute(&self.db)
                .await
        {
            tracing::warn!(node_id, error = %err, "failed to mark node offline");
        }
    }
}

impl NodeLink for SessionManager {
    fn is_connected(&self, node_id: &str) -> bool {
        self.connections.contains_key(node_id)
    }

    fn send_frame(&self, node_id: &str, frame: ServerFrame) -> Result<(), SendError> {
        let conn = self
            .connections
            .get(node_id)
            .ok_or(SendError::NotConnected)?;
        conn.tx
            .try_send(Outbound::Frame(frame))
            .map_err(|_| SendError::ChannelClosed)
    }
}

async fn close_now(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Extract a token from the `Sec-WebSocket-Protocol` offer. Accepts both the
/// two-entry form `bearer, <token>` and the single-entry `bearer.<token>`.
fn subprotocol_token(header: &str) -> Option<String> {
    let entries: Vec<&str> = header.split(',').map(str::trim).collect();
    if let Some(token) = entries
        .iter()
        .find_map(|entry| entry.strip_prefix("bearer."))
    {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    if entries.iter().any(|entry| *entry == "bearer") {
        return entries
            .iter()
            .find(|entry| **entry != "bearer" && !entry.is_empty())
            .map(|token| token.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, test_pool};
    use woly_proto::{HeartbeatData, HostStatus, WireHost};

    fn wire_host(name: &str) -> WireHost {
        WireHost {
            name: name.to_string(),
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            ip: "192.168.1.20".to_string(),
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
        }
    }

    async fn manager() -> (Arc<SessionManager>, mpsc::Receiver<NodeEvent>) {
        let config = test_config();
        let pool = test_pool().await;
        let tokens = Arc::new(SessionTokenService::new(
            &config.session_token_secrets(),
            config.ws_session_token_issuer.clone(),
            config.ws_session_token_audience.clone(),
            config.ws_session_token_ttl_seconds,
        ));
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(SessionManager::new(config, pool, tokens, tx)),
            rx,
        )
    }

    #[test]
    fn subprotocol_token_accepts_both_forms() {
        assert_eq!(
            subprotocol_token("bearer, abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(subprotocol_token("bearer.abc123").as_deref(), Some("abc123"));
        assert_eq!(subprotocol_token("graphql-ws"), None);
        assert_eq!(subprotocol_token("bearer"), None);
    }

    #[tokio::test]
    async fn upgrade_requires_some_credential() {
        let (manager, _rx) = manager().await;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let err = manager
            .authorize_upgrade(None, None, None, true, ip)
            .unwrap_err();
        assert_eq!(err, UpgradeRejection::Unauthorized);

        let grant = manager
            .authorize_upgrade(Some("node-token"), None, None, true, ip)
            .unwrap();
        assert!(grant.subject.is_none());
    }

    #[tokio::test]
    async fn query_token_needs_explicit_enable() {
        let (manager, _rx) = manager().await;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let err = manager
            .authorize_upgrade(None, None, Some("node-token"), true, ip)
            .unwrap_err();
        assert_eq!(err, UpgradeRejection::Unauthorized);
    }

    #[tokio::test]
    async fn session_token_subject_flows_into_grant() {
        let (manager, _rx) = manager().await;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (token, _) = manager.session_tokens.mint("home").unwrap();
        let grant = manager
            .authorize_upgrade(Some(&token), None, None, true, ip)
            .unwrap();
        assert_eq!(grant.subject.as_deref(), Some("home"));
    }

    #[tokio::test]
    async fn tls_requirement_rejects_plaintext() {
        let (manager, _rx) = manager().await;
        let mut config = test_config();
        config.ws_require_tls = true;
        let pool = test_pool().await;
        let tokens = Arc::new(SessionTokenService::new(
            &config.session_token_secrets(),
            config.ws_session_token_issuer.clone(),
            config.ws_session_token_audience.clone(),
            config.ws_session_token_ttl_seconds,
        ));
        let (tx, _rx2) = mpsc::channel(8);
        let strict = SessionManager::new(config, pool, tokens, tx);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            strict
                .authorize_upgrade(Some("node-token"), None, None, false, ip)
                .unwrap_err(),
            UpgradeRejection::TlsRequired
        );
        drop(manager);
    }

    #[tokio::test]
    async fn heartbeat_uses_bound_identity_and_counts_spoof() {
        // A connection bound as `home` claiming to be `factory` updates
        // home's heartbeat and feeds the spoof counter.
        let (manager, _rx) = manager().await;
        manager
            .dispatch(
                "home",
                "home",
                NodeMessage::Heartbeat(HeartbeatData {
                    node_id: "factory".to_string(),
                    timestamp: Utc::now(),
                }),
            )
            .await;

        assert!(manager.last_heartbeat("home").is_some());
        assert!(manager.last_heartbeat("factory").is_none());
        assert_eq!(manager.counters.spoof_count("home"), 1);
    }

    #[tokio::test]
    async fn host_events_carry_bound_identity() {
        let (manager, mut rx) = manager().await;
        manager
            .dispatch(
                "home",
                "home",
                NodeMessage::HostDiscovered(woly_proto::HostEventData {
                    node_id: "spoofed".to_string(),
                    host: wire_host("office"),
                }),
            )
            .await;

        match rx.recv().await.unwrap() {
            NodeEvent::HostDiscovered {
                node_id, location, ..
            } => {
                assert_eq!(node_id, "home");
                assert_eq!(location, "home");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(manager.counters.spoof_count("home"), 1);
    }

    #[tokio::test]
    async fn invalid_frame_counter_increments() {
        let (manager, _rx) = manager().await;
        manager
            .counters
            .record_invalid("home", "inbound", "host-discovered");
        assert_eq!(
            manager
                .counters
                .invalid_count("home", "inbound", "host-discovered"),
            1
        );
    }
}
