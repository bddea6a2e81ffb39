use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use woly_proto::{normalize_mac, HostStatus, WireHost};

use crate::events::NodeEvent;

/// A host as projected into the cross-node view: the node's record plus its
/// owning node id, location, and the `name@location` key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedHost {
    pub fqn: String,
    pub node_id: String,
    pub location: String,
    #[serde(flatten)]
    pub host: WireHost,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    pub total: u64,
    pub awake: u64,
    pub asleep: u64,
    pub by_location: BTreeMap<String, u64>,
}

/// Deterministic `GET /api/hosts` payload: hosts ordered by fqn, stats with
/// sorted location keys. The ETag is derived from exactly this shape.
#[derive(Debug, Clone, Serialize)]
pub struct HostsPayload {
    pub hosts: Vec<AggregatedHost>,
    pub stats: HostStats,
}

#[derive(Default)]
struct AggregateState {
    hosts: BTreeMap<String, AggregatedHost>,
    by_node: HashMap<String, BTreeSet<String>>,
}

pub fn fqn(name: &str, location: &str) -> String {
    format!("{name}@{location}")
}

/// In-memory projection of every node's hosts. Writes arrive on the single
/// serialized event stream; readers take snapshots.
pub struct HostAggregator {
    db: SqlitePool,
    state: RwLock<AggregateState>,
    retention_days: i64,
}

impl HostAggregator {
    pub fn new(db: SqlitePool, retention_days: i64) -> Self {
        Self {
            db,
            state: RwLock::new(AggregateState::default()),
            retention_days,
        }
    }

    /// Apply one event from the serialized stream. Returns the status
    /// transition that occurred, if any, so callers can fan out webhooks.
    pub async fn apply(&self, event: &NodeEvent) -> Option<StatusTransition> {
        match event {
            NodeEvent::HostDiscovered {
                node_id,
                location,
                host,
            }
            | NodeEvent::HostUpdated {
                node_id,
                location,
                host,
            } => self.upsert(node_id, location, host).await,
            NodeEvent::HostRemoved {
                node_id,
                location,
                host,
            } => {
                self.remove(node_id, &fqn(&host.name, location)).await;
                None
            }
            // Offline nodes keep their last known host view; `lastSeen` is
            // already frozen at the final event we received.
            NodeEvent::NodeOffline { node_id } => {
                tracing::debug!(node_id = %node_id, "node offline; host projection frozen");
                None
            }
            _ => None,
        }
    }

    async fn upsert(
        &self,
        node_id: &str,
        location: &str,
        host: &WireHost,
    ) -> Option<StatusTransition> {
        let mut host = host.clone();
        host.mac = normalize_mac(&host.mac);
        let key = fqn(&host.name, location);

        let mut state = self.state.write().await;

        // A rename shows up as the same (node, mac) under a new fqn; drop
        // the stale entry so both names never coexist.
        let stale: Option<String> = state
            .hosts
            .iter()
            .find(|(existing_fqn, entry)| {
                entry.node_id == node_id && entry.host.mac == host.mac && **existing_fqn != key
            })
            .map(|(existing_fqn, _)| existing_fqn.clone());
        if let Some(stale_fqn) = stale {
            state.hosts.remove(&stale_fqn);
            if let Some(set) = state.by_node.get_mut(node_id) {
                set.remove(&stale_fqn);
            }
        }

        let previous_status = state.hosts.get(&key).map(|entry| entry.host.status);
        let transition = match previous_status {
            Some(previous) if previous != host.status => Some(StatusTransition {
                fqn: key.clone(),
                from: Some(previous),
                to: host.status,
            }),
            None => Some(StatusTransition {
                fqn: key.clone(),
                from: None,
                to: host.status,
            }),
            _ => None,
        };

        state.hosts.insert(
            key.clone(),
            AggregatedHost {
                fqn: key.clone(),
                node_id: node_id.to_string(),
                location: location.to_string(),
                host,
            },
        );
        state
            .by_node
            .entry(node_id.to_string())
            .or_default()
            .insert(key);
        drop(state);

        if let Some(transition) = &transition {
            self.append_history(transition).await;
        }
        transition
    }

    async fn remove(&self, node_id: &str, key: &str) {
        let mut state = self.state.write().await;
        state.hosts.remove(key);
        if let Some(set) = state.by_node.get_mut(node_id) {
            set.remove(key);
        }
    }

    pub async fn host(&self, key: &str) -> Option<AggregatedHost> {
        self.state.read().await.hosts.get(key).cloned()
    }

    /// Drop every host owned by a node; used when an admin deletes the node.
    pub async fn remove_node(&self, node_id: &str) {
        let mut state = self.state.write().await;
        if let Some(fqns) = state.by_node.remove(node_id) {
            for key in fqns {
                state.hosts.remove(&key);
            }
        }
    }

    /// Snapshot of the projection, optionally filtered to one node, ordered
    /// by fqn.
    pub async fn payload(&self, node_id: Option<&str>) -> HostsPayload {
        let state = self.state.read().await;
        let hosts: Vec<AggregatedHost> = state
            .hosts
            .values()
            .filter(|entry| node_id.map_or(true, |id| entry.node_id == id))
            .cloned()
            .collect();

        let mut awake = 0u64;
        let mut asleep = 0u64;
        let mut by_location: BTreeMap<String, u64> = BTreeMap::new();
        for entry in &hosts {
            match entry.host.status {
                HostStatus::Awake => awake += 1,
                HostStatus::Asleep => asleep += 1,
            }
            *by_location.entry(entry.location.clone()).or_insert(0) += 1;
        }

        HostsPayload {
            stats: HostStats {
                total: hosts.len() as u64,
                awake,
                asleep,
                by_location,
            },
            hosts,
        }
    }

    pub async fn host_count(&self) -> usize {
        self.state.read().await.hosts.len()
    }

    async fn append_history(&self, transition: &StatusTransition) {
        let result = sqlx::query(
            "INSERT INTO host_status_history (fqn, from_status, to_status, at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&transition.fqn)
        .bind(transition.from.map(|s| s.as_str()))
        .bind(transition.to.as_str())
        .bind(Utc::now())
        .execute(&self.db)
        .await;
        if let Err(err) = result {
            tracing::warn!(fqn = %transition.fqn, error = %err, "failed to append status history");
        }
    }

    pub async fn history(
        &self,
        key: &str,
        limit: i64,
    ) -> Result<Vec<HistoryEntry>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT fqn, from_status, to_status, at
            FROM host_status_history
            WHERE fqn = $1
            ORDER BY at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(key)
        .bind(limit)
        .fetch_all(&self.db)
        .await
    }

    /// Awake ratio over the trailing window, derived from the transition
    /// log. The status at the window start is the last transition before it.
    pub async fn uptime(
        &self,
        key: &str,
        window: ChronoDuration,
    ) -> Result<UptimeReport, sqlx::Error> {
        let now = Utc::now();
        let window_start = now - window;

        let initial: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT to_status FROM host_status_history
            WHERE fqn = $1 AND at <= $2
            ORDER BY at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(key)
        .bind(window_start)
        .fetch_optional(&self.db)
        .await?;

        let transitions: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT to_status, at FROM host_status_history
            WHERE fqn = $1 AND at > $2
            ORDER BY at ASC, id ASC
            "#,
        )
        .bind(key)
        .bind(window_start)
        .fetch_all(&self.db)
        .await?;

        let mut awake_seconds = 0i64;
        let mut cursor = window_start;
        let mut current_awake = initial.map(|(s,)| s == "awake").unwrap_or(false);
        for (status, at) in transitions {
            if current_awake {
                awake_seconds += (at - cursor).num_seconds().max(0);
            }
            cursor = at;
            current_awake = status == "awake";
        }
        if current_awake {
            awake_seconds += (now - cursor).num_seconds().max(0);
        }

        let total_seconds = window.num_seconds().max(1);
        Ok(UptimeReport {
            fqn: key.to_string(),
            window_seconds: total_seconds,
            awake_seconds,
            uptime_percent: (awake_seconds as f64 / total_seconds as f64 * 100.0).clamp(0.0, 100.0),
        })
    }

    /// History retention pruning; a zero retention disables the task.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        if self.retention_days == 0 {
            tracing::info!("host status history pruning disabled");
            return;
        }
        let retention = self.retention_days;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let cutoff = Utc::now() - ChronoDuration::days(retention);
                        match sqlx::query("DELETE FROM host_status_history WHERE at < $1")
                            .bind(cutoff)
                            .execute(&self.db)
                            .await
                        {
                            Ok(result) if result.rows_affected() > 0 => {
                                tracing::info!(rows = result.rows_affected(), "pruned host status history");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(error = %err, "history pruning failed");
                            }
                        }
                    }
                }
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub fqn: String,
    pub from: Option<HostStatus>,
    pub to: HostStatus,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub fqn: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeReport {
    pub fqn: String,
    pub window_seconds: i64,
    pub awake_seconds: i64,
    pub uptime_percent: f64,
}

/// `base64url(sha256(canonical_json(payload)))`, quoted for the header.
pub fn etag_for(payload: &HostsPayload) -> String {
    let canonical = serde_json::to_vec(payload).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    format!("\"{}\"", URL_SAFE_NO_PAD.encode(digest))
}

/// `If-None-Match` comparison supporting `*` and weak validators.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.strip_prefix("W/").unwrap_or(candidate) == etag
    })
}
