use axum::extract::FromRef;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::auth::session_tokens::SessionTokenService;
use crate::auth::JwtAuth;
use crate::config::ServerConfig;
use crate::services::aggregator::HostAggregator;
use crate::services::commands::CommandRouter;
use crate::services::session::SessionManager;
use crate::services::webhooks::WebhookDispatcher;

/// Tracks which nodes have a network scan in flight so `POST /api/hosts/scan`
/// can 409 instead of stacking scans. Entries expire after a bounded window
/// in case a `scan-complete` frame is lost.
#[derive(Default)]
pub struct ScanTracker {
    in_flight: DashMap<String, DateTime<Utc>>,
}

impl ScanTracker {
    const MAX_SCAN_AGE_SECONDS: i64 = 180;

    pub fn try_begin(&self, node_id: &str) -> bool {
        let now = Utc::now();
        if let Some(started) = self.in_flight.get(node_id) {
            if (now - *started).num_seconds() < Self::MAX_SCAN_AGE_SECONDS {
                return false;
            }
        }
        self.in_flight.insert(node_id.to_string(), now);
        true
    }

    pub fn finish(&self, node_id: &str) {
        self.in_flight.remove(node_id);
    }

    pub fn any_in_flight(&self) -> bool {
        let now = Utc::now();
        self.in_flight
            .iter()
            .any(|entry| (now - *entry.value()).num_seconds() < Self::MAX_SCAN_AGE_SECONDS)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub db: SqlitePool,
    pub jwt: Arc<JwtAuth>,
    pub session_tokens: Arc<SessionTokenService>,
    pub sessions: Arc<SessionManager>,
    pub aggregator: Arc<HostAggregator>,
    pub commands: Arc<CommandRouter>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub scans: Arc<ScanTracker>,
}

impl FromRef<AppState> for Arc<JwtAuth> {
    fn from_ref(state: &AppState) -> Arc<JwtAuth> {
        state.jwt.clone()
    }
}

impl FromRef<AppState> for SqlitePool {
    fn from_ref(state: &AppState) -> SqlitePool {
        state.db.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_tracker_serializes_concurrent_scans() {
        let tracker = ScanTracker::default();
        assert!(tracker.try_begin("home"));
        assert!(!tracker.try_begin("home"));
        assert!(tracker.any_in_flight());

        tracker.finish("home");
        assert!(tracker.try_begin("home"));
    }
}
