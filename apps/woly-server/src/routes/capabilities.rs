use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value as JsonValue};

use crate::auth::AuthUser;
use crate::state::AppState;

async fn capabilities(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
) -> Json<JsonValue> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocolVersions": woly_proto::SUPPORTED_PROTOCOL_VERSIONS,
        "features": {
            "schedules": state.config.schedule_worker_enabled,
            "webhooks": true,
            "offlineCommandQueue": true,
            "hostStatusHistory": state.config.host_status_history_retention_days != 0,
        },
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/capabilities", get(capabilities))
}
