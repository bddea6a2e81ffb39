use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::SqlitePool;

use crate::auth::{token_in_list, AuthUser};
use crate::error::{map_db_error, AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct NodeRow {
    id: String,
    name: String,
    location: String,
    last_heartbeat: Option<DateTime<Utc>>,
    capabilities: SqlJson<Vec<String>>,
    metadata: SqlJson<JsonValue>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NodeResponse {
    id: String,
    name: String,
    location: String,
    status: String,
    connected: bool,
    last_heartbeat: Option<DateTime<Utc>>,
    capabilities: Vec<String>,
    metadata: JsonValue,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl NodeResponse {
    fn from_row(row: NodeRow, state: &AppState) -> Self {
        let connected = state.sessions.connected_since(&row.id).is_some();
        let timeout = ChronoDuration::milliseconds(state.config.node_timeout_ms as i64);
        let fresh = state
            .sessions
            .last_heartbeat(&row.id)
            .or(row.last_heartbeat)
            .map(|at| Utc::now() - at <= timeout)
            .unwrap_or(false);
        let online = connected && fresh;
        Self {
            id: row.id,
            name: row.name,
            location: row.location,
            status: if online { "online" } else { "offline" }.to_string(),
            connected,
            last_heartbeat: row.last_heartbeat,
            capabilities: row.capabilities.0,
            metadata: row.metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

async fn fetch_node(db: &SqlitePool, id: &str) -> AppResult<NodeRow> {
    let row: Option<NodeRow> = sqlx::query_as(
        r#"
        SELECT id, name, location, last_heartbeat, capabilities, metadata, created_at, updated_at
        FROM nodes WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(db)
    .await
    .map_err(map_db_error)?;
    row.ok_or_else(|| AppError::not_found("Node not found"))
}

async fn list_nodes(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
) -> AppResult<Json<Vec<NodeResponse>>> {
    let rows: Vec<NodeRow> = sqlx::query_as(
        r#"
        SELECT id, name, location, last_heartbeat, capabilities, metadata, created_at, updated_at
        FROM nodes ORDER BY location, name
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;

    Ok(Json(
        rows.into_iter()
            .map(|row| NodeResponse::from_row(row, &state))
            .collect(),
    ))
}

async fn get_node(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<NodeResponse>> {
    let row = fetch_node(&state.db, &id).await?;
    Ok(Json(NodeResponse::from_row(row, &state)))
}

async fn node_health(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<JsonValue>> {
    let row = fetch_node(&state.db, &id).await?;
    let response = NodeResponse::from_row(row, &state);
    let healthy = response.status == "online";
    Ok(Json(serde_json::json!({
        "nodeId": response.id,
        "status": response.status,
        "healthy": healthy,
        "lastHeartbeat": response.last_heartbeat,
        "connectedSince": state.sessions.connected_since(&response.id),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionTokenRequest {
    node_id: String,
}

/// Mint a short-lived WS session token for an agent holding a static node
/// token. The returned token's subject is the node id the upgrade must bind.
async fn mint_session_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SessionTokenRequest>,
) -> AppResult<Json<JsonValue>> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::unauthorized("Invalid credentials"))?;
    if !token_in_list(token, &state.config.node_auth_tokens) {
        return Err(AppError::unauthorized("Invalid credentials"));
    }
    if request.node_id.trim().is_empty() {
        return Err(AppError::bad_request("nodeId must not be empty"));
    }

    let (session_token, expires_in) =
        state.session_tokens.mint(&request.node_id).map_err(|err| {
            tracing::error!(error = %err, "failed to mint session token");
            AppError::internal("Internal server error")
        })?;
    Ok(Json(serde_json::json!({
        "token": session_token,
        "expiresInSeconds": expires_in,
    })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/nodes", get(list_nodes))
        .route("/nodes/session-token", post(mint_session_token))
        .route("/nodes/{id}", get(get_node))
        .route("/nodes/{id}/health", get(node_health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn seed_node(state: &AppState, id: &str, heartbeat_age_secs: i64) {
        let heartbeat = Utc::now() - ChronoDuration::seconds(heartbeat_age_secs);
        sqlx::query(
            r#"
            INSERT INTO nodes (id, name, location, status, last_heartbeat, capabilities, metadata, created_at, updated_at)
            VALUES ($1, $1, 'home', 'online', $2, '[]', '{}', $2, $2)
            "#,
        )
        .bind(id)
        .bind(heartbeat)
        .execute(&state.db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn node_health_reports_offline_after_timeout() {
        // NODE_TIMEOUT is 90s in the test config; a node whose heartbeat is
        // 91s old (and which has no live connection) must be offline.
        let state = crate::test_support::test_state().await;
        seed_node(&state, "home", 91).await;

        let (jwt, _) = state.jwt.issue(crate::auth::Role::Operator).unwrap();
        let app = router().with_state(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/nodes/home/health")
                    .header("authorization", format!("Bearer {jwt}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: JsonValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "offline");
        assert_eq!(body["healthy"], false);
    }

    #[tokio::test]
    async fn unknown_node_is_404() {
        let state = crate::test_support::test_state().await;
        let (jwt, _) = state.jwt.issue(crate::auth::Role::Operator).unwrap();
        let app = router().with_state(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/nodes/ghost")
                    .header("authorization", format!("Bearer {jwt}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_token_requires_node_token() {
        let state = crate::test_support::test_state().await;
        let app = router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/nodes/session-token")
                    .header("authorization", "Bearer wrong")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"nodeId":"home"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let app = router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/nodes/session-token")
                    .header("authorization", "Bearer node-token")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"nodeId":"home"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: JsonValue = serde_json::from_slice(&bytes).unwrap();
        let minted = body["token"].as_str().unwrap();
        assert_eq!(
            state.session_tokens.verify(minted).unwrap().sub,
            "home"
        );
    }

    #[tokio::test]
    async fn listing_requires_auth() {
        let state = crate::test_support::test_state().await;
        let app = router().with_state(state);
        let resp = app
            .oneshot(Request::builder().uri("/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
