use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use uuid::Uuid;

use woly_proto::HostStatus;

use crate::auth::AuthUser;
use crate::error::{map_db_error, AppError, AppResult};
use crate::services::aggregator::{etag_for, etag_matches};
use crate::services::commands::{state as command_state, CommandRecord, CommandType, DispatchError};
use crate::state::AppState;

const PING_WAIT: Duration = Duration::from_secs(10);
const PORT_SCAN_WAIT: Duration = Duration::from_secs(30);

fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn map_dispatch_error(err: DispatchError, correlation_id: &str) -> AppError {
    match err {
        DispatchError::InvalidPayload(reason) => {
            AppError::bad_request(reason).with_correlation_id(correlation_id)
        }
        DispatchError::Db(err) => map_db_error(err).with_correlation_id(correlation_id),
    }
}

/// Reject a dispatch that failed immediately, mapping `node_offline` to 503.
fn check_dispatched(record: &CommandRecord, correlation_id: &str) -> AppResult<()> {
    if record.state == command_state::FAILED {
        let error = record.error.as_deref().unwrap_or("command failed");
        if error == "node_offline" {
            return Err(
                AppError::node_offline("Node is offline").with_correlation_id(correlation_id)
            );
        }
        return Err(AppError::internal(error).with_correlation_id(correlation_id));
    }
    Ok(())
}

/// Shape a freshly dispatched command into the standard response.
fn dispatch_response(record: CommandRecord, correlation_id: String) -> AppResult<Json<JsonValue>> {
    check_dispatched(&record, &correlation_id)?;
    Ok(Json(json!({
        "success": true,
        "commandId": record.id,
        "state": record.state,
        "correlationId": correlation_id,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostsQuery {
    node_id: Option<String>,
}

/// `GET /api/hosts` with deterministic ordering and ETag revalidation.
async fn list_hosts(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Query(query): Query<HostsQuery>,
    headers: HeaderMap,
) -> Response {
    let payload = state.aggregator.payload(query.node_id.as_deref()).await;
    let etag = etag_for(&payload);

    if let Some(if_none_match) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
    {
        if etag_matches(if_none_match, &etag) {
            return Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, etag)
                .body(axum::body::Body::empty())
                .unwrap_or_else(|_| StatusCode::NOT_MODIFIED.into_response());
        }
    }

    let mut response = Json(payload).into_response();
    if let Ok(value) = header::HeaderValue::from_str(&etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response
}

async fn get_host(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(fqn): Path<String>,
) -> AppResult<Json<JsonValue>> {
    let host = state
        .aggregator
        .host(&fqn)
        .await
        .ok_or_else(|| AppError::not_found("Host not found"))?;
    Ok(Json(serde_json::to_value(host).unwrap_or(JsonValue::Null)))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UpdateHostRequest {
    name: Option<String>,
    mac: Option<String>,
    ip: Option<String>,
    status: Option<HostStatus>,
    notes: Option<String>,
    tags: Option<Vec<String>>,
    wol_port: Option<u16>,
}

/// PUT routes through the owning node: the aggregator view updates when the
/// node confirms with a `host-updated` event.
async fn update_host(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(fqn): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpdateHostRequest>,
) -> AppResult<Json<JsonValue>> {
    let correlation_id = new_correlation_id();
    let host = state
        .aggregator
        .host(&fqn)
        .await
        .ok_or_else(|| AppError::not_found("Host not found").with_correlation_id(&correlation_id))?;

    let payload = json!({
        "currentName": host.host.name,
        "name": request.name.unwrap_or_else(|| host.host.name.clone()),
        "mac": request.mac,
        "ip": request.ip,
        "status": request.status,
        "notes": request.notes,
        "tags": request.tags,
        "wolPort": request.wol_port,
    });
    let record = state
        .commands
        .dispatch(
            &host.node_id,
            CommandType::UpdateHost,
            payload,
            idempotency_key(&headers),
            Some(correlation_id.clone()),
        )
        .await
        .map_err(|err| map_dispatch_error(err, &correlation_id))?;
    dispatch_response(record, correlation_id)
}

async fn delete_host(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(fqn): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<JsonValue>> {
    let correlation_id = new_correlation_id();
    let host = state
        .aggregator
        .host(&fqn)
        .await
        .ok_or_else(|| AppError::not_found("Host not found").with_correlation_id(&correlation_id))?;

    let record = state
        .commands
        .dispatch(
            &host.node_id,
            CommandType::DeleteHost,
            json!({"name": host.host.name}),
            idempotency_key(&headers),
            Some(correlation_id.clone()),
        )
        .await
        .map_err(|err| map_dispatch_error(err, &correlation_id))?;
    dispatch_response(record, correlation_id)
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WakeupRequest {
    #[serde(default)]
    verify: bool,
    wol_port: Option<u16>,
}

async fn wakeup_host(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(fqn): Path<String>,
    headers: HeaderMap,
    body: Option<Json<WakeupRequest>>,
) -> AppResult<Json<JsonValue>> {
    let correlation_id = new_correlation_id();
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let host = state
        .aggregator
        .host(&fqn)
        .await
        .ok_or_else(|| AppError::not_found("Host not found").with_correlation_id(&correlation_id))?;

    let payload = json!({
        "hostName": host.host.name,
        "mac": host.host.mac,
        "wolPort": request.wol_port.or(host.host.wol_port),
    });
    let record = state
        .commands
        .dispatch(
            &host.node_id,
            CommandType::Wake,
            payload,
            idempotency_key(&headers),
            Some(correlation_id.clone()),
        )
        .await
        .map_err(|err| map_dispatch_error(err, &correlation_id))?;

    if request.verify {
        // Best-effort: wait for the node's ack before answering.
        if let Ok(Some(done)) = state
            .commands
            .wait_for_completion(record.id, Duration::from_secs(15))
            .await
        {
            return dispatch_response(done, correlation_id);
        }
    }
    dispatch_response(record, correlation_id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanQuery {
    node_id: Option<String>,
}

/// Trigger a network scan on one node or every connected node. 409 when a
/// scan is already in flight.
async fn scan_hosts(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Query(query): Query<ScanQuery>,
) -> AppResult<Json<JsonValue>> {
    let correlation_id = new_correlation_id();
    let targets: Vec<String> = match query.node_id {
        Some(node_id) => vec![node_id],
        None => state.sessions.connected_nodes(),
    };
    if targets.is_empty() {
        return Err(
            AppError::node_offline("No nodes are connected").with_correlation_id(correlation_id)
        );
    }
    if targets.iter().any(|node| !state.scans.try_begin(node)) {
        return Err(
            AppError::conflict("Scan already in progress").with_correlation_id(correlation_id)
        );
    }

    let mut dispatched = Vec::new();
    let mut failures = 0usize;
    for node_id in &targets {
        let outcome = state
            .commands
            .dispatch(
                node_id,
                CommandType::Scan,
                json!({"immediate": true}),
                None,
                Some(correlation_id.clone()),
            )
            .await;
        match outcome {
            Ok(record) if record.state != command_state::FAILED => {
                dispatched.push(json!({"nodeId": node_id, "commandId": record.id}));
            }
            Ok(record) => {
                state.scans.finish(node_id);
                failures += 1;
                tracing::warn!(
                    node_id = %node_id,
                    error = record.error.as_deref().unwrap_or(""),
                    "scan dispatch rejected"
                );
            }
            Err(err) => {
                state.scans.finish(node_id);
                failures += 1;
                tracing::warn!(node_id = %node_id, error = %err, "scan dispatch failed");
            }
        }
    }

    if dispatched.is_empty() && failures > 0 {
        return Err(
            AppError::node_offline("No reachable nodes to scan").with_correlation_id(correlation_id)
        );
    }
    Ok(Json(json!({
        "success": true,
        "correlationId": correlation_id,
        "scans": dispatched,
    })))
}

/// Synchronous ICMP probe by way of the owning node.
async fn ping_host(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(fqn): Path<String>,
) -> AppResult<Json<JsonValue>> {
    let correlation_id = new_correlation_id();
    let host = state
        .aggregator
        .host(&fqn)
        .await
        .ok_or_else(|| AppError::not_found("Host not found").with_correlation_id(&correlation_id))?;

    let record = state
        .commands
        .dispatch(
            &host.node_id,
            CommandType::PingHost,
            json!({"name": host.host.name}),
            None,
            Some(correlation_id.clone()),
        )
        .await
        .map_err(|err| map_dispatch_error(err, &correlation_id))?;
    check_dispatched(&record, &correlation_id)?;

    let done = state
        .commands
        .wait_for_completion(record.id, PING_WAIT)
        .await
        .map_err(|err| map_db_error(err).with_correlation_id(&correlation_id))?
        .ok_or_else(|| {
            AppError::command_timeout("Ping command timed out").with_correlation_id(&correlation_id)
        })?;

    Ok(Json(json!({
        "success": done.state == command_state::ACKNOWLEDGED,
        "commandId": done.id,
        "correlationId": correlation_id,
        "error": done.error,
    })))
}

/// Cached open-port view; `scan-ports` refreshes it through the node.
async fn host_ports(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(fqn): Path<String>,
) -> AppResult<Json<JsonValue>> {
    let host = state
        .aggregator
        .host(&fqn)
        .await
        .ok_or_else(|| AppError::not_found("Host not found"))?;
    Ok(Json(json!({
        "fqn": host.fqn,
        "ports": host.host.ports,
        "portsScannedAt": host.host.ports_scanned_at,
        "portsExpireAt": host.host.ports_expire_at,
    })))
}

async fn scan_host_ports(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(fqn): Path<String>,
) -> AppResult<Json<JsonValue>> {
    let correlation_id = new_correlation_id();
    let host = state
        .aggregator
        .host(&fqn)
        .await
        .ok_or_else(|| AppError::not_found("Host not found").with_correlation_id(&correlation_id))?;

    let record = state
        .commands
        .dispatch(
            &host.node_id,
            CommandType::ScanHostPorts,
            json!({"name": host.host.name}),
            None,
            Some(correlation_id.clone()),
        )
        .await
        .map_err(|err| map_dispatch_error(err, &correlation_id))?;
    check_dispatched(&record, &correlation_id)?;

    let done = state
        .commands
        .wait_for_completion(record.id, PORT_SCAN_WAIT)
        .await
        .map_err(|err| map_db_error(err).with_correlation_id(&correlation_id))?
        .ok_or_else(|| {
            AppError::command_timeout("Port scan timed out").with_correlation_id(&correlation_id)
        })?;

    // The refreshed ports arrive on the host-updated event that precedes the
    // node's ack; re-read the projection.
    let refreshed = state.aggregator.host(&fqn).await;
    Ok(Json(json!({
        "success": done.state == command_state::ACKNOWLEDGED,
        "commandId": done.id,
        "correlationId": correlation_id,
        "ports": refreshed.as_ref().and_then(|h| h.host.ports.clone()),
        "portsScannedAt": refreshed.as_ref().and_then(|h| h.host.ports_scanned_at),
    })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn host_history(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(fqn): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<JsonValue>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    let entries = state
        .aggregator
        .history(&fqn, limit)
        .await
        .map_err(map_db_error)?;
    Ok(Json(json!({"fqn": fqn, "history": entries})))
}

#[derive(Debug, Deserialize)]
struct UptimeQuery {
    hours: Option<i64>,
}

async fn host_uptime(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(fqn): Path<String>,
    Query(query): Query<UptimeQuery>,
) -> AppResult<Json<JsonValue>> {
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 90);
    let report = state
        .aggregator
        .uptime(&fqn, ChronoDuration::hours(hours))
        .await
        .map_err(map_db_error)?;
    Ok(Json(serde_json::to_value(report).unwrap_or(JsonValue::Null)))
}

/// The scan route is split out so the very-strict rate limit class can be
/// layered onto it alone.
pub fn scan_router() -> Router<AppState> {
    Router::new().route("/hosts/scan", post(scan_hosts))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/hosts", get(list_hosts))
        .route("/hosts/wakeup/{fqn}", post(wakeup_host))
        .route("/hosts/ping/{fqn}", get(ping_host))
        .route("/hosts/ports/{fqn}", get(host_ports))
        .route("/hosts/scan-ports/{fqn}", get(scan_host_ports))
        .route(
            "/hosts/{fqn}",
            put(update_host).get(get_host).delete(delete_host),
        )
        .route("/hosts/{fqn}/history", get(host_history))
        .route("/hosts/{fqn}/uptime", get(host_uptime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NodeEvent;
    use crate::test_support::{seed_aggregated_host, test_state};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn authed(state: &AppState) -> String {
        let (jwt, _) = state.jwt.issue(crate::auth::Role::Operator).unwrap();
        format!("Bearer {jwt}")
    }

    async fn body_json(resp: Response) -> JsonValue {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null)
    }

    #[tokio::test]
    async fn etag_revalidation_returns_304_until_content_changes() {
        let state = test_state().await;
        seed_aggregated_host(&state, "home", "office").await;
        let auth = authed(&state).await;

        let app = router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/hosts")
                    .header("authorization", &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let etag = resp
            .headers()
            .get(header::ETAG)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        // Matching If-None-Match yields an empty 304.
        let app = router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/hosts")
                    .header("authorization", &auth)
                    .header("if-none-match", &etag)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());

        // Weak validators match too.
        let app = router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/hosts")
                    .header("authorization", &auth)
                    .header("if-none-match", format!("W/{etag}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

        // A host event on a different fqn changes the ETag.
        seed_aggregated_host(&state, "home", "nas").await;
        let app = router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/hosts")
                    .header("authorization", &auth)
                    .header("if-none-match", &etag)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let new_etag = resp.headers().get(header::ETAG).unwrap().to_str().unwrap();
        assert_ne!(new_etag, etag);
    }

    #[tokio::test]
    async fn wakeup_queues_for_offline_node_and_honors_idempotency_key() {
        let state = test_state().await;
        seed_aggregated_host(&state, "home", "office").await;
        let auth = authed(&state).await;

        let request = || {
            Request::builder()
                .method("POST")
                .uri("/hosts/wakeup/office@home")
                .header("authorization", &auth)
                .header("idempotency-key", "k1")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap()
        };

        let app = router().with_state(state.clone());
        let first = body_json(app.oneshot(request()).await.unwrap()).await;
        assert_eq!(first["success"], true);
        let command_id = first["commandId"].as_str().unwrap().to_string();

        let app = router().with_state(state.clone());
        let second = body_json(app.oneshot(request()).await.unwrap()).await;
        assert_eq!(second["commandId"].as_str().unwrap(), command_id);
    }

    #[tokio::test]
    async fn wakeup_unknown_host_is_404() {
        let state = test_state().await;
        let auth = authed(&state).await;
        let app = router().with_state(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/hosts/wakeup/ghost@nowhere")
                    .header("authorization", &auth)
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ping_offline_node_is_503() {
        let state = test_state().await;
        seed_aggregated_host(&state, "home", "office").await;
        let auth = authed(&state).await;
        let app = router().with_state(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/hosts/ping/office@home")
                    .header("authorization", &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn scan_with_no_connected_nodes_is_503_and_repeat_scan_conflicts() {
        let state = test_state().await;
        let auth = authed(&state).await;

        let app = scan_router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/hosts/scan")
                    .header("authorization", &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        // A scan of an offline node is rejected as unavailable, not queued.
        let app = scan_router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/hosts/scan?nodeId=home")
                    .header("authorization", &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        // While a scan is marked in flight, a second trigger conflicts.
        assert!(state.scans.try_begin("home"));
        let app = scan_router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/hosts/scan?nodeId=home")
                    .header("authorization", &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn history_and_uptime_read_the_transition_log() {
        let state = test_state().await;
        seed_aggregated_host(&state, "home", "office").await;
        // Flip the status once so history has two entries.
        let mut host = state.aggregator.host("office@home").await.unwrap().host;
        host.status = HostStatus::Asleep;
        state
            .aggregator
            .apply(&NodeEvent::HostUpdated {
                node_id: "home".to_string(),
                location: "home".to_string(),
                host,
            })
            .await;

        let auth = authed(&state).await;
        let app = router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/hosts/office@home/history")
                    .header("authorization", &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["history"].as_array().unwrap().len(), 2);

        let app = router().with_state(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/hosts/office@home/uptime?hours=1")
                    .header("authorization", &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body["uptimePercent"].as_f64().is_some());
    }
}
