use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::AgentConfig;
use crate::discovery::Scanner;
use crate::events::{EventSender, HostEvent};
use crate::hostdb::{HostPatch, HostRecord, HostStore, NewHost, StoreError};
use crate::mac_vendor::{MacVendorLookup, VendorError};
use crate::wol;

/// Origin suffixes allowed in development alongside the explicit list.
const DEV_ORIGIN_SUFFIXES: &[&str] = &[".ngrok-free.app", ".netlify.app", ".helios.kaonis.com"];

#[derive(Clone)]
pub struct AgentState {
    pub config: AgentConfig,
    pub store: HostStore,
    pub scanner: Arc<Scanner>,
    pub events: EventSender,
    pub vendors: Arc<MacVendorLookup>,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": message,
        })),
    )
        .into_response()
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound => error_response(StatusCode::NOT_FOUND, "Host not found"),
        StoreError::Conflict(what) => error_response(
            StatusCode::CONFLICT,
            &format!("Host with this {what} already exists"),
        ),
        StoreError::Invalid { field, reason } => {
            error_response(StatusCode::BAD_REQUEST, &format!("invalid {field}: {reason}"))
        }
        StoreError::Db(err) => {
            tracing::error!(error = %err, "host store error");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

fn host_json(record: &HostRecord) -> JsonValue {
    serde_json::to_value(record.to_wire()).unwrap_or(JsonValue::Null)
}

/// Constant-time API key check. Accepts `Authorization: Bearer` or
/// `X-API-Key`; only enforced when `NODE_API_KEY` is configured.
async fn require_api_key(
    State(state): State<AgentState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_key.as_deref() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|value| value.to_str().ok())
        })
        .map(str::trim)
        .unwrap_or("");

    let matches = presented.len() == expected.len()
        && presented.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 1;
    if !matches {
        return error_response(StatusCode::UNAUTHORIZED, "Missing or invalid API key");
    }
    next.run(request).await
}

async fn health() -> Json<JsonValue> {
    Json(json!({
        "status": "ok",
        "name": "woly-agent",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_hosts(State(state): State<AgentState>) -> Response {
    match state.store.list().await {
        Ok(records) => {
            let hosts: Vec<JsonValue> = records.iter().map(host_json).collect();
            Json(hosts).into_response()
        }
        Err(err) => store_error(StoreError::Db(err)),
    }
}

async fn get_host(State(state): State<AgentState>, Path(name): Path<String>) -> Response {
    match state.store.get_by_name(&name).await {
        Ok(Some(record)) => Json(host_json(&record)).into_response(),
        Ok(None) => store_error(StoreError::NotFound),
        Err(err) => store_error(StoreError::Db(err)),
    }
}

async fn create_host(
    State(state): State<AgentState>,
    Json(request): Json<NewHost>,
) -> Response {
    match state.store.insert(request).await {
        Ok(record) => {
            let _ = state.events.send(HostEvent::Discovered(record.clone()));
            (StatusCode::CREATED, Json(host_json(&record))).into_response()
        }
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UpdateHostRequest {
    name: Option<String>,
    mac: Option<String>,
    ip: Option<String>,
    status: Option<woly_proto::HostStatus>,
    notes: Option<String>,
    tags: Option<Vec<String>>,
    wol_port: Option<u16>,
}

async fn update_host(
    State(state): State<AgentState>,
    Path(name): Path<String>,
    Json(request): Json<UpdateHostRequest>,
) -> Response {
    let patch = HostPatch {
        name: request.name,
        mac: request.mac,
        ip: request.ip,
        status: request.status,
        notes: request.notes,
        tags: request.tags,
        wol_port: request.wol_port,
    };
    match state.store.update(&name, patch).await {
        Ok(record) => {
            let _ = state.events.send(HostEvent::Updated(record.clone()));
            Json(host_json(&record)).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn delete_host(State(state): State<AgentState>, Path(name): Path<String>) -> Response {
    match state.store.delete_by_name(&name).await {
        Ok(record) => {
            let _ = state.events.send(HostEvent::Removed(record));
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WakeupRequest {
    wol_port: Option<u16>,
}

async fn wakeup_host(
    State(state): State<AgentState>,
    Path(name): Path<String>,
    body: Option<Json<WakeupRequest>>,
) -> Response {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let record = match state.store.get_by_name(&name).await {
        Ok(Some(record)) => record,
        Ok(None) => return store_error(StoreError::NotFound),
        Err(err) => return store_error(StoreError::Db(err)),
    };

    let port = request.wol_port.unwrap_or_else(|| record.wol_port());
    match wol::send_magic_packet(&record.mac, Some(port)).await {
        Ok(()) => Json(json!({
            "success": true,
            "message": format!("magic packet sent to {name}"),
        }))
        .into_response(),
        Err(err) => {
            tracing::error!(name = %name, error = %err, "wake failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to send magic packet")
        }
    }
}

/// 409 while a sweep is running; otherwise schedule one in the background.
async fn trigger_scan(State(state): State<AgentState>) -> Response {
    if state.scanner.is_scanning() {
        return error_response(StatusCode::CONFLICT, "Scan already in progress");
    }
    let scanner = state.scanner.clone();
    tokio::spawn(async move {
        if let Err(err) = scanner.sync_with_network().await {
            tracing::warn!(error = %err, "triggered scan failed");
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({"success": true, "message": "scan scheduled"})),
    )
        .into_response()
}

async fn mac_vendor(State(state): State<AgentState>, Path(mac): Path<String>) -> Response {
    if !woly_proto::is_valid_mac(&woly_proto::normalize_mac(&mac)) {
        return error_response(StatusCode::BAD_REQUEST, "invalid MAC address");
    }
    match state.vendors.lookup(&mac).await {
        Ok(vendor) => Json(json!({"mac": woly_proto::normalize_mac(&mac), "vendor": vendor}))
            .into_response(),
        Err(VendorError::NotFound) => error_response(StatusCode::NOT_FOUND, "Vendor not found"),
        Err(VendorError::Upstream(reason)) => {
            tracing::warn!(reason = %reason, "vendor lookup unavailable");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Vendor lookup unavailable")
        }
    }
}

/// Whether a browser origin may call the local API.
pub fn origin_allowed(origin: &str, allowed: &[String], dev_cors: bool) -> bool {
    if allowed.iter().any(|candidate| candidate == origin) {
        return true;
    }
    if !dev_cors {
        return false;
    }
    let host = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin);
    DEV_ORIGIN_SUFFIXES
        .iter()
        .any(|suffix| host.ends_with(suffix))
}

fn cors_layer(config: &AgentConfig) -> CorsLayer {
    let allowed = config.cors_origins.clone();
    let dev_cors = config.dev_cors;
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|origin| origin_allowed(origin, &allowed, dev_cors))
                .unwrap_or(false)
        }))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

pub fn router(state: AgentState) -> Router {
    let protected = Router::new()
        .route("/hosts", get(list_hosts).post(create_host))
        .route("/hosts/scan", post(trigger_scan))
        .route("/hosts/wakeup/{name}", post(wakeup_host))
        .route("/hosts/mac-vendor/{mac}", get(mac_vendor))
        .route(
            "/hosts/{name}",
            get(get_host).put(update_host).delete(delete_host),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(cors_layer(&state.config))
        .with_state(state)
}
