use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;

use crate::error::AppError;
use crate::services::session::UpgradeRejection;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

fn is_tls(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .map(|proto| proto.eq_ignore_ascii_case("https") || proto.eq_ignore_ascii_case("wss"))
        .unwrap_or(false)
}

/// Node upgrade endpoint. Authentication happens before acceptance; the
/// session manager owns the socket from the moment it opens.
async fn node_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let subprotocols = headers
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok());

    let grant = match state.sessions.authorize_upgrade(
        bearer,
        subprotocols,
        query.token.as_deref(),
        is_tls(&headers),
        addr.ip(),
    ) {
        Ok(grant) => grant,
        Err(UpgradeRejection::TlsRequired) => {
            return (StatusCode::UPGRADE_REQUIRED, "TLS required").into_response();
        }
        Err(UpgradeRejection::AuthExpired) => {
            return AppError::unauthorized("Session token expired")
                .with_code("auth_expired")
                .into_response();
        }
        Err(UpgradeRejection::Unauthorized) => {
            return AppError::unauthorized("Invalid credentials").into_response();
        }
        Err(UpgradeRejection::TooManyConnections) => {
            return AppError::too_many_requests("Too many connections from this address", 30)
                .into_response();
        }
    };

    let sessions = state.sessions.clone();
    ws.protocols(["bearer"])
        .on_upgrade(move |socket| sessions.handle_socket(socket, grant, addr.ip()))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/node", any(node_upgrade))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn tls_detection_reads_forwarded_proto() {
        let mut headers = HeaderMap::new();
        assert!(!is_tls(&headers));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert!(is_tls(&headers));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        assert!(!is_tls(&headers));
    }
}
