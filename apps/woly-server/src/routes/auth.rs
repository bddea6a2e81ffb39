use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::auth::{token_in_list, Role};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
struct TokenRequest {
    role: Option<String>,
}

fn bearer(headers: &HeaderMap) -> AppResult<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::unauthorized("Invalid credentials"))
}

/// Exchange a static operator/admin bearer for a signed JWT. The failure
/// response is identical for bad tokens, unknown roles backed by empty
/// allowlists, and mismatched credentials; nothing about the configuration
/// leaks.
async fn exchange_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<TokenRequest>>,
) -> AppResult<Json<JsonValue>> {
    let token = bearer(&headers)?;
    let requested = body
        .as_ref()
        .and_then(|b| b.role.as_deref())
        .unwrap_or("operator");
    let role: Role = requested
        .parse()
        .map_err(|_: AppError| AppError::unauthorized("Invalid credentials"))?;

    let permitted = match role {
        // An empty admin allowlist yields the same generic 401 as a wrong
        // token; requesting admin must not reveal whether admins exist.
        Role::Admin => token_in_list(&token, &state.config.admin_tokens),
        Role::Operator => {
            token_in_list(&token, &state.config.operator_tokens)
                || token_in_list(&token, &state.config.admin_tokens)
        }
    };
    if !permitted {
        return Err(AppError::unauthorized("Invalid credentials"));
    }

    let (jwt, expires_in) = state.jwt.issue(role)?;
    Ok(Json(json!({
        "token": jwt,
        "expiresInSeconds": expires_in,
        "role": role.as_str(),
    })))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/auth/token", post(exchange_token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn call(token: Option<&str>, body: JsonValue) -> (StatusCode, JsonValue) {
        let app = router().with_state(crate::test_support::test_state().await);
        let mut request = Request::builder()
            .method("POST")
            .uri("/auth/token")
            .header("content-type", "application/json");
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let resp = app
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null);
        (status, body)
    }

    #[tokio::test]
    async fn operator_token_exchanges_for_jwt() {
        let (status, body) = call(Some("operator-token"), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "operator");
        assert!(body["token"].as_str().unwrap().split('.').count() == 3);
    }

    #[tokio::test]
    async fn admin_token_can_request_admin_role() {
        let (status, body) = call(Some("admin-token"), json!({"role": "admin"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "admin");
    }

    #[tokio::test]
    async fn wrong_token_is_generic_401() {
        let (status, body) = call(Some("nope"), json!({})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid credentials");
    }

    #[tokio::test]
    async fn operator_token_cannot_escalate_to_admin() {
        let (status, _) = call(Some("operator-token"), json!({"role": "admin"})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_bearer_is_401() {
        let (status, _) = call(None, json!({})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn empty_admin_list_yields_generic_401() {
        let mut state = crate::test_support::test_state().await;
        let mut config = state.config.clone();
        config.admin_tokens = Vec::new();
        state.config = config;

        let app = router().with_state(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/token")
                    .header("authorization", "Bearer admin-token")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"role": "admin"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: JsonValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message"], "Invalid credentials");
    }
}
