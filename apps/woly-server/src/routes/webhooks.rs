use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{map_db_error, AppError, AppResult};
use crate::state::AppState;

/// Events subscribers may register for; `*` subscribes to everything.
const KNOWN_EVENTS: &[&str] = &[
    "node.online",
    "node.offline",
    "host.discovered",
    "host.status-changed",
    "host.removed",
    "command.completed",
    "command.failed",
    "schedule.triggered",
];

#[derive(Debug, Deserialize)]
struct CreateWebhookRequest {
    url: String,
    events: Vec<String>,
    secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
struct WebhookResponse {
    id: String,
    url: String,
    events: SqlJson<Vec<String>>,
    /// Presence only; the secret itself is never echoed back.
    #[serde(skip)]
    secret: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookListEntry {
    id: String,
    url: String,
    events: Vec<String>,
    has_secret: bool,
    created_at: DateTime<Utc>,
}

impl From<WebhookResponse> for WebhookListEntry {
    fn from(row: WebhookResponse) -> Self {
        Self {
            id: row.id,
            url: row.url,
            events: row.events.0,
            has_secret: row.secret.as_deref().is_some_and(|s| !s.is_empty()),
            created_at: row.created_at,
        }
    }
}

async fn create_webhook(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Json(request): Json<CreateWebhookRequest>,
) -> AppResult<(StatusCode, Json<WebhookListEntry>)> {
    let url = request.url.trim().to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(AppError::bad_request("url must be http(s)"));
    }
    if request.events.is_empty() {
        return Err(AppError::bad_request("events must not be empty"));
    }
    for event in &request.events {
        if event != "*" && !KNOWN_EVENTS.contains(&event.as_str()) {
            return Err(AppError::bad_request(format!("unknown event {event:?}")));
        }
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO webhooks (id, url, events, secret, created_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(&id)
    .bind(&url)
    .bind(SqlJson(request.events.clone()))
    .bind(request.secret.as_deref().filter(|s| !s.is_empty()))
    .bind(Utc::now())
    .execute(&state.db)
    .await
    .map_err(map_db_error)?;

    let row: WebhookResponse =
        sqlx::query_as("SELECT id, url, events, secret, created_at FROM webhooks WHERE id = $1")
            .bind(&id)
            .fetch_one(&state.db)
            .await
            .map_err(map_db_error)?;
    Ok((StatusCode::CREATED, Json(row.into())))
}

async fn list_webhooks(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
) -> AppResult<Json<Vec<WebhookListEntry>>> {
    let rows: Vec<WebhookResponse> = sqlx::query_as(
        "SELECT id, url, events, secret, created_at FROM webhooks ORDER BY created_at ASC",
    )
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

async fn delete_webhook(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let result = sqlx::query("DELETE FROM webhooks WHERE id = $1")
        .bind(&id)
        .execute(&state.db)
        .await
        .map_err(map_db_error)?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Webhook not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DeliveriesQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
struct DeliveryEntry {
    id: i64,
    webhook_id: String,
    event_type: String,
    attempt: i64,
    status: String,
    response_status: Option<i64>,
    error: Option<String>,
    payload: SqlJson<JsonValue>,
    created_at: DateTime<Utc>,
}

async fn list_deliveries(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<DeliveriesQuery>,
) -> AppResult<Json<Vec<DeliveryEntry>>> {
    let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM webhooks WHERE id = $1")
        .bind(&id)
        .fetch_optional(&state.db)
        .await
        .map_err(map_db_error)?;
    if exists.is_none() {
        return Err(AppError::not_found("Webhook not found"));
    }

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let rows: Vec<DeliveryEntry> = sqlx::query_as(
        r#"
        SELECT id, webhook_id, event_type, attempt, status, response_status, error, payload, created_at
        FROM webhook_deliveries
        WHERE webhook_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT $2
        "#,
    )
    .bind(&id)
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;
    Ok(Json(rows))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks", get(list_webhooks).post(create_webhook))
        .route("/webhooks/{id}", axum::routing::delete(delete_webhook))
        .route("/webhooks/{id}/deliveries", get(list_deliveries))
}
