use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{map_db_error, AppError, AppResult};
use crate::services::schedules::{compute_next_trigger, Frequency, ScheduleRow};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleResponse {
    id: String,
    host_fqn: String,
    scheduled_time: String,
    timezone: String,
    frequency: String,
    enabled: bool,
    notify_on_wake: bool,
    last_triggered: Option<DateTime<Utc>>,
    next_trigger: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ScheduleRow> for ScheduleResponse {
    fn from(row: ScheduleRow) -> Self {
        Self {
            id: row.id,
            host_fqn: row.host_fqn,
            scheduled_time: row.scheduled_time,
            timezone: row.timezone,
            frequency: row.frequency,
            enabled: row.enabled,
            notify_on_wake: row.notify_on_wake,
            last_triggered: row.last_triggered,
            next_trigger: row.next_trigger,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateScheduleRequest {
    host_fqn: Option<String>,
    scheduled_time: String,
    timezone: Option<String>,
    frequency: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    notify_on_wake: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UpdateScheduleRequest {
    scheduled_time: Option<String>,
    timezone: Option<String>,
    frequency: Option<String>,
    enabled: Option<bool>,
    notify_on_wake: Option<bool>,
}

fn validate_inputs(
    scheduled_time: &str,
    timezone: &str,
    frequency: &str,
) -> AppResult<Frequency> {
    let frequency: Frequency = frequency
        .parse()
        .map_err(|err: String| AppError::bad_request(err))?;
    if crate::services::schedules::parse_scheduled_time(scheduled_time).is_none() {
        return Err(AppError::bad_request(format!(
            "scheduledTime must be HH:MM, got {scheduled_time:?}"
        )));
    }
    if timezone.parse::<chrono_tz::Tz>().is_err() {
        return Err(AppError::bad_request(format!(
            "unknown timezone {timezone:?}"
        )));
    }
    Ok(frequency)
}

async fn insert_schedule(
    state: &AppState,
    host_fqn: String,
    request: CreateScheduleRequest,
) -> AppResult<ScheduleResponse> {
    let timezone = request.timezone.unwrap_or_else(|| "UTC".to_string());
    let frequency = validate_inputs(&request.scheduled_time, &timezone, &request.frequency)?;

    if state.aggregator.host(&host_fqn).await.is_none() {
        return Err(AppError::not_found("Host not found"));
    }

    let now = Utc::now();
    let next_trigger = if request.enabled {
        compute_next_trigger(frequency, &request.scheduled_time, &timezone, now)
    } else {
        None
    };
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO wake_schedules
            (id, host_fqn, scheduled_time, timezone, frequency, enabled, notify_on_wake, next_trigger, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
        "#,
    )
    .bind(&id)
    .bind(&host_fqn)
    .bind(&request.scheduled_time)
    .bind(&timezone)
    .bind(frequency.as_str())
    .bind(request.enabled)
    .bind(request.notify_on_wake)
    .bind(next_trigger)
    .bind(now)
    .execute(&state.db)
    .await
    .map_err(map_db_error)?;

    let row: ScheduleRow = sqlx::query_as("SELECT * FROM wake_schedules WHERE id = $1")
        .bind(&id)
        .fetch_one(&state.db)
        .await
        .map_err(map_db_error)?;
    Ok(row.into())
}

async fn list_schedules(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
) -> AppResult<Json<Vec<ScheduleResponse>>> {
    let rows: Vec<ScheduleRow> =
        sqlx::query_as("SELECT * FROM wake_schedules ORDER BY created_at ASC")
            .fetch_all(&state.db)
            .await
            .map_err(map_db_error)?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

async fn create_schedule(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Json(request): Json<CreateScheduleRequest>,
) -> AppResult<(StatusCode, Json<ScheduleResponse>)> {
    let host_fqn = request
        .host_fqn
        .clone()
        .filter(|fqn| !fqn.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("hostFqn is required"))?;
    let response = insert_schedule(&state, host_fqn, request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_schedule(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<ScheduleResponse>> {
    let row: Option<ScheduleRow> = sqlx::query_as("SELECT * FROM wake_schedules WHERE id = $1")
        .bind(&id)
        .fetch_optional(&state.db)
        .await
        .map_err(map_db_error)?;
    row.map(|row| Json(row.into()))
        .ok_or_else(|| AppError::not_found("Schedule not found"))
}

async fn update_schedule(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(id): Path<String>,
    Json(request): Json<UpdateScheduleRequest>,
) -> AppResult<Json<ScheduleResponse>> {
    let row: Option<ScheduleRow> = sqlx::query_as("SELECT * FROM wake_schedules WHERE id = $1")
        .bind(&id)
        .fetch_optional(&state.db)
        .await
        .map_err(map_db_error)?;
    let row = row.ok_or_else(|| AppError::not_found("Schedule not found"))?;

    let scheduled_time = request.scheduled_time.unwrap_or(row.scheduled_time);
    let timezone = request.timezone.unwrap_or(row.timezone);
    let frequency_text = request.frequency.unwrap_or(row.frequency);
    let enabled = request.enabled.unwrap_or(row.enabled);
    let notify_on_wake = request.notify_on_wake.unwrap_or(row.notify_on_wake);
    let frequency = validate_inputs(&scheduled_time, &timezone, &frequency_text)?;

    let now = Utc::now();
    let next_trigger = if enabled {
        compute_next_trigger(frequency, &scheduled_time, &timezone, now)
    } else {
        None
    };
    sqlx::query(
        r#"
        UPDATE wake_schedules
        SET scheduled_time = $2, timezone = $3, frequency = $4, enabled = $5,
            notify_on_wake = $6, next_trigger = $7, updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(&id)
    .bind(&scheduled_time)
    .bind(&timezone)
    .bind(frequency.as_str())
    .bind(enabled)
    .bind(notify_on_wake)
    .bind(next_trigger)
    .bind(now)
    .execute(&state.db)
    .await
    .map_err(map_db_error)?;

    let row: ScheduleRow = sqlx::query_as("SELECT * FROM wake_schedules WHERE id = $1")
        .bind(&id)
        .fetch_one(&state.db)
        .await
        .map_err(map_db_error)?;
    Ok(Json(row.into()))
}

async fn delete_schedule(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let result = sqlx::query("DELETE FROM wake_schedules WHERE id = $1")
        .bind(&id)
        .execute(&state.db)
        .await
        .map_err(map_db_error)?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Schedule not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_host_schedules(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(fqn): Path<String>,
) -> AppResult<Json<Vec<ScheduleResponse>>> {
    let rows: Vec<ScheduleRow> =
        sqlx::query_as("SELECT * FROM wake_schedules WHERE host_fqn = $1 ORDER BY created_at ASC")
            .bind(&fqn)
            .fetch_all(&state.db)
            .await
            .map_err(map_db_error)?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

async fn create_host_schedule(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(fqn): Path<String>,
    Json(request): Json<CreateScheduleRequest>,
) -> AppResult<(StatusCode, Json<ScheduleResponse>)> {
    let response = insert_schedule(&state, fqn, request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/schedules/{id}",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route(
            "/hosts/{fqn}/schedules",
            get(list_host_schedules).post(create_host_schedule),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_aggregated_host, test_state};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    async fn authed(state: &AppState) -> String {
        let (jwt, _) = state.jwt.issue(crate::auth::Role::Operator).unwrap();
        format!("Bearer {jwt}")
    }

    #[tokio::test]
    async fn create_computes_next_trigger() {
        let state = test_state().await;
        seed_aggregated_host(&state, "home", "office").await;
        let auth = authed(&state).await;

        let app = router().with_state(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/schedules")
                    .header("authorization", &auth)
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "hostFqn": "office@home",
                            "scheduledTime": "08:00",
                            "timezone": "UTC",
                            "frequency": "daily"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["nextTrigger"].as_str().is_some());
        assert_eq!(body["frequency"], "daily");
    }

    #[tokio::test]
    async fn rejects_invalid_time_frequency_and_timezone() {
        let state = test_state().await;
        seed_aggregated_host(&state, "home", "office").await;
        let auth = authed(&state).await;

        for payload in [
            json!({"hostFqn": "office@home", "scheduledTime": "25:00", "frequency": "daily"}),
            json!({"hostFqn": "office@home", "scheduledTime": "08:00", "frequency": "hourly"}),
            json!({"hostFqn": "office@home", "scheduledTime": "08:00", "frequency": "daily", "timezone": "Mars/Olympus"}),
        ] {
            let app = router().with_state(state.clone());
            let resp = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/schedules")
                        .header("authorization", &auth)
                        .header("content-type", "application/json")
                        .body(Body::from(payload.to_string()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn disabling_clears_next_trigger() {
        let state = test_state().await;
        seed_aggregated_host(&state, "home", "office").await;
        let auth = authed(&state).await;

        let app = router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/hosts/office@home/schedules")
                    .header("authorization", &auth)
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"scheduledTime": "08:00", "frequency": "daily"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let created: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let id = created["id"].as_str().unwrap();

        let app = router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/schedules/{id}"))
                    .header("authorization", &auth)
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"enabled": false}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let updated: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(updated["enabled"], false);
        assert!(updated["nextTrigger"].is_null());
    }

    #[tokio::test]
    async fn delete_then_get_is_404() {
        let state = test_state().await;
        seed_aggregated_host(&state, "home", "office").await;
        let auth = authed(&state).await;

        let app = router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/schedules")
                    .header("authorization", &auth)
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"hostFqn": "office@home", "scheduledTime": "08:00", "frequency": "once"})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let created: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let id = created["id"].as_str().unwrap();

        let app = router().with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/schedules/{id}"))
                    .header("authorization", &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let app = router().with_state(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/schedules/{id}"))
                    .header("authorization", &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
