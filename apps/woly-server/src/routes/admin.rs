use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::auth::AdminUser;
use crate::error::{map_db_error, AppError, AppResult};
use crate::services::commands::CommandRecord;
use crate::state::AppState;

/// Remove a node and everything derived from it: its row, its commands, and
/// its live connection if one exists.
async fn delete_node(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let result = sqlx::query("DELETE FROM nodes WHERE id = $1")
        .bind(&id)
        .execute(&state.db)
        .await
        .map_err(map_db_error)?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Node not found"));
    }

    sqlx::query("DELETE FROM commands WHERE node_id = $1")
        .bind(&id)
        .execute(&state.db)
        .await
        .map_err(map_db_error)?;
    state.sessions.disconnect(&id);
    state.aggregator.remove_node(&id).await;
    tracing::info!(node_id = %id, "node deleted by admin");
    Ok(StatusCode::NO_CONTENT)
}

async fn stats(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
) -> AppResult<Json<JsonValue>> {
    let node_counts: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM nodes GROUP BY status")
            .fetch_all(&state.db)
            .await
            .map_err(map_db_error)?;
    let mut nodes = serde_json::Map::new();
    for (status, count) in node_counts {
        nodes.insert(status, json!(count));
    }

    let commands = state.commands.stats().await.map_err(map_db_error)?;
    Ok(Json(json!({
        "nodes": nodes,
        "connections": state.sessions.connection_count(),
        "hosts": state.aggregator.host_count().await,
        "commands": commands,
        "protocol": state.sessions.counters.snapshot(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandsQuery {
    node_id: Option<String>,
    limit: Option<i64>,
}

async fn list_commands(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    Query(query): Query<CommandsQuery>,
) -> AppResult<Json<Vec<CommandRecord>>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let records = state
        .commands
        .list(query.node_id.as_deref(), limit)
        .await
        .map_err(map_db_error)?;
    Ok(Json(records))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/nodes/{id}", delete(delete_node))
        .route("/admin/stats", get(stats))
        .route("/admin/commands", get(list_commands))
}
