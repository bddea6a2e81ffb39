use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid DATABASE_URL {database_url}"))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(8));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(8))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database pool for {database_url}"))?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Idempotent DDL; safe to run on every boot.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            location TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'offline',
            last_heartbeat TEXT,
            capabilities TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS commands (
            id TEXT PRIMARY KEY,
            node_id TEXT NOT NULL,
            type TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            idempotency_key TEXT,
            state TEXT NOT NULL DEFAULT 'queued',
            error TEXT,
            correlation_id TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sent_at TEXT,
            completed_at TEXT
        )
        "#,
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_commands_idempotency
            ON commands (node_id, type, idempotency_key)
            WHERE idempotency_key IS NOT NULL
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_commands_node_state
            ON commands (node_id, state, created_at)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS host_status_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fqn TEXT NOT NULL,
            from_status TEXT,
            to_status TEXT NOT NULL,
            at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_host_status_history_fqn_at
            ON host_status_history (fqn, at)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS wake_schedules (
            id TEXT PRIMARY KEY,
            host_fqn TEXT NOT NULL,
            scheduled_time TEXT NOT NULL,
            timezone TEXT NOT NULL,
            frequency TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            notify_on_wake INTEGER NOT NULL DEFAULT 0,
            last_triggered TEXT,
            next_trigger TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_wake_schedules_due
            ON wake_schedules (enabled, next_trigger)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS webhooks (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            events TEXT NOT NULL DEFAULT '[]',
            secret TEXT,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS webhook_deliveries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            webhook_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            status TEXT NOT NULL,
            response_status INTEGER,
            error TEXT,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("failed to apply schema")?;
    }
    Ok(())
}
