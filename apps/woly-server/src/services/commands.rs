use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sqlx::types::Json as SqlJson;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use woly_proto::{
    CommandResultData, DeleteHostData, HostRefData, ScanData, ServerFrame, ServerMessage,
    UpdateHostData, WakeData,
};

use crate::config::ServerConfig;
use crate::services::session::NodeLink;
use crate::services::webhooks::WebhookDispatcher;

/// Transport-level failures that may be retried. Everything else is final:
/// `node_offline` past the TTL, payload validation failures, unsupported
/// commands, and node-reported error codes in [`NODE_ERROR_DENYLIST`].
pub const RETRYABLE_ERRORS: &[&str] = &["send_failed"];

/// Node-reported error codes that must never be retried.
pub const NODE_ERROR_DENYLIST: &[&str] = &[
    "not_implemented",
    "host_not_found",
    "validation_failed",
    "unsupported_command",
];

/// Command types a disconnected node may still accumulate, bounded by
/// `OFFLINE_COMMAND_TTL_MS`. Interactive probes fail fast instead.
pub const OFFLINE_QUEUE_ALLOWLIST: &[CommandType] = &[
    CommandType::Wake,
    CommandType::UpdateHost,
    CommandType::DeleteHost,
];

/// Window during which a terminal command still satisfies idempotent
/// re-dispatch with the same key.
fn dedup_terminal_window() -> ChronoDuration {
    ChronoDuration::minutes(10)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Wake,
    Scan,
    UpdateHost,
    DeleteHost,
    ScanHostPorts,
    PingHost,
    SleepHost,
    ShutdownHost,
    Ping,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Wake => "wake",
            CommandType::Scan => "scan",
            CommandType::UpdateHost => "update-host",
            CommandType::DeleteHost => "delete-host",
            CommandType::ScanHostPorts => "scan-host-ports",
            CommandType::PingHost => "ping-host",
            CommandType::SleepHost => "sleep-host",
            CommandType::ShutdownHost => "shutdown-host",
            CommandType::Ping => "ping",
        }
    }

    /// Build the validated wire frame for this command. A payload that does
    /// not satisfy the frame contract is a non-retryable dispatch error.
    fn frame(&self, payload: &JsonValue) -> Result<ServerMessage, DispatchError> {
        let invalid = |err: serde_json::Error| DispatchError::InvalidPayload(err.to_string());
        let message = match self {
            CommandType::Wake => {
                ServerMessage::Wake(serde_json::from_value::<WakeData>(payload.clone()).map_err(invalid)?)
            }
            CommandType::Scan => {
                ServerMessage::Scan(serde_json::from_value::<ScanData>(payload.clone()).map_err(invalid)?)
            }
            CommandType::UpdateHost => ServerMessage::UpdateHost(
                serde_json::from_value::<UpdateHostData>(payload.clone()).map_err(invalid)?,
            ),
            CommandType::DeleteHost => ServerMessage::DeleteHost(
                serde_json::from_value::<DeleteHostData>(payload.clone()).map_err(invalid)?,
            ),
            CommandType::ScanHostPorts => ServerMessage::ScanHostPorts(
                serde_json::from_value::<HostRefData>(payload.clone()).map_err(invalid)?,
            ),
            CommandType::PingHost => ServerMessage::PingHost(
                serde_json::from_value::<HostRefData>(payload.clone()).map_err(invalid)?,
            ),
            CommandType::SleepHost => ServerMessage::SleepHost(
                serde_json::from_value::<HostRefData>(payload.clone()).map_err(invalid)?,
            ),
            CommandType::ShutdownHost => ServerMessage::ShutdownHost(
                serde_json::from_value::<HostRefData>(payload.clone()).map_err(invalid)?,
            ),
            CommandType::Ping => ServerMessage::Ping,
        };
        message
            .validate()
            .map_err(|err| DispatchError::InvalidPayload(err.to_string()))?;
        Ok(message)
    }

    pub fn offline_queueable(&self) -> bool {
        OFFLINE_QUEUE_ALLOWLIST.contains(self)
    }
}

impl std::str::FromStr for CommandType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wake" => Ok(CommandType::Wake),
            "scan" => Ok(CommandType::Scan),
            "update-host" => Ok(CommandType::UpdateHost),
            "delete-host" => Ok(CommandType::DeleteHost),
            "scan-host-ports" => Ok(CommandType::ScanHostPorts),
            "ping-host" => Ok(CommandType::PingHost),
            "sleep-host" => Ok(CommandType::SleepHost),
            "shutdown-host" => Ok(CommandType::ShutdownHost),
            "ping" => Ok(CommandType::Ping),
            other => Err(DispatchError::InvalidPayload(format!(
                "unknown command type {other:?}"
            ))),
        }
    }
}

pub mod state {
    pub const QUEUED: &str = "queued";
    pub const SENT: &str = "sent";
    pub const ACKNOWLEDGED: &str = "acknowledged";
    pub const FAILED: &str = "failed";
    pub const TIMED_OUT: &str = "timed_out";

    pub fn is_terminal(state: &str) -> bool {
        matches!(state, ACKNOWLEDGED | FAILED | TIMED_OUT)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid command payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub id: Uuid,
    pub node_id: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub command_type: String,
    pub payload: SqlJson<JsonValue>,
    pub idempotency_key: Option<String>,
    pub state: String,
    pub error: Option<String>,
    pub correlation_id: Option<String>,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable command lifecycle: `queued → sent → acknowledged | failed |
/// timed_out`, with idempotent dispatch, per-command timers, bounded
/// retries, restart reconciliation, and retention pruning. Rows are mutated
/// only here.
pub struct CommandRouter {
    db: SqlitePool,
    link: Arc<dyn NodeLink>,
    webhooks: Arc<WebhookDispatcher>,
    config: ServerConfig,
    timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    pruning: Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
}

impl CommandRouter {
    pub fn new(
        db: SqlitePool,
        link: Arc<dyn NodeLink>,
        webhooks: Arc<WebhookDispatcher>,
        config: ServerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            link,
            webhooks,
            config,
            timers: Mutex::new(HashMap::new()),
            pruning: Mutex::new(None),
            cancel,
        }
    }

    /// Create (or deduplicate) a command and attempt transmission.
    pub async fn dispatch(
        self: &Arc<Self>,
        node_id: &str,
        command_type: CommandType,
        payload: JsonValue,
        idempotency_key: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<CommandRecord, DispatchError> {
        // Validate the payload up front so a bad request never creates a row.
        if command_type != CommandType::Ping {
            command_type.frame(&payload)?;
        }

        if let Some(key) = idempotency_key.as_deref() {
            if let Some(existing) = self.find_duplicate(node_id, command_type, key).await? {
                tracing::debug!(
                    command_id = %existing.id,
                    node_id,
                    idempotency_key = key,
                    "idempotent dispatch returned existing command"
                );
                return Ok(existing);
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO commands (id, node_id, type, payload, idempotency_key, state, correlation_id, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'queued', $6, 0, $7, $7)
            "#,
        )
        .bind(id)
        .bind(node_id)
        .bind(command_type.as_str())
        .bind(SqlJson(payload.clone()))
        .bind(idempotency_key.as_deref())
        .bind(correlation_id.as_deref())
        .bind(now)
        .execute(&self.db)
        .await;

        if let Err(err) = inserted {
            // Concurrent dispatch with the same key: the unique index wins,
            // return the row it protected.
            if let (Some(key), sqlx::Error::Database(db_err)) = (idempotency_key.as_deref(), &err) {
                if db_err.is_unique_violation() {
                    if let Some(existing) = self.find_duplicate(node_id, command_type, key).await? {
                        return Ok(existing);
                    }
                }
            }
            return Err(err.into());
        }

        tracing::info!(
            command_id = %id,
            node_id,
            command_type = command_type.as_str(),
            correlation_id = correlation_id.as_deref().unwrap_or(""),
            "command queued"
        );
        self.attempt_transmit(id).await?;
        self.load(id)
            .await?
            .ok_or(DispatchError::Db(sqlx::Error::RowNotFound))
    }

    async fn find_duplicate(
        &self,
        node_id: &str,
        command_type: CommandType,
        key: &str,
    ) -> Result<Option<CommandRecord>, sqlx::Error> {
        let window_start = Utc::now() - dedup_terminal_window();
        sqlx::query_as(
            r#"
            SELECT * FROM commands
            WHERE node_id = $1 AND type = $2 AND idempotency_key = $3
              AND (state IN ('queued', 'sent') OR completed_at > $4)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(node_id)
        .bind(command_type.as_str())
        .bind(key)
        .bind(window_start)
        .fetch_optional(&self.db)
        .await
    }

    /// Transmit a queued command if possible; otherwise apply the offline
    /// queueing rules.
    async fn attempt_transmit(self: &Arc<Self>, id: Uuid) -> Result<(), sqlx::Error> {
        let Some(record) = self.load(id).await? else {
            return Ok(());
        };
        if record.state != state::QUEUED {
            return Ok(());
        }
        let command_type: CommandType = match record.command_type.parse() {
            Ok(ct) => ct,
            Err(_) => {
                self.finish(id, state::FAILED, Some("unsupported_command")).await?;
                return Ok(());
            }
        };

        if !self.link.is_connected(&record.node_id) {
            let age = Utc::now() - record.created_at;
            let ttl = ChronoDuration::milliseconds(self.config.offline_command_ttl_ms as i64);
            if command_type.offline_queueable() && age < ttl {
                let remaining = (ttl - age).to_std().unwrap_or(Duration::ZERO);
                self.arm_offline_expiry(id, remaining).await;
                tracing::info!(command_id = %id, node_id = %record.node_id, "node offline; command held in queue");
            } else {
                self.finish(id, state::FAILED, Some("node_offline")).await?;
            }
            return Ok(());
        }

        let message = match command_type.frame(&record.payload.0) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(command_id = %id, error = %err, "command payload failed frame validation");
                self.finish(id, state::FAILED, Some("validation_failed")).await?;
                return Ok(());
            }
        };

        match self
            .link
            .send_frame(&record.node_id, ServerFrame::command(message, id))
        {
            Ok(()) => {
                let now = Utc::now();
                sqlx::query(
                    r#"
                    UPDATE commands
                    SET state = 'sent', sent_at = $2, updated_at = $2, attempts = attempts + 1
                    WHERE id = $1 AND state = 'queued'
                    "#,
                )
                .bind(id)
                .bind(now)
                .execute(&self.db)
                .await?;
                tracing::info!(
                    command_id = %id,
                    node_id = %record.node_id,
                    correlation_id = record.correlation_id.as_deref().unwrap_or(""),
                    "command sent"
                );
                self.arm_timeout(id).await;
            }
            Err(err) => {
                tracing::warn!(command_id = %id, error = %err, "command transmission failed");
                self.handle_send_failure(record).await?;
            }
        }
        Ok(())
    }

    /// A send failure is retryable; the command stays `queued` with a
    /// backoff timer until attempts run out.
    fn handle_send_failure<'a>(
        self: &'a Arc<Self>,
        record: CommandRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), sqlx::Error>> + Send + 'a>> {
        Box::pin(async move {
            let attempts = record.attempts + 1;
            sqlx::query("UPDATE commands SET attempts = $2, updated_at = $3 WHERE id = $1")
                .bind(record.id)
                .bind(attempts)
                .bind(Utc::now())
                .execute(&self.db)
                .await?;

            if attempts > self.config.command_max_retries as i64 {
                self.finish(record.id, state::FAILED, Some("send_failed")).await?;
                return Ok(());
            }

            let exponent = (attempts - 1).clamp(0, 16) as u32;
            let delay = Duration::from_millis(
                self.config
                    .command_retry_base_delay_ms
                    .saturating_mul(1u64 << exponent),
            );
            tracing::info!(
                command_id = %record.id,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying command after backoff"
            );

            let router = Arc::clone(self);
            let id = record.id;
            self.arm_timer(id, async move {
                tokio::time::sleep(delay).await;
                if let Err(err) = router.attempt_transmit(id).await {
                    tracing::warn!(command_id = %id, error = %err, "retry transmission failed");
                }
            })
            .await;
            Ok(())
        })
    }

    /// `command-result` frames land here; the bound `commandId` is the join
    /// key. Unknown ids are logged and dropped.
    pub async fn handle_result(&self, result: &CommandResultData) {
        let Ok(Some(record)) = self.load(result.command_id).await else {
            tracing::warn!(command_id = %result.command_id, "result for unknown command dropped");
            return;
        };
        if state::is_terminal(&record.state) {
            tracing::debug!(command_id = %record.id, state = %record.state, "result for terminal command ignored");
            return;
        }

        let (new_state, error) = if result.success {
            (state::ACKNOWLEDGED, None)
        } else {
            let error = result
                .error
                .clone()
                .or_else(|| result.message.clone())
                .unwrap_or_else(|| "command failed".to_string());
            (state::FAILED, Some(error))
        };
        if let Err(err) = self.finish(record.id, new_state, error.as_deref()).await {
            tracing::error!(command_id = %record.id, error = %err, "failed to record command result");
        }
    }

    /// Terminal transition; cancels the command's timer, never un-does a
    /// terminal state, and emits the lifecycle webhook.
    async fn finish(
        &self,
        id: Uuid,
        new_state: &str,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE commands
            SET state = $2, error = $3, completed_at = $4, updated_at = $4
            WHERE id = $1 AND state IN ('queued', 'sent')
            "#,
        )
        .bind(id)
        .bind(new_state)
        .bind(error)
        .bind(now)
        .execute(&self.db)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(());
        }
        if let Some(handle) = self.timers.lock().await.remove(&id) {
            handle.abort();
        }

        tracing::info!(command_id = %id, state = new_state, error = error.unwrap_or(""), "command finished");
        if let Ok(Some(record)) = self.load(id).await {
            let event = if new_state == state::ACKNOWLEDGED {
                "command.completed"
            } else {
                "command.failed"
            };
            self.webhooks.publish(
                event,
                json!({
                    "commandId": record.id,
                    "nodeId": record.node_id,
                    "type": record.command_type,
                    "state": record.state,
                    "error": record.error,
                    "correlationId": record.correlation_id,
                }),
            );
        }
        Ok(())
    }

    async fn arm_timeout(self: &Arc<Self>, id: Uuid) {
        let timeout = Duration::from_millis(self.config.command_timeout_ms);
        self.arm_timeout_in(id, timeout).await;
    }

    async fn arm_timeout_in(self: &Arc<Self>, id: Uuid, timeout: Duration) {
        let router = Arc::clone(self);
        self.arm_timer(id, async move {
            tokio::time::sleep(timeout).await;
            match router.load(id).await {
                Ok(Some(record)) if record.state == state::SENT => {
                    if let Err(err) = router.finish(id, state::TIMED_OUT, Some("command_timeout")).await
                    {
                        tracing::error!(command_id = %id, error = %err, "failed to time out command");
                    }
                }
                _ => {}
            }
        })
        .await;
    }

    async fn arm_offline_expiry(self: &Arc<Self>, id: Uuid, remaining: Duration) {
        let router = Arc::clone(self);
        self.arm_timer(id, async move {
            tokio::time::sleep(remaining).await;
            match router.load(id).await {
                Ok(Some(record))
                    if record.state == state::QUEUED && !router.link.is_connected(&record.node_id) =>
                {
                    if let Err(err) = router.finish(id, state::FAILED, Some("node_offline")).await {
                        tracing::error!(command_id = %id, error = %err, "failed to expire offline command");
                    }
                }
                _ => {}
            }
        })
        .await;
    }

    /// One active timer per command; re-arming replaces the previous one.
    /// Every timer races the router's cancellation token.
    async fn arm_timer<F>(&self, id: Uuid, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = work => {}
            }
        });
        if let Some(previous) = self.timers.lock().await.insert(id, handle) {
            previous.abort();
        }
    }

    /// Transmit held commands for a node that just came online, in creation
    /// order.
    pub async fn flush_queued(self: &Arc<Self>, node_id: &str) {
        let queued: Result<Vec<CommandRecord>, sqlx::Error> = sqlx::query_as(
            "SELECT * FROM commands WHERE node_id = $1 AND state = 'queued' ORDER BY created_at ASC",
        )
        .bind(node_id)
        .fetch_all(&self.db)
        .await;

        match queued {
            Ok(records) => {
                for record in records {
                    if let Err(err) = self.attempt_transmit(record.id).await {
                        tracing::warn!(command_id = %record.id, error = %err, "failed to flush queued command");
                    }
                }
            }
            Err(err) => {
                tracing::error!(node_id, error = %err, "failed to load queued commands");
            }
        }
    }

    /// Boot-time reconciliation of persisted state: expire stale `sent`
    /// rows, re-arm timers for live ones, and re-evaluate held `queued`
    /// rows against the offline TTL.
    pub async fn reconcile(self: &Arc<Self>) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        let timeout = ChronoDuration::milliseconds(self.config.command_timeout_ms as i64);
        let ttl = ChronoDuration::milliseconds(self.config.offline_command_ttl_ms as i64);

        let stale_cutoff = now - timeout;
        let expired = sqlx::query(
            r#"
            UPDATE commands
            SET state = 'timed_out', error = 'command_timeout', completed_at = $2, updated_at = $2
            WHERE state = 'sent' AND sent_at < $1
            "#,
        )
        .bind(stale_cutoff)
        .bind(now)
        .execute(&self.db)
        .await?;
        if expired.rows_affected() > 0 {
            tracing::info!(rows = expired.rows_affected(), "timed out stale sent commands at boot");
        }

        let live_sent: Vec<CommandRecord> =
            sqlx::query_as("SELECT * FROM commands WHERE state = 'sent'")
                .fetch_all(&self.db)
                .await?;
        for record in live_sent {
            let deadline = record.sent_at.unwrap_or(record.created_at) + timeout;
            let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
            self.arm_timeout_in(record.id, remaining).await;
        }

        let queued: Vec<CommandRecord> =
            sqlx::query_as("SELECT * FROM commands WHERE state = 'queued'")
                .fetch_all(&self.db)
                .await?;
        for record in queued {
            let queueable = record
                .command_type
                .parse::<CommandType>()
                .map(|ct| ct.offline_queueable())
                .unwrap_or(false);
            let age = now - record.created_at;
            if self.link.is_connected(&record.node_id) {
                self.attempt_transmit(record.id).await?;
            } else if !queueable || age >= ttl {
                self.finish(record.id, state::FAILED, Some("node_offline")).await?;
            } else {
                let remaining = (ttl - age).to_std().unwrap_or(Duration::ZERO);
                self.arm_offline_expiry(record.id, remaining).await;
            }
        }
        Ok(())
    }

    /// Start (or restart) retention pruning. Re-invocation cancels the
    /// previously scheduled task before scheduling a new one.
    pub async fn start_pruning(self: &Arc<Self>, retention_days: i64) {
        let mut guard = self.pruning.lock().await;
        if let Some(previous) = guard.take() {
            previous.cancel();
        }
        if retention_days <= 0 {
            tracing::info!("command pruning disabled");
            return;
        }

        let token = self.cancel.child_token();
        *guard = Some(token.clone());
        drop(guard);

        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
                        match sqlx::query("DELETE FROM commands WHERE updated_at < $1")
                            .bind(cutoff)
                            .execute(&router.db)
                            .await
                        {
                            Ok(result) if result.rows_affected() > 0 => {
                                tracing::info!(rows = result.rows_affected(), "pruned old commands");
                            }
                            Ok(_) => {}
                            Err(err) => tracing::warn!(error = %err, "command pruning failed"),
                        }
                    }
                }
            }
        });
    }

    pub async fn load(&self, id: Uuid) -> Result<Option<CommandRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM commands WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await
    }

    /// Poll until the command reaches a terminal state or the deadline
    /// passes; used by synchronous HTTP surfaces like ping-host.
    pub async fn wait_for_completion(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> Result<Option<CommandRecord>, sqlx::Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.load(id).await? {
                if state::is_terminal(&record.state) {
                    return Ok(Some(record));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    pub async fn list(
        &self,
        node_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<CommandRecord>, sqlx::Error> {
        match node_id {
            Some(node_id) => {
                sqlx::query_as(
                    "SELECT * FROM commands WHERE node_id = $1 ORDER BY created_at DESC LIMIT $2",
                )
                .bind(node_id)
                .bind(limit)
                .fetch_all(&self.db)
                .await
            }
            None => {
                sqlx::query_as("SELECT * FROM commands ORDER BY created_at DESC LIMIT $1")
                    .bind(limit)
                    .fetch_all(&self.db)
                    .await
            }
        }
    }

    pub async fn stats(&self) -> Result<JsonValue, sqlx::Error> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM commands GROUP BY state")
                .fetch_all(&self.db)
                .await?;
        let mut by_state = serde_json::Map::new();
        let mut total = 0i64;
        for (state, count) in rows {
            total += count;
            by_state.insert(state, json!(count));
        }
        Ok(json!({"total": total, "byState": by_state}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::session::{NodeLink, SendError};
    use crate::test_support::{test_config, test_pool};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Scriptable stand-in for the session manager.
    struct FakeLink {
        connected: AtomicBool,
        fail_sends: AtomicBool,
        sent: StdMutex<Vec<ServerFrame>>,
    }

    impl FakeLink {
        fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(connected),
                fail_sends: AtomicBool::new(false),
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn sent_ids(&self) -> Vec<Option<Uuid>> {
            self.sent.lock().unwrap().iter().map(|f| f.command_id).collect()
        }
    }

    impl NodeLink for FakeLink {
        fn is_connected(&self, _node_id: &str) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn send_frame(&self, _node_id: &str, frame: ServerFrame) -> Result<(), SendError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(SendError::ChannelClosed);
            }
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }
    }

    async fn router_with(link: Arc<FakeLink>) -> Arc<CommandRouter> {
        let pool = test_pool().await;
        let config = test_config();
        let webhooks = Arc::new(WebhookDispatcher::new(
            pool.clone(),
            reqwest::Client::new(),
            config.webhook_retry_base_delay_ms,
            config.webhook_delivery_timeout_ms,
        ));
        Arc::new(CommandRouter::new(
            pool,
            link,
            webhooks,
            config,
            CancellationToken::new(),
        ))
    }

    fn wake_payload() -> JsonValue {
        json!({"hostName": "office", "mac": "AA:BB:CC:DD:EE:FF"})
    }

    /// Timer work lands asynchronously; poll until the row shows the
    /// expected state.
    async fn wait_for_state(router: &Arc<CommandRouter>, id: Uuid, expected: &str) -> CommandRecord {
        for _ in 0..100 {
            let record = router.load(id).await.unwrap().unwrap();
            if record.state == expected {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("command {id} never reached state {expected}");
    }

    #[tokio::test]
    async fn dispatch_to_connected_node_transitions_to_sent() {
        let link = FakeLink::new(true);
        let router = router_with(link.clone()).await;

        let record = router
            .dispatch("home", CommandType::Wake, wake_payload(), None, None)
            .await
            .unwrap();
        assert_eq!(record.state, state::SENT);
        assert_eq!(record.attempts, 1);
        assert!(record.sent_at.is_some());
        assert_eq!(link.sent_ids(), vec![Some(record.id)]);
    }

    #[tokio::test]
    async fn idempotent_dispatch_returns_same_command() {
        let link = FakeLink::new(true);
        let router = router_with(link).await;

        let first = router
            .dispatch(
                "home",
                CommandType::Wake,
                wake_payload(),
                Some("k1".to_string()),
                None,
            )
            .await
            .unwrap();
        let second = router
            .dispatch(
                "home",
                CommandType::Wake,
                wake_payload(),
                Some("k1".to_string()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn offline_queueable_command_is_held() {
        let link = FakeLink::new(false);
        let router = router_with(link).await;

        let record = router
            .dispatch("home", CommandType::Wake, wake_payload(), None, None)
            .await
            .unwrap();
        assert_eq!(record.state, state::QUEUED);
    }

    #[tokio::test]
    async fn offline_interactive_command_fails_fast() {
        let link = FakeLink::new(false);
        let router = router_with(link).await;

        let record = router
            .dispatch(
                "home",
                CommandType::PingHost,
                json!({"name": "office"}),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(record.state, state::FAILED);
        assert_eq!(record.error.as_deref(), Some("node_offline"));
    }

    #[tokio::test]
    async fn flush_transmits_held_commands_in_creation_order() {
        let link = FakeLink::new(false);
        let router = router_with(link.clone()).await;

        let first = router
            .dispatch("home", CommandType::Wake, wake_payload(), None, None)
            .await
            .unwrap();
        let second = router
            .dispatch(
                "home",
                CommandType::DeleteHost,
                json!({"name": "nas"}),
                None,
                None,
            )
            .await
            .unwrap();

        link.connected.store(true, Ordering::SeqCst);
        router.flush_queued("home").await;

        assert_eq!(link.sent_ids(), vec![Some(first.id), Some(second.id)]);
        assert_eq!(router.load(first.id).await.unwrap().unwrap().state, state::SENT);
        assert_eq!(router.load(second.id).await.unwrap().unwrap().state, state::SENT);
    }

    #[tokio::test]
    async fn result_drives_terminal_state() {
        let link = FakeLink::new(true);
        let router = router_with(link).await;
        let record = router
            .dispatch("home", CommandType::Wake, wake_payload(), None, None)
            .await
            .unwrap();

        router
            .handle_result(&CommandResultData {
                node_id: "home".to_string(),
                command_id: record.id,
                success: true,
                message: Some("magic packet sent".to_string()),
                error: None,
                timestamp: Utc::now(),
            })
            .await;

        let record = router.load(record.id).await.unwrap().unwrap();
        assert_eq!(record.state, state::ACKNOWLEDGED);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_states_never_transition() {
        let link = FakeLink::new(true);
        let router = router_with(link).await;
        let record = router
            .dispatch("home", CommandType::Wake, wake_payload(), None, None)
            .await
            .unwrap();

        let failure = CommandResultData {
            node_id: "home".to_string(),
            command_id: record.id,
            success: false,
            message: None,
            error: Some("host_not_found".to_string()),
            timestamp: Utc::now(),
        };
        router.handle_result(&failure).await;

        let success = CommandResultData {
            success: true,
            error: None,
            ..failure
        };
        router.handle_result(&success).await;

        let record = router.load(record.id).await.unwrap().unwrap();
        assert_eq!(record.state, state::FAILED);
        assert_eq!(record.error.as_deref(), Some("host_not_found"));
    }

    #[tokio::test(start_paused = true)]
    async fn sent_command_times_out() {
        let link = FakeLink::new(true);
        let router = router_with(link).await;
        let record = router
            .dispatch("home", CommandType::Wake, wake_payload(), None, None)
            .await
            .unwrap();
        assert_eq!(record.state, state::SENT);

        // Just past COMMAND_TIMEOUT with no result.
        tokio::time::sleep(Duration::from_millis(30_500)).await;

        let record = wait_for_state(&router, record.id, state::TIMED_OUT).await;
        assert_eq!(record.error.as_deref(), Some("command_timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_retries_with_backoff_then_fails() {
        let link = FakeLink::new(true);
        link.fail_sends.store(true, Ordering::SeqCst);
        let router = router_with(link.clone()).await;

        let record = router
            .dispatch("home", CommandType::Wake, wake_payload(), None, None)
            .await
            .unwrap();
        assert_eq!(record.state, state::QUEUED);
        assert_eq!(record.attempts, 1);

        // Backoff ladder: 10ms, 20ms, 40ms with base delay 10ms. After the
        // final retry the command fails terminally.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let record = wait_for_state(&router, record.id, state::FAILED).await;
        assert_eq!(record.error.as_deref(), Some("send_failed"));
        assert_eq!(record.attempts, 1 + test_config().command_max_retries as i64);
    }

    #[tokio::test]
    async fn reconcile_times_out_stale_sent_rows() {
        let link = FakeLink::new(false);
        let router = router_with(link).await;

        let id = Uuid::new_v4();
        let long_ago = Utc::now() - ChronoDuration::minutes(10);
        sqlx::query(
            r#"
            INSERT INTO commands (id, node_id, type, payload, state, attempts, created_at, updated_at, sent_at)
            VALUES ($1, 'home', 'wake', '{}', 'sent', 1, $2, $2, $2)
            "#,
        )
        .bind(id)
        .bind(long_ago)
        .execute(&router.db)
        .await
        .unwrap();

        router.reconcile().await.unwrap();
        let record = router.load(id).await.unwrap().unwrap();
        assert_eq!(record.state, state::TIMED_OUT);
    }

    #[tokio::test]
    async fn reconcile_expires_overdue_offline_commands() {
        let link = FakeLink::new(false);
        let router = router_with(link).await;

        let id = Uuid::new_v4();
        let long_ago = Utc::now() - ChronoDuration::minutes(10);
        sqlx::query(
            r#"
            INSERT INTO commands (id, node_id, type, payload, state, attempts, created_at, updated_at)
            VALUES ($1, 'home', 'wake', $2, 'queued', 0, $3, $3)
            "#,
        )
        .bind(id)
        .bind(SqlJson(wake_payload()))
        .bind(long_ago)
        .execute(&router.db)
        .await
        .unwrap();

        router.reconcile().await.unwrap();
        let record = router.load(id).await.unwrap().unwrap();
        assert_eq!(record.state, state::FAILED);
        assert_eq!(record.error.as_deref(), Some("node_offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_command_expires_at_ttl() {
        let link = FakeLink::new(false);
        let router = router_with(link).await;

        let record = router
            .dispatch("home", CommandType::Wake, wake_payload(), None, None)
            .await
            .unwrap();
        assert_eq!(record.state, state::QUEUED);

        // OFFLINE_COMMAND_TTL_MS is 60s in the test config.
        tokio::time::sleep(Duration::from_millis(61_000)).await;

        let record = wait_for_state(&router, record.id, state::FAILED).await;
        assert_eq!(record.error.as_deref(), Some("node_offline"));
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_before_persisting() {
        let link = FakeLink::new(true);
        let router = router_with(link).await;

        let err = router
            .dispatch("home", CommandType::Wake, json!({"mac": "nope"}), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPayload(_)));
        assert_eq!(router.list(None, 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn restarting_pruning_cancels_previous_task() {
        let link = FakeLink::new(true);
        let router = router_with(link).await;

        router.start_pruning(7).await;
        let first = router.pruning.lock().await.clone().unwrap();
        router.start_pruning(14).await;
        assert!(first.is_cancelled());

        // Disabling clears the slot entirely.
        router.start_pruning(0).await;
        assert!(router.pruning.lock().await.is_none());
    }
}
