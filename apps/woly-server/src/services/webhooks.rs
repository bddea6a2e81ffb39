use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value as JsonValue};
use sha2::Sha256;
use sqlx::types::Json as SqlJson;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

type HmacSha256 = Hmac<Sha256>;

/// Delivery attempts per event before giving up.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
struct PendingEvent {
    event: String,
    data: JsonValue,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub id: String,
    pub url: String,
    pub events: SqlJson<Vec<String>>,
    pub secret: Option<String>,
}

/// Fans lifecycle events out to registered subscribers with bounded retries.
/// Publishing is synchronous and never blocks the caller; delivery failures
/// are logged, never propagated.
pub struct WebhookDispatcher {
    db: SqlitePool,
    http: reqwest::Client,
    retry_base_delay_ms: u64,
    delivery_timeout_ms: u64,
    tx: mpsc::UnboundedSender<PendingEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<PendingEvent>>>,
}

impl WebhookDispatcher {
    pub fn new(
        db: SqlitePool,
        http: reqwest::Client,
        retry_base_delay_ms: u64,
        delivery_timeout_ms: u64,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            db,
            http,
            retry_base_delay_ms,
            delivery_timeout_ms,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Enqueue an event for delivery. Safe to call before `start`; events
    /// buffer until the worker drains them.
    pub fn publish(&self, event: &str, data: JsonValue) {
        let _ = self.tx.send(PendingEvent {
            event: event.to_string(),
            data,
        });
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        let dispatcher = Arc::clone(&self);
        tokio::spawn(async move {
            let mut rx = match dispatcher.rx.lock().await.take() {
                Some(rx) => rx,
                None => return,
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    pending = rx.recv() => {
                        let Some(pending) = pending else { break };
                        dispatcher.fan_out(pending, &cancel).await;
                    }
                }
            }
        });
    }

    async fn fan_out(self: &Arc<Self>, pending: PendingEvent, cancel: &CancellationToken) {
        let subscriptions: Vec<SubscriptionRow> =
            match sqlx::query_as("SELECT id, url, events, secret FROM webhooks")
                .fetch_all(&self.db)
                .await
            {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::error!(error = %err, "failed to load webhook subscriptions");
                    return;
                }
            };

        for subscription in subscriptions {
            let matches = subscription
                .events
                .0
                .iter()
                .any(|e| e == &pending.event || e == "*");
            if !matches {
                continue;
            }
            let dispatcher = Arc::clone(self);
            let pending = pending.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = dispatcher.deliver(subscription, pending) => {}
                }
            });
        }
    }

    async fn deliver(&self, subscription: SubscriptionRow, pending: PendingEvent) {
        let body = json!({
            "event": pending.event,
            "data": pending.data,
            "deliveredAt": Utc::now(),
        });
        let raw_body = match serde_json::to_vec(&body) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode webhook body");
                return;
            }
        };
        let signature = subscription
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|secret| sign_body(secret, &raw_body));

        for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
            let mut request = self
                .http
                .post(&subscription.url)
                .timeout(Duration::from_millis(self.delivery_timeout_ms))
                .header("Content-Type", "application/json")
                .header("X-Woly-Event", &pending.event)
                .body(raw_body.clone());
            if let Some(signature) = &signature {
                request = request.header("X-Woly-Signature", signature);
            }

            let outcome = request.send().await;
            let (success, response_status, error) = match &outcome {
                Ok(response) if response.status().is_success() => {
                    (true, Some(response.status().as_u16() as i64), None)
                }
                Ok(response) => (
                    false,
                    Some(response.status().as_u16() as i64),
                    Some(format!("unexpected status {}", response.status())),
                ),
                Err(err) => (false, None, Some(err.to_string())),
            };

            self.log_attempt(
                &subscription.id,
                &pending.event,
                attempt,
                success,
                response_status,
                error.as_deref(),
                &body,
            )
            .await;

            if success {
                return;
            }
            tracing::warn!(
                webhook_id = %subscription.id,
                event = %pending.event,
                attempt,
                error = error.as_deref().unwrap_or(""),
                "webhook delivery attempt failed"
            );
            if attempt < MAX_DELIVERY_ATTEMPTS {
                let delay = self
                    .retry_base_delay_ms
                    .saturating_mul(1u64 << (attempt - 1).min(16));
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_attempt(
        &self,
        webhook_id: &str,
        event: &str,
        attempt: u32,
        success: bool,
        response_status: Option<i64>,
        error: Option<&str>,
        payload: &JsonValue,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (webhook_id, event_type, attempt, status, response_status, error, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(webhook_id)
        .bind(event)
        .bind(attempt as i64)
        .bind(if success { "success" } else { "failed" })
        .bind(response_status)
        .bind(error)
        .bind(SqlJson(payload.clone()))
        .bind(Utc::now())
        .execute(&self.db)
        .await;
        if let Err(err) = result {
            tracing::error!(webhook_id, error = %err, "failed to append delivery log");
        }
    }
}

/// `sha256=<hex>` HMAC over the raw request body.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().fold(String::new(), |mut acc, byte| {
        use std::fmt::Write as _;
        let _ = write!(acc, "{byte:02x}");
        acc
    });
    format!("sha256={hex}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[test]
    fn signature_is_stable_hex_hmac() {
        let first = sign_body("secret", b"{\"event\":\"node.online\"}");
        let second = sign_body("secret", b"{\"event\":\"node.online\"}");
        assert_eq!(first, second);
        assert!(first.starts_with("sha256="));
        assert_eq!(first.len(), "sha256=".len() + 64);

        let other = sign_body("other-secret", b"{\"event\":\"node.online\"}");
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn delivery_failure_appends_log_rows_per_attempt() {
        let pool = test_pool().await;
        sqlx::query(
            "INSERT INTO webhooks (id, url, events, secret, created_at) VALUES ($1, $2, $3, NULL, $4)",
        )
        .bind("w1")
        // Unroutable address: every attempt fails fast.
        .bind("http://127.0.0.1:1/hook")
        .bind(SqlJson(vec!["node.online".to_string()]))
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();

        let dispatcher = Arc::new(WebhookDispatcher::new(
            pool.clone(),
            reqwest::Client::new(),
            1,
            500,
        ));
        dispatcher
            .deliver(
                SubscriptionRow {
                    id: "w1".to_string(),
                    url: "http://127.0.0.1:1/hook".to_string(),
                    events: SqlJson(vec!["node.online".to_string()]),
                    secret: None,
                },
                PendingEvent {
                    event: "node.online".to_string(),
                    data: json!({"nodeId": "home"}),
                },
            )
            .await;

        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT attempt, status FROM webhook_deliveries WHERE webhook_id = 'w1' ORDER BY attempt",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(rows.len(), MAX_DELIVERY_ATTEMPTS as usize);
        assert!(rows.iter().all(|(_, status)| status == "failed"));
    }

    #[tokio::test]
    async fn events_filter_respects_wildcard() {
        let pool = test_pool().await;
        for (id, events) in [
            ("w-exact", vec!["node.online".to_string()]),
            ("w-star", vec!["*".to_string()]),
            ("w-other", vec!["host.removed".to_string()]),
        ] {
            sqlx::query(
                "INSERT INTO webhooks (id, url, events, secret, created_at) VALUES ($1, 'http://127.0.0.1:1/hook', $2, NULL, $3)",
            )
            .bind(id)
            .bind(SqlJson(events))
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();
        }

        let subscriptions: Vec<SubscriptionRow> =
            sqlx::query_as("SELECT id, url, events, secret FROM webhooks")
                .fetch_all(&pool)
                .await
                .unwrap();
        let matching: Vec<&str> = subscriptions
            .iter()
            .filter(|s| s.events.0.iter().any(|e| e == "node.online" || e == "*"))
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(matching, vec!["w-exact", "w-star"]);
    }
}
