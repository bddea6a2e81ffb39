use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::services::aggregator::HostAggregator;
use crate::services::commands::{CommandRouter, CommandType};
use crate::services::webhooks::WebhookDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Once,
    Daily,
    Weekly,
    Weekdays,
    Weekends,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Once => "once",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Weekdays => "weekdays",
            Frequency::Weekends => "weekends",
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "once" => Ok(Frequency::Once),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "weekdays" => Ok(Frequency::Weekdays),
            "weekends" => Ok(Frequency::Weekends),
            other => Err(format!("unknown frequency {other:?}")),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduleRow {
    pub id: String,
    pub host_fqn: String,
    pub scheduled_time: String,
    pub timezone: String,
    pub frequency: String,
    pub enabled: bool,
    pub notify_on_wake: bool,
    pub last_triggered: Option<DateTime<Utc>>,
    pub next_trigger: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parse "HH:MM" wall-clock time.
pub fn parse_scheduled_time(value: &str) -> Option<NaiveTime> {
    let (hour, minute) = value.trim().split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn day_matches(frequency: Frequency, weekday: Weekday, anchor: Weekday) -> bool {
    match frequency {
        Frequency::Once | Frequency::Daily => true,
        Frequency::Weekly => weekday == anchor,
        Frequency::Weekdays => !matches!(weekday, Weekday::Sat | Weekday::Sun),
        Frequency::Weekends => matches!(weekday, Weekday::Sat | Weekday::Sun),
    }
}

/// Next trigger strictly after `after`, evaluated at `scheduled_time` wall
/// clock in the schedule's timezone. Weekly schedules anchor on the weekday
/// of `after` in that timezone. Spring-forward gaps resolve one hour later;
/// ambiguous fall-back times take the earlier instant.
pub fn compute_next_trigger(
    frequency: Frequency,
    scheduled_time: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let time = parse_scheduled_time(scheduled_time)?;
    let tz: Tz = timezone.parse().ok()?;
    let local_after = after.with_timezone(&tz);
    let anchor = local_after.weekday();

    for offset in 0..14 {
        let date = local_after.date_naive() + ChronoDuration::days(offset);
        if !day_matches(frequency, date.weekday(), anchor) {
            continue;
        }
        let naive = date.and_time(time);
        let candidate = match tz.from_local_datetime(&naive).earliest() {
            Some(candidate) => candidate,
            None => tz
                .from_local_datetime(&(naive + ChronoDuration::hours(1)))
                .earliest()?,
        };
        let candidate = candidate.with_timezone(&Utc);
        if candidate > after {
            return Some(candidate);
        }
    }
    None
}

/// Polls persisted wake schedules and dispatches wake commands when due.
/// Each firing uses the idempotency key `(scheduleId, nextTrigger-epoch)` so
/// clock skew cannot double-fire.
pub struct ScheduleWorker {
    db: SqlitePool,
    router: Arc<CommandRouter>,
    aggregator: Arc<HostAggregator>,
    webhooks: Arc<WebhookDispatcher>,
    config: ServerConfig,
}

impl ScheduleWorker {
    pub fn new(
        db: SqlitePool,
        router: Arc<CommandRouter>,
        aggregator: Arc<HostAggregator>,
        webhooks: Arc<WebhookDispatcher>,
        config: ServerConfig,
    ) -> Self {
        Self {
            db,
            router,
            aggregator,
            webhooks,
            config,
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        if !self.config.schedule_worker_enabled {
            tracing::info!("schedule worker disabled");
            return;
        }
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(self.config.schedule_poll_interval_ms));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = self.tick().await {
                            tracing::warn!(error = %err, "schedule worker tick failed");
                        }
                    }
                }
            }
        });
    }

    pub async fn tick(&self) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        let due: Vec<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT * FROM wake_schedules
            WHERE enabled = 1 AND next_trigger IS NOT NULL AND next_trigger <= $1
            ORDER BY next_trigger ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(self.config.schedule_batch_size as i64)
        .fetch_all(&self.db)
        .await?;

        for schedule in due {
            self.fire(schedule, now).await?;
        }
        Ok(())
    }

    async fn fire(&self, schedule: ScheduleRow, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
        let trigger = schedule.next_trigger.unwrap_or(now);
        let idempotency_key = format!("{}:{}", schedule.id, trigger.timestamp());

        match self.aggregator.host(&schedule.host_fqn).await {
            Some(host) => {
                let payload = json!({
                    "hostName": host.host.name,
                    "mac": host.host.mac,
                    "wolPort": host.host.wol_port,
                });
                match self
                    .router
                    .dispatch(
                        &host.node_id,
                        CommandType::Wake,
                        payload,
                        Some(idempotency_key),
                        None,
                    )
                    .await
                {
                    Ok(record) => {
                        tracing::info!(
                            schedule_id = %schedule.id,
                            fqn = %schedule.host_fqn,
                            command_id = %record.id,
                            "scheduled wake dispatched"
                        );
                        if schedule.notify_on_wake {
                            self.webhooks.publish(
                                "schedule.triggered",
                                json!({
                                    "scheduleId": schedule.id,
                                    "hostFqn": schedule.host_fqn,
                                    "commandId": record.id,
                                    "triggeredAt": now,
                                }),
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            schedule_id = %schedule.id,
                            fqn = %schedule.host_fqn,
                            error = %err,
                            "scheduled wake dispatch failed"
                        );
                    }
                }
            }
            None => {
                tracing::warn!(
                    schedule_id = %schedule.id,
                    fqn = %schedule.host_fqn,
                    "schedule fired for unknown host; skipping dispatch"
                );
            }
        }

        let frequency: Frequency = schedule
            .frequency
            .parse()
            .unwrap_or(Frequency::Once);
        let (enabled, next_trigger) = match frequency {
            Frequency::Once => (false, None),
            _ => (
                true,
                compute_next_trigger(frequency, &schedule.scheduled_time, &schedule.timezone, now),
            ),
        };

        sqlx::query(
            r#"
            UPDATE wake_schedules
            SET last_triggered = $2, next_trigger = $3, enabled = $4, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(&schedule.id)
        .bind(now)
        .bind(next_trigger)
        .bind(enabled)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn daily_rolls_to_tomorrow_when_time_passed() {
        // Monday noon UTC; 08:00 already passed.
        let after = utc(2026, 3, 2, 12, 0);
        let next = compute_next_trigger(Frequency::Daily, "08:00", "UTC", after).unwrap();
        assert_eq!(next, utc(2026, 3, 3, 8, 0));
    }

    #[test]
    fn daily_fires_today_when_time_ahead() {
        let after = utc(2026, 3, 2, 6, 0);
        let next = compute_next_trigger(Frequency::Daily, "08:00", "UTC", after).unwrap();
        assert_eq!(next, utc(2026, 3, 2, 8, 0));
    }

    #[test]
    fn weekdays_skip_the_weekend() {
        // Friday 20:00 UTC → next weekday 08:00 is Monday.
        let after = utc(2026, 3, 6, 20, 0);
        let next = compute_next_trigger(Frequency::Weekdays, "08:00", "UTC", after).unwrap();
        assert_eq!(next, utc(2026, 3, 9, 8, 0));
    }

    #[test]
    fn weekends_skip_to_saturday() {
        // Monday → Saturday 08:00.
        let after = utc(2026, 3, 2, 12, 0);
        let next = compute_next_trigger(Frequency::Weekends, "08:00", "UTC", after).unwrap();
        assert_eq!(next, utc(2026, 3, 7, 8, 0));
    }

    #[test]
    fn weekly_anchors_on_the_current_weekday() {
        // Monday noon; weekly 08:00 fires next Monday.
        let after = utc(2026, 3, 2, 12, 0);
        let next = compute_next_trigger(Frequency::Weekly, "08:00", "UTC", after).unwrap();
        assert_eq!(next, utc(2026, 3, 9, 8, 0));
    }

    #[test]
    fn respects_the_schedule_timezone() {
        // 08:00 in New York is 13:00 UTC during EST.
        let after = utc(2026, 1, 5, 0, 0);
        let next =
            compute_next_trigger(Frequency::Daily, "08:00", "America/New_York", after).unwrap();
        assert_eq!(next, utc(2026, 1, 5, 13, 0));
    }

    #[test]
    fn spring_forward_gap_resolves_an_hour_later() {
        // 2026-03-08 02:30 does not exist in America/New_York.
        let after = utc(2026, 3, 8, 0, 0);
        let next =
            compute_next_trigger(Frequency::Daily, "02:30", "America/New_York", after).unwrap();
        // Resolved as 03:30 EDT = 07:30 UTC.
        assert_eq!(next, utc(2026, 3, 8, 7, 30));
    }

    #[test]
    fn rejects_bad_inputs() {
        let after = utc(2026, 3, 2, 12, 0);
        assert!(compute_next_trigger(Frequency::Daily, "25:00", "UTC", after).is_none());
        assert!(compute_next_trigger(Frequency::Daily, "08:00", "Mars/Olympus", after).is_none());
        assert!(parse_scheduled_time("8").is_none());
        assert_eq!(
            parse_scheduled_time("08:30"),
            NaiveTime::from_hms_opt(8, 30, 0)
        );
    }

    #[test]
    fn frequency_round_trips() {
        for text in ["once", "daily", "weekly", "weekdays", "weekends"] {
            let frequency: Frequency = text.parse().unwrap();
            assert_eq!(frequency.as_str(), text);
        }
        assert!("hourly".parse::<Frequency>().is_err());
    }
}
