use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json as SqlJson;
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

use woly_proto::{is_valid_mac, normalize_mac, HostStatus, WireHost, DEFAULT_WOL_PORT};

/// How long a port-scan result stays fresh.
const PORTS_TTL_HOURS: i64 = 1;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HostRecord {
    pub id: i64,
    pub name: String,
    pub mac: String,
    pub ip: String,
    pub status: String,
    pub ping_responsive: Option<bool>,
    pub last_seen: Option<DateTime<Utc>>,
    pub discovered: bool,
    pub notes: Option<String>,
    pub tags: Option<SqlJson<Vec<String>>>,
    pub wol_port: Option<i64>,
    pub ports: Option<SqlJson<Vec<u16>>>,
    pub ports_scanned_at: Option<DateTime<Utc>>,
    pub ports_expire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HostRecord {
    pub fn status(&self) -> HostStatus {
        if self.status == "awake" {
            HostStatus::Awake
        } else {
            HostStatus::Asleep
        }
    }

    pub fn wol_port(&self) -> u16 {
        self.wol_port
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_WOL_PORT)
    }

    pub fn to_wire(&self) -> WireHost {
        WireHost {
            name: self.name.clone(),
            mac: self.mac.clone(),
            ip: self.ip.clone(),
            status: self.status(),
            ping_responsive: self.ping_responsive,
            last_seen: self.last_seen,
            discovered: self.discovered,
            notes: self.notes.clone(),
            tags: self.tags.as_ref().map(|t| t.0.clone()),
            wol_port: self.wol_port.and_then(|p| u16::try_from(p).ok()),
            ports: self.ports.as_ref().map(|p| p.0.clone()),
            ports_scanned_at: self.ports_scanned_at,
            ports_expire_at: self.ports_expire_at,
        }
    }
}

/// Manually supplied host attributes, used for creation and seeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewHost {
    pub name: String,
    pub mac: String,
    pub ip: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub wol_port: Option<u16>,
}

/// Patch applied to an existing host; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct HostPatch {
    pub name: Option<String>,
    pub mac: Option<String>,
    pub ip: Option<String>,
    pub status: Option<HostStatus>,
    pub notes: Option<String>,
    pub tags: Option<Vec<String>>,
    pub wol_port: Option<u16>,
}

/// A device observed during an ARP sweep, after name resolution and the
/// ICMP probe.
#[derive(Debug, Clone)]
pub struct ObservedDevice {
    pub ip: String,
    pub mac: String,
    pub name: String,
    pub ping_responsive: bool,
}

#[derive(Debug)]
pub enum MergeOutcome {
    Created(HostRecord),
    Updated(HostRecord),
    Unchanged(HostRecord),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("host not found")]
    NotFound,
    #[error("duplicate {0}")]
    Conflict(&'static str),
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// The agent-local host table. `(name, mac, ip)` are each unique; ARP drives
/// `status`, ICMP only `ping_responsive`; `discovered` latches 0 → 1.
#[derive(Clone)]
pub struct HostStore {
    pool: SqlitePool,
}

impl HostStore {
    pub async fn open(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_path)
            .with_context(|| format!("invalid WOLY_DB_PATH {db_path}"))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(8));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(8))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open host database {db_path}"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hosts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                mac TEXT NOT NULL UNIQUE,
                ip TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'asleep',
                ping_responsive INTEGER,
                last_seen TEXT,
                discovered INTEGER NOT NULL DEFAULT 0,
                notes TEXT,
                tags TEXT,
                wol_port INTEGER,
                ports TEXT,
                ports_scanned_at TEXT,
                ports_expire_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create hosts table")?;

        Ok(Self { pool })
    }

    /// Insert seed rows, but only when the table is empty.
    pub async fn seed_if_empty(&self, seeds: &[NewHost]) -> Result<usize, StoreError> {
        if seeds.is_empty() {
            return Ok(0);
        }
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hosts")
            .fetch_one(&self.pool)
            .await?;
        if count.0 > 0 {
            return Ok(0);
        }
        let mut inserted = 0;
        for seed in seeds {
            match self.insert(seed.clone()).await {
                Ok(_) => inserted += 1,
                Err(err) => {
                    tracing::warn!(name = %seed.name, error = %err, "skipping seed host");
                }
            }
        }
        Ok(inserted)
    }

    pub async fn list(&self) -> Result<Vec<HostRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM hosts ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<HostRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM hosts WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_by_mac(&self, mac: &str) -> Result<Option<HostRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM hosts WHERE mac = $1")
            .bind(normalize_mac(mac))
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn insert(&self, host: NewHost) -> Result<HostRecord, StoreError> {
        let mac = normalize_mac(&host.mac);
        validate_host_fields(&host.name, &mac, &host.ip)?;

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO hosts (name, mac, ip, status, discovered, notes, tags, wol_port, created_at, updated_at)
            VALUES ($1, $2, $3, 'asleep', 0, $4, $5, $6, $7, $7)
            "#,
        )
        .bind(host.name.trim())
        .bind(&mac)
        .bind(host.ip.trim())
        .bind(host.notes.as_deref())
        .bind(host.tags.clone().map(SqlJson))
        .bind(host.wol_port.map(|p| p as i64))
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self
                .get_by_mac(&mac)
                .await?
                .ok_or(StoreError::NotFound),
            Err(err) => Err(map_unique_violation(err)),
        }
    }

    /// Rename-safe update: `current_name` is the lookup key, the patch may
    /// carry a new name.
    pub async fn update(
        &self,
        current_name: &str,
        patch: HostPatch,
    ) -> Result<HostRecord, StoreError> {
        let existing = self
            .get_by_name(current_name)
            .await?
            .ok_or(StoreError::NotFound)?;

        let name = patch.name.unwrap_or_else(|| existing.name.clone());
        let mac = patch
            .mac
            .map(|m| normalize_mac(&m))
            .unwrap_or_else(|| existing.mac.clone());
        let ip = patch.ip.unwrap_or_else(|| existing.ip.clone());
        validate_host_fields(&name, &mac, &ip)?;
        let status = patch
            .status
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| existing.status.clone());

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE hosts
            SET name = $2, mac = $3, ip = $4, status = $5,
                notes = COALESCE($6, notes),
                tags = COALESCE($7, tags),
                wol_port = COALESCE($8, wol_port),
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(existing.id)
        .bind(name.trim())
        .bind(&mac)
        .bind(ip.trim())
        .bind(&status)
        .bind(patch.notes.as_deref())
        .bind(patch.tags.map(SqlJson))
        .bind(patch.wol_port.map(|p| p as i64))
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self
                .get_by_mac(&mac)
                .await?
                .ok_or(StoreError::NotFound),
            Err(err) => Err(map_unique_violation(err)),
        }
    }

    pub async fn delete_by_name(&self, name: &str) -> Result<HostRecord, StoreError> {
        let existing = self.get_by_name(name).await?.ok_or(StoreError::NotFound)?;
        sqlx::query("DELETE FROM hosts WHERE id = $1")
            .bind(existing.id)
            .execute(&self.pool)
            .await?;
        Ok(existing)
    }

    /// Merge one sweep observation: update-by-MAC when known, insert
    /// otherwise. ARP presence forces `awake` regardless of the ICMP
    /// outcome; `discovered` never goes back to 0.
    pub async fn merge_observation(
        &self,
        device: &ObservedDevice,
    ) -> Result<MergeOutcome, StoreError> {
        let mac = normalize_mac(&device.mac);
        if !is_valid_mac(&mac) {
            return Err(StoreError::Invalid {
                field: "mac",
                reason: format!("{:?}", device.mac),
            });
        }
        let now = Utc::now();

        if let Some(existing) = self.get_by_mac(&mac).await? {
            let changed = existing.status != "awake"
                || existing.ip != device.ip
                || existing.ping_responsive != Some(device.ping_responsive)
                || !existing.discovered;
            let result = sqlx::query(
                r#"
                UPDATE hosts
                SET ip = $2, status = 'awake', ping_responsive = $3, last_seen = $4,
                    discovered = 1, updated_at = $4
                WHERE id = $1
                "#,
            )
            .bind(existing.id)
            .bind(&device.ip)
            .bind(device.ping_responsive)
            .bind(now)
            .execute(&self.pool)
            .await;
            if let Err(err) = result {
                // Another row already claims this IP; keep the stale address
                // rather than fail the whole sweep.
                if is_unique_violation(&err) {
                    tracing::warn!(mac = %mac, ip = %device.ip, "ip already claimed; keeping previous address");
                    sqlx::query(
                        r#"
                        UPDATE hosts
                        SET status = 'awake', ping_responsive = $2, last_seen = $3, discovered = 1, updated_at = $3
                        WHERE id = $1
                        "#,
                    )
                    .bind(existing.id)
                    .bind(device.ping_responsive)
                    .bind(now)
                    .execute(&self.pool)
                    .await?;
                } else {
                    return Err(err.into());
                }
            }
            let record = self.get_by_mac(&mac).await?.ok_or(StoreError::NotFound)?;
            return Ok(if changed {
                MergeOutcome::Updated(record)
            } else {
                MergeOutcome::Unchanged(record)
            });
        }

        // New device: a name collision with a differently-MACed host falls
        // back to the synthesized address-based name.
        let name = match self.get_by_name(&device.name).await? {
            Some(_) => crate::discovery::resolve::synthesize_name(&device.ip),
            None => device.name.clone(),
        };
        let result = sqlx::query(
            r#"
            INSERT INTO hosts (name, mac, ip, status, ping_responsive, last_seen, discovered, created_at, updated_at)
            VALUES ($1, $2, $3, 'awake', $4, $5, 1, $5, $5)
            "#,
        )
        .bind(name.trim())
        .bind(&mac)
        .bind(&device.ip)
        .bind(device.ping_responsive)
        .bind(now)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => {
                let record = self.get_by_mac(&mac).await?.ok_or(StoreError::NotFound)?;
                Ok(MergeOutcome::Created(record))
            }
            Err(err) => Err(map_unique_violation(err)),
        }
    }

    /// Flip hosts that were absent from the sweep to `asleep`. Returns the
    /// records whose status actually changed.
    pub async fn mark_absent_asleep(
        &self,
        seen_macs: &[String],
    ) -> Result<Vec<HostRecord>, sqlx::Error> {
        let all = self.list().await?;
        let now = Utc::now();
        let mut changed = Vec::new();
        for host in all {
            if seen_macs.iter().any(|mac| mac == &host.mac) {
                continue;
            }
            if host.status == "awake" {
                sqlx::query(
                    "UPDATE hosts SET status = 'asleep', ping_responsive = 0, updated_at = $2 WHERE id = $1",
                )
                .bind(host.id)
                .bind(now)
                .execute(&self.pool)
                .await?;
                if let Some(record) = self.get_by_mac(&host.mac).await? {
                    changed.push(record);
                }
            }
        }
        Ok(changed)
    }

    pub async fn set_ping_responsive(
        &self,
        name: &str,
        responsive: bool,
    ) -> Result<HostRecord, StoreError> {
        let existing = self.get_by_name(name).await?.ok_or(StoreError::NotFound)?;
        sqlx::query(
            "UPDATE hosts SET ping_responsive = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(existing.id)
        .bind(responsive)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.get_by_mac(&existing.mac)
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn set_ports(&self, name: &str, ports: Vec<u16>) -> Result<HostRecord, StoreError> {
        let existing = self.get_by_name(name).await?.ok_or(StoreError::NotFound)?;
        let now = Utc::now();
        let expires = now + ChronoDuration::hours(PORTS_TTL_HOURS);
        sqlx::query(
            r#"
            UPDATE hosts
            SET ports = $2, ports_scanned_at = $3, ports_expire_at = $4, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(existing.id)
        .bind(SqlJson(ports))
        .bind(now)
        .bind(expires)
        .execute(&self.pool)
        .await?;
        self.get_by_mac(&existing.mac)
            .await?
            .ok_or(StoreError::NotFound)
    }
}

fn validate_host_fields(name: &str, mac: &str, ip: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::Invalid {
            field: "name",
            reason: "must not be empty".to_string(),
        });
    }
    if !is_valid_mac(mac) {
        return Err(StoreError::Invalid {
            field: "mac",
            reason: format!("{mac:?}"),
        });
    }
    if ip.trim().parse::<std::net::IpAddr>().is_err() {
        return Err(StoreError::Invalid {
            field: "ip",
            reason: format!("{ip:?}"),
        });
    }
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn map_unique_violation(err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict("name, mac, or ip")
    } else {
        StoreError::Db(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> HostStore {
        HostStore::open("sqlite::memory:").await.unwrap()
    }

    fn new_host(name: &str, mac: &str, ip: &str) -> NewHost {
        NewHost {
            name: name.to_string(),
            mac: mac.to_string(),
            ip: ip.to_string(),
            notes: None,
            tags: None,
            wol_port: None,
        }
    }

    fn observed(name: &str, mac: &str, ip: &str, ping: bool) -> ObservedDevice {
        ObservedDevice {
            ip: ip.to_string(),
            mac: mac.to_string(),
            name: name.to_string(),
            ping_responsive: ping,
        }
    }

    #[tokio::test]
    async fn unique_constraints_cover_name_mac_and_ip() {
        let store = store().await;
        store
            .insert(new_host("office", "AA:BB:CC:DD:EE:01", "192.168.1.10"))
            .await
            .unwrap();

        for dup in [
            new_host("office", "AA:BB:CC:DD:EE:02", "192.168.1.11"),
            new_host("nas", "AA:BB:CC:DD:EE:01", "192.168.1.11"),
            new_host("nas", "AA:BB:CC:DD:EE:02", "192.168.1.10"),
        ] {
            let err = store.insert(dup).await.unwrap_err();
            assert!(matches!(err, StoreError::Conflict(_)));
        }
    }

    #[tokio::test]
    async fn arp_presence_beats_icmp_failure() {
        // ARP-discovered host must be awake even when the ping failed.
        let store = store().await;
        let outcome = store
            .merge_observation(&observed("office", "aa-bb-cc-dd-ee-01", "192.168.1.10", false))
            .await
            .unwrap();
        let MergeOutcome::Created(record) = outcome else {
            panic!("expected creation");
        };
        assert_eq!(record.status, "awake");
        assert_eq!(record.ping_responsive, Some(false));
        assert_eq!(record.mac, "AA:BB:CC:DD:EE:01");
        assert!(record.discovered);
    }

    #[tokio::test]
    async fn merge_updates_by_mac_and_keeps_manual_name() {
        let store = store().await;
        store
            .insert(new_host("office", "AA:BB:CC:DD:EE:01", "192.168.1.10"))
            .await
            .unwrap();

        let outcome = store
            .merge_observation(&observed("resolved-name", "AA:BB:CC:DD:EE:01", "192.168.1.20", true))
            .await
            .unwrap();
        let MergeOutcome::Updated(record) = outcome else {
            panic!("expected update");
        };
        // The manual name wins; ip and liveness refresh.
        assert_eq!(record.name, "office");
        assert_eq!(record.ip, "192.168.1.20");
        assert_eq!(record.status, "awake");
        assert!(record.discovered);
    }

    #[tokio::test]
    async fn discovered_never_reverts() {
        let store = store().await;
        store
            .merge_observation(&observed("office", "AA:BB:CC:DD:EE:01", "192.168.1.10", true))
            .await
            .unwrap();
        let record = store
            .update(
                "office",
                HostPatch {
                    notes: Some("desk machine".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(record.discovered);
    }

    #[tokio::test]
    async fn absent_hosts_flip_to_asleep_but_are_never_deleted() {
        let store = store().await;
        store
            .merge_observation(&observed("office", "AA:BB:CC:DD:EE:01", "192.168.1.10", true))
            .await
            .unwrap();
        store
            .merge_observation(&observed("nas", "AA:BB:CC:DD:EE:02", "192.168.1.11", true))
            .await
            .unwrap();

        let changed = store
            .mark_absent_asleep(&["AA:BB:CC:DD:EE:01".to_string()])
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].name, "nas");
        assert_eq!(changed[0].status, "asleep");
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rename_safe_update_changes_the_lookup_key() {
        let store = store().await;
        store
            .insert(new_host("old-name", "AA:BB:CC:DD:EE:01", "192.168.1.10"))
            .await
            .unwrap();

        let record = store
            .update(
                "old-name",
                HostPatch {
                    name: Some("new-name".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(record.name, "new-name");
        assert!(store.get_by_name("old-name").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seeds_apply_only_to_an_empty_table() {
        let store = store().await;
        let seeds = vec![new_host("office", "AA:BB:CC:DD:EE:01", "192.168.1.10")];
        assert_eq!(store.seed_if_empty(&seeds).await.unwrap(), 1);
        assert_eq!(store.seed_if_empty(&seeds).await.unwrap(), 0);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn name_collision_on_discovery_synthesizes_address_name() {
        let store = store().await;
        store
            .insert(new_host("printer", "AA:BB:CC:DD:EE:01", "192.168.1.10"))
            .await
            .unwrap();

        let outcome = store
            .merge_observation(&observed("printer", "AA:BB:CC:DD:EE:02", "192.168.1.11", true))
            .await
            .unwrap();
        let MergeOutcome::Created(record) = outcome else {
            panic!("expected creation");
        };
        assert_eq!(record.name, "device-192-168-1-11");
    }

    #[tokio::test]
    async fn hosts_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("hosts.db").display());

        let store = HostStore::open(&url).await.unwrap();
        store
            .insert(new_host("office", "AA:BB:CC:DD:EE:01", "192.168.1.10"))
            .await
            .unwrap();
        drop(store);

        let reopened = HostStore::open(&url).await.unwrap();
        assert!(reopened.get_by_name("office").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn port_cache_carries_expiry() {
        let store = store().await;
        store
            .insert(new_host("office", "AA:BB:CC:DD:EE:01", "192.168.1.10"))
            .await
            .unwrap();
        let record = store.set_ports("office", vec![22, 443]).await.unwrap();
        assert_eq!(record.ports.as_ref().unwrap().0, vec![22, 443]);
        assert!(record.ports_expire_at.unwrap() > record.ports_scanned_at.unwrap());
    }
}
