use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{is_valid_mac, normalize_mac, ProtocolError};

/// Default UDP port for magic packets.
pub const DEFAULT_WOL_PORT: u16 = 9;

/// Liveness as observed by the ARP sweep. ICMP never changes this; it only
/// drives the diagnostic `pingResponsive` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Awake,
    Asleep,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Awake => "awake",
            HostStatus::Asleep => "asleep",
        }
    }
}

impl std::str::FromStr for HostStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awake" => Ok(HostStatus::Awake),
            "asleep" => Ok(HostStatus::Asleep),
            other => Err(ProtocolError::invalid(
                "status",
                format!("expected awake|asleep, got {other:?}"),
            )),
        }
    }
}

/// Host record as carried inside `host-*` event frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireHost {
    pub name: String,
    pub mac: String,
    pub ip: String,
    pub status: HostStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_responsive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub discovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wol_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports_scanned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports_expire_at: Option<DateTime<Utc>>,
}

impl WireHost {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.name.trim().is_empty() {
            return Err(ProtocolError::invalid("name", "must not be empty"));
        }
        let mac = normalize_mac(&self.mac);
        if !is_valid_mac(&mac) {
            return Err(ProtocolError::invalid("mac", format!("{:?}", self.mac)));
        }
        if self.ip.parse::<std::net::IpAddr>().is_err() {
            return Err(ProtocolError::invalid("ip", format!("{:?}", self.ip)));
        }
        Ok(())
    }

    pub fn wol_port(&self) -> u16 {
        self.wol_port.unwrap_or(DEFAULT_WOL_PORT)
    }
}
