use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use woly_proto::normalize_mac;

const VENDOR_API: &str = "https://api.macvendors.com";
const CACHE_TTL_HOURS: i64 = 24;
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct CachedVendor {
    vendor: Option<String>,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum VendorError {
    #[error("vendor not found")]
    NotFound,
    #[error("vendor lookup unavailable: {0}")]
    Upstream(String),
}

/// OUI vendor lookups against an external HTTP API with a small in-memory
/// cache. Upstream failures never propagate past this module's error type.
pub struct MacVendorLookup {
    http: reqwest::Client,
    cache: Mutex<HashMap<String, CachedVendor>>,
}

impl MacVendorLookup {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, mac: &str) -> Result<String, VendorError> {
        let mac = normalize_mac(mac);
        let prefix = oui_prefix(&mac);

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&prefix) {
                if Utc::now() - entry.fetched_at < ChronoDuration::hours(CACHE_TTL_HOURS) {
                    return entry.vendor.clone().ok_or(VendorError::NotFound);
                }
            }
        }

        let url = format!("{VENDOR_API}/{mac}");
        let response = self
            .http
            .get(&url)
            .timeout(LOOKUP_TIMEOUT)
            .send()
            .await
            .map_err(|err| VendorError::Upstream(err.to_string()))?;

        let vendor = match response.status() {
            status if status.is_success() => {
                let text = response
                    .text()
                    .await
                    .map_err(|err| VendorError::Upstream(err.to_string()))?;
                let trimmed = text.trim().to_string();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed)
                }
            }
            reqwest::StatusCode::NOT_FOUND => None,
            status => return Err(VendorError::Upstream(format!("status {status}"))),
        };

        self.cache.lock().await.insert(
            prefix,
            CachedVendor {
                vendor: vendor.clone(),
                fetched_at: Utc::now(),
            },
        );
        vendor.ok_or(VendorError::NotFound)
    }
}

/// Vendors are assigned per OUI; cache on the first three octets.
fn oui_prefix(mac: &str) -> String {
    mac.split(':').take(3).collect::<Vec<_>>().join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oui_prefix_is_first_three_octets() {
        assert_eq!(oui_prefix("AA:BB:CC:DD:EE:FF"), "AA:BB:CC");
    }

    #[tokio::test]
    async fn cache_hit_skips_the_network() {
        let lookup = MacVendorLookup::new(reqwest::Client::new());
        lookup.cache.lock().await.insert(
            "AA:BB:CC".to_string(),
            CachedVendor {
                vendor: Some("Acme Corp".to_string()),
                fetched_at: Utc::now(),
            },
        );
        let vendor = lookup.lookup("aa-bb-cc-dd-ee-ff").await.unwrap();
        assert_eq!(vendor, "Acme Corp");
    }

    #[tokio::test]
    async fn cached_negative_result_is_not_found() {
        let lookup = MacVendorLookup::new(reqwest::Client::new());
        lookup.cache.lock().await.insert(
            "AA:BB:CC".to_string(),
            CachedVendor {
                vendor: None,
                fetched_at: Utc::now(),
            },
        );
        assert!(matches!(
            lookup.lookup("AA:BB:CC:DD:EE:FF").await,
            Err(VendorError::NotFound)
        ));
    }
}
