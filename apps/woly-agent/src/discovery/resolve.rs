use std::net::IpAddr;
use std::time::Duration;
use tokio::process::Command;

use hickory_resolver::TokioAsyncResolver;

/// NetBIOS lookups are capped hard; a dead host must not stall the sweep.
const NETBIOS_TIMEOUT: Duration = Duration::from_secs(2);

/// An ARP-supplied name is usable when it is non-empty, not the `?`
/// placeholder, and not just an IP literal.
pub fn is_usable_arp_name(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty() && trimmed != "?" && trimmed.parse::<IpAddr>().is_err()
}

/// First label of a fully-qualified name, e.g. `office.lan` → `office`.
pub fn strip_domain(name: &str) -> String {
    name.trim()
        .trim_end_matches('.')
        .split('.')
        .next()
        .unwrap_or(name)
        .to_string()
}

/// Fallback name when nothing resolves: `device-192-168-1-10`.
pub fn synthesize_name(ip: &str) -> String {
    format!("device-{}", ip.replace(['.', ':'], "-"))
}

pub struct HostnameResolver {
    dns: Option<TokioAsyncResolver>,
}

impl HostnameResolver {
    pub fn new() -> Self {
        let dns = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|err| {
                tracing::warn!(error = %err, "reverse DNS unavailable; falling back to NetBIOS");
                err
            })
            .ok();
        Self { dns }
    }

    /// Resolution chain: usable ARP name → reverse DNS → NetBIOS →
    /// synthesized address name.
    pub async fn resolve(&self, ip: &str, arp_name: Option<&str>) -> String {
        if let Some(name) = arp_name {
            if is_usable_arp_name(name) {
                return strip_domain(name);
            }
        }

        if let Some(name) = self.reverse_dns(ip).await {
            return name;
        }
        if let Some(name) = netbios_lookup(ip).await {
            return name;
        }
        synthesize_name(ip)
    }

    async fn reverse_dns(&self, ip: &str) -> Option<String> {
        let resolver = self.dns.as_ref()?;
        let addr: IpAddr = ip.parse().ok()?;
        let response = tokio::time::timeout(Duration::from_secs(2), resolver.reverse_lookup(addr))
            .await
            .ok()?
            .ok()?;
        let name = response.iter().next()?.to_string();
        let label = strip_domain(&name);
        if label.is_empty() {
            None
        } else {
            Some(label)
        }
    }
}

/// `nmblookup -A <ip>`; first unique `<00>` entry is the machine name.
async fn netbios_lookup(ip: &str) -> Option<String> {
    let output = tokio::time::timeout(
        NETBIOS_TIMEOUT,
        Command::new("nmblookup").args(["-A", ip]).output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_nmblookup(&String::from_utf8_lossy(&output.stdout))
}

pub fn parse_nmblookup(text: &str) -> Option<String> {
    for line in text.lines() {
        let trimmed = line.trim();
        if !trimmed.contains("<00>") || trimmed.contains("<GROUP>") {
            continue;
        }
        let name = trimmed.split_whitespace().next()?;
        if !name.is_empty() && name != "*" {
            return Some(name.to_lowercase());
        }
    }
    None
}
