use anyhow::Result;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;

use woly_proto::{is_valid_mac, normalize_mac};

/// One row of the neighbor table after a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: String,
    pub mac: String,
    /// Name hint from `arp -a`, when the resolver already knew one.
    pub name: Option<String>,
}

/// Probe fan-out used to populate the neighbor table before reading it.
const SWEEP_CONCURRENCY: usize = 32;

/// Enumerate the local /24s worth sweeping: one per non-loopback IPv4
/// interface address.
pub fn local_subnets() -> Vec<Ipv4Addr> {
    let mut bases = Vec::new();
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return bases;
    };
    for interface in interfaces {
        if interface.is_loopback() {
            continue;
        }
        if let std::net::IpAddr::V4(addr) = interface.ip() {
            let octets = addr.octets();
            let base = Ipv4Addr::new(octets[0], octets[1], octets[2], 0);
            if !bases.contains(&base) {
                bases.push(base);
            }
        }
    }
    bases
}

/// Ping every address of the /24 once with a short timeout. Replies are not
/// inspected; the point is the ARP traffic the probes generate.
pub async fn populate_neighbors(base: Ipv4Addr) {
    let semaphore = std::sync::Arc::new(Semaphore::new(SWEEP_CONCURRENCY));
    let mut tasks = Vec::with_capacity(254);
    let octets = base.octets();
    for last in 1..=254u8 {
        let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], last);
        let semaphore = semaphore.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let _ = tokio::time::timeout(
                Duration::from_secs(2),
                Command::new("ping")
                    .args(["-c", "1", "-W", "1", &ip.to_string()])
                    .output(),
            )
            .await;
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
}

/// Read the ARP/neighbor table. `ip neigh` is preferred; `arp -a` is the
/// fallback on systems without iproute2.
pub async fn read_neighbors() -> Result<Vec<ArpEntry>> {
    if let Ok(output) = Command::new("ip").args(["neigh", "show"]).output().await {
        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            let entries = parse_ip_neigh(&text);
            if !entries.is_empty() {
                return Ok(entries);
            }
        }
    }

    let output = Command::new("arp").arg("-a").output().await?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(parse_arp_a(&text))
}

/// `192.168.1.10 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE`
pub fn parse_ip_neigh(text: &str) -> Vec<ArpEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(ip) = fields.first() else { continue };
        if ip.parse::<Ipv4Addr>().is_err() {
            continue;
        }
        if fields.iter().any(|f| *f == "FAILED" || *f == "INCOMPLETE") {
            continue;
        }
        let Some(position) = fields.iter().position(|f| *f == "lladdr") else {
            continue;
        };
        let Some(raw_mac) = fields.get(position + 1) else {
            continue;
        };
        let mac = normalize_mac(raw_mac);
        if !is_valid_mac(&mac) {
            continue;
        }
        entries.push(ArpEntry {
            ip: ip.to_string(),
            mac,
            name: None,
        });
    }
    entries
}

/// `office.lan (192.168.1.10) at aa:bb:cc:dd:ee:ff [ether] on eth0`
pub fn parse_arp_a(text: &str) -> Vec<ArpEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let name = fields[0];
        let ip = fields[1].trim_start_matches('(').trim_end_matches(')');
        if ip.parse::<Ipv4Addr>().is_err() {
            continue;
        }
        let Some(position) = fields.iter().position(|f| *f == "at") else {
            continue;
        };
        let Some(raw_mac) = fields.get(position + 1) else {
            continue;
        };
        let mac = normalize_mac(raw_mac);
        if !is_valid_mac(&mac) {
            continue;
        }
        entries.push(ArpEntry {
            ip: ip.to_string(),
            mac,
            name: if name == "?" {
                None
            } else {
                Some(name.to_string())
            },
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_neigh_output() {
        let text = "\
192.168.1.10 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE
192.168.1.11 dev eth0 lladdr 11-22-33-44-55-66 STALE
192.168.1.12 dev eth0 FAILED
fe80::1 dev eth0 lladdr aa:bb:cc:dd:ee:01 router REACHABLE
192.168.1.13 dev eth0 INCOMPLETE
";
        let entries = parse_ip_neigh(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ip, "192.168.1.10");
        assert_eq!(entries[0].mac, "AA:BB:CC:DD:EE:FF");
        // Dashes normalize to colons.
        assert_eq!(entries[1].mac, "11:22:33:44:55:66");
    }

    #[test]
    fn parses_arp_a_output() {
        let text = "\
office.lan (192.168.1.10) at aa:bb:cc:dd:ee:ff [ether] on eth0
? (192.168.1.11) at 11:22:33:44:55:66 [ether] on eth0
gateway (192.168.1.1) at <incomplete> on eth0
";
        let entries = parse_arp_a(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name.as_deref(), Some("office.lan"));
        assert_eq!(entries[1].name, None);
    }

    #[test]
    fn ignores_garbage_lines() {
        assert!(parse_ip_neigh("not arp output\n\n").is_empty());
        assert!(parse_arp_a("nothing here").is_empty());
    }
}
