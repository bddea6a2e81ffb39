use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use woly_proto::{is_valid_mac, normalize_mac, DEFAULT_WOL_PORT};

/// A magic packet is six 0xFF bytes followed by the target MAC sixteen
/// times.
pub fn magic_packet(mac: &str) -> Result<[u8; 102]> {
    let mac = normalize_mac(mac);
    if !is_valid_mac(&mac) {
        anyhow::bail!("invalid MAC address {mac:?}");
    }
    let mut octets = [0u8; 6];
    for (index, part) in mac.split(':').enumerate() {
        octets[index] = u8::from_str_radix(part, 16).context("invalid MAC octet")?;
    }

    let mut packet = [0u8; 102];
    packet[..6].fill(0xFF);
    for repeat in 0..16 {
        let offset = 6 + repeat * 6;
        packet[offset..offset + 6].copy_from_slice(&octets);
    }
    Ok(packet)
}

/// Broadcast a magic packet for `mac` on the given UDP port (default 9).
pub async fn send_magic_packet(mac: &str, port: Option<u16>) -> Result<()> {
    let packet = magic_packet(mac)?;
    let port = port.unwrap_or(DEFAULT_WOL_PORT);

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind WoL socket")?;
    socket
        .set_broadcast(true)
        .context("failed to enable broadcast")?;
    socket
        .send_to(&packet, ("255.255.255.255", port))
        .await
        .with_context(|| format!("failed to send magic packet for {mac}"))?;
    tracing::info!(mac = %normalize_mac(mac), port, "magic packet sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_layout_is_six_ff_then_sixteen_macs() {
        let packet = magic_packet("aa-bb-cc-dd-ee-ff").unwrap();
        assert_eq!(&packet[..6], &[0xFF; 6]);
        let mac = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        for repeat in 0..16 {
            let offset = 6 + repeat * 6;
            assert_eq!(&packet[offset..offset + 6], &mac);
        }
    }

    #[test]
    fn rejects_malformed_macs() {
        assert!(magic_packet("").is_err());
        assert!(magic_packet("AA:BB:CC:DD:EE").is_err());
        assert!(magic_packet("ZZ:BB:CC:DD:EE:FF").is_err());
    }
}
