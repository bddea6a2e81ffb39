use std::time::Duration;
use tokio::process::Command;

/// One ICMP echo with a 2 s ceiling. The outcome feeds `ping_responsive`
/// only; ARP presence decides awake/asleep.
pub async fn probe(ip: &str) -> bool {
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        Command::new("ping").args(["-c", "1", "-W", "2", ip]).output(),
    )
    .await;
    matches!(result, Ok(Ok(output)) if output.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unroutable_address_is_unresponsive() {
        // TEST-NET-1 is guaranteed unassigned; the probe must come back
        // false within its deadline rather than hang.
        assert!(!probe("192.0.2.1").await);
    }
}
