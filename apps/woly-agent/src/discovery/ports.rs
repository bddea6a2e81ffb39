use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

/// Well-known service ports probed by `scan-host-ports`.
pub const COMMON_PORTS: &[u16] = &[
    21, 22, 23, 25, 53, 80, 110, 139, 143, 443, 445, 548, 631, 993, 995, 1883, 3000, 3306, 3389,
    5000, 5432, 5900, 8080, 8443, 9090, 9100,
];

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const SCAN_CONCURRENCY: usize = 16;

/// Connect-scan the common port set; returns the open ports sorted.
pub async fn scan(ip: &str) -> Vec<u16> {
    let semaphore = std::sync::Arc::new(Semaphore::new(SCAN_CONCURRENCY));
    let mut tasks = Vec::with_capacity(COMMON_PORTS.len());
    for &port in COMMON_PORTS {
        let addr = format!("{ip}:{port}");
        let semaphore = semaphore.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(_)) => Some(port),
                _ => None,
            }
        }));
    }

    let mut open = Vec::new();
    for task in tasks {
        if let Ok(Some(port)) = task.await {
            open.push(port);
        }
    }
    open.sort_unstable();
    open
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_a_listening_port() {
        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            // Sandboxes may forbid binding; nothing to assert then.
            Err(_) => return,
        };
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        // The scanner only probes COMMON_PORTS, so probe directly here.
        let addr = format!("127.0.0.1:{port}");
        let connected =
            tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await;
        assert!(matches!(connected, Ok(Ok(_))));
        accept.abort();
    }

    #[tokio::test]
    async fn closed_host_yields_no_ports() {
        // TEST-NET-1: connects time out, scan returns empty.
        let open = scan("192.0.2.1").await;
        assert!(open.is_empty());
    }
}
