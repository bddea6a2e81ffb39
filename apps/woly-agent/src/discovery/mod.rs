pub mod arp;
pub mod ping;
pub mod ports;
pub mod resolve;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::events::{EventSender, HostEvent};
use crate::hostdb::{HostStore, MergeOutcome, ObservedDevice};

/// First scan is deferred so the HTTP API comes up responsive.
const INITIAL_SCAN_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Another scan owned the flag; this trigger was a no-op.
    Skipped,
    Completed {
        found: usize,
        created: usize,
        updated: usize,
    },
}

/// Periodic ARP + DNS/NetBIOS + ICMP discovery, serialized by a
/// `scan_in_progress` flag. Concurrent triggers are skipped, never queued.
pub struct Scanner {
    store: HostStore,
    events: EventSender,
    resolver: resolve::HostnameResolver,
    scan_in_progress: AtomicBool,
    interval: Duration,
}

impl Scanner {
    pub fn new(store: HostStore, events: EventSender, scan_interval_ms: u64) -> Self {
        Self {
            store,
            events,
            resolver: resolve::HostnameResolver::new(),
            scan_in_progress: AtomicBool::new(false),
            interval: Duration::from_millis(scan_interval_ms),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_in_progress.load(Ordering::SeqCst)
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(INITIAL_SCAN_DELAY) => {}
            }
            if let Err(err) = self.sync_with_network().await {
                tracing::warn!(error = %err, "initial network scan failed");
            }

            let mut interval = tokio::time::interval(self.interval);
            // An interval's first tick fires immediately; the deferred scan
            // above already covered it.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = self.sync_with_network().await {
                            tracing::warn!(error = %err, "network scan failed");
                        }
                    }
                }
            }
        });
    }

    /// Run one full sweep: populate and read the neighbor table, resolve
    /// names, probe liveness, merge into the host DB, and emit events.
    pub async fn sync_with_network(&self) -> anyhow::Result<ScanOutcome> {
        if self
            .scan_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("scan already in progress; skipping trigger");
            return Ok(ScanOutcome::Skipped);
        }
        let result = self.run_sweep().await;
        self.scan_in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn run_sweep(&self) -> anyhow::Result<ScanOutcome> {
        let started = Instant::now();
        tracing::info!("network scan started");

        for base in arp::local_subnets() {
            arp::populate_neighbors(base).await;
        }
        let entries = arp::read_neighbors().await?;

        let mut created = 0usize;
        let mut updated = 0usize;
        let mut seen_macs = Vec::with_capacity(entries.len());
        for entry in &entries {
            let name = self.resolver.resolve(&entry.ip, entry.name.as_deref()).await;
            let ping_responsive = ping::probe(&entry.ip).await;
            let device = ObservedDevice {
                ip: entry.ip.clone(),
                mac: entry.mac.clone(),
                name,
                ping_responsive,
            };
            seen_macs.push(entry.mac.clone());

            match self.store.merge_observation(&device).await {
                Ok(MergeOutcome::Created(record)) => {
                    created += 1;
                    let _ = self.events.send(HostEvent::Discovered(record));
                }
                Ok(MergeOutcome::Updated(record)) => {
                    updated += 1;
                    let _ = self.events.send(HostEvent::Updated(record));
                }
                Ok(MergeOutcome::Unchanged(_)) => {}
                Err(err) => {
                    tracing::warn!(ip = %device.ip, mac = %device.mac, error = %err, "failed to merge device");
                }
            }
        }

        for record in self.store.mark_absent_asleep(&seen_macs).await? {
            updated += 1;
            let _ = self.events.send(HostEvent::Updated(record));
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let found = entries.len();
        tracing::info!(found, created, updated, duration_ms, "network scan finished");
        let _ = self.events.send(HostEvent::ScanComplete {
            hosts_found: found as u32,
            duration_ms,
        });
        Ok(ScanOutcome::Completed {
            found,
            created,
            updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_triggers_are_skipped() {
        let store = HostStore::open("sqlite::memory:").await.unwrap();
        let events = crate::events::channel();
        let scanner = Arc::new(Scanner::new(store, events, 300_000));

        // Hold the flag as a running scan would.
        scanner.scan_in_progress.store(true, Ordering::SeqCst);
        let outcome = scanner.sync_with_network().await.unwrap();
        assert_eq!(outcome, ScanOutcome::Skipped);
        assert!(scanner.is_scanning());
    }
}
