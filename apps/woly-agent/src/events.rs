use tokio::sync::broadcast;

use crate::hostdb::HostRecord;

/// Host lifecycle events emitted by the scanner and the local CRUD surface.
/// The C&C client subscribes and mirrors them upstream so the aggregator
/// stays coherent with both discovery and manual edits.
#[derive(Debug, Clone)]
pub enum HostEvent {
    Discovered(HostRecord),
    Updated(HostRecord),
    Removed(HostRecord),
    ScanComplete { hosts_found: u32, duration_ms: u64 },
}

pub type EventSender = broadcast::Sender<HostEvent>;

pub fn channel() -> EventSender {
    broadcast::channel(256).0
}
