use woly_proto::{CommandResultData, WireHost};

/// Events produced by the session manager and consumed by the single
/// serialized dispatch loop in `main`, which fans them out to the
/// aggregator, command router, and webhook dispatcher. Host events carry the
/// bound identity, never the payload-supplied one.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    NodeOnline {
        node_id: String,
    },
    NodeOffline {
        node_id: String,
    },
    HostDiscovered {
        node_id: String,
        location: String,
        host: WireHost,
    },
    HostUpdated {
        node_id: String,
        location: String,
        host: WireHost,
    },
    HostRemoved {
        node_id: String,
        location: String,
        host: WireHost,
    },
    ScanComplete {
        node_id: String,
        hosts_found: u32,
    },
    CommandResult(CommandResultData),
}
