//! Shared protocol contract between the woly C&C server and node agents.
//!
//! Every frame on the wire is a JSON text message of the shape
//! `{type, data, commandId?}`. The two directions are disjoint tagged
//! unions: [`NodeMessage`] (node → C&C) and [`ServerMessage`] (C&C → node).
//! Decoding is parse-then-validate; callers must treat any
//! [`ProtocolError`] as "drop the frame and count it", never as a crash.

mod frames;
mod host;

pub use frames::*;
pub use host::*;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: &str = "1.1";

/// Versions the C&C accepts during registration. Negotiation is exact-match:
/// the server echoes the node's advertised version when it appears here and
/// closes with [`close_code::BAD_REGISTER`] otherwise.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["1.0", "1.1"];

/// WebSocket close codes with protocol-level meaning.
pub mod close_code {
    /// Clean shutdown.
    pub const NORMAL: u16 = 1000;
    /// Session token expired; the node should refresh and reconnect.
    pub const AUTH_EXPIRED: u16 = 4001;
    /// Malformed register frame or unsupported protocol version.
    pub const BAD_REGISTER: u16 = 4400;
    /// Credentials rejected or revoked.
    pub const AUTH_REVOKED: u16 = 4401;
    /// The register identity conflicts with the authenticated subject.
    pub const IDENTITY_CONFLICT: u16 = 4410;
    /// Inbound message rate limit breached.
    pub const RATE_LIMITED: u16 = 4429;
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl ProtocolError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Normalize a MAC address to the canonical wire form: uppercase hex pairs
/// joined by `:` (dashes accepted on input).
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_uppercase().replace('-', ":")
}

/// A normalized MAC is six uppercase hex pairs joined by `:`.
pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Best-effort `type` tag extraction for counter labels on frames that fail
/// to decode. Returns `"unknown"` when the tag is absent or not a string.
pub fn frame_type_hint(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}
