use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{is_valid_mac, normalize_mac, ProtocolError, WireHost, SUPPORTED_PROTOCOL_VERSIONS};

/// Frames sent by a node agent to the C&C.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum NodeMessage {
    Register(RegisterData),
    Heartbeat(HeartbeatData),
    HostDiscovered(HostEventData),
    HostUpdated(HostEventData),
    HostRemoved(HostEventData),
    ScanComplete(ScanCompleteData),
    CommandResult(CommandResultData),
}

/// Frames sent by the C&C to a node agent. The host maintenance commands
/// (`scan-host-ports`, `ping-host`, `sleep-host`, `shutdown-host`) share the
/// same typed-contract discipline as the core set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    Registered(RegisteredData),
    Wake(WakeData),
    Scan(ScanData),
    UpdateHost(UpdateHostData),
    DeleteHost(DeleteHostData),
    ScanHostPorts(HostRefData),
    PingHost(HostRefData),
    SleepHost(HostRefData),
    ShutdownHost(HostRefData),
    Ping,
    Error(ErrorData),
}

/// Envelope for C&C → node frames. Commands carry a server-generated
/// `commandId` at the top level; `registered`/`ping`/`error` omit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(flatten)]
    pub message: ServerMessage,
    #[serde(
        rename = "commandId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub command_id: Option<Uuid>,
}

impl ServerFrame {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            message,
            command_id: None,
        }
    }

    pub fn command(message: ServerMessage, command_id: Uuid) -> Self {
        Self {
            message,
            command_id: Some(command_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_info: Option<NetworkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterData {
    pub node_id: String,
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: NodeMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredData {
    pub node_id: String,
    /// Heartbeat cadence in milliseconds; the node must honor this value.
    pub heartbeat_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEventData {
    pub node_id: String,
    #[serde(flatten)]
    pub host: WireHost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanCompleteData {
    pub node_id: String,
    #[serde(default)]
    pub hosts_found: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultData {
    pub node_id: String,
    pub command_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeData {
    pub host_name: String,
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wol_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanData {
    pub immediate: bool,
}

/// Rename-safe host update: `currentName` is the lookup key, `name` the
/// desired name after the update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateHostData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_name: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<crate::HostStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wol_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteHostData {
    pub name: String,
}

/// Payload for commands addressing one host by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRefData {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl NodeMessage {
    /// The wire `type` tag, used for counter labels and logs.
    pub fn type_tag(&self) -> &'static str {
        match self {
            NodeMessage::Register(_) => "register",
            NodeMessage::Heartbeat(_) => "heartbeat",
            NodeMessage::HostDiscovered(_) => "host-discovered",
            NodeMessage::HostUpdated(_) => "host-updated",
            NodeMessage::HostRemoved(_) => "host-removed",
            NodeMessage::ScanComplete(_) => "scan-complete",
            NodeMessage::CommandResult(_) => "command-result",
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            NodeMessage::Register(data) => {
                require_nonempty("nodeId", &data.node_id)?;
                require_nonempty("name", &data.name)?;
                require_nonempty("location", &data.location)?;
                if let Some(version) = data.metadata.protocol_version.as_deref() {
                    if version.trim().is_empty() {
                        return Err(ProtocolError::invalid(
                            "protocolVersion",
                            "must not be empty when present",
                        ));
                    }
                }
                Ok(())
            }
            NodeMessage::Heartbeat(data) => require_nonempty("nodeId", &data.node_id),
            NodeMessage::HostDiscovered(data)
            | NodeMessage::HostUpdated(data)
            | NodeMessage::HostRemoved(data) => {
                require_nonempty("nodeId", &data.node_id)?;
                data.host.validate()
            }
            NodeMessage::ScanComplete(data) => require_nonempty("nodeId", &data.node_id),
            NodeMessage::CommandResult(data) => {
                require_nonempty("nodeId", &data.node_id)?;
                if data.command_id.is_nil() {
                    return Err(ProtocolError::invalid("commandId", "must not be nil"));
                }
                Ok(())
            }
        }
    }
}

impl ServerMessage {
    pub fn type_tag(&self) -> &'static str {
        match self {
            ServerMessage::Registered(_) => "registered",
            ServerMessage::Wake(_) => "wake",
            ServerMessage::Scan(_) => "scan",
            ServerMessage::UpdateHost(_) => "update-host",
            ServerMessage::DeleteHost(_) => "delete-host",
            ServerMessage::ScanHostPorts(_) => "scan-host-ports",
            ServerMessage::PingHost(_) => "ping-host",
            ServerMessage::SleepHost(_) => "sleep-host",
            ServerMessage::ShutdownHost(_) => "shutdown-host",
            ServerMessage::Ping => "ping",
            ServerMessage::Error(_) => "error",
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ServerMessage::Registered(data) => {
                require_nonempty("nodeId", &data.node_id)?;
                if data.heartbeat_interval < 1000 {
                    return Err(ProtocolError::invalid(
                        "heartbeatInterval",
                        "must be at least 1000ms",
                    ));
                }
                Ok(())
            }
            ServerMessage::Wake(data) => {
                require_nonempty("hostName", &data.host_name)?;
                if !is_valid_mac(&normalize_mac(&data.mac)) {
                    return Err(ProtocolError::invalid("mac", format!("{:?}", data.mac)));
                }
                Ok(())
            }
            ServerMessage::Scan(_) | ServerMessage::Ping => Ok(()),
            ServerMessage::UpdateHost(data) => {
                require_nonempty("name", &data.name)?;
                if let Some(mac) = data.mac.as_deref() {
                    if !is_valid_mac(&normalize_mac(mac)) {
                        return Err(ProtocolError::invalid("mac", format!("{mac:?}")));
                    }
                }
                Ok(())
            }
            ServerMessage::DeleteHost(data) => require_nonempty("name", &data.name),
            ServerMessage::ScanHostPorts(data)
            | ServerMessage::PingHost(data)
            | ServerMessage::SleepHost(data)
            | ServerMessage::ShutdownHost(data) => require_nonempty("name", &data.name),
            ServerMessage::Error(data) => require_nonempty("message", &data.message),
        }
    }
}

/// Decode and validate a node → C&C frame.
pub fn decode_node_frame(text: &str) -> Result<NodeMessage, ProtocolError> {
    let message: NodeMessage = serde_json::from_str(text)?;
    message.validate()?;
    Ok(message)
}

/// Decode and validate a C&C → node frame.
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, ProtocolError> {
    let frame: ServerFrame = serde_json::from_str(text)?;
    frame.message.validate()?;
    Ok(frame)
}

/// Whether the node's advertised protocol version is one the server speaks.
pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

fn require_nonempty(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::invalid(field, "must not be empty"));
    }
    Ok(())
}
