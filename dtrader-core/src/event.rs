//! Events exchanged over the in-process event channel
//!
//! Each [`Event`] variant belongs to exactly one named [`Topic`]. Payload
//! structs serialize to the camelCase shape relayed to clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::ClientId;
use crate::status::SystemStatus;

/// Named event topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    UpstreamConnected,
    UpstreamDisconnected,
    UpstreamError,
    ReconnectExhausted,
    UpstreamMessage,
    PingSent,
    PongReceived,
    Subscribe,
    Unsubscribe,
    StatusRequest,
    StatusReply,
    SystemStatus,
    SystemStarted,
    ClientConnected,
    ClientDisconnected,
    ClientCommand,
}

impl Topic {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UpstreamConnected => "gateio_connected",
            Self::UpstreamDisconnected => "gateio_disconnected",
            Self::UpstreamError => "gateio_error",
            Self::ReconnectExhausted => "gateio_max_reconnects",
            Self::UpstreamMessage => "gateio_message",
            Self::PingSent => "ping_sent",
            Self::PongReceived => "pong_received",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::StatusRequest => "get_status",
            Self::StatusReply => "status_reply",
            Self::SystemStatus => "system_status",
            Self::SystemStarted => "system_started",
            Self::ClientConnected => "client_connected",
            Self::ClientDisconnected => "client_disconnected",
            Self::ClientCommand => "client_command",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Upstream socket opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedInfo {
    pub timestamp: i64,
    pub reconnect_attempts: u32,
    pub endpoint: String,
}

/// Upstream socket closed, for any reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectedInfo {
    pub timestamp: i64,
    pub code: u16,
    pub reason: String,
}

/// Where an upstream error surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorContext {
    Connect,
    Websocket,
    Heartbeat,
    Send,
}

/// Non-fatal upstream transport error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamFailure {
    pub timestamp: i64,
    pub error: String,
    pub context: ErrorContext,
}

/// Reconnect attempts exhausted; no further automatic attempt follows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExhaustedInfo {
    pub timestamp: i64,
    pub attempts: u32,
}

/// Heartbeat ping written to the upstream socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingInfo {
    pub timestamp: i64,
    pub message: Value,
}

/// Heartbeat echo read from the upstream socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongInfo {
    /// `time` field of the echo frame (unix seconds)
    pub time: Option<i64>,
    /// Local receive time (epoch millis)
    pub timestamp: i64,
    pub server_time: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCount {
    pub clients_count: usize,
}

/// Client request of an unrecognised type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCommand {
    pub client_id: ClientId,
    pub message_type: String,
    pub data: Value,
}

// ============================================================================
// Event
// ============================================================================

/// An event published on the event channel
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    UpstreamConnected(ConnectedInfo),
    UpstreamDisconnected(DisconnectedInfo),
    UpstreamError(UpstreamFailure),
    ReconnectExhausted(ExhaustedInfo),
    /// Upstream frame that is not a heartbeat echo, republished verbatim
    UpstreamMessage(Value),
    PingSent(PingInfo),
    PongReceived(PongInfo),
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    StatusRequest { client_id: ClientId },
    StatusReply { client_id: ClientId, status: SystemStatus },
    SystemStatus(SystemStatus),
    SystemStarted { timestamp: i64 },
    ClientConnected(ClientCount),
    ClientDisconnected(ClientCount),
    ClientCommand(ClientCommand),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Self::UpstreamConnected(_) => Topic::UpstreamConnected,
            Self::UpstreamDisconnected(_) => Topic::UpstreamDisconnected,
            Self::UpstreamError(_) => Topic::UpstreamError,
            Self::ReconnectExhausted(_) => Topic::ReconnectExhausted,
            Self::UpstreamMessage(_) => Topic::UpstreamMessage,
            Self::PingSent(_) => Topic::PingSent,
            Self::PongReceived(_) => Topic::PongReceived,
            Self::Subscribe { .. } => Topic::Subscribe,
            Self::Unsubscribe { .. } => Topic::Unsubscribe,
            Self::StatusRequest { .. } => Topic::StatusRequest,
            Self::StatusReply { .. } => Topic::StatusReply,
            Self::SystemStatus(_) => Topic::SystemStatus,
            Self::SystemStarted { .. } => Topic::SystemStarted,
            Self::ClientConnected(_) => Topic::ClientConnected,
            Self::ClientDisconnected(_) => Topic::ClientDisconnected,
            Self::ClientCommand(_) => Topic::ClientCommand,
        }
    }
}
