//! Client protocol message types
//!
//! Every message exchanged with a local client is a JSON envelope of the form
//! `{ "type": string, "data": object, "timestamp": epochMillis }`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DTraderError, DTraderResult};

/// Unique identifier for a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Tagged message unit of the client protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "now_millis")]
    pub timestamp: i64,
}

impl Envelope {
    /// Build an outbound envelope stamped with the current time
    pub fn new(message_type: MessageType, data: Value) -> Self {
        Self {
            message_type: message_type.as_str().to_string(),
            data,
            timestamp: now_millis(),
        }
    }

    pub fn welcome(version: &str) -> Self {
        Self::new(
            MessageType::Welcome,
            serde_json::json!({
                "message": "Connected to dtrader-crypto server",
                "version": version,
            }),
        )
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong, serde_json::json!({ "serverTime": now_millis() }))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            serde_json::json!({ "message": message.into() }),
        )
    }

    pub fn server_shutdown() -> Self {
        Self::new(
            MessageType::ServerShutdown,
            serde_json::json!({ "message": "Server is shutting down" }),
        )
    }

    /// Whether this envelope carries the given outbound type
    pub fn is(&self, message_type: MessageType) -> bool {
        self.message_type == message_type.as_str()
    }
}

/// Outbound message types sent to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Welcome,
    Pong,
    Error,
    SystemStatus,
    MarketData,
    GateioStatus,
    PingSent,
    PongReceived,
    ServerShutdown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::SystemStatus => "system_status",
            Self::MarketData => "market_data",
            Self::GateioStatus => "gateio_status",
            Self::PingSent => "ping_sent",
            Self::PongReceived => "pong_received",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Client -> Server Requests
// ============================================================================

/// A request recognised from an inbound client envelope
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// Add upstream channels to the desired subscription set
    Subscribe { channels: Vec<String> },
    /// Remove upstream channels from the desired subscription set
    Unsubscribe { channels: Vec<String> },
    /// Ask for a system status snapshot
    GetStatus,
    /// Application-level ping, answered with a pong envelope
    Ping,
    /// Any other type, forwarded opaquely
    Other { message_type: String, data: Value },
}

#[derive(Deserialize)]
struct ChannelList {
    channels: Vec<String>,
}

impl ClientRequest {
    /// Parse raw text from a client socket
    pub fn parse(text: &str) -> DTraderResult<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| DTraderError::parse(format!("Invalid message format: {}", e)))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> DTraderResult<Self> {
        match envelope.message_type.as_str() {
            "subscribe" => Ok(Self::Subscribe {
                channels: channel_list(&envelope.data, "subscribe")?,
            }),
            "unsubscribe" => Ok(Self::Unsubscribe {
                channels: channel_list(&envelope.data, "unsubscribe")?,
            }),
            "get_status" => Ok(Self::GetStatus),
            "ping" => Ok(Self::Ping),
            _ => Ok(Self::Other {
                message_type: envelope.message_type,
                data: envelope.data,
            }),
        }
    }
}

fn channel_list(data: &Value, request: &str) -> DTraderResult<Vec<String>> {
    let list = ChannelList::deserialize(data).map_err(|_| {
        DTraderError::protocol(format!(
            "Invalid {} request: data.channels must be a list of channel names",
            request
        ))
    })?;

    if list.channels.is_empty() {
        return Err(DTraderError::protocol(format!(
            "Invalid {} request: no channels given",
            request
        )));
    }

    Ok(list.channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe() {
        let request =
            ClientRequest::parse(r#"{"type":"subscribe","data":{"channels":["spot.trades"]}}"#)
                .unwrap();
        assert_eq!(
            request,
            ClientRequest::Subscribe {
                channels: vec!["spot.trades".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_status_and_ping_without_data() {
        assert_eq!(
            ClientRequest::parse(r#"{"type":"get_status"}"#).unwrap(),
            ClientRequest::GetStatus
        );
        assert_eq!(
            ClientRequest::parse(r#"{"type":"ping","timestamp":1}"#).unwrap(),
            ClientRequest::Ping
        );
    }

    #[test]
    fn test_unknown_type_is_forwarded() {
        let request =
            ClientRequest::parse(r#"{"type":"place_note","data":{"text":"hi"}}"#).unwrap();
        match request {
            ClientRequest::Other { message_type, data } => {
                assert_eq!(message_type, "place_note");
                assert_eq!(data["text"], "hi");
            }
            other => panic!("expected Other, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_json_is_a_parse_error() {
        let err = ClientRequest::parse(r#"{"type":"subscr"#).unwrap_err();
        assert!(matches!(err, DTraderError::Parse(_)));
    }

    #[test]
    fn test_subscribe_without_channels_is_rejected() {
        let err = ClientRequest::parse(r#"{"type":"subscribe","data":{}}"#).unwrap_err();
        assert!(matches!(err, DTraderError::Protocol(_)));

        let err =
            ClientRequest::parse(r#"{"type":"unsubscribe","data":{"channels":[]}}"#).unwrap_err();
        assert!(matches!(err, DTraderError::Protocol(_)));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::error("boom");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["message"], "boom");
        assert!(json["timestamp"].as_i64().unwrap() > 0);
        assert!(envelope.is(MessageType::Error));
    }
}
