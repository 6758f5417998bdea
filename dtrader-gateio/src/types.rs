//! Gate.io v4 WebSocket frame types
//!
//! Requests are JSON text frames of the form
//! `{"time": <unix seconds>, "channel": "<ns>.<op>", "payload": [..]}`.
//! Heartbeat echoes arrive either on the `<ns>.pong` channel or with
//! `"result": "pong"`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dtrader_core::{now_millis, DTraderResult, PongInfo};

/// Public Gate.io WebSocket endpoints, tried in order on connect failures
pub const GATEIO_WS_URLS: [&str; 3] = [
    "wss://ws.gate.io/v4/",
    "wss://api.gateio.ws/ws/v4/",
    "wss://fx-ws.gateio.ws/v4/ws/usdt",
];

/// Channel namespace used for spot market data
pub const DEFAULT_NAMESPACE: &str = "spot";

/// Outbound request frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamRequest {
    /// Unix seconds
    pub time: i64,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<String>>,
}

impl UpstreamRequest {
    fn new(namespace: &str, op: &str, payload: Option<Vec<String>>) -> Self {
        Self {
            time: Utc::now().timestamp(),
            channel: format!("{}.{}", namespace, op),
            payload,
        }
    }

    pub fn ping(namespace: &str) -> Self {
        Self::new(namespace, "ping", None)
    }

    pub fn subscribe(namespace: &str, channels: Vec<String>) -> Self {
        Self::new(namespace, "subscribe", Some(channels))
    }

    pub fn unsubscribe(namespace: &str, channels: Vec<String>) -> Self {
        Self::new(namespace, "unsubscribe", Some(channels))
    }

    pub fn to_json(&self) -> DTraderResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Recognise a heartbeat echo and extract its timing fields
pub fn parse_pong(frame: &Value, namespace: &str) -> Option<PongInfo> {
    let on_pong_channel = frame
        .get("channel")
        .and_then(Value::as_str)
        .map(|channel| {
            channel
                .strip_prefix(namespace)
                .and_then(|rest| rest.strip_prefix('.'))
                == Some("pong")
        })
        .unwrap_or(false);
    let pong_result = frame.get("result").and_then(Value::as_str) == Some("pong");

    if !on_pong_channel && !pong_result {
        return None;
    }

    Some(PongInfo {
        time: frame.get("time").and_then(Value::as_i64),
        timestamp: now_millis(),
        server_time: frame
            .get("result")
            .and_then(|result| result.get("time"))
            .and_then(Value::as_i64),
    })
}
