//! System status snapshot shared with clients and the health endpoint

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse run status of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Connected,
    Disconnected,
}

/// Point-in-time view of the system, derived on demand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub status: RunStatus,
    /// Epoch millis of the last upstream pong, 0 if none was received
    pub last_pong: i64,
    #[serde(rename = "gateIOConnected")]
    pub gate_io_connected: bool,
    pub clients_connected: usize,
}

impl SystemStatus {
    pub fn snapshot(
        running: bool,
        last_pong: Option<DateTime<Utc>>,
        upstream_connected: bool,
        clients_connected: usize,
    ) -> Self {
        Self {
            status: if running {
                RunStatus::Connected
            } else {
                RunStatus::Disconnected
            },
            last_pong: last_pong.map(|t| t.timestamp_millis()).unwrap_or(0),
            gate_io_connected: upstream_connected,
            clients_connected,
        }
    }

    pub fn last_pong_time(&self) -> Option<DateTime<Utc>> {
        if self.last_pong > 0 {
            DateTime::from_timestamp_millis(self.last_pong)
        } else {
            None
        }
    }
}
