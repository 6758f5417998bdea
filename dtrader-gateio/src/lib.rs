//! Gate.io integration for dtrader-crypto
//!
//! This crate owns the single upstream WebSocket connection to Gate.io:
//! heartbeat, reconnect with exponential backoff, and replay of the desired
//! channel set. Market data and lifecycle changes are published on the
//! shared [`dtrader_core::EventChannel`].

pub mod transport;
pub mod types;
pub mod websocket;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use transport::{TungsteniteConnector, UpstreamConnect, UpstreamSocket};
pub use types::{UpstreamRequest, DEFAULT_NAMESPACE, GATEIO_WS_URLS};
pub use websocket::{GateIoWebSocket, GateIoWebSocketConfig};
