//! Core types for dtrader-crypto
//!
//! This crate defines the data structures shared by the upstream connector
//! and the client gateway, plus the in-process event channel that wires
//! them together.

pub mod connection;
pub mod envelope;
pub mod error;
pub mod event;
pub mod event_channel;
pub mod status;

pub use connection::{
    ConnectionState, DesiredSubscriptions, ReconnectPolicy, BACKOFF_FACTOR,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY,
};
pub use envelope::{now_millis, ClientId, ClientRequest, Envelope, MessageType};
pub use error::{DTraderError, DTraderResult};
pub use event::{
    ClientCommand, ClientCount, ConnectedInfo, DisconnectedInfo, ErrorContext, Event,
    ExhaustedInfo, PingInfo, PongInfo, Topic, UpstreamFailure,
};
pub use event_channel::{EventChannel, Handler, SubscriptionId};
pub use status::{RunStatus, SystemStatus};
