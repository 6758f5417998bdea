//! Service layer for dtrader-crypto
//!
//! This crate provides the client-facing WebSocket gateway and the
//! coordinator that ties it to the Gate.io connector.

pub mod coordinator;
pub mod gateway;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use gateway::{ChannelPeer, ChannelSocket, ClientGateway, ClientSession, GatewayConfig};
