//! WebSocket gateway for local clients
//!
//! Tracks connected sessions, parses client requests onto the event channel,
//! and relays upstream events back to clients as JSON envelopes.

mod handler;
mod session;
mod socket;

pub use handler::{ClientGateway, GatewayConfig};
pub use session::ClientSession;
pub use socket::{ChannelPeer, ChannelSocket};
