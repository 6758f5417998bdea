//! Upstream transport seam
//!
//! The connector never calls `connect_async` directly; it goes through
//! [`UpstreamConnect`] so tests can script the exchange side in memory.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

use dtrader_core::{DTraderError, DTraderResult};

pub type WsError = tokio_tungstenite::tungstenite::Error;

/// Write half of an upstream socket
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Read half of an upstream socket
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// An open upstream socket, already split
pub struct UpstreamSocket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl UpstreamSocket {
    pub fn new<S>(socket: S) -> Self
    where
        S: Sink<Message, Error = WsError> + Stream<Item = Result<Message, WsError>> + Send + 'static,
    {
        let (sink, stream) = socket.split();
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    pub fn from_parts(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl std::fmt::Debug for UpstreamSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UpstreamSocket")
    }
}

/// Opens upstream sockets
#[async_trait]
pub trait UpstreamConnect: Send + Sync {
    async fn connect(&self, url: &Url) -> DTraderResult<UpstreamSocket>;
}

/// Production transport over `tokio-tungstenite`
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl UpstreamConnect for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> DTraderResult<UpstreamSocket> {
        let (ws_stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| DTraderError::network(format!("{}: {}", url, e)))?;
        debug!("[GateIO WS] Handshake with {} returned {}", url, response.status());
        Ok(UpstreamSocket::new(ws_stream))
    }
}
