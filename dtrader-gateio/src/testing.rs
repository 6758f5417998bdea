//! In-memory upstream transport
//!
//! Every connect attempt made through [`ChannelTransport`] surfaces as a
//! [`ConnectRequest`] that the test accepts or rejects. An accepted request
//! yields a [`RemoteEnd`] that plays the exchange side of the socket.

use std::io;

use async_trait::async_trait;
use futures::channel::mpsc as frames;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use dtrader_core::{DTraderError, DTraderResult};

use crate::transport::{UpstreamConnect, UpstreamSocket, WsError};

/// Transport whose connect attempts are answered by the test
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    requests: mpsc::UnboundedSender<ConnectRequest>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectRequest>) {
        let (requests, incoming) = mpsc::unbounded_channel();
        (Self { requests }, incoming)
    }
}

#[async_trait]
impl UpstreamConnect for ChannelTransport {
    async fn connect(&self, url: &Url) -> DTraderResult<UpstreamSocket> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(ConnectRequest {
                url: url.clone(),
                reply,
            })
            .map_err(|_| DTraderError::network("transport closed"))?;

        response
            .await
            .map_err(|_| DTraderError::network("connect request dropped"))?
    }
}

/// A pending connect attempt
#[derive(Debug)]
pub struct ConnectRequest {
    pub url: Url,
    reply: oneshot::Sender<DTraderResult<UpstreamSocket>>,
}

impl ConnectRequest {
    /// Complete the handshake and hand back the exchange side
    pub fn accept(self) -> RemoteEnd {
        let (outbound, stream) = frames::unbounded::<Result<Message, WsError>>();
        let (sink, inbound) = frames::unbounded::<Message>();

        let socket = UpstreamSocket::from_parts(
            Box::pin(sink.sink_map_err(|_| WsError::ConnectionClosed)),
            Box::pin(stream),
        );
        let _ = self.reply.send(Ok(socket));

        RemoteEnd { outbound, inbound }
    }

    /// Fail the connect attempt
    pub fn reject(self, reason: &str) {
        let _ = self.reply.send(Err(DTraderError::network(reason)));
    }
}

/// Exchange side of an accepted in-memory socket
#[derive(Debug)]
pub struct RemoteEnd {
    outbound: frames::UnboundedSender<Result<Message, WsError>>,
    inbound: frames::UnboundedReceiver<Message>,
}

impl RemoteEnd {
    pub fn send_frame(&self, message: Message) -> bool {
        self.outbound.unbounded_send(Ok(message)).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        let text: String = text.into();
        self.send_frame(Message::Text(text.into()))
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Send a close frame
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.send_frame(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        })))
    }

    /// Surface a transport error on the connector's read half
    pub fn fail(&self) -> bool {
        let error = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        self.outbound.unbounded_send(Err(WsError::Io(error))).is_ok()
    }

    /// Stop accepting frames; later writes by the connector fail
    pub fn stop_reading(&mut self) {
        self.inbound.close();
    }

    /// Next frame written by the connector, `None` once its sink is gone
    pub async fn next_frame(&mut self) -> Option<Message> {
        self.inbound.next().await
    }

    /// Next text frame written by the connector, parsed as JSON
    pub async fn next_json(&mut self) -> Option<Value> {
        while let Some(message) = self.inbound.next().await {
            if let Message::Text(text) = message {
                if let Ok(value) = serde_json::from_str(text.as_str()) {
                    return Some(value);
                }
            }
        }
        None
    }
}
