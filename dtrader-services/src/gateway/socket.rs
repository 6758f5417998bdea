//! Channel-backed socket
//!
//! Adapts a pair of mpsc channels to the `Stream + Sink` of tungstenite
//! messages that [`super::ClientGateway::handle_connection`] expects. The
//! HTTP layer bridges framework sockets through it, and tests drive the
//! gateway with it directly.
//!
//! The sink waits for channel capacity, so a slow peer backs up into the
//! session queue where overflow is dropped and counted.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::PollSender;

pub struct ChannelSocket {
    rx: mpsc::Receiver<Message>,
    tx: PollSender<Message>,
}

/// The far side of a [`ChannelSocket`]
pub struct ChannelPeer {
    /// Frames sent here arrive on the socket's stream
    pub tx: mpsc::Sender<Message>,
    /// Frames written to the socket's sink arrive here
    pub rx: mpsc::Receiver<Message>,
}

impl ChannelSocket {
    pub fn new(rx: mpsc::Receiver<Message>, tx: mpsc::Sender<Message>) -> Self {
        Self {
            rx,
            tx: PollSender::new(tx),
        }
    }

    /// A socket and its connected peer
    pub fn pair(buffer: usize) -> (Self, ChannelPeer) {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        (
            Self::new(inbound_rx, outbound_tx),
            ChannelPeer {
                tx: inbound_tx,
                rx: outbound_rx,
            },
        )
    }
}

impl Stream for ChannelSocket {
    type Item = Result<Message, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|message| message.map(Ok))
    }
}

impl Sink<Message> for ChannelSocket {
    type Error = WsError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx
            .poll_reserve(cx)
            .map_err(|_| WsError::ConnectionClosed)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        self.tx
            .send_item(item)
            .map_err(|_| WsError::ConnectionClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}
