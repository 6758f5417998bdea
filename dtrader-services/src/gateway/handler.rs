//! Client gateway
//!
//! Accepts local client sockets, answers their requests, and fans upstream
//! lifecycle and market events out to every open session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use dtrader_core::{
    ClientCommand, ClientCount, ClientId, ClientRequest, DTraderResult, Envelope, Event,
    EventChannel, MessageType, SubscriptionId, Topic,
};

use super::session::ClientSession;

/// Outbound queue depth per client
const OUTBOUND_BUFFER: usize = 256;

/// Events relayed to clients
const RELAYED_TOPICS: [Topic; 8] = [
    Topic::UpstreamConnected,
    Topic::UpstreamDisconnected,
    Topic::ReconnectExhausted,
    Topic::UpstreamMessage,
    Topic::PingSent,
    Topic::PongReceived,
    Topic::SystemStatus,
    Topic::StatusReply,
];

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Version reported in the welcome message
    pub version: String,
    /// Publish unrecognised request types as `client_command`
    pub forward_unknown: bool,
    pub outbound_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            forward_unknown: true,
            outbound_buffer: OUTBOUND_BUFFER,
        }
    }
}

/// Owns the set of live client sessions
pub struct ClientGateway {
    config: GatewayConfig,
    channel: EventChannel,
    sessions: RwLock<HashMap<ClientId, Arc<ClientSession>>>,
    next_client_id: AtomicU64,
    accepting: AtomicBool,
    relay_ids: Mutex<Vec<(Topic, SubscriptionId)>>,
}

impl ClientGateway {
    /// Create the gateway and register its relays on the event channel
    pub fn new(config: GatewayConfig, channel: EventChannel) -> Arc<Self> {
        let gateway = Arc::new(Self {
            config,
            channel,
            sessions: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            relay_ids: Mutex::new(Vec::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&gateway);
        let ids = gateway.channel.subscribe_many(&RELAYED_TOPICS, move |event| {
            match weak.upgrade() {
                Some(gateway) => gateway.relay(event),
                None => Ok(()),
            }
        });
        *gateway.relay_ids.lock() = ids;

        gateway
    }

    /// Serve one client socket until it closes
    pub async fn handle_connection<S>(&self, socket: S)
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + 'static,
    {
        let (mut ws_sender, mut ws_receiver) = socket.split();

        if !self.accepting.load(Ordering::Acquire) {
            debug!("Refusing WebSocket connection, gateway closed");
            let refusal = Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "server shutting down".to_string().into(),
            }));
            let _ = ws_sender.send(refusal).await;
            let _ = ws_sender.close().await;
            return;
        }

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(self.config.outbound_buffer);
        let (session, clients_count) = self.attach(outgoing_tx);
        let client_id = session.id;
        info!("New WebSocket connection: {}", client_id);

        session.send_envelope(&Envelope::welcome(&self.config.version));
        self.channel
            .publish(Event::ClientConnected(ClientCount { clients_count }));

        // Drain the session queue into the socket
        let send_task = async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_sender.send(message).await.is_err() {
                    break;
                }
                if closing {
                    let _ = ws_sender.close().await;
                    break;
                }
            }
        };

        let recv_task = async {
            while let Some(result) = ws_receiver.next().await {
                match result {
                    Ok(Message::Close(_)) => {
                        debug!("Received close from {}", client_id);
                        break;
                    }
                    Ok(message) => self.handle_message(&session, message),
                    Err(e) => {
                        debug!("WebSocket error for {}: {}", client_id, e);
                        break;
                    }
                }
            }
        };

        // Either side finishing ends the connection
        tokio::select! {
            _ = send_task => {}
            _ = recv_task => {}
        }

        session.mark_closed();
        self.detach(client_id);
        info!("WebSocket connection closed: {}", client_id);
    }

    fn attach(&self, tx: mpsc::Sender<Message>) -> (Arc<ClientSession>, usize) {
        let client_id = ClientId(self.next_client_id.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(ClientSession::new(client_id, tx));

        let mut sessions = self.sessions.write();
        sessions.insert(client_id, Arc::clone(&session));
        (session, sessions.len())
    }

    fn detach(&self, client_id: ClientId) {
        let remaining = {
            let mut sessions = self.sessions.write();
            sessions.remove(&client_id).map(|_| sessions.len())
        };

        if let Some(clients_count) = remaining {
            self.channel
                .publish(Event::ClientDisconnected(ClientCount { clients_count }));
        }
    }

    fn handle_message(&self, session: &ClientSession, message: Message) {
        match message {
            Message::Text(text) => match ClientRequest::parse(text.as_str()) {
                Ok(request) => self.handle_request(session, request),
                Err(e) => {
                    warn!("Invalid message from {}: {}", session.id, e);
                    session.send_envelope(&Envelope::error(e.to_string()));
                }
            },
            Message::Binary(_) => {
                session.send_envelope(&Envelope::error("Binary messages not supported"));
            }
            Message::Ping(_) => {
                // Answered by the WebSocket layer
                debug!("Received ping from {}", session.id);
            }
            Message::Pong(_) => {
                debug!("Received pong from {}", session.id);
            }
            Message::Close(_) | Message::Frame(_) => {}
        }
    }

    fn handle_request(&self, session: &ClientSession, request: ClientRequest) {
        match request {
            ClientRequest::Subscribe { channels } => {
                debug!("{} subscribing to {:?}", session.id, channels);
                self.channel.publish(Event::Subscribe { channels });
            }
            ClientRequest::Unsubscribe { channels } => {
                debug!("{} unsubscribing from {:?}", session.id, channels);
                self.channel.publish(Event::Unsubscribe { channels });
            }
            ClientRequest::GetStatus => {
                self.channel.publish(Event::StatusRequest {
                    client_id: session.id,
                });
            }
            ClientRequest::Ping => {
                session.send_envelope(&Envelope::pong());
            }
            ClientRequest::Other { message_type, data } => {
                if self.config.forward_unknown {
                    self.channel.publish(Event::ClientCommand(ClientCommand {
                        client_id: session.id,
                        message_type,
                        data,
                    }));
                } else {
                    debug!("Ignoring {} message from {}", message_type, session.id);
                }
            }
        }
    }

    /// Translate an event into its client envelope
    fn relay(&self, event: &Event) -> DTraderResult<()> {
        match event {
            Event::UpstreamConnected(info) => {
                self.broadcast(&Envelope::new(
                    MessageType::GateioStatus,
                    with_connected(info, true)?,
                ));
            }
            Event::UpstreamDisconnected(info) => {
                self.broadcast(&Envelope::new(
                    MessageType::GateioStatus,
                    with_connected(info, false)?,
                ));
            }
            Event::ReconnectExhausted(info) => {
                self.broadcast(&Envelope::new(
                    MessageType::GateioStatus,
                    json!({
                        "connected": false,
                        "reconnectExhausted": true,
                        "attempts": info.attempts,
                        "timestamp": info.timestamp,
                    }),
                ));
            }
            Event::UpstreamMessage(payload) => {
                self.broadcast(&Envelope::new(MessageType::MarketData, payload.clone()));
            }
            Event::PingSent(info) => {
                self.broadcast(&Envelope::new(
                    MessageType::PingSent,
                    serde_json::to_value(info)?,
                ));
            }
            Event::PongReceived(info) => {
                self.broadcast(&Envelope::new(
                    MessageType::PongReceived,
                    serde_json::to_value(info)?,
                ));
            }
            Event::SystemStatus(status) => {
                self.broadcast(&Envelope::new(
                    MessageType::SystemStatus,
                    serde_json::to_value(status)?,
                ));
            }
            Event::StatusReply { client_id, status } => {
                self.send_to(
                    *client_id,
                    &Envelope::new(MessageType::SystemStatus, serde_json::to_value(status)?),
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Deliver an envelope to every session open at call time.
    ///
    /// Returns the number of sessions that accepted it.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let json = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize {}: {}", envelope.message_type, e);
                return 0;
            }
        };
        let frame = Message::Text(json.into());

        let recipients: Vec<Arc<ClientSession>> = self
            .sessions
            .read()
            .values()
            .filter(|session| session.is_open())
            .cloned()
            .collect();

        let mut delivered = 0;
        for session in &recipients {
            if session.send(frame.clone()) {
                delivered += 1;
            } else {
                debug!("Dropped {} for {}", envelope.message_type, session.id);
            }
        }
        debug!(
            "Broadcast {} to {}/{} clients",
            envelope.message_type,
            delivered,
            recipients.len()
        );
        delivered
    }

    /// Deliver an envelope to one session
    pub fn send_to(&self, client_id: ClientId, envelope: &Envelope) -> bool {
        let session = self.sessions.read().get(&client_id).cloned();
        match session {
            Some(session) => session.send_envelope(envelope),
            None => {
                debug!("No session {} for {}", client_id, envelope.message_type);
                false
            }
        }
    }

    /// Notify clients of shutdown, close every session, and refuse new ones
    pub fn close(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }

        self.broadcast(&Envelope::server_shutdown());

        let sessions: Vec<Arc<ClientSession>> =
            self.sessions.write().drain().map(|(_, session)| session).collect();
        for session in &sessions {
            session.close(CloseCode::Away, "server shutdown");
        }

        for (topic, id) in self.relay_ids.lock().drain(..) {
            self.channel.unsubscribe(topic, id);
        }
        info!("Client gateway closed, released {} sessions", sessions.len());
    }

    pub fn client_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ClientGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientGateway")
            .field("clients", &self.client_count())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// Serialize an upstream payload and tag it with the connection flag
fn with_connected<T: Serialize>(info: &T, connected: bool) -> DTraderResult<Value> {
    let mut data = serde_json::to_value(info)?;
    if let Value::Object(map) = &mut data {
        map.insert("connected".to_string(), Value::Bool(connected));
    }
    Ok(data)
}
