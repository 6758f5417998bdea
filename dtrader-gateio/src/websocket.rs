//! Gate.io WebSocket connector
//!
//! Maintains the single upstream connection: heartbeat, exponential-backoff
//! reconnects with endpoint rotation, and replay of the desired channel set
//! after every reconnect. All connection state lives in one driver task that
//! multiplexes commands, socket frames, and timers with `tokio::select!`.
//! [`GateIoWebSocket`] is a cheap handle onto that task.

use std::future::pending;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, timeout, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use dtrader_core::{
    now_millis, ConnectedInfo, ConnectionState, DTraderError, DTraderResult, DesiredSubscriptions,
    DisconnectedInfo, ErrorContext, Event, EventChannel, ExhaustedInfo, PingInfo, ReconnectPolicy,
    SubscriptionId, Topic, UpstreamFailure, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_DELAY,
};

use crate::transport::{FrameSink, FrameStream, UpstreamConnect, UpstreamSocket, WsError};
use crate::types::{parse_pong, UpstreamRequest, DEFAULT_NAMESPACE, GATEIO_WS_URLS};

/// Ping interval (Gate.io drops idle connections)
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pause between open and the subscription replay
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on the close handshake during an explicit disconnect
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Close code used when the socket vanished without a close frame
const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code used when a close frame carried no status
const NO_STATUS: u16 = 1005;

/// Configuration for GateIoWebSocket
#[derive(Clone, Debug)]
pub struct GateIoWebSocketConfig {
    /// Endpoints in rotation order
    pub urls: Vec<Url>,
    /// Channel namespace, e.g. `spot` or `futures`
    pub namespace: String,
    pub ping_interval: Duration,
    pub resubscribe_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
}

impl Default for GateIoWebSocketConfig {
    fn default() -> Self {
        Self {
            urls: GATEIO_WS_URLS
                .iter()
                .filter_map(|url| Url::parse(url).ok())
                .collect(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            ping_interval: PING_INTERVAL,
            resubscribe_delay: RESUBSCRIBE_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Commands sent to the driver task
#[derive(Debug)]
enum Command {
    Connect,
    Disconnect { done: oneshot::Sender<()> },
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Send(Value),
}

/// Driver state mirrored for the read accessors
#[derive(Debug, Default)]
struct Shared {
    state: RwLock<ConnectionState>,
    attempts: AtomicU32,
    last_pong_ms: AtomicI64,
    endpoint: RwLock<Option<Url>>,
}

/// Handle onto the Gate.io connector
#[derive(Clone, Debug)]
pub struct GateIoWebSocket {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl GateIoWebSocket {
    /// Start the driver task and hook it to the event channel's
    /// `subscribe`/`unsubscribe` topics. Does not connect.
    pub fn spawn(
        config: GateIoWebSocketConfig,
        channel: EventChannel,
        transport: Arc<dyn UpstreamConnect>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        *shared.endpoint.write() = config.urls.first().cloned();

        let mut handler_ids = Vec::with_capacity(2);
        let forward = commands.downgrade();
        handler_ids.push((
            Topic::Subscribe,
            channel.subscribe(Topic::Subscribe, move |event| {
                if let Event::Subscribe { channels } = event {
                    forward_command(&forward, Command::Subscribe(channels.clone()))?;
                }
                Ok(())
            }),
        ));
        let forward = commands.downgrade();
        handler_ids.push((
            Topic::Unsubscribe,
            channel.subscribe(Topic::Unsubscribe, move |event| {
                if let Event::Unsubscribe { channels } = event {
                    forward_command(&forward, Command::Unsubscribe(channels.clone()))?;
                }
                Ok(())
            }),
        ));

        let driver = Driver::new(
            config,
            channel,
            transport,
            Arc::clone(&shared),
            command_rx,
            handler_ids,
        );
        tokio::spawn(driver.run());

        Self { commands, shared }
    }

    /// Open the upstream connection. No-op while connecting or open; cancels
    /// a pending reconnect timer and connects immediately.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the upstream connection without automatic reconnect. Every
    /// timer and any in-flight connect are cancelled before this returns.
    pub async fn disconnect(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Disconnect { done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Add channels to the desired set, subscribing immediately when open
    pub fn subscribe(&self, channels: Vec<String>) {
        self.command(Command::Subscribe(channels));
    }

    /// Remove channels from the desired set, unsubscribing immediately when open
    pub fn unsubscribe(&self, channels: Vec<String>) {
        self.command(Command::Unsubscribe(channels));
    }

    /// Send an arbitrary JSON frame; dropped unless open
    pub fn send(&self, payload: Value) {
        self.command(Command::Send(payload));
    }

    /// Whether the upstream socket is open
    pub fn connection_status(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Acquire)
    }

    /// Time of the last upstream pong, if any was received
    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        match self.shared.last_pong_ms.load(Ordering::Acquire) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    /// Endpoint used by the next or current connect attempt
    pub fn current_endpoint(&self) -> Option<Url> {
        self.shared.endpoint.read().clone()
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("[GateIO WS] Driver stopped, command dropped");
        }
    }
}

fn forward_command(
    forward: &mpsc::WeakUnboundedSender<Command>,
    command: Command,
) -> DTraderResult<()> {
    forward
        .upgrade()
        .ok_or_else(|| DTraderError::closed("gateio driver stopped"))?
        .send(command)
        .map_err(|_| DTraderError::closed("gateio driver stopped"))
}

// ============================================================================
// Driver
// ============================================================================

type ConnectFuture = BoxFuture<'static, DTraderResult<UpstreamSocket>>;

/// One input to the driver, produced by the select in [`Driver::run`]
enum Input {
    Command(Option<Command>),
    Opened(DTraderResult<UpstreamSocket>),
    Frame(Option<Result<Message, WsError>>),
    HeartbeatTick,
    ReconnectDue,
    SettleElapsed,
}

struct Driver {
    config: GateIoWebSocketConfig,
    channel: EventChannel,
    transport: Arc<dyn UpstreamConnect>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    handler_ids: Vec<(Topic, SubscriptionId)>,

    state: ConnectionState,
    policy: ReconnectPolicy,
    desired: DesiredSubscriptions,
    /// Index into `config.urls`
    endpoint: usize,
    exhaustion_reported: bool,

    sink: Option<FrameSink>,
    stream: Option<FrameStream>,
    connecting: Option<ConnectFuture>,
    heartbeat: Option<Interval>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    settle_timer: Option<Pin<Box<Sleep>>>,
}

impl Driver {
    fn new(
        config: GateIoWebSocketConfig,
        channel: EventChannel,
        transport: Arc<dyn UpstreamConnect>,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
        handler_ids: Vec<(Topic, SubscriptionId)>,
    ) -> Self {
        let policy = ReconnectPolicy::new(config.max_reconnect_attempts, config.reconnect_base_delay);
        Self {
            config,
            channel,
            transport,
            shared,
            commands,
            handler_ids,
            state: ConnectionState::Idle,
            policy,
            desired: DesiredSubscriptions::new(),
            endpoint: 0,
            exhaustion_reported: false,
            sink: None,
            stream: None,
            connecting: None,
            heartbeat: None,
            reconnect_timer: None,
            settle_timer: None,
        }
    }

    async fn run(mut self) {
        loop {
            let input = tokio::select! {
                command = self.commands.recv() => Input::Command(command),
                opened = poll_connect(&mut self.connecting) => Input::Opened(opened),
                frame = next_frame(&mut self.stream) => Input::Frame(frame),
                _ = tick(&mut self.heartbeat) => Input::HeartbeatTick,
                _ = fire(&mut self.reconnect_timer) => Input::ReconnectDue,
                _ = fire(&mut self.settle_timer) => Input::SettleElapsed,
            };

            match input {
                Input::Command(Some(command)) => self.handle_command(command).await,
                Input::Command(None) => break,
                Input::Opened(result) => {
                    self.connecting = None;
                    match result {
                        Ok(socket) => self.handle_open(socket),
                        Err(e) => self.handle_connect_failure(e),
                    }
                }
                Input::Frame(frame) => self.handle_frame(frame).await,
                Input::HeartbeatTick => self.send_ping().await,
                Input::ReconnectDue => {
                    self.reconnect_timer = None;
                    self.policy.record_attempt();
                    self.shared
                        .attempts
                        .store(self.policy.attempt_count(), Ordering::Release);
                    self.begin_connect();
                }
                Input::SettleElapsed => {
                    self.settle_timer = None;
                    self.resubscribe().await;
                }
            }
        }

        info!("[GateIO WS] All handles dropped, shutting down driver");
        self.shutdown_socket().await;
        for (topic, id) in self.handler_ids.drain(..) {
            self.channel.unsubscribe(topic, id);
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.exhaustion_reported = false;
                self.begin_connect();
            }
            Command::Disconnect { done } => {
                self.shutdown_socket().await;
                info!("[GateIO WS] Disconnected");
                let _ = done.send(());
            }
            Command::Subscribe(channels) => {
                let added = self.desired.insert_all(channels);
                if !added.is_empty() && self.can_send_live() {
                    info!("[GateIO WS] Subscribing to {:?}", added);
                    let request = UpstreamRequest::subscribe(&self.config.namespace, added);
                    self.send_request(&request).await;
                }
            }
            Command::Unsubscribe(channels) => {
                let removed = self.desired.remove_all(&channels);
                if !removed.is_empty() && self.can_send_live() {
                    info!("[GateIO WS] Unsubscribing from {:?}", removed);
                    let request = UpstreamRequest::unsubscribe(&self.config.namespace, removed);
                    self.send_request(&request).await;
                }
            }
            Command::Send(payload) => {
                if self.state == ConnectionState::Open {
                    self.send_text(payload.to_string()).await;
                } else {
                    warn!("[GateIO WS] Not connected, dropping outbound message");
                }
            }
        }
    }

    /// Live subscription changes wait for the replay while it is pending
    fn can_send_live(&self) -> bool {
        self.state == ConnectionState::Open && self.settle_timer.is_none()
    }

    fn begin_connect(&mut self) {
        if self.state.is_active() {
            debug!("[GateIO WS] Connect ignored, already {}", self.state);
            return;
        }
        self.reconnect_timer = None;

        let url = self.config.urls.get(self.endpoint).cloned();
        match &url {
            Some(url) => info!("[GateIO WS] Connecting to {}", url),
            None => warn!("[GateIO WS] No endpoint configured"),
        }
        self.set_state(ConnectionState::Connecting);

        let transport = Arc::clone(&self.transport);
        self.connecting = Some(Box::pin(async move {
            match url {
                Some(url) => transport.connect(&url).await,
                None => Err(DTraderError::config("no upstream endpoint configured")),
            }
        }));
    }

    fn handle_open(&mut self, socket: UpstreamSocket) {
        let attempts = self.policy.attempt_count();
        self.policy.reset();
        self.exhaustion_reported = false;
        self.shared.attempts.store(0, Ordering::Release);

        self.sink = Some(socket.sink);
        self.stream = Some(socket.stream);
        self.set_state(ConnectionState::Open);

        let endpoint = self.shared.endpoint.read().clone();
        info!(
            "[GateIO WS] Connected to {}",
            endpoint.as_ref().map(Url::as_str).unwrap_or("<none>")
        );
        self.publish(Event::UpstreamConnected(ConnectedInfo {
            timestamp: now_millis(),
            reconnect_attempts: attempts,
            endpoint: endpoint.map(String::from).unwrap_or_default(),
        }));

        let period = self.config.ping_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);

        if !self.desired.is_empty() {
            self.settle_timer = Some(Box::pin(sleep(self.config.resubscribe_delay)));
        }
    }

    fn handle_connect_failure(&mut self, e: DTraderError) {
        error!("[GateIO WS] Connection failed: {}", e);
        self.publish_error(e.to_string(), ErrorContext::Connect);
        self.rotate_endpoint();
        self.handle_close(ABNORMAL_CLOSURE, e.to_string());
    }

    fn rotate_endpoint(&mut self) {
        if self.config.urls.len() > 1 {
            self.endpoint = (self.endpoint + 1) % self.config.urls.len();
            let next = self.config.urls.get(self.endpoint).cloned();
            debug!("[GateIO WS] Rotating endpoint to {:?}", next.as_ref().map(Url::as_str));
            *self.shared.endpoint.write() = next;
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
            Some(Ok(Message::Ping(data))) => {
                if let Some(sink) = self.sink.as_mut() {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        warn!("[GateIO WS] Failed to send pong: {}", e);
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                    .unwrap_or((NO_STATUS, String::new()));
                info!("[GateIO WS] Connection closed by server ({} {})", code, reason);
                self.handle_close(code, reason);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("[GateIO WS] Error: {}", e);
                self.publish_error(e.to_string(), ErrorContext::Websocket);
                self.handle_close(ABNORMAL_CLOSURE, e.to_string());
            }
            None => {
                info!("[GateIO WS] Stream ended");
                self.handle_close(ABNORMAL_CLOSURE, "stream ended".to_string());
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!("[GateIO WS] Failed to parse message: {}", e);
                return;
            }
        };

        if let Some(pong) = parse_pong(&value, &self.config.namespace) {
            debug!("[GateIO WS] Pong received");
            self.shared.last_pong_ms.store(pong.timestamp, Ordering::Release);
            self.publish(Event::PongReceived(pong));
            return;
        }

        self.publish(Event::UpstreamMessage(value));
    }

    /// Tear down after the socket or connect attempt went away, then
    /// schedule the next attempt
    fn handle_close(&mut self, code: u16, reason: String) {
        if !self.state.is_active() {
            return;
        }

        self.heartbeat = None;
        self.settle_timer = None;
        self.connecting = None;
        self.sink = None;
        self.stream = None;
        self.set_state(ConnectionState::Closed);

        self.publish(Event::UpstreamDisconnected(DisconnectedInfo {
            timestamp: now_millis(),
            code,
            reason,
        }));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_timer.is_some() {
            return;
        }

        match self.policy.next_delay() {
            Some(delay) => {
                info!(
                    "[GateIO WS] Reconnecting in {:?} (attempt {}/{})",
                    delay,
                    self.policy.attempt_count() + 1,
                    self.policy.max_attempts()
                );
                self.reconnect_timer = Some(Box::pin(sleep(delay)));
                self.set_state(ConnectionState::ReconnectWaiting);
            }
            None => {
                if !self.exhaustion_reported {
                    self.exhaustion_reported = true;
                    error!(
                        "[GateIO WS] Max reconnect attempts reached ({})",
                        self.policy.attempt_count()
                    );
                    self.publish(Event::ReconnectExhausted(ExhaustedInfo {
                        timestamp: now_millis(),
                        attempts: self.policy.attempt_count(),
                    }));
                }
            }
        }
    }

    async fn send_ping(&mut self) {
        if self.state != ConnectionState::Open {
            return;
        }

        let request = UpstreamRequest::ping(&self.config.namespace);
        let message = match serde_json::to_value(&request) {
            Ok(message) => message,
            Err(e) => {
                warn!("[GateIO WS] Failed to encode ping: {}", e);
                return;
            }
        };

        match self.write(message.to_string()).await {
            Ok(()) => self.publish(Event::PingSent(PingInfo {
                timestamp: now_millis(),
                message,
            })),
            Err(e) => {
                warn!("[GateIO WS] Failed to send ping: {}", e);
                self.publish_error(e.to_string(), ErrorContext::Heartbeat);
            }
        }
    }

    async fn resubscribe(&mut self) {
        if self.state != ConnectionState::Open {
            return;
        }

        let channels = self.desired.to_vec();
        info!("[GateIO WS] Re-subscribing to {} channels", channels.len());
        for channel in channels {
            let request = UpstreamRequest::subscribe(&self.config.namespace, vec![channel]);
            self.send_request(&request).await;
        }
    }

    async fn send_request(&mut self, request: &UpstreamRequest) {
        match request.to_json() {
            Ok(json) => self.send_text(json).await,
            Err(e) => warn!("[GateIO WS] Failed to encode {}: {}", request.channel, e),
        }
    }

    async fn send_text(&mut self, text: String) {
        if let Err(e) = self.write(text).await {
            warn!("[GateIO WS] Failed to send: {}", e);
            self.publish_error(e.to_string(), ErrorContext::Send);
        }
    }

    async fn write(&mut self, text: String) -> DTraderResult<()> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| DTraderError::closed("upstream not connected"))?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| DTraderError::network(e.to_string()))
    }

    /// Drop every timer and the in-flight connect, close the socket
    async fn shutdown_socket(&mut self) {
        self.reconnect_timer = None;
        self.settle_timer = None;
        self.heartbeat = None;
        self.connecting = None;
        self.stream = None;

        let was_open = self.state == ConnectionState::Open;
        if let Some(mut sink) = self.sink.take() {
            self.set_state(ConnectionState::Closing);
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "disconnect requested".to_string().into(),
            }));
            let closing = async {
                sink.send(close).await?;
                sink.close().await
            };
            match timeout(CLOSE_TIMEOUT, closing).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("[GateIO WS] Close handshake failed: {}", e),
                Err(_) => debug!("[GateIO WS] Close handshake timed out"),
            }
        }

        if self.state != ConnectionState::Idle {
            self.set_state(ConnectionState::Closed);
        }
        if was_open {
            self.publish(Event::UpstreamDisconnected(DisconnectedInfo {
                timestamp: now_millis(),
                code: u16::from(CloseCode::Normal),
                reason: "disconnect requested".to_string(),
            }));
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        *self.shared.state.write() = state;
    }

    fn publish(&self, event: Event) {
        self.channel.publish(event);
    }

    fn publish_error(&self, error: String, context: ErrorContext) {
        self.publish(Event::UpstreamError(UpstreamFailure {
            timestamp: now_millis(),
            error,
            context,
        }));
    }
}

async fn poll_connect(connecting: &mut Option<ConnectFuture>) -> DTraderResult<UpstreamSocket> {
    match connecting.as_mut() {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn next_frame(stream: &mut Option<FrameStream>) -> Option<Result<Message, WsError>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat.as_mut() {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => pending().await,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ChannelTransport, ConnectRequest, RemoteEnd};
    use serde_json::json;
    use tokio::time::Instant;

    struct Harness {
        ws: GateIoWebSocket,
        channel: EventChannel,
        requests: mpsc::UnboundedReceiver<ConnectRequest>,
        events: mpsc::UnboundedReceiver<Event>,
    }

    impl Harness {
        fn new(config: GateIoWebSocketConfig) -> Self {
            let channel = EventChannel::new();
            let (events_tx, events) = mpsc::unbounded_channel();
            channel.subscribe_many(
                &[
                    Topic::UpstreamConnected,
                    Topic::UpstreamDisconnected,
                    Topic::UpstreamError,
                    Topic::ReconnectExhausted,
                    Topic::UpstreamMessage,
                    Topic::PingSent,
                    Topic::PongReceived,
                ],
                move |event| {
                    let _ = events_tx.send(event.clone());
                    Ok(())
                },
            );

            let (transport, requests) = ChannelTransport::new();
            let ws = GateIoWebSocket::spawn(config, channel.clone(), Arc::new(transport));
            Self {
                ws,
                channel,
                requests,
                events,
            }
        }

        async fn next_request(&mut self) -> ConnectRequest {
            timeout(Duration::from_secs(600), self.requests.recv())
                .await
                .expect("connect attempt")
                .expect("transport alive")
        }

        async fn no_request_within(&mut self, window: Duration) -> bool {
            timeout(window, self.requests.recv()).await.is_err()
        }

        async fn next_event(&mut self) -> Event {
            timeout(Duration::from_secs(600), self.events.recv())
                .await
                .expect("event")
                .expect("channel alive")
        }

        async fn open(&mut self) -> RemoteEnd {
            self.ws.connect();
            let remote = self.next_request().await.accept();
            assert!(matches!(self.next_event().await, Event::UpstreamConnected(_)));
            remote
        }
    }

    fn config() -> GateIoWebSocketConfig {
        GateIoWebSocketConfig {
            urls: vec![
                Url::parse("ws://primary.test/v4/").unwrap(),
                Url::parse("ws://secondary.test/v4/").unwrap(),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = GateIoWebSocketConfig::default();
        assert_eq!(config.urls.len(), 3);
        assert_eq!(config.namespace, "spot");
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.reconnect_base_delay, Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_publishes_connected_and_resets_state() {
        let mut harness = Harness::new(config());
        assert_eq!(harness.ws.connection_state(), ConnectionState::Idle);

        let _remote = harness.open().await;
        assert!(harness.ws.connection_status());
        assert_eq!(harness.ws.reconnect_attempts(), 0);
        assert_eq!(harness.ws.last_pong(), None);
        assert_eq!(
            harness.ws.current_endpoint().unwrap().as_str(),
            "ws://primary.test/v4/"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_open_is_noop() {
        let mut harness = Harness::new(config());
        let _remote = harness.open().await;

        harness.ws.connect();
        assert!(harness.no_request_within(Duration::from_secs(1)).await);
        assert!(harness.ws.connection_status());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_rotates_endpoints() {
        let mut harness = Harness::new(config());
        harness.ws.connect();

        let mut request = harness.next_request().await;
        assert_eq!(request.url.as_str(), "ws://primary.test/v4/");

        for expected in [5000u64, 10000, 20000, 40000] {
            request.reject("connection refused");

            match harness.next_event().await {
                Event::UpstreamError(failure) => assert_eq!(failure.context, ErrorContext::Connect),
                other => panic!("unexpected event {:?}", other),
            }
            match harness.next_event().await {
                Event::UpstreamDisconnected(info) => assert_eq!(info.code, 1006),
                other => panic!("unexpected event {:?}", other),
            }
            assert_eq!(harness.ws.connection_state(), ConnectionState::ReconnectWaiting);

            let started = Instant::now();
            request = harness.next_request().await;
            let waited = started.elapsed();
            assert!(waited >= Duration::from_millis(expected), "waited {:?}", waited);
            assert!(waited < Duration::from_millis(expected + 100), "waited {:?}", waited);
        }

        // Four failures rotated primary -> secondary -> primary -> secondary -> primary
        assert_eq!(request.url.as_str(), "ws://primary.test/v4/");
        assert_eq!(harness.ws.reconnect_attempts(), 4);

        let _remote = request.accept();
        match harness.next_event().await {
            Event::UpstreamConnected(info) => assert_eq!(info.reconnect_attempts, 4),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(harness.ws.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reported_once() {
        let mut harness = Harness::new(GateIoWebSocketConfig {
            max_reconnect_attempts: 3,
            reconnect_base_delay: Duration::from_millis(100),
            ..config()
        });
        harness.ws.connect();

        // Initial attempt plus three reconnects
        for _ in 0..4 {
            harness.next_request().await.reject("connection refused");
        }
        assert!(harness.no_request_within(Duration::from_secs(60)).await);

        let mut exhausted = Vec::new();
        while let Ok(event) = harness.events.try_recv() {
            if let Event::ReconnectExhausted(info) = event {
                exhausted.push(info);
            }
        }
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].attempts, 3);
        assert_eq!(harness.ws.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_connect_after_exhaustion() {
        let mut harness = Harness::new(GateIoWebSocketConfig {
            max_reconnect_attempts: 1,
            reconnect_base_delay: Duration::from_millis(100),
            ..config()
        });
        harness.ws.connect();
        harness.next_request().await.reject("refused");
        harness.next_request().await.reject("refused");
        assert!(harness.no_request_within(Duration::from_secs(5)).await);

        harness.ws.connect();
        let _remote = harness.next_request().await.accept();
        loop {
            if let Event::UpstreamConnected(info) = harness.next_event().await {
                assert_eq!(info.reconnect_attempts, 1);
                break;
            }
        }
        assert_eq!(harness.ws.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_subscribe_and_unsubscribe() {
        let mut harness = Harness::new(config());
        let mut remote = harness.open().await;

        harness
            .ws
            .subscribe(vec!["spot.trades".to_string(), "spot.tickers".to_string()]);
        let frame = remote.next_json().await.unwrap();
        assert_eq!(frame["channel"], "spot.subscribe");
        assert_eq!(frame["payload"], json!(["spot.trades", "spot.tickers"]));

        // Already desired, nothing new to send
        harness.ws.subscribe(vec!["spot.trades".to_string()]);
        harness.ws.unsubscribe(vec!["spot.tickers".to_string()]);
        let frame = remote.next_json().await.unwrap();
        assert_eq!(frame["channel"], "spot.unsubscribe");
        assert_eq!(frame["payload"], json!(["spot.tickers"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_channel_requests_reach_upstream() {
        let mut harness = Harness::new(config());
        let mut remote = harness.open().await;

        harness.channel.publish(Event::Subscribe {
            channels: vec!["spot.order_book".to_string()],
        });
        let frame = remote.next_json().await.unwrap();
        assert_eq!(frame["channel"], "spot.subscribe");
        assert_eq!(frame["payload"], json!(["spot.order_book"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_every_channel_after_reconnect() {
        let mut harness = Harness::new(config());
        harness
            .ws
            .subscribe(vec!["spot.trades".to_string(), "spot.tickers".to_string()]);

        // Desired before the first open: replayed after the settle delay
        harness.ws.connect();
        let mut remote = harness.next_request().await.accept();
        let opened = Instant::now();
        assert!(matches!(harness.next_event().await, Event::UpstreamConnected(_)));
        assert_eq!(remote.next_json().await.unwrap()["payload"], json!(["spot.trades"]));
        assert!(opened.elapsed() >= Duration::from_millis(500));
        assert_eq!(remote.next_json().await.unwrap()["payload"], json!(["spot.tickers"]));

        remote.close(1001, "going away");
        match harness.next_event().await {
            Event::UpstreamDisconnected(info) => {
                assert_eq!(info.code, 1001);
                assert_eq!(info.reason, "going away");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let mut remote = harness.next_request().await.accept();
        assert!(matches!(harness.next_event().await, Event::UpstreamConnected(_)));

        let mut replayed = Vec::new();
        for _ in 0..2 {
            let frame = remote.next_json().await.unwrap();
            assert_eq!(frame["channel"], "spot.subscribe");
            replayed.push(frame["payload"][0].as_str().unwrap().to_string());
        }
        assert_eq!(replayed, vec!["spot.trades", "spot.tickers"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_and_pong() {
        let mut harness = Harness::new(config());
        let mut remote = harness.open().await;
        let opened = Instant::now();

        let ping = remote.next_json().await.unwrap();
        assert_eq!(ping["channel"], "spot.ping");
        assert!(opened.elapsed() >= Duration::from_secs(30));
        match harness.next_event().await {
            Event::PingSent(info) => assert_eq!(info.message["channel"], "spot.ping"),
            other => panic!("unexpected event {:?}", other),
        }

        remote.send_json(&json!({ "time": 1_700_000_000, "channel": "spot.pong", "result": null }));
        match harness.next_event().await {
            Event::PongReceived(info) => assert_eq!(info.time, Some(1_700_000_000)),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(harness.ws.last_pong().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_and_failed_pings_keep_connection() {
        let mut harness = Harness::new(config());
        let mut remote = harness.open().await;

        for _ in 0..3 {
            assert_eq!(remote.next_json().await.unwrap()["channel"], "spot.ping");
            assert!(matches!(harness.next_event().await, Event::PingSent(_)));
        }
        assert_eq!(harness.ws.connection_state(), ConnectionState::Open);
        assert!(harness.no_request_within(Duration::from_secs(1)).await);

        remote.stop_reading();
        match harness.next_event().await {
            Event::UpstreamError(failure) => assert_eq!(failure.context, ErrorContext::Heartbeat),
            other => panic!("unexpected event {:?}", other),
        }

        // Further failing pings only report errors
        assert!(harness.no_request_within(Duration::from_secs(95)).await);
        assert_eq!(harness.ws.connection_state(), ConnectionState::Open);
        harness.channel.settled().await;
        while let Ok(event) = harness.events.try_recv() {
            match event {
                Event::UpstreamError(failure) => assert_eq!(failure.context, ErrorContext::Heartbeat),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_waiting_skips_backoff() {
        let mut harness = Harness::new(config());
        harness.ws.connect();
        harness.next_request().await.reject("refused");
        while !matches!(harness.next_event().await, Event::UpstreamDisconnected(_)) {}
        assert_eq!(harness.ws.connection_state(), ConnectionState::ReconnectWaiting);

        let started = Instant::now();
        harness.ws.connect();
        let request = harness.next_request().await;
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(request.url.as_str(), "ws://secondary.test/v4/");

        let _remote = request.accept();
        while !matches!(harness.next_event().await, Event::UpstreamConnected(_)) {}

        // The cancelled 5 s timer never produces another attempt
        assert!(harness.no_request_within(Duration::from_secs(20)).await);
        assert_eq!(harness.ws.connection_state(), ConnectionState::Open);
        assert_eq!(harness.ws.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_market_frames_are_republished_and_garbage_dropped() {
        let mut harness = Harness::new(config());
        let remote = harness.open().await;

        remote.send_text("not json {");
        let update = json!({
            "channel": "spot.trades",
            "event": "update",
            "result": { "currency_pair": "BTC_USDT", "price": "42000" },
        });
        remote.send_json(&update);

        match harness.next_event().await {
            Event::UpstreamMessage(value) => assert_eq!(value, update),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_ping_is_answered() {
        let mut harness = Harness::new(config());
        let mut remote = harness.open().await;

        remote.send_frame(Message::Ping(vec![1u8, 2, 3].into()));
        match remote.next_frame().await {
            Some(Message::Pong(data)) => assert_eq!(&data[..], &[1u8, 2, 3]),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_closes_and_reconnects() {
        let mut harness = Harness::new(config());
        let remote = harness.open().await;

        remote.fail();
        match harness.next_event().await {
            Event::UpstreamError(failure) => assert_eq!(failure.context, ErrorContext::Websocket),
            other => panic!("unexpected event {:?}", other),
        }
        match harness.next_event().await {
            Event::UpstreamDisconnected(info) => assert_eq!(info.code, 1006),
            other => panic!("unexpected event {:?}", other),
        }
        let _next = harness.next_request().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let mut harness = Harness::new(config());
        harness.ws.connect();
        harness.next_request().await.reject("refused");
        while !matches!(harness.next_event().await, Event::UpstreamDisconnected(_)) {}
        assert_eq!(harness.ws.connection_state(), ConnectionState::ReconnectWaiting);

        harness.ws.disconnect().await;
        assert_eq!(harness.ws.connection_state(), ConnectionState::Closed);
        assert!(harness.no_request_within(Duration::from_secs(120)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_open() {
        let mut harness = Harness::new(config());
        let mut remote = harness.open().await;

        harness.ws.disconnect().await;
        assert_eq!(harness.ws.connection_state(), ConnectionState::Closed);

        match remote.next_frame().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("unexpected frame {:?}", other),
        }
        match harness.next_event().await {
            Event::UpstreamDisconnected(info) => assert_eq!(info.code, 1000),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(harness.no_request_within(Duration::from_secs(120)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_open_socket() {
        let mut harness = Harness::new(config());
        harness.ws.send(json!({ "dropped": true }));

        let mut remote = harness.open().await;
        harness.ws.send(json!({ "channel": "spot.custom" }));
        assert_eq!(remote.next_json().await.unwrap(), json!({ "channel": "spot.custom" }));
    }
}
