//! System coordinator
//!
//! Wires the Gate.io connector and the client gateway onto one event
//! channel, answers status queries, and owns startup and shutdown ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use dtrader_core::{Event, EventChannel, SystemStatus, Topic};
use dtrader_gateio::{GateIoWebSocket, GateIoWebSocketConfig, UpstreamConnect};

use crate::gateway::{ClientGateway, GatewayConfig};

/// Resolution of the status loop
const STATUS_TICK: Duration = Duration::from_secs(1);

/// Default period between `system_status` broadcasts
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Lifecycle events logged by the coordinator
const LIFECYCLE_TOPICS: [Topic; 10] = [
    Topic::UpstreamConnected,
    Topic::UpstreamDisconnected,
    Topic::UpstreamError,
    Topic::ReconnectExhausted,
    Topic::PingSent,
    Topic::PongReceived,
    Topic::ClientConnected,
    Topic::ClientDisconnected,
    Topic::ClientCommand,
    Topic::SystemStarted,
];

/// Configuration for the Coordinator
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub upstream: GateIoWebSocketConfig,
    pub gateway: GatewayConfig,
    pub status_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            upstream: GateIoWebSocketConfig::default(),
            gateway: GatewayConfig::default(),
            status_interval: STATUS_INTERVAL,
        }
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    channel: EventChannel,
    connector: GateIoWebSocket,
    gateway: Arc<ClientGateway>,
    running: AtomicBool,
    started_at: RwLock<Option<DateTime<Utc>>>,
    status_task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build the connector and gateway on `channel` and register the
    /// coordinator's own handlers. Nothing connects until [`start`](Self::start).
    pub fn new(
        config: CoordinatorConfig,
        channel: EventChannel,
        transport: Arc<dyn UpstreamConnect>,
    ) -> Arc<Self> {
        let connector = GateIoWebSocket::spawn(config.upstream.clone(), channel.clone(), transport);
        let gateway = ClientGateway::new(config.gateway.clone(), channel.clone());

        let coordinator = Arc::new(Self {
            config,
            channel,
            connector,
            gateway,
            running: AtomicBool::new(false),
            started_at: RwLock::new(None),
            status_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&coordinator);
        coordinator.channel.subscribe(Topic::StatusRequest, move |event| {
            if let (Some(coordinator), Event::StatusRequest { client_id }) = (weak.upgrade(), event)
            {
                coordinator.channel.publish(Event::StatusReply {
                    client_id: *client_id,
                    status: coordinator.status(),
                });
            }
            Ok(())
        });
        coordinator.channel.subscribe_many(&LIFECYCLE_TOPICS, |event| {
            log_lifecycle(event);
            Ok(())
        });

        coordinator
    }

    /// Connect upstream and start the status loop. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("[Coordinator] Already running");
            return;
        }

        let now = Utc::now();
        *self.started_at.write() = Some(now);
        info!("[Coordinator] Starting dtrader-crypto");

        self.connector.connect();

        let task = tokio::spawn(status_loop(Arc::downgrade(self), self.config.status_interval));
        *self.status_task.lock() = Some(task);
        info!("[Coordinator] Status task started");

        self.channel.publish(Event::SystemStarted {
            timestamp: now.timestamp_millis(),
        });
    }

    /// Stop the status loop, disconnect upstream, and close every client.
    /// No-op when not running.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            debug!("[Coordinator] Not running");
            return;
        }
        info!("[Coordinator] Stopping");

        let task = self.status_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }

        self.connector.disconnect().await;
        self.gateway.close();
        self.channel.settled().await;

        info!(
            "[Coordinator] Stopped after {}s uptime",
            self.uptime().num_seconds()
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Current system snapshot
    pub fn status(&self) -> SystemStatus {
        SystemStatus::snapshot(
            self.is_running(),
            self.connector.last_pong(),
            self.connector.connection_status(),
            self.gateway.client_count(),
        )
    }

    /// Time since the last start, zero if never started
    pub fn uptime(&self) -> TimeDelta {
        self.started_at
            .read()
            .map(|started| Utc::now() - started)
            .unwrap_or_else(TimeDelta::zero)
    }

    pub fn connector(&self) -> &GateIoWebSocket {
        &self.connector
    }

    pub fn gateway(&self) -> &Arc<ClientGateway> {
        &self.gateway
    }

    pub fn channel(&self) -> &EventChannel {
        &self.channel
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("running", &self.is_running())
            .field("upstream", &self.connector.connection_state())
            .field("gateway", &self.gateway)
            .finish()
    }
}

/// Publish `system_status` once per `every`, checked on a 1 s tick
async fn status_loop(coordinator: Weak<Coordinator>, every: Duration) {
    let mut ticker = interval(STATUS_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_published = Instant::now();

    loop {
        ticker.tick().await;
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };

        if last_published.elapsed() >= every {
            last_published = Instant::now();
            coordinator
                .channel
                .publish(Event::SystemStatus(coordinator.status()));
        }
    }
}

fn log_lifecycle(event: &Event) {
    match event {
        Event::UpstreamConnected(info) => info!(
            "[Coordinator] Gate.io connected to {} after {} attempts",
            info.endpoint, info.reconnect_attempts
        ),
        Event::UpstreamDisconnected(info) => info!(
            "[Coordinator] Gate.io disconnected ({} {})",
            info.code, info.reason
        ),
        Event::UpstreamError(failure) => warn!(
            "[Coordinator] Gate.io error ({:?}): {}",
            failure.context, failure.error
        ),
        Event::ReconnectExhausted(info) => error!(
            "[Coordinator] Gate.io reconnect gave up after {} attempts",
            info.attempts
        ),
        Event::PingSent(ping) => debug!("[Coordinator] Ping sent at {}", ping.timestamp),
        Event::PongReceived(pong) => debug!(
            "[Coordinator] Pong received at {} (server time {:?})",
            pong.timestamp, pong.server_time
        ),
        Event::ClientConnected(count) => {
            info!("[Coordinator] Client connected, {} total", count.clients_count)
        }
        Event::ClientDisconnected(count) => {
            info!("[Coordinator] Client disconnected, {} total", count.clients_count)
        }
        Event::ClientCommand(command) => debug!(
            "[Coordinator] Unhandled {} command from {}",
            command.message_type, command.client_id
        ),
        Event::SystemStarted { timestamp } => {
            info!("[Coordinator] System started at {}", timestamp)
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtrader_core::{ConnectionState, Envelope};
    use dtrader_gateio::testing::{ChannelTransport, ConnectRequest};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;
    use url::Url;

    use crate::gateway::ChannelSocket;

    fn coordinator(
        status_interval: Duration,
    ) -> (Arc<Coordinator>, mpsc::UnboundedReceiver<ConnectRequest>) {
        let (transport, requests) = ChannelTransport::new();
        let config = CoordinatorConfig {
            upstream: GateIoWebSocketConfig {
                urls: vec![Url::parse("ws://upstream.test/v4/").unwrap()],
                ..Default::default()
            },
            status_interval,
            ..Default::default()
        };
        let coordinator = Coordinator::new(config, EventChannel::new(), Arc::new(transport));
        (coordinator, requests)
    }

    fn record(channel: &EventChannel, topic: Topic) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.subscribe(topic, move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        });
        rx
    }

    #[tokio::test]
    async fn test_status_before_any_connection() {
        let (coordinator, _requests) = coordinator(STATUS_INTERVAL);
        let status = coordinator.status();
        assert!(!status.gate_io_connected);
        assert_eq!(status.last_pong, 0);
        assert_eq!(status.clients_connected, 0);
        assert_eq!(coordinator.uptime(), TimeDelta::zero());
    }

    #[tokio::test]
    async fn test_heartbeat_events_are_logged() {
        let (coordinator, _requests) = coordinator(STATUS_INTERVAL);
        // Gateway relay plus the coordinator's log handler
        for topic in [Topic::PingSent, Topic::PongReceived] {
            assert!(LIFECYCLE_TOPICS.contains(&topic));
            assert_eq!(coordinator.channel().subscriber_count(topic), 2);
        }
    }

    #[tokio::test]
    async fn test_get_status_round_trip() {
        let (coordinator, _requests) = coordinator(STATUS_INTERVAL);
        let (socket, mut peer) = ChannelSocket::pair(16);
        let gateway = Arc::clone(coordinator.gateway());
        tokio::spawn(async move { gateway.handle_connection(socket).await });

        let welcome = peer.rx.recv().await;
        assert!(matches!(welcome, Some(Message::Text(_))));

        peer.tx
            .send(Message::Text(r#"{"type":"get_status","data":{}}"#.to_string().into()))
            .await
            .unwrap();

        let reply = loop {
            match timeout(Duration::from_secs(5), peer.rx.recv()).await.unwrap() {
                Some(Message::Text(text)) => {
                    let envelope: Envelope = serde_json::from_str(text.as_str()).unwrap();
                    if envelope.message_type == "system_status" {
                        break envelope;
                    }
                }
                other => panic!("unexpected frame {:?}", other),
            }
        };
        assert_eq!(reply.data["gateIOConnected"], false);
        assert_eq!(reply.data["lastPong"], 0);
        assert_eq!(reply.data["clientsConnected"], 1);
        assert_eq!(reply.data["status"], "disconnected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (coordinator, mut requests) = coordinator(STATUS_INTERVAL);
        let mut started = record(coordinator.channel(), Topic::SystemStarted);

        coordinator.start();
        coordinator.start();
        assert!(coordinator.is_running());

        let _request = requests.recv().await.unwrap();
        assert!(timeout(Duration::from_secs(1), requests.recv()).await.is_err());

        coordinator.channel().settled().await;
        assert!(matches!(started.try_recv(), Ok(Event::SystemStarted { .. })));
        assert!(started.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_published_on_interval() {
        let (coordinator, mut requests) = coordinator(Duration::from_secs(10));
        let mut statuses = record(coordinator.channel(), Topic::SystemStatus);
        coordinator.start();
        let _remote = requests.recv().await.unwrap().accept();

        let begin = Instant::now();
        let first = timeout(Duration::from_secs(60), statuses.recv()).await.unwrap();
        assert!(matches!(first, Some(Event::SystemStatus(_))));
        assert!(begin.elapsed() >= Duration::from_secs(10));
        assert!(begin.elapsed() <= Duration::from_secs(11));

        let second = timeout(Duration::from_secs(60), statuses.recv()).await.unwrap();
        match second {
            Some(Event::SystemStatus(status)) => assert!(status.gate_io_connected),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(begin.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_disconnects_and_closes_clients() {
        let (coordinator, mut requests) = coordinator(STATUS_INTERVAL);
        coordinator.start();
        let _remote = requests.recv().await.unwrap().accept();

        let (socket, mut peer) = ChannelSocket::pair(16);
        let gateway = Arc::clone(coordinator.gateway());
        let client = tokio::spawn(async move { gateway.handle_connection(socket).await });
        assert!(peer.rx.recv().await.is_some());

        coordinator.stop().await;
        assert!(!coordinator.is_running());
        assert_eq!(
            coordinator.connector().connection_state(),
            ConnectionState::Closed
        );
        assert!(!coordinator.gateway().is_accepting());

        let mut saw_shutdown = false;
        while let Some(message) = peer.rx.recv().await {
            if let Message::Text(text) = message {
                let envelope: Envelope = serde_json::from_str(text.as_str()).unwrap();
                saw_shutdown |= envelope.message_type == "server_shutdown";
            }
        }
        assert!(saw_shutdown);
        client.await.unwrap();

        // No reconnect after stop, and stopping again is harmless
        assert!(timeout(Duration::from_secs(120), requests.recv()).await.is_err());
        coordinator.stop().await;
    }
}
