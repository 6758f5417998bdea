//! WebSocket route handler
//!
//! Upgrades `/ws` and `/` and hands the socket to the client gateway.

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use dtrader_services::ChannelSocket;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, protocol::frame::coding::CloseCode};
use tracing::{debug, info};

use crate::AppState;

/// Frames buffered in each direction of the bridge
const BRIDGE_BUFFER: usize = 100;

/// Create WebSocket routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/", get(ws_handler))
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    debug!("WebSocket upgrade request received");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridge an established axum socket onto the gateway
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (bridge, peer) = ChannelSocket::pair(BRIDGE_BUFFER);
    let (tx, mut response_rx) = (peer.tx, peer.rx);

    // Task: Forward frames from the client to the gateway
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let closing = matches!(msg, Message::Close(_));
            if tx.send(to_tungstenite(msg)).await.is_err() || closing {
                break;
            }
        }
    });

    // Task: Forward frames from the gateway to the client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = response_rx.recv().await {
            let Some(axum_msg) = to_axum(msg) else {
                continue;
            };
            let closing = matches!(axum_msg, Message::Close(_));
            if sender.send(axum_msg).await.is_err() {
                break;
            }
            if closing {
                let _ = sender.close().await;
                break;
            }
        }
    });

    state.coordinator.gateway().handle_connection(bridge).await;

    // The bridge is dropped, so the send task drains what the gateway queued
    if let Err(e) = send_task.await {
        debug!("WebSocket send task ended abnormally: {}", e);
    }
    recv_task.abort();
    info!("WebSocket bridge closed");
}

fn to_tungstenite(msg: Message) -> tungstenite::Message {
    match msg {
        Message::Text(text) => tungstenite::Message::Text(text.as_str().to_string().into()),
        Message::Binary(data) => tungstenite::Message::Binary(data.to_vec().into()),
        Message::Ping(data) => tungstenite::Message::Ping(data.to_vec().into()),
        Message::Pong(data) => tungstenite::Message::Pong(data.to_vec().into()),
        Message::Close(frame) => {
            tungstenite::Message::Close(frame.map(|frame| tungstenite::protocol::CloseFrame {
                code: CloseCode::from(frame.code),
                reason: frame.reason.as_str().to_string().into(),
            }))
        }
    }
}

fn to_axum(msg: tungstenite::Message) -> Option<Message> {
    let msg = match msg {
        tungstenite::Message::Text(text) => Message::Text(text.as_str().to_string().into()),
        tungstenite::Message::Binary(data) => Message::Binary(Bytes::from(data.to_vec())),
        tungstenite::Message::Ping(data) => Message::Ping(Bytes::from(data.to_vec())),
        tungstenite::Message::Pong(data) => Message::Pong(Bytes::from(data.to_vec())),
        tungstenite::Message::Close(frame) => Message::Close(frame.map(|frame| CloseFrame {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_string().into(),
        })),
        tungstenite::Message::Frame(_) => return None,
    };
    Some(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_frame_keeps_code_and_reason() {
        let outbound = tungstenite::Message::Close(Some(tungstenite::protocol::CloseFrame {
            code: CloseCode::Away,
            reason: "server shutting down".to_string().into(),
        }));
        match to_axum(outbound) {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, 1001);
                assert_eq!(frame.reason.as_str(), "server shutting down");
            }
            other => panic!("unexpected frame {:?}", other),
        }

        let inbound = Message::Close(Some(CloseFrame {
            code: 1000,
            reason: "bye".to_string().into(),
        }));
        match to_tungstenite(inbound) {
            tungstenite::Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_text_passes_through() {
        let msg = to_tungstenite(Message::Text(r#"{"type":"ping"}"#.to_string().into()));
        assert_eq!(msg, tungstenite::Message::Text(r#"{"type":"ping"}"#.to_string().into()));
        assert!(to_axum(tungstenite::Message::Text("x".to_string().into())).is_some());
    }
}
