//! Per-client session state

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use dtrader_core::{ClientId, Envelope};

/// A connected local client.
///
/// Outbound frames go through a bounded queue drained by the connection's
/// write loop. Sends never wait: a full or closed queue drops the frame and
/// bumps the drop counter.
#[derive(Debug)]
pub struct ClientSession {
    pub id: ClientId,
    tx: mpsc::Sender<Message>,
    pub connected_at: DateTime<Utc>,
    open: AtomicBool,
    dropped_messages: AtomicU64,
}

impl ClientSession {
    pub fn new(id: ClientId, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            tx,
            connected_at: Utc::now(),
            open: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue a frame. Returns `false` if the session is closed or its queue is full.
    pub fn send(&self, message: Message) -> bool {
        if !self.is_open() {
            return false;
        }

        if self.tx.try_send(message).is_ok() {
            true
        } else {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and queue an envelope
    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match serde_json::to_string(envelope) {
            Ok(json) => self.send(Message::Text(json.into())),
            Err(e) => {
                warn!("Failed to serialize {} for {}: {}", envelope.message_type, self.id, e);
                false
            }
        }
    }

    /// Queue a close frame and stop accepting further sends
    pub fn close(&self, code: CloseCode, reason: &str) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        }));
        if self.tx.try_send(frame).is_err() {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Mark closed after the socket went away
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Total frames dropped for this session
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}
