//! Upstream connection state, reconnect policy and desired subscriptions

use std::time::Duration;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Growth factor between consecutive reconnect delays
pub const BACKOFF_FACTOR: u32 = 2;

/// Default number of reconnect attempts before giving up
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Default delay before the first reconnect attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Lifecycle state of the upstream connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected
    #[default]
    Idle,
    /// Connect attempt in flight
    Connecting,
    /// Socket open, heartbeat running
    Open,
    /// Operator-driven close in progress
    Closing,
    /// Socket gone, no timer pending
    Closed,
    /// Reconnect timer pending
    ReconnectWaiting,
}

impl ConnectionState {
    /// Whether a connect attempt is in flight or a socket is already open
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::ReconnectWaiting => "reconnect_waiting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff bookkeeping for upstream reconnects
///
/// The delay before reconnect attempt `n` is `base_delay * 2^n`. The attempt
/// counter resets on every successful open; once it reaches `max_attempts`
/// the policy is exhausted and no further delay is handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempt_count: u32,
    max_attempts: u32,
    base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Delay used before reconnect attempt number `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(BACKOFF_FACTOR.saturating_pow(attempt))
    }

    /// Delay for the next reconnect, or `None` once exhausted
    pub fn next_delay(&self) -> Option<Duration> {
        if self.is_exhausted() {
            None
        } else {
            Some(self.delay_for(self.attempt_count))
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Count a reconnect attempt (called when the reconnect timer fires)
    pub fn record_attempt(&mut self) {
        self.attempt_count = self.attempt_count.saturating_add(1);
    }

    /// Reset after a successful open
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY)
    }
}

/// Ordered set of upstream channels that should be active
///
/// The upstream carries no subscription state across a disconnect, so the
/// whole set is replayed after every open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredSubscriptions {
    channels: IndexSet<String>,
}

impl DesiredSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge channels in, returning the ones that were not present yet
    pub fn insert_all<I>(&mut self, channels: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        channels
            .into_iter()
            .filter_map(|channel| {
                if self.channels.insert(channel.clone()) {
                    Some(channel)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Remove channels, returning the ones that were present
    pub fn remove_all<'a, I>(&mut self, channels: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        channels
            .into_iter()
            .filter(|channel| self.channels.shift_remove(channel.as_str()))
            .cloned()
            .collect()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.channels.iter().cloned().collect()
    }
}
