//! Connection lifecycle state and status snapshots

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Lifecycle state of one server connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Created, not yet told to connect
    #[default]
    Idle,
    /// An attempt is outstanding or a retry is scheduled
    Connecting,
    /// A live reference is held
    Connected,
    /// Attempts halted until the next start request
    Stopped,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if the reconnect loop is armed
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Immutable snapshot of one server connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    /// Human-readable one-line description
    pub summary: String,
    /// Whether the reconnect loop will keep trying
    pub should_retry: bool,
    /// When the current (or most recent) connection was established
    pub last_connection_time: Option<SystemTime>,
    /// When data was last received over the connection
    pub last_received_time: Option<SystemTime>,
    /// Description of the transport handler, once connected
    pub handler: Option<String>,
}

impl ConnectionStatus {
    /// Status of a server that was never started
    pub fn unstarted() -> Self {
        Self {
            connected: false,
            summary: "unstarted".to_string(),
            should_retry: false,
            last_connection_time: None,
            last_received_time: None,
            handler: None,
        }
    }

    /// Status after an explicit stop
    pub fn stopped(last_connection_time: Option<SystemTime>) -> Self {
        Self {
            summary: "stopped".to_string(),
            last_connection_time,
            ..Self::unstarted()
        }
    }

    /// Started, but the announcement offers nothing to connect to
    pub fn no_usable_protocol() -> Self {
        Self {
            summary: "No usable storage protocol".to_string(),
            ..Self::unstarted()
        }
    }

    /// First attempt in flight
    pub fn trying(last_connection_time: Option<SystemTime>) -> Self {
        Self {
            summary: "Trying to connect".to_string(),
            should_retry: true,
            last_connection_time,
            ..Self::unstarted()
        }
    }

    /// Waiting for the next scheduled attempt
    pub fn reconnecting(
        next_attempt_in: Duration,
        last_attempt_ago: Duration,
        last_connection_time: Option<SystemTime>,
    ) -> Self {
        Self {
            summary: format!(
                "Reconnecting in {} seconds (last attempt {}s ago)",
                next_attempt_in.as_secs(),
                last_attempt_ago.as_secs()
            ),
            should_retry: true,
            last_connection_time,
            ..Self::unstarted()
        }
    }

    pub fn connected(
        hint: &str,
        handler: &str,
        last_connection_time: SystemTime,
        last_received_time: Option<SystemTime>,
    ) -> Self {
        Self {
            connected: true,
            summary: format!("Connected to {hint} via {handler}"),
            should_retry: true,
            last_connection_time: Some(last_connection_time),
            last_received_time,
            handler: Some(handler.to_string()),
        }
    }
}
