use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Called, in order, for every connection state transition.
pub type ConnectionStateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Snapshot of a worker's connection to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionHealth {
    pub start_time: DateTime<Utc>,
    pub last_successful_heartbeat: Option<DateTime<Utc>>,
    pub last_successful_update: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub current_state: ConnectionState,
    pub handshake_required: bool,
}

impl ConnectionHealth {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            last_successful_heartbeat: None,
            last_successful_update: None,
            connected_since: None,
            consecutive_failures: 0,
            last_error: None,
            current_state: ConnectionState::Disconnected,
            handshake_required: false,
        }
    }
}
