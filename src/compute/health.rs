use chrono::Utc;
use parking_lot::RwLock;

use crate::protocol::{ConnectionHealth, ConnectionState};

/// Owner of a worker's `ConnectionHealth`.
#[derive(Debug)]
pub struct HealthTracker {
    health: RwLock<ConnectionHealth>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            health: RwLock::new(ConnectionHealth::new(Utc::now())),
        }
    }

    pub fn mark_connecting(&self) {
        self.health.write().current_state = ConnectionState::Connecting;
    }

    pub fn mark_connected(&self) {
        let now = Utc::now();
        let mut h = self.health.write();
        h.current_state = ConnectionState::Connected;
        h.connected_since = Some(now);
        h.last_successful_heartbeat = Some(now);
        h.consecutive_failures = 0;
        h.last_error = None;
        h.handshake_required = false;
    }

    /// A transition caused by an error counts as a failure.
    pub fn mark_disconnected(&self, err: Option<String>) {
        let mut h = self.health.write();
        h.current_state = ConnectionState::Disconnected;
        h.connected_since = None;
        if let Some(err) = err {
            h.consecutive_failures += 1;
            h.last_error = Some(err);
        }
    }

    pub fn heartbeat_success(&self) {
        self.health.write().last_successful_heartbeat = Some(Utc::now());
    }

    pub fn update_success(&self) {
        self.health.write().last_successful_update = Some(Utc::now());
    }

    pub fn mark_handshake_required(&self) {
        self.health.write().handshake_required = true;
    }

    pub fn is_handshake_required(&self) -> bool {
        self.health.read().handshake_required
    }

    pub fn state(&self) -> ConnectionState {
        self.health.read().current_state
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health.read().clone()
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
