use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::dispatcher::{DispatcherConfig, MessageCreator};
use crate::envelope::Serializer;
use crate::messaging::MessageHandler;
use crate::protocol::NodeInfoProvider;
use crate::transport::TransportFactory;
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::error::ProtocolError;
use crate::watcher::EventStore;

/// Timing and sizing of a worker's connection.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: String,
    pub heartbeat_interval: Duration,
    /// Missed heartbeat intervals before the connection is considered dead.
    pub heartbeat_miss_factor: u32,
    pub node_info_update_interval: Duration,
    pub checkpoint_interval: Duration,
    pub request_timeout: Duration,
    pub reconnect_interval: Duration,
    pub reconnect_backoff: ExponentialBackoff,
    pub publisher_ack_wait: Duration,
    pub publisher_max_pending: usize,
    /// Event object types dispatched to the orchestrator. Empty means all.
    pub event_object_types: Vec<String>,
    pub dispatcher: DispatcherConfig,
}

impl Config {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn from_settings(node_id: impl Into<String>, settings: &Settings) -> Self {
        let c = &settings.connection;
        let ms = Duration::from_millis;
        Self {
            node_id: node_id.into(),
            heartbeat_interval: ms(c.heartbeat_interval_ms),
            heartbeat_miss_factor: c.heartbeat_miss_factor,
            node_info_update_interval: ms(c.node_info_update_interval_ms),
            checkpoint_interval: ms(c.checkpoint_interval_ms),
            request_timeout: ms(c.request_timeout_ms),
            reconnect_interval: ms(c.reconnect_interval_ms),
            reconnect_backoff: ExponentialBackoff::new(
                ms(c.reconnect_backoff_base_ms),
                ms(c.reconnect_backoff_max_ms),
            ),
            publisher_ack_wait: ms(settings.publisher.ack_wait_ms),
            publisher_max_pending: settings.publisher.max_pending,
            event_object_types: Vec::new(),
            dispatcher: DispatcherConfig::from(&settings.dispatcher),
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.node_id.is_empty() {
            return Err(ProtocolError::InvalidConfig("node id is required".into()));
        }
        let positive = [
            ("heartbeat interval", self.heartbeat_interval),
            ("node info update interval", self.node_info_update_interval),
            ("checkpoint interval", self.checkpoint_interval),
            ("request timeout", self.request_timeout),
            ("reconnect interval", self.reconnect_interval),
            ("publisher ack wait", self.publisher_ack_wait),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ProtocolError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.heartbeat_miss_factor == 0 {
            return Err(ProtocolError::InvalidConfig(
                "heartbeat miss factor must be positive".into(),
            ));
        }
        if self.publisher_max_pending == 0 {
            return Err(ProtocolError::InvalidConfig(
                "publisher max pending must be positive".into(),
            ));
        }
        self.dispatcher.validate()
    }

    /// How long without a successful heartbeat before reconnecting.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_miss_factor
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_miss_factor: 3,
            node_info_update_interval: Duration::from_secs(60),
            checkpoint_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(10),
            reconnect_backoff: ExponentialBackoff::new(
                Duration::from_secs(10),
                Duration::from_secs(120),
            ),
            publisher_ack_wait: Duration::from_secs(5),
            publisher_max_pending: 10_000,
            event_object_types: Vec::new(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

/// What a worker connection talks to besides the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    /// Opens a fresh transport for every connection attempt.
    pub transport_factory: Arc<dyn TransportFactory>,
    pub serializer: Serializer,
    pub node_info_provider: Arc<dyn NodeInfoProvider>,
    /// Receives the orchestrator's data-plane messages.
    pub message_handler: Arc<dyn MessageHandler>,
    /// Turns local events into messages for the orchestrator.
    pub message_creator: Arc<dyn MessageCreator>,
    /// Local event log. Also stores the incoming sequence checkpoint.
    pub event_store: Arc<dyn EventStore>,
}
