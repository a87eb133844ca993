use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::dispatcher::DispatcherConfig;
use crate::envelope::Serializer;
use crate::messaging::MessageHandler;
use crate::protocol::MessageCreatorFactory;
use crate::transport::TransportFactory;
use crate::utils::error::ProtocolError;
use crate::watcher::EventStore;

use super::nodes::NodeManager;

/// Settings shared by every per-node data plane.
#[derive(Debug, Clone)]
pub struct Config {
    pub publisher_ack_wait: Duration,
    pub publisher_max_pending: usize,
    /// Event object types dispatched to workers. Empty means all.
    pub event_object_types: Vec<String>,
    /// Checkpointing is always disabled for per-node dispatchers; the node
    /// manager's sequence records take its place.
    pub dispatcher: DispatcherConfig,
    /// Upper bound for stopping one data plane.
    pub stop_timeout: Duration,
}

impl Config {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            publisher_ack_wait: Duration::from_millis(settings.publisher.ack_wait_ms),
            publisher_max_pending: settings.publisher.max_pending,
            dispatcher: DispatcherConfig::from(&settings.dispatcher),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.publisher_ack_wait.is_zero() {
            return Err(ProtocolError::InvalidConfig(
                "publisher ack wait must be positive".into(),
            ));
        }
        if self.publisher_max_pending == 0 {
            return Err(ProtocolError::InvalidConfig(
                "publisher max pending must be positive".into(),
            ));
        }
        self.dispatcher.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            publisher_ack_wait: Duration::from_secs(5),
            publisher_max_pending: 10_000,
            event_object_types: Vec::new(),
            dispatcher: DispatcherConfig::default(),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub transport_factory: Arc<dyn TransportFactory>,
    pub serializer: Serializer,
    pub node_manager: Arc<dyn NodeManager>,
    /// Receives every worker's data-plane messages.
    pub message_handler: Arc<dyn MessageHandler>,
    pub message_creator_factory: Arc<dyn MessageCreatorFactory>,
    /// The orchestrator's event log, dispatched to workers.
    pub event_store: Arc<dyn EventStore>,
}
