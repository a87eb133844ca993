use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::config::{Collaborators, Config};
use crate::dispatcher::{Dispatcher, DispatcherStats};
use crate::messaging::{OrderedPublisher, OrderedPublisherConfig};
use crate::protocol::subjects;
use crate::transport::Transport;
use crate::utils::error::ProtocolError;
use crate::watcher::{EventIterator, EventSource, RetryStrategy, Watcher, WatcherConfig};

/// Watcher id under which the worker's outbound progress is checkpointed.
pub const DISPATCHER_WATCHER_ID: &str = "compute-dispatcher";

/// Outbound half of a worker's data plane: local events flow through a
/// dispatcher and an ordered publisher to the orchestrator.
///
/// Inbound messages are handled by the connection's subscriber, which
/// lives alongside this.
pub struct DataPlane {
    node_id: String,
    publisher: Arc<OrderedPublisher>,
    dispatcher: Dispatcher,
}

impl DataPlane {
    /// Builds and starts the outbound pipeline. Without a stored checkpoint,
    /// dispatch resumes after `last_received_seq_num`, the last event the
    /// orchestrator reported receiving.
    pub async fn start(
        config: &Config,
        collaborators: &Collaborators,
        transport: Arc<dyn Transport>,
        last_received_seq_num: u64,
    ) -> Result<Self, ProtocolError> {
        let node_id = config.node_id.clone();
        let publisher = Arc::new(
            OrderedPublisher::new(
                transport,
                collaborators.serializer.clone(),
                OrderedPublisherConfig {
                    ack_wait: config.publisher_ack_wait,
                    max_pending: config.publisher_max_pending,
                    ..OrderedPublisherConfig::new(
                        node_id.clone(),
                        subjects::compute_out_msgs(&node_id),
                    )
                },
            )
            .await?,
        );

        let source: Arc<dyn EventSource> = Arc::new(Watcher::new(
            collaborators.event_store.clone(),
            WatcherConfig {
                object_types: config.event_object_types.clone(),
                initial_event_iterator: EventIterator::AfterSequence(last_received_seq_num),
                retry_strategy: RetryStrategy::Block,
                ..WatcherConfig::new(DISPATCHER_WATCHER_ID)
            },
        ));

        let dispatcher = Dispatcher::new(
            format!("compute-{node_id}"),
            publisher.clone(),
            source,
            collaborators.message_creator.clone(),
            config.dispatcher.clone(),
        )?;
        if let Err(e) = dispatcher.start().await {
            let _ = publisher.close(Duration::ZERO).await;
            return Err(e);
        }

        info!(node_id = %node_id, last_received_seq_num, "compute data plane started");
        Ok(Self {
            node_id,
            publisher,
            dispatcher,
        })
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running()
    }

    pub async fn stop(&self, timeout: Duration) {
        self.dispatcher.stop().await;
        if let Err(e) = self.publisher.close(timeout).await {
            warn!(node_id = %self.node_id, error = %e, "ordered publisher did not close cleanly");
        }
    }
}
