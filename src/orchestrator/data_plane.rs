use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::config::{Collaborators, Config};
use crate::dispatcher::{Dispatcher, DispatcherStats};
use crate::messaging::{OrderedPublisher, OrderedPublisherConfig, Subscriber};
use crate::protocol::{SequenceTracker, subjects};
use crate::transport::Transport;
use crate::utils::error::ProtocolError;
use crate::watcher::{EventIterator, EventSource, RetryStrategy, Watcher, WatcherConfig};

/// Data plane for one connected worker: a subscriber for the worker's
/// messages plus a dispatcher streaming orchestrator events to it.
///
/// Each worker gets its own publisher, so a failure on one worker's stream
/// never reorders or stalls another's.
pub struct DataPlane {
    node_id: String,
    incoming: Arc<SequenceTracker>,
    subscriber: Subscriber,
    publisher: Arc<OrderedPublisher>,
    dispatcher: Dispatcher,
}

impl DataPlane {
    /// Subscribes to the worker's stream and starts dispatching events
    /// after `start_seq_num`. Anything built before a failing step is torn
    /// down again.
    pub async fn start(
        node_id: &str,
        config: &Config,
        collaborators: &Collaborators,
        transport: Arc<dyn Transport>,
        start_seq_num: u64,
    ) -> Result<Self, ProtocolError> {
        let name = format!("orchestrator-{node_id}");
        let incoming = Arc::new(SequenceTracker::new());

        let subscriber = Subscriber::subscribe(
            transport.clone(),
            collaborators.serializer.clone(),
            &subjects::orchestrator_in_msgs(node_id),
            collaborators.message_handler.clone(),
            Some(incoming.clone()),
        )
        .await?;

        let publisher = match OrderedPublisher::new(
            transport,
            collaborators.serializer.clone(),
            OrderedPublisherConfig {
                ack_wait: config.publisher_ack_wait,
                max_pending: config.publisher_max_pending,
                ..OrderedPublisherConfig::new(name.clone(), subjects::orchestrator_out_msgs(node_id))
            },
        )
        .await
        {
            Ok(publisher) => Arc::new(publisher),
            Err(e) => {
                subscriber.close().await;
                return Err(e.into());
            }
        };

        let dispatcher = match Self::dispatcher(
            node_id,
            &name,
            config,
            collaborators,
            publisher.clone(),
            start_seq_num,
        )
        .await
        {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                subscriber.close().await;
                let _ = publisher.close(config.stop_timeout).await;
                return Err(e);
            }
        };

        info!(node_id, start_seq_num, "orchestrator data plane started");
        Ok(Self {
            node_id: node_id.to_string(),
            incoming,
            subscriber,
            publisher,
            dispatcher,
        })
    }

    async fn dispatcher(
        node_id: &str,
        name: &str,
        config: &Config,
        collaborators: &Collaborators,
        publisher: Arc<OrderedPublisher>,
        start_seq_num: u64,
    ) -> Result<Dispatcher, ProtocolError> {
        let source: Arc<dyn EventSource> = Arc::new(Watcher::new(
            collaborators.event_store.clone(),
            WatcherConfig {
                object_types: config.event_object_types.clone(),
                initial_event_iterator: EventIterator::AfterSequence(start_seq_num),
                retry_strategy: RetryStrategy::Block,
                ..WatcherConfig::new(format!("orchestrator-dispatcher-{node_id}"))
            },
        ));
        let creator = collaborators
            .message_creator_factory
            .create_message_creator(node_id)?;
        let dispatcher = Dispatcher::new(
            name,
            publisher,
            source,
            creator,
            config.dispatcher.clone().without_checkpointing(),
        )?;
        dispatcher.start().await?;
        Ok(dispatcher)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Highest sequence number processed from the worker.
    pub fn last_processed_seq_num(&self) -> u64 {
        self.incoming.last_seq_num()
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running()
    }

    /// Idempotent.
    pub async fn stop(&self, timeout: Duration) {
        self.dispatcher.stop().await;
        self.subscriber.close().await;
        if let Err(e) = self.publisher.close(timeout).await {
            warn!(node_id = %self.node_id, error = %e, "ordered publisher did not close cleanly");
        }
    }
}
