//! End-to-end tests: a worker `ConnectionManager` and an orchestrator
//! `ComputeManager` talking through one broker.


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::compute::{self, ConnectionManager};
use crate::dispatcher::{DispatcherConfig, MessageCreator};
use crate::envelope::{Message, Serializer};
use crate::messaging::MessageHandler;
use crate::orchestrator::{self, ComputeManager, InMemoryNodeManager, NodeManagerConfig};
use crate::protocol::MessageCreatorFactory;
use crate::protocol::messages::{ExecutionUpdate, NodeInfo, NodeType};
use crate::transport::TransportFactory;
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::error::ProtocolError;
use crate::watcher::{Event, EventStore, MemoryEventStore, Operation};

pub(crate) const NODE: &str = "node-1";

#[derive(Default)]
pub(crate) struct Inbox {
    received: Mutex<Vec<Message>>,
}

#[async_trait]
impl MessageHandler for Inbox {
    async fn handle_message(&self, message: Message) -> Result<(), ProtocolError> {
        self.received.lock().push(message);
        Ok(())
    }
}

impl Inbox {
    pub(crate) fn seqs(&self) -> Vec<u64> {
        self.received.lock().iter().map(Message::seq_num).collect()
    }

    pub(crate) fn execution_ids(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter_map(|m| m.get_payload::<ExecutionUpdate>())
            .map(|u| u.execution_id.clone())
            .collect()
    }
}

fn execution_update(event: &Event) -> Result<Option<Message>, ProtocolError> {
    Ok(Some(Message::new(ExecutionUpdate {
        execution_id: event.object["id"].as_str().unwrap_or_default().to_string(),
        job_id: "job".into(),
        state: "Running".into(),
        message: None,
    })))
}

struct EveryEvent;

impl MessageCreatorFactory for EveryEvent {
    fn create_message_creator(
        &self,
        _node_id: &str,
    ) -> Result<Arc<dyn MessageCreator>, ProtocolError> {
        Ok(Arc::new(execution_update))
    }
}

fn fast_dispatcher() -> DispatcherConfig {
    DispatcherConfig {
        checkpoint_interval: Some(Duration::from_millis(50)),
        process_interval: Duration::from_millis(10),
        base_retry_interval: Duration::from_millis(50),
        max_retry_interval: Duration::from_millis(100),
        ..DispatcherConfig::default()
    }
}

fn store_executions(store: &MemoryEventStore, ids: &[&str]) {
    for id in ids {
        store
            .store_event(Operation::Create, "execution", json!({ "id": id }))
            .unwrap();
    }
}

pub(crate) struct OrchestratorNode {
    pub store: Arc<MemoryEventStore>,
    pub nodes: Arc<InMemoryNodeManager>,
    pub inbox: Arc<Inbox>,
    pub manager: ComputeManager,
}

impl OrchestratorNode {
    pub(crate) async fn start(transport_factory: Arc<dyn TransportFactory>) -> Self {
        let store = Arc::new(MemoryEventStore::new());
        let nodes = Arc::new(InMemoryNodeManager::new(
            NodeManagerConfig::default(),
            store.clone(),
        ));
        let inbox = Arc::new(Inbox::default());
        let config = orchestrator::Config {
            publisher_ack_wait: Duration::from_millis(500),
            dispatcher: fast_dispatcher(),
            stop_timeout: Duration::from_secs(1),
            ..orchestrator::Config::default()
        };
        let manager = ComputeManager::new(
            config,
            orchestrator::Collaborators {
                transport_factory,
                serializer: Serializer::default(),
                node_manager: nodes.clone(),
                message_handler: inbox.clone(),
                message_creator_factory: Arc::new(EveryEvent),
                event_store: store.clone(),
            },
        )
        .unwrap();
        manager.start().await.unwrap();
        Self {
            store,
            nodes,
            inbox,
            manager,
        }
    }

    pub(crate) fn store_executions(&self, ids: &[&str]) {
        store_executions(&self.store, ids);
    }
}

pub(crate) struct WorkerNode {
    pub store: Arc<MemoryEventStore>,
    pub inbox: Arc<Inbox>,
    pub manager: ConnectionManager,
}

impl WorkerNode {
    pub(crate) fn new(
        transport_factory: Arc<dyn TransportFactory>,
        store: Arc<MemoryEventStore>,
        heartbeat_interval: Duration,
    ) -> Self {
        let inbox = Arc::new(Inbox::default());
        let config = compute::Config {
            heartbeat_interval,
            node_info_update_interval: Duration::from_millis(100),
            checkpoint_interval: Duration::from_millis(50),
            request_timeout: Duration::from_millis(500),
            reconnect_interval: Duration::from_millis(50),
            reconnect_backoff: ExponentialBackoff::new(
                Duration::from_millis(10),
                Duration::from_millis(50),
            ),
            publisher_ack_wait: Duration::from_millis(500),
            dispatcher: fast_dispatcher(),
            ..compute::Config::new(NODE)
        };
        let manager = ConnectionManager::new(
            config,
            compute::Collaborators {
                transport_factory,
                serializer: Serializer::default(),
                node_info_provider: Arc::new(|| NodeInfo::new(NODE, NodeType::Compute)),
                message_handler: inbox.clone(),
                message_creator: Arc::new(execution_update),
                event_store: store.clone(),
            },
        )
        .unwrap();
        Self {
            store,
            inbox,
            manager,
        }
    }

    pub(crate) fn store_executions(&self, ids: &[&str]) {
        store_executions(&self.store, ids);
    }
}

pub(crate) async fn eventually(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
