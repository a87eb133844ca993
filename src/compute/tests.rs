use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::{Collaborators, Config, ConnectionManager};
use crate::broker::{Broker, SharedBroker};
use crate::dispatcher::DispatcherConfig;
use crate::envelope::{KEY_SEQ_NUM, Message, PayloadType, Serializer};
use crate::messaging::{MessageHandler, PublishRequest, Publisher, Responder, Subscriber};
use crate::protocol::messages::{
    ExecutionUpdate, HandshakeRequest, HandshakeResponse, HeartbeatRequest, HeartbeatResponse,
    NodeInfo, NodeType, ShutdownNoticeRequest, ShutdownNoticeResponse, UpdateNodeInfoRequest,
    UpdateNodeInfoResponse,
};
use crate::protocol::{ConnectionState, subjects};
use crate::transport::{MemoryTransport, MemoryTransportFactory, Transport};
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::error::ProtocolError;
use crate::watcher::{Checkpointer, Event, EventStore, MemoryEventStore, Operation};

const NODE: &str = "test-node";

/// Stand-in for the orchestrator's control plane.
#[derive(Default)]
struct FakeOrchestrator {
    handshakes: Mutex<Vec<HandshakeRequest>>,
    heartbeats: AtomicUsize,
    updates: Mutex<Vec<NodeInfo>>,
    notices: Mutex<Vec<ShutdownNoticeRequest>>,
    reject: AtomicBool,
    handshake_required: AtomicUsize,
    last_compute_seq_num: AtomicU64,
}

fn payload<T: PayloadType + Clone>(request: &Message) -> Result<T, ProtocolError> {
    request
        .get_payload::<T>()
        .cloned()
        .ok_or_else(|| ProtocolError::Remote(format!("expected {}", T::TYPE)))
}

impl FakeOrchestrator {
    fn handshake(&self, request: Message) -> Result<Message, ProtocolError> {
        let request: HandshakeRequest = payload(&request)?;
        self.handshakes.lock().push(request.clone());
        if self.reject.load(Ordering::SeqCst) {
            return Ok(Message::new(HandshakeResponse {
                accepted: false,
                reason: "node has been rejected".into(),
                ..Default::default()
            }));
        }
        Ok(Message::new(HandshakeResponse {
            accepted: true,
            reason: String::new(),
            last_compute_seq_num: self.last_compute_seq_num.load(Ordering::SeqCst),
            starting_orchestrator_seq_num: request.last_orchestrator_seq_num,
        }))
    }

    fn heartbeat(&self, request: Message) -> Result<Message, ProtocolError> {
        let request: HeartbeatRequest = payload(&request)?;
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if self
            .handshake_required
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProtocolError::HandshakeRequired(request.node_id));
        }
        Ok(Message::new(HeartbeatResponse {
            last_compute_seq_num: self.last_compute_seq_num.load(Ordering::SeqCst),
        }))
    }

    fn update(&self, request: Message) -> Result<Message, ProtocolError> {
        let request: UpdateNodeInfoRequest = payload(&request)?;
        self.updates.lock().push(request.node_info);
        Ok(Message::new(UpdateNodeInfoResponse {
            accepted: true,
            reason: String::new(),
        }))
    }

    fn shutdown(&self, request: Message) -> Result<Message, ProtocolError> {
        let request: ShutdownNoticeRequest = payload(&request)?;
        self.notices.lock().push(request);
        Ok(Message::new(ShutdownNoticeResponse::default()))
    }

    async fn serve(self: &Arc<Self>, broker: &SharedBroker) -> Responder {
        let responder = Responder::new(
            "fake-orchestrator",
            connect(broker),
            Serializer::default(),
            &subjects::orchestrator_in_ctrl(),
        )
        .await
        .unwrap();

        let me = self.clone();
        responder
            .listen(
                HandshakeRequest::TYPE,
                Arc::new(move |request: Message| {
                    let me = me.clone();
                    async move { me.handshake(request) }
                }),
            )
            .unwrap();
        let me = self.clone();
        responder
            .listen(
                HeartbeatRequest::TYPE,
                Arc::new(move |request: Message| {
                    let me = me.clone();
                    async move { me.heartbeat(request) }
                }),
            )
            .unwrap();
        let me = self.clone();
        responder
            .listen(
                UpdateNodeInfoRequest::TYPE,
                Arc::new(move |request: Message| {
                    let me = me.clone();
                    async move { me.update(request) }
                }),
            )
            .unwrap();
        let me = self.clone();
        responder
            .listen(
                ShutdownNoticeRequest::TYPE,
                Arc::new(move |request: Message| {
                    let me = me.clone();
                    async move { me.shutdown(request) }
                }),
            )
            .unwrap();
        responder
    }
}

#[derive(Default)]
struct Inbox {
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
    fn seqs(&self) -> Vec<u64> {
        self.received.lock().iter().map(Message::seq_num).collect()
    }
}

fn connect(broker: &SharedBroker) -> Arc<dyn Transport> {
    Arc::new(MemoryTransport::connect(broker.clone()))
}

fn every_event(event: &Event) -> Result<Option<Message>, ProtocolError> {
    Ok(Some(Message::new(ExecutionUpdate {
        execution_id: event.object["id"].as_str().unwrap_or_default().to_string(),
        job_id: "job".into(),
        state: "Completed".into(),
        message: None,
    })))
}

fn fast_config() -> Config {
    Config {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_miss_factor: 3,
        node_info_update_interval: Duration::from_millis(50),
        checkpoint_interval: Duration::from_millis(50),
        request_timeout: Duration::from_millis(500),
        reconnect_interval: Duration::from_millis(50),
        reconnect_backoff: ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
        ),
        publisher_ack_wait: Duration::from_millis(500),
        dispatcher: DispatcherConfig {
            checkpoint_interval: Some(Duration::from_millis(50)),
            process_interval: Duration::from_millis(10),
            base_retry_interval: Duration::from_millis(50),
            max_retry_interval: Duration::from_millis(100),
            ..DispatcherConfig::default()
        },
        ..Config::new(NODE)
    }
}

struct Worker {
    store: Arc<MemoryEventStore>,
    inbox: Arc<Inbox>,
    node_info: Arc<Mutex<NodeInfo>>,
    manager: ConnectionManager,
}

impl Worker {
    fn new(broker: &SharedBroker) -> Self {
        Self::with_store(broker, Arc::new(MemoryEventStore::new()))
    }

    fn with_store(broker: &SharedBroker, store: Arc<MemoryEventStore>) -> Self {
        let inbox = Arc::new(Inbox::default());
        let node_info = Arc::new(Mutex::new(NodeInfo::new(NODE, NodeType::Compute)));
        let provided = node_info.clone();
        let collaborators = Collaborators {
            transport_factory: Arc::new(MemoryTransportFactory::new(broker.clone())),
            serializer: Serializer::default(),
            node_info_provider: Arc::new(move || provided.lock().clone()),
            message_handler: inbox.clone(),
            message_creator: Arc::new(every_event),
            event_store: store.clone(),
        };
        let manager = ConnectionManager::new(fast_config(), collaborators).unwrap();
        Self {
            store,
            inbox,
            node_info,
            manager,
        }
    }

    fn store_events(&self, n: usize) {
        for i in 0..n {
            self.store
                .store_event(Operation::Create, "execution", json!({ "id": format!("e{i}") }))
                .unwrap();
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn test_config_validation() {
    assert!(fast_config().validate().is_ok());
    assert!(matches!(
        Config::new("").validate(),
        Err(ProtocolError::InvalidConfig(_))
    ));
    let no_misses = Config {
        heartbeat_miss_factor: 0,
        ..Config::new(NODE)
    };
    assert!(no_misses.validate().is_err());
    assert_eq!(
        Config::new(NODE).heartbeat_deadline(),
        Duration::from_secs(45)
    );
}

#[test]
fn test_config_from_settings() {
    let mut settings = crate::config::Settings::default();
    settings.connection.heartbeat_interval_ms = 1_000;
    settings.publisher.max_pending = 7;
    let config = Config::from_settings(NODE, &settings);
    assert_eq!(config.node_id, NODE);
    assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
    assert_eq!(config.publisher_max_pending, 7);
}

#[tokio::test]
async fn test_connects_with_handshake_and_heartbeats() {
    let broker = Broker::shared();
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let _responder = orchestrator.serve(&broker).await;
    let worker = Worker::new(&broker);

    worker.manager.start().await.unwrap();
    assert!(matches!(
        worker.manager.start().await,
        Err(ProtocolError::AlreadyRunning(_))
    ));
    eventually(
        || worker.manager.state() == ConnectionState::Connected,
        "connected",
    )
    .await;
    eventually(
        || orchestrator.heartbeats.load(Ordering::SeqCst) >= 2,
        "heartbeats",
    )
    .await;

    {
        let handshakes = orchestrator.handshakes.lock();
        assert_eq!(handshakes.len(), 1);
        assert_eq!(handshakes[0].node_info.node_id, NODE);
        assert_eq!(handshakes[0].last_orchestrator_seq_num, 0);
    }
    let health = worker.manager.health();
    assert_eq!(health.consecutive_failures, 0);
    assert!(health.connected_since.is_some());
    assert!(health.last_successful_heartbeat.is_some());

    worker.manager.close(Duration::from_secs(2)).await.unwrap();
    assert_eq!(worker.manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_rejected_handshake_counts_failures() {
    let broker = Broker::shared();
    let orchestrator = Arc::new(FakeOrchestrator::default());
    orchestrator.reject.store(true, Ordering::SeqCst);
    let _responder = orchestrator.serve(&broker).await;
    let worker = Worker::new(&broker);

    worker.manager.start().await.unwrap();
    eventually(
        || worker.manager.health().consecutive_failures >= 2,
        "repeated connection failures",
    )
    .await;
    let health = worker.manager.health();
    assert_ne!(health.current_state, ConnectionState::Connected);
    assert!(
        health
            .last_error
            .unwrap_or_default()
            .contains("node has been rejected")
    );
    worker.manager.close(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_no_orchestrator_stays_disconnected() {
    let broker = Broker::shared();
    let worker = Worker::new(&broker);
    worker.manager.start().await.unwrap();
    eventually(
        || worker.manager.health().consecutive_failures >= 1,
        "failed connection attempt",
    )
    .await;
    assert!(
        worker
            .manager
            .health()
            .last_error
            .unwrap_or_default()
            .contains("no responders")
    );
    worker.manager.close(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_handshake_required_forces_reconnect() {
    let broker = Broker::shared();
    let orchestrator = Arc::new(FakeOrchestrator::default());
    orchestrator.handshake_required.store(1, Ordering::SeqCst);
    let _responder = orchestrator.serve(&broker).await;
    let worker = Worker::new(&broker);

    worker.manager.start().await.unwrap();
    eventually(
        || orchestrator.handshakes.lock().len() >= 2,
        "second handshake",
    )
    .await;
    eventually(
        || worker.manager.state() == ConnectionState::Connected,
        "reconnected",
    )
    .await;
    worker.manager.close(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_reconnects_after_outage() {
    let broker = Broker::shared();
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let _responder = orchestrator.serve(&broker).await;
    let worker = Worker::new(&broker);

    worker.manager.start().await.unwrap();
    eventually(
        || worker.manager.state() == ConnectionState::Connected,
        "connected",
    )
    .await;

    broker.lock().pause();
    eventually(
        || worker.manager.health().consecutive_failures >= 1,
        "outage noticed",
    )
    .await;
    assert_ne!(worker.manager.state(), ConnectionState::Connected);

    broker.lock().resume();
    eventually(
        || worker.manager.state() == ConnectionState::Connected,
        "reconnected",
    )
    .await;
    assert!(orchestrator.handshakes.lock().len() >= 2);
    assert_eq!(worker.manager.health().consecutive_failures, 0);
    worker.manager.close(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_state_handlers_run_in_order() {
    let broker = Broker::shared();
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let _responder = orchestrator.serve(&broker).await;
    let worker = Worker::new(&broker);

    let seen = Arc::new(Mutex::new(Vec::new()));
    for id in 0..2 {
        let seen = seen.clone();
        worker
            .manager
            .on_state_change(Arc::new(move |state: ConnectionState| {
                seen.lock().push((id, state))
            }));
    }

    worker.manager.start().await.unwrap();
    eventually(
        || worker.manager.state() == ConnectionState::Connected,
        "connected",
    )
    .await;
    worker.manager.close(Duration::from_secs(2)).await.unwrap();

    let expected: Vec<_> = [
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Disconnected,
    ]
    .into_iter()
    .flat_map(|state| [(0, state), (1, state)])
    .collect();
    assert_eq!(*seen.lock(), expected);
}

#[tokio::test]
async fn test_close_sends_shutdown_notice_and_checkpoints_incoming() {
    let broker = Broker::shared();
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let _responder = orchestrator.serve(&broker).await;
    let worker = Worker::new(&broker);

    worker.manager.start().await.unwrap();
    eventually(
        || worker.manager.state() == ConnectionState::Connected,
        "connected",
    )
    .await;

    let sender = Publisher::new(
        connect(&broker),
        Serializer::default(),
        "orchestrator-test",
        subjects::compute_in_msgs(NODE),
    );
    for seq_num in 1..=3u64 {
        let message = Message::new(ExecutionUpdate {
            execution_id: format!("e{seq_num}"),
            job_id: "job".into(),
            state: "Pending".into(),
            message: None,
        })
        .with_metadata_value(KEY_SEQ_NUM, seq_num.to_string());
        sender.publish(PublishRequest::new(message)).await.unwrap();
    }
    eventually(|| worker.inbox.seqs() == vec![1, 2, 3], "inbound messages").await;
    assert_eq!(worker.manager.last_orchestrator_seq_num(), 3);

    worker.manager.close(Duration::from_secs(2)).await.unwrap();
    {
        let notices = orchestrator.notices.lock();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].node_id, NODE);
        assert_eq!(notices[0].last_orchestrator_seq_num, 3);
    }
    assert_eq!(
        worker
            .store
            .get_checkpoint(&format!("incoming-{NODE}"))
            .unwrap(),
        Some(3)
    );

    worker.manager.start().await.unwrap();
    eventually(
        || orchestrator.handshakes.lock().len() == 2,
        "handshake after restart",
    )
    .await;
    assert_eq!(
        orchestrator.handshakes.lock()[1].last_orchestrator_seq_num,
        3
    );
    worker.manager.close(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_close_without_connection() {
    let broker = Broker::shared();
    let worker = Worker::new(&broker);
    worker.manager.close(Duration::from_secs(1)).await.unwrap();
    worker.manager.start().await.unwrap();
    worker.manager.close(Duration::from_secs(2)).await.unwrap();
    assert_eq!(worker.manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_node_info_changes_are_sent() {
    let broker = Broker::shared();
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let _responder = orchestrator.serve(&broker).await;
    let worker = Worker::new(&broker);

    worker.manager.start().await.unwrap();
    eventually(
        || worker.manager.state() == ConnectionState::Connected,
        "connected",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(orchestrator.updates.lock().is_empty());

    worker
        .node_info
        .lock()
        .labels
        .insert("zone".into(), "eu-west".into());
    eventually(
        || !orchestrator.updates.lock().is_empty(),
        "node info update",
    )
    .await;
    assert_eq!(
        orchestrator.updates.lock()[0].labels.get("zone").map(String::as_str),
        Some("eu-west")
    );
    eventually(
        || worker.manager.health().last_successful_update.is_some(),
        "update recorded",
    )
    .await;
    worker.manager.close(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_outbound_dispatch_resumes_after_orchestrator_seq() {
    let broker = Broker::shared();
    let orchestrator = Arc::new(FakeOrchestrator::default());
    orchestrator.last_compute_seq_num.store(2, Ordering::SeqCst);
    let _responder = orchestrator.serve(&broker).await;

    let received = Arc::new(Inbox::default());
    let _subscriber = Subscriber::subscribe(
        connect(&broker),
        Serializer::default(),
        &subjects::compute_out_msgs(NODE),
        received.clone(),
        None,
    )
    .await
    .unwrap();

    let worker = Worker::new(&broker);
    worker.store_events(4);
    worker.manager.start().await.unwrap();
    eventually(|| received.seqs() == vec![3, 4], "events after seq 2").await;

    worker.store_events(1);
    eventually(|| received.seqs() == vec![3, 4, 5], "new event").await;
    eventually(
        || {
            worker
                .store
                .get_checkpoint(super::DISPATCHER_WATCHER_ID)
                .unwrap()
                == Some(5)
        },
        "outbound checkpoint",
    )
    .await;
    worker.manager.close(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_stored_outbound_checkpoint_wins_over_handshake() {
    let broker = Broker::shared();
    let orchestrator = Arc::new(FakeOrchestrator::default());
    orchestrator.last_compute_seq_num.store(1, Ordering::SeqCst);
    let _responder = orchestrator.serve(&broker).await;

    let received = Arc::new(Inbox::default());
    let _subscriber = Subscriber::subscribe(
        connect(&broker),
        Serializer::default(),
        &subjects::compute_out_msgs(NODE),
        received.clone(),
        None,
    )
    .await
    .unwrap();

    let store = Arc::new(MemoryEventStore::new());
    let worker = Worker::with_store(&broker, store.clone());
    worker.store_events(5);
    store.checkpoint(super::DISPATCHER_WATCHER_ID, 3).unwrap();
    worker.manager.start().await.unwrap();

    eventually(|| received.seqs() == vec![4, 5], "events after the stored checkpoint").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(received.seqs(), vec![4, 5]);
    worker.manager.close(Duration::from_secs(2)).await.unwrap();
}
