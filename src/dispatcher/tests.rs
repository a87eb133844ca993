use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::{Dispatcher, DispatcherConfig, DispatcherState, MessageCreator, PendingMessage, Recovery};
use crate::broker::{Broker, SharedBroker};
use crate::envelope::{KEY_EVENT_TIME, KEY_SOURCE, Message, Serializer};
use crate::messaging::{
    AckResult, MessageHandler, OrderedPublisher, OrderedPublisherConfig, PublishFuture, Subscriber,
};
use crate::protocol::messages::ExecutionUpdate;
use crate::transport::{MemoryTransport, Subscription, Transport};
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::error::{ProtocolError, PublishError, WatcherError};
use crate::watcher::{
    Checkpointer, Event, EventHandler, EventSource, EventStore, MemoryEventStore, Operation,
    Watcher, WatcherConfig, WatcherState, WatcherStats,
};

const SUBJECT: &str = "test.dispatch";

#[derive(Default)]
struct Sink {
    received: Mutex<Vec<Message>>,
}

#[async_trait]
impl MessageHandler for Sink {
    async fn handle_message(&self, message: Message) -> Result<(), ProtocolError> {
        self.received.lock().push(message);
        Ok(())
    }
}

impl Sink {
    fn seqs(&self) -> Vec<u64> {
        self.received.lock().iter().map(Message::seq_num).collect()
    }
}

struct Harness {
    broker: SharedBroker,
    store: Arc<MemoryEventStore>,
    sink: Arc<Sink>,
    ack_wait: Duration,
    _subscriber: Option<Subscriber>,
    _silent: Option<Subscription>,
}

impl Harness {
    async fn new() -> Self {
        let broker = Broker::shared();
        let sink = Arc::new(Sink::default());
        let subscriber = Subscriber::subscribe(
            connect(&broker),
            Serializer::default(),
            SUBJECT,
            sink.clone(),
            None,
        )
        .await
        .unwrap();
        Self {
            broker,
            store: Arc::new(MemoryEventStore::new()),
            sink,
            ack_wait: Duration::from_millis(500),
            _subscriber: Some(subscriber),
            _silent: None,
        }
    }

    /// Messages reach a subscriber that never acks them.
    async fn silent() -> Self {
        let broker = Broker::shared();
        let silent = connect(&broker).subscribe(SUBJECT).await.unwrap();
        Self {
            broker,
            store: Arc::new(MemoryEventStore::new()),
            sink: Arc::new(Sink::default()),
            ack_wait: Duration::from_secs(30),
            _subscriber: None,
            _silent: Some(silent),
        }
    }

    fn store_events(&self, n: usize) {
        for i in 0..n {
            self.store
                .store_event(Operation::Create, "execution", json!({ "id": format!("e{i}") }))
                .unwrap();
        }
    }

    async fn dispatcher(&self, config: DispatcherConfig) -> Dispatcher {
        self.dispatcher_with(config, Arc::new(every_event)).await
    }

    async fn dispatcher_with(
        &self,
        config: DispatcherConfig,
        creator: Arc<dyn MessageCreator>,
    ) -> Dispatcher {
        let publisher = OrderedPublisher::new(
            connect(&self.broker),
            Serializer::default(),
            OrderedPublisherConfig {
                ack_wait: self.ack_wait,
                ..OrderedPublisherConfig::new("test-dispatcher", SUBJECT)
            },
        )
        .await
        .unwrap();
        let watcher = Watcher::new(
            self.store.clone(),
            WatcherConfig {
                poll_interval: Duration::from_millis(10),
                ..WatcherConfig::new("test-watcher")
            },
        );
        Dispatcher::new(
            "test-dispatcher",
            Arc::new(publisher),
            Arc::new(watcher),
            creator,
            config,
        )
        .unwrap()
    }

    async fn wait_for(&self, n: usize) {
        for _ in 0..300 {
            if self.sink.received.lock().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sink saw {:?}, wanted {n} messages", self.sink.seqs());
    }
}

fn connect(broker: &SharedBroker) -> Arc<dyn Transport> {
    Arc::new(MemoryTransport::connect(broker.clone()))
}

fn every_event(event: &Event) -> Result<Option<Message>, ProtocolError> {
    Ok(Some(Message::new(ExecutionUpdate {
        execution_id: event.object["id"].as_str().unwrap_or_default().to_string(),
        job_id: "job".into(),
        state: "Running".into(),
        message: None,
    })))
}

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        checkpoint_interval: Some(Duration::from_millis(50)),
        process_interval: Duration::from_millis(10),
        stall_check_interval: Duration::from_millis(50),
        base_retry_interval: Duration::from_millis(50),
        max_retry_interval: Duration::from_millis(100),
        ..DispatcherConfig::default()
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
    assert!(DispatcherConfig::default().validate().is_ok());
    assert!(
        DispatcherConfig::default()
            .without_checkpointing()
            .validate()
            .is_ok()
    );

    let inverted = DispatcherConfig {
        base_retry_interval: Duration::from_secs(10),
        max_retry_interval: Duration::from_secs(1),
        ..DispatcherConfig::default()
    };
    assert!(matches!(inverted.validate(), Err(ProtocolError::InvalidConfig(_))));

    let zero = DispatcherConfig {
        process_interval: Duration::ZERO,
        ..DispatcherConfig::default()
    };
    assert!(zero.validate().is_err());
}

#[test]
fn test_config_from_settings() {
    let mut settings = crate::config::Settings::default().dispatcher;
    settings.checkpoint_interval_ms = 0;
    settings.process_interval_ms = 250;
    let config = DispatcherConfig::from(&settings);
    assert_eq!(config.checkpoint_interval, None);
    assert_eq!(config.process_interval, Duration::from_millis(250));
}

#[test]
fn test_state_ack_prunes_prefix_and_checkpoint_target() {
    let state = DispatcherState::new();
    for seq_num in 1..=4 {
        state.add_pending(PendingMessage {
            seq_num,
            publish_time: tokio::time::Instant::now(),
            future: PublishFuture::new(),
        });
    }
    assert_eq!(state.stats().last_observed_seq_num, 4);
    assert_eq!(state.checkpoint_target(), None);

    state.update_last_acked(2);
    let stats = state.stats();
    assert_eq!(stats.last_acked_seq_num, 2);
    assert_eq!(stats.pending, 2);
    assert_eq!(state.checkpoint_target(), Some(2));

    // acks never move backwards
    state.update_last_acked(1);
    assert_eq!(state.stats().last_acked_seq_num, 2);

    state.update_last_acked(4);
    state.update_last_observed(6);
    assert_eq!(state.checkpoint_target(), Some(6));
    state.update_last_checkpoint(6);
    assert_eq!(state.checkpoint_target(), None);

    state.reset(3);
    let stats = state.stats();
    assert_eq!(
        (stats.last_checkpoint_seq_num, stats.last_acked_seq_num, stats.last_observed_seq_num),
        (3, 3, 3)
    );
    assert_eq!(stats.pending, 0);
}

#[test]
fn test_state_resolved_prefix_stops_at_unresolved() {
    let state = DispatcherState::new();
    let futures: Vec<_> = (0..3).map(|_| PublishFuture::new()).collect();
    for (i, future) in futures.iter().enumerate() {
        state.add_pending(PendingMessage {
            seq_num: i as u64 + 1,
            publish_time: tokio::time::Instant::now(),
            future: future.clone(),
        });
    }
    futures[0].set_result(AckResult::new());
    futures[2].set_result(AckResult::new());
    let resolved: Vec<_> = state.resolved_prefix().iter().map(|m| m.seq_num).collect();
    assert_eq!(resolved, vec![1]);
}

#[test]
fn test_state_stalled_reports_only_old_pending() {
    let state = DispatcherState::new();
    let base = tokio::time::Instant::now();
    for (seq_num, offset) in [(1, 0), (2, 2), (3, 5)] {
        state.add_pending(PendingMessage {
            seq_num,
            publish_time: base + Duration::from_secs(offset),
            future: PublishFuture::new(),
        });
    }
    let timeout = Duration::from_secs(3);

    assert_eq!(state.stalled(base + Duration::from_secs(6), timeout), vec![1, 2]);
    // exactly at the timeout is not stalled yet
    assert_eq!(state.stalled(base + Duration::from_secs(5), timeout), vec![1]);
    assert!(state.stalled(base + Duration::from_secs(1), timeout).is_empty());

    state.update_last_acked(1);
    assert_eq!(state.stalled(base + Duration::from_secs(6), timeout), vec![2]);
    state.update_last_acked(3);
    assert!(state.stalled(base + Duration::from_secs(60), timeout).is_empty());
}

#[tokio::test]
async fn test_stalled_messages_do_not_trigger_recovery() {
    let harness = Harness::silent().await;
    harness.store_events(2);
    let dispatcher = harness
        .dispatcher(DispatcherConfig {
            stall_timeout: Duration::from_millis(50),
            stall_check_interval: Duration::from_millis(20),
            ..fast_config()
        })
        .await;
    dispatcher.start().await.unwrap();

    eventually(|| dispatcher.stats().pending == 2, "two pending messages").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stall_timeout = dispatcher.shared.config.stall_timeout;
    let stalled = dispatcher
        .shared
        .state
        .stalled(tokio::time::Instant::now(), stall_timeout);
    assert_eq!(stalled, vec![1, 2]);
    assert_eq!(dispatcher.recovery().state(), (false, None, 0));
    let stats = dispatcher.stats();
    assert_eq!((stats.pending, stats.last_acked_seq_num), (2, 0));
    dispatcher.stop().await;
}

#[tokio::test]
async fn test_dispatches_events_in_order() {
    let harness = Harness::new().await;
    harness.store_events(5);
    let dispatcher = harness.dispatcher(fast_config()).await;
    dispatcher.start().await.unwrap();

    harness.wait_for(5).await;
    assert_eq!(harness.sink.seqs(), vec![1, 2, 3, 4, 5]);
    let first = harness.sink.received.lock()[0].clone();
    assert_eq!(first.metadata.get(KEY_SOURCE), "test-dispatcher");
    assert!(first.metadata.get_time(KEY_EVENT_TIME).is_some());

    eventually(|| dispatcher.stats().last_acked_seq_num == 5, "acks").await;
    assert!(matches!(
        dispatcher.start().await,
        Err(ProtocolError::AlreadyRunning(_))
    ));
    dispatcher.stop().await;
    dispatcher.stop().await;
    assert!(!dispatcher.is_running());
}

#[tokio::test]
async fn test_skipped_events_advance_checkpoint() {
    let harness = Harness::new().await;
    harness.store_events(4);
    let evens_only = |event: &Event| {
        if event.seq_num % 2 == 0 {
            every_event(event)
        } else {
            Ok(None)
        }
    };
    let dispatcher = harness
        .dispatcher_with(fast_config(), Arc::new(evens_only))
        .await;
    dispatcher.start().await.unwrap();

    harness.wait_for(2).await;
    eventually(
        || harness.store.get_checkpoint("test-watcher").unwrap() == Some(4),
        "checkpoint 4",
    )
    .await;
    dispatcher.stop().await;
    assert_eq!(harness.sink.seqs(), vec![2, 4]);
}

#[tokio::test]
async fn test_restart_resumes_after_checkpoint() {
    let harness = Harness::new().await;
    harness.store_events(3);
    let dispatcher = harness.dispatcher(fast_config()).await;
    dispatcher.start().await.unwrap();
    harness.wait_for(3).await;
    eventually(|| dispatcher.stats().last_acked_seq_num == 3, "acks").await;
    dispatcher.stop().await;
    assert_eq!(harness.store.get_checkpoint("test-watcher").unwrap(), Some(3));

    harness.store_events(2);
    let restarted = harness.dispatcher(fast_config()).await;
    restarted.start().await.unwrap();
    harness.wait_for(5).await;
    restarted.stop().await;

    assert_eq!(harness.sink.seqs(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_checkpointing_disabled() {
    let harness = Harness::new().await;
    harness.store_events(2);
    let dispatcher = harness
        .dispatcher(fast_config().without_checkpointing())
        .await;
    dispatcher.start().await.unwrap();
    harness.wait_for(2).await;
    dispatcher.stop().await;
    assert_eq!(harness.store.get_checkpoint("test-watcher").unwrap(), None);
}

#[tokio::test]
async fn test_recovers_after_transport_outage() {
    let harness = Harness::new().await;
    let dispatcher = harness.dispatcher(fast_config()).await;
    dispatcher.start().await.unwrap();

    harness.broker.lock().pause();
    harness.store_events(1);
    eventually(|| dispatcher.recovery().state().0, "a recovery attempt").await;

    harness.broker.lock().resume();
    harness.wait_for(1).await;
    eventually(|| !dispatcher.recovery().state().0, "recovery to finish").await;
    eventually(|| dispatcher.stats().last_acked_seq_num == 1, "ack").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.sink.seqs(), vec![1]);
    dispatcher.stop().await;
}

/// Event source whose start results are scripted.
#[derive(Default)]
struct ScriptedSource {
    start_failures: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    running: Mutex<bool>,
}

#[async_trait]
impl EventSource for ScriptedSource {
    fn id(&self) -> &str {
        "scripted"
    }

    fn set_handler(&self, _handler: Arc<dyn EventHandler>) -> Result<(), WatcherError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), WatcherError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self
            .start_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(WatcherError::Handler("start failed".into()));
        }
        *self.running.lock() = true;
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.running.lock() = false;
    }

    fn stats(&self) -> WatcherStats {
        WatcherStats {
            id: "scripted".into(),
            state: if *self.running.lock() {
                WatcherState::Running
            } else {
                WatcherState::Stopped
            },
            last_processed_seq_num: 0,
            last_checkpoint: 0,
        }
    }

    fn get_checkpoint(&self) -> Result<u64, WatcherError> {
        Ok(0)
    }

    fn checkpoint(&self, _seq_num: u64) -> Result<(), WatcherError> {
        Ok(())
    }
}

async fn recovery(source: Arc<ScriptedSource>, base: Duration) -> Arc<Recovery> {
    let broker = Broker::shared();
    let publisher = OrderedPublisher::new(
        connect(&broker),
        Serializer::default(),
        OrderedPublisherConfig::new("recovery-test", SUBJECT),
    )
    .await
    .unwrap();
    Arc::new(Recovery::new(
        "recovery-test",
        Arc::new(publisher),
        source,
        Arc::new(DispatcherState::new()),
        ExponentialBackoff::new(base, base * 4),
    ))
}

#[tokio::test]
async fn test_recovery_coalesces_and_retries() {
    let source = Arc::new(ScriptedSource {
        start_failures: AtomicUsize::new(1),
        ..Default::default()
    });
    let recovery = recovery(source.clone(), Duration::from_millis(20)).await;
    assert_eq!(recovery.state(), (false, None, 0));

    recovery.handle_error(1, PublishError::AckTimeout).await;
    recovery.handle_error(2, PublishError::AckTimeout).await;
    let (recovering, last_failure, failures) = recovery.state();
    assert!(recovering);
    assert!(last_failure.is_some());
    assert_eq!(failures, 1);
    assert_eq!(source.stops.load(Ordering::SeqCst), 1);

    eventually(|| !recovery.state().0, "recovery to finish").await;
    assert_eq!(source.starts.load(Ordering::SeqCst), 2);
    assert_eq!(recovery.state(), (false, None, 0));
}

#[tokio::test]
async fn test_recovery_stop_interrupts_backoff() {
    let source = Arc::new(ScriptedSource::default());
    let recovery = recovery(source.clone(), Duration::from_secs(30)).await;
    recovery.handle_error(1, PublishError::Reset).await;
    assert!(recovery.state().0);

    tokio::time::timeout(Duration::from_secs(1), recovery.stop())
        .await
        .expect("stop should interrupt the backoff");
    assert!(!recovery.state().0);
    assert_eq!(source.starts.load(Ordering::SeqCst), 0);
    recovery.stop().await;

    recovery.reset();
    assert_eq!(recovery.state(), (false, None, 0));
    recovery.handle_error(1, PublishError::Reset).await;
    assert_eq!(source.stops.load(Ordering::SeqCst), 2);
    recovery.stop().await;
}

#[tokio::test]
async fn test_drop_cancels_recovery_in_progress() {
    let harness = Harness::new().await;
    let dispatcher = harness.dispatcher(fast_config()).await;
    let source = dispatcher.shared.source.clone();
    dispatcher.start().await.unwrap();

    harness.broker.lock().pause();
    harness.store_events(1);
    eventually(
        || dispatcher.recovery().state().0 && source.stats().state != WatcherState::Running,
        "recovery to stop the source",
    )
    .await;

    drop(dispatcher);
    harness.broker.lock().resume();
    // several retry intervals
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_ne!(source.stats().state, WatcherState::Running);
    assert!(harness.sink.seqs().is_empty());
}
