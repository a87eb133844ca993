//! Ordered asynchronous publisher.
//!
//! Requests are queued and sent one at a time by a single publish task, so
//! the transport sees them in enqueue order. Each sent message carries a
//! unique reply subject under the publisher's inbox; the response task
//! matches acks to in-flight messages and a timeout task fails the ones whose
//! ack never came.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::future::PublishFuture;
use super::publisher::{PublishRequest, Publisher};
use super::result::{AckResult, parse_result};
use crate::broker::Packet;
use crate::envelope::Serializer;
use crate::transport::{Subscription, Transport};
use crate::utils::error::PublishError;

/// Capacity of the send queue between callers and the publish task.
pub const QUEUE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Wait for the receiver to ack each message.
    #[default]
    ExplicitAck,
    /// Resolve as soon as the message is handed to the transport.
    NoAck,
}

#[derive(Debug, Clone)]
pub struct OrderedPublisherConfig {
    pub name: String,
    pub destination: String,
    pub ack_wait: Duration,
    pub max_pending: usize,
    pub ack_mode: AckMode,
}

impl OrderedPublisherConfig {
    pub fn new(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), PublishError> {
        if self.name.is_empty() {
            return Err(PublishError::InvalidRequest("publisher name is required".into()));
        }
        if self.ack_wait.is_zero() {
            return Err(PublishError::InvalidRequest("ack wait must be positive".into()));
        }
        if self.max_pending == 0 {
            return Err(PublishError::InvalidRequest("max pending must be positive".into()));
        }
        Ok(())
    }
}

impl Default for OrderedPublisherConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            destination: String::new(),
            ack_wait: Duration::from_secs(5),
            max_pending: 10_000,
            ack_mode: AckMode::ExplicitAck,
        }
    }
}

/// One unit of `max_pending`, held until its message is dropped.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PendingMsg {
    packet: Packet,
    future: PublishFuture,
    enqueued: Instant,
    deadline: Instant,
    _slot: Slot,
}

impl PendingMsg {
    /// Frees the slot before waking the caller.
    fn complete(self, result: Result<AckResult, PublishError>) {
        let PendingMsg { future, _slot: slot, .. } = self;
        drop(slot);
        match result {
            Ok(ack) => future.set_result(ack),
            Err(err) => future.set_error(err),
        };
    }
}

struct Inner {
    config: OrderedPublisherConfig,
    publisher: Publisher,
    inbox: String,
    queue_tx: mpsc::Sender<PendingMsg>,
    // held by the publish task while sending, and by reset while draining
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<PendingMsg>>,
    work: Notify,
    inflight: DashMap<String, PendingMsg>,
    // queued, being sent, or awaiting an ack
    pending: Arc<AtomicUsize>,
    enqueue_lock: Mutex<()>,
    shutdown: CancellationToken,
}

/// See the module docs.
pub struct OrderedPublisher {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OrderedPublisher {
    pub async fn new(
        transport: Arc<dyn Transport>,
        serializer: Serializer,
        config: OrderedPublisherConfig,
    ) -> Result<Self, PublishError> {
        config.validate()?;
        let publisher = Publisher::new(
            transport.clone(),
            serializer,
            config.name.clone(),
            config.destination.clone(),
        );
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_SIZE);
        let inbox = transport.new_inbox();

        let inner = Arc::new(Inner {
            config,
            publisher,
            inbox,
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            work: Notify::new(),
            inflight: DashMap::new(),
            pending: Arc::new(AtomicUsize::new(0)),
            enqueue_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        });

        let mut tasks = vec![tokio::spawn(publish_loop(inner.clone()))];
        if inner.config.ack_mode != AckMode::NoAck {
            let sub = transport.subscribe(&format!("{}.*", inner.inbox)).await?;
            tasks.push(tokio::spawn(response_loop(inner.clone(), sub)));
            tasks.push(tokio::spawn(timeout_loop(inner.clone())));
        }

        Ok(Self {
            inner,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Queued plus unacknowledged messages.
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count()
    }

    pub fn inflight_count(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Enqueues `request` and returns immediately. Fails fast when the
    /// publisher is at `max_pending`.
    pub fn publish_async(&self, request: PublishRequest) -> Result<PublishFuture, PublishError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(PublishError::Closed);
        }

        let mut packet = inner.publisher.encode(request)?;
        if inner.config.ack_mode != AckMode::NoAck {
            packet.reply = Some(format!("{}.{}", inner.inbox, uuid::Uuid::new_v4().simple()));
        }

        let _guard = inner.enqueue_lock.lock();
        if inner.pending.load(Ordering::SeqCst) >= inner.config.max_pending {
            return Err(PublishError::MaxPendingReached(inner.config.max_pending));
        }
        inner.pending.fetch_add(1, Ordering::SeqCst);
        let slot = Slot(inner.pending.clone());

        let future = PublishFuture::new();
        let now = Instant::now();
        let pending = PendingMsg {
            packet,
            future: future.clone(),
            enqueued: now,
            deadline: now + inner.config.ack_wait,
            _slot: slot,
        };
        match inner.queue_tx.try_send(pending) {
            Ok(()) => {
                inner.work.notify_one();
                Ok(future)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(PublishError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PublishError::Closed),
        }
    }

    /// Enqueues and waits for the ack. Dropping the returned future cancels
    /// the message if it has not been sent yet.
    pub async fn publish(&self, request: PublishRequest) -> Result<AckResult, PublishError> {
        let future = self.publish_async(request)?;
        let guard = CancelOnDrop(future);
        guard.0.wait().await
    }

    /// Fails every queued and in-flight message with `Reset` and clears all
    /// state. New messages are accepted as soon as this returns.
    pub async fn reset(&self) {
        info!(publisher = %self.inner.config.name, "publisher reset - clearing pending messages");
        self.inner.drain(PublishError::Reset).await;
    }

    /// Stops the background tasks and fails whatever is left with `Shutdown`.
    pub async fn close(&self, timeout: Duration) -> Result<(), PublishError> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        self.inner.shutdown.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let joined = tokio::time::timeout(timeout, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;

        self.inner.drain(PublishError::Shutdown).await;
        joined.map_err(|_| PublishError::Cancelled)
    }
}

impl Drop for OrderedPublisher {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for OrderedPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedPublisher")
            .field("name", &self.inner.config.name)
            .field("destination", &self.inner.config.destination)
            .field("pending", &self.pending_count())
            .finish()
    }
}

struct CancelOnDrop(PublishFuture);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl Inner {
    fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    async fn drain(&self, err: PublishError) {
        let mut rx = self.queue_rx.lock().await;
        let _guard = self.enqueue_lock.lock();
        debug!(
            publisher = %self.config.name,
            inflight = self.inflight.len(),
            queued = rx.len(),
            "draining publisher"
        );
        while let Ok(pending) = rx.try_recv() {
            pending.complete(Err(err.clone()));
        }
        let keys: Vec<String> = self.inflight.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, pending)) = self.inflight.remove(&key) {
                pending.complete(Err(err.clone()));
            }
        }
    }

    async fn process(&self, pending: PendingMsg) {
        // cancelled by the caller, or failed by a reset racing this send
        if pending.future.is_done() {
            return;
        }

        let packet = pending.packet.clone();
        let reply = packet.reply.clone();
        // register before sending so a fast ack cannot miss its entry
        let unacked = match &reply {
            Some(reply) => {
                self.inflight.insert(reply.clone(), pending);
                None
            }
            None => Some(pending),
        };

        match self.publisher.transport().publish(packet).await {
            Err(e) => {
                let failed = match &reply {
                    Some(reply) => self.inflight.remove(reply).map(|(_, pending)| pending),
                    None => unacked,
                };
                if let Some(pending) = failed {
                    pending.complete(Err(e.into()));
                }
            }
            Ok(()) => match unacked {
                Some(pending) => pending.complete(Ok(AckResult::new())),
                None => trace!(publisher = %self.config.name, "message in flight"),
            },
        }
    }

    fn handle_response(&self, packet: Packet) {
        let Some((_, pending)) = self.inflight.remove(&packet.subject) else {
            debug!(subject = %packet.subject, "received response for unknown request");
            return;
        };
        let result = parse_result(&packet).and_then(AckResult::into_result);
        if result.is_ok() {
            trace!(
                publisher = %self.config.name,
                latency_ms = pending.enqueued.elapsed().as_millis() as u64,
                "publish acked"
            );
        }
        pending.complete(result);
    }

    fn expire(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .inflight
            .iter()
            .filter(|e| now > e.value().deadline)
            .map(|e| e.key().clone())
            .collect();
        let mut count = 0;
        for key in expired {
            if let Some((_, pending)) = self.inflight.remove(&key) {
                pending.complete(Err(PublishError::AckTimeout));
                count += 1;
            }
        }
        count
    }
}

async fn publish_loop(inner: Arc<Inner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.work.notified() => {}
        }
        loop {
            let mut rx = inner.queue_rx.lock().await;
            let Ok(pending) = rx.try_recv() else { break };
            inner.process(pending).await;
            if inner.shutdown.is_cancelled() {
                break;
            }
        }
    }
    trace!(publisher = %inner.config.name, "publish loop stopped");
}

async fn response_loop(inner: Arc<Inner>, mut sub: Subscription) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            packet = sub.next() => match packet {
                Some(packet) => inner.handle_response(packet),
                None => {
                    warn!(publisher = %inner.config.name, "response subscription closed");
                    break;
                }
            }
        }
    }
}

async fn timeout_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.ack_wait / 2);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let expired = inner.expire(Instant::now());
                if expired > 0 {
                    debug!(publisher = %inner.config.name, expired, "publish ack timeout");
                }
            }
        }
    }
}
