use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{Collaborators, Config};
use super::control_plane::{ControlPlane, ControlPlaneParams};
use super::data_plane::DataPlane;
use super::health::HealthTracker;
use crate::envelope::Message;
use crate::messaging::{PublishRequest, Publisher, Subscriber};
use crate::protocol::messages::{HandshakeRequest, HandshakeResponse, ShutdownNoticeRequest};
use crate::protocol::{
    ConnectionHealth, ConnectionState, ConnectionStateHandler, SequenceTracker, subjects,
};
use crate::transport::Transport;
use crate::utils::error::ProtocolError;

/// Capacity of the queue feeding state change handlers.
pub const STATE_CHANGE_BUFFER: usize = 32;

type StateChange = (ConnectionState, Option<String>);

/// Everything that exists only while connected.
struct Session {
    transport: Arc<dyn Transport>,
    subscriber: Subscriber,
    requester: Publisher,
    control_plane: ControlPlane,
    data_plane: DataPlane,
}

impl Session {
    async fn teardown(self, timeout: Duration) {
        self.control_plane.stop().await;
        self.data_plane.stop(timeout).await;
        self.subscriber.close().await;
        self.transport.close().await;
    }
}

struct Inner {
    config: Config,
    collaborators: Collaborators,
    health: Arc<HealthTracker>,
    incoming: Arc<SequenceTracker>,
    session: tokio::sync::Mutex<Option<Session>>,
    handlers: RwLock<Vec<ConnectionStateHandler>>,
    state_tx: Mutex<Option<mpsc::Sender<StateChange>>>,
}

struct Running {
    cancel: CancellationToken,
    maintain: JoinHandle<()>,
    notifier: JoinHandle<()>,
}

/// Keeps a worker connected to its orchestrator.
///
/// A background loop connects, judges connection health and reconnects with
/// backoff. Each connection performs a handshake and then runs a control
/// plane (heartbeats, node info, checkpoints) and a data plane (inbound
/// subscriber plus outbound dispatcher) until it is judged unhealthy.
pub struct ConnectionManager {
    inner: Arc<Inner>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl ConnectionManager {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self, ProtocolError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                collaborators,
                health: Arc::new(HealthTracker::new()),
                incoming: Arc::new(SequenceTracker::new()),
                session: tokio::sync::Mutex::new(None),
                handlers: RwLock::new(Vec::new()),
                state_tx: Mutex::new(None),
            }),
            running: tokio::sync::Mutex::new(None),
        })
    }

    /// Restores the incoming sequence checkpoint and starts the reconnect
    /// loop. The first connection attempt happens right away.
    pub async fn start(&self) -> Result<(), ProtocolError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProtocolError::AlreadyRunning(format!(
                "connection manager {}",
                self.inner.config.node_id
            )));
        }

        let inner = &self.inner;
        let checkpoint = inner
            .collaborators
            .event_store
            .get_checkpoint(&inner.checkpoint_name())?
            .unwrap_or(0);
        inner.incoming.update_last_seq_num(checkpoint);

        let (tx, rx) = mpsc::channel(STATE_CHANGE_BUFFER);
        *inner.state_tx.lock() = Some(tx);
        let notifier = tokio::spawn(notify_loop(inner.clone(), rx));

        let cancel = CancellationToken::new();
        let maintain = tokio::spawn(maintain_loop(inner.clone(), cancel.clone()));
        *running = Some(Running {
            cancel,
            maintain,
            notifier,
        });

        info!(node_id = %inner.config.node_id, incoming_checkpoint = checkpoint, "connection manager started");
        Ok(())
    }

    /// Stops reconnecting, tells the orchestrator this worker is leaving if
    /// connected, persists the incoming sequence and tears the connection
    /// down. Waits at most `timeout` for the background loops.
    pub async fn close(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        let inner = &self.inner;
        let Running {
            cancel,
            maintain,
            notifier,
        } = running;
        cancel.cancel();

        let shutdown = async move {
            let _ = maintain.await;

            let session = inner.session.lock().await.take();
            if let Some(session) = session {
                inner.send_shutdown_notice(&session.requester).await;
                session.teardown(timeout).await;
            }
            if let Err(e) = inner
                .collaborators
                .event_store
                .checkpoint(&inner.checkpoint_name(), inner.incoming.last_seq_num())
            {
                error!(node_id = %inner.config.node_id, error = %e, "failed to checkpoint incoming sequence number");
            }
            if inner.health.state() != ConnectionState::Disconnected {
                inner.transition(ConnectionState::Disconnected, None);
            }

            inner.state_tx.lock().take();
            let _ = notifier.await;
        };

        match tokio::time::timeout(timeout, shutdown).await {
            Ok(()) => {
                info!(node_id = %inner.config.node_id, "connection manager closed");
                Ok(())
            }
            Err(_) => {
                inner.state_tx.lock().take();
                Err(ProtocolError::Remote(format!(
                    "timed out closing connection manager {}",
                    inner.config.node_id
                )))
            }
        }
    }

    /// Registers a handler called for every later state transition.
    /// Handlers run in registration order, one transition at a time.
    pub fn on_state_change(&self, handler: ConnectionStateHandler) {
        self.inner.handlers.write().push(handler);
    }

    pub fn health(&self) -> ConnectionHealth {
        self.inner.health.health()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.health.state()
    }

    /// Highest sequence number processed from the orchestrator.
    pub fn last_orchestrator_seq_num(&self) -> u64 {
        self.inner.incoming.last_seq_num()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(running) = running.take() {
                running.cancel.cancel();
            }
        }
    }
}

async fn notify_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<StateChange>) {
    while let Some((state, _)) = rx.recv().await {
        let handlers = inner.handlers.read().clone();
        for handler in handlers {
            handler(state);
        }
    }
    debug!(node_id = %inner.config.node_id, "state change notifier stopped");
}

async fn maintain_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    if let Err(e) = inner.connect().await {
        error!(node_id = %inner.config.node_id, error = %e, "initial connection failed");
    }

    let period = inner.config.reconnect_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        inner.check_health().await;
        if inner.health.state() != ConnectionState::Disconnected {
            continue;
        }
        if let Err(e) = inner.connect().await {
            let failures = inner.health.health().consecutive_failures;
            let delay = inner.config.reconnect_backoff.duration(failures);
            error!(
                node_id = %inner.config.node_id,
                error = %e,
                failures,
                backoff_ms = delay.as_millis() as u64,
                "connection attempt failed"
            );
            if !inner.config.reconnect_backoff.wait(failures, &cancel).await {
                break;
            }
        }
    }
    debug!(node_id = %inner.config.node_id, "reconnect loop stopped");
}

impl Inner {
    fn checkpoint_name(&self) -> String {
        format!("incoming-{}", self.config.node_id)
    }

    fn transition(&self, state: ConnectionState, err: Option<String>) {
        let previous = self.health.state();
        match state {
            ConnectionState::Connecting => self.health.mark_connecting(),
            ConnectionState::Connected => self.health.mark_connected(),
            ConnectionState::Disconnected => self.health.mark_disconnected(err.clone()),
        }
        match &err {
            Some(e) => warn!(node_id = %self.config.node_id, from = %previous, to = %state, error = %e, "connection state changed"),
            None => info!(node_id = %self.config.node_id, from = %previous, to = %state, "connection state changed"),
        }

        if let Some(tx) = self.state_tx.lock().as_ref() {
            if tx.try_send((state, err)).is_err() {
                warn!(node_id = %self.config.node_id, state = %state, "state change queue full, dropping notification");
            }
        }
    }

    async fn connect(&self) -> Result<(), ProtocolError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }
        self.transition(ConnectionState::Connecting, None);

        match self.establish().await {
            Ok(established) => {
                *session = Some(established);
                self.transition(ConnectionState::Connected, None);
                Ok(())
            }
            Err(e) => {
                self.transition(ConnectionState::Disconnected, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Each step cleans up what the earlier ones built if it fails.
    async fn establish(&self) -> Result<Session, ProtocolError> {
        let node_id = &self.config.node_id;
        let collaborators = &self.collaborators;

        let transport = collaborators.transport_factory.connect().await?;

        // subscribe before the handshake so nothing sent right after it is missed
        let subscriber = match Subscriber::subscribe(
            transport.clone(),
            collaborators.serializer.clone(),
            &subjects::compute_in_msgs(node_id),
            collaborators.message_handler.clone(),
            Some(self.incoming.clone()),
        )
        .await
        {
            Ok(subscriber) => subscriber,
            Err(e) => {
                transport.close().await;
                return Err(e.into());
            }
        };

        let requester = Publisher::new(
            transport.clone(),
            collaborators.serializer.clone(),
            node_id.clone(),
            subjects::compute_out_ctrl(node_id),
        );

        let response = match self.handshake(&requester).await {
            Ok(response) => response,
            Err(e) => {
                subscriber.close().await;
                transport.close().await;
                return Err(e);
            }
        };
        self.incoming
            .update_last_seq_num(response.starting_orchestrator_seq_num);

        let control_plane = ControlPlane::start(ControlPlaneParams {
            config: self.config.clone(),
            requester: requester.clone(),
            health: self.health.clone(),
            node_info_provider: collaborators.node_info_provider.clone(),
            incoming: self.incoming.clone(),
            checkpointer: collaborators.event_store.clone(),
            checkpoint_name: self.checkpoint_name(),
        });

        let data_plane = match DataPlane::start(
            &self.config,
            collaborators,
            transport.clone(),
            response.last_compute_seq_num,
        )
        .await
        {
            Ok(data_plane) => data_plane,
            Err(e) => {
                control_plane.stop().await;
                subscriber.close().await;
                transport.close().await;
                return Err(e);
            }
        };

        Ok(Session {
            transport,
            subscriber,
            requester,
            control_plane,
            data_plane,
        })
    }

    async fn handshake(&self, requester: &Publisher) -> Result<HandshakeResponse, ProtocolError> {
        let request = HandshakeRequest {
            node_info: self.collaborators.node_info_provider.node_info(),
            start_time: self.health.health().start_time,
            last_orchestrator_seq_num: self.incoming.last_seq_num(),
        };
        let response = requester
            .request(
                PublishRequest::new(Message::new(request)),
                self.config.request_timeout,
            )
            .await?;
        let Some(response) = response.get_payload::<HandshakeResponse>() else {
            return Err(ProtocolError::UnexpectedResponse {
                expected: "HandshakeResponse".into(),
                got: response.message_type().into(),
            });
        };
        if !response.accepted {
            return Err(ProtocolError::HandshakeRejected(response.reason.clone()));
        }
        info!(
            node_id = %self.config.node_id,
            last_compute_seq_num = response.last_compute_seq_num,
            starting_orchestrator_seq_num = response.starting_orchestrator_seq_num,
            "handshake accepted"
        );
        Ok(response.clone())
    }

    /// Drops a connected session that missed too many heartbeats, lost its
    /// transport or was told to handshake again.
    async fn check_health(&self) {
        if self.health.state() != ConnectionState::Connected {
            return;
        }
        let health = self.health.health();
        let mut session = self.session.lock().await;

        let deadline = self.config.heartbeat_deadline();
        let reason = if health
            .last_successful_heartbeat
            .is_some_and(|at| (Utc::now() - at).to_std().unwrap_or_default() > deadline)
        {
            Some("heartbeat timeout")
        } else if session.as_ref().is_none_or(|s| s.transport.is_closed()) {
            Some("transport closed")
        } else if health.handshake_required {
            Some("handshake required")
        } else {
            None
        };
        let Some(reason) = reason else {
            return;
        };

        if let Some(session) = session.take() {
            session.teardown(self.config.request_timeout).await;
        }
        self.transition(ConnectionState::Disconnected, Some(reason.to_string()));
    }

    async fn send_shutdown_notice(&self, requester: &Publisher) {
        if self.health.state() != ConnectionState::Connected {
            return;
        }
        let notice = ShutdownNoticeRequest {
            node_id: self.config.node_id.clone(),
            reason: "graceful shutdown".into(),
            last_orchestrator_seq_num: self.incoming.last_seq_num(),
        };
        match requester
            .request(
                PublishRequest::new(Message::new(notice)),
                self.config.request_timeout,
            )
            .await
        {
            Ok(_) => debug!(node_id = %self.config.node_id, "shutdown notice acknowledged"),
            Err(e) => warn!(node_id = %self.config.node_id, error = %e, "failed to send shutdown notice"),
        }
    }
}
