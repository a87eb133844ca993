//! Node membership and liveness.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protocol::ConnectionState;
use crate::protocol::messages::{
    HandshakeRequest, HandshakeResponse, HeartbeatRequest, HeartbeatResponse, NodeInfo, NodeType,
    Resources, ShutdownNoticeRequest, ShutdownNoticeResponse, UpdateNodeInfoRequest,
    UpdateNodeInfoResponse,
};
use crate::utils::error::ProtocolError;
use crate::watcher::EventStore;

/// A node moved between connected and disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConnectionEvent {
    pub node_id: String,
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub timestamp: DateTime<Utc>,
}

pub type NodeConnectionHandler = Arc<dyn Fn(NodeConnectionEvent) + Send + Sync>;

/// Authority over which nodes may connect and whether they are alive.
#[async_trait]
pub trait NodeManager: Send + Sync {
    async fn handshake(&self, request: HandshakeRequest)
    -> Result<HandshakeResponse, ProtocolError>;

    /// `last_compute_seq_num` is what the orchestrator's data plane has
    /// processed from the node.
    async fn heartbeat(
        &self,
        request: HeartbeatRequest,
        last_compute_seq_num: u64,
    ) -> Result<HeartbeatResponse, ProtocolError>;

    async fn update_node_info(
        &self,
        request: UpdateNodeInfoRequest,
    ) -> Result<UpdateNodeInfoResponse, ProtocolError>;

    async fn shutdown_notice(
        &self,
        request: ShutdownNoticeRequest,
        last_compute_seq_num: u64,
    ) -> Result<ShutdownNoticeResponse, ProtocolError>;

    /// Handlers are called synchronously, in registration order.
    fn on_connection_state_change(&self, handler: NodeConnectionHandler);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Membership {
    Pending,
    #[default]
    Approved,
    Rejected,
}

/// Everything known about one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub info: NodeInfo,
    pub membership: Membership,
    pub status: ConnectionState,
    pub connected_since: Option<DateTime<Utc>>,
    pub disconnected_since: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Last orchestrator message the node reported processing.
    pub last_orchestrator_seq_num: u64,
    /// Last node message the orchestrator processed.
    pub last_compute_seq_num: u64,
    pub available_capacity: Resources,
    pub queue_used_capacity: Resources,
}

impl NodeState {
    fn disconnect(&mut self, reason: &str) {
        self.status = ConnectionState::Disconnected;
        self.disconnected_since = Some(Utc::now());
        self.connected_since = None;
        self.last_error = Some(reason.to_string());
        self.available_capacity = Resources::default();
        self.queue_used_capacity = Resources::default();
    }

    /// Trusts what each side reports. A zero compute sequence means the
    /// data plane has not processed anything yet and keeps the stored value.
    fn update_sequence_numbers(&mut self, orchestrator_seq_num: u64, compute_seq_num: u64) {
        self.last_orchestrator_seq_num = orchestrator_seq_num;
        if compute_seq_num > 0 {
            self.last_compute_seq_num = compute_seq_num;
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeManagerConfig {
    /// Silence after which a connected node is marked disconnected.
    pub disconnected_after: Duration,
    pub health_check_interval: Duration,
    /// Membership given to nodes on their first handshake.
    pub default_membership: Membership,
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        Self {
            disconnected_after: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
            default_membership: Membership::Approved,
        }
    }
}

struct Shared {
    config: NodeManagerConfig,
    event_store: Arc<dyn EventStore>,
    nodes: DashMap<String, NodeState>,
    handlers: RwLock<Vec<NodeConnectionHandler>>,
}

/// `NodeManager` that keeps node state in memory.
///
/// New nodes start receiving from the latest orchestrator event. Nodes that
/// reconnect resume from the sequence numbers recorded here rather than the
/// ones they report.
pub struct InMemoryNodeManager {
    shared: Arc<Shared>,
    liveness: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl InMemoryNodeManager {
    pub fn new(config: NodeManagerConfig, event_store: Arc<dyn EventStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                event_store,
                nodes: DashMap::new(),
                handlers: RwLock::new(Vec::new()),
            }),
            liveness: Mutex::new(None),
        }
    }

    /// Starts the liveness loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut liveness = self.liveness.lock();
        if liveness.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(liveness_loop(self.shared.clone(), cancel.clone()));
        *liveness = Some((cancel, task));
    }

    pub async fn stop(&self) {
        let liveness = self.liveness.lock().take();
        if let Some((cancel, task)) = liveness {
            cancel.cancel();
            let _ = task.await;
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeState> {
        self.shared.nodes.get(node_id).map(|n| n.clone())
    }

    pub fn list(&self) -> Vec<NodeState> {
        self.shared.nodes.iter().map(|n| n.value().clone()).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.shared
            .nodes
            .iter()
            .filter(|n| n.status == ConnectionState::Connected)
            .count()
    }

    pub fn approve_node(&self, node_id: &str) -> Result<(), ProtocolError> {
        let mut node = self
            .shared
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ProtocolError::NodeNotFound(node_id.to_string()))?;
        if node.membership == Membership::Approved {
            return Err(ProtocolError::NodeManager(format!(
                "node {node_id} already approved"
            )));
        }
        node.membership = Membership::Approved;
        Ok(())
    }

    /// Rejects the node and disconnects it if connected. Later handshakes
    /// are refused.
    pub fn reject_node(&self, node_id: &str) -> Result<(), ProtocolError> {
        let was_connected = {
            let mut node = self
                .shared
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| ProtocolError::NodeNotFound(node_id.to_string()))?;
            if node.membership == Membership::Rejected {
                return Err(ProtocolError::NodeManager(format!(
                    "node {node_id} already rejected"
                )));
            }
            node.membership = Membership::Rejected;
            let was_connected = node.status == ConnectionState::Connected;
            node.disconnect("node rejected");
            was_connected
        };
        if was_connected {
            self.shared
                .notify(node_id, ConnectionState::Connected, ConnectionState::Disconnected);
        }
        info!(node_id, "node rejected");
        Ok(())
    }

    fn handshake_required(node_id: &str) -> ProtocolError {
        ProtocolError::HandshakeRequired(node_id.to_string())
    }
}

impl Drop for InMemoryNodeManager {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.liveness.lock().take() {
            cancel.cancel();
        }
    }
}

impl Shared {
    fn notify(&self, node_id: &str, previous: ConnectionState, current: ConnectionState) {
        let event = NodeConnectionEvent {
            node_id: node_id.to_string(),
            previous,
            current,
            timestamp: Utc::now(),
        };
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler(event.clone());
        }
    }

    fn is_stale(&self, node: &NodeState) -> bool {
        node.status == ConnectionState::Connected
            && (Utc::now() - node.last_heartbeat)
                .to_std()
                .unwrap_or_default()
                > self.config.disconnected_after
    }

    fn check_liveness(&self) {
        let mut disconnected = Vec::new();
        for mut node in self.nodes.iter_mut() {
            if self.is_stale(&node) {
                info!(node_id = %node.key(), last_heartbeat = %node.last_heartbeat, "marking node as disconnected");
                node.disconnect("heartbeat timeout");
                disconnected.push(node.key().clone());
            }
        }
        for node_id in disconnected {
            self.notify(
                &node_id,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            );
        }
    }
}

async fn liveness_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.health_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => shared.check_liveness(),
        }
    }
    debug!("node liveness loop stopped");
}

#[async_trait]
impl NodeManager for InMemoryNodeManager {
    async fn handshake(
        &self,
        request: HandshakeRequest,
    ) -> Result<HandshakeResponse, ProtocolError> {
        let shared = &self.shared;
        let node_id = request.node_info.node_id.clone();
        debug!(node_id = %node_id, "handshake request received");

        let existing = self.get(&node_id);
        if existing
            .as_ref()
            .is_some_and(|n| n.membership == Membership::Rejected)
        {
            return Ok(HandshakeResponse {
                accepted: false,
                reason: "node has been rejected".into(),
                ..Default::default()
            });
        }
        if request.node_info.node_type != NodeType::Compute {
            return Ok(HandshakeResponse {
                accepted: false,
                reason: "node is not a compute node".into(),
                ..Default::default()
            });
        }

        let now = Utc::now();
        let (previous, membership, last_compute_seq_num, starting_orchestrator_seq_num) =
            match &existing {
                Some(node) => {
                    let previous = if shared.is_stale(node) {
                        ConnectionState::Disconnected
                    } else {
                        node.status
                    };
                    (
                        previous,
                        node.membership,
                        node.last_compute_seq_num,
                        node.last_orchestrator_seq_num,
                    )
                }
                None => (
                    ConnectionState::Disconnected,
                    shared.config.default_membership,
                    0,
                    shared.event_store.latest_seq_num()?,
                ),
            };

        shared.nodes.insert(
            node_id.clone(),
            NodeState {
                available_capacity: request.node_info.available_capacity,
                queue_used_capacity: request.node_info.queue_used_capacity,
                info: request.node_info,
                membership,
                status: ConnectionState::Connected,
                connected_since: Some(now),
                disconnected_since: None,
                last_heartbeat: now,
                last_error: None,
                last_orchestrator_seq_num: starting_orchestrator_seq_num,
                last_compute_seq_num,
            },
        );
        shared.notify(&node_id, previous, ConnectionState::Connected);

        let reconnect = existing.is_some();
        info!(node_id = %node_id, reconnect, starting_orchestrator_seq_num, last_compute_seq_num, "handshake successful");
        Ok(HandshakeResponse {
            accepted: true,
            reason: if reconnect {
                "node reconnected".into()
            } else {
                "node registered".into()
            },
            last_compute_seq_num,
            starting_orchestrator_seq_num,
        })
    }

    async fn heartbeat(
        &self,
        request: HeartbeatRequest,
        last_compute_seq_num: u64,
    ) -> Result<HeartbeatResponse, ProtocolError> {
        let mut node = self
            .shared
            .nodes
            .get_mut(&request.node_id)
            .ok_or_else(|| Self::handshake_required(&request.node_id))?;
        if node.status != ConnectionState::Connected {
            return Err(Self::handshake_required(&request.node_id));
        }
        node.last_heartbeat = Utc::now();
        node.available_capacity = request.available_capacity;
        node.queue_used_capacity = request.queue_used_capacity;
        node.update_sequence_numbers(request.last_orchestrator_seq_num, last_compute_seq_num);
        Ok(HeartbeatResponse {
            last_compute_seq_num: node.last_compute_seq_num,
        })
    }

    async fn update_node_info(
        &self,
        request: UpdateNodeInfoRequest,
    ) -> Result<UpdateNodeInfoResponse, ProtocolError> {
        let node_id = request.node_info.node_id.clone();
        let mut node = self
            .shared
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| Self::handshake_required(&node_id))?;
        if node.membership == Membership::Rejected {
            return Ok(UpdateNodeInfoResponse {
                accepted: false,
                reason: "node registration rejected".into(),
            });
        }
        node.info = request.node_info;
        Ok(UpdateNodeInfoResponse {
            accepted: true,
            reason: String::new(),
        })
    }

    async fn shutdown_notice(
        &self,
        request: ShutdownNoticeRequest,
        last_compute_seq_num: u64,
    ) -> Result<ShutdownNoticeResponse, ProtocolError> {
        let last_compute_seq_num = {
            let mut node = self
                .shared
                .nodes
                .get_mut(&request.node_id)
                .ok_or_else(|| Self::handshake_required(&request.node_id))?;
            if node.status != ConnectionState::Connected {
                return Err(Self::handshake_required(&request.node_id));
            }
            node.update_sequence_numbers(request.last_orchestrator_seq_num, last_compute_seq_num);
            node.disconnect("graceful shutdown");
            node.last_compute_seq_num
        };
        info!(
            node_id = %request.node_id,
            reason = %request.reason,
            last_orchestrator_seq_num = request.last_orchestrator_seq_num,
            last_compute_seq_num,
            "node shutdown notice received"
        );
        self.shared.notify(
            &request.node_id,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        );
        Ok(ShutdownNoticeResponse {
            last_compute_seq_num,
        })
    }

    fn on_connection_state_change(&self, handler: NodeConnectionHandler) {
        self.shared.handlers.write().push(handler);
    }
}
