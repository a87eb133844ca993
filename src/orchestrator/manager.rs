use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::config::{Collaborators, Config};
use super::data_plane::DataPlane;
use super::nodes::NodeConnectionEvent;
use crate::envelope::{Message, PayloadType};
use crate::messaging::Responder;
use crate::protocol::messages::{
    HandshakeRequest, HeartbeatRequest, ShutdownNoticeRequest, UpdateNodeInfoRequest,
};
use crate::protocol::{ConnectionState, subjects};
use crate::transport::Transport;
use crate::utils::error::{ProtocolError, TransportError};

fn request_payload<T: PayloadType + Clone>(message: &Message) -> Result<T, ProtocolError> {
    message
        .get_payload::<T>()
        .cloned()
        .ok_or_else(|| ProtocolError::UnexpectedRequest {
            expected: T::TYPE.into(),
            got: message.message_type().into(),
        })
}

struct Inner {
    config: Config,
    collaborators: Collaborators,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    data_planes: DashMap<String, Arc<DataPlane>>,
}

/// Orchestrator side of every worker connection.
///
/// One responder on the control wildcard serves handshakes, heartbeats,
/// node info updates and shutdown notices from all workers. An accepted
/// handshake gets the worker its own `DataPlane`; a worker the node manager
/// declares disconnected loses it.
pub struct ComputeManager {
    inner: Arc<Inner>,
    responder: tokio::sync::Mutex<Option<Responder>>,
}

impl ComputeManager {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self, ProtocolError> {
        config.validate()?;
        let inner = Arc::new(Inner {
            config,
            collaborators,
            transport: RwLock::new(None),
            data_planes: DashMap::new(),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .collaborators
            .node_manager
            .on_connection_state_change(Arc::new(move |event: NodeConnectionEvent| {
                handle_connection_state_change(&weak, event)
            }));

        Ok(Self {
            inner,
            responder: tokio::sync::Mutex::new(None),
        })
    }

    /// Connects to the broker and starts answering control requests.
    pub async fn start(&self) -> Result<(), ProtocolError> {
        let mut responder = self.responder.lock().await;
        if responder.is_some() {
            return Err(ProtocolError::AlreadyRunning("compute manager".into()));
        }

        let transport = self.inner.collaborators.transport_factory.connect().await?;
        let control = match Responder::new(
            "orchestrator-control",
            transport.clone(),
            self.inner.collaborators.serializer.clone(),
            &subjects::orchestrator_in_ctrl(),
        )
        .await
        {
            Ok(control) => control,
            Err(e) => {
                transport.close().await;
                return Err(e.into());
            }
        };

        let inner = self.inner.clone();
        control.listen(
            HandshakeRequest::TYPE,
            Arc::new(move |request: Message| {
                let inner = inner.clone();
                async move { inner.handle_handshake(request).await }
            }),
        )?;
        let inner = self.inner.clone();
        control.listen(
            HeartbeatRequest::TYPE,
            Arc::new(move |request: Message| {
                let inner = inner.clone();
                async move { inner.handle_heartbeat(request).await }
            }),
        )?;
        let inner = self.inner.clone();
        control.listen(
            UpdateNodeInfoRequest::TYPE,
            Arc::new(move |request: Message| {
                let inner = inner.clone();
                async move { inner.handle_node_info_update(request).await }
            }),
        )?;
        let inner = self.inner.clone();
        control.listen(
            ShutdownNoticeRequest::TYPE,
            Arc::new(move |request: Message| {
                let inner = inner.clone();
                async move { inner.handle_shutdown_notice(request).await }
            }),
        )?;

        *self.inner.transport.write() = Some(transport);
        *responder = Some(control);
        info!("compute manager started");
        Ok(())
    }

    /// Stops answering requests, then stops every data plane and closes the
    /// connection. Idempotent.
    pub async fn stop(&self) {
        let responder = self.responder.lock().await.take();
        let Some(responder) = responder else {
            return;
        };
        responder.close().await;

        let node_ids: Vec<String> = self
            .inner
            .data_planes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for node_id in node_ids {
            if let Some((_, data_plane)) = self.inner.data_planes.remove(&node_id) {
                data_plane.stop(self.inner.config.stop_timeout).await;
            }
        }

        let transport = self.inner.transport.write().take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        info!("compute manager stopped");
    }

    pub fn data_plane(&self, node_id: &str) -> Option<Arc<DataPlane>> {
        self.inner.data_plane(node_id)
    }

    pub fn data_plane_count(&self) -> usize {
        self.inner.data_planes.len()
    }
}

fn handle_connection_state_change(inner: &Weak<Inner>, event: NodeConnectionEvent) {
    if event.current != ConnectionState::Disconnected {
        return;
    }
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let Some((_, data_plane)) = inner.data_planes.remove(&event.node_id) else {
        return;
    };
    info!(node_id = %event.node_id, "node disconnected, stopping its data plane");

    let timeout = inner.config.stop_timeout;
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { data_plane.stop(timeout).await });
        }
        Err(_) => error!(node_id = %event.node_id, "no runtime to stop data plane on"),
    }
}

impl Inner {
    fn data_plane(&self, node_id: &str) -> Option<Arc<DataPlane>> {
        self.data_planes.get(node_id).map(|dp| dp.value().clone())
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, ProtocolError> {
        self.transport
            .read()
            .clone()
            .ok_or(ProtocolError::Transport(TransportError::Closed))
    }

    async fn handle_handshake(&self, request: Message) -> Result<Message, ProtocolError> {
        let request: HandshakeRequest = request_payload(&request)?;
        let node_id = request.node_info.node_id.clone();
        let last_orchestrator_seq_num = request.last_orchestrator_seq_num;

        let response = self
            .collaborators
            .node_manager
            .handshake(request)
            .await?;
        if !response.accepted {
            info!(node_id = %node_id, reason = %response.reason, "handshake rejected");
            return Ok(Message::new(response));
        }

        self.setup_data_plane(&node_id, last_orchestrator_seq_num)
            .await
            .map_err(|e| {
                error!(node_id = %node_id, error = %e, "failed to set up data plane");
                e
            })?;
        Ok(Message::new(response))
    }

    /// Replaces any data plane the node already has. The old one is stopped
    /// first so the two never consume the node's stream at the same time.
    async fn setup_data_plane(&self, node_id: &str, start_seq_num: u64) -> Result<(), ProtocolError> {
        if let Some((_, existing)) = self.data_planes.remove(node_id) {
            debug!(node_id, "replacing existing data plane");
            existing.stop(self.config.stop_timeout).await;
        }

        let data_plane = DataPlane::start(
            node_id,
            &self.config,
            &self.collaborators,
            self.transport()?,
            start_seq_num,
        )
        .await?;

        if let Some(raced) = self
            .data_planes
            .insert(node_id.to_string(), Arc::new(data_plane))
        {
            warn!(node_id, "concurrent handshake replaced a data plane");
            raced.stop(self.config.stop_timeout).await;
        }
        Ok(())
    }

    async fn handle_heartbeat(&self, request: Message) -> Result<Message, ProtocolError> {
        let request: HeartbeatRequest = request_payload(&request)?;
        let data_plane = self
            .data_plane(&request.node_id)
            .ok_or_else(|| ProtocolError::NoActiveDataPlane(request.node_id.clone()))?;

        let response = self
            .collaborators
            .node_manager
            .heartbeat(request, data_plane.last_processed_seq_num())
            .await?;
        Ok(Message::new(response))
    }

    async fn handle_node_info_update(&self, request: Message) -> Result<Message, ProtocolError> {
        let request: UpdateNodeInfoRequest = request_payload(&request)?;
        let node_id = &request.node_info.node_id;
        if !self.data_planes.contains_key(node_id) {
            return Err(ProtocolError::NoActiveDataPlane(node_id.clone()));
        }

        let response = self
            .collaborators
            .node_manager
            .update_node_info(request)
            .await?;
        Ok(Message::new(response))
    }

    async fn handle_shutdown_notice(&self, request: Message) -> Result<Message, ProtocolError> {
        let request: ShutdownNoticeRequest = request_payload(&request)?;
        let node_id = request.node_id.clone();
        let last_compute_seq_num = self
            .data_plane(&node_id)
            .map_or(0, |dp| dp.last_processed_seq_num());

        let response = self
            .collaborators
            .node_manager
            .shutdown_notice(request, last_compute_seq_num)
            .await?;

        if let Some((_, data_plane)) = self.data_planes.remove(&node_id) {
            data_plane.stop(self.config.stop_timeout).await;
        }
        Ok(Message::new(response))
    }
}
