use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::config::Config;
use super::health::HealthTracker;
use crate::envelope::Message;
use crate::messaging::{PublishRequest, Publisher};
use crate::protocol::messages::{
    HeartbeatRequest, HeartbeatResponse, NodeInfo, UpdateNodeInfoRequest, UpdateNodeInfoResponse,
};
use crate::protocol::{NodeInfoProvider, SequenceTracker};
use crate::utils::error::ProtocolError;
use crate::watcher::EventStore;

pub(crate) struct ControlPlaneParams {
    pub config: Config,
    pub requester: Publisher,
    pub health: Arc<HealthTracker>,
    pub node_info_provider: Arc<dyn NodeInfoProvider>,
    pub incoming: Arc<SequenceTracker>,
    pub checkpointer: Arc<dyn EventStore>,
    pub checkpoint_name: String,
}

/// Periodic control traffic while connected: heartbeats, node info updates
/// and checkpoints of the incoming sequence.
pub struct ControlPlane {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ControlPlane {
    pub(crate) fn start(params: ControlPlaneParams) -> Self {
        let cancel = CancellationToken::new();
        let last_checkpoint = params.incoming.last_seq_num();
        let latest_node_info = params.node_info_provider.node_info();
        let worker = Worker {
            params,
            latest_node_info,
            last_checkpoint,
        };
        let task = tokio::spawn(worker.run(cancel.clone()));
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    params: ControlPlaneParams,
    latest_node_info: NodeInfo,
    last_checkpoint: u64,
}

fn ticker(period: std::time::Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        let config = &self.params.config;
        let mut heartbeat = ticker(config.heartbeat_interval);
        let mut node_info = ticker(config.node_info_update_interval);
        let mut checkpoint = ticker(config.checkpoint_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        error!(node_id = %self.params.config.node_id, error = %e, "failed to send heartbeat");
                    }
                }
                _ = node_info.tick() => {
                    if let Err(e) = self.update_node_info().await {
                        error!(node_id = %self.params.config.node_id, error = %e, "failed to update node info");
                    }
                }
                _ = checkpoint.tick() => self.checkpoint_progress(),
            }
        }
        debug!(node_id = %self.params.config.node_id, "control plane stopped");
    }

    async fn request(&self, message: Message) -> Result<Message, ProtocolError> {
        let result = self
            .params
            .requester
            .request(PublishRequest::new(message), self.params.config.request_timeout)
            .await
            .map_err(ProtocolError::from);
        if let Err(e) = &result {
            if e.is_handshake_required() {
                warn!(node_id = %self.params.config.node_id, "orchestrator requires a new handshake");
                self.params.health.mark_handshake_required();
            }
        }
        result
    }

    async fn heartbeat(&mut self) -> Result<(), ProtocolError> {
        let node_info = self.params.node_info_provider.node_info();
        let request = HeartbeatRequest {
            node_id: self.params.config.node_id.clone(),
            available_capacity: node_info.available_capacity,
            queue_used_capacity: node_info.queue_used_capacity,
            last_orchestrator_seq_num: self.params.incoming.last_seq_num(),
        };

        let response = self.request(Message::new(request)).await?;
        if response.get_payload::<HeartbeatResponse>().is_none() {
            return Err(ProtocolError::UnexpectedResponse {
                expected: "HeartbeatResponse".into(),
                got: response.message_type().into(),
            });
        }
        self.params.health.heartbeat_success();
        Ok(())
    }

    /// Sends the node info only when its static parts changed.
    async fn update_node_info(&mut self) -> Result<(), ProtocolError> {
        let current = self.params.node_info_provider.node_info();
        if !self.latest_node_info.has_static_config_changed(&current) {
            return Ok(());
        }
        debug!(node_id = %self.params.config.node_id, "node info changed, sending update");

        let response = self
            .request(Message::new(UpdateNodeInfoRequest {
                node_info: current.clone(),
            }))
            .await?;
        match response.get_payload::<UpdateNodeInfoResponse>() {
            Some(update) if update.accepted => {}
            Some(update) => {
                return Err(ProtocolError::Remote(format!(
                    "node info update rejected: {}",
                    update.reason
                )));
            }
            None => {
                return Err(ProtocolError::UnexpectedResponse {
                    expected: "UpdateNodeInfoResponse".into(),
                    got: response.message_type().into(),
                });
            }
        }
        self.latest_node_info = current;
        self.params.health.update_success();
        Ok(())
    }

    fn checkpoint_progress(&mut self) {
        let seq_num = self.params.incoming.last_seq_num();
        if seq_num == self.last_checkpoint {
            return;
        }
        match self
            .params
            .checkpointer
            .checkpoint(&self.params.checkpoint_name, seq_num)
        {
            Ok(()) => self.last_checkpoint = seq_num,
            Err(e) => error!(
                node_id = %self.params.config.node_id,
                error = %e,
                "failed to checkpoint incoming sequence number"
            ),
        }
    }
}
