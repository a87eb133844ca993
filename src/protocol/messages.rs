use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeType {
    #[default]
    Compute,
    Requester,
}

/// Resource quantities. `cpu` in cores, the rest in bytes or units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Resources {
    pub cpu: f64,
    pub memory: u64,
    pub disk: u64,
    pub gpu: u64,
}

impl Resources {
    pub fn is_zero(&self) -> bool {
        self.cpu == 0.0 && self.memory == 0 && self.disk == 0 && self.gpu == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeInfo {
    pub node_id: String,
    pub node_type: NodeType,
    pub labels: BTreeMap<String, String>,
    pub max_capacity: Resources,
    pub available_capacity: Resources,
    pub queue_used_capacity: Resources,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            ..Default::default()
        }
    }

    /// True if anything other than the live capacity numbers differs.
    /// Heartbeats already carry capacity, so only static changes warrant an
    /// explicit node-info update.
    pub fn has_static_config_changed(&self, other: &NodeInfo) -> bool {
        self.node_id != other.node_id
            || self.node_type != other.node_type
            || self.labels != other.labels
            || self.max_capacity != other.max_capacity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub node_info: NodeInfo,
    pub start_time: DateTime<Utc>,
    pub last_orchestrator_seq_num: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HandshakeResponse {
    pub accepted: bool,
    pub reason: String,
    /// Last worker event the orchestrator has received. The worker resumes
    /// its outbound dispatch after this.
    pub last_compute_seq_num: u64,
    /// Where the orchestrator's outbound stream to this worker resumes.
    pub starting_orchestrator_seq_num: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub available_capacity: Resources,
    pub queue_used_capacity: Resources,
    pub last_orchestrator_seq_num: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HeartbeatResponse {
    pub last_compute_seq_num: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateNodeInfoRequest {
    pub node_info: NodeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpdateNodeInfoResponse {
    pub accepted: bool,
    pub reason: String,
}

/// Sent by a worker that is shutting down cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShutdownNoticeRequest {
    pub node_id: String,
    pub reason: String,
    pub last_orchestrator_seq_num: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShutdownNoticeResponse {
    pub last_compute_seq_num: u64,
}

/// Job-lifecycle change carried on the data plane in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExecutionUpdate {
    pub execution_id: String,
    pub job_id: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Reply sent by a responder whose handler failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl ToString) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}
