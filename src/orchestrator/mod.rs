//! The `orchestrator` module is the orchestrator side of the connection.
//!
//! `ComputeManager` answers every worker's control requests and keeps one
//! `DataPlane` per connected worker. Who may connect, and who is still
//! alive, is decided by a `NodeManager`.

pub mod config;
pub mod data_plane;
pub mod manager;
pub mod nodes;

pub use config::{Collaborators, Config};
pub use data_plane::DataPlane;
pub use manager::ComputeManager;
pub use nodes::{
    InMemoryNodeManager, Membership, NodeConnectionEvent, NodeConnectionHandler, NodeManager,
    NodeManagerConfig, NodeState,
};
