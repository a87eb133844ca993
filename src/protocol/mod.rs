//! The `protocol` module holds what the worker and orchestrator sides share:
//! control messages, subject layout, connection state, sequence tracking and
//! the collaborator traits both sides consume.

pub mod connection;
pub mod messages;
pub mod sequence;
pub mod subjects;

use std::sync::Arc;

pub use connection::{ConnectionHealth, ConnectionState, ConnectionStateHandler};
pub use sequence::SequenceTracker;

pub use crate::dispatcher::MessageCreator;
pub use crate::messaging::MessageHandler;
pub use crate::watcher::Checkpointer;

use crate::utils::error::ProtocolError;
use messages::NodeInfo;

/// Supplies the local node's current description.
pub trait NodeInfoProvider: Send + Sync {
    fn node_info(&self) -> NodeInfo;
}

impl<F> NodeInfoProvider for F
where
    F: Fn() -> NodeInfo + Send + Sync,
{
    fn node_info(&self) -> NodeInfo {
        (self)()
    }
}

/// Builds the message creator for one worker's outbound stream.
pub trait MessageCreatorFactory: Send + Sync {
    fn create_message_creator(&self, node_id: &str)
    -> Result<Arc<dyn MessageCreator>, ProtocolError>;
}
