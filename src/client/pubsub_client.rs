use tokio::sync::mpsc::UnboundedSender;

use crate::broker::message::Delivery;

pub type ClientId = String;

/// Represents a connection registered with the broker.
///
/// Each client is uniquely identified by an `id` and has a channel (`sender`)
/// the broker pushes matching deliveries into.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for the client.
    pub id: ClientId,

    /// Channel to push deliveries to the client.
    pub sender: UnboundedSender<Delivery>,
}

impl Client {
    pub fn new(sender: UnboundedSender<Delivery>) -> Self {
        Self {
            id: format!("client-{}", uuid::Uuid::new_v4()),
            sender,
        }
    }
}
