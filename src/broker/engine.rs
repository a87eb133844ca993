use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::broker::message::{Delivery, Packet};
use crate::broker::topic::{SubjectPattern, validate_subject};
use crate::client::{Client, ClientId};
use crate::utils::error::TransportError;

pub type SharedBroker = Arc<Mutex<Broker>>;

#[derive(Debug)]
struct Subscription {
    pattern: SubjectPattern,
    client_id: ClientId,
}

/// In-process subject router.
///
/// Clients register a delivery channel, subscribe patterns and publish
/// packets. Routing is fire-and-forget: no ordering across subscribers and
/// nothing is retained for absent subscribers. While paused every publish
/// fails, which is how tests take "the network" down and back up.
#[derive(Debug, Default)]
pub struct Broker {
    clients: HashMap<ClientId, Client>,
    subscriptions: HashMap<u64, Subscription>,
    next_sid: u64,
    paused: bool,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedBroker {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Registers a new client with the broker
    pub fn register_client(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn remove_client(&mut self, client_id: &str) {
        self.clients.remove(client_id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Subscribes a client to a subject pattern and returns the subscription id.
    pub fn subscribe(&mut self, pattern: &str, client_id: &str) -> Result<u64, TransportError> {
        let pattern = SubjectPattern::parse(pattern)?;
        if !self.clients.contains_key(client_id) {
            return Err(TransportError::Closed);
        }
        self.next_sid += 1;
        let sid = self.next_sid;
        trace!(sid, client_id, pattern = pattern.as_str(), "subscribed");
        self.subscriptions.insert(
            sid,
            Subscription {
                pattern,
                client_id: client_id.to_string(),
            },
        );
        Ok(sid)
    }

    pub fn unsubscribe(&mut self, sid: u64) {
        self.subscriptions.remove(&sid);
    }

    /// Delivers `packet` to every matching subscription and returns how many
    /// received it. A request nobody received gets a no-responders status
    /// packet on its reply subject.
    pub fn publish(&self, packet: Packet) -> Result<usize, TransportError> {
        if self.paused {
            return Err(TransportError::Closed);
        }
        validate_subject(&packet.subject)?;

        let delivered = self.route(&packet);
        if delivered == 0 {
            if let Some(reply) = packet.reply.as_deref() {
                debug!(subject = %packet.subject, "no responders");
                self.route(&Packet::no_responders(reply));
            }
        }
        Ok(delivered)
    }

    fn route(&self, packet: &Packet) -> usize {
        let mut delivered = 0;
        for (sid, sub) in &self.subscriptions {
            if !sub.pattern.matches(&packet.subject) {
                continue;
            }
            let Some(client) = self.clients.get(&sub.client_id) else {
                continue;
            };
            let delivery = Delivery {
                sid: *sid,
                packet: packet.clone(),
            };
            match client.sender.send(delivery) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(client_id = %sub.client_id, "failed to deliver, client gone"),
            }
        }
        delivered
    }

    /// Cleans up a client by removing it and all of its subscriptions
    pub fn cleanup_client(&mut self, client_id: &str) {
        self.remove_client(client_id);
        self.subscriptions.retain(|_, sub| sub.client_id != client_id);
        debug!(client_id, "cleaned up client");
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}
