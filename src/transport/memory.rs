use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{Subscription, Transport, TransportFactory};
use crate::broker::{Delivery, Packet, SharedBroker};
use crate::client::Client;
use crate::utils::error::TransportError;

type Routes = Arc<DashMap<u64, mpsc::UnboundedSender<Packet>>>;

/// A connection to an in-process broker.
///
/// Must be created inside a tokio runtime: a background task fans broker
/// deliveries out to the matching `Subscription`s.
#[derive(Debug)]
pub struct MemoryTransport {
    client_id: String,
    broker: SharedBroker,
    routes: Routes,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl MemoryTransport {
    pub fn connect(broker: SharedBroker) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let client = Client::new(tx);
        let client_id = client.id.clone();
        broker.lock().register_client(client);

        let routes: Routes = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();
        {
            let routes = routes.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        delivery = rx.recv() => {
                            let Some(Delivery { sid, packet }) = delivery else { break };
                            if let Some(route) = routes.get(&sid) {
                                let _ = route.send(packet);
                            }
                        }
                    }
                }
                routes.clear();
            });
        }

        Self {
            client_id,
            broker,
            routes,
            closed: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, packet: Packet) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.lock().publish(packet).map(|_| ())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        let sid = self.broker.lock().subscribe(subject, &self.client_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(sid, tx);
        trace!(sid, subject, client_id = %self.client_id, "memory subscription");

        let broker = Arc::downgrade(&self.broker);
        let routes = self.routes.clone();
        Ok(Subscription::new(subject, rx, move || {
            routes.remove(&sid);
            if let Some(broker) = broker.upgrade() {
                broker.lock().unsubscribe(sid);
            }
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker.lock().cleanup_client(&self.client_id);
        self.cancel.cancel();
        self.routes.clear();
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.lock().cleanup_client(&self.client_id);
            self.cancel.cancel();
        }
    }
}

/// Connects `MemoryTransport`s to one shared broker.
#[derive(Debug, Clone)]
pub struct MemoryTransportFactory {
    broker: SharedBroker,
}

impl MemoryTransportFactory {
    pub fn new(broker: SharedBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        if self.broker.lock().is_paused() {
            return Err(TransportError::Connect("broker unavailable".into()));
        }
        Ok(Arc::new(MemoryTransport::connect(self.broker.clone())))
    }
}
