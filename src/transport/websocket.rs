//! WebSocket transport
//!
//! The server side accepts websocket connections, registers a broker
//! `Client` per connection and maps JSON `ClientFrame`s onto broker
//! operations, pushing matched packets back as `ServerFrame::Message`.
//! `WsTransport` is the matching client-side `Transport`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use super::message::{ClientFrame, ServerFrame};
use super::{Subscription, Transport, TransportFactory};
use crate::broker::{Delivery, Packet, SharedBroker};
use crate::client::Client;
use crate::utils::error::TransportError;

/// Binds `addr` and serves websocket clients until the listener fails.
pub async fn start_websocket_server(addr: &str, broker: SharedBroker) -> Result<(), TransportError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| TransportError::Connect(format!("can't bind {addr}: {e}")))?;
    info!("WebSocket broker listening on ws://{addr}");
    serve(listener, broker).await;
    Ok(())
}

pub async fn serve(listener: TcpListener, broker: SharedBroker) {
    while let Ok((stream, peer)) = listener.accept().await {
        let broker = broker.clone();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, "WebSocket handshake error: {e}");
                    return;
                }
            };
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
            let client = Client::new(tx);
            let client_id = client.id.clone();
            broker.lock().register_client(client);

            // broker sid -> sid chosen by the remote client
            let remote_sids: Arc<DashMap<u64, u64>> = Arc::new(DashMap::new());

            let send_loop = {
                let client_id = client_id.clone();
                let remote_sids = remote_sids.clone();
                spawn(async move {
                    while let Some(Delivery { sid, packet }) = rx.recv().await {
                        let Some(remote_sid) = remote_sids.get(&sid).map(|s| *s) else {
                            continue;
                        };
                        let frame = ServerFrame::Message {
                            sid: remote_sid,
                            subject: packet.subject,
                            reply: packet.reply,
                            data: packet.data,
                            no_responders: packet.no_responders,
                        };
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to serialize frame: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
                            debug!(%client_id, "Failed to send message: {e}");
                            break;
                        }
                    }
                    debug!(%client_id, "Send loop closed");
                })
            };

            let mut local_sids: HashMap<u64, u64> = HashMap::new();
            while let Some(Ok(msg)) = ws_receiver.next().await {
                let Ok(text) = msg.to_text() else { continue };
                if text.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ClientFrame>(text) {
                    Ok(ClientFrame::Subscribe { sid, subject }) => {
                        let result = broker.lock().subscribe(&subject, &client_id);
                        match result {
                            Ok(broker_sid) => {
                                remote_sids.insert(broker_sid, sid);
                                local_sids.insert(sid, broker_sid);
                            }
                            Err(e) => warn!(%client_id, %subject, "subscribe failed: {e}"),
                        }
                    }
                    Ok(ClientFrame::Unsubscribe { sid }) => {
                        if let Some(broker_sid) = local_sids.remove(&sid) {
                            broker.lock().unsubscribe(broker_sid);
                            remote_sids.remove(&broker_sid);
                        }
                    }
                    Ok(ClientFrame::Publish {
                        subject,
                        reply,
                        data,
                    }) => {
                        let packet = Packet {
                            subject,
                            reply,
                            data,
                            no_responders: false,
                        };
                        if let Err(e) = broker.lock().publish(packet) {
                            debug!(%client_id, "publish failed: {e}");
                        }
                    }
                    Err(err) => {
                        warn!(
                            %client_id,
                            "Invalid client frame: {err} | {}",
                            text.chars().take(100).collect::<String>()
                        );
                    }
                }
            }

            broker.lock().cleanup_client(&client_id);
            send_loop.abort();
            debug!(%client_id, "disconnected");
        });
    }
}

type Routes = Arc<DashMap<u64, mpsc::UnboundedSender<Packet>>>;

/// Client side of the websocket broker.
#[derive(Debug)]
pub struct WsTransport {
    outgoing: mpsc::UnboundedSender<WsMessage>,
    routes: Routes,
    next_sid: AtomicU64,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<WsMessage>();
        let routes: Routes = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        {
            let cancel = cancel.clone();
            spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                        msg = outgoing_rx.recv() => {
                            let Some(msg) = msg else { break };
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        {
            let routes = routes.clone();
            let closed = closed.clone();
            let cancel = cancel.clone();
            spawn(async move {
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => break,
                        msg = stream.next() => msg,
                    };
                    let Some(Ok(msg)) = msg else { break };
                    let Ok(text) = msg.to_text() else { continue };
                    if text.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ServerFrame>(text) {
                        Ok(ServerFrame::Message {
                            sid,
                            subject,
                            reply,
                            data,
                            no_responders,
                        }) => {
                            if let Some(route) = routes.get(&sid) {
                                let _ = route.send(Packet {
                                    subject,
                                    reply,
                                    data,
                                    no_responders,
                                });
                            }
                        }
                        Ok(ServerFrame::Error { message }) => warn!("broker error: {message}"),
                        Err(e) => warn!("Invalid server frame: {e}"),
                    }
                }
                closed.store(true, Ordering::SeqCst);
                routes.clear();
                debug!("websocket read loop closed");
            });
        }

        Ok(Self {
            outgoing,
            routes,
            next_sid: AtomicU64::new(0),
            closed,
            cancel,
        })
    }

    fn send_frame(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let text =
            serde_json::to_string(frame).map_err(|e| TransportError::WebSocket(e.to_string()))?;
        self.outgoing
            .send(WsMessage::text(text))
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn publish(&self, packet: Packet) -> Result<(), TransportError> {
        crate::broker::validate_subject(&packet.subject)?;
        self.send_frame(&ClientFrame::Publish {
            subject: packet.subject,
            reply: packet.reply,
            data: packet.data,
        })
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        crate::broker::SubjectPattern::parse(subject)?;
        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(sid, tx);
        if let Err(e) = self.send_frame(&ClientFrame::Subscribe {
            sid,
            subject: subject.to_string(),
        }) {
            self.routes.remove(&sid);
            return Err(e);
        }

        let routes = self.routes.clone();
        let outgoing = self.outgoing.clone();
        Ok(Subscription::new(subject, rx, move || {
            routes.remove(&sid);
            if let Ok(text) = serde_json::to_string(&ClientFrame::Unsubscribe { sid }) {
                let _ = outgoing.send(WsMessage::text(text));
            }
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.routes.clear();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Dials a websocket broker at `url` for every new connection.
#[derive(Debug, Clone)]
pub struct WsTransportFactory {
    url: String,
}

impl WsTransportFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(WsTransport::connect(&self.url).await?))
    }
}
