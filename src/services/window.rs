use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::domains::envelope::{ContextName, Envelope};
use crate::error::{Result, WalletBridgeError};
use crate::interfaces::transport::{Transport, TransportEvent};

/// The page's `postMessage` bus. Anything running in the page can post
/// arbitrary JSON, and every listener (the poster included) sees it.
pub struct WindowBus {
    listeners: Mutex<Vec<mpsc::UnboundedSender<Value>>>,
}

impl WindowBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn post_message(&self, message: Value) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }

    pub fn add_listener(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(tx);
        }
        rx
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WindowBody {
    Envelope { envelope: Envelope },
    PortClosed,
}

/// Wire shape of bridge traffic on the window bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowMessage {
    pub namespace: String,
    pub origin: ContextName,
    pub body: WindowBody,
}

impl WindowMessage {
    pub fn envelope(namespace: &str, origin: ContextName, envelope: Envelope) -> Self {
        Self {
            namespace: namespace.to_string(),
            origin,
            body: WindowBody::Envelope { envelope },
        }
    }

    pub fn port_closed(namespace: &str, origin: ContextName) -> Self {
        Self {
            namespace: namespace.to_string(),
            origin,
            body: WindowBody::PortClosed,
        }
    }

    /// Parses a raw bus message, returning `None` for foreign traffic.
    pub fn parse(raw: &Value, namespace: &str) -> Option<Self> {
        if raw.get("namespace").and_then(Value::as_str) != Some(namespace) {
            return None;
        }
        serde_json::from_value(raw.clone()).ok()
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| WalletBridgeError::Serialization(e.to_string()))
    }
}

/// Page-realm endpoint over the window bus, used by the inpage provider.
/// Only accepts messages posted by `peer` under the shared namespace.
pub struct WindowTransport {
    bus: Arc<WindowBus>,
    namespace: String,
    local: ContextName,
    peer: ContextName,
    closed: Arc<AtomicBool>,
}

impl WindowTransport {
    pub fn new(bus: Arc<WindowBus>, namespace: &str, local: ContextName, peer: ContextName) -> Self {
        Self {
            bus,
            namespace: namespace.to_string(),
            local,
            peer,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for WindowTransport {
    async fn post(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(WalletBridgeError::Disconnected);
        }
        let message = WindowMessage::envelope(&self.namespace, self.local, envelope);
        self.bus.post_message(message.to_value()?);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut raw_rx = self.bus.add_listener();
        let namespace = self.namespace.clone();
        let peer = self.peer;
        let closed = self.closed.clone();
        tokio::spawn(async move {
            while let Some(raw) = raw_rx.recv().await {
                let Some(message) = WindowMessage::parse(&raw, &namespace) else {
                    continue;
                };
                if message.origin != peer {
                    trace!(origin = %message.origin, "ignoring window message from non-peer origin");
                    continue;
                }
                let event = match message.body {
                    WindowBody::Envelope { envelope } => TransportEvent::Message(envelope),
                    WindowBody::PortClosed => {
                        closed.store(true, Ordering::SeqCst);
                        TransportEvent::Disconnected
                    }
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::envelope::Channel;
    use serde_json::json;

    #[tokio::test]
    async fn transport_only_surfaces_peer_messages() {
        let bus = WindowBus::new();
        let transport =
            WindowTransport::new(bus.clone(), "ns", ContextName::Inpage, ContextName::ContentScript);
        let mut rx = transport.subscribe();

        bus.post_message(json!({"hello": "page"}));
        transport
            .post(Envelope::event(Channel::BACKGROUND_INPAGE, "own", json!(1)))
            .await
            .unwrap();
        let from_bridge = WindowMessage::envelope(
            "ns",
            ContextName::ContentScript,
            Envelope::event(Channel::BACKGROUND_INPAGE, "relayed", json!(2)),
        );
        bus.post_message(from_bridge.to_value().unwrap());

        match rx.recv().await.unwrap() {
            TransportEvent::Message(envelope) => assert_eq!(envelope.method, "relayed"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn port_closed_notice_disconnects() {
        let bus = WindowBus::new();
        let transport =
            WindowTransport::new(bus.clone(), "ns", ContextName::Inpage, ContextName::ContentScript);
        let mut rx = transport.subscribe();
        bus.post_message(
            WindowMessage::port_closed("ns", ContextName::ContentScript)
                .to_value()
                .unwrap(),
        );
        assert!(matches!(rx.recv().await, Some(TransportEvent::Disconnected)));
        assert!(transport.is_closed());
    }
}
