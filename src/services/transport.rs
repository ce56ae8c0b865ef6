use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domains::envelope::Envelope;
use crate::error::{Result, WalletBridgeError};
use crate::interfaces::transport::{Transport, TransportEvent};

struct Inbox {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl Inbox {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
        })
    }

    fn deliver(&self, event: TransportEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

/// In-process extension port: two linked endpoints with FIFO delivery and
/// an explicit disconnect notice, in the manner of `runtime.connect()`.
pub struct MemoryPort {
    name: String,
    local: Arc<Inbox>,
    remote: Arc<Inbox>,
    closed: Arc<AtomicBool>,
}

/// Creates both ends of a port.
pub fn port_pair(name: &str) -> (MemoryPort, MemoryPort) {
    let left = Inbox::new();
    let right = Inbox::new();
    let closed = Arc::new(AtomicBool::new(false));
    (
        MemoryPort {
            name: name.to_string(),
            local: left.clone(),
            remote: right.clone(),
            closed: closed.clone(),
        },
        MemoryPort {
            name: name.to_string(),
            local: right,
            remote: left,
            closed,
        },
    )
}

impl MemoryPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tears the port down; the other endpoint observes `Disconnected`.
    pub fn disconnect(&self) {
        Transport::disconnect(self);
    }
}

impl Drop for MemoryPort {
    fn drop(&mut self) {
        Transport::disconnect(self);
    }
}

#[async_trait]
impl Transport for MemoryPort {
    async fn post(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(WalletBridgeError::Disconnected);
        }
        self.remote.deliver(TransportEvent::Message(envelope));
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.is_closed() {
            let _ = tx.send(TransportEvent::Disconnected);
        } else if let Ok(mut subscribers) = self.local.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(port = %self.name, "port disconnected");
        self.remote.deliver(TransportEvent::Disconnected);
    }
}
