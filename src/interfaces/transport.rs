use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domains::envelope::Envelope;
use crate::error::Result;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(Envelope),
    /// The remote context was destroyed; nothing further will arrive.
    Disconnected,
}

/// One endpoint of a message pipe between two contexts.
///
/// Every subscriber receives every inbound event, in arrival order.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, envelope: Envelope) -> Result<()>;
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;
    fn is_closed(&self) -> bool;
    /// Closes this end; the remote end observes `TransportEvent::Disconnected`.
    fn disconnect(&self);
}
