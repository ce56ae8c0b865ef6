use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Result, WalletBridgeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Sent,
    AwaitingResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Resolved,
    Rejected,
    TimedOut,
    Disconnected,
}

impl Terminal {
    fn of(outcome: &Result<Value>) -> Self {
        match outcome {
            Ok(_) => Self::Resolved,
            Err(WalletBridgeError::Timeout { .. }) => Self::TimedOut,
            Err(WalletBridgeError::Disconnected) => Self::Disconnected,
            Err(_) => Self::Rejected,
        }
    }
}

struct PendingRequest {
    method: String,
    created_at: Instant,
    state: RequestState,
    responder: oneshot::Sender<Result<Value>>,
}

/// Outstanding requests of one messenger. An entry leaves the table
/// exactly once, through `settle`, `close` or `cancel`.
pub struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
    limit: usize,
    closed: bool,
}

impl PendingTable {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            limit,
            closed: false,
        }
    }

    pub fn insert(
        &mut self,
        id: u64,
        method: &str,
        responder: oneshot::Sender<Result<Value>>,
    ) -> Result<()> {
        if self.closed {
            return Err(WalletBridgeError::Disconnected);
        }
        if self.entries.len() >= self.limit {
            return Err(WalletBridgeError::TooManyPending(self.limit));
        }
        if self.entries.contains_key(&id) {
            return Err(WalletBridgeError::Runtime(format!(
                "request id {id} is still outstanding"
            )));
        }
        self.entries.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                created_at: Instant::now(),
                state: RequestState::Created,
                responder,
            },
        );
        Ok(())
    }

    pub fn advance(&mut self, id: u64, state: RequestState) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state = state;
        }
    }

    pub fn state(&self, id: u64) -> Option<RequestState> {
        self.entries.get(&id).map(|entry| entry.state)
    }

    /// Completes `id` with `outcome`. Returns `None` when the request was
    /// already finished, so a late duplicate can never resolve it twice.
    pub fn settle(&mut self, id: u64, outcome: Result<Value>) -> Option<(Terminal, String, Duration)> {
        let entry = self.entries.remove(&id)?;
        let terminal = Terminal::of(&outcome);
        let elapsed = entry.created_at.elapsed();
        let _ = entry.responder.send(outcome);
        Some((terminal, entry.method, elapsed))
    }

    /// Drops `id` without notifying anyone (caller gave up locally).
    pub fn cancel(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Rejects everything with `Disconnected` and refuses new entries.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        let drained: Vec<_> = self.entries.drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.responder.send(Err(WalletBridgeError::Disconnected));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settles_exactly_once() {
        let mut table = PendingTable::new(4);
        let (tx, mut rx) = oneshot::channel();
        table.insert(1, "ping", tx).unwrap();
        table.advance(1, RequestState::AwaitingResponse);
        assert_eq!(table.state(1), Some(RequestState::AwaitingResponse));

        let first = table.settle(1, Ok(json!("pong")));
        assert_eq!(first.map(|(terminal, _, _)| terminal), Some(Terminal::Resolved));
        assert!(table.settle(1, Err(WalletBridgeError::Disconnected)).is_none());
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!("pong"));
    }

    #[test]
    fn enforces_the_cap_and_id_uniqueness() {
        let mut table = PendingTable::new(1);
        let (tx, _rx) = oneshot::channel();
        table.insert(1, "a", tx).unwrap();
        let (tx, _rx2) = oneshot::channel();
        assert!(matches!(
            table.insert(2, "b", tx),
            Err(WalletBridgeError::TooManyPending(1))
        ));

        let mut table = PendingTable::new(4);
        let (tx, _rx) = oneshot::channel();
        table.insert(1, "a", tx).unwrap();
        let (tx, _rx2) = oneshot::channel();
        assert!(table.insert(1, "a", tx).is_err());
    }

    #[test]
    fn close_rejects_everything_with_disconnected() {
        let mut table = PendingTable::new(4);
        let (tx, mut rx) = oneshot::channel();
        table.insert(1, "a", tx).unwrap();
        assert_eq!(table.close(), 1);
        assert!(rx.try_recv().unwrap().unwrap_err().is_disconnected());
        let (tx, _rx) = oneshot::channel();
        assert!(table
            .insert(2, "b", tx)
            .unwrap_err()
            .is_disconnected());
    }
}
