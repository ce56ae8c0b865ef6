use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand_core::{OsRng, RngCore};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::MessengerConfig;
use crate::domains::envelope::{Channel, ContextName, Envelope, EnvelopeKind, SenderMeta};
use crate::error::{Result, RpcError, WalletBridgeError, INTERNAL_ERROR};
use crate::identity::IdentityRegistry;
use crate::interfaces::transport::{Transport, TransportEvent};
use crate::services::pending::{PendingTable, RequestState};

pub type ReplyFuture = BoxFuture<'static, std::result::Result<Value, RpcError>>;
pub type ReplyHandler = Arc<dyn Fn(Value, Option<SenderMeta>) -> ReplyFuture + Send + Sync>;
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Inbound check run before any envelope is dispatched.
#[async_trait]
pub trait EnvelopeGuard: Send + Sync {
    async fn check(&self, envelope: &Envelope) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Shared {
    channel: Channel,
    context: ContextName,
    instance: String,
    transport: Arc<dyn Transport>,
    config: MessengerConfig,
    guard: Option<Arc<dyn EnvelopeGuard>>,
    identity: Option<Arc<IdentityRegistry>>,
    tab_id: Option<u64>,
    next_id: AtomicU64,
    next_listener: AtomicU64,
    pending: Mutex<PendingTable>,
    handlers: RwLock<HashMap<String, ReplyHandler>>,
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener)>>>,
    closed_tx: watch::Sender<bool>,
}

pub struct MessengerBuilder {
    channel: Channel,
    context: ContextName,
    transport: Arc<dyn Transport>,
    config: MessengerConfig,
    guard: Option<Arc<dyn EnvelopeGuard>>,
    identity: Option<Arc<IdentityRegistry>>,
    tab_id: Option<u64>,
}

impl MessengerBuilder {
    pub fn config(mut self, config: MessengerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn guard(mut self, guard: Arc<dyn EnvelopeGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Tags every outbound envelope with the extension identity.
    pub fn identity(mut self, identity: Arc<IdentityRegistry>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn tab_id(mut self, tab_id: u64) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    /// Subscribes to the transport and starts the receive loop.
    pub fn build(self) -> Messenger {
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            channel: self.channel,
            context: self.context,
            instance: instance_id(self.context),
            transport: self.transport,
            pending: Mutex::new(PendingTable::new(self.config.max_pending)),
            config: self.config,
            guard: self.guard,
            identity: self.identity,
            tab_id: self.tab_id,
            next_id: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            closed_tx,
        });
        let inbound = shared.transport.subscribe();
        let task = tokio::spawn(receive_loop(shared.clone(), inbound));
        Messenger { shared, task }
    }
}

fn instance_id(context: ContextName) -> String {
    let mut raw = [0u8; 9];
    OsRng.fill_bytes(&mut raw);
    format!("{context}-{}", BASE64_URL.encode(raw))
}

/// Duplex request/response and publish/subscribe endpoint of one channel.
pub struct Messenger {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Messenger {
    pub fn builder(
        channel: Channel,
        context: ContextName,
        transport: Arc<dyn Transport>,
    ) -> MessengerBuilder {
        MessengerBuilder {
            channel,
            context,
            transport,
            config: MessengerConfig::default(),
            guard: None,
            identity: None,
            tab_id: None,
        }
    }

    pub fn channel(&self) -> Channel {
        self.shared.channel
    }

    pub fn instance(&self) -> &str {
        &self.shared.instance
    }

    /// Sends a request and waits for its single terminal outcome.
    pub async fn send(&self, method: &str, payload: Value) -> Result<Value> {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let timeout = shared.config.request_timeout;
        let (tx, mut rx) = oneshot::channel();
        shared.lock_pending()?.insert(id, method, tx)?;
        let _cancel = CancelOnDrop {
            shared: shared.clone(),
            id,
        };

        let mut envelope = Envelope::request(shared.channel, id, &shared.instance, method, payload);
        shared.tag(&mut envelope).await?;
        shared.transport.post(envelope).await?;
        shared.lock_pending()?.advance(id, RequestState::Sent);
        trace!(channel = %shared.channel, id, method, "request sent");
        shared
            .lock_pending()?
            .advance(id, RequestState::AwaitingResponse);

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(WalletBridgeError::Disconnected),
            Err(_) => {
                let expired = WalletBridgeError::Timeout {
                    method: method.to_string(),
                    after_ms: timeout.as_millis() as u64,
                };
                shared.settle(id, Err(expired));
                // Whichever outcome reached the table first wins.
                rx.try_recv()
                    .unwrap_or(Err(WalletBridgeError::Disconnected))
            }
        }
    }

    /// Registers the handler for `method`, replacing any previous one.
    pub fn reply<F, Fut>(&self, method: &str, handler: F) -> bool
    where
        F: Fn(Value, Option<SenderMeta>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, RpcError>> + Send + 'static,
    {
        let handler: ReplyHandler = Arc::new(move |payload, meta| handler(payload, meta).boxed());
        let replaced = self
            .shared
            .handlers
            .write()
            .map(|mut handlers| handlers.insert(method.to_string(), handler).is_some())
            .unwrap_or(false);
        if replaced {
            debug!(channel = %self.shared.channel, method, "reply handler replaced");
        }
        replaced
    }

    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.shared.listeners.write() {
            listeners
                .entry(event.to_string())
                .or_default()
                .push((id, Arc::new(listener)));
        }
        id
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let Ok(mut listeners) = self.shared.listeners.write() else {
            return false;
        };
        let Some(registered) = listeners.get_mut(event) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(existing, _)| *existing != id);
        before != registered.len()
    }

    /// Publishes an event to every listener on the paired endpoint(s).
    pub async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        let mut envelope = Envelope::event(self.shared.channel, event, payload);
        self.shared.tag(&mut envelope).await?;
        self.shared.transport.post(envelope).await
    }

    pub fn pending_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .map(|pending| pending.len())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    /// Resolves once the remote context has gone away.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct CancelOnDrop {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            if pending.cancel(self.id) {
                trace!(channel = %self.shared.channel, id = self.id, "request abandoned locally");
            }
        }
    }
}

impl Shared {
    fn lock_pending(&self) -> Result<std::sync::MutexGuard<'_, PendingTable>> {
        self.pending
            .lock()
            .map_err(|_| WalletBridgeError::Runtime("pending table poisoned".to_string()))
    }

    fn settle(&self, id: u64, outcome: Result<Value>) {
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        match pending.settle(id, outcome) {
            Some((terminal, method, elapsed)) => debug!(
                channel = %self.channel,
                id,
                method = %method,
                ?terminal,
                elapsed_ms = elapsed.as_millis() as u64,
                "request settled"
            ),
            None => trace!(channel = %self.channel, id, "late outcome dropped"),
        }
    }

    async fn tag(&self, envelope: &mut Envelope) -> Result<()> {
        if let Some(registry) = &self.identity {
            let identity = registry.get().await?;
            envelope.meta = Some(SenderMeta {
                context: self.context,
                tab_id: self.tab_id,
                identity: Some(identity.as_str().to_string()),
                relay_seq: None,
            });
        }
        Ok(())
    }

    fn mark_disconnected(&self) {
        let rejected = self
            .pending
            .lock()
            .map(|mut pending| pending.close())
            .unwrap_or(0);
        self.closed_tx.send_replace(true);
        debug!(channel = %self.channel, rejected, "transport disconnected");
    }

    fn dispatch_response(&self, envelope: Envelope) {
        if envelope.to.as_deref() != Some(self.instance.as_str()) {
            return;
        }
        let Some(id) = envelope.id else {
            return;
        };
        let outcome = match envelope.error {
            Some(err) => Err(WalletBridgeError::from_rpc(err)),
            None => Ok(envelope.payload),
        };
        self.settle(id, outcome);
    }

    fn dispatch_event(&self, envelope: &Envelope) {
        let snapshot: Vec<Listener> = match self.listeners.read() {
            Ok(listeners) => listeners
                .get(&envelope.method)
                .map(|registered| registered.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };
        trace!(channel = %self.channel, event = %envelope.method, listeners = snapshot.len(), "event");
        for listener in snapshot {
            listener(&envelope.payload);
        }
    }

    fn handler_for(&self, method: &str) -> Option<ReplyHandler> {
        self.handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(method).cloned())
    }
}

async fn respond(shared: Arc<Shared>, request: Envelope, outcome: std::result::Result<Value, RpcError>) {
    let mut response = Envelope::response_to(&request, outcome);
    if let Err(err) = shared.tag(&mut response).await {
        warn!(channel = %shared.channel, error = %err, "could not tag response");
        return;
    }
    if let Err(err) = shared.transport.post(response).await {
        debug!(channel = %shared.channel, method = %request.method, error = %err, "response not delivered");
    }
}

async fn receive_loop(shared: Arc<Shared>, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = inbound.recv().await {
        let envelope = match event {
            TransportEvent::Message(envelope) => envelope,
            TransportEvent::Disconnected => break,
        };
        if envelope.channel != shared.channel {
            continue;
        }
        if let Err(err) = envelope.check_shape() {
            warn!(channel = %shared.channel, error = %err, "malformed envelope dropped");
            continue;
        }
        if let Some(guard) = &shared.guard {
            if let Err(err) = guard.check(&envelope).await {
                warn!(channel = %shared.channel, method = %envelope.method, error = %err, "envelope rejected");
                if envelope.kind == EnvelopeKind::Request {
                    tokio::spawn(respond(shared.clone(), envelope, Err(err.to_rpc())));
                }
                continue;
            }
        }
        match envelope.kind {
            EnvelopeKind::Request => {
                // Another endpoint on the same bus may own this method.
                let Some(handler) = shared.handler_for(&envelope.method) else {
                    trace!(channel = %shared.channel, method = %envelope.method, "no handler");
                    continue;
                };
                let shared = shared.clone();
                tokio::spawn(async move {
                    let running = handler(envelope.payload.clone(), envelope.meta.clone());
                    let outcome = match AssertUnwindSafe(running).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!(channel = %shared.channel, method = %envelope.method, "reply handler panicked");
                            Err(RpcError::new(INTERNAL_ERROR, "request handler failed"))
                        }
                    };
                    respond(shared, envelope, outcome).await;
                });
            }
            EnvelopeKind::Response => shared.dispatch_response(envelope),
            EnvelopeKind::Event => shared.dispatch_event(&envelope),
        }
    }
    shared.mark_disconnected();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::transport::port_pair;
    use serde_json::json;
    use std::time::Duration;

    fn pair(timeout_ms: u64) -> (Messenger, Messenger) {
        let (left, right) = port_pair("test");
        let config = MessengerConfig::default().with_timeout(Duration::from_millis(timeout_ms));
        let background = Messenger::builder(
            Channel::BACKGROUND_CONTENT_SCRIPT,
            ContextName::Background,
            Arc::new(left),
        )
        .config(config.clone())
        .build();
        let content = Messenger::builder(
            Channel::BACKGROUND_CONTENT_SCRIPT,
            ContextName::ContentScript,
            Arc::new(right),
        )
        .config(config)
        .build();
        (background, content)
    }

    #[tokio::test]
    async fn reply_replaces_instead_of_stacking() {
        let (background, content) = pair(1_000);
        assert!(!background.reply("ping", |_, _| async { Ok(json!("first")) }));
        assert!(background.reply("ping", |_, _| async { Ok(json!("second")) }));
        assert_eq!(content.send("ping", Value::Null).await.unwrap(), json!("second"));
    }

    #[tokio::test]
    async fn off_removes_only_that_listener() {
        let (background, content) = pair(1_000);
        let hits = Arc::new(AtomicU64::new(0));
        let a = hits.clone();
        let first = content.on("tick", move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let b = hits.clone();
        content.on("tick", move |_| {
            b.fetch_add(10, Ordering::SeqCst);
        });
        assert!(content.off("tick", first));
        assert!(!content.off("tick", first));

        background.emit("tick", Value::Null).await.unwrap();
        content.reply("sync", |_, _| async { Ok(Value::Null) });
        background.send("sync", Value::Null).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn dropped_send_leaves_no_pending_entry() {
        let (_background, content) = pair(5_000);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            content.send("nobody", Value::Null),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(content.pending_count(), 0);
    }
}
