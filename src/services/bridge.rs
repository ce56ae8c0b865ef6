use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::{BridgeConfig, MessengerConfig};
use crate::domains::envelope::{Channel, ContextName, Envelope, EnvelopeKind, SenderMeta};
use crate::error::{Result, WalletBridgeError};
use crate::identity::{IdentityGuard, IdentityRegistry};
use crate::interfaces::transport::{Transport, TransportEvent};
use crate::services::messenger::Messenger;
use crate::services::window::{WindowBody, WindowBus, WindowMessage};

/// Channels the page realm is allowed to address.
pub const PAGE_FACING: [Channel; 1] = [Channel::BACKGROUND_INPAGE];

pub fn is_page_facing(channel: &Channel) -> bool {
    PAGE_FACING.contains(channel)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    ToExtension,
    ToPage,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    Envelope {
        direction: Direction,
        channel: Channel,
        kind: EnvelopeKind,
        id: u64,
        peer: String,
    },
    Relay(u64),
}

impl DedupKey {
    fn for_envelope(direction: Direction, envelope: &Envelope) -> Option<Self> {
        let id = envelope.id?;
        let peer = match envelope.kind {
            EnvelopeKind::Request => envelope.from.clone(),
            EnvelopeKind::Response => envelope.to.clone(),
            EnvelopeKind::Event => None,
        }
        .unwrap_or_default();
        Some(Self::Envelope {
            direction,
            channel: envelope.channel,
            kind: envelope.kind,
            id,
            peer,
        })
    }
}

/// Bounded, short-lived memory of what this bridge already relayed.
struct RecentlyForwarded {
    seen: LruCache<DedupKey, Instant>,
    ttl: Duration,
}

impl RecentlyForwarded {
    fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
            ttl,
        }
    }

    fn contains(&mut self, key: &DedupKey) -> bool {
        match self.seen.get(key) {
            Some(at) if at.elapsed() < self.ttl => true,
            Some(_) => {
                self.seen.pop(key);
                false
            }
            None => false,
        }
    }

    /// Records `key`; returns false when it was seen within the TTL.
    fn first_sighting(&mut self, key: DedupKey) -> bool {
        if self.contains(&key) {
            return false;
        }
        self.seen.put(key, Instant::now());
        true
    }
}

#[derive(Debug, Default)]
pub struct BridgeStats {
    pub to_extension: AtomicU64,
    pub to_page: AtomicU64,
    pub rejected: AtomicU64,
    pub duplicates: AtomicU64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.to_extension.load(Ordering::SeqCst),
            self.to_page.load(Ordering::SeqCst),
            self.rejected.load(Ordering::SeqCst),
            self.duplicates.load(Ordering::SeqCst),
        )
    }
}

struct Relay {
    tab_id: u64,
    namespace: String,
    window: Arc<WindowBus>,
    port: Arc<dyn Transport>,
    identity: Arc<IdentityRegistry>,
    recent: Mutex<RecentlyForwarded>,
    next_seq: AtomicU64,
    stats: Arc<BridgeStats>,
}

/// Content-script side of a tab: relays page-facing envelopes between the
/// window bus and the extension port without looking at their payloads.
pub struct ContentScriptBridge {
    tab_id: u64,
    messenger: Messenger,
    stats: Arc<BridgeStats>,
    tasks: Vec<JoinHandle<()>>,
}

impl ContentScriptBridge {
    pub fn start(
        tab_id: u64,
        window: Arc<WindowBus>,
        port: Arc<dyn Transport>,
        identity: Arc<IdentityRegistry>,
        config: BridgeConfig,
        messenger_config: MessengerConfig,
    ) -> Self {
        let stats = Arc::new(BridgeStats::default());
        let relay = Arc::new(Relay {
            tab_id,
            namespace: config.namespace.clone(),
            window: window.clone(),
            port: port.clone(),
            identity: identity.clone(),
            recent: Mutex::new(RecentlyForwarded::new(
                config.dedup_capacity,
                config.dedup_ttl,
            )),
            next_seq: AtomicU64::new(1),
            stats: stats.clone(),
        });

        let messenger = Messenger::builder(
            Channel::BACKGROUND_CONTENT_SCRIPT,
            ContextName::ContentScript,
            port.clone(),
        )
        .config(messenger_config)
        .identity(identity.clone())
        .guard(Arc::new(IdentityGuard::new(identity)))
        .tab_id(tab_id)
        .build();

        let page_rx = window.add_listener();
        let port_rx = port.subscribe();
        let tasks = vec![
            tokio::spawn(relay.clone().page_to_extension(page_rx)),
            tokio::spawn(relay.extension_to_page(port_rx)),
        ];
        debug!(tab_id, "content script bridge started");

        Self {
            tab_id,
            messenger,
            stats,
            tasks,
        }
    }

    pub fn tab_id(&self) -> u64 {
        self.tab_id
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Liveness check against the background process.
    pub async fn ping(&self) -> Result<Value> {
        self.messenger.send("ping", Value::Null).await
    }
}

impl Drop for ContentScriptBridge {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Relay {
    fn reject(&self, reason: &str) {
        self.stats.rejected.fetch_add(1, Ordering::SeqCst);
        warn!(tab_id = self.tab_id, reason, "page message rejected");
    }

    fn duplicate(&self, envelope: &Envelope) {
        self.stats.duplicates.fetch_add(1, Ordering::SeqCst);
        debug!(
            tab_id = self.tab_id,
            channel = %envelope.channel,
            method = %envelope.method,
            "duplicate envelope not relayed"
        );
    }

    /// Returns the relay sequence for a fresh envelope, or `None` for one
    /// this bridge has already forwarded.
    fn admit(&self, direction: Direction, envelope: &Envelope) -> Option<u64> {
        let mut recent = self.recent.lock().ok()?;
        if let Some(seq) = envelope.meta.as_ref().and_then(|meta| meta.relay_seq) {
            if recent.contains(&DedupKey::Relay(seq)) {
                return None;
            }
        }
        if let Some(key) = DedupKey::for_envelope(direction, envelope) {
            if !recent.first_sighting(key) {
                return None;
            }
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        recent.first_sighting(DedupKey::Relay(seq));
        Some(seq)
    }

    async fn page_to_extension(self: Arc<Self>, mut page_rx: mpsc::UnboundedReceiver<Value>) {
        while let Some(raw) = page_rx.recv().await {
            if raw.get("namespace").and_then(Value::as_str) != Some(self.namespace.as_str()) {
                continue;
            }
            let Some(message) = WindowMessage::parse(&raw, &self.namespace) else {
                self.reject("malformed window message");
                continue;
            };
            match message.origin {
                ContextName::ContentScript => continue,
                ContextName::Inpage => {}
                _ => {
                    self.reject("forged origin");
                    continue;
                }
            }
            let mut envelope = match message.body {
                WindowBody::Envelope { envelope } => envelope,
                WindowBody::PortClosed => {
                    self.reject("page cannot close the extension port");
                    continue;
                }
            };
            if envelope.check_shape().is_err() {
                self.reject("malformed envelope");
                continue;
            }
            if !is_page_facing(&envelope.channel) {
                self.reject("channel is not page-facing");
                continue;
            }
            let Some(seq) = self.admit(Direction::ToExtension, &envelope) else {
                self.duplicate(&envelope);
                continue;
            };
            let identity = match self.identity.get().await {
                Ok(identity) => identity,
                Err(err) => {
                    warn!(tab_id = self.tab_id, error = %err, "identity unavailable");
                    continue;
                }
            };
            envelope.meta = Some(SenderMeta {
                context: ContextName::Inpage,
                tab_id: Some(self.tab_id),
                identity: Some(identity.as_str().to_string()),
                relay_seq: Some(seq),
            });
            trace!(tab_id = self.tab_id, seq, method = %envelope.method, "page -> extension");
            match self.port.post(envelope).await {
                Ok(()) => {
                    self.stats.to_extension.fetch_add(1, Ordering::SeqCst);
                }
                Err(WalletBridgeError::Disconnected) => {
                    self.notify_port_closed();
                }
                Err(err) => warn!(tab_id = self.tab_id, error = %err, "relay to extension failed"),
            }
        }
    }

    async fn extension_to_page(self: Arc<Self>, mut port_rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = port_rx.recv().await {
            let mut envelope = match event {
                TransportEvent::Message(envelope) => envelope,
                TransportEvent::Disconnected => break,
            };
            if !is_page_facing(&envelope.channel) {
                continue;
            }
            if let Err(err) = self.identity.validate(envelope.identity()).await {
                warn!(tab_id = self.tab_id, error = %err, "extension envelope dropped");
                continue;
            }
            let Some(seq) = self.admit(Direction::ToPage, &envelope) else {
                self.duplicate(&envelope);
                continue;
            };
            envelope.meta = Some(SenderMeta {
                context: ContextName::Background,
                tab_id: Some(self.tab_id),
                identity: None,
                relay_seq: Some(seq),
            });
            trace!(tab_id = self.tab_id, seq, method = %envelope.method, "extension -> page");
            let message = WindowMessage::envelope(&self.namespace, ContextName::ContentScript, envelope);
            match message.to_value() {
                Ok(value) => {
                    self.window.post_message(value);
                    self.stats.to_page.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => warn!(tab_id = self.tab_id, error = %err, "relay to page failed"),
            }
        }
        self.notify_port_closed();
    }

    fn notify_port_closed(&self) {
        debug!(tab_id = self.tab_id, "extension port closed");
        if let Ok(value) = WindowMessage::port_closed(&self.namespace, ContextName::ContentScript).to_value() {
            self.window.post_message(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dedup_cache_expires_entries() {
        let mut recent = RecentlyForwarded::new(2, Duration::from_millis(0));
        assert!(recent.first_sighting(DedupKey::Relay(1)));
        assert!(recent.first_sighting(DedupKey::Relay(1)));

        let mut recent = RecentlyForwarded::new(2, Duration::from_secs(60));
        assert!(recent.first_sighting(DedupKey::Relay(1)));
        assert!(!recent.first_sighting(DedupKey::Relay(1)));
        recent.first_sighting(DedupKey::Relay(2));
        recent.first_sighting(DedupKey::Relay(3));
        assert!(recent.first_sighting(DedupKey::Relay(1)));
    }

    #[test]
    fn events_have_no_envelope_key() {
        let event = Envelope::event(Channel::BACKGROUND_INPAGE, "chainChanged", json!("0x1"));
        assert!(DedupKey::for_envelope(Direction::ToPage, &event).is_none());
        let request = Envelope::request(Channel::BACKGROUND_INPAGE, 3, "m", "x", json!(null));
        assert!(DedupKey::for_envelope(Direction::ToExtension, &request).is_some());
    }
}
