use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{MessengerConfig, ProviderInfoConfig};
use crate::domains::envelope::{Channel, ContextName};
use crate::domains::rpc::{
    parse_quantity, ProviderEvent, RpcRequest, ACCOUNTS_CHANGED, CHAIN_CHANGED, CONNECT,
    DISCONNECT, PROVIDER_REQUEST,
};
use crate::error::{Result, WalletBridgeError};
use crate::services::messenger::{ListenerId, Messenger};
use crate::services::window::{WindowBus, WindowTransport};

pub const ANNOUNCE_PROVIDER: &str = "eip6963:announceProvider";
pub const REQUEST_PROVIDER: &str = "eip6963:requestProvider";

const EVENTS: [&str; 4] = [ACCOUNTS_CHANGED, CHAIN_CHANGED, CONNECT, DISCONNECT];

/// EIP-6963 provider metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub uuid: String,
    pub name: String,
    pub icon: String,
    pub rdns: String,
}

impl ProviderInfo {
    pub fn new(config: &ProviderInfoConfig) -> Self {
        Self {
            uuid: random_uuid(),
            name: config.name.clone(),
            icon: config.icon.clone(),
            rdns: config.rdns.clone(),
        }
    }

    pub fn announcement(&self) -> Value {
        json!({ "type": ANNOUNCE_PROVIDER, "detail": { "info": self } })
    }
}

fn random_uuid() -> String {
    let mut raw = [0u8; 16];
    OsRng.fill_bytes(&mut raw);
    raw[6] = (raw[6] & 0x0f) | 0x40;
    raw[8] = (raw[8] & 0x3f) | 0x80;
    let hex: String = raw.iter().map(|byte| format!("{byte:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Wallet provider object injected into the page realm.
pub struct InpageProvider {
    info: ProviderInfo,
    messenger: Arc<Messenger>,
    connected: Arc<AtomicBool>,
    next_rpc_id: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

impl InpageProvider {
    /// Creates the provider and announces it on the window bus.
    pub fn new(
        window: Arc<WindowBus>,
        namespace: &str,
        info: &ProviderInfoConfig,
        messenger_config: MessengerConfig,
    ) -> Self {
        let info = ProviderInfo::new(info);
        let transport = WindowTransport::new(
            window.clone(),
            namespace,
            ContextName::Inpage,
            ContextName::ContentScript,
        );
        let messenger = Arc::new(
            Messenger::builder(
                Channel::BACKGROUND_INPAGE,
                ContextName::Inpage,
                Arc::new(transport),
            )
            .config(messenger_config)
            .build(),
        );

        let connected = Arc::new(AtomicBool::new(true));
        let flag = connected.clone();
        messenger.on(CONNECT, move |_| flag.store(true, Ordering::SeqCst));
        let flag = connected.clone();
        messenger.on(DISCONNECT, move |_| flag.store(false, Ordering::SeqCst));

        let watcher = {
            let messenger = messenger.clone();
            let flag = connected.clone();
            tokio::spawn(async move {
                messenger.closed().await;
                flag.store(false, Ordering::SeqCst);
            })
        };

        let mut requests = window.add_listener();
        let announcement = info.announcement();
        window.post_message(announcement.clone());
        let discovery = tokio::spawn(async move {
            while let Some(message) = requests.recv().await {
                if message.get("type").and_then(Value::as_str) == Some(REQUEST_PROVIDER) {
                    window.post_message(announcement.clone());
                }
            }
        });
        debug!(uuid = %info.uuid, rdns = %info.rdns, "provider injected");

        Self {
            info,
            messenger,
            connected,
            next_rpc_id: AtomicU64::new(1),
            tasks: vec![watcher, discovery],
        }
    }

    pub fn info(&self) -> &ProviderInfo {
        &self.info
    }

    /// EIP-1193 `request`: resolves with the wallet's result, unchanged.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_rpc_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_value(RpcRequest::new(id, method, params))?;
        let outcome = self.messenger.send(PROVIDER_REQUEST, payload).await;
        if matches!(outcome, Err(WalletBridgeError::Disconnected)) {
            self.connected.store(false, Ordering::SeqCst);
        }
        outcome
    }

    pub fn on<F>(&self, event: &str, handler: F) -> Result<ListenerId>
    where
        F: Fn(&ProviderEvent) + Send + Sync + 'static,
    {
        if !EVENTS.contains(&event) {
            return Err(WalletBridgeError::Validation(format!(
                "unsupported provider event `{event}`"
            )));
        }
        let name = event.to_string();
        Ok(self.messenger.on(event, move |payload| {
            match ProviderEvent::decode(&name, payload) {
                Ok(decoded) => handler(&decoded),
                Err(err) => warn!(event = %name, error = %err, "undecodable provider event"),
            }
        }))
    }

    pub fn remove_listener(&self, event: &str, id: ListenerId) -> bool {
        self.messenger.off(event, id)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.messenger.is_closed()
    }

    pub async fn chain_id(&self) -> Result<u64> {
        let value = self.request("eth_chainId", Value::Null).await?;
        parse_quantity(&value)
    }

    pub async fn block_number(&self) -> Result<u64> {
        let value = self.request("eth_blockNumber", Value::Null).await?;
        parse_quantity(&value)
    }

    pub async fn accounts(&self) -> Result<Vec<String>> {
        let value = self.request("eth_accounts", Value::Null).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn request_accounts(&self) -> Result<Vec<String>> {
        let value = self.request("eth_requestAccounts", Value::Null).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Drop for InpageProvider {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
