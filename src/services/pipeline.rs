use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MessengerConfig;
use crate::domains::envelope::{Channel, ContextName, SenderMeta};
use crate::domains::rpc::{
    parse_quantity, to_quantity, MethodPolicy, ProviderEvent, RpcMethod, RpcRequest,
    PROVIDER_REQUEST,
};
use crate::error::{Result, RpcError, WalletBridgeError, DISCONNECTED, INTERNAL_ERROR, UNAUTHORIZED};
use crate::identity::{IdentityGuard, IdentityRegistry};
use crate::interfaces::transport::Transport;
use crate::interfaces::wallet::{ApprovalFlow, ApprovalRequest, WalletBackend};
use crate::services::messenger::Messenger;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletState {
    pub accounts: Vec<String>,
    pub chain_id: u64,
    pub connected: bool,
}

impl WalletState {
    pub fn new(chain_id: u64) -> Self {
        Self {
            accounts: Vec::new(),
            chain_id,
            connected: false,
        }
    }

    fn exposed_accounts(&self) -> Vec<String> {
        if self.connected {
            self.accounts.clone()
        } else {
            Vec::new()
        }
    }
}

struct TabLink {
    port: Arc<dyn Transport>,
    rpc: Arc<Messenger>,
    control: Arc<Messenger>,
    watcher: JoinHandle<()>,
}

impl Drop for TabLink {
    fn drop(&mut self) {
        self.watcher.abort();
        self.port.disconnect();
    }
}

/// Background-side dispatcher for JSON-RPC traffic from every tab.
pub struct InterceptionPipeline {
    identity: Arc<IdentityRegistry>,
    wallet: Arc<dyn WalletBackend>,
    approvals: Arc<dyn ApprovalFlow>,
    messenger_config: MessengerConfig,
    state: RwLock<WalletState>,
    tabs: Mutex<HashMap<u64, TabLink>>,
    // Held across a state change and its broadcast so tabs see events in
    // the order the changes happened.
    transitions: tokio::sync::Mutex<()>,
    state_tx: broadcast::Sender<WalletState>,
}

impl InterceptionPipeline {
    pub fn new(
        identity: Arc<IdentityRegistry>,
        wallet: Arc<dyn WalletBackend>,
        approvals: Arc<dyn ApprovalFlow>,
        messenger_config: MessengerConfig,
        initial: WalletState,
    ) -> Arc<Self> {
        let (state_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            identity,
            wallet,
            approvals,
            messenger_config,
            state: RwLock::new(initial),
            tabs: Mutex::new(HashMap::new()),
            transitions: tokio::sync::Mutex::new(()),
            state_tx,
        })
    }

    /// Wires a tab's extension port into the pipeline.
    pub fn attach(self: &Arc<Self>, tab_id: u64, port: Arc<dyn Transport>) {
        let guard = Arc::new(IdentityGuard::new(self.identity.clone()));
        let rpc = Arc::new(
            Messenger::builder(Channel::BACKGROUND_INPAGE, ContextName::Background, port.clone())
                .config(self.messenger_config.clone())
                .identity(self.identity.clone())
                .guard(guard.clone())
                .tab_id(tab_id)
                .build(),
        );
        let pipeline = Arc::downgrade(self);
        rpc.reply(PROVIDER_REQUEST, move |payload, meta| {
            let pipeline = pipeline.clone();
            async move {
                match pipeline.upgrade() {
                    Some(pipeline) => pipeline.handle_request(payload, meta).await,
                    None => Err(RpcError::new(DISCONNECTED, "background pipeline stopped")),
                }
            }
        });

        let control = Arc::new(
            Messenger::builder(
                Channel::BACKGROUND_CONTENT_SCRIPT,
                ContextName::Background,
                port.clone(),
            )
            .config(self.messenger_config.clone())
            .identity(self.identity.clone())
            .guard(guard)
            .tab_id(tab_id)
            .build(),
        );
        control.reply("ping", |_, _| async { Ok(json!("pong")) });

        let watcher = {
            let rpc = rpc.clone();
            let pipeline: Weak<Self> = Arc::downgrade(self);
            tokio::spawn(async move {
                rpc.closed().await;
                if let Some(pipeline) = pipeline.upgrade() {
                    pipeline.detach(tab_id);
                }
            })
        };

        let link = TabLink {
            port,
            rpc,
            control,
            watcher,
        };
        if let Ok(mut tabs) = self.tabs.lock() {
            if tabs.insert(tab_id, link).is_some() {
                debug!(tab_id, "replaced existing tab link");
            }
        }
        info!(tab_id, "tab attached");
    }

    /// Drops the tab's link and closes its port.
    pub fn detach(&self, tab_id: u64) -> bool {
        let removed = self
            .tabs
            .lock()
            .map(|mut tabs| tabs.remove(&tab_id))
            .ok()
            .flatten();
        if removed.is_some() {
            info!(tab_id, "tab detached");
        }
        removed.is_some()
    }

    pub fn tab_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .tabs
            .lock()
            .map(|tabs| tabs.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn state(&self) -> WalletState {
        self.state
            .read()
            .map(|state| state.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Snapshots for the store-sync collaborator.
    pub fn subscribe_state(&self) -> broadcast::Receiver<WalletState> {
        self.state_tx.subscribe()
    }

    /// Sends a request to the content script of `tab_id`.
    pub async fn request_tab(&self, tab_id: u64, method: &str, payload: Value) -> Result<Value> {
        let control = self
            .tabs
            .lock()
            .map_err(|_| WalletBridgeError::Runtime("tab table poisoned".to_string()))?
            .get(&tab_id)
            .map(|link| link.control.clone())
            .ok_or(WalletBridgeError::Disconnected)?;
        control.send(method, payload).await
    }

    pub async fn set_accounts(&self, accounts: Vec<String>) {
        self.transition(|state| state.accounts = accounts).await;
    }

    pub async fn set_chain_id(&self, chain_id: u64) {
        self.transition(|state| state.chain_id = chain_id).await;
    }

    pub async fn set_connected(&self, connected: bool) {
        self.transition(|state| state.connected = connected).await;
    }

    /// Applies `change`, then broadcasts whatever events the difference implies.
    async fn transition<F>(&self, change: F) -> WalletState
    where
        F: FnOnce(&mut WalletState),
    {
        let _serial = self.transitions.lock().await;
        let (before, after) = {
            let mut state = match self.state.write() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            let before = state.clone();
            change(&mut *state);
            (before, state.clone())
        };
        if before == after {
            return after;
        }

        let mut events = Vec::new();
        if !before.connected && after.connected {
            events.push(ProviderEvent::Connect {
                chain_id: after.chain_id,
            });
        }
        if before.connected && !after.connected {
            events.push(ProviderEvent::Disconnect {
                code: DISCONNECTED,
                message: "wallet disconnected".to_string(),
            });
        }
        if before.chain_id != after.chain_id {
            events.push(ProviderEvent::ChainChanged(after.chain_id));
        }
        if before.exposed_accounts() != after.exposed_accounts() {
            events.push(ProviderEvent::AccountsChanged(after.exposed_accounts()));
        }
        for event in &events {
            self.broadcast(event).await;
        }
        let _ = self.state_tx.send(after.clone());
        after
    }

    /// Emits `event` to every attached tab.
    pub async fn broadcast(&self, event: &ProviderEvent) -> usize {
        let targets: Vec<(u64, Arc<Messenger>)> = self
            .tabs
            .lock()
            .map(|tabs| {
                tabs.iter()
                    .map(|(id, link)| (*id, link.rpc.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let mut delivered = 0;
        for (tab_id, rpc) in targets {
            match rpc.emit(event.name(), event.payload()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(tab_id, event = event.name(), error = %err, "broadcast failed");
                    if err.is_disconnected() {
                        self.detach(tab_id);
                    }
                }
            }
        }
        debug!(event = event.name(), delivered, "broadcast");
        delivered
    }

    async fn handle_request(
        &self,
        payload: Value,
        meta: Option<SenderMeta>,
    ) -> std::result::Result<Value, RpcError> {
        let request: RpcRequest = serde_json::from_value(payload).map_err(|e| {
            WalletBridgeError::Validation(format!("malformed JSON-RPC request: {e}")).to_rpc()
        })?;
        let method: RpcMethod = request.method.parse().map_err(|e: WalletBridgeError| e.to_rpc())?;
        let tab_id = meta.as_ref().and_then(|meta| meta.tab_id);
        debug!(?tab_id, method = %method, "provider request");

        if method == RpcMethod::RequestAccounts {
            let state = self.state();
            if state.connected && !state.accounts.is_empty() {
                return Ok(json!(state.accounts));
            }
        }

        if method.policy() == MethodPolicy::StateChanging {
            if method.requires_connection() && !self.state().connected {
                return Err(RpcError::new(
                    UNAUTHORIZED,
                    "The requested method has not been authorized by the user.",
                ));
            }
            let approval = ApprovalRequest {
                method,
                params: request.params.clone(),
                sender: meta,
            };
            if !self.approvals.approve(&approval).await {
                debug!(?tab_id, method = %method, "request rejected by user");
                return Err(RpcError::user_rejected());
            }
        }

        self.execute(method, &request).await
    }

    async fn execute(
        &self,
        method: RpcMethod,
        request: &RpcRequest,
    ) -> std::result::Result<Value, RpcError> {
        match method {
            RpcMethod::Accounts => Ok(json!(self.state().exposed_accounts())),
            RpcMethod::ChainId => Ok(json!(to_quantity(self.state().chain_id))),
            RpcMethod::RequestAccounts => {
                let result = self.wallet.execute(method, request).await?;
                let accounts: Vec<String> = serde_json::from_value(result).map_err(|e| {
                    RpcError::new(INTERNAL_ERROR, format!("wallet returned invalid accounts: {e}"))
                })?;
                let granted = accounts.clone();
                self.transition(move |state| {
                    state.accounts = granted;
                    state.connected = true;
                })
                .await;
                Ok(json!(accounts))
            }
            RpcMethod::SwitchEthereumChain => {
                let params = request.params_array()?;
                let target = params
                    .first()
                    .and_then(|param| param.get("chainId"))
                    .ok_or_else(|| RpcError::invalid_params("missing chainId"))?;
                let chain_id = parse_quantity(target)
                    .map_err(|e| RpcError::invalid_params(e.to_string()))?;
                self.wallet.execute(method, request).await?;
                self.transition(move |state| state.chain_id = chain_id).await;
                Ok(Value::Null)
            }
            _ => self.wallet.execute(method, request).await,
        }
    }
}
