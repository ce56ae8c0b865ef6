use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::identity::store::{FileStore, MemoryStore};
use crate::identity::IdentityRegistry;
use crate::interfaces::storage::KeyValueStore;
use crate::interfaces::wallet::{ApprovalFlow, WalletBackend};
use crate::services::bridge::ContentScriptBridge;
use crate::services::pipeline::{InterceptionPipeline, WalletState};
use crate::services::provider::InpageProvider;
use crate::services::transport::{port_pair, MemoryPort};
use crate::services::window::WindowBus;

const DEFAULT_CHAIN_ID: u64 = 1;

/// Owns everything the background context needs; nothing lives in globals.
pub struct BackgroundRuntime {
    config: Config,
    identity: Arc<IdentityRegistry>,
    pipeline: Arc<InterceptionPipeline>,
    next_tab: AtomicU64,
}

impl BackgroundRuntime {
    pub async fn new(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        wallet: Arc<dyn WalletBackend>,
        approvals: Arc<dyn ApprovalFlow>,
    ) -> Result<Self> {
        config.validate()?;
        let identity = Arc::new(IdentityRegistry::new(store));
        let extension_id = identity.get().await?;

        let wallet_section = config.wallet.clone().unwrap_or_default();
        let mut initial = WalletState::new(wallet_section.chain_id.unwrap_or(DEFAULT_CHAIN_ID));
        initial.accounts = wallet_section.accounts.unwrap_or_default();

        let pipeline = InterceptionPipeline::new(
            identity.clone(),
            wallet,
            approvals,
            config.messenger_config(),
            initial,
        );
        info!(fingerprint = %extension_id.fingerprint(), "background runtime ready");
        Ok(Self {
            config,
            identity,
            pipeline,
            next_tab: AtomicU64::new(1),
        })
    }

    /// Uses a file-backed store when `identity.store_path` is configured.
    pub async fn from_config(
        config: Config,
        wallet: Arc<dyn WalletBackend>,
        approvals: Arc<dyn ApprovalFlow>,
    ) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = match config.identity_store_path() {
            Some(path) => Arc::new(FileStore::new(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::new(config, store, wallet, approvals).await
    }

    pub fn identity(&self) -> &Arc<IdentityRegistry> {
        &self.identity
    }

    pub fn pipeline(&self) -> &Arc<InterceptionPipeline> {
        &self.pipeline
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens a tab: a fresh page realm, its content-script bridge, and the
    /// extension port linking the bridge to the pipeline.
    pub fn open_tab(&self) -> Tab {
        let id = self.next_tab.fetch_add(1, Ordering::Relaxed);
        let (background_end, tab_end) = port_pair(&format!("tab-{id}"));
        self.pipeline.attach(id, Arc::new(background_end));

        let port = Arc::new(tab_end);
        let window = WindowBus::new();
        let bridge = ContentScriptBridge::start(
            id,
            window.clone(),
            port.clone(),
            self.identity.clone(),
            self.config.bridge_config(),
            self.config.messenger_config(),
        );
        Tab {
            id,
            window,
            port,
            bridge,
            config: self.config.clone(),
        }
    }
}

pub struct Tab {
    id: u64,
    window: Arc<WindowBus>,
    port: Arc<MemoryPort>,
    bridge: ContentScriptBridge,
    config: Config,
}

impl Tab {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn window(&self) -> &Arc<WindowBus> {
        &self.window
    }

    pub fn bridge(&self) -> &ContentScriptBridge {
        &self.bridge
    }

    /// Injects a provider into this tab's page realm.
    pub fn inject_provider(&self) -> InpageProvider {
        InpageProvider::new(
            self.window.clone(),
            &self.config.bridge_config().namespace,
            &self.config.provider_info(),
            self.config.messenger_config(),
        )
    }

    /// Destroys the tab; the background observes the port disconnecting.
    pub fn close(self) {
        self.port.disconnect();
        info!(tab_id = self.id, "tab closed");
    }
}
