use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, WalletBridgeError};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MAX_PENDING: usize = 256;
pub const DEFAULT_NAMESPACE: &str = "wallet-bridge";
pub const DEFAULT_DEDUP_CAPACITY: usize = 512;
pub const DEFAULT_DEDUP_TTL_MS: u64 = 10_000;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MessengerSection {
    pub request_timeout_ms: Option<u64>,
    pub max_pending: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeSection {
    pub namespace: Option<String>,
    pub dedup_capacity: Option<usize>,
    pub dedup_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IdentitySection {
    pub store_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProviderSection {
    pub name: Option<String>,
    pub rdns: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WalletSection {
    pub chain_id: Option<u64>,
    pub accounts: Option<Vec<String>>,
}

/// File-level configuration. Every field is optional; the resolved
/// per-component settings come from the accessor methods.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub messenger: Option<MessengerSection>,
    pub bridge: Option<BridgeSection>,
    pub identity: Option<IdentitySection>,
    pub provider: Option<ProviderSection>,
    pub wallet: Option<WalletSection>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| WalletBridgeError::Config(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| WalletBridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let messenger = self.messenger_config();
        if messenger.request_timeout.is_zero() {
            return Err(WalletBridgeError::Config(
                "messenger.request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if messenger.max_pending == 0 {
            return Err(WalletBridgeError::Config(
                "messenger.max_pending must be greater than zero".to_string(),
            ));
        }
        let bridge = self.bridge_config();
        if bridge.namespace.trim().is_empty() {
            return Err(WalletBridgeError::Config(
                "bridge.namespace must not be empty".to_string(),
            ));
        }
        if bridge.dedup_capacity == 0 {
            return Err(WalletBridgeError::Config(
                "bridge.dedup_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn messenger_config(&self) -> MessengerConfig {
        let section = self.messenger.clone().unwrap_or_default();
        MessengerConfig {
            request_timeout: Duration::from_millis(
                section
                    .request_timeout_ms
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
            max_pending: section.max_pending.unwrap_or(DEFAULT_MAX_PENDING),
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        let section = self.bridge.clone().unwrap_or_default();
        BridgeConfig {
            namespace: section
                .namespace
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            dedup_capacity: section.dedup_capacity.unwrap_or(DEFAULT_DEDUP_CAPACITY),
            dedup_ttl: Duration::from_millis(section.dedup_ttl_ms.unwrap_or(DEFAULT_DEDUP_TTL_MS)),
        }
    }

    pub fn provider_info(&self) -> ProviderInfoConfig {
        let section = self.provider.clone().unwrap_or_default();
        ProviderInfoConfig {
            name: section.name.unwrap_or_else(|| "Wallet Bridge".to_string()),
            rdns: section
                .rdns
                .unwrap_or_else(|| "dev.walletbridge".to_string()),
            icon: section.icon.unwrap_or_else(|| {
                "data:image/svg+xml,<svg xmlns=\"http://www.w3.org/2000/svg\"/>".to_string()
            }),
        }
    }

    pub fn identity_store_path(&self) -> Option<String> {
        self.identity
            .as_ref()
            .and_then(|section| section.store_path.clone())
            .filter(|path| !path.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub request_timeout: Duration,
    pub max_pending: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Config::default().messenger_config()
    }
}

impl MessengerConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub namespace: String,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Config::default().bridge_config()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfoConfig {
    pub name: String,
    pub rdns: String,
    pub icon: String,
}

impl Default for ProviderInfoConfig {
    fn default() -> Self {
        Config::default().provider_info()
    }
}
