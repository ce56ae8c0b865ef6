use async_trait::async_trait;

use crate::error::Result;

/// Persisted key-value storage shared by the extension's contexts.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}
