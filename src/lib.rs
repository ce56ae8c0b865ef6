pub mod config;
pub mod domains;
pub mod error;
pub mod identity;
pub mod interfaces;
pub mod runtime;
pub mod services;

pub use crate::config::Config;
pub use crate::domains::envelope::{Channel, ContextName, Envelope, EnvelopeKind};
pub use crate::domains::rpc::{ProviderEvent, RpcMethod};
pub use crate::error::{Result, RpcError, WalletBridgeError};
pub use crate::runtime::{BackgroundRuntime, Tab};
pub use crate::services::messenger::Messenger;
pub use crate::services::provider::InpageProvider;
