use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const USER_REJECTED: i64 = 4001;
pub const UNAUTHORIZED: i64 = 4100;
pub const UNSUPPORTED_METHOD: i64 = 4200;
pub const DISCONNECTED: i64 = 4900;
pub const INVALID_REQUEST: i64 = -32600;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const LIMIT_EXCEEDED: i64 = -32005;

/// JSON-RPC error object as carried in a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn user_rejected() -> Self {
        Self::new(USER_REJECTED, "User rejected the request.")
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, Clone, Error)]
pub enum WalletBridgeError {
    #[error("request `{method}` timed out after {after_ms}ms")]
    Timeout { method: String, after_ms: u64 },
    #[error("receiving context disconnected")]
    Disconnected,
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("handler error: {0}")]
    Handler(RpcError),
    #[error("too many pending requests (limit {0})")]
    TooManyPending(usize),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, WalletBridgeError>;

impl WalletBridgeError {
    /// Provider error code (EIP-1193 / JSON-RPC) for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::Timeout { .. } => INTERNAL_ERROR,
            Self::Disconnected => DISCONNECTED,
            Self::MethodNotFound(_) => UNSUPPORTED_METHOD,
            Self::Validation(_) => INVALID_REQUEST,
            Self::Handler(err) => err.code,
            Self::TooManyPending(_) => LIMIT_EXCEEDED,
            Self::Config(_) | Self::Serialization(_) | Self::Runtime(_) => INTERNAL_ERROR,
        }
    }

    pub fn to_rpc(&self) -> RpcError {
        match self {
            Self::Handler(err) => err.clone(),
            Self::Timeout { method, after_ms } => RpcError::new(self.code(), self.to_string())
                .with_data(json!({"reason": "timeout", "method": method, "afterMs": after_ms})),
            Self::Disconnected => RpcError::new(self.code(), self.to_string())
                .with_data(json!({"reason": "disconnected"})),
            Self::MethodNotFound(method) => RpcError::new(self.code(), self.to_string())
                .with_data(json!({"reason": "methodNotFound", "method": method})),
            Self::Validation(reason) => RpcError::new(self.code(), reason.clone())
                .with_data(json!({"reason": "validation"})),
            Self::TooManyPending(_) => RpcError::new(self.code(), self.to_string()),
            _ => RpcError::new(self.code(), self.to_string()),
        }
    }

    /// Rebuilds the error variant from a wire error object.
    pub fn from_rpc(err: RpcError) -> Self {
        let reason = err
            .data
            .as_ref()
            .and_then(|data| data.get("reason"))
            .and_then(Value::as_str)
            .map(str::to_string);
        match (err.code, reason.as_deref()) {
            (UNSUPPORTED_METHOD, _) => {
                let method = err
                    .data
                    .as_ref()
                    .and_then(|data| data.get("method"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Self::MethodNotFound(method)
            }
            (INVALID_REQUEST, Some("validation")) => Self::Validation(err.message),
            (DISCONNECTED, Some("disconnected")) => Self::Disconnected,
            _ => Self::Handler(err),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl From<serde_json::Error> for WalletBridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<RpcError> for WalletBridgeError {
    fn from(err: RpcError) -> Self {
        Self::Handler(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_provider_conventions() {
        assert_eq!(WalletBridgeError::Disconnected.code(), 4900);
        assert_eq!(WalletBridgeError::MethodNotFound("x".into()).code(), 4200);
        assert_eq!(WalletBridgeError::Validation("bad".into()).code(), -32600);
        let err = WalletBridgeError::Handler(RpcError::user_rejected());
        assert_eq!(err.code(), 4001);
        assert!(format!("{err}").contains("User rejected"));
    }

    #[test]
    fn wire_errors_map_back_to_variants() {
        let original = WalletBridgeError::MethodNotFound("eth_foo".into());
        match WalletBridgeError::from_rpc(original.to_rpc()) {
            WalletBridgeError::MethodNotFound(method) => assert_eq!(method, "eth_foo"),
            other => panic!("unexpected {other:?}"),
        }

        let validation = WalletBridgeError::Validation("identity mismatch".into());
        assert!(matches!(
            WalletBridgeError::from_rpc(validation.to_rpc()),
            WalletBridgeError::Validation(_)
        ));

        let handler = RpcError::new(-32000, "insufficient funds");
        match WalletBridgeError::from_rpc(handler.clone()) {
            WalletBridgeError::Handler(err) => assert_eq!(err, handler),
            other => panic!("unexpected {other:?}"),
        }
    }
}
