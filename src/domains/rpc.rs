use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, RpcError, WalletBridgeError};

/// Messenger method carrying JSON-RPC calls from the page to the background.
pub const PROVIDER_REQUEST: &str = "providerRequest";

pub const ACCOUNTS_CHANGED: &str = "accountsChanged";
pub const CHAIN_CHANGED: &str = "chainChanged";
pub const CONNECT: &str = "connect";
pub const DISCONNECT: &str = "disconnect";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    RequestAccounts,
    Accounts,
    ChainId,
    BlockNumber,
    SendTransaction,
    PersonalSign,
    SignTypedDataV4,
    SwitchEthereumChain,
    GetBlockByNumber,
    GetTransactionByHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodPolicy {
    ReadOnly,
    StateChanging,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 10] = [
        Self::RequestAccounts,
        Self::Accounts,
        Self::ChainId,
        Self::BlockNumber,
        Self::SendTransaction,
        Self::PersonalSign,
        Self::SignTypedDataV4,
        Self::SwitchEthereumChain,
        Self::GetBlockByNumber,
        Self::GetTransactionByHash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestAccounts => "eth_requestAccounts",
            Self::Accounts => "eth_accounts",
            Self::ChainId => "eth_chainId",
            Self::BlockNumber => "eth_blockNumber",
            Self::SendTransaction => "eth_sendTransaction",
            Self::PersonalSign => "personal_sign",
            Self::SignTypedDataV4 => "eth_signTypedData_v4",
            Self::SwitchEthereumChain => "wallet_switchEthereumChain",
            Self::GetBlockByNumber => "eth_getBlockByNumber",
            Self::GetTransactionByHash => "eth_getTransactionByHash",
        }
    }

    pub fn policy(&self) -> MethodPolicy {
        match self {
            Self::RequestAccounts
            | Self::SendTransaction
            | Self::PersonalSign
            | Self::SignTypedDataV4
            | Self::SwitchEthereumChain => MethodPolicy::StateChanging,
            Self::Accounts
            | Self::ChainId
            | Self::BlockNumber
            | Self::GetBlockByNumber
            | Self::GetTransactionByHash => MethodPolicy::ReadOnly,
        }
    }

    /// Signing methods are only served once the origin is connected.
    pub fn requires_connection(&self) -> bool {
        matches!(
            self,
            Self::SendTransaction | Self::PersonalSign | Self::SignTypedDataV4
        )
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RpcMethod {
    type Err = WalletBridgeError;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|method| method.as_str() == value)
            .ok_or_else(|| WalletBridgeError::MethodNotFound(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

impl RpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            id: json!(id),
            jsonrpc: default_jsonrpc(),
            method: method.to_string(),
            params,
        }
    }

    /// Positional params as a slice; absent params are treated as empty.
    pub fn params_array(&self) -> std::result::Result<&[Value], RpcError> {
        match &self.params {
            Value::Null => Ok(&[]),
            Value::Array(items) => Ok(items.as_slice()),
            _ => Err(RpcError::invalid_params("params must be an array")),
        }
    }
}

/// Decoded provider event as delivered to page listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    AccountsChanged(Vec<String>),
    ChainChanged(u64),
    Connect { chain_id: u64 },
    Disconnect { code: i64, message: String },
}

impl ProviderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AccountsChanged(_) => ACCOUNTS_CHANGED,
            Self::ChainChanged(_) => CHAIN_CHANGED,
            Self::Connect { .. } => CONNECT,
            Self::Disconnect { .. } => DISCONNECT,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::AccountsChanged(accounts) => json!(accounts),
            Self::ChainChanged(chain_id) => json!(to_quantity(*chain_id)),
            Self::Connect { chain_id } => json!({ "chainId": to_quantity(*chain_id) }),
            Self::Disconnect { code, message } => json!({ "code": code, "message": message }),
        }
    }

    pub fn decode(name: &str, payload: &Value) -> Result<Self> {
        match name {
            ACCOUNTS_CHANGED => {
                let accounts: Vec<String> = serde_json::from_value(payload.clone())?;
                Ok(Self::AccountsChanged(accounts))
            }
            CHAIN_CHANGED => Ok(Self::ChainChanged(parse_quantity(payload)?)),
            CONNECT => {
                let chain_id = payload.get("chainId").ok_or_else(|| {
                    WalletBridgeError::Validation("connect event without chainId".to_string())
                })?;
                Ok(Self::Connect {
                    chain_id: parse_quantity(chain_id)?,
                })
            }
            DISCONNECT => Ok(Self::Disconnect {
                code: payload
                    .get("code")
                    .and_then(Value::as_i64)
                    .unwrap_or(crate::error::DISCONNECTED),
                message: payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("disconnected")
                    .to_string(),
            }),
            other => Err(WalletBridgeError::Validation(format!(
                "unknown provider event `{other}`"
            ))),
        }
    }
}

pub fn to_quantity(value: u64) -> String {
    format!("{value:#x}")
}

/// Parses a JSON-RPC quantity (`"0x1a"`) or a plain JSON number.
pub fn parse_quantity(value: &Value) -> Result<u64> {
    match value {
        Value::String(text) => {
            let digits = text
                .strip_prefix("0x")
                .or_else(|| text.strip_prefix("0X"))
                .ok_or_else(|| {
                    WalletBridgeError::Validation(format!("quantity `{text}` is not hex"))
                })?;
            u64::from_str_radix(digits, 16)
                .map_err(|e| WalletBridgeError::Validation(format!("quantity `{text}`: {e}")))
        }
        Value::Number(number) => number.as_u64().ok_or_else(|| {
            WalletBridgeError::Validation(format!("quantity `{number}` out of range"))
        }),
        other => Err(WalletBridgeError::Validation(format!(
            "expected quantity, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_table_tags_state_changing_methods() {
        assert_eq!(
            "eth_sendTransaction".parse::<RpcMethod>().unwrap().policy(),
            MethodPolicy::StateChanging
        );
        assert_eq!(RpcMethod::ChainId.policy(), MethodPolicy::ReadOnly);
        assert!(matches!(
            "eth_mine".parse::<RpcMethod>(),
            Err(WalletBridgeError::MethodNotFound(_))
        ));
    }

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity(&json!("0x1")).unwrap(), 1);
        assert_eq!(parse_quantity(&json!("0x5")).unwrap(), 5);
        assert_eq!(parse_quantity(&json!(12)).unwrap(), 12);
        assert!(parse_quantity(&json!("12")).is_err());
        assert_eq!(to_quantity(255), "0xff");
    }

    #[test]
    fn events_decode_from_wire_payloads() {
        assert_eq!(
            ProviderEvent::decode(CHAIN_CHANGED, &json!("0x5")).unwrap(),
            ProviderEvent::ChainChanged(5)
        );
        let connect = ProviderEvent::Connect { chain_id: 1 };
        assert_eq!(
            ProviderEvent::decode(connect.name(), &connect.payload()).unwrap(),
            connect
        );
        assert!(ProviderEvent::decode("message", &Value::Null).is_err());
    }
}
