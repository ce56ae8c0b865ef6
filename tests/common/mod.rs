#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::pending;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use wallet_bridge::config::{Config, MessengerSection};
use wallet_bridge::domains::rpc::{RpcMethod, RpcRequest};
use wallet_bridge::error::RpcError;
use wallet_bridge::identity::store::MemoryStore;
use wallet_bridge::interfaces::wallet::{ApprovalFlow, ApprovalRequest, WalletBackend};
use wallet_bridge::BackgroundRuntime;

pub const ACCOUNT: &str = "0x1111111111111111111111111111111111111111";

/// Wallet double: records every call and serves queued results in order.
pub struct ScriptedWallet {
    queue: Mutex<VecDeque<Result<Value, RpcError>>>,
    calls: Mutex<Vec<RpcMethod>>,
    pub accounts: Vec<String>,
}

impl ScriptedWallet {
    pub fn new(queue: Vec<Result<Value, RpcError>>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::from(queue)),
            calls: Mutex::new(Vec::new()),
            accounts: vec![ACCOUNT.to_string()],
        }
    }

    pub fn calls(&self) -> Vec<RpcMethod> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl WalletBackend for ScriptedWallet {
    async fn execute(&self, method: RpcMethod, _request: &RpcRequest) -> Result<Value, RpcError> {
        self.calls.lock().unwrap().push(method);
        if method == RpcMethod::RequestAccounts {
            return Ok(json!(self.accounts));
        }
        let queued = self.queue.lock().unwrap().pop_front();
        queued.unwrap_or(match method {
            RpcMethod::BlockNumber => Ok(json!("0x10")),
            _ => Ok(Value::Null),
        })
    }
}

/// Approval double that counts prompts and answers with a fixed decision.
pub struct CountingApproval {
    approve: bool,
    prompts: AtomicUsize,
}

impl CountingApproval {
    pub fn new(approve: bool) -> Self {
        Self {
            approve,
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApprovalFlow for CountingApproval {
    async fn approve(&self, _request: &ApprovalRequest) -> bool {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.approve
    }
}

/// A user who never answers the prompt.
pub struct SilentApproval;

#[async_trait]
impl ApprovalFlow for SilentApproval {
    async fn approve(&self, _request: &ApprovalRequest) -> bool {
        pending::<bool>().await
    }
}

pub fn config_with_timeout(timeout_ms: u64) -> Config {
    Config {
        messenger: Some(MessengerSection {
            request_timeout_ms: Some(timeout_ms),
            max_pending: None,
        }),
        ..Config::default()
    }
}

pub async fn runtime(
    config: Config,
    wallet: Arc<ScriptedWallet>,
    approvals: Arc<dyn ApprovalFlow>,
) -> BackgroundRuntime {
    BackgroundRuntime::new(config, Arc::new(MemoryStore::new()), wallet, approvals)
        .await
        .unwrap()
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
