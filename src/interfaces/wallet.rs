use async_trait::async_trait;
use serde_json::Value;

use crate::domains::envelope::SenderMeta;
use crate::domains::rpc::{RpcMethod, RpcRequest};
use crate::error::RpcError;

/// Executes wallet operations (signing, chain reads). Lives outside this crate.
#[async_trait]
pub trait WalletBackend: Send + Sync {
    async fn execute(&self, method: RpcMethod, request: &RpcRequest) -> Result<Value, RpcError>;
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub method: RpcMethod,
    pub params: Value,
    pub sender: Option<SenderMeta>,
}

/// User confirmation for state-changing methods.
#[async_trait]
pub trait ApprovalFlow: Send + Sync {
    async fn approve(&self, request: &ApprovalRequest) -> bool;
}

/// Approval policy that answers every request the same way.
pub struct AutoApproval {
    approve: bool,
}

impl AutoApproval {
    pub fn allow() -> Self {
        Self { approve: true }
    }

    pub fn deny() -> Self {
        Self { approve: false }
    }
}

#[async_trait]
impl ApprovalFlow for AutoApproval {
    async fn approve(&self, _request: &ApprovalRequest) -> bool {
        self.approve
    }
}
