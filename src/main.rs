use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use console::style;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use wallet_bridge::config::Config;
use wallet_bridge::domains::rpc::{to_quantity, RpcMethod, RpcRequest};
use wallet_bridge::error::{Result, RpcError, UNSUPPORTED_METHOD};
use wallet_bridge::identity::store::FileStore;
use wallet_bridge::identity::IdentityRegistry;
use wallet_bridge::interfaces::wallet::{AutoApproval, WalletBackend};
use wallet_bridge::BackgroundRuntime;

#[derive(Parser, Debug)]
#[command(name = "wallet-bridge")]
#[command(about = "Simulates an extension background, content scripts and injected providers")]
struct Cli {
    #[arg(long, env = "WALLET_BRIDGE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open tabs, run the dapp method set and print the broadcast events
    Simulate {
        #[arg(long, default_value_t = 3)]
        tabs: usize,
        #[arg(long, default_value_t = 5)]
        switch_to_chain: u64,
    },
    /// Print the fingerprint of the persisted extension identity
    Identity {
        #[arg(long, default_value = "./data/extension-storage.json")]
        store: String,
    },
}

/// Stand-in for the wallet core: canned chain reads, no key material.
struct SimulatedWallet {
    accounts: Vec<String>,
    block: AtomicU64,
}

impl SimulatedWallet {
    fn new() -> Self {
        Self {
            accounts: vec!["0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string()],
            block: AtomicU64::new(19_000_000),
        }
    }
}

fn digest_hex(value: &Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("0x{hex}")
}

#[async_trait]
impl WalletBackend for SimulatedWallet {
    async fn execute(
        &self,
        method: RpcMethod,
        request: &RpcRequest,
    ) -> std::result::Result<Value, RpcError> {
        match method {
            RpcMethod::RequestAccounts => Ok(json!(self.accounts)),
            RpcMethod::BlockNumber => {
                let block = self.block.fetch_add(1, Ordering::Relaxed);
                Ok(json!(to_quantity(block)))
            }
            RpcMethod::SendTransaction => Ok(json!(digest_hex(&request.params))),
            RpcMethod::SwitchEthereumChain => Ok(Value::Null),
            RpcMethod::GetBlockByNumber | RpcMethod::GetTransactionByHash => Ok(Value::Null),
            other => Err(RpcError::new(
                UNSUPPORTED_METHOD,
                format!("{other} is not available in the simulator"),
            )
            .with_data(json!({ "method": other.as_str() }))),
        }
    }
}

async fn simulate(config: Config, tabs: usize, switch_to_chain: u64) -> Result<()> {
    let runtime = BackgroundRuntime::from_config(
        config,
        Arc::new(SimulatedWallet::new()),
        Arc::new(AutoApproval::allow()),
    )
    .await?;

    let mut opened = Vec::new();
    for _ in 0..tabs.max(1) {
        let tab = runtime.open_tab();
        let provider = tab.inject_provider();
        let tab_id = tab.id();
        provider.on("chainChanged", move |event| {
            println!(
                "{} tab {tab_id} {:?}",
                style("event").color256(81).bold(),
                event
            );
        })?;
        provider.on("accountsChanged", move |event| {
            println!(
                "{} tab {tab_id} {:?}",
                style("event").color256(81).bold(),
                event
            );
        })?;
        opened.push((tab, provider));
    }

    let (first_tab, provider) = &opened[0];
    println!("ping: {}", first_tab.bridge().ping().await?);
    println!("eth_chainId: {}", provider.chain_id().await?);
    println!("eth_blockNumber: {}", provider.block_number().await?);
    println!("eth_accounts (before connect): {:?}", provider.accounts().await?);
    println!("eth_requestAccounts: {:?}", provider.request_accounts().await?);

    let from = provider
        .accounts()
        .await?
        .into_iter()
        .next()
        .unwrap_or_default();
    let tx = provider
        .request(
            "eth_sendTransaction",
            json!([{ "from": from, "value": "0x1" }]),
        )
        .await?;
    println!("eth_sendTransaction: {tx}");

    match provider
        .request("personal_sign", json!(["0x68656c6c6f", "0x0"]))
        .await
    {
        Ok(signature) => println!("personal_sign: {signature}"),
        Err(err) => println!(
            "{} personal_sign: {err} (code {})",
            style("error").color256(196),
            err.code()
        ),
    }

    provider
        .request(
            "wallet_switchEthereumChain",
            json!([{ "chainId": to_quantity(switch_to_chain) }]),
        )
        .await?;

    // Give the event fan-out a moment to reach every tab before exiting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!(
        "{} {} tabs attached, state {:?}",
        style("done").green(),
        runtime.pipeline().tab_ids().len(),
        runtime.pipeline().state()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,wallet_bridge=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match cli.command.unwrap_or(Commands::Simulate {
        tabs: 3,
        switch_to_chain: 5,
    }) {
        Commands::Simulate {
            tabs,
            switch_to_chain,
        } => simulate(config, tabs, switch_to_chain).await,
        Commands::Identity { store } => {
            let registry = IdentityRegistry::new(Arc::new(FileStore::new(store)?));
            let identity = registry.get().await?;
            println!("extension identity fingerprint: {}", identity.fingerprint());
            Ok(())
        }
    }
}
