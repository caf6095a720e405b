use std::{path::PathBuf, sync::Arc};

use alloy::{
    primitives::{Address, U256},
    signers::local::PrivateKeySigner,
    transports::http::reqwest::Url,
};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use barrage_core::{
    account::Account,
    config::EngineConfig,
    engine::Engine,
    pool::TxRequest,
    provider::HttpTransport,
    signer::{FeePolicy, TxTemplate},
};

#[derive(Parser, Debug)]
#[command(
    name = "barrage",
    about = "Spam native-token transfers at an RPC endpoint"
)]
struct BarrageCli {
    /// Number of transactions to send.
    #[arg(short = 'n', long, default_value_t = 100)]
    count: u64,

    /// Recipient address.
    #[arg(long)]
    to: Address,

    /// Amount to send per transaction, in wei.
    #[arg(long, default_value = "10000000000000000")]
    value: U256,

    /// RPC endpoint of the target network.
    #[arg(short, long, env = "RPC_URL")]
    rpc_url: Url,

    /// Hex-encoded private key of the sending account.
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    private_key: String,

    /// Legacy gas price in wei.
    #[arg(long, default_value_t = 10_000_000_000)]
    gas_price: u128,

    /// Target submission rate in txs per second.
    #[arg(long)]
    tps: Option<f64>,

    /// Number of concurrent submission workers.
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds to wait for a confirmation before giving up on a tx.
    #[arg(long)]
    timeout: Option<u64>,

    /// Submit nonces without waiting for the previous one to start
    /// confirming.
    #[arg(long)]
    pipeline: bool,

    /// TOML file with engine options; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl BarrageCli {
    fn engine_config(&self) -> Result<EngineConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
            None => EngineConfig::default(),
        };
        if let Some(tps) = self.tps {
            config.target_rate = tps;
        }
        if let Some(workers) = self.workers {
            config.worker_count = workers;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        if self.pipeline {
            config.pipelining_enabled = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = BarrageCli::parse();
    let config = args.engine_config()?;

    let signer: PrivateKeySigner = args.private_key.parse()?;
    let account = Account::new(signer);
    info!(sender = %account.address(), rpc = %args.rpc_url, "connecting");

    let transport = Arc::new(HttpTransport::connect(args.rpc_url.clone()));
    let chain_id = transport.chain_id().await?;

    let template = TxTemplate::transfer(
        args.to,
        args.value,
        FeePolicy::Legacy {
            gas_price: args.gas_price,
        },
        chain_id,
    );
    let requests = (0..args.count)
        .map(|_| TxRequest {
            account: account.clone(),
            template: template.clone(),
        })
        .collect::<Vec<_>>();

    let engine = Engine::builder(transport).config(config).build()?;
    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received, finishing in-flight submissions");
            cancel.cancel();
        }
    });

    let summary = engine.run(requests).await?;

    println!();
    println!("run {}", if summary.cancelled { "cancelled" } else { "complete" });
    println!("  accepted:  {}", summary.stats.accepted);
    println!("  rejected:  {}", summary.stats.rejected);
    println!("  timed out: {}", summary.stats.timed_out);
    println!("  pending:   {}", summary.stats.pending);
    if !summary.unresolved.is_empty() {
        println!("  awaiting reconciliation:");
        for (address, nonce) in &summary.unresolved {
            println!("    {address} nonce {nonce}");
        }
    }
    Ok(())
}
