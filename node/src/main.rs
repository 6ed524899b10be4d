use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use argh::FromArgs;
use chainlib::{blockchain::Blockchain, error::ChainError};
use tracing::{info, warn};

mod config;
mod handler;
mod mempool;
mod miner;
mod monitor;
mod peers;
mod server;
mod shutdown;
mod util;

#[cfg(test)]
mod testing;

use config::NodeConfig;
use server::NodeServer;
use shutdown::ShutdownController;

#[derive(FromArgs)]
/// Proof-of-work blockchain node
struct Args {
    #[argh(option)]
    /// TOML config file
    config: Option<PathBuf>,

    #[argh(option)]
    /// port to accept peers on
    port: Option<u16>,

    #[argh(option)]
    /// ledger directory
    ledger: Option<PathBuf>,

    #[argh(option)]
    /// address paid by mined blocks; without it a wallet address is used
    mining_address: Option<String>,

    #[argh(option)]
    /// create a new ledger whose genesis block pays this address
    create: Option<String>,

    #[argh(option)]
    /// difficulty in leading zero bits
    target_bits: Option<u32>,

    #[argh(switch)]
    /// relay only, never mine
    no_mining: bool,

    #[argh(positional)]
    /// addresses of known nodes; the first one is the seed
    nodes: Vec<String>,
}

impl Args {
    fn apply(self, config: &mut NodeConfig) -> Option<String> {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ledger) = self.ledger {
            config.ledger_path = ledger;
        }
        if self.mining_address.is_some() {
            config.mining_address = self.mining_address;
        }
        if let Some(bits) = self.target_bits {
            config.target_bits = bits;
        }
        if self.no_mining {
            config.mining_enabled = false;
        }
        if !self.nodes.is_empty() {
            config.bootstrap_peers = self.nodes;
        }
        self.create
    }
}

fn open_ledger(config: &NodeConfig, create: Option<String>) -> Result<Blockchain> {
    let path = &config.ledger_path;
    match create {
        Some(reward_address) => {
            let chain = Blockchain::create(path, &reward_address, config.target_bits)?;
            info!(path = %path.display(), %reward_address, "created ledger");
            Ok(chain)
        }
        None => match Blockchain::open(path) {
            Ok(chain) => {
                if chain.target_bits() != config.target_bits {
                    warn!(
                        stored = chain.target_bits(),
                        configured = config.target_bits,
                        "ledger keeps the difficulty it was created with"
                    );
                }
                Ok(chain)
            }
            Err(e @ ChainError::NotFound(_)) => {
                Err(e).context("no ledger yet, start once with --create <address>")
            }
            Err(e) => Err(e.into()),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();
    let mut config = NodeConfig::load(args.config.as_deref())?;
    let create = args.apply(&mut config);
    config.validate()?;

    util::init_tracing(&config.log_level);

    let chain = open_ledger(&config, create).context("cannot start node")?;
    let node = NodeServer::new(config, chain).await?;

    let shutdown = Arc::new(ShutdownController::new());
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });

    node.run(shutdown).await
}
