//! Top-level node: owns the ledger, the derived UTXO index, the mempool, the
//! peer registry and the mining scheduler, and runs the accept loop, the
//! mining loop and the time monitor as concurrent tasks.
//!
//! Lock order, where more than one is held: mining address slot, then wallet;
//! UTXO index, then mempool, then peer registry. Std locks are never held
//! across an `.await`.

use std::sync::Arc;

use anyhow::{Context, Result};
use chainlib::{
    blockchain::Blockchain,
    error::ChainError,
    network::{InvKind, Message, PROTOCOL_VERSION},
    sha256::Hash,
    util::Saveable,
    utxo::UtxoIndex,
};
use tokio::{
    net::TcpListener,
    sync::{Mutex, RwLock, broadcast},
    time::timeout,
};
use tracing::{debug, error, info, warn};
use wallet::Wallet;

use crate::{
    config::NodeConfig, handler, mempool::Mempool, miner, miner::MiningScheduler, monitor,
    peers::PeerRegistry, shutdown::ShutdownController, util,
};

pub struct NodeServer {
    pub config: NodeConfig,
    /// Address announced to peers.
    pub address: String,
    pub chain: Arc<Blockchain>,
    pub utxos: RwLock<UtxoIndex>,
    pub mempool: Mempool,
    pub peers: PeerRegistry,
    /// Loaded only when no mining address is configured.
    pub wallet: Option<Mutex<Wallet>>,
    pub miner: MiningScheduler,
}

impl NodeServer {
    pub async fn new(config: NodeConfig, chain: Blockchain) -> Result<Arc<Self>> {
        let chain = Arc::new(chain);
        let utxos = {
            let chain = chain.clone();
            tokio::task::spawn_blocking(move || UtxoIndex::rebuild(&chain))
                .await
                .context("utxo rebuild task failed")??
        };

        let wallet = match &config.mining_address {
            Some(_) => None,
            None => {
                let wallet = Wallet::load_or_default(&config.wallet_path)
                    .with_context(|| format!("loading wallet {}", config.wallet_path.display()))?;
                Some(Mutex::new(wallet))
            }
        };

        let address = util::resolve_node_address(&config).await;
        let peers = PeerRegistry::new(
            config.bootstrap_peers.iter().cloned(),
            config.max_blocks_in_transit,
        );
        let miner = MiningScheduler::new(config.mining_address.clone());

        info!(
            %address,
            height = chain.height(),
            tip = %chain.tip(),
            utxos = utxos.len(),
            "node initialised"
        );

        Ok(Arc::new(Self {
            config,
            address,
            chain,
            utxos: RwLock::new(utxos),
            mempool: Mempool::new(),
            peers,
            wallet,
            miner,
        }))
    }

    pub fn version_message(&self) -> Message {
        Message::Version {
            version: PROTOCOL_VERSION,
            best_height: self.chain.height(),
            addr_from: self.address.clone(),
        }
    }

    pub fn is_seed(&self) -> bool {
        self.peers.seed().as_deref() == Some(self.address.as_str())
    }

    /// Rebuilds the UTXO index off the async threads and swaps it in.
    pub async fn reindex(&self) -> Result<()> {
        let chain = self.chain.clone();
        let rebuilt = tokio::task::spawn_blocking(move || UtxoIndex::rebuild(&chain))
            .await
            .context("utxo rebuild task failed")??;
        *self.utxos.write().await = rebuilt;
        Ok(())
    }

    /// Delivers `message` to `address`. An unreachable peer is dropped from
    /// the registry.
    pub async fn send(&self, address: &str, message: &Message) -> bool {
        match message.send_to(address).await {
            Ok(()) => {
                debug!(peer = %address, command = message.name(), "sent");
                true
            }
            Err(e) => {
                warn!(peer = %address, command = message.name(), "peer unreachable: {e}");
                self.peers.remove(address);
                false
            }
        }
    }

    /// Tells every peer except this node about a new block.
    pub async fn announce_block(&self, hash: Hash) {
        let message = Message::Inv {
            addr_from: self.address.clone(),
            kind: InvKind::Block,
            items: vec![hash],
        };
        for peer in self.peers.others(&[self.address.as_str()]) {
            self.send(&peer, &message).await;
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: Arc<ShutdownController>) -> Result<()> {
        let mut stop = shutdown.subscribe();
        let mut tasks = Vec::new();

        let bind_address = format!("0.0.0.0:{}", self.config.port);
        match TcpListener::bind(&bind_address).await {
            Ok(listener) => {
                info!(address = %self.address, "peer server listening on {bind_address}");
                tasks.push(tokio::spawn(
                    self.clone().accept_loop(listener, shutdown.subscribe()),
                ));
            }
            Err(source) => {
                let e = ChainError::Listen {
                    address: bind_address,
                    source,
                };
                error!("{e}, continuing without inbound connections");
            }
        }

        if let Some(seed) = self.peers.seed() {
            if seed != self.address {
                info!(peer = %seed, "sending version to seed");
                self.send(&seed, &self.version_message()).await;
            }
        }

        if self.config.mining_enabled {
            tasks.push(tokio::spawn(miner::run(self.clone(), shutdown.subscribe())));
            tasks.push(tokio::spawn(monitor::run(self.clone(), shutdown.subscribe())));
        }

        let _ = stop.recv().await;
        info!(peers = ?self.peers.addresses(), "stopping node tasks");

        let deadline = self.config.shutdown_timeout();
        let joined = timeout(deadline, async {
            for task in tasks {
                if let Err(e) = task.await {
                    error!("node task failed: {e}");
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!(?deadline, "tasks still running at shutdown deadline");
        }

        self.persist().await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut stop: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handler::handle_connection(self.clone(), stream, peer));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }
        info!("peer server stopped");
    }

    async fn persist(&self) -> Result<()> {
        if let Some(wallet) = &self.wallet {
            wallet
                .lock()
                .await
                .save_to_file(&self.config.wallet_path)
                .with_context(|| format!("saving wallet {}", self.config.wallet_path.display()))?;
            info!(path = %self.config.wallet_path.display(), "wallet saved");
        }
        self.chain.flush()?;
        Ok(())
    }
}
