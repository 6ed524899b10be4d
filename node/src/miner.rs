use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use chainlib::{
    error::ChainError,
    sha256::Hash,
    types::{Block, Transaction},
    util::Saveable,
};
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::server::NodeServer;

/// What woke the scheduler up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    MempoolDepth,
    ElapsedTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Idle,
    Mining,
}

/// Held for the duration of one mining attempt; the scheduler returns to
/// idle when it is dropped, whatever the outcome.
#[derive(Debug)]
pub struct MiningGuard {
    mining: Arc<AtomicBool>,
}

impl Drop for MiningGuard {
    fn drop(&mut self) {
        self.mining.store(false, Ordering::Release);
    }
}

/// Decides when to mine. Triggers arrive on two bounded channels; a trigger
/// that finds the channel full, or arrives while an attempt is running, is
/// dropped.
#[derive(Debug)]
pub struct MiningScheduler {
    mining: Arc<AtomicBool>,
    /// Configured reward address, or one taken from the wallet on first use.
    address: Mutex<Option<String>>,
    pub(crate) tx_events: (flume::Sender<Hash>, flume::Receiver<Hash>),
    pub(crate) time_events: (flume::Sender<Duration>, flume::Receiver<Duration>),
}

impl MiningScheduler {
    pub fn new(address: Option<String>) -> Self {
        Self {
            mining: Arc::new(AtomicBool::new(false)),
            address: Mutex::new(address),
            tx_events: flume::bounded(1),
            time_events: flume::bounded(1),
        }
    }

    pub fn state(&self) -> MinerState {
        if self.mining.load(Ordering::Acquire) {
            MinerState::Mining
        } else {
            MinerState::Idle
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state() == MinerState::Idle
    }

    /// Idle to Mining, atomically. `None` if an attempt is already running.
    pub fn try_begin(&self) -> Option<MiningGuard> {
        self.mining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| MiningGuard {
                mining: self.mining.clone(),
            })
    }

    pub fn signal_transaction(&self, id: Hash) {
        if self.tx_events.0.try_send(id).is_err() {
            debug!(txid = %id, "mining trigger dropped");
        }
    }

    pub fn signal_elapsed(&self, elapsed: Duration) {
        if self.time_events.0.try_send(elapsed).is_err() {
            debug!(?elapsed, "time trigger dropped");
        }
    }
}

/// Scheduler loop: waits on stop and both trigger channels, and starts an
/// attempt when a trigger's condition holds and no attempt is running.
pub async fn run(node: Arc<NodeServer>, mut stop: broadcast::Receiver<()>) {
    let tx_events = node.miner.tx_events.1.clone();
    let time_events = node.miner.time_events.1.clone();
    let threshold = node.config.mempool_threshold;
    let block_interval = node.config.block_interval();
    let mut in_flight: Option<JoinHandle<()>> = None;

    info!(threshold, ?block_interval, "mining scheduler started");

    loop {
        let trigger = tokio::select! {
            _ = stop.recv() => break,
            Ok(txid) = tx_events.recv_async() => {
                let pending = node.mempool.len();
                debug!(%txid, pending, "transaction trigger");
                (pending > threshold).then_some(Trigger::MempoolDepth)
            }
            Ok(elapsed) = time_events.recv_async() => {
                debug!(?elapsed, "time trigger");
                (elapsed > block_interval).then_some(Trigger::ElapsedTime)
            }
        };

        let Some(trigger) = trigger else { continue };
        let Some(guard) = node.miner.try_begin() else {
            debug!(?trigger, "already mining, trigger ignored");
            continue;
        };

        let node = node.clone();
        in_flight = Some(tokio::spawn(async move {
            if let Err(e) = mine_transactions(&node, guard, trigger).await {
                error!(?trigger, "mining attempt failed: {e:#}");
            }
        }));
    }

    if let Some(attempt) = in_flight.take() {
        if !attempt.is_finished() {
            info!("waiting for in-flight mining attempt");
        }
        let _ = attempt.await;
    }
    info!("mining scheduler stopped");
}

/// Runs one attempt if the scheduler is idle. `Ok(None)` means another
/// attempt already held the scheduler.
pub async fn attempt(node: &NodeServer, trigger: Trigger) -> Result<Option<Block>> {
    let Some(guard) = node.miner.try_begin() else {
        return Ok(None);
    };
    mine_transactions(node, guard, trigger).await.map(Some)
}

/// Times a mining attempt re-validates after the chain moved underneath it.
const MAX_STALE_RETRIES: usize = 3;

/// Mines every mempool transaction that still validates, plus a coinbase.
/// The block is only committed on the tip the UTXO index was built from; if
/// the chain has moved the index is rebuilt and the mempool re-validated.
/// The mempool is only touched after the block is committed.
async fn mine_transactions(node: &NodeServer, _guard: MiningGuard, trigger: Trigger) -> Result<Block> {
    let started = Instant::now();
    let address = mining_address(node).await?;
    let mut retries = 0;

    let (block, included) = loop {
        let (parent, mut transactions) = {
            let utxos = node.utxos.read().await;
            let Some(parent) = utxos.tip() else {
                bail!("utxo index has not been built");
            };
            (parent, node.mempool.drain_validated(&utxos))
        };
        let pending = node.mempool.len();
        if transactions.len() < pending {
            warn!(
                valid = transactions.len(),
                pending, "some mempool transactions are not spendable"
            );
        }

        transactions.push(Transaction::coinbase(&address, "")?);
        let included: Vec<Hash> = transactions.iter().map(|tx| tx.id).collect();

        info!(?trigger, %parent, transactions = included.len(), "mining block");
        let chain = node.chain.clone();
        let mined = tokio::task::spawn_blocking(move || chain.mine_block_on(parent, transactions))
            .await
            .context("mining task panicked")?;

        match mined {
            Ok(block) => break (block, included),
            Err(ChainError::StaleTip(tip)) if retries < MAX_STALE_RETRIES => {
                retries += 1;
                warn!(expected = %parent, found = %tip, "chain moved since validation, revalidating");
                node.reindex().await?;
            }
            Err(e) => return Err(e.into()),
        }
    };

    let reindexed = node.reindex().await;
    let removed = node.mempool.remove_all(&included);
    reindexed?;

    info!(
        hash = %block.hash,
        nonce = block.nonce,
        height = node.chain.height(),
        removed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "block mined"
    );

    node.announce_block(block.hash).await;
    Ok(block)
}

async fn mining_address(node: &NodeServer) -> Result<String> {
    let mut slot = node.miner.address.lock().await;
    if let Some(address) = slot.as_ref() {
        return Ok(address.clone());
    }

    let Some(wallet) = &node.wallet else {
        bail!("no mining address configured and no wallet loaded");
    };
    let mut wallet = wallet.lock().await;
    let address = wallet.create_address()?;
    wallet
        .save_to_file(&node.config.wallet_path)
        .with_context(|| format!("saving wallet {}", node.config.wallet_path.display()))?;
    info!(%address, "created mining address");

    *slot = Some(address.clone());
    Ok(address)
}
