//! Inbound peer messages. Each connection carries one message; replies go out
//! on fresh connections to the sender's advertised address.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chainlib::{
    network::{InvKind, Message},
    sha256::Hash,
    types::{Block, Transaction},
};
use tokio::{net::TcpStream, time::timeout};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::server::NodeServer;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn handle_connection(node: Arc<NodeServer>, mut stream: TcpStream, peer: SocketAddr) {
    let span = info_span!("conn", id = %Uuid::new_v4(), %peer);
    async move {
        let message = match timeout(READ_TIMEOUT, Message::receive_async(&mut stream)).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                warn!("bad message: {e}");
                return;
            }
            Err(_) => {
                warn!("timed out waiting for a message");
                return;
            }
        };

        let command = message.name();
        debug!(command, "received");
        if let Err(e) = dispatch(&node, message).await {
            warn!(command, "handling failed: {e:#}");
        }
    }
    .instrument(span)
    .await
}

pub async fn dispatch(node: &NodeServer, message: Message) -> Result<()> {
    match message {
        Message::Version {
            version,
            best_height,
            addr_from,
        } => handle_version(node, version, best_height, addr_from).await,
        Message::Addr(addresses) => handle_addr(node, addresses).await,
        Message::Inv {
            addr_from,
            kind,
            items,
        } => handle_inv(node, addr_from, kind, items).await,
        Message::GetBlocks { addr_from } => handle_get_blocks(node, addr_from).await,
        Message::GetData {
            addr_from,
            kind,
            id,
        } => handle_get_data(node, addr_from, kind, id).await,
        Message::Block { addr_from, block } => handle_block(node, addr_from, block).await,
        Message::Tx {
            addr_from,
            transaction,
        } => handle_tx(node, addr_from, transaction).await,
    }
}

async fn handle_version(
    node: &NodeServer,
    version: u32,
    best_height: u64,
    addr_from: String,
) -> Result<()> {
    if addr_from != node.address && node.peers.add(&addr_from) {
        info!(peer = %addr_from, "new peer");
    }
    node.peers.update(&addr_from, version, best_height);

    let height = node.chain.height();
    if height < best_height {
        let request = Message::GetBlocks {
            addr_from: node.address.clone(),
        };
        node.send(&addr_from, &request).await;
    } else if height > best_height {
        node.send(&addr_from, &node.version_message()).await;
    }
    Ok(())
}

async fn handle_addr(node: &NodeServer, addresses: Vec<String>) -> Result<()> {
    let request = Message::GetBlocks {
        addr_from: node.address.clone(),
    };
    for address in addresses {
        if address != node.address && node.peers.add(&address) {
            node.send(&address, &request).await;
        }
    }
    debug!(known = node.peers.len(), "peer list updated");
    Ok(())
}

async fn handle_inv(
    node: &NodeServer,
    addr_from: String,
    kind: InvKind,
    items: Vec<Hash>,
) -> Result<()> {
    debug!(peer = %addr_from, ?kind, count = items.len(), "inventory");
    match kind {
        InvKind::Block => {
            // announced tip first; fetch the unknown ones oldest first
            let mut wanted = Vec::with_capacity(items.len());
            for hash in items.iter().rev() {
                if !node.chain.contains(hash)? {
                    wanted.push(*hash);
                }
            }
            node.peers.set_in_transit(&wanted);
            if let Some(first) = node.peers.next_in_transit() {
                request_data(node, &addr_from, InvKind::Block, first).await;
            }
        }
        InvKind::Transaction => {
            if let Some(id) = items.first() {
                if !node.mempool.contains(id) {
                    request_data(node, &addr_from, InvKind::Transaction, *id).await;
                }
            }
        }
    }
    Ok(())
}

async fn handle_get_blocks(node: &NodeServer, addr_from: String) -> Result<()> {
    let chain = node.chain.clone();
    let items = tokio::task::spawn_blocking(move || chain.block_hashes())
        .await
        .context("block walk panicked")??;
    let reply = Message::Inv {
        addr_from: node.address.clone(),
        kind: InvKind::Block,
        items,
    };
    node.send(&addr_from, &reply).await;
    Ok(())
}

async fn handle_get_data(
    node: &NodeServer,
    addr_from: String,
    kind: InvKind,
    id: Hash,
) -> Result<()> {
    let reply = match kind {
        InvKind::Block => Message::Block {
            addr_from: node.address.clone(),
            block: node.chain.get_block(&id)?,
        },
        InvKind::Transaction => {
            let Some(transaction) = node.mempool.get(&id) else {
                debug!(txid = %id, "requested transaction not in mempool");
                return Ok(());
            };
            Message::Tx {
                addr_from: node.address.clone(),
                transaction,
            }
        }
    };
    node.send(&addr_from, &reply).await;
    Ok(())
}

async fn handle_block(node: &NodeServer, addr_from: String, block: Block) -> Result<()> {
    let hash = block.hash;
    let included: Vec<Hash> = block.transactions.iter().map(|tx| tx.id).collect();
    let chain = node.chain.clone();
    let added = tokio::task::spawn_blocking(move || chain.add_block(block))
        .await
        .context("block import panicked")?;
    match added {
        Ok(true) => {
            let removed = node.mempool.remove_all(&included);
            info!(%hash, peer = %addr_from, height = node.chain.height(), removed, "block added");
        }
        Ok(false) => debug!(%hash, "block already stored"),
        Err(e) => warn!(%hash, peer = %addr_from, "block rejected: {e}"),
    }

    match node.peers.next_in_transit() {
        Some(next) => request_data(node, &addr_from, InvKind::Block, next).await,
        None => node.reindex().await?,
    }
    Ok(())
}

async fn handle_tx(node: &NodeServer, addr_from: String, transaction: Transaction) -> Result<()> {
    let id = transaction.id;
    node.mempool.submit(transaction);

    if node.is_seed() {
        let announce = Message::Inv {
            addr_from: node.address.clone(),
            kind: InvKind::Transaction,
            items: vec![id],
        };
        for peer in node
            .peers
            .others(&[node.address.as_str(), addr_from.as_str()])
        {
            node.send(&peer, &announce).await;
        }
    }

    if node.config.mining_enabled {
        node.miner.signal_transaction(id);
    }
    Ok(())
}

async fn request_data(node: &NodeServer, address: &str, kind: InvKind, id: Hash) {
    let request = Message::GetData {
        addr_from: node.address.clone(),
        kind,
        id,
    };
    node.send(address, &request).await;
}
