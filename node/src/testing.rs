use std::{path::Path, sync::Arc};

use chainlib::blockchain::Blockchain;
use tempfile::TempDir;

use crate::{config::NodeConfig, server::NodeServer};

pub const TEST_BITS: u32 = 8;

/// Config for an isolated node: ledger and wallet under `dir`, fixed address,
/// no peers, easy difficulty.
pub fn test_config(dir: &Path) -> NodeConfig {
    NodeConfig {
        ledger_path: dir.join("ledger"),
        wallet_path: dir.join("wallet.cbor"),
        node_address: Some("127.0.0.1:1".into()),
        mining_address: Some("miner".into()),
        target_bits: TEST_BITS,
        ..NodeConfig::default()
    }
}

/// Node over a fresh ledger whose genesis pays `alice`.
pub async fn test_node(config: impl FnOnce(&Path) -> NodeConfig) -> (TempDir, Arc<NodeServer>) {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let chain = Blockchain::create(&config.ledger_path, "alice", config.target_bits).unwrap();
    let node = NodeServer::new(config, chain).await.unwrap();
    (dir, node)
}
