use std::{sync::Arc, time::Duration};

use chainlib::error::Result;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::server::NodeServer;

/// Periodically checks how long ago the tip was mined and nudges the miner
/// when it is older than the block interval. Never exits on error.
pub async fn run(node: Arc<NodeServer>, mut stop: broadcast::Receiver<()>) {
    let interval = node.config.monitor_interval();
    info!(?interval, "time monitor started");

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if let Err(e) = check_tip_age(&node) {
            warn!("cannot read chain tip: {e}");
        }
    }
    info!("time monitor stopped");
}

/// Returns the tip age if a time trigger was sent.
pub fn check_tip_age(node: &NodeServer) -> Result<Option<Duration>> {
    if !node.miner.is_idle() {
        return Ok(None);
    }

    let tip = node.chain.get_block(&node.chain.tip())?;
    // a tip stamped in the future counts as fresh
    let elapsed = (Utc::now() - tip.timestamp).to_std().unwrap_or_default();
    debug!(elapsed_secs = elapsed.as_secs(), "tip age");

    if elapsed > node.config.block_interval() {
        node.miner.signal_elapsed(elapsed);
        return Ok(Some(elapsed));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, test_node};

    #[tokio::test]
    async fn fresh_tip_sends_nothing() {
        let (_dir, node) = test_node(test_config).await;
        assert_eq!(check_tip_age(&node).unwrap(), None);
        assert!(node.miner.time_events.1.is_empty());
    }

    #[tokio::test]
    async fn stale_tip_signals_the_miner() {
        let (_dir, node) = test_node(|dir| {
            let mut config = test_config(dir);
            config.block_interval_secs = 0;
            config
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let elapsed = check_tip_age(&node).unwrap().unwrap();
        assert!(elapsed > Duration::ZERO);
        assert_eq!(node.miner.time_events.1.try_recv().unwrap(), elapsed);
    }

    #[tokio::test]
    async fn busy_miner_is_not_nudged() {
        let (_dir, node) = test_node(|dir| {
            let mut config = test_config(dir);
            config.block_interval_secs = 0;
            config
        })
        .await;
        let _guard = node.miner.try_begin().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(check_tip_age(&node).unwrap(), None);
        assert!(node.miner.time_events.1.is_empty());
    }
}
