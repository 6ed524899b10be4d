use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Node settings. Every field has a default so a config file only needs the
/// values it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub ledger_path: PathBuf,
    pub wallet_path: PathBuf,
    pub port: u16,
    /// Address peers use to reach this node; overrides discovery.
    pub node_address: Option<String>,
    /// Plain-text endpoint returning this host's public IP.
    pub external_ip_url: Option<String>,
    pub external_ip_timeout_secs: u64,
    /// The first entry is the seed peer.
    pub bootstrap_peers: Vec<String>,
    pub mining_enabled: bool,
    pub mining_address: Option<String>,
    /// Mine once the mempool holds more than this many transactions.
    pub mempool_threshold: usize,
    /// Mine once the tip is older than this.
    pub block_interval_secs: u64,
    /// How often the time-adjustment monitor looks at the tip.
    pub monitor_interval_ms: u64,
    pub target_bits: u32,
    pub max_blocks_in_transit: usize,
    pub shutdown_timeout_secs: u64,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("blockchain.db"),
            wallet_path: PathBuf::from("wallet.cbor"),
            port: 3000,
            node_address: None,
            external_ip_url: None,
            external_ip_timeout_secs: 5,
            bootstrap_peers: Vec::new(),
            mining_enabled: true,
            mining_address: None,
            mempool_threshold: 2,
            block_interval_secs: 120,
            monitor_interval_ms: 10_000,
            target_bits: chainlib::TARGET_BITS,
            max_blocks_in_transit: 500,
            shutdown_timeout_secs: 10,
            log_level: "info".into(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).context("invalid node config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=255).contains(&self.target_bits) {
            bail!("target_bits must be within 1..=255, got {}", self.target_bits);
        }
        if self.monitor_interval_ms == 0 {
            bail!("monitor_interval_ms must be positive");
        }
        if self.max_blocks_in_transit == 0 {
            bail!("max_blocks_in_transit must be positive");
        }
        Ok(())
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_secs(self.block_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn external_ip_timeout(&self) -> Duration {
        Duration::from_secs(self.external_ip_timeout_secs)
    }

    pub fn fallback_address(&self) -> String {
        self.node_address
            .clone()
            .unwrap_or_else(|| format!("localhost:{}", self.port))
    }
}
