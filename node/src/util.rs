use std::time::Duration;

use chainlib::error::{ChainError, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::NodeConfig;

/// Installs the fmt subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Asks `url` for this host's public IP.
pub async fn discover_external_address(url: &str, timeout: Duration) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ChainError::ExternalService(e.to_string()))?;

    let body = client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| ChainError::ExternalService(format!("{url}: {e}")))?
        .text()
        .await
        .map_err(|e| ChainError::ExternalService(format!("{url}: {e}")))?;

    let ip = body.trim();
    if ip.is_empty() {
        return Err(ChainError::ExternalService(format!("{url}: empty response")));
    }
    Ok(ip.to_string())
}

/// Address announced to peers: the configured one, else the discovered public
/// IP, else `localhost`. Discovery failures are logged, never fatal.
pub async fn resolve_node_address(config: &NodeConfig) -> String {
    if let Some(address) = &config.node_address {
        return address.clone();
    }

    if let Some(url) = &config.external_ip_url {
        match discover_external_address(url, config.external_ip_timeout()).await {
            Ok(ip) => {
                let address = format!("{ip}:{}", config.port);
                info!(%address, "discovered external address");
                return address;
            }
            Err(e) => warn!("external address lookup failed, using fallback: {e}"),
        }
    }

    config.fallback_address()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn configured_address_wins() {
        let config = NodeConfig {
            node_address: Some("10.0.0.1:3000".into()),
            external_ip_url: Some("http://127.0.0.1:9/".into()),
            ..NodeConfig::default()
        };
        assert_eq!(resolve_node_address(&config).await, "10.0.0.1:3000");
    }

    #[tokio::test]
    async fn failed_lookup_falls_back() {
        let config = NodeConfig {
            port: 3999,
            external_ip_url: Some("http://127.0.0.1:9/".into()),
            external_ip_timeout_secs: 1,
            ..NodeConfig::default()
        };

        assert!(matches!(
            discover_external_address("http://127.0.0.1:9/", Duration::from_secs(1)).await,
            Err(ChainError::ExternalService(_))
        ));
        assert_eq!(resolve_node_address(&config).await, "localhost:3999");
    }
}
