use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chainlib::sha256::Hash;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub address: String,
    pub version: Option<u32>,
    pub best_height: Option<u64>,
}

impl Peer {
    fn new(address: String) -> Self {
        Self {
            address,
            version: None,
            best_height: None,
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    peers: Vec<Peer>,
    blocks_in_transit: VecDeque<Hash>,
}

/// Known peers, in insertion order, plus the block hashes requested but not
/// yet received. Both live behind one mutex, which is never held across an
/// `.await`.
#[derive(Debug)]
pub struct PeerRegistry {
    inner: Mutex<Registry>,
    max_in_transit: usize,
}

impl PeerRegistry {
    pub fn new(bootstrap: impl IntoIterator<Item = String>, max_in_transit: usize) -> Self {
        let registry = Self {
            inner: Mutex::new(Registry::default()),
            max_in_transit,
        };
        for address in bootstrap {
            registry.add(&address);
        }
        registry
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `address`; returns `false` if it was already known.
    pub fn add(&self, address: &str) -> bool {
        let mut registry = self.lock();
        if registry.peers.iter().any(|peer| peer.address == address) {
            return false;
        }
        registry.peers.push(Peer::new(address.to_string()));
        info!(peer = %address, total = registry.peers.len(), "registered peer");
        true
    }

    /// Records handshake metadata, registering the peer if needed.
    pub fn update(&self, address: &str, version: u32, best_height: u64) {
        let mut registry = self.lock();
        match registry.peers.iter_mut().find(|peer| peer.address == address) {
            Some(peer) => {
                peer.version = Some(version);
                peer.best_height = Some(best_height);
            }
            None => {
                registry.peers.push(Peer {
                    address: address.to_string(),
                    version: Some(version),
                    best_height: Some(best_height),
                });
                info!(peer = %address, total = registry.peers.len(), "registered peer");
            }
        }
    }

    pub fn remove(&self, address: &str) {
        let mut registry = self.lock();
        let before = registry.peers.len();
        registry.peers.retain(|peer| peer.address != address);
        if registry.peers.len() != before {
            info!(peer = %address, "dropped peer");
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.lock().peers.iter().any(|peer| peer.address == address)
    }

    pub fn seed(&self) -> Option<String> {
        self.lock().peers.first().map(|peer| peer.address.clone())
    }

    pub fn get(&self, address: &str) -> Option<Peer> {
        self.lock()
            .peers
            .iter()
            .find(|peer| peer.address == address)
            .cloned()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.lock()
            .peers
            .iter()
            .map(|peer| peer.address.clone())
            .collect()
    }

    /// Addresses of every peer not listed in `exclude`.
    pub fn others(&self, exclude: &[&str]) -> Vec<String> {
        self.lock()
            .peers
            .iter()
            .filter(|peer| !exclude.contains(&peer.address.as_str()))
            .map(|peer| peer.address.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    /// Replaces the in-transit list, keeping at most `max_in_transit` hashes.
    pub fn set_in_transit(&self, items: &[Hash]) {
        let mut registry = self.lock();
        registry.blocks_in_transit = items.iter().take(self.max_in_transit).copied().collect();
        if items.len() > self.max_in_transit {
            debug!(
                announced = items.len(),
                kept = self.max_in_transit,
                "truncated blocks in transit"
            );
        }
    }

    /// Pops the next hash to request.
    pub fn next_in_transit(&self) -> Option<Hash> {
        self.lock().blocks_in_transit.pop_front()
    }

    pub fn in_transit_len(&self) -> usize {
        self.lock().blocks_in_transit.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_bootstrap_peer_is_the_seed() {
        let peers = PeerRegistry::new(vec!["seed:3000".into(), "b:3000".into()], 10);
        assert_eq!(peers.seed().as_deref(), Some("seed:3000"));
        assert!(!peers.add("b:3000"));
        assert!(peers.add("c:3000"));
        assert_eq!(peers.len(), 3);
        assert_eq!(peers.others(&["seed:3000", "c:3000"]), vec!["b:3000".to_string()]);
    }

    #[test]
    fn update_records_metadata() {
        let peers = PeerRegistry::new(Vec::new(), 10);
        peers.update("a:3000", 1, 7);

        let peer = peers.get("a:3000").unwrap();
        assert_eq!(peer.version, Some(1));
        assert_eq!(peer.best_height, Some(7));

        peers.remove("a:3000");
        assert!(!peers.contains("a:3000"));
    }

    #[test]
    fn in_transit_is_bounded_and_fifo() {
        let peers = PeerRegistry::new(Vec::new(), 2);
        let hashes: Vec<Hash> = (0u8..3).map(|i| Hash::digest(&[i]).unwrap()).collect();
        peers.set_in_transit(&hashes);

        assert_eq!(peers.in_transit_len(), 2);
        assert_eq!(peers.next_in_transit(), Some(hashes[0]));
        assert_eq!(peers.next_in_transit(), Some(hashes[1]));
        assert_eq!(peers.next_in_transit(), None);
    }
}
