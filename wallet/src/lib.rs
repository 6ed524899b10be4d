use std::{
    collections::BTreeMap,
    io::{Error as IoError, ErrorKind as IoErrorKind, Read, Result as IoResult, Write},
    path::Path,
};

use chainlib::{crypto::PrivateKey, error::Result, util::Saveable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Key pairs owned by this node, indexed by address.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Wallet {
    keys: BTreeMap<String, PrivateKey>,
}

impl Wallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the wallet file at `path`, or starts an empty wallet if there is none.
    pub fn load_or_default(path: impl AsRef<Path>) -> IoResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no wallet file, starting empty");
            return Ok(Self::new());
        }

        let wallet = Self::load_from_file(path)?;
        info!(path = %path.display(), addresses = wallet.len(), "loaded wallet");
        Ok(wallet)
    }

    /// Generates a fresh key pair and returns its address.
    pub fn create_address(&mut self) -> Result<String> {
        let key = PrivateKey::new_key();
        let address = key.public_key().address()?;
        self.keys.insert(address.clone(), key);
        info!(%address, "created address");
        Ok(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn key(&self, address: &str) -> Option<&PrivateKey> {
        self.keys.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.keys.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Saveable for Wallet {
    fn load<I: Read>(reader: I) -> IoResult<Self> {
        ciborium::de::from_reader(reader)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to deserialise wallet"))
    }

    fn save<O: Write>(&self, writer: O) -> IoResult<()> {
        ciborium::ser::into_writer(self, writer)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to serialise wallet"))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn created_addresses_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wallet.cbor");

        let mut wallet = Wallet::load_or_default(&path).unwrap();
        assert!(wallet.is_empty());
        let first = wallet.create_address().unwrap();
        let second = wallet.create_address().unwrap();
        assert_ne!(first, second);
        wallet.save_to_file(&path).unwrap();

        let restored = Wallet::load_or_default(&path).unwrap();
        assert_eq!(restored.len(), 2);
        assert!(restored.contains(&first));
        assert!(restored.contains(&second));
        assert_eq!(
            restored.key(&first).unwrap().public_key().address().unwrap(),
            first
        );
    }

    #[test]
    fn garbage_file_is_invalid_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wallet.cbor");
        std::fs::write(&path, b"\xff\xff").unwrap();

        let err = Wallet::load_or_default(&path).unwrap_err();
        assert_eq!(err.kind(), IoErrorKind::InvalidData);
    }
}
