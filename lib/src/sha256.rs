use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha256::digest;

use crate::{
    U256,
    error::{ChainError, Result},
};

/// SHA-256 digest, ordered as a big-endian unsigned integer.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(U256);

impl Hash {
    pub fn hash<T: serde::Serialize>(data: &T) -> Result<Self> {
        let mut serialized: Vec<u8> = vec![];
        ciborium::into_writer(data, &mut serialized)
            .map_err(|e| ChainError::Serialization(e.to_string()))?;

        Self::digest(&serialized)
    }

    pub fn digest(bytes: &[u8]) -> Result<Self> {
        let hash = digest(bytes);
        let Ok(hash_bytes) = hex::decode(hash) else {
            return Err(ChainError::CorruptData("sha256 digest is not hex".into()));
        };

        Self::from_slice(&hash_bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let hash_array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainError::CorruptData(format!("hash of {} bytes", bytes.len())))?;

        Ok(Hash(U256::from_big_endian(&hash_array)))
    }

    pub fn matches_target(&self, target: U256) -> bool {
        self.0 <= target
    }

    pub fn zero() -> Self {
        Hash(U256::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        self.0.to_big_endian()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

impl FromStr for Hash {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| ChainError::CorruptData(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_through_from_str() {
        let hash = Hash::digest(b"gopher").unwrap();
        let parsed: Hash = hash.to_string().parse().unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(hash.to_string().len(), 64);
    }

    #[test]
    fn big_endian_ordering_drives_target_check() {
        let mut low = [0u8; 32];
        low[31] = 1;
        let mut high = [0u8; 32];
        high[0] = 0x01;

        let low = Hash::from_slice(&low).unwrap();
        let high = Hash::from_slice(&high).unwrap();

        assert!(low < high);
        assert!(low.matches_target(crate::target(24)));
        assert!(!high.matches_target(crate::target(24)));
    }

    #[test]
    fn rejects_short_slices() {
        assert!(matches!(
            Hash::from_slice(&[0u8; 31]),
            Err(ChainError::CorruptData(_))
        ));
    }
}
