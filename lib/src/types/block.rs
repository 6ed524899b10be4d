use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ChainError, Result},
    sha256::Hash,
    types::Transaction,
};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub timestamp: DateTime<Utc>,
    pub transactions: Vec<Transaction>,
    /// `None` only for the genesis block.
    pub prev_block_hash: Option<Hash>,
    pub nonce: u64,
    pub hash: Hash,
}

impl Block {
    /// Runs the proof-of-work search for a block on top of `prev_block_hash`.
    pub fn mine(
        prev_block_hash: Option<Hash>,
        transactions: Vec<Transaction>,
        target_bits: u32,
    ) -> Result<Self> {
        Self::mine_within(prev_block_hash, transactions, target_bits, crate::MAX_NONCE)
    }

    pub fn mine_within(
        prev_block_hash: Option<Hash>,
        transactions: Vec<Transaction>,
        target_bits: u32,
        max_nonce: u64,
    ) -> Result<Self> {
        let timestamp = Utc::now();
        let target = crate::target(target_bits);
        let prefix = preimage_prefix(&timestamp, &transactions, &prev_block_hash)?;

        for nonce in 0..=max_nonce {
            let hash = hash_with_nonce(&prefix, nonce)?;
            if hash.matches_target(target) {
                return Ok(Self {
                    timestamp,
                    transactions,
                    prev_block_hash,
                    nonce,
                    hash,
                });
            }
        }

        Err(ChainError::ExhaustedSearchSpace)
    }

    pub fn compute_hash(&self) -> Result<Hash> {
        let prefix = preimage_prefix(&self.timestamp, &self.transactions, &self.prev_block_hash)?;
        hash_with_nonce(&prefix, self.nonce)
    }

    /// Recomputes the hash from the stored fields and checks it against the target.
    pub fn is_valid(&self, target_bits: u32) -> Result<bool> {
        Ok(self.compute_hash()? == self.hash && self.hash.matches_target(crate::target(target_bits)))
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block_hash.is_none()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| ChainError::Serialization(format!("block {}: {e}", self.hash)))?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| ChainError::CorruptData(format!("block: {e}")))
    }
}

// timestamp, transactions and previous hash do not change while the nonce is searched,
// so they are encoded once and the nonce is appended per attempt
fn preimage_prefix(
    timestamp: &DateTime<Utc>,
    transactions: &[Transaction],
    prev_block_hash: &Option<Hash>,
) -> Result<Vec<u8>> {
    let mut prefix = Vec::new();
    ciborium::into_writer(&(timestamp, transactions, prev_block_hash), &mut prefix)
        .map_err(|e| ChainError::Serialization(format!("block header: {e}")))?;
    Ok(prefix)
}

fn hash_with_nonce(prefix: &[u8], nonce: u64) -> Result<Hash> {
    let mut data = Vec::with_capacity(prefix.len() + 8);
    data.extend_from_slice(prefix);
    data.extend_from_slice(&nonce.to_be_bytes());
    Hash::digest(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BITS: u32 = 8;

    fn coinbase() -> Transaction {
        Transaction::coinbase("miner", "").unwrap()
    }

    #[test]
    fn mined_block_meets_target_and_rehashes() {
        let block = Block::mine(None, vec![coinbase()], TEST_BITS).unwrap();

        assert!(block.is_genesis());
        assert!(block.is_valid(TEST_BITS).unwrap());
        assert_eq!(block.compute_hash().unwrap(), block.hash);
        assert!(block.hash.matches_target(crate::target(TEST_BITS)));
    }

    #[test]
    fn tampering_invalidates_block() {
        let mut block = Block::mine(None, vec![coinbase()], TEST_BITS).unwrap();
        block.transactions.push(coinbase());

        assert!(!block.is_valid(TEST_BITS).unwrap());
    }

    #[test]
    fn exhausted_search_is_an_error() {
        // a 255-bit target only accepts hashes 0 and 1
        let result = Block::mine_within(None, vec![coinbase()], 255, 16);
        assert!(matches!(result, Err(ChainError::ExhaustedSearchSpace)));
    }

    #[test]
    fn bytes_round_trip_and_garbage_is_corrupt() {
        let block = Block::mine(Some(Hash::digest(b"prev").unwrap()), vec![coinbase()], TEST_BITS)
            .unwrap();
        let decoded = Block::from_bytes(&block.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, block);

        assert!(matches!(
            Block::from_bytes(b"not a block"),
            Err(ChainError::CorruptData(_))
        ));
    }
}
