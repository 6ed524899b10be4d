/// Mining difficulty: a block hash must be below 2^(256 - TARGET_BITS).
pub const TARGET_BITS: u32 = 24;
/// Reward paid by every coinbase transaction.
pub const SUBSIDY: u64 = 10;
/// Upper bound of the proof-of-work nonce search.
pub const MAX_NONCE: u64 = i64::MAX as u64;
pub const GENESIS_COINBASE_DATA: &str =
    "May 7 2019, 10:00pm, The Times Jürgen Klopp makes Liverpool believe they can do the impossible";

pub mod blockchain;
pub mod crypto;
pub mod error;
pub mod network;
pub mod sha256;
pub mod types;
pub mod util;
pub mod utxo;

use serde::{Deserialize, Serialize};
use uint::construct_uint;

construct_uint! {
    #[derive(Serialize, Deserialize)]
    pub struct U256(4);
}

/// Largest hash value accepted for the given difficulty.
pub fn target(target_bits: u32) -> U256 {
    U256::MAX >> (target_bits as usize)
}
