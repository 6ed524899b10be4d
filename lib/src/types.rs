mod block;
mod transaction;

pub use block::Block;
pub use transaction::{COINBASE_VOUT, Transaction, TxInput, TxOutput};
