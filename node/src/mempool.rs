use std::collections::HashSet;

use chainlib::{sha256::Hash, types::Transaction, utxo::UtxoIndex};
use dashmap::DashMap;
use tracing::debug;

/// Transactions waiting to be mined, keyed by id.
///
/// Entries leave only through [`Mempool::remove_all`] after their block is
/// committed; there is no expiry. No map reference is held while another lock
/// is taken.
#[derive(Debug, Default)]
pub struct Mempool {
    transactions: DashMap<Hash, Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the entry for `transaction.id`.
    pub fn submit(&self, transaction: Transaction) {
        debug!(txid = %transaction.id, "mempool submit");
        self.transactions.insert(transaction.id, transaction);
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.transactions.contains_key(id)
    }

    pub fn get(&self, id: &Hash) -> Option<Transaction> {
        self.transactions.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Mining input: every transaction that validates against `utxos`, in id
    /// order. A transaction spending an output already claimed earlier in the
    /// batch is left out. Nothing is removed.
    pub fn drain_validated(&self, utxos: &UtxoIndex) -> Vec<Transaction> {
        let mut candidates: Vec<Transaction> = self
            .transactions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        candidates.sort_by_key(|transaction| transaction.id);

        let mut claimed = HashSet::new();
        let mut selected = Vec::new();
        for transaction in candidates {
            if !utxos.validate(&transaction) {
                debug!(txid = %transaction.id, "rejected: inputs not spendable");
                continue;
            }
            let outpoints: Vec<_> = transaction
                .inputs
                .iter()
                .map(|input| (input.txid, input.vout))
                .collect();
            if outpoints.iter().any(|outpoint| claimed.contains(outpoint)) {
                debug!(txid = %transaction.id, "rejected: conflicts with selected transaction");
                continue;
            }
            claimed.extend(outpoints);
            selected.push(transaction);
        }

        selected
    }

    pub fn remove_all<'a>(&self, ids: impl IntoIterator<Item = &'a Hash>) -> usize {
        ids.into_iter()
            .filter(|id| self.transactions.remove(*id).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use chainlib::{
        blockchain::Blockchain,
        types::{TxInput, TxOutput},
    };
    use tempfile::TempDir;

    use super::*;

    fn spend(txid: Hash, vout: u32, owner: &str, value: u64, to: &str) -> Transaction {
        Transaction::new(
            vec![TxInput {
                txid,
                vout,
                unlock: owner.into(),
            }],
            vec![TxOutput::new(value, to)],
        )
        .unwrap()
    }

    #[test]
    fn resubmission_overwrites() {
        let pool = Mempool::new();
        let tx = spend(Hash::digest(b"a").unwrap(), 0, "alice", 1, "bob");
        pool.submit(tx.clone());
        pool.submit(tx.clone());

        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(&tx.id), Some(tx));
    }

    #[test]
    fn drain_keeps_entries_and_skips_conflicts() {
        let dir = TempDir::new().unwrap();
        let chain = Blockchain::create(dir.path().join("chain"), "alice", 8).unwrap();
        let utxos = UtxoIndex::rebuild(&chain).unwrap();
        let (txid, vout, _) = utxos.iter().next().unwrap();

        let pool = Mempool::new();
        pool.submit(spend(*txid, vout, "alice", 5, "bob"));
        pool.submit(spend(*txid, vout, "alice", 6, "carol"));
        pool.submit(spend(Hash::digest(b"ghost").unwrap(), 0, "alice", 1, "bob"));

        let selected = pool.drain_validated(&utxos);
        assert_eq!(selected.len(), 1);
        assert_eq!(pool.len(), 3);

        let removed = pool.remove_all(selected.iter().map(|tx| &tx.id));
        assert_eq!(removed, 1);
        assert_eq!(pool.len(), 2);
    }
}
