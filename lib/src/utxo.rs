use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::{
    blockchain::Blockchain,
    error::Result,
    sha256::Hash,
    types::{Transaction, TxOutput},
};

/// Unspent outputs derived from the ledger, keyed by transaction id then output index.
///
/// The index is a cache: [`UtxoIndex::rebuild`] reconstructs it from the chain at any
/// time and it is never consulted for chain history. Ordered maps keep every scan
/// deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UtxoIndex {
    outputs: BTreeMap<Hash, BTreeMap<u32, TxOutput>>,
    /// Chain tip the index was built from.
    tip: Option<Hash>,
}

impl UtxoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks the chain tip to genesis. Inputs of a block are applied before its
    /// outputs are recorded, so an output consumed anywhere later in the chain
    /// (including later in the same block) is never reported unspent.
    pub fn rebuild(chain: &Blockchain) -> Result<Self> {
        let mut outputs: BTreeMap<Hash, BTreeMap<u32, TxOutput>> = BTreeMap::new();
        let mut spent: HashMap<Hash, HashSet<u32>> = HashMap::new();
        let mut blocks = 0usize;

        let tip = chain.tip();
        for block in chain.iter_from(tip) {
            let block = block?;
            blocks += 1;

            for transaction in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                for input in &transaction.inputs {
                    spent.entry(input.txid).or_default().insert(input.vout);
                }
            }

            for transaction in &block.transactions {
                let spent_here = spent.get(&transaction.id);
                for (index, output) in transaction.outputs.iter().enumerate() {
                    let index = index as u32;
                    if spent_here.is_some_and(|s| s.contains(&index)) {
                        continue;
                    }
                    outputs
                        .entry(transaction.id)
                        .or_default()
                        .insert(index, output.clone());
                }
            }
        }

        debug!(blocks, %tip, transactions = outputs.len(), "rebuilt utxo index");
        Ok(Self {
            outputs,
            tip: Some(tip),
        })
    }

    pub fn reindex(&mut self, chain: &Blockchain) -> Result<()> {
        *self = Self::rebuild(chain)?;
        Ok(())
    }

    pub fn tip(&self) -> Option<Hash> {
        self.tip
    }

    pub fn get(&self, txid: &Hash, vout: u32) -> Option<&TxOutput> {
        self.outputs.get(txid).and_then(|outputs| outputs.get(&vout))
    }

    /// Accumulates outputs locked by `address` until `amount` is reached.
    /// The returned total may fall short; callers check sufficiency.
    pub fn find_spendable_outputs(
        &self,
        address: &str,
        amount: u64,
    ) -> (u64, BTreeMap<Hash, Vec<u32>>) {
        let mut accumulated = 0u64;
        let mut selected: BTreeMap<Hash, Vec<u32>> = BTreeMap::new();

        'work: for (txid, outputs) in &self.outputs {
            for (index, output) in outputs {
                if accumulated >= amount {
                    break 'work;
                }
                if output.is_locked_with(address) {
                    accumulated = accumulated.saturating_add(output.value);
                    selected.entry(*txid).or_default().push(*index);
                }
            }
        }

        (accumulated, selected)
    }

    pub fn find_utxo(&self, address: &str) -> Vec<TxOutput> {
        self.outputs
            .values()
            .flat_map(|outputs| outputs.values())
            .filter(|output| output.is_locked_with(address))
            .cloned()
            .collect()
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.find_utxo(address)
            .iter()
            .fold(0u64, |total, output| total.saturating_add(output.value))
    }

    /// Checks that every input spends an unspent output it is able to unlock.
    ///
    /// Coinbase transactions are only ever created by the miner, so one arriving
    /// from outside is rejected, as is any transaction creating more value than
    /// it consumes.
    pub fn validate(&self, transaction: &Transaction) -> bool {
        if transaction.is_coinbase() || transaction.inputs.is_empty() {
            return false;
        }

        let mut seen = HashSet::new();
        let mut input_value = 0u64;
        for input in &transaction.inputs {
            if !seen.insert((input.txid, input.vout)) {
                return false;
            }
            match self.get(&input.txid, input.vout) {
                Some(output) if input.can_unlock_output_with(&output.address) => {
                    let Some(total) = input_value.checked_add(output.value) else {
                        return false;
                    };
                    input_value = total;
                }
                _ => return false,
            }
        }

        transaction
            .total_output_value()
            .is_some_and(|output_value| input_value >= output_value)
    }

    /// Number of outputs in the index.
    pub fn len(&self) -> usize {
        self.outputs.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Hash, u32, &TxOutput)> {
        self.outputs
            .iter()
            .flat_map(|(txid, outputs)| outputs.iter().map(move |(index, output)| (txid, *index, output)))
    }
}
