use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ChainError, Result},
    sha256::Hash,
    utxo::UtxoIndex,
};

/// Output index carried by the sentinel input of a coinbase transaction.
pub const COINBASE_VOUT: u32 = u32::MAX;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxInput {
    pub txid: Hash,
    pub vout: u32,
    /// Unlocking data; for a regular input this is the owning address.
    pub unlock: String,
}

impl TxInput {
    pub fn can_unlock_output_with(&self, address: &str) -> bool {
        self.unlock == address
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    /// Locking datum: the address allowed to spend this output.
    pub address: String,
}

impl TxOutput {
    pub fn new(value: u64, address: impl Into<String>) -> Self {
        Self {
            value,
            address: address.into(),
        }
    }

    pub fn is_locked_with(&self, address: &str) -> bool {
        self.address == address
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub id: Hash,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Result<Self> {
        let id = Hash::hash(&(&inputs, &outputs))?;
        Ok(Self {
            id,
            inputs,
            outputs,
        })
    }

    /// Reward transaction paying `SUBSIDY` to `to`. Empty `data` is replaced by a
    /// unique reward note so that two coinbases never share an id.
    pub fn coinbase(to: &str, data: &str) -> Result<Self> {
        let data = if data.is_empty() {
            format!("Reward to '{to}' ({})", Uuid::new_v4())
        } else {
            data.to_string()
        };

        let input = TxInput {
            txid: Hash::zero(),
            vout: COINBASE_VOUT,
            unlock: data,
        };
        Self::new(vec![input], vec![TxOutput::new(crate::SUBSIDY, to)])
    }

    /// Spends outputs of `from` picked by the index, sending change back to `from`.
    pub fn transfer(from: &str, to: &str, amount: u64, utxos: &UtxoIndex) -> Result<Self> {
        let (accumulated, spendable) = utxos.find_spendable_outputs(from, amount);
        if accumulated < amount {
            return Err(ChainError::InsufficientFunds {
                needed: amount,
                available: accumulated,
            });
        }

        let inputs = spendable
            .into_iter()
            .flat_map(|(txid, indices)| {
                indices.into_iter().map(move |vout| TxInput {
                    txid,
                    vout,
                    unlock: from.to_string(),
                })
            })
            .collect();

        let mut outputs = vec![TxOutput::new(amount, to)];
        if accumulated > amount {
            outputs.push(TxOutput::new(accumulated - amount, from));
        }

        Self::new(inputs, outputs)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].txid.is_zero()
            && self.inputs[0].vout == COINBASE_VOUT
    }

    /// `None` if the output values overflow `u64`.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |total, output| total.checked_add(output.value))
    }
}
