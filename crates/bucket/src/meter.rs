//! Per-transaction read-quota accounting for bulk loads.
//!
//! Soroban transactions declare the keys they will read and carry a byte
//! budget for those reads. The [`LedgerKeyMeter`] tracks the remaining
//! budget of every transaction in a batch; the bulk-load path consults
//! it before and after reading each entry so that a transaction whose
//! budget is exhausted stops pulling entries off disk.
//!
//! Keys that no transaction registered are unmetered and always load.

use std::collections::HashMap;

use stellar_xdr::curr::LedgerKey;

/// Tracks per-transaction read quotas across a bulk load.
#[derive(Debug, Default)]
pub struct LedgerKeyMeter {
    /// Remaining read budget per transaction, indexed by insertion order.
    tx_quotas: Vec<u64>,
    /// Which transactions declared each key.
    key_to_txs: HashMap<LedgerKey, Vec<usize>>,
}

impl LedgerKeyMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one transaction's read budget and footprint.
    pub fn add_transaction(&mut self, read_quota: u64, keys: impl IntoIterator<Item = LedgerKey>) {
        let tx = self.tx_quotas.len();
        self.tx_quotas.push(read_quota);
        for key in keys {
            self.key_to_txs.entry(key).or_default().push(tx);
        }
    }

    /// Whether any transaction that declared `key` can still afford a
    /// read of `size` bytes. Undeclared keys are unmetered.
    pub fn can_load(&self, key: &LedgerKey, size: usize) -> bool {
        match self.key_to_txs.get(key) {
            None => true,
            Some(txs) => txs.iter().any(|&tx| self.tx_quotas[tx] >= size as u64),
        }
    }

    /// Charges `size` bytes against every transaction that declared
    /// `key`, saturating at zero.
    pub fn update_read_quotas(&mut self, key: &LedgerKey, size: usize) {
        if let Some(txs) = self.key_to_txs.get(key) {
            for &tx in txs {
                self.tx_quotas[tx] = self.tx_quotas[tx].saturating_sub(size as u64);
            }
        }
    }

    /// Remaining budget of the `tx`-th registered transaction.
    pub fn tx_read_quota(&self, tx: usize) -> Option<u64> {
        self.tx_quotas.get(tx).copied()
    }
}
