//! Transaction admission against the active chain
//!
//! The pool only holds transactions whose inputs are all confirmed coins.
//! Admission runs the structural checks, the input checks as if the
//! transaction were mined in the next block, and then the scripts: first
//! under the standard flags and, on failure, again under the mandatory
//! flags to tell a policy violation from a consensus one.

use std::collections::HashMap;

use tracing::debug;

use crate::chainstate::ChainState;
use crate::error::TxRejection;
use crate::flags::mempool_script_flags;
use crate::serialization::{transaction_size, txid};
use crate::transaction::{check_transaction, check_tx_inputs, verify_transaction_scripts};
use crate::types::*;

/// A transaction accepted into the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub fee: Amount,
    pub size: usize,
    pub sig_checks: u32,
    /// Admission order
    sequence: u64,
}

#[derive(Debug, Default)]
pub struct Mempool {
    entries: HashMap<Hash, MempoolEntry>,
    /// Which pool transaction spends each outpoint
    spenders: HashMap<OutPoint, Hash>,
    next_sequence: u64,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Pool transaction spending `outpoint`, if any
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash> {
        self.spenders.get(outpoint).copied()
    }

    /// Pool contents in admission order
    pub fn transactions(&self) -> Vec<Transaction> {
        let mut entries: Vec<&MempoolEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.sequence);
        entries.into_iter().map(|e| e.tx.clone()).collect()
    }

    fn insert(&mut self, id: Hash, tx: Transaction, fee: Amount, sig_checks: u32) {
        for input in &tx.inputs {
            self.spenders.insert(input.prevout, id);
        }
        let entry = MempoolEntry {
            size: transaction_size(&tx),
            tx,
            fee,
            sig_checks,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.entries.insert(id, entry);
    }

    pub fn remove(&mut self, txid: &Hash) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.inputs {
            if self.spenders.get(&input.prevout) == Some(txid) {
                self.spenders.remove(&input.prevout);
            }
        }
        Some(entry)
    }

    /// RemoveForBlock: 𝒫 × ℬ → 𝒫
    ///
    /// Drop every pool transaction the block mined, and every one that
    /// spends a coin the block spent. Returns how many were removed.
    pub fn remove_for_block(&mut self, block: &Block) -> usize {
        let mut removed = 0;
        for tx in &block.transactions {
            if self.remove(&txid(tx)).is_some() {
                removed += 1;
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                if let Some(conflict) = self.spender_of(&input.prevout) {
                    if self.remove(&conflict).is_some() {
                        debug!(txid = %hash_to_hex(&conflict), "removed conflicting pool transaction");
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    /// RemoveInvalid: 𝒫 × 𝒞𝒮 → 𝒫
    ///
    /// After the tip moved back, drop every pool transaction whose inputs
    /// no longer pass CheckTxInputs at the new tip + 1: coins created by a
    /// disconnected block, or coinbases that are immature again. Returns
    /// how many were removed.
    pub fn remove_invalid(&mut self, chain: &ChainState) -> usize {
        let params = chain.params();
        let stale: Vec<Hash> = chain.with_utxos(|utxos, tip| {
            let next_height = tip.height + 1;
            self.entries
                .iter()
                .filter(|(_, entry)| {
                    check_tx_inputs(&entry.tx, utxos, next_height, params).is_err()
                })
                .map(|(id, _)| *id)
                .collect()
        });
        for id in &stale {
            self.remove(id);
            debug!(txid = %hash_to_hex(id), "removed pool transaction with stale inputs");
        }
        stale.len()
    }
}

/// AcceptToMemoryPool: 𝒯𝒳 × 𝒞𝒮 × 𝒫 → ℍ ∪ {rejection}
///
/// 1. Reject duplicates of pool transactions
/// 2. CheckTransaction; coinbases never enter the pool
/// 3. Reject a spend of an outpoint another pool transaction spends
/// 4. CheckTxInputs at tip + 1 against the confirmed coin set
/// 5. Scripts under the standard flags; on failure, under the mandatory
///    flags to pick the non-mandatory or mandatory rejection
/// 6. Insert and return the txid
pub fn accept_to_memory_pool(
    tx: &Transaction,
    chain: &ChainState,
    mempool: &mut Mempool,
) -> Result<Hash, TxRejection> {
    let id = txid(tx);
    let result = admit(tx, id, chain, mempool);
    match &result {
        Ok(_) => debug!(txid = %hash_to_hex(&id), pool_size = mempool.len(), "accepted to mempool"),
        Err(e) => debug!(txid = %hash_to_hex(&id), reason = %e, code = e.code(), "rejected from mempool"),
    }
    result
}

fn admit(
    tx: &Transaction,
    id: Hash,
    chain: &ChainState,
    mempool: &mut Mempool,
) -> Result<Hash, TxRejection> {
    // 1. Duplicate
    if mempool.contains(&id) {
        return Err(TxRejection::AlreadyInMempool);
    }

    // 2. Structure
    match check_transaction(tx) {
        Ok(ValidationResult::Valid) => {}
        Ok(ValidationResult::Invalid(reason)) => return Err(TxRejection::Invalid(reason)),
        Err(e) => return Err(TxRejection::Invalid(e.to_string())),
    }
    if tx.is_coinbase() {
        return Err(TxRejection::Invalid("coinbase".to_string()));
    }

    // 3. Conflicts
    if tx
        .inputs
        .iter()
        .any(|input| mempool.spender_of(&input.prevout).is_some())
    {
        return Err(TxRejection::MempoolConflict);
    }

    // 4. Inputs, snapshotted under one read of the chain
    let params = chain.params();
    let (fee, coins, next_height) = chain.with_utxos(|utxos, tip| {
        let next_height = tip.height + 1;
        let fee = check_tx_inputs(tx, utxos, next_height, params)?;
        let coins: Vec<Coin> = tx
            .inputs
            .iter()
            .filter_map(|input| utxos.get(&input.prevout).cloned())
            .collect();
        Ok::<_, TxRejection>((fee, coins, next_height))
    })?;

    // 5. Scripts
    let (standard, mandatory) = mempool_script_flags(chain.rule_set(), params, next_height);
    let sig_checks = match verify_transaction_scripts(tx, &coins, standard) {
        Ok(n) => n,
        Err(policy_err) => {
            return Err(match verify_transaction_scripts(tx, &coins, mandatory) {
                Ok(_) => TxRejection::NonMandatoryScript(policy_err),
                Err(consensus_err) => TxRejection::MandatoryScript(consensus_err),
            })
        }
    };

    // 6. Insert
    mempool.insert(id, tx.clone(), fee, sig_checks);
    Ok(id)
}
