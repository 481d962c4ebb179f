//! Block validation and UTXO application
//!
//! [`check_block`] covers everything that can be decided from the block
//! alone; [`connect_block`] adds the checks that need the coin view and
//! applies the block when all of them pass.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::auxpow::check_header_pow;
use crate::config::NodeConfig;
use crate::constants::*;
use crate::crypto::merkle_root_with_mutation;
use crate::economic::{block_subsidy, miner_fund_amount, staking_reward_amount};
use crate::error::{BlockRejection, ScriptError};
use crate::flags::{block_script_flags, ScriptFlags, SCRIPT_ENFORCE_SIGCHECKS};
use crate::params::ChainParams;
use crate::serialization::{serialize_block, txid};
use crate::transaction::{
    check_transaction, check_tx_inputs, validate_coinbase, verify_transaction_scripts, CoinView,
};
use crate::types::*;

type BlockResult<T> = std::result::Result<T, BlockRejection>;

/// Where a block is being connected
#[derive(Debug, Clone, Copy)]
pub struct BlockContext<'a> {
    pub params: &'a ChainParams,
    pub config: &'a NodeConfig,
    pub rule_set: RuleSet,
    pub height: Height,
    /// Script the staking reward must pay, once a winner is known for the
    /// parent block
    pub staking_winner: Option<&'a [u8]>,
}

/// What connecting a block produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedBlock {
    pub undo: BlockUndo,
    pub fees: Amount,
    pub sig_checks: u64,
}

/// Largest number of SigChecks a block of `max_block_size` bytes may use
pub fn max_block_sig_checks(max_block_size: usize) -> u64 {
    (max_block_size / BLOCK_MAXBYTES_MAXSIGCHECKS_RATIO) as u64
}

/// CheckBlock: ℬ → {⊤} ∪ ℰ
///
/// Context-free checks on block b = (h, a, txs):
/// 1. h carries valid proof of work, direct or merge-mined
/// 2. MerkleRoot(txs) = h.merkle_root and the tree is not mutated
/// 3. txs[0] is the only coinbase; |b| ≤ max block size
/// 4. Non-coinbase txids are strictly increasing
/// 5. Every tx passes CheckTransaction
pub fn check_block(block: &Block, params: &ChainParams, config: &NodeConfig) -> BlockResult<()> {
    // 1. Header
    check_header_pow(&block.header, block.auxpow.as_ref(), params)
        .map_err(BlockRejection::HighHash)?;

    if block.transactions.is_empty() {
        return Err(BlockRejection::CoinbaseMissing);
    }

    // 2. Merkle root
    let txids: Vec<Hash> = block.transactions.iter().map(txid).collect();
    let (root, mutated) = merkle_root_with_mutation(&txids);
    if root != block.header.merkle_root {
        return Err(BlockRejection::BadMerkleRoot);
    }
    if mutated {
        return Err(BlockRejection::DuplicateTransaction);
    }

    // 3. Coinbase and size
    if !block.transactions[0].is_coinbase() {
        return Err(BlockRejection::CoinbaseMissing);
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(BlockRejection::MultipleCoinbase);
    }
    if serialize_block(block).len() > config.max_block_size {
        return Err(BlockRejection::BadLength);
    }

    // 4. Canonical ordering
    if txids[1..].windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(BlockRejection::TransactionOrdering);
    }

    // 5. Transactions
    for tx in &block.transactions {
        if let ValidationResult::Invalid(reason) =
            check_transaction(tx).map_err(|e| BlockRejection::BadTransaction(e.to_string()))?
        {
            return Err(BlockRejection::BadTransaction(reason));
        }
    }

    Ok(())
}

/// ConnectBlock: ℬ × 𝒰𝒮 × ℕ → (𝒰𝒮 × 𝒰𝒩𝒟) ∪ ℰ
///
/// For block b = (h, a, txs) at height n with UTXO set us:
/// 1. CheckBlock(b)
/// 2. Every input of txs[1..] spends a coin of us or of an earlier
///    output of b, unspent so far, mature at n; fees = Σ fee(tx)
/// 3. All scripts verify under the block flags at n; the first failure
///    rejects the block
/// 4. Σ SigChecks ≤ max_block_size / 141
/// 5. txs[0] commits to n and pays at most subsidy(n) + fees
/// 6. When enabled, the coinbase pays the miner fund and staking winner
/// 7. us' = us \ spent ∪ created; the spent coins are returned as undo
///
/// `utxo_set` is only modified when every step passes.
pub fn connect_block(
    block: &Block,
    utxo_set: &mut UtxoSet,
    ctx: &BlockContext<'_>,
) -> BlockResult<ConnectedBlock> {
    // 1. Context-free checks
    check_block(block, ctx.params, ctx.config)?;

    // 2. Inputs against the coin view
    let mut view = BlockCoinView::new(utxo_set, block, ctx.height);
    let mut fees: Amount = 0;
    let mut script_checks = Vec::with_capacity(block.transactions.len() - 1);
    for tx in &block.transactions[1..] {
        fees += check_tx_inputs(tx, &view, ctx.height, ctx.params)?;
        let coins = tx
            .inputs
            .iter()
            .map(|input| view.coin(&input.prevout).cloned())
            .collect::<Option<Vec<Coin>>>()
            .ok_or(BlockRejection::InputsMissing)?;
        for input in &tx.inputs {
            view.spend(input.prevout);
        }
        script_checks.push((tx, coins));
    }

    // 3. Scripts
    let flags = block_script_flags(ctx.rule_set, ctx.params, ctx.height);
    let per_tx = run_script_checks(&script_checks, flags, ctx.config.parallel_script_checks)
        .map_err(|e| {
            warn!(height = ctx.height, error = %e, "script check failed");
            match e {
                ScriptError::SigChecksLimitExceeded => {
                    BlockRejection::BadTransaction("bad-txn-sigchecks".to_string())
                }
                other => BlockRejection::ScriptCheckFailed(other),
            }
        })?;

    // 4. SigChecks
    let sig_checks: u64 = per_tx.iter().map(|&n| n as u64).sum();
    if (flags & SCRIPT_ENFORCE_SIGCHECKS) != 0
        && sig_checks > max_block_sig_checks(ctx.config.max_block_size)
    {
        return Err(BlockRejection::TooManySigChecks);
    }

    // 5. Coinbase
    let coinbase = &block.transactions[0];
    validate_coinbase(coinbase, ctx.height, ctx.params)?;
    let reward = block_subsidy(ctx.height, ctx.params, &block.header.prev_block_hash) + fees;
    if coinbase.total_output_value() > reward {
        debug!(
            height = ctx.height,
            paid = coinbase.total_output_value(),
            limit = reward,
            "coinbase pays too much"
        );
        return Err(BlockRejection::CoinbaseAmount);
    }

    // 6. Policy
    check_block_policy(coinbase, reward, ctx)?;

    // 7. Apply
    let undo = apply_block(block, utxo_set, ctx.height);
    Ok(ConnectedBlock {
        undo,
        fees,
        sig_checks,
    })
}

fn run_script_checks(
    checks: &[(&Transaction, Vec<Coin>)],
    flags: ScriptFlags,
    parallel: bool,
) -> std::result::Result<Vec<u32>, ScriptError> {
    if parallel {
        checks
            .par_iter()
            .map(|(tx, coins)| verify_transaction_scripts(tx, coins, flags))
            .collect()
    } else {
        checks
            .iter()
            .map(|(tx, coins)| verify_transaction_scripts(tx, coins, flags))
            .collect()
    }
}

/// Miner fund and staking reward outputs of a coinbase.
///
/// Skipped for genesis. A qualifying output pays the expected script at
/// least the required share of `reward`.
pub fn check_block_policy(
    coinbase: &Transaction,
    reward: Amount,
    ctx: &BlockContext<'_>,
) -> BlockResult<()> {
    if ctx.height == 0 {
        return Ok(());
    }

    let pays = |script: &[u8], required: Amount| {
        coinbase
            .outputs
            .iter()
            .any(|o| o.value >= required && o.script_pubkey == script)
    };

    if ctx.config.enable_miner_fund
        && !pays(
            ctx.params.miner_fund_script.as_slice(),
            miner_fund_amount(reward, ctx.params),
        )
    {
        return Err(BlockRejection::PolicyMinerFund);
    }

    if ctx.config.enable_staking_rewards {
        match ctx.staking_winner {
            Some(winner) => {
                if !pays(winner, staking_reward_amount(reward, ctx.params)) {
                    return Err(BlockRejection::PolicyStakingReward);
                }
            }
            None => debug!(height = ctx.height, "staking reward winner not ready yet"),
        }
    }

    Ok(())
}

/// ApplyBlock: ℬ × 𝒰𝒮 × ℕ → 𝒰𝒮 × 𝒰𝒩𝒟
///
/// 1. Add every output of every tx, then spend every non-coinbase input
/// 2. Undo records only the spent coins that existed before the block
pub fn apply_block(block: &Block, utxo_set: &mut UtxoSet, height: Height) -> BlockUndo {
    let created: HashSet<Hash> = block.transactions.iter().map(txid).collect();
    for tx in &block.transactions {
        add_outputs(tx, utxo_set, height);
    }

    let mut undo = BlockUndo::default();
    for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
        for input in &tx.inputs {
            if let Some(coin) = utxo_set.remove(&input.prevout) {
                if !created.contains(&input.prevout.hash) {
                    undo.spent.push((input.prevout, coin));
                }
            }
        }
    }
    undo
}

/// ApplyTransaction: 𝒯𝒳 × 𝒰𝒮 × ℕ → 𝒰𝒮
///
/// For transaction tx and UTXO set us:
/// 1. If tx is not a coinbase: us' = us \ {i.prevout : i ∈ tx.inputs}
/// 2. us'' = us' ∪ {(txid(tx), i) ↦ tx.outputs[i]}
pub fn apply_transaction(tx: &Transaction, utxo_set: &mut UtxoSet, height: Height) -> Vec<(OutPoint, Coin)> {
    let mut spent = Vec::new();
    if !tx.is_coinbase() {
        for input in &tx.inputs {
            if let Some(coin) = utxo_set.remove(&input.prevout) {
                spent.push((input.prevout, coin));
            }
        }
    }
    add_outputs(tx, utxo_set, height);
    spent
}

fn add_outputs(tx: &Transaction, utxo_set: &mut UtxoSet, height: Height) {
    let hash = txid(tx);
    let is_coinbase = tx.is_coinbase();
    for (index, output) in tx.outputs.iter().enumerate() {
        utxo_set.insert(
            OutPoint {
                hash,
                index: index as u32,
            },
            Coin {
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
                height,
                is_coinbase,
            },
        );
    }
}

/// DisconnectBlock: ℬ × 𝒰𝒮 × 𝒰𝒩𝒟 → 𝒰𝒮
///
/// Removes every output the block created, then restores the coins it
/// spent.
pub fn disconnect_block(block: &Block, utxo_set: &mut UtxoSet, undo: &BlockUndo) {
    for tx in &block.transactions {
        let hash = txid(tx);
        for index in 0..tx.outputs.len() {
            utxo_set.remove(&OutPoint {
                hash,
                index: index as u32,
            });
        }
    }
    for (outpoint, coin) in &undo.spent {
        utxo_set.insert(*outpoint, coin.clone());
    }
}

/// Coins of the UTXO set plus the outputs of the block being connected,
/// minus what the block has spent so far
struct BlockCoinView<'a> {
    base: &'a UtxoSet,
    created: HashMap<OutPoint, Coin>,
    spent: HashSet<OutPoint>,
}

impl<'a> BlockCoinView<'a> {
    fn new(base: &'a UtxoSet, block: &Block, height: Height) -> Self {
        let mut created = HashMap::new();
        for tx in &block.transactions {
            add_outputs(tx, &mut created, height);
        }
        BlockCoinView {
            base,
            created,
            spent: HashSet::new(),
        }
    }

    fn spend(&mut self, outpoint: OutPoint) {
        self.spent.insert(outpoint);
    }
}

impl CoinView for BlockCoinView<'_> {
    fn coin(&self, outpoint: &OutPoint) -> Option<&Coin> {
        if self.spent.contains(outpoint) {
            return None;
        }
        self.created.get(outpoint).or_else(|| self.base.get(outpoint))
    }
}
