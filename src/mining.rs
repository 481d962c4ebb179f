//! Block assembly, block templates and nonce search

use serde::Serialize;
use tracing::debug;

use crate::auxpow::make_version_with_chain_id;
use crate::block::max_block_sig_checks;
use crate::chainstate::ChainState;
use crate::config::NodeConfig;
use crate::constants::*;
use crate::crypto::merkle_root;
use crate::economic::{block_subsidy, miner_fund_amount, staking_reward_amount};
use crate::error::{ConsensusError, Result};
use crate::params::ChainParams;
use crate::pow::{check_proof_of_work, compact_to_target};
use crate::serialization::{pow_hash, serialize_transaction, transaction_size, txid};
use crate::transaction::{check_tx_inputs, encode_bip34_height};
use crate::types::*;

/// Base version carried in the low bits of assembled headers
const BLOCK_VERSION_LOW_BITS: u32 = 4;

/// Room kept for the header and coinbase when filling a block
const COINBASE_RESERVED_SIZE: usize = 1000;

/// CreateCoinbase: ℕ × 𝒯* → 𝒯𝒳
///
/// One null-outpoint input whose script_sig is the BIP34 height followed
/// by OP_0, and the given outputs.
pub fn create_coinbase(height: Height, outputs: Vec<TransactionOutput>) -> Transaction {
    let mut script_sig = encode_bip34_height(height);
    script_sig.push(0x00);
    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs,
        lock_time: 0,
    }
}

/// Coinbase outputs for `reward`: the miner fund and staking winner get
/// their required shares when enabled, `payout_script` the rest
pub fn coinbase_outputs(
    reward: Amount,
    payout_script: &[u8],
    chain: &ChainState,
    config: &NodeConfig,
    staking_winner: Option<&[u8]>,
) -> Vec<TransactionOutput> {
    let params = chain.params();
    let mut outputs = Vec::new();
    let mut remainder = reward;
    if config.enable_miner_fund {
        let amount = miner_fund_amount(reward, params);
        outputs.push(TransactionOutput {
            value: amount,
            script_pubkey: params.miner_fund_script.clone(),
        });
        remainder -= amount;
    }
    if let (true, Some(winner)) = (config.enable_staking_rewards, staking_winner) {
        let amount = staking_reward_amount(reward, params);
        outputs.push(TransactionOutput {
            value: amount,
            script_pubkey: winner.to_vec(),
        });
        remainder -= amount;
    }
    outputs.insert(
        0,
        TransactionOutput {
            value: remainder,
            script_pubkey: payout_script.to_vec(),
        },
    );
    outputs
}

/// Everything a block on the current tip is built from
struct Assembly {
    height: Height,
    prev_hash: Hash,
    bits: u32,
    median_time_past: i64,
    /// Selected transactions in canonical order, with their fees
    transactions: Vec<(Transaction, Amount)>,
    reward: Amount,
    staking_winner: Option<ByteString>,
}

/// AssembleBlock: 𝒞𝒮 × 𝒯𝒳* × ℕ → Assembly
///
/// 1. height = tip + 1, bits = next work required at `time`
/// 2. Keep candidates whose inputs are unspent and mature at `height`,
///    in order, while the block stays under the size limit
/// 3. Sort the selection by txid
/// 4. reward = subsidy(height) + Σ fees
fn assemble(
    chain: &ChainState,
    candidates: &[Transaction],
    config: &NodeConfig,
    time: i64,
) -> Result<Assembly> {
    let params = chain.params();
    let bits = chain.next_work_required(time)?;
    let size_limit = config.max_block_size.saturating_sub(COINBASE_RESERVED_SIZE);

    let (tip, mut selected) = chain.with_utxos(|utxos, tip| {
        let height = tip.height + 1;
        let mut size = 0usize;
        let mut selected = Vec::new();
        for tx in candidates {
            if tx.is_coinbase() {
                continue;
            }
            let tx_size = transaction_size(tx);
            if size + tx_size > size_limit {
                debug!(txid = %hash_to_hex(&txid(tx)), "block full, skipping transaction");
                continue;
            }
            match check_tx_inputs(tx, utxos, height, params) {
                Ok(fee) => {
                    size += tx_size;
                    selected.push((tx.clone(), fee));
                }
                Err(e) => debug!(txid = %hash_to_hex(&txid(tx)), reason = %e, "skipping transaction"),
            }
        }
        (*tip, selected)
    });
    selected.sort_by_key(|(tx, _)| txid(tx));

    let height = tip.height + 1;
    let fees: Amount = selected.iter().map(|(_, fee)| fee).sum();
    Ok(Assembly {
        height,
        prev_hash: tip.hash,
        bits,
        median_time_past: chain.median_time_past(),
        transactions: selected,
        reward: block_subsidy(height, params, &tip.hash) + fees,
        staking_winner: chain.staking_winner(&tip.hash),
    })
}

/// CreateNewBlock: 𝒞𝒮 × 𝒯𝒳* × 𝕊 × ℕ → ℬ
///
/// Unsolved block on the current tip. The coinbase pays subsidy plus fees,
/// split with the miner fund and staking winner when the node's config
/// enables them.
pub fn create_block(
    chain: &ChainState,
    candidates: Vec<Transaction>,
    payout_script: ByteString,
    time: i64,
) -> Result<Block> {
    let config = chain.config();
    let assembly = assemble(chain, &candidates, config, time)?;
    let outputs = coinbase_outputs(
        assembly.reward,
        &payout_script,
        chain,
        config,
        assembly.staking_winner.as_deref(),
    );

    let mut transactions = vec![create_coinbase(assembly.height, outputs)];
    transactions.extend(assembly.transactions.into_iter().map(|(tx, _)| tx));
    let txids: Vec<Hash> = transactions.iter().map(txid).collect();

    let timestamp = u32::try_from(time)
        .map_err(|_| ConsensusError::BlockValidation(format!("block time {} out of range", time)))?;
    Ok(Block {
        header: BlockHeader {
            version: make_version_with_chain_id(
                chain.params().auxpow_chain_id,
                BLOCK_VERSION_LOW_BITS,
            )?,
            prev_block_hash: assembly.prev_hash,
            merkle_root: merkle_root(&txids),
            timestamp,
            bits: assembly.bits,
            nonce: 0,
        },
        auxpow: None,
        transactions,
    })
}

/// SolveBlock: ℋ → ℋ
///
/// Increment the nonce from its current value until the scrypt hash
/// meets the header's own target.
pub fn solve_block(header: &mut BlockHeader, params: &ChainParams) -> Result<()> {
    loop {
        if check_proof_of_work(&pow_hash(header)?, header.bits, params) {
            return Ok(());
        }
        header.nonce = header.nonce.checked_add(1).ok_or_else(|| {
            ConsensusError::InvalidProofOfWork("nonce space exhausted".to_string())
        })?;
    }
}

// ============================================================================
// BLOCK TEMPLATE
// ============================================================================

/// One transaction of a block template
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateTransaction {
    pub data: String,
    pub txid: String,
    pub hash: String,
    pub fee: Amount,
}

/// A script and the least the coinbase must pay it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequiredPayout {
    pub script: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MinerFundRequirement {
    pub scripts: Vec<String>,
    pub minimumvalue: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptHex {
    pub hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StakingRewardRequirement {
    pub payoutscript: ScriptHex,
    pub minimumvalue: Amount,
}

/// Coinbase constraints, nested unless the simplified template is asked for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoinbaseTxn {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minerfund: Option<MinerFundRequirement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stakingrewards: Option<StakingRewardRequirement>,
}

/// getblocktemplate result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockTemplate {
    pub version: i32,
    pub previousblockhash: String,
    pub transactions: Vec<TemplateTransaction>,
    pub coinbasetxn: CoinbaseTxn,
    pub coinbasevalue: Amount,
    pub target: String,
    pub mintime: i64,
    pub curtime: i64,
    pub bits: String,
    pub height: Height,
    pub sigchecklimit: u64,
    pub sizelimit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minerfund: Option<RequiredPayout>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stakingrewards: Option<RequiredPayout>,
}

impl BlockTemplate {
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Full-width big-endian hex of the target encoded by `bits`
fn target_hex(bits: u32) -> String {
    let mut bytes = [0u8; 32];
    compact_to_target(bits).target.to_big_endian(&mut bytes);
    hex::encode(bytes)
}

/// CreateBlockTemplate: 𝒞𝒮 × 𝒯𝒳* × Config × ℕ → Template
///
/// The miner fund appears once enabled; the staking reward once a winner
/// is known for the tip. With `simple_gbt` both move from `coinbasetxn`
/// to the top level as plain script/amount pairs.
pub fn create_block_template(
    chain: &ChainState,
    mempool_txs: &[Transaction],
    config: &NodeConfig,
    time: i64,
) -> Result<BlockTemplate> {
    let params = chain.params();
    let assembly = assemble(chain, mempool_txs, config, time)?;

    let miner_fund = config.enable_miner_fund.then(|| RequiredPayout {
        script: hex::encode(&params.miner_fund_script),
        amount: miner_fund_amount(assembly.reward, params),
    });
    let staking = match (&assembly.staking_winner, config.enable_staking_rewards) {
        (Some(winner), true) => Some(RequiredPayout {
            script: hex::encode(winner),
            amount: staking_reward_amount(assembly.reward, params),
        }),
        _ => None,
    };

    let (coinbasetxn, minerfund, stakingrewards) = if config.simple_gbt {
        (CoinbaseTxn::default(), miner_fund, staking)
    } else {
        let nested = CoinbaseTxn {
            minerfund: miner_fund.map(|p| MinerFundRequirement {
                scripts: vec![p.script],
                minimumvalue: p.amount,
            }),
            stakingrewards: staking.map(|p| StakingRewardRequirement {
                payoutscript: ScriptHex { hex: p.script },
                minimumvalue: p.amount,
            }),
        };
        (nested, None, None)
    };

    let transactions = assembly
        .transactions
        .iter()
        .map(|(tx, fee)| {
            let id = hash_to_hex(&txid(tx));
            TemplateTransaction {
                data: hex::encode(serialize_transaction(tx)),
                txid: id.clone(),
                hash: id,
                fee: *fee,
            }
        })
        .collect();

    Ok(BlockTemplate {
        version: make_version_with_chain_id(params.auxpow_chain_id, BLOCK_VERSION_LOW_BITS)?,
        previousblockhash: hash_to_hex(&assembly.prev_hash),
        transactions,
        coinbasetxn,
        coinbasevalue: assembly.reward,
        target: target_hex(assembly.bits),
        mintime: assembly.median_time_past + 1,
        curtime: time,
        bits: format!("{:08x}", assembly.bits),
        height: assembly.height,
        sigchecklimit: max_block_sig_checks(config.max_block_size),
        sizelimit: config.max_block_size,
        minerfund,
        stakingrewards,
    })
}
