//! Transaction and coinbase validation

use std::collections::HashSet;

use thiserror::Error;

use crate::constants::*;
use crate::error::{BlockRejection, Result, ScriptError, TxRejection};
use crate::flags::{ScriptFlags, SCRIPT_ENFORCE_SIGCHECKS};
use crate::params::ChainParams;
use crate::script::{
    decode_script_num, push_int, verify_script_with_sigchecks, TransactionSignatureChecker,
};
use crate::sighash::PrecomputedSighash;
use crate::serialization::transaction_size;
use crate::types::*;

/// Read access to unspent coins
pub trait CoinView {
    fn coin(&self, outpoint: &OutPoint) -> Option<&Coin>;
}

impl CoinView for UtxoSet {
    fn coin(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.get(outpoint)
    }
}

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// A transaction tx = (v, ins, outs, lt) is valid if and only if:
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. |tx| ≤ MAX_TX_SIZE, and |tx| ≥ MIN_TX_SIZE unless tx is a coinbase
/// 3. ∀o ∈ outs: 0 ≤ o.value ≤ MAX_MONEY, and Σ o.value ≤ MAX_MONEY
/// 4. No outpoint is spent twice
/// 5. A coinbase has a 2..=100 byte script_sig; no other input is null
pub fn check_transaction(tx: &Transaction) -> Result<ValidationResult> {
    if tx.inputs.is_empty() {
        return Ok(ValidationResult::Invalid("bad-txns-vin-empty".to_string()));
    }
    if tx.outputs.is_empty() {
        return Ok(ValidationResult::Invalid("bad-txns-vout-empty".to_string()));
    }

    let size = transaction_size(tx);
    if size > MAX_TX_SIZE {
        return Ok(ValidationResult::Invalid("bad-txns-oversize".to_string()));
    }
    if !tx.is_coinbase() && size < MIN_TX_SIZE {
        return Ok(ValidationResult::Invalid("bad-txns-undersize".to_string()));
    }

    let mut total: Amount = 0;
    for output in &tx.outputs {
        if output.value < 0 {
            return Ok(ValidationResult::Invalid("bad-txns-vout-negative".to_string()));
        }
        if output.value > MAX_MONEY {
            return Ok(ValidationResult::Invalid("bad-txns-vout-toolarge".to_string()));
        }
        total += output.value;
        if !money_range(total) {
            return Ok(ValidationResult::Invalid("bad-txns-txouttotal-toolarge".to_string()));
        }
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Ok(ValidationResult::Invalid("bad-txns-inputs-duplicate".to_string()));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPTSIG_SIZE..=MAX_COINBASE_SCRIPTSIG_SIZE).contains(&len) {
            return Ok(ValidationResult::Invalid("bad-cb-length".to_string()));
        }
    } else if tx.inputs.iter().any(|i| i.prevout.is_null()) {
        return Ok(ValidationResult::Invalid("bad-txns-prevout-null".to_string()));
    }

    Ok(ValidationResult::Valid)
}

/// MaturityDepth: ℕ → ℕ
///
/// Confirmations a coinbase created at `coin_height` needs before it can
/// be spent: the network's initial maturity before digishield, 240 after.
pub fn maturity_depth(params: &ChainParams, coin_height: Height) -> u32 {
    if params.digishield_active(coin_height) {
        DIGISHIELD_COINBASE_MATURITY
    } else {
        params.coinbase_maturity
    }
}

/// Whether a coin can be spent by a transaction confirmed at `spend_height`
pub fn is_spendable_at(params: &ChainParams, coin: &Coin, spend_height: Height) -> bool {
    !coin.is_coinbase
        || (spend_height as i64 - coin.height as i64) >= maturity_depth(params, coin.height) as i64
}

/// Input-level failures shared by the mempool and block paths
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxInputsError {
    #[error("bad-txns-inputs-missingorspent")]
    MissingOrSpent,
    #[error("bad-txns-premature-spend-of-coinbase, tried to spend coinbase at depth {depth}")]
    PrematureSpend { depth: i64 },
    #[error("bad-txns-inputvalues-outofrange")]
    ValuesOutOfRange,
    #[error("bad-txns-in-belowout")]
    BelowOutputs,
}

impl From<TxInputsError> for TxRejection {
    fn from(e: TxInputsError) -> Self {
        match e {
            TxInputsError::MissingOrSpent => TxRejection::MissingInputs,
            TxInputsError::PrematureSpend { depth } => TxRejection::PrematureCoinbaseSpend { depth },
            other => TxRejection::Invalid(other.to_string()),
        }
    }
}

impl From<TxInputsError> for BlockRejection {
    fn from(e: TxInputsError) -> Self {
        match e {
            TxInputsError::MissingOrSpent => BlockRejection::InputsMissing,
            TxInputsError::PrematureSpend { depth } => BlockRejection::PrematureCoinbaseSpend { depth },
            TxInputsError::BelowOutputs => BlockRejection::InputsBelowOutputs,
            other => BlockRejection::BadTransaction(other.to_string()),
        }
    }
}

/// CheckTxInputs: 𝒯𝒳 × 𝒰𝒮 × ℕ → ℤ ∪ {⊥}
///
/// For a non-coinbase tx spent in a block at `spend_height`:
/// 1. Every prevout is in the view
/// 2. Every coinbase prevout has depth ≥ maturity_depth(coin height)
/// 3. Σ inputs stays in money range and covers Σ outputs
/// 4. Return the fee Σ inputs − Σ outputs
pub fn check_tx_inputs<V: CoinView + ?Sized>(
    tx: &Transaction,
    view: &V,
    spend_height: Height,
    params: &ChainParams,
) -> std::result::Result<Amount, TxInputsError> {
    let mut value_in: Amount = 0;
    for input in &tx.inputs {
        let coin = view.coin(&input.prevout).ok_or(TxInputsError::MissingOrSpent)?;
        if !is_spendable_at(params, coin, spend_height) {
            return Err(TxInputsError::PrematureSpend {
                depth: spend_height as i64 - coin.height as i64,
            });
        }
        value_in += coin.value;
        if !money_range(coin.value) || !money_range(value_in) {
            return Err(TxInputsError::ValuesOutOfRange);
        }
    }

    let value_out = tx.total_output_value();
    if value_in < value_out {
        return Err(TxInputsError::BelowOutputs);
    }
    Ok(value_in - value_out)
}

/// Coinbase script_sig prefix committing to `height`
pub fn encode_bip34_height(height: Height) -> Vec<u8> {
    let mut script = Vec::with_capacity(5);
    push_int(&mut script, height as i64);
    script
}

/// Height committed at the start of a coinbase script_sig, if any
pub fn decode_bip34_height(script_sig: &[u8]) -> Option<Height> {
    let first = *script_sig.first()?;
    match first {
        0x00 => Some(0),
        0x51..=0x60 => Some((first - 0x50) as Height),
        1..=8 => {
            let data = script_sig.get(1..1 + first as usize)?;
            let n = decode_script_num(data, true, 8).ok()?;
            Height::try_from(n).ok()
        }
        _ => None,
    }
}

/// ValidateCoinbase: 𝒯𝒳 × ℕ → {⊤} ∪ ℰ
///
/// 1. One input spending the null outpoint
/// 2. script_sig of 2..=100 bytes
/// 3. From the BIP34 height on, script_sig starts with the encoded height
pub fn validate_coinbase(
    tx: &Transaction,
    height: Height,
    params: &ChainParams,
) -> std::result::Result<(), BlockRejection> {
    if !tx.is_coinbase() {
        return Err(BlockRejection::CoinbaseMissing);
    }
    let script_sig = &tx.inputs[0].script_sig;
    if !(MIN_COINBASE_SCRIPTSIG_SIZE..=MAX_COINBASE_SCRIPTSIG_SIZE).contains(&script_sig.len()) {
        return Err(BlockRejection::CoinbaseLength);
    }
    if height >= params.bip34_height {
        let expected = encode_bip34_height(height);
        if !script_sig.starts_with(&expected) {
            return Err(BlockRejection::CoinbaseHeight);
        }
    }
    Ok(())
}

/// VerifyTransactionScripts: 𝒯𝒳 × 𝒰* × ℕ → ℕ ∪ 𝓔
///
/// Runs every input's script_sig against the coin it spends, sharing one
/// sighash midstate across inputs. Returns the SigChecks the transaction
/// used; `coins[i]` must be the coin spent by input i.
pub fn verify_transaction_scripts(
    tx: &Transaction,
    coins: &[Coin],
    flags: ScriptFlags,
) -> std::result::Result<u32, ScriptError> {
    if coins.len() != tx.inputs.len() {
        return Err(ScriptError::Unknown);
    }
    let precomputed = PrecomputedSighash::new(tx);
    let mut sig_checks = 0u32;
    for (index, (input, coin)) in tx.inputs.iter().zip(coins).enumerate() {
        let checker =
            TransactionSignatureChecker::new(tx, index, coin.value).with_precomputed(&precomputed);
        sig_checks += verify_script_with_sigchecks(
            &input.script_sig,
            &coin.script_pubkey,
            flags,
            &checker,
        )?;
    }
    if (flags & SCRIPT_ENFORCE_SIGCHECKS) != 0 && sig_checks as usize > MAX_TX_SIGCHECKS {
        return Err(ScriptError::SigChecksLimitExceeded);
    }
    Ok(sig_checks)
}
