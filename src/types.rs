//! Core chain types for consensus validation

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Hash type: 256-bit hash, stored in internal (little-endian) byte order
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Natural number type
pub type Natural = u64;

/// Integer type
pub type Integer = i64;

/// Amount in the minimal currency unit
pub type Amount = i64;

/// Block height
pub type Height = u32;

/// OutPoint: 𝒪 = ℍ × ℕ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    /// The outpoint referenced by every coinbase input
    pub const fn null() -> Self {
        OutPoint {
            hash: [0u8; 32],
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX && self.hash == [0u8; 32]
    }
}

/// Transaction Input: ℐ = 𝒪 × 𝕊 × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
}

/// Transaction Output: 𝒯 = ℤ × 𝕊
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Amount,
    pub script_pubkey: ByteString,
}

/// Transaction: 𝒯𝒳 = ℤ × ℐ* × 𝒯* × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase has exactly one input spending the null outpoint
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn total_output_value(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

/// Block Header: ℋ = ℤ × ℍ × ℍ × ℕ × ℕ × ℕ
///
/// This is the 80-byte header that is hashed. The AuxPoW proof, when
/// present, travels next to it in [`Block::auxpow`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

/// Merge-mining proof: 𝒜 = 𝒯𝒳 × ℍ × ℍ* × ℤ × ℍ* × ℤ × ℋ
///
/// The parent chain's coinbase, the merkle branch proving it sits in the
/// parent block, and the chain merkle branch linking our block hash to the
/// root committed in that coinbase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxPow {
    pub coinbase_tx: Transaction,
    pub parent_hash: Hash,
    pub merkle_branch: Vec<Hash>,
    pub index: i32,
    pub chain_merkle_branch: Vec<Hash>,
    pub chain_index: i32,
    pub parent_block: BlockHeader,
}

impl Default for AuxPow {
    fn default() -> Self {
        AuxPow {
            coinbase_tx: Transaction {
                version: 1,
                inputs: vec![],
                outputs: vec![],
                lock_time: 0,
            },
            parent_hash: [0u8; 32],
            merkle_branch: vec![],
            index: 0,
            chain_merkle_branch: vec![],
            chain_index: 0,
            parent_block: BlockHeader::default(),
        }
    }
}

/// Block: ℬ = ℋ × 𝒜? × 𝒯𝒳*
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub auxpow: Option<AuxPow>,
    pub transactions: Vec<Transaction>,
}

/// Coin: 𝒰 = ℤ × 𝕊 × ℕ × 𝔹
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub value: Amount,
    pub script_pubkey: ByteString,
    pub height: Height,
    pub is_coinbase: bool,
}

/// UTXO Set: 𝒰𝒮 = 𝒪 → 𝒰
pub type UtxoSet = HashMap<OutPoint, Coin>;

/// Coins a block spent, in input order, so it can be disconnected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub spent: Vec<(OutPoint, Coin)>,
}

/// Validation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(String),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

/// Which script rules the node runs under.
///
/// Chosen once when the node is built and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSet {
    /// Dogecoin script semantics
    Legacy,
    /// eCash script semantics
    Modern,
}

/// Render a hash the way block explorers and RPC show it (byte-reversed hex)
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse a byte-reversed hex hash
pub fn hash_from_hex(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    hash.reverse();
    Some(hash)
}
