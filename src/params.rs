//! Per-network chain parameters

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::crypto::merkle_root;
use crate::serialization::txid;
use crate::types::*;

/// Which chain the node runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl Network {
    pub fn name(&self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Regtest => "regtest",
        }
    }
}

/// Consensus parameters of one network.
///
/// Height-dependent rules (digishield retargeting, maturity, min-difficulty
/// windows) are answered by the methods below rather than by separate
/// parameter sets.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    pub subsidy_halving_interval: Height,
    /// Height from which digishield retargeting and the longer coinbase
    /// maturity apply
    pub digishield_height: Height,
    /// Coinbase maturity before `digishield_height`
    pub coinbase_maturity: u32,
    pub pow_limit: U256,
    pub pow_no_retargeting: bool,
    pub pow_allow_min_difficulty: bool,
    /// Min-difficulty blocks are refused inside this height range
    pub min_difficulty_blackout: Option<(Height, Height)>,
    pub target_spacing: i64,
    pub strict_chain_id: bool,
    pub auxpow_chain_id: u32,
    /// Script rules selected when the config does not override them
    pub legacy_rules: bool,
    pub bip34_height: Height,
    pub bip65_height: Height,
    pub bip66_height: Height,
    pub csv_height: Height,
    pub disk_magic: [u8; 4],
    /// Heights a `rollback` snapshot may be taken at
    pub assumeutxo_heights: Vec<Height>,
    pub miner_fund_ratio: Amount,
    pub staking_reward_ratio: Amount,
    pub miner_fund_script: ByteString,
    pub genesis: Block,
}

/// Genesis coinbase output key shared by every network
const GENESIS_OUTPUT_PUBKEY: [u8; 65] = [
    0x04, 0x01, 0x84, 0x71, 0x0f, 0xa6, 0x89, 0xad, 0x50, 0x23, 0x69, 0x0c, 0x80,
    0xf3, 0xa4, 0x9c, 0x8f, 0x13, 0xf8, 0xd4, 0x5b, 0x8c, 0x85, 0x7f, 0xbc, 0xbc,
    0x8b, 0xc4, 0xa8, 0xe4, 0xd3, 0xeb, 0x4b, 0x10, 0xf4, 0xd4, 0x60, 0x4f, 0xa0,
    0x8d, 0xce, 0x60, 0x1a, 0xaf, 0x0f, 0x47, 0x02, 0x16, 0xfe, 0x1b, 0x51, 0x85,
    0x0b, 0x4a, 0xcf, 0x21, 0xb1, 0x79, 0xc4, 0x50, 0x70, 0xac, 0x7b, 0x03, 0xa9,
];

/// Regtest miner fund destination (P2SH)
const REGTEST_MINER_FUND_SCRIPT: [u8; 23] = [
    0xa9, 0x14, 0xd3, 0x7c, 0x4c, 0x80, 0x9f, 0xe9, 0x84, 0x0e, 0x7b, 0xfa, 0x77, 0xb8,
    0x6b, 0xd4, 0x71, 0x63, 0xf6, 0xfb, 0x6c, 0x60, 0x87,
];

/// Build a genesis block the way all three networks do: one coinbase
/// paying `reward` to the fixed key, tagged "Nintondo".
pub fn create_genesis_block(time: u32, nonce: u32, bits: u32, version: i32, reward: Amount) -> Block {
    // push(486604799) push(4) push("Nintondo")
    let mut script_sig = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04, 0x08];
    script_sig.extend_from_slice(b"Nintondo");

    let mut script_pubkey = Vec::with_capacity(67);
    script_pubkey.push(65);
    script_pubkey.extend_from_slice(&GENESIS_OUTPUT_PUBKEY);
    script_pubkey.push(crate::opcodes::OP_CHECKSIG);

    let coinbase = Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput {
            value: reward,
            script_pubkey,
        }],
        lock_time: 0,
    };

    let merkle = merkle_root(&[txid(&coinbase)]);
    Block {
        header: BlockHeader {
            version,
            prev_block_hash: [0u8; 32],
            merkle_root: merkle,
            timestamp: time,
            bits,
            nonce,
        },
        auxpow: None,
        transactions: vec![coinbase],
    }
}

/// Target with `zero_bits` leading zero bits, remaining bits set
fn limit_with_leading_zero_bits(zero_bits: usize) -> U256 {
    U256::MAX >> zero_bits
}

impl ChainParams {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Main => Self::main(),
            Network::Test => Self::test(),
            Network::Regtest => Self::regtest(),
        }
    }

    pub fn main() -> Self {
        ChainParams {
            network: Network::Main,
            subsidy_halving_interval: 100_000,
            digishield_height: 145_000,
            coinbase_maturity: 30,
            pow_limit: limit_with_leading_zero_bits(20),
            pow_no_retargeting: false,
            pow_allow_min_difficulty: false,
            min_difficulty_blackout: None,
            target_spacing: 60,
            strict_chain_id: true,
            auxpow_chain_id: AUXPOW_CHAIN_ID,
            legacy_rules: true,
            bip34_height: 1_034_383,
            bip65_height: 3_464_751,
            bip66_height: 1_034_383,
            csv_height: 0x7fff_ffff,
            disk_magic: [0xcb, 0x98, 0xa6, 0xb0],
            assumeutxo_heights: vec![],
            miner_fund_ratio: MINER_FUND_RATIO,
            staking_reward_ratio: STAKING_REWARD_RATIO,
            miner_fund_script: REGTEST_MINER_FUND_SCRIPT.to_vec(),
            genesis: create_genesis_block(1386325540, 99943, 0x1e0ffff0, 1, 88 * COIN),
        }
    }

    pub fn test() -> Self {
        ChainParams {
            network: Network::Test,
            pow_allow_min_difficulty: true,
            min_difficulty_blackout: Some((145_000, 157_500)),
            target_spacing: 600,
            strict_chain_id: false,
            disk_magic: [0xfb, 0x87, 0xb5, 0xbf],
            genesis: create_genesis_block(1391503289, 997879, 0x1e0ffff0, 1, 88 * COIN),
            ..Self::main()
        }
    }

    pub fn regtest() -> Self {
        ChainParams {
            network: Network::Regtest,
            subsidy_halving_interval: 150,
            digishield_height: 1450,
            coinbase_maturity: REGTEST_COINBASE_MATURITY,
            pow_limit: limit_with_leading_zero_bits(1),
            pow_no_retargeting: true,
            pow_allow_min_difficulty: false,
            min_difficulty_blackout: None,
            target_spacing: 600,
            strict_chain_id: true,
            auxpow_chain_id: AUXPOW_CHAIN_ID,
            legacy_rules: false,
            bip34_height: 500,
            bip65_height: 1351,
            bip66_height: 1251,
            csv_height: 576,
            disk_magic: [0x94, 0xb1, 0xca, 0xd2],
            assumeutxo_heights: vec![110, 210],
            miner_fund_ratio: MINER_FUND_RATIO,
            staking_reward_ratio: STAKING_REWARD_RATIO,
            miner_fund_script: REGTEST_MINER_FUND_SCRIPT.to_vec(),
            genesis: create_genesis_block(1296688602, 2, 0x207fffff, 1, 88 * COIN),
        }
    }

    pub fn genesis_hash(&self) -> Hash {
        crate::serialization::block_hash(&self.genesis.header)
    }

    /// Whether blocks at `height` retarget with digishield
    pub fn digishield_active(&self, height: Height) -> bool {
        height >= self.digishield_height
    }

    /// Whether a block at `height` may use the minimum difficulty
    pub fn allow_min_difficulty_at(&self, height: Height) -> bool {
        if !self.pow_allow_min_difficulty {
            return false;
        }
        match self.min_difficulty_blackout {
            Some((start, end)) => !(start..end).contains(&height),
            None => true,
        }
    }

    /// Target timespan: one block under digishield, four hours before
    pub fn target_timespan(&self, height: Height) -> i64 {
        if self.digishield_active(height) {
            60
        } else {
            4 * 60 * 60
        }
    }

    pub fn difficulty_adjustment_interval(&self, height: Height) -> i64 {
        if self.digishield_active(height) {
            1
        } else {
            self.target_timespan(height) / self.target_spacing
        }
    }

    /// Latest assumeutxo height not above `tip_height`
    pub fn rollback_height(&self, tip_height: Height) -> Option<Height> {
        self.assumeutxo_heights
            .iter()
            .copied()
            .filter(|h| *h <= tip_height)
            .max()
    }
}
