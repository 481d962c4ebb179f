//! Consensus constants for the merge-mined chain

use crate::types::Amount;

/// Smallest units per coin
pub const COIN: Amount = 100_000_000;

/// Maximum money supply: 10,000,000,000 coins
pub const MAX_MONEY: Amount = 10_000_000_000 * COIN;

/// Maximum transaction size: 1MB
pub const MAX_TX_SIZE: usize = 1_000_000;

/// Minimum transaction size
pub const MIN_TX_SIZE: usize = 100;

/// Default maximum block size: 1MB
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 1_000_000;

/// Block size per allowed signature check
pub const BLOCK_MAXBYTES_MAXSIGCHECKS_RATIO: usize = 141;

/// Maximum signature checks in a single transaction
pub const MAX_TX_SIGCHECKS: usize = 3000;

/// Coinbase scriptSig length bounds
pub const MIN_COINBASE_SCRIPTSIG_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPTSIG_SIZE: usize = 100;

/// Maximum script length
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a single pushed element
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum stack + altstack size during script execution
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum number of non-push operations in a script
pub const MAX_SCRIPT_OPS: usize = 201;

/// Maximum keys in a CHECKMULTISIG
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Maximum byte length of script numbers
pub const MAX_SCRIPT_NUM_LENGTH: usize = 4;

/// Initial block subsidy: 50 coins
pub const INITIAL_SUBSIDY: Amount = 50 * COIN;

/// Coinbase maturity on regtest before digishield
pub const REGTEST_COINBASE_MATURITY: u32 = 100;

/// Coinbase maturity once digishield is active
pub const DIGISHIELD_COINBASE_MATURITY: u32 = 240;

/// Lock time threshold: transactions with lock time < this are block height
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number for final transaction
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

/// Relative lock-time (BIP68) sequence fields
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000ffff;

/// Chain ID of this chain in merge-mined block versions
pub const AUXPOW_CHAIN_ID: u32 = 0x62;

/// Version bit signalling an attached AuxPoW
pub const VERSION_AUXPOW_BIT: i32 = 1 << 8;

/// Chain ID lives in the upper 16 bits of the version
pub const VERSION_CHAIN_ID_SHIFT: u32 = 16;

/// Four bytes marking the merge-mining commitment in a parent coinbase
pub const MERGE_MINE_PREFIX: [u8; 4] = [0xfa, 0xbe, b'm', b'm'];

/// Longest allowed chain merkle branch
pub const MAX_CHAIN_MERKLE_BRANCH_LENGTH: usize = 30;

/// Bytes allowed before the chain merkle root when no prefix is present
pub const MAX_CHAIN_MERKLE_ROOT_OFFSET: usize = 20;

/// Percentage of the block reward owed to the miner fund
pub const MINER_FUND_RATIO: Amount = 32;

/// Percentage of the block reward owed to stakers
pub const STAKING_REWARD_RATIO: Amount = 25;

/// RPC error code for rejected transactions
pub const RPC_VERIFY_REJECTED: i32 = -26;

/// RPC error code for transactions already in the chain
pub const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;

/// RPC error code for transactions with missing or spent inputs
pub const RPC_VERIFY_ERROR: i32 = -25;
