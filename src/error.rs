//! Error types for consensus validation
//!
//! Rejections are closed enums. The strings nodes and tests match on are
//! produced only by `Display`, at the edge.

use thiserror::Error;

use crate::constants::{RPC_VERIFY_ERROR, RPC_VERIFY_ALREADY_IN_CHAIN, RPC_VERIFY_REJECTED};

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Transaction validation failed: {0}")]
    TransactionValidation(String),

    #[error("Block validation failed: {0}")]
    BlockValidation(String),

    #[error("Script execution failed: {0}")]
    ScriptExecution(#[from] ScriptError),

    #[error("UTXO not found: {0}")]
    UtxoNotFound(String),

    #[error("Invalid proof of work: {0}")]
    InvalidProofOfWork(String),

    #[error("AuxPoW validation failed: {0}")]
    AuxPow(#[from] AuxPowError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Chain state error: {0}")]
    ChainState(#[from] ChainStateError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Consensus rule violation: {0}")]
    ConsensusRuleViolation(String),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Script interpreter failures, rendered with the node's messages
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptError {
    #[error("unknown error")]
    Unknown,
    #[error("Script evaluated without error but finished with a false/empty top stack element")]
    EvalFalse,
    #[error("OP_RETURN was encountered")]
    OpReturn,

    // Limits
    #[error("Script is too big")]
    ScriptSize,
    #[error("Push value size limit exceeded")]
    PushSize,
    #[error("Operation limit exceeded")]
    OpCount,
    #[error("Stack size limit exceeded")]
    StackSize,
    #[error("Signature count negative or greater than pubkey count")]
    SigCount,
    #[error("Pubkey count negative or limit exceeded")]
    PubkeyCount,

    // Operands
    #[error("Invalid operand size")]
    InvalidOperandSize,
    #[error("Given operand is not a number within the valid range")]
    InvalidNumberRange,
    #[error("The requested encoding is impossible to satisfy")]
    ImpossibleEncoding,
    #[error("Invalid OP_SPLIT range")]
    InvalidSplitRange,
    #[error("Division by zero error")]
    DivByZero,
    #[error("Modulo by zero error")]
    ModByZero,

    // Failed verify operations
    #[error("Script failed an OP_VERIFY operation")]
    Verify,
    #[error("Script failed an OP_EQUALVERIFY operation")]
    EqualVerify,
    #[error("Script failed an OP_CHECKMULTISIGVERIFY operation")]
    CheckMultisigVerify,
    #[error("Script failed an OP_CHECKSIGVERIFY operation")]
    CheckSigVerify,
    #[error("Script failed an OP_CHECKDATASIGVERIFY operation")]
    CheckDataSigVerify,
    #[error("Script failed an OP_NUMEQUALVERIFY operation")]
    NumEqualVerify,

    // Logical and structural errors
    #[error("Opcode missing or not understood")]
    BadOpcode,
    #[error("Attempted to use a disabled opcode")]
    DisabledOpcode,
    #[error("Operation not valid with the current stack size")]
    InvalidStackOperation,
    #[error("Operation not valid with the current altstack size")]
    InvalidAltstackOperation,
    #[error("Invalid OP_IF construction")]
    UnbalancedConditional,

    // Lock times
    #[error("Negative locktime")]
    NegativeLocktime,
    #[error("Locktime requirement not satisfied")]
    UnsatisfiedLocktime,

    // Signature and encoding rules
    #[error("Signature hash type missing or not understood")]
    SigHashType,
    #[error("Non-canonical DER signature")]
    SigDer,
    #[error("Data push larger than necessary")]
    MinimalData,
    #[error("Only push operators allowed in signatures")]
    SigPushOnly,
    #[error("Non-canonical signature: S value is unnecessarily high")]
    SigHighS,
    #[error("Dummy CHECKMULTISIG argument must be zero")]
    SigNullDummy,
    #[error("Public key is neither compressed or uncompressed")]
    PubkeyType,
    #[error("Stack size must be exactly one after execution")]
    CleanStack,
    #[error("OP_IF/NOTIF argument must be minimal")]
    MinimalIf,
    #[error("Signature must be zero for failed CHECK(MULTI)SIG operation")]
    SigNullFail,
    #[error("NOPx reserved for soft-fork upgrades")]
    DiscourageUpgradableNops,
    #[error("Illegal use of SIGHASH_FORKID")]
    IllegalForkId,
    #[error("Signature must use SIGHASH_FORKID")]
    MustUseForkId,
    #[error("Signature cannot be 65 bytes in CHECKMULTISIG")]
    SigBadLength,
    #[error("Only Schnorr signatures allowed in this operation")]
    SigNonSchnorr,

    // Schnorr multisig bitfield
    #[error("Bitfield of unexpected size")]
    BitfieldSize,
    #[error("Bitfield's bit out of the expected range")]
    BitRange,
    #[error("Invalid number of bit set in OP_CHECKMULTISIG")]
    InvalidBitCount,

    #[error("Validation resources exceeded (SigChecks)")]
    SigChecksLimitExceeded,
}

/// AuxPoW and header proof-of-work failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuxPowError {
    #[error("AuxPow nIndex must be 0")]
    NonZeroIndex,
    #[error("AuxPow parent has our chain ID")]
    ParentHasOurChainId,
    #[error("AuxPow chain merkle branch too long")]
    ChainMerkleBranchTooLong,
    #[error("AuxPow merkle root incorrect")]
    MerkleRootIncorrect,
    #[error("AuxPow coinbase transaction missing input")]
    CoinbaseMissingInput,
    #[error("AuxPow missing chain merkle root in parent coinbase")]
    MissingChainMerkleRoot,
    #[error("Multiple merged mining prefixes in coinbase")]
    MultipleMergeMinePrefixes,
    #[error("Merged mining prefix is not just before chain merkle root")]
    MergeMinePrefixMisplaced,
    #[error("AuxPow chain merkle root can have at most 20 preceding bytes of the parent coinbase")]
    ChainMerkleRootTooLate,
    #[error("AuxPow missing chain merkle tree size and nonce in parent coinbase")]
    MissingTreeSizeAndNonce,
    #[error("AuxPow merkle branch size does not match parent coinbase")]
    MerkleBranchSizeMismatch,
    #[error("AuxPow wrong chain index")]
    WrongChainIndex,
    #[error("Auxillary header proof of work failed")]
    ParentProofOfWork,
    #[error("block does not have our chain ID (got {got:x}, expected {expected:x}, full nVersion {version:x})")]
    WrongChainId { got: u32, expected: u32, version: i32 },
    #[error("non-AUX proof of work failed")]
    NonAuxProofOfWork,
    #[error("no AuxPow on block with AuxPow version")]
    MissingAuxPow,
    #[error("AuxPow on block with non-AuxPow version")]
    UnexpectedAuxPow,
    #[error("invalid target encoding")]
    InvalidTarget,
}

/// Wire decoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("unexpected end of data: needed {needed} bytes, {available} available")]
    UnexpectedEof { needed: usize, available: usize },
    #[error("non-canonical CompactSize encoding")]
    NonCanonicalVarInt,
    #[error("size {0} exceeds the maximum allowed")]
    OversizedVector(u64),
    #[error("{0} trailing bytes after object")]
    TrailingBytes(usize),
    #[error("bad snapshot magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
}

/// UTXO snapshot failures
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("{0} already exists")]
    PathExists(String),
    #[error("Invalid snapshot type \"{0}\" specified. Please specify \"rollback\" or \"latest\"")]
    InvalidType(String),
    #[error("No assumeutxo height at or below the tip at height {0}")]
    NoRollbackTarget(u32),
    #[error("Snapshot was taken on a different network")]
    NetworkMismatch,
    #[error("Snapshot content hash mismatch")]
    HashMismatch,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed snapshot: {0}")]
    Malformed(#[from] SerializationError),
}

/// Chain manipulation failures outside block validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainStateError {
    #[error("Block not found")]
    UnknownBlock,
    #[error("Block is not in the active chain")]
    NotInActiveChain,
    #[error("Cannot disconnect the genesis block")]
    Genesis,
    #[error("Block at height {0} is finalized")]
    Finalized(u32),
}

/// Why a transaction was refused by the mempool.
///
/// `Display` yields the reject reason; [`TxRejection::code`] the RPC code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxRejection {
    /// Fails even under block-validity script rules
    #[error("mandatory-script-verify-flag-failed ({0})")]
    MandatoryScript(ScriptError),
    /// Passes block-validity rules but violates local policy flags
    #[error("non-mandatory-script-verify-flag ({0})")]
    NonMandatoryScript(ScriptError),
    #[error("bad-txns-premature-spend-of-coinbase, tried to spend coinbase at depth {depth}")]
    PrematureCoinbaseSpend { depth: i64 },
    #[error("{0}")]
    Invalid(String),
    #[error("bad-txns-inputs-missingorspent")]
    MissingInputs,
    #[error("txn-already-in-mempool")]
    AlreadyInMempool,
    #[error("txn-mempool-conflict")]
    MempoolConflict,
    #[error("{0}")]
    Policy(String),
}

impl TxRejection {
    pub fn code(&self) -> i32 {
        match self {
            TxRejection::MissingInputs => RPC_VERIFY_ERROR,
            TxRejection::AlreadyInMempool => RPC_VERIFY_ALREADY_IN_CHAIN,
            _ => RPC_VERIFY_REJECTED,
        }
    }
}

/// Why a block was refused.
///
/// `Display` yields the short reason returned by block submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockRejection {
    #[error("high-hash")]
    HighHash(AuxPowError),
    #[error("bad-txnmrklroot")]
    BadMerkleRoot,
    #[error("bad-txns-duplicate")]
    DuplicateTransaction,
    #[error("bad-blk-length")]
    BadLength,
    #[error("bad-cb-missing")]
    CoinbaseMissing,
    #[error("bad-cb-multiple")]
    MultipleCoinbase,
    #[error("bad-cb-height")]
    CoinbaseHeight,
    #[error("bad-cb-length")]
    CoinbaseLength,
    #[error("bad-cb-amount")]
    CoinbaseAmount,
    #[error("tx-ordering")]
    TransactionOrdering,
    #[error("bad-blk-sigchecks")]
    TooManySigChecks,
    #[error("{0}")]
    BadTransaction(String),
    #[error("bad-txns-inputs-missingorspent")]
    InputsMissing,
    #[error("bad-txns-premature-spend-of-coinbase, tried to spend coinbase at depth {depth}")]
    PrematureCoinbaseSpend { depth: i64 },
    #[error("bad-txns-in-belowout")]
    InputsBelowOutputs,
    #[error("blk-bad-inputs, parallel script check failed")]
    ScriptCheckFailed(ScriptError),
    #[error("bad-prevblk")]
    UnknownParent,
    #[error("prev-blk-not-tip")]
    ParentNotTip,
    #[error("time-too-old")]
    TimeTooOld,
    #[error("bad-diffbits")]
    BadDifficultyBits,
    #[error("duplicate")]
    Duplicate,
    #[error("policy-bad-miner-fund")]
    PolicyMinerFund,
    #[error("policy-bad-staking-reward")]
    PolicyStakingReward,
}

impl BlockRejection {
    /// Short reason returned by block submission
    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// Whether the peer that relayed the block should be disconnected
    pub fn punish_peer(&self) -> bool {
        !matches!(
            self,
            BlockRejection::PolicyMinerFund
                | BlockRejection::PolicyStakingReward
                | BlockRejection::ParentNotTip
                | BlockRejection::Duplicate
        )
    }

    /// The specific log line, finer than the short reason
    pub fn detail(&self) -> String {
        match self {
            BlockRejection::HighHash(e) => e.to_string(),
            BlockRejection::ScriptCheckFailed(e) => format!("{}: {}", self, e),
            other => other.to_string(),
        }
    }
}
