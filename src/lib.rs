//! # abc-consensus
//!
//! Consensus core of a merge-mined, scrypt proof-of-work chain that runs
//! either the legacy Dogecoin script rules or the modern eCash-ABC rules.
//!
//! ## Architecture
//!
//! Validation is layered bottom-up:
//! - wire formats (`serialization`) and hashing (`crypto`)
//! - the script interpreter (`script`, `sighash`, `signature`, `flags`)
//! - transaction and block checks (`transaction`, `block`, `economic`,
//!   `pow`, `auxpow`)
//! - the stateful layer (`chainstate`, `mempool`, `mining`, `snapshot`,
//!   `events`)
//!
//! Everything below the stateful layer is a pure function of its inputs
//! and a [`ChainParams`]/[`NodeConfig`] pair passed in explicitly.
//!
//! ## Usage
//!
//! ```rust
//! use abc_consensus::{Consensus, NodeConfig};
//!
//! let consensus = Consensus::new(NodeConfig::regtest()).unwrap();
//! assert_eq!(consensus.tip().height, 0);
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod config;
pub mod params;
pub mod serialization;
pub mod crypto;
pub mod opcodes;
pub mod flags;
pub mod sighash;
pub mod signature;
pub mod script;
pub mod transaction;
pub mod economic;
pub mod pow;
pub mod auxpow;
pub mod block;
pub mod events;
pub mod chainstate;
pub mod mempool;
pub mod mining;
pub mod snapshot;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use config::NodeConfig;
pub use params::{ChainParams, Network};
pub use error::{
    AuxPowError, BlockRejection, ChainStateError, ConsensusError, Result, ScriptError,
    SnapshotError, TxRejection,
};
pub use chainstate::{ChainState, ChainTip};
pub use events::{BlockInfo, ChainEvent};
pub use mempool::Mempool;
pub use mining::BlockTemplate;
pub use snapshot::SnapshotInfo;

use std::path::Path;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::debug;

/// A node's consensus engine: one chain, one mempool, one configuration.
///
/// # Examples
///
/// ```
/// use abc_consensus::{Consensus, NodeConfig};
///
/// let consensus = Consensus::new(NodeConfig::regtest()).unwrap();
/// let events = consensus.subscribe();
///
/// let time = consensus.tip().time as i64 + 60;
/// let info = consensus.generate_block(vec![0x51], time).unwrap();
/// assert_eq!(info.height, 1);
/// assert_eq!(events.try_recv().unwrap().kind(), "CONNECTED");
/// ```
pub struct Consensus {
    chain: ChainState,
    mempool: Mutex<Mempool>,
}

impl Consensus {
    /// Build an engine at the genesis block of the configured network
    ///
    /// # Examples
    ///
    /// ```
    /// use abc_consensus::{Consensus, NodeConfig};
    ///
    /// let mut config = NodeConfig::regtest();
    /// config.max_block_size = 10;
    /// assert!(Consensus::new(config).is_err());
    /// ```
    pub fn new(config: NodeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ConsensusError::Config(e.to_string()))?;
        Ok(Consensus {
            chain: ChainState::new(config),
            mempool: Mutex::new(Mempool::new()),
        })
    }

    pub fn chain(&self) -> &ChainState {
        &self.chain
    }

    pub fn config(&self) -> &NodeConfig {
        self.chain.config()
    }

    pub fn params(&self) -> &ChainParams {
        self.chain.params()
    }

    pub fn tip(&self) -> ChainTip {
        self.chain.tip()
    }

    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        self.chain.events().subscribe()
    }

    /// Whether `outpoint` could be spent in a block at `current_height`
    pub fn is_mature(&self, outpoint: &OutPoint, current_height: Height) -> bool {
        self.chain.is_mature(outpoint, current_height)
    }

    pub fn mempool_size(&self) -> usize {
        self.mempool.lock().len()
    }

    /// Structural checks of a lone transaction
    ///
    /// # Examples
    ///
    /// ```
    /// use abc_consensus::{Consensus, NodeConfig};
    /// use abc_consensus::types::*;
    ///
    /// let consensus = Consensus::new(NodeConfig::regtest()).unwrap();
    /// let tx = Transaction {
    ///     version: 1,
    ///     inputs: vec![],
    ///     outputs: vec![TransactionOutput {
    ///         value: 1000,
    ///         script_pubkey: vec![0x51],
    ///     }],
    ///     lock_time: 0,
    /// };
    /// let result = consensus.validate_transaction(&tx).unwrap();
    /// assert_eq!(result, ValidationResult::Invalid("bad-txns-vin-empty".to_string()));
    /// ```
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<ValidationResult> {
        transaction::check_transaction(tx)
    }

    /// SubmitBlock: bytes → ∅ ∪ reason
    ///
    /// `None` when the block became the new tip. A block whose parent is
    /// known but not the tip reports `inconclusive`.
    ///
    /// # Examples
    ///
    /// ```
    /// use abc_consensus::{Consensus, NodeConfig};
    ///
    /// let consensus = Consensus::new(NodeConfig::regtest()).unwrap();
    /// assert_eq!(consensus.submit_block(&[0x00]), Some("Block decode failed".to_string()));
    /// ```
    pub fn submit_block(&self, bytes: &[u8]) -> Option<String> {
        let block = match serialization::deserialize_block(bytes) {
            Ok(block) => block,
            Err(e) => {
                debug!(error = %e, "block decode failed");
                return Some("Block decode failed".to_string());
            }
        };
        match self.connect(&block) {
            Ok(_) => None,
            Err(BlockRejection::ParentNotTip) => Some("inconclusive".to_string()),
            Err(rejection) => Some(rejection.reason()),
        }
    }

    /// SubmitTransaction: bytes → txid ∪ rejection
    ///
    /// # Examples
    ///
    /// ```
    /// use abc_consensus::{Consensus, NodeConfig};
    ///
    /// let consensus = Consensus::new(NodeConfig::regtest()).unwrap();
    /// let err = consensus.submit_transaction(&[0x01]).unwrap_err();
    /// assert_eq!(err.code(), -26);
    /// ```
    pub fn submit_transaction(&self, bytes: &[u8]) -> std::result::Result<Hash, TxRejection> {
        let tx = serialization::deserialize_transaction(bytes)
            .map_err(|_| TxRejection::Invalid("TX decode failed".to_string()))?;
        self.accept_transaction(&tx)
    }

    pub fn accept_transaction(&self, tx: &Transaction) -> std::result::Result<Hash, TxRejection> {
        mempool::accept_to_memory_pool(tx, &self.chain, &mut self.mempool.lock())
    }

    fn connect(&self, block: &Block) -> std::result::Result<BlockInfo, BlockRejection> {
        let info = self.chain.connect_block(block)?;
        let evicted = self.mempool.lock().remove_for_block(block);
        if evicted > 0 {
            debug!(height = info.height, evicted, "mempool updated for block");
        }
        Ok(info)
    }

    /// getblocktemplate over the current mempool
    pub fn block_template(&self, time: i64) -> Result<BlockTemplate> {
        let candidates = self.mempool.lock().transactions();
        mining::create_block_template(&self.chain, &candidates, self.config(), time)
    }

    /// Assemble a block from the mempool, solve it and connect it
    pub fn generate_block(&self, payout_script: ByteString, time: i64) -> Result<BlockInfo> {
        let candidates = self.mempool.lock().transactions();
        let mut block = mining::create_block(&self.chain, candidates, payout_script, time)?;
        mining::solve_block(&mut block.header, self.params())?;
        self.connect(&block)
            .map_err(|r| ConsensusError::BlockValidation(r.detail()))
    }

    /// dumptxoutset: `mode` is `latest` or `rollback`
    pub fn dump_snapshot(
        &self,
        path: &Path,
        mode: &str,
    ) -> std::result::Result<SnapshotInfo, SnapshotError> {
        snapshot::dump_snapshot(&self.chain, path, mode)
    }

    /// Invalidate `hash` and its descendants, then evict pool transactions
    /// the shorter chain can no longer fund
    pub fn invalidate_block(&self, hash: &Hash) -> Result<()> {
        self.chain.invalidate_block(hash)?;
        let evicted = self.mempool.lock().remove_invalid(&self.chain);
        if evicted > 0 {
            debug!(evicted, "mempool updated after invalidation");
        }
        Ok(())
    }

    pub fn finalize_block(&self, hash: &Hash) -> Result<BlockInfo> {
        Ok(self.chain.finalize_block(hash)?)
    }
}
