//! Active chain and UTXO set
//!
//! A single [`ChainState`] owns the best chain, the coins it leaves
//! unspent and the undo data needed to walk it back. Writers (connect,
//! disconnect, invalidate) take the lock exclusively, one block at a time;
//! readers see a consistent tip and coin set. Events are published before
//! the write lock is released, so subscribers receive them in the order
//! the chain changed.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::block::{self, BlockContext};
use crate::config::NodeConfig;
use crate::error::{BlockRejection, ChainStateError, Result};
use crate::events::{BlockInfo, ChainEvent, EventPublisher, RemovedBlock};
use crate::params::ChainParams;
use crate::pow::{get_next_work_required, HeaderInfo};
use crate::serialization::block_hash;
use crate::transaction::is_spendable_at;
use crate::types::*;

/// Timestamps a new block must beat the median of
const MEDIAN_TIME_SPAN: usize = 11;

/// Best block of the active chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Hash,
    pub height: Height,
    pub time: u32,
}

struct ChainEntry {
    hash: Hash,
    block: Block,
    undo: BlockUndo,
    /// Transactions in the chain up to and including this block
    chain_tx: u64,
}

impl ChainEntry {
    fn info(&self, height: Height) -> BlockInfo {
        BlockInfo {
            hash: self.hash,
            height,
            timestamp: self.block.header.timestamp,
        }
    }
}

struct ChainInner {
    utxos: UtxoSet,
    active: Vec<ChainEntry>,
    headers: Vec<HeaderInfo>,
    heights: HashMap<Hash, Height>,
    invalid: HashSet<Hash>,
    finalized: Option<Height>,
    staking_winners: HashMap<Hash, ByteString>,
}

impl ChainInner {
    fn tip(&self) -> ChainTip {
        let height = (self.active.len() - 1) as Height;
        let entry = &self.active[height as usize];
        ChainTip {
            hash: entry.hash,
            height,
            time: entry.block.header.timestamp,
        }
    }

    fn median_time_past(&self) -> i64 {
        let mut times: Vec<i64> = self
            .headers
            .iter()
            .rev()
            .take(MEDIAN_TIME_SPAN)
            .map(|h| h.time)
            .collect();
        times.sort_unstable();
        times[times.len() / 2]
    }

    fn push(&mut self, hash: Hash, block: Block, undo: BlockUndo) {
        let height = self.active.len() as Height;
        let chain_tx = self.active.last().map_or(0, |e| e.chain_tx) + block.transactions.len() as u64;
        self.headers.push(HeaderInfo {
            height,
            time: block.header.timestamp as i64,
            bits: block.header.bits,
        });
        self.heights.insert(hash, height);
        self.active.push(ChainEntry {
            hash,
            block,
            undo,
            chain_tx,
        });
    }

    /// Remove the tip and restore the coins it spent
    fn pop(&mut self) -> Option<(ChainEntry, Height)> {
        if self.active.len() <= 1 {
            return None;
        }
        let entry = self.active.pop()?;
        self.headers.pop();
        self.heights.remove(&entry.hash);
        block::disconnect_block(&entry.block, &mut self.utxos, &entry.undo);
        Some((entry, self.active.len() as Height))
    }

    fn removable(&self, height: Height) -> std::result::Result<(), ChainStateError> {
        if height == 0 {
            return Err(ChainStateError::Genesis);
        }
        match self.finalized {
            Some(finalized) if height <= finalized => Err(ChainStateError::Finalized(finalized)),
            _ => Ok(()),
        }
    }
}

/// The node's view of the best chain
pub struct ChainState {
    params: ChainParams,
    config: NodeConfig,
    rule_set: RuleSet,
    inner: RwLock<ChainInner>,
    events: EventPublisher,
}

impl ChainState {
    /// Chain holding only the network's genesis block.
    ///
    /// Genesis outputs are never added to the coin set.
    pub fn new(config: NodeConfig) -> Self {
        let params = config.chain_params();
        let rule_set = config.rule_set(&params);
        let mut inner = ChainInner {
            utxos: UtxoSet::new(),
            active: Vec::new(),
            headers: Vec::new(),
            heights: HashMap::new(),
            invalid: HashSet::new(),
            finalized: None,
            staking_winners: HashMap::new(),
        };
        inner.push(params.genesis_hash(), params.genesis.clone(), BlockUndo::default());
        info!(
            network = params.network.name(),
            ?rule_set,
            genesis = %hash_to_hex(&params.genesis_hash()),
            "chain state initialized"
        );
        ChainState {
            params,
            config,
            rule_set,
            inner: RwLock::new(inner),
            events: EventPublisher::new(),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn rule_set(&self) -> RuleSet {
        self.rule_set
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn tip(&self) -> ChainTip {
        self.inner.read().tip()
    }

    pub fn median_time_past(&self) -> i64 {
        self.inner.read().median_time_past()
    }

    pub fn block_hash_at(&self, height: Height) -> Option<Hash> {
        self.inner.read().active.get(height as usize).map(|e| e.hash)
    }

    pub fn height_of(&self, hash: &Hash) -> Option<Height> {
        self.inner.read().heights.get(hash).copied()
    }

    pub fn block(&self, hash: &Hash) -> Option<Block> {
        let inner = self.inner.read();
        let height = *inner.heights.get(hash)?;
        Some(inner.active[height as usize].block.clone())
    }

    pub fn is_invalid(&self, hash: &Hash) -> bool {
        self.inner.read().invalid.contains(hash)
    }

    pub fn finalized_height(&self) -> Option<Height> {
        self.inner.read().finalized
    }

    /// Compact target a block following the tip must carry
    pub fn next_work_required(&self, new_block_time: i64) -> Result<u32> {
        get_next_work_required(&self.inner.read().headers, new_block_time, &self.params)
    }

    pub fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.inner.read().utxos.get(outpoint).cloned()
    }

    /// Whether `outpoint` could be spent by a transaction confirmed at
    /// `current_height`. Unknown coins are never mature.
    pub fn is_mature(&self, outpoint: &OutPoint, current_height: Height) -> bool {
        self.inner
            .read()
            .utxos
            .get(outpoint)
            .is_some_and(|coin| is_spendable_at(&self.params, coin, current_height))
    }

    /// Run `f` against the coin set and tip under one read lock
    pub fn with_utxos<R>(&self, f: impl FnOnce(&UtxoSet, &ChainTip) -> R) -> R {
        let inner = self.inner.read();
        let tip = inner.tip();
        f(&inner.utxos, &tip)
    }

    /// Run `f` against the coin set as it stood after the block at
    /// `height`, together with that block's tip and chain tx count.
    ///
    /// Below the tip a copy of the coin set is rewound with undo data. The
    /// read lock is held until `f` returns.
    pub fn with_utxos_at<R>(
        &self,
        height: Height,
        f: impl FnOnce(&UtxoSet, &ChainTip, u64) -> R,
    ) -> Option<R> {
        let inner = self.inner.read();
        let tip_height = inner.tip().height;
        if height > tip_height {
            return None;
        }
        let mut utxos = Cow::Borrowed(&inner.utxos);
        for entry in inner.active[height as usize + 1..].iter().rev() {
            block::disconnect_block(&entry.block, utxos.to_mut(), &entry.undo);
        }
        let entry = &inner.active[height as usize];
        let base = ChainTip {
            hash: entry.hash,
            height,
            time: entry.block.header.timestamp,
        };
        Some(f(&*utxos, &base, entry.chain_tx))
    }

    /// Record the staking reward winner for blocks building on `prev_hash`
    pub fn set_staking_winner(&self, prev_hash: Hash, script: ByteString) {
        self.inner.write().staking_winners.insert(prev_hash, script);
    }

    pub fn staking_winner(&self, prev_hash: &Hash) -> Option<ByteString> {
        self.inner.read().staking_winners.get(prev_hash).cloned()
    }

    /// AcceptBlock: ℬ → BlockInfo ∪ ℰ
    ///
    /// 1. The block is new and builds on the current tip
    /// 2. Its time is above the median of the last 11 blocks
    /// 3. Its bits equal the required next work
    /// 4. ConnectBlock at tip height + 1
    /// 5. It becomes the tip and a `Connected` event is published
    pub fn connect_block(&self, block: &Block) -> std::result::Result<BlockInfo, BlockRejection> {
        let hash = block_hash(&block.header);
        let mut inner = self.inner.write();

        // 1. Position
        if inner.heights.contains_key(&hash) || inner.invalid.contains(&hash) {
            return Err(BlockRejection::Duplicate);
        }
        let tip = inner.tip();
        if block.header.prev_block_hash != tip.hash {
            return Err(if inner.heights.contains_key(&block.header.prev_block_hash) {
                BlockRejection::ParentNotTip
            } else {
                BlockRejection::UnknownParent
            });
        }
        let height = tip.height + 1;

        // 2. Time
        if (block.header.timestamp as i64) <= inner.median_time_past() {
            return Err(BlockRejection::TimeTooOld);
        }

        // 3. Difficulty
        let expected_bits =
            get_next_work_required(&inner.headers, block.header.timestamp as i64, &self.params)
                .map_err(|_| BlockRejection::BadDifficultyBits)?;
        if block.header.bits != expected_bits {
            return Err(BlockRejection::BadDifficultyBits);
        }

        // 4. Validate and apply
        let winner = inner.staking_winners.get(&tip.hash).cloned();
        let ctx = BlockContext {
            params: &self.params,
            config: &self.config,
            rule_set: self.rule_set,
            height,
            staking_winner: winner.as_deref(),
        };
        let connected = match block::connect_block(block, &mut inner.utxos, &ctx) {
            Ok(connected) => connected,
            Err(e) => {
                debug!(
                    hash = %hash_to_hex(&hash),
                    height,
                    reason = %e.detail(),
                    "block rejected"
                );
                return Err(e);
            }
        };

        // 5. New tip
        inner.push(hash, block.clone(), connected.undo);
        let info = inner.active[height as usize].info(height);
        self.events.publish(ChainEvent::Connected(info.clone()));
        drop(inner);

        info!(
            best = %hash_to_hex(&hash),
            height,
            txs = block.transactions.len(),
            fees = connected.fees,
            "UpdateTip"
        );
        Ok(info)
    }

    /// Disconnect the tip, restoring the coins it spent
    pub fn disconnect_tip(&self) -> std::result::Result<BlockInfo, ChainStateError> {
        let mut inner = self.inner.write();
        inner.removable(inner.tip().height)?;
        let (entry, height) = inner.pop().ok_or(ChainStateError::Genesis)?;
        let removed = RemovedBlock::new(&entry.block, height, entry.hash);
        let info = removed.block.clone();
        self.events.publish(ChainEvent::Disconnected(removed));
        drop(inner);

        info!(hash = %hash_to_hex(&entry.hash), height, "disconnected block");
        Ok(info)
    }

    /// Mark `hash` and every descendant invalid, rewinding the active chain
    /// to its parent.
    ///
    /// Descendants are published as `Disconnected`, tip first, then the
    /// block itself as `Invalidated`.
    pub fn invalidate_block(&self, hash: &Hash) -> std::result::Result<(), ChainStateError> {
        let mut inner = self.inner.write();
        let target = *inner
            .heights
            .get(hash)
            .ok_or(ChainStateError::NotInActiveChain)?;
        inner.removable(target)?;

        let mut events = Vec::new();
        while inner.active.len() as Height > target {
            let (entry, height) = inner.pop().ok_or(ChainStateError::Genesis)?;
            inner.invalid.insert(entry.hash);
            let removed = RemovedBlock::new(&entry.block, height, entry.hash);
            events.push(if height == target {
                ChainEvent::Invalidated(removed)
            } else {
                ChainEvent::Disconnected(removed)
            });
        }
        let tip = inner.tip();
        for event in events {
            self.events.publish(event);
        }
        drop(inner);

        warn!(
            hash = %hash_to_hex(hash),
            height = target,
            new_tip = tip.height,
            "invalidated block"
        );
        Ok(())
    }

    /// Make `hash` and its ancestors permanent
    pub fn finalize_block(&self, hash: &Hash) -> std::result::Result<BlockInfo, ChainStateError> {
        let mut inner = self.inner.write();
        let height = *inner
            .heights
            .get(hash)
            .ok_or(ChainStateError::NotInActiveChain)?;
        if inner.finalized.map_or(true, |f| height > f) {
            inner.finalized = Some(height);
        }
        let info = inner.active[height as usize].info(height);
        self.events.publish(ChainEvent::Finalized(info.clone()));
        drop(inner);

        debug!(hash = %hash_to_hex(hash), height, "finalized block");
        Ok(info)
    }
}
