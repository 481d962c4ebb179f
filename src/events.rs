//! Block lifecycle notifications
//!
//! Every change to the active chain is published to all subscribers, in
//! the order it happened. A subscriber whose receiver was dropped is
//! forgotten on the next publish.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::trace;

use crate::types::*;

/// Identity of a block an event is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: Hash,
    pub height: Height,
    pub timestamp: u32,
}

/// A block leaving the active chain, with what its coinbase paid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedBlock {
    pub block: BlockInfo,
    pub coinbase_script_sig: ByteString,
    pub coinbase_outputs: Vec<TransactionOutput>,
}

impl RemovedBlock {
    pub fn new(block: &Block, height: Height, hash: Hash) -> Self {
        let (script_sig, outputs) = match block.transactions.first() {
            Some(coinbase) => (
                coinbase
                    .inputs
                    .first()
                    .map(|i| i.script_sig.clone())
                    .unwrap_or_default(),
                coinbase.outputs.clone(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        RemovedBlock {
            block: BlockInfo {
                hash,
                height,
                timestamp: block.header.timestamp,
            },
            coinbase_script_sig: script_sig,
            coinbase_outputs: outputs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Connected(BlockInfo),
    Finalized(BlockInfo),
    Disconnected(RemovedBlock),
    Invalidated(RemovedBlock),
}

impl ChainEvent {
    pub fn block(&self) -> &BlockInfo {
        match self {
            ChainEvent::Connected(info) | ChainEvent::Finalized(info) => info,
            ChainEvent::Disconnected(removed) | ChainEvent::Invalidated(removed) => &removed.block,
        }
    }

    /// Upper-case tag used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            ChainEvent::Connected(_) => "CONNECTED",
            ChainEvent::Finalized(_) => "FINALIZED",
            ChainEvent::Disconnected(_) => "DISCONNECTED",
            ChainEvent::Invalidated(_) => "INVALIDATED",
        }
    }
}

/// Fan-out of chain events to any number of receivers
#[derive(Debug, Default)]
pub struct EventPublisher {
    subscribers: Mutex<Vec<Sender<ChainEvent>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: ChainEvent) {
        let mut subscribers = self.subscribers.lock();
        trace!(
            kind = event.kind(),
            height = event.block().height,
            subscribers = subscribers.len(),
            "publishing chain event"
        );
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
