/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Contracts between the consensus core and the application built on top of it.
//!
//! The core never looks inside payloads. When this replica leads a view, it asks the
//! [`PayloadSource`] for the hash of the payload to propose on top of the parent block; when blocks
//! become final, it tells the [`FinalizationSink`] about each of them, oldest first.

use crate::types::{block::Block, data_types::CryptoHash};

/// The mempool/execution collaborator that fills the blocks this replica proposes.
pub trait PayloadSource: Send + 'static {
    /// Called when this replica is the leader of the upcoming view and is about to propose a block
    /// extending `parent`.
    ///
    /// # Return value
    ///
    /// The hash of the payload. It occupies the `payload_hash` field of the proposed block.
    fn build_payload(&mut self, parent: &Block) -> CryptoHash;
}

/// The downstream collaborator that reacts to finalized blocks.
pub trait FinalizationSink: Send + 'static {
    /// Called exactly once per finalized block, in chain order.
    fn on_finalized(&mut self, block: &Block);
}

/// An ordered list of [`FinalizationSink`]s, each notified in the order it was added.
#[derive(Default)]
pub struct FinalizationSinks {
    sinks: Vec<Box<dyn FinalizationSink>>,
}

impl FinalizationSinks {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Append `sink`. It is notified after every sink added before it.
    pub fn with(mut self, sink: impl FinalizationSink) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl FinalizationSink for FinalizationSinks {
    fn on_finalized(&mut self, block: &Block) {
        for sink in self.sinks.iter_mut() {
            sink.on_finalized(block)
        }
    }
}
