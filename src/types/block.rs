/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the 'block' type and its associated methods.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::hotstuff::types::QuorumCertificate;

use super::{
    crypto_primitives::{encode, CryptoHasher, Digest},
    data_types::*,
};

/// A unit of the agreed-upon chain.
///
/// A block refers to its parent through `justify`, the [`QuorumCertificate`] that certifies the
/// parent. The only block whose `justify` does not certify a known block is the genesis block.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub view: ViewNumber,
    pub justify: QuorumCertificate,
    pub payload_hash: CryptoHash,
    pub height: BlockHeight,
    pub chain_id: ChainID,
    pub hash: CryptoHash,
    pub timestamp: Timestamp,
}

impl Block {
    pub fn new(
        view: ViewNumber,
        justify: QuorumCertificate,
        payload_hash: CryptoHash,
        height: BlockHeight,
        chain_id: ChainID,
        timestamp: Timestamp,
    ) -> Block {
        Block {
            hash: Block::hash(view, &justify, &payload_hash, height, chain_id),
            view,
            justify,
            payload_hash,
            height,
            chain_id,
            timestamp,
        }
    }

    /// Create the genesis block of `chain_id`: view 0, height 0, an all-zero payload, and the
    /// sentinel [genesis QC](QuorumCertificate::genesis_qc) as its `justify`.
    pub fn genesis(chain_id: ChainID) -> Block {
        Block::new(
            ViewNumber::init(),
            QuorumCertificate::genesis_qc(chain_id),
            CryptoHash::new([0u8; 32]),
            BlockHeight::new(0),
            chain_id,
            Timestamp::default(),
        )
    }

    /// Compute the identity of a block. The timestamp is informational and is not hashed.
    pub fn hash(
        view: ViewNumber,
        justify: &QuorumCertificate,
        payload_hash: &CryptoHash,
        height: BlockHeight,
        chain_id: ChainID,
    ) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(encode(&view));
        hasher.update(encode(justify));
        hasher.update(encode(payload_hash));
        hasher.update(encode(&height));
        hasher.update(encode(&chain_id));
        CryptoHash::new(hasher.finalize().into())
    }

    /// Check whether `hash` really is the hash of the block's contents.
    pub fn is_correct(&self) -> bool {
        self.hash
            == Block::hash(
                self.view,
                &self.justify,
                &self.payload_hash,
                self.height,
                self.chain_id,
            )
    }

    /// Get the hash of the block's parent.
    pub fn parent(&self) -> CryptoHash {
        self.justify.block
    }

    /// Check whether this block is the genesis block of its chain.
    pub fn is_genesis(&self) -> bool {
        self.justify.is_genesis_qc() && self.height == BlockHeight::new(0)
    }
}
