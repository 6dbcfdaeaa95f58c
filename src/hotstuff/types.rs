/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of types specific to the HotStuff voting round.

use std::collections::{HashMap, HashSet};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto::{CryptoError, CryptoGateway};
use crate::types::{
    block::Block,
    collectors::{Collected, Collector},
    crypto_primitives::{encode, VerifyingKey},
    data_types::*,
    signed_messages::{has_quorum, Certificate},
    validator_set::ValidatorSet,
};

use super::messages::Vote;

/// Proof that at least a quorum of validators have voted for a given block in a given view.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QuorumCertificate {
    pub chain_id: ChainID,
    pub view: ViewNumber,
    pub block: CryptoHash,
    pub signatures: SignatureSet,
}

impl QuorumCertificate {
    /// The sentinel QC carried in the `justify` of the genesis block. It certifies nothing.
    pub const fn genesis_qc(chain_id: ChainID) -> QuorumCertificate {
        QuorumCertificate {
            chain_id,
            view: ViewNumber::init(),
            block: CryptoHash::new([0u8; 32]),
            signatures: SignatureSet::genesis(),
        }
    }

    /// The unsigned QC that every replica treats as certifying `genesis`. It is the initial locked
    /// and highest QC of a fresh replica, and the `justify` of the first proposed block.
    pub fn for_genesis(genesis: &Block) -> QuorumCertificate {
        QuorumCertificate {
            chain_id: genesis.chain_id,
            view: ViewNumber::init(),
            block: genesis.hash,
            signatures: SignatureSet::genesis(),
        }
    }

    /// Check whether this is an unsigned QC of view 0.
    pub fn is_genesis_qc(&self) -> bool {
        self.view == ViewNumber::init() && self.signatures.is_empty()
    }

    /// Checks whether the QC can serve as evidence for its block.
    ///
    /// A genesis QC is accepted only if it certifies the configured `genesis` block. Any other QC
    /// must be correctly signed by a quorum of `validator_set`.
    pub(crate) fn is_correct<C: CryptoGateway>(
        &self,
        validator_set: &ValidatorSet,
        crypto: &C,
        genesis: &CryptoHash,
    ) -> bool {
        if self.is_genesis_qc() {
            self.block == *genesis
        } else {
            self.view > ViewNumber::init() && self.is_correctly_signed(validator_set, crypto)
        }
    }
}

impl Certificate for QuorumCertificate {
    /// Every signature is over the same `(chain_id, view, block)` triple that a [`Vote`] signs.
    fn is_correctly_signed<C: CryptoGateway>(&self, validator_set: &ValidatorSet, crypto: &C) -> bool {
        has_quorum(&self.signatures, validator_set)
            && crypto.verify_aggregate(
                &self.signatures,
                &encode(&(self.chain_id, self.view, self.block)),
                validator_set,
            )
    }
}

/// Serves to incrementally form a [`QuorumCertificate`] by combining votes for the same chain id,
/// view, and block by replicas from a given [validator set](ValidatorSet).
///
/// Remembers the first vote of every voter, so that a second vote for a different block in the same
/// view is reported rather than counted.
#[derive(Clone)]
pub(crate) struct VoteCollector {
    chain_id: ChainID,
    view: ViewNumber,
    validator_set: ValidatorSet,
    voted: HashMap<VerifyingKey, Vote>,
    tallies: HashMap<CryptoHash, (Vec<(VerifyingKey, SignatureBytes)>, TotalPower)>,
    certified: HashSet<CryptoHash>,
}

impl Collector for VoteCollector {
    type Vote = Vote;
    type Certificate = QuorumCertificate;

    fn new(chain_id: ChainID, view: ViewNumber, validator_set: ValidatorSet) -> Self {
        Self {
            chain_id,
            view,
            validator_set,
            voted: HashMap::new(),
            tallies: HashMap::new(),
            certified: HashSet::new(),
        }
    }

    fn view(&self) -> ViewNumber {
        self.view
    }

    fn collect<C: CryptoGateway>(
        &mut self,
        signer: &VerifyingKey,
        vote: Vote,
        crypto: &C,
    ) -> Result<Collected<Vote, QuorumCertificate>, CryptoError> {
        if let Some(previous) = self.voted.get(signer) {
            return Ok(if previous.block == vote.block {
                Collected::Duplicate
            } else {
                Collected::Conflicting(previous.clone())
            });
        }
        self.voted.insert(*signer, vote.clone());

        if self.certified.contains(&vote.block) {
            return Ok(Collected::AlreadyCertified);
        }

        let power = self
            .validator_set
            .power(signer)
            .copied()
            .unwrap_or(Power::new(0));
        let (partials, tally) = self
            .tallies
            .entry(vote.block)
            .or_insert_with(|| (Vec::new(), TotalPower::new(0)));
        partials.push((*signer, vote.signature));
        *tally += power;

        if *tally < self.validator_set.quorum() {
            return Ok(Collected::Stored);
        }

        let partials = self
            .tallies
            .remove(&vote.block)
            .map(|(partials, _)| partials)
            .unwrap_or_default();
        self.certified.insert(vote.block);
        let signatures = crypto.aggregate(&partials, &self.validator_set)?;

        Ok(Collected::Certified(QuorumCertificate {
            chain_id: self.chain_id,
            view: self.view,
            block: vote.block,
            signatures,
        }))
    }
}
