/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Turns individual [`Vote`]s into [`QuorumCertificate`]s, exactly once per view and block.
//!
//! The aggregator keeps one [`VoteCollector`] per view. Collectors for views that the replica has
//! left behind are dropped by [`prune_below`](VoteAggregator::prune_below), which the event handler
//! calls on every view advance. Votes for views more than [`VIEWS_AHEAD`] above the lowest view still
//! held are refused, so the number of collectors never exceeds `VIEWS_AHEAD + 1`.

use std::collections::BTreeMap;

use crate::crypto::{CryptoError, CryptoGateway};
use crate::types::{
    collectors::{Collected, Collector},
    data_types::{ChainID, VerifyingKeyBytes, ViewNumber},
    signed_messages::{SignedMessage, Verified},
    validator_set::ValidatorSet,
};

use super::messages::Vote;
use super::types::{QuorumCertificate, VoteCollector};

/// How far above the lowest view still held a vote's view may be.
///
/// The event handler prunes below the view before the current one, so this admits votes for the
/// previous, current, and next view.
pub const VIEWS_AHEAD: u64 = 2;

/// What happened to a vote handed to [`VoteAggregator::add_vote`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddVoteOutcome {
    Stored,
    DuplicateIgnored,
    FormedQC(QuorumCertificate),
    InvalidSignature,
    Equivocation(EquivocationEvidence),

    /// A QC for the vote's block was already formed. The vote is not counted again.
    AlreadyCertified,

    /// The vote is for a view the aggregator has pruned.
    Stale,

    /// The vote is for a view too far ahead of the views the aggregator is collecting for.
    TooFarAhead,

    /// The voter is not a member of the validator set.
    NotAValidator,

    /// The vote belongs to another chain.
    WrongChain,
}

/// Two votes by the same voter for different blocks in the same view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EquivocationEvidence {
    pub voter: VerifyingKeyBytes,
    pub view: ViewNumber,
    pub first: Vote,
    pub second: Vote,
}

pub struct VoteAggregator {
    chain_id: ChainID,
    validator_set: ValidatorSet,
    collectors: BTreeMap<ViewNumber, VoteCollector>,
    lowest_view: ViewNumber,
}

impl VoteAggregator {
    pub fn new(chain_id: ChainID, validator_set: ValidatorSet) -> Self {
        Self {
            chain_id,
            validator_set,
            collectors: BTreeMap::new(),
            lowest_view: ViewNumber::init(),
        }
    }

    /// Verify `vote`'s signature through `crypto`, then collect it.
    ///
    /// Returns an error only if aggregating a completed quorum fails.
    pub fn add_vote<C: CryptoGateway>(
        &mut self,
        vote: Vote,
        crypto: &C,
    ) -> Result<AddVoteOutcome, CryptoError> {
        self.add(vote, crypto, true)
    }

    /// Collect a vote whose signature was already checked by the verification pool.
    pub fn add_verified_vote<C: CryptoGateway>(
        &mut self,
        vote: Verified<Vote>,
        crypto: &C,
    ) -> Result<AddVoteOutcome, CryptoError> {
        self.add(vote.into_inner(), crypto, false)
    }

    fn add<C: CryptoGateway>(
        &mut self,
        vote: Vote,
        crypto: &C,
        check_signature: bool,
    ) -> Result<AddVoteOutcome, CryptoError> {
        if vote.chain_id != self.chain_id {
            return Ok(AddVoteOutcome::WrongChain);
        }
        if vote.view < self.lowest_view {
            return Ok(AddVoteOutcome::Stale);
        }
        if vote.view > self.lowest_view + VIEWS_AHEAD {
            return Ok(AddVoteOutcome::TooFarAhead);
        }
        let signer = match self.validator_set.get_by_bytes(&vote.voter) {
            Some(signer) => *signer,
            None => return Ok(AddVoteOutcome::NotAValidator),
        };
        if check_signature && !vote.is_correct(crypto, &signer) {
            return Ok(AddVoteOutcome::InvalidSignature);
        }

        let chain_id = self.chain_id;
        let validator_set = &self.validator_set;
        let collector = self
            .collectors
            .entry(vote.view)
            .or_insert_with(|| VoteCollector::new(chain_id, vote.view, validator_set.clone()));

        let outcome = match collector.collect(&signer, vote.clone(), crypto)? {
            Collected::Stored => AddVoteOutcome::Stored,
            Collected::Duplicate => AddVoteOutcome::DuplicateIgnored,
            Collected::Certified(qc) => AddVoteOutcome::FormedQC(qc),
            Collected::AlreadyCertified => AddVoteOutcome::AlreadyCertified,
            Collected::Conflicting(first) => AddVoteOutcome::Equivocation(EquivocationEvidence {
                voter: vote.voter,
                view: vote.view,
                first,
                second: vote,
            }),
        };
        Ok(outcome)
    }

    /// Discard the collectors of every view lower than `view`, and refuse votes for them from now on.
    pub fn prune_below(&mut self, view: ViewNumber) {
        if view > self.lowest_view {
            self.lowest_view = view;
            self.collectors = self.collectors.split_off(&view);
        }
    }

    /// Get the number of views for which votes are currently held.
    pub fn active_views(&self) -> usize {
        self.collectors.len()
    }
}
