/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the generic [`Collector`] trait.
//!
//! Implementations used by the [vote aggregator](crate::hotstuff::vote_aggregator) and the
//! [pacemaker](crate::pacemaker::types) live in the respective modules.

use crate::crypto::{CryptoError, CryptoGateway};

use super::{
    crypto_primitives::VerifyingKey,
    data_types::{ChainID, ViewNumber},
    signed_messages::{Certificate, VoteMessage},
    validator_set::ValidatorSet,
};

/// Result of handing a single vote to a [`Collector`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Collected<V, C> {
    /// The vote was counted, but no quorum has been reached yet.
    Stored,

    /// The same signer already contributed this exact decision.
    Duplicate,

    /// The vote completed a quorum.
    Certified(C),

    /// The decision this vote is about was already certified; the vote adds nothing.
    AlreadyCertified,

    /// The signer already voted for a different decision in the same view. Carries the earlier
    /// vote.
    Conflicting(V),
}

/// Types that progressively combine matching votes to form certificates.
pub(crate) trait Collector {
    /// The specific vote type that this `Collector` takes in as input.
    type Vote: VoteMessage;

    /// The specific certificate type that this `Collector` returns as output.
    type Certificate: Certificate;

    /// Create a new instance of the `Collector`, configuring it to collect votes for the specified
    /// `chain_id` and `view`, signed by a member of `validator_set`.
    fn new(chain_id: ChainID, view: ViewNumber, validator_set: ValidatorSet) -> Self;

    /// Get the `View` that this `Collector` is currently configured to collect votes about.
    fn view(&self) -> ViewNumber;

    /// Collect a `vote` signed by `signer`, aggregating signatures through `crypto` once a quorum of
    /// matching votes has been collected.
    ///
    /// # Preconditions
    ///
    /// `vote.is_correct(crypto, signer)`, `vote.chain_id()` and `vote.view()` match the collector,
    /// and `signer` is a member of the collector's validator set.
    fn collect<C: CryptoGateway>(
        &mut self,
        signer: &VerifyingKey,
        vote: Self::Vote,
        crypto: &C,
    ) -> Result<Collected<Self::Vote, Self::Certificate>, CryptoError>;
}
