/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of types specific to view changes.

use std::collections::HashSet;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto::{CryptoError, CryptoGateway};
use crate::hotstuff::types::QuorumCertificate;
use crate::types::{
    collectors::{Collected, Collector},
    crypto_primitives::VerifyingKey,
    data_types::*,
    signed_messages::{has_quorum, Certificate},
    validator_set::ValidatorSet,
};

use super::messages::{timeout_vote_bytes, TimeoutVote};

/// Proof that a quorum of validators gave up on `view` without seeing a QC for it.
///
/// `highest_qc` is the highest QC carried by any of the timeout votes that went into the
/// certificate. The leader of the next view extends its block.
///
/// Each signer signed the view of its own highest QC. `highest_qc_views` holds those views at the
/// signers' positions, and `highest_qc` must be for the greatest of them, so a relayer cannot
/// replace it with a lower QC.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TimeoutCertificate {
    pub chain_id: ChainID,
    pub view: ViewNumber,
    pub signatures: SignatureSet,
    pub highest_qc_views: Vec<Option<ViewNumber>>,
    pub highest_qc: QuorumCertificate,
}

impl TimeoutCertificate {
    /// Get the view of the highest QC known to the signers of this certificate.
    pub fn highest_qc_view(&self) -> ViewNumber {
        self.highest_qc.view
    }
}

impl Certificate for TimeoutCertificate {
    fn is_correctly_signed<C: CryptoGateway>(&self, validator_set: &ValidatorSet, crypto: &C) -> bool {
        if !has_quorum(&self.signatures, validator_set)
            || self.highest_qc_views.len() != validator_set.len()
        {
            return false;
        }

        let mut greatest: Option<ViewNumber> = None;
        let signed = self
            .signatures
            .iter()
            .zip(&self.highest_qc_views)
            .zip(validator_set.validators());
        for ((signature, highest_qc_view), signer) in signed {
            match (signature, highest_qc_view) {
                (Some(signature), Some(highest_qc_view)) => {
                    let message = timeout_vote_bytes(self.chain_id, self.view, *highest_qc_view);
                    if !crypto.verify(signature, &message, signer) {
                        return false;
                    }
                    greatest = greatest.max(Some(*highest_qc_view));
                }
                (None, None) => (),
                _ => return false,
            }
        }
        greatest == Some(self.highest_qc.view)
    }
}

/// Helps leaders incrementally form [`TimeoutCertificate`]s by combining timeout votes for the same
/// chain_id and view by replicas in a given [validator set](ValidatorSet).
#[derive(Clone)]
pub(crate) struct TimeoutVoteCollector {
    chain_id: ChainID,
    view: ViewNumber,
    validator_set: ValidatorSet,
    collected_from: HashSet<VerifyingKey>,
    partials: Vec<(VerifyingKey, SignatureBytes)>,
    highest_qc_views: Vec<Option<ViewNumber>>,
    signature_set_power: TotalPower,
    highest_qc: Option<QuorumCertificate>,
    certified: bool,
}

impl Collector for TimeoutVoteCollector {
    type Vote = TimeoutVote;
    type Certificate = TimeoutCertificate;

    fn new(chain_id: ChainID, view: ViewNumber, validator_set: ValidatorSet) -> Self {
        let validator_count = validator_set.len();
        Self {
            chain_id,
            view,
            validator_set,
            collected_from: HashSet::new(),
            partials: Vec::new(),
            highest_qc_views: vec![None; validator_count],
            signature_set_power: TotalPower::new(0),
            highest_qc: None,
            certified: false,
        }
    }

    fn view(&self) -> ViewNumber {
        self.view
    }

    /// Adds the timeout vote to the signature set, returning a timeout certificate if adding the
    /// vote allows for one to be created.
    ///
    /// Re-broadcasts of a timeout vote by the same signer are reported as duplicates.
    fn collect<C: CryptoGateway>(
        &mut self,
        signer: &VerifyingKey,
        vote: TimeoutVote,
        crypto: &C,
    ) -> Result<Collected<TimeoutVote, TimeoutCertificate>, CryptoError> {
        if !self.collected_from.insert(*signer) {
            return Ok(Collected::Duplicate);
        }
        if self.certified {
            return Ok(Collected::AlreadyCertified);
        }

        self.partials.push((*signer, vote.signature));
        if let Some(pos) = self.validator_set.position(signer) {
            self.highest_qc_views[pos] = Some(vote.highest_qc.view);
        }
        if let Some(power) = self.validator_set.power(signer) {
            self.signature_set_power += *power;
        }
        if self
            .highest_qc
            .as_ref()
            .map_or(true, |highest_qc| vote.highest_qc.view > highest_qc.view)
        {
            self.highest_qc = Some(vote.highest_qc);
        }

        if self.signature_set_power < self.validator_set.quorum() {
            return Ok(Collected::Stored);
        }

        let highest_qc = match self.highest_qc.clone() {
            Some(highest_qc) => highest_qc,
            None => return Ok(Collected::Stored),
        };
        let signatures = crypto.aggregate(&self.partials, &self.validator_set)?;
        self.certified = true;
        self.partials.clear();

        Ok(Collected::Certified(TimeoutCertificate {
            chain_id: self.chain_id,
            view: self.view,
            signatures,
            highest_qc_views: self.highest_qc_views.clone(),
            highest_qc,
        }))
    }
}
