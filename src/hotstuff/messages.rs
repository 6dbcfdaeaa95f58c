/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between replicas during a view: the leader's
//! proposal and the replicas' votes on it.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto::{CryptoError, CryptoGateway};
use crate::pacemaker::types::TimeoutCertificate;
use crate::types::{
    block::Block,
    crypto_primitives::encode,
    data_types::*,
    signed_messages::{SignedMessage, VoteMessage},
};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum HotStuffMessage {
    Proposal(Proposal),
    Vote(Vote),
}

impl HotStuffMessage {
    /// Returns the chain ID associated with a given [`HotStuffMessage`].
    pub fn chain_id(&self) -> ChainID {
        match self {
            HotStuffMessage::Proposal(Proposal { chain_id, .. }) => *chain_id,
            HotStuffMessage::Vote(Vote { chain_id, .. }) => *chain_id,
        }
    }

    /// Returns the view number associated with a given [`HotStuffMessage`].
    pub fn view(&self) -> ViewNumber {
        match self {
            HotStuffMessage::Proposal(Proposal { block, .. }) => block.view,
            HotStuffMessage::Vote(Vote { view, .. }) => *view,
        }
    }
}

impl From<Proposal> for HotStuffMessage {
    fn from(proposal: Proposal) -> Self {
        HotStuffMessage::Proposal(proposal)
    }
}

impl From<Vote> for HotStuffMessage {
    fn from(vote: Vote) -> Self {
        HotStuffMessage::Vote(vote)
    }
}

/// A leader's proposal of `block` for `block.view`.
///
/// `last_view_tc` is set when the proposer entered its view through a timeout certificate, so that
/// replicas that missed the certificate can advance along with it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Proposal {
    pub chain_id: ChainID,
    pub block: Block,
    pub last_view_tc: Option<TimeoutCertificate>,
}

/// A replica's signed support for `block` in `view`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Vote {
    pub chain_id: ChainID,
    pub view: ViewNumber,
    pub block: CryptoHash,
    pub voter: VerifyingKeyBytes,
    pub signature: SignatureBytes,
}

impl Vote {
    /// Sign a vote for `block` in `view` with the key behind `crypto`.
    pub fn new<C: CryptoGateway>(
        crypto: &C,
        chain_id: ChainID,
        view: ViewNumber,
        block: CryptoHash,
    ) -> Result<Vote, CryptoError> {
        let signature = crypto.sign(&encode(&(chain_id, view, block)))?;
        Ok(Vote {
            chain_id,
            view,
            block,
            voter: crypto.public_key().to_bytes(),
            signature,
        })
    }
}

impl SignedMessage for Vote {
    fn message_bytes(&self) -> Vec<u8> {
        encode(&(self.chain_id, self.view, self.block))
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

impl VoteMessage for Vote {
    fn chain_id(&self) -> ChainID {
        self.chain_id
    }

    fn view(&self) -> ViewNumber {
        self.view
    }
}
