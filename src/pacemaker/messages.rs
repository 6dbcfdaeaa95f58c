/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between replicas as part of view changes.
//!
//! ## Messages
//!
//! View changes involve two types of messages:
//! 1. [`TimeoutVote`], which a replica broadcasts to signal to others that its current view has timed
//!    out. It carries the highest QC the replica knows, so that the highest-known QC survives the
//!    view change.
//! 2. [`CertificateSync`], which a replica sends to a lagging peer to prove that it is safe to move
//!    past the peer's view. The proof consists of either:
//!     - a `QuorumCertificate`, which serves as evidence that progress has been made in a view, or
//!     - a `TimeoutCertificate`, which serves as evidence that a quorum of replicas have timed out
//!       in a view.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto::{CryptoError, CryptoGateway};
use crate::hotstuff::types::QuorumCertificate;
use crate::types::{
    crypto_primitives::encode,
    data_types::*,
    signed_messages::{SignedMessage, VoteMessage},
};

use super::types::TimeoutCertificate;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum PacemakerMessage {
    TimeoutVote(TimeoutVote),
    CertificateSync(CertificateSync),
}

impl PacemakerMessage {
    pub fn certificate_sync(certificate: impl Into<ProgressCertificate>) -> PacemakerMessage {
        PacemakerMessage::CertificateSync(CertificateSync {
            certificate: certificate.into(),
        })
    }

    pub fn chain_id(&self) -> ChainID {
        match self {
            PacemakerMessage::TimeoutVote(TimeoutVote { chain_id, .. }) => *chain_id,
            PacemakerMessage::CertificateSync(CertificateSync { certificate }) => {
                certificate.chain_id()
            }
        }
    }

    pub fn view(&self) -> ViewNumber {
        match self {
            PacemakerMessage::TimeoutVote(TimeoutVote { view, .. }) => *view,
            PacemakerMessage::CertificateSync(CertificateSync { certificate }) => certificate.view(),
        }
    }
}

impl From<TimeoutVote> for PacemakerMessage {
    fn from(timeout_vote: TimeoutVote) -> Self {
        PacemakerMessage::TimeoutVote(timeout_vote)
    }
}

/// A vote in favour of terminating a given view and moving to the next view. The signature is over
/// chain id, view, and the view of `highest_qc`, so the QC cannot be swapped for a lower one.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TimeoutVote {
    pub chain_id: ChainID,
    pub view: ViewNumber,
    pub voter: VerifyingKeyBytes,
    pub highest_qc: QuorumCertificate,
    pub signature: SignatureBytes,
}

impl TimeoutVote {
    pub fn new<C: CryptoGateway>(
        crypto: &C,
        chain_id: ChainID,
        view: ViewNumber,
        highest_qc: QuorumCertificate,
    ) -> Result<TimeoutVote, CryptoError> {
        let signature = crypto.sign(&timeout_vote_bytes(chain_id, view, highest_qc.view))?;
        Ok(TimeoutVote {
            chain_id,
            view,
            voter: crypto.public_key().to_bytes(),
            highest_qc,
            signature,
        })
    }
}

impl SignedMessage for TimeoutVote {
    fn message_bytes(&self) -> Vec<u8> {
        timeout_vote_bytes(self.chain_id, self.view, self.highest_qc.view)
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

/// The bytes signed by a timeout vote for `view` whose signer's highest QC is for `highest_qc_view`.
pub(crate) fn timeout_vote_bytes(
    chain_id: ChainID,
    view: ViewNumber,
    highest_qc_view: ViewNumber,
) -> Vec<u8> {
    encode(&(chain_id, view, highest_qc_view))
}

impl VoteMessage for TimeoutVote {
    fn chain_id(&self) -> ChainID {
        self.chain_id
    }

    fn view(&self) -> ViewNumber {
        self.view
    }
}

/// A message carrying a certificate that lets a lagging replica catch up.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CertificateSync {
    pub certificate: ProgressCertificate,
}

/// Proof that either:
/// 1. A quorum made a decision in a view ([`QuorumCertificate`]), or
/// 2. A quorum voted for terminating a view on timing out ([`TimeoutCertificate`]).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ProgressCertificate {
    TimeoutCertificate(TimeoutCertificate),
    QuorumCertificate(QuorumCertificate),
}

impl ProgressCertificate {
    pub fn chain_id(&self) -> ChainID {
        match self {
            ProgressCertificate::TimeoutCertificate(TimeoutCertificate { chain_id, .. }) => {
                *chain_id
            }
            ProgressCertificate::QuorumCertificate(QuorumCertificate { chain_id, .. }) => *chain_id,
        }
    }

    pub fn view(&self) -> ViewNumber {
        match self {
            ProgressCertificate::TimeoutCertificate(TimeoutCertificate { view, .. }) => *view,
            ProgressCertificate::QuorumCertificate(QuorumCertificate { view, .. }) => *view,
        }
    }
}

impl From<QuorumCertificate> for ProgressCertificate {
    fn from(value: QuorumCertificate) -> Self {
        ProgressCertificate::QuorumCertificate(value)
    }
}

impl From<TimeoutCertificate> for ProgressCertificate {
    fn from(value: TimeoutCertificate) -> Self {
        ProgressCertificate::TimeoutCertificate(value)
    }
}
