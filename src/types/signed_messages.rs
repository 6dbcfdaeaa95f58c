/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signed messages, votes and aggregates of votes.

use crate::crypto::CryptoGateway;

use super::{
    crypto_primitives::VerifyingKey,
    data_types::{ChainID, SignatureBytes, SignatureSet, TotalPower, ViewNumber},
    validator_set::ValidatorSet,
};

/// Data types that contain: 1. A message, and 2. A digital signature over said message whose
/// correctness can be verified against a `VerifyingKey`.
pub(crate) trait SignedMessage: Clone {
    /// Get the bytes that are passed as input into the signing function to form the signature
    /// of the `SignedMessage`.
    fn message_bytes(&self) -> Vec<u8>;

    /// Get the signature of the `SignedMessage`.
    fn signature_bytes(&self) -> SignatureBytes;

    /// Verify, through `crypto`, that `signature_bytes` is a signature created by `signer` over
    /// `message_bytes`.
    fn is_correct<C: CryptoGateway>(&self, crypto: &C, signer: &VerifyingKey) -> bool {
        crypto.verify(&self.signature_bytes(), &self.message_bytes(), signer)
    }
}

/// Data types that indicate that a validator supports a particular decision about a particular
/// `chain_id` and `view`.
pub(crate) trait VoteMessage: SignedMessage {
    /// Get the `chain_id` of the chain that the vote is about.
    fn chain_id(&self) -> ChainID;

    /// Get the `view` that the vote is about.
    fn view(&self) -> ViewNumber;
}

/// Data types that aggregate multiple votes of the same type into evidence that a quorum of
/// validators supports a particular decision.
pub(crate) trait Certificate {
    /// Check whether the certificate is correctly signed by a quorum of validators in the given
    /// `validator_set`.
    fn is_correctly_signed<C: CryptoGateway>(&self, validator_set: &ValidatorSet, crypto: &C) -> bool;
}

/// Check whether the positions of `signatures` that hold a signature add up to a quorum of
/// `validator_set`.
///
/// The signer set is read off the positions of the aggregate, so the aggregate must be exactly as
/// long as the validator set.
pub(crate) fn has_quorum(signatures: &SignatureSet, validator_set: &ValidatorSet) -> bool {
    if signatures.len() != validator_set.len() {
        return false;
    }

    let mut total_power = TotalPower::new(0);
    for (signature, (_, power)) in signatures.iter().zip(validator_set.validators_and_powers()) {
        if signature.is_some() {
            total_power += power;
        }
    }
    total_power >= validator_set.quorum()
}

/// A value whose signature has already been checked by the verification pool.
///
/// Only code inside this crate can wrap a value in `Verified`, so holding one is proof that the
/// check happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verified<T>(T);

impl<T> Verified<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(value)
    }

    /// Get a reference to the verified value.
    pub fn get(&self) -> &T {
        &self.0
    }

    /// Unwrap the verified value.
    pub fn into_inner(self) -> T {
        self.0
    }
}
