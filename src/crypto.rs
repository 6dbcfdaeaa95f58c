/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Crypto Gateway: the only way protocol code signs, verifies, and aggregates signatures.
//!
//! The consensus core never touches signing keys or signature schemes directly. It consumes the
//! [`CryptoGateway`] trait, which is implemented once per process and selected at start-up. The
//! library ships [`Ed25519Gateway`], which supports the closed set of schemes in
//! [`SigningAlgorithm`].
//!
//! ## Aggregation
//!
//! Ed25519 signatures do not aggregate into a single short signature. "Aggregating" a set of votes
//! therefore means placing each signature in its signer's position inside a
//! [`SignatureSet`], and "verifying an aggregate" means verifying every signature in it.

use std::fmt::{self, Display, Formatter};

use rand_core::OsRng;

use crate::types::{
    crypto_primitives::{Keypair, Signature, SigningKey, Verifier, VerifyingKey},
    data_types::{SignatureBytes, SignatureSet},
    validator_set::ValidatorSet,
};

/// Signing, verification, and aggregation capabilities consumed by the consensus core.
pub trait CryptoGateway: Clone + Send + 'static {
    /// Get the verifying key that corresponds to the signatures produced by [`sign`](Self::sign).
    fn public_key(&self) -> VerifyingKey;

    /// Sign `message` with the replica's own key.
    ///
    /// A failure here is fatal for the replica's voting role.
    fn sign(&self, message: &[u8]) -> Result<SignatureBytes, CryptoError>;

    /// Check that `signature` was produced by `signer` over `message`.
    fn verify(&self, signature: &SignatureBytes, message: &[u8], signer: &VerifyingKey) -> bool;

    /// Combine `signatures` produced by members of `validator_set` into a single aggregate.
    fn aggregate(
        &self,
        signatures: &[(VerifyingKey, SignatureBytes)],
        validator_set: &ValidatorSet,
    ) -> Result<SignatureSet, CryptoError>;

    /// Check that every signature in `aggregate` was produced over `message` by the member of
    /// `validator_set` at the corresponding position.
    ///
    /// This does not check whether the signers form a quorum. That is the certificate's job.
    fn verify_aggregate(
        &self,
        aggregate: &SignatureSet,
        message: &[u8],
        validator_set: &ValidatorSet,
    ) -> bool;
}

/// The closed set of signature schemes supported by [`Ed25519Gateway`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SigningAlgorithm {
    /// Ed25519 with the permissive verification equation of RFC 8032.
    #[default]
    Ed25519,

    /// Ed25519 with strict verification, which additionally rejects small-order verifying keys and
    /// non-canonical signature encodings.
    Ed25519Strict,
}

/// [`CryptoGateway`] implementation backed by `ed25519-dalek`.
#[derive(Clone)]
pub struct Ed25519Gateway {
    keypair: Keypair,
    algorithm: SigningAlgorithm,
}

impl Ed25519Gateway {
    /// Create a gateway that signs with `signing_key` and verifies using `algorithm`.
    pub fn new(signing_key: SigningKey, algorithm: SigningAlgorithm) -> Self {
        Self {
            keypair: Keypair::new(signing_key),
            algorithm,
        }
    }

    /// Create a gateway around a freshly generated signing key.
    pub fn generate(algorithm: SigningAlgorithm) -> Self {
        Self::new(SigningKey::generate(&mut OsRng), algorithm)
    }

    /// Get the signing algorithm this gateway was configured with.
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }
}

impl CryptoGateway for Ed25519Gateway {
    fn public_key(&self) -> VerifyingKey {
        self.keypair.public()
    }

    fn sign(&self, message: &[u8]) -> Result<SignatureBytes, CryptoError> {
        Ok(self.keypair.sign(message))
    }

    fn verify(&self, signature: &SignatureBytes, message: &[u8], signer: &VerifyingKey) -> bool {
        let signature = Signature::from_bytes(&signature.bytes());
        match self.algorithm {
            SigningAlgorithm::Ed25519 => signer.verify(message, &signature).is_ok(),
            SigningAlgorithm::Ed25519Strict => signer.verify_strict(message, &signature).is_ok(),
        }
    }

    fn aggregate(
        &self,
        signatures: &[(VerifyingKey, SignatureBytes)],
        validator_set: &ValidatorSet,
    ) -> Result<SignatureSet, CryptoError> {
        let mut aggregate = SignatureSet::new(validator_set.len());
        for (signer, signature) in signatures {
            let pos = validator_set
                .position(signer)
                .ok_or(CryptoError::UnknownSigner {
                    signer: signer.to_bytes(),
                })?;
            aggregate.set(pos, Some(*signature));
        }
        Ok(aggregate)
    }

    fn verify_aggregate(
        &self,
        aggregate: &SignatureSet,
        message: &[u8],
        validator_set: &ValidatorSet,
    ) -> bool {
        if aggregate.len() != validator_set.len() {
            return false;
        }

        aggregate
            .iter()
            .zip(validator_set.validators())
            .all(|(signature, signer)| match signature {
                Some(signature) => self.verify(signature, message, signer),
                None => true,
            })
    }
}

/// Failures of the [`CryptoGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The gateway has no usable signing key.
    SigningUnavailable { reason: String },

    /// A signature to aggregate came from a key that is not in the validator set.
    UnknownSigner { signer: [u8; 32] },
}

impl Display for CryptoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::SigningUnavailable { reason } => {
                write!(f, "signing is unavailable: {}", reason)
            }
            CryptoError::UnknownSigner { .. } => {
                write!(f, "signature comes from a key outside of the validator set")
            }
        }
    }
}

impl std::error::Error for CryptoError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::data_types::Power;

    #[test]
    fn aggregate_places_signatures_by_position() {
        let gateways: Vec<Ed25519Gateway> = (1..=4u8)
            .map(|i| Ed25519Gateway::new(SigningKey::from_bytes(&[i; 32]), SigningAlgorithm::Ed25519))
            .collect();
        let validator_set: ValidatorSet = gateways
            .iter()
            .map(|g| (g.public_key(), Power::new(1)))
            .collect();

        let message = b"view 7";
        let partials: Vec<(VerifyingKey, SignatureBytes)> = gateways[..3]
            .iter()
            .map(|g| (g.public_key(), g.sign(message).unwrap()))
            .collect();

        let aggregate = gateways[0].aggregate(&partials, &validator_set).unwrap();
        assert_eq!(aggregate.len(), 4);
        assert_eq!(aggregate.count(), 3);
        for (signer, _) in &partials {
            let pos = validator_set.position(signer).unwrap();
            assert!(aggregate.get(pos).unwrap().is_some());
        }

        assert!(gateways[3].verify_aggregate(&aggregate, message, &validator_set));
        assert!(!gateways[3].verify_aggregate(&aggregate, b"view 8", &validator_set));
    }

    #[test]
    fn aggregate_rejects_outsiders() {
        let insider = Ed25519Gateway::new(SigningKey::from_bytes(&[1; 32]), SigningAlgorithm::Ed25519);
        let outsider = Ed25519Gateway::new(SigningKey::from_bytes(&[9; 32]), SigningAlgorithm::Ed25519);
        let validator_set: ValidatorSet = vec![(insider.public_key(), Power::new(1))].into_iter().collect();

        let partials = vec![(outsider.public_key(), outsider.sign(b"m").unwrap())];
        assert!(matches!(
            insider.aggregate(&partials, &validator_set),
            Err(CryptoError::UnknownSigner { .. })
        ));
    }

    #[test]
    fn strict_and_permissive_verification_agree_on_honest_signatures() {
        for algorithm in [SigningAlgorithm::Ed25519, SigningAlgorithm::Ed25519Strict] {
            let gateway = Ed25519Gateway::new(SigningKey::from_bytes(&[3; 32]), algorithm);
            let signature = gateway.sign(b"payload").unwrap();
            assert!(gateway.verify(&signature, b"payload", &gateway.public_key()));
            assert!(!gateway.verify(&signature, b"other", &gateway.public_key()));
        }
    }
}
