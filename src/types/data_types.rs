/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign},
    time::SystemTime,
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number that uniquely identifies a blockchain.
///
/// Every block, vote, and certificate of the same chain carries the same `ChainID`. Replicas drop
/// messages whose `ChainID` differs from the one they were configured with, so that a signature
/// produced for one chain can never be replayed on another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct ChainID(u64);

impl ChainID {
    /// Create a new `ChainID` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `ChainID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ChainID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Height of a block in the block tree.
///
/// Starts at 0 for the genesis block, and increases by exactly 1 from a block to each of its
/// children.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct BlockHeight(u64);

impl BlockHeight {
    /// Create a new `BlockHeight` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `BlockHeight`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for BlockHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for BlockHeight {
    type Output = BlockHeight;

    fn add(self, rhs: u64) -> Self::Output {
        BlockHeight::new(self.0.saturating_add(rhs))
    }
}

/// 32-byte cryptographic hash.
///
/// Within this crate, `CryptoHash`-es are encountered in two contexts:
/// 1. [`payload_hash`](super::block::Block::payload_hash): any 32-byte digest produced by the
///    [payload source](crate::app::PayloadSource).
/// 2. [`hash`](super::block::Block#structfield.hash): always a SHA256 hash, which serves as the
///    identity of a block.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ed25519 digital signature.
///
/// Produced and checked through the [crypto gateway](crate::crypto::CryptoGateway), never directly by
/// protocol code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

/// Raw bytes of an Ed25519 verifying key, as carried in votes.
///
/// Exists because [`VerifyingKey`](ed25519_dalek::VerifyingKey) does not implement the Borsh traits.
pub type VerifyingKeyBytes = [u8; 32];

/// Weight of a specific validator's votes in consensus decisions.
///
/// The higher the power, the more weight the validator's votes have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct Power(u64);

impl Power {
    /// Create a new `Power` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `Power`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Sum of the [`Power`]s of a set of validators.
///
/// Wraps a `u128`, which is bigger than the `u64` that `Power` wraps around, so that summing up large
/// `Power`s does not overflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct TotalPower(u128);

impl TotalPower {
    /// Create a new `TotalPower` wrapping `int`.
    pub const fn new(int: u128) -> Self {
        Self(int)
    }

    /// Get the inner `u128` value of this `TotalPower`.
    pub const fn int(&self) -> u128 {
        self.0
    }
}

impl AddAssign<Power> for TotalPower {
    fn add_assign(&mut self, rhs: Power) {
        self.0.add_assign(rhs.0 as u128)
    }
}

/// An ordered list of [`SignatureBytes`] from the same
/// [`ValidatorSet`](super::validator_set::ValidatorSet).
///
/// # Ordering
///
/// If `signature_bytes` was created by `validator`, then it appears in the
/// [`validator_set.position(validator)`](super::validator_set::ValidatorSet::position) position. The
/// positions holding `Some` therefore double as the certificate's signer set.
///
/// # Optionality
///
/// A `SignatureSet` created using [`new`](Self::new) initially contains `vec![None; len]`. As `set` is
/// called, these `None`s are replaced with `Some(signature_bytes)`.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureSet(Vec<Option<SignatureBytes>>);

impl SignatureSet {
    /// Create the empty `SignatureSet` carried by the genesis certificates.
    pub const fn genesis() -> Self {
        Self(Vec::new())
    }

    /// Create a new `SignatureSet` initially containing `len` `None`s.
    pub fn new(len: usize) -> Self {
        Self(vec![None; len])
    }

    /// Get a reference to the inner `Vec<Option<SignatureBytes>>` of this `SignatureSet`.
    pub const fn vec(&self) -> &Vec<Option<SignatureBytes>> {
        &self.0
    }

    /// Get an iterator over the `Option<SignatureBytes>`s in this `SignatureSet`.
    pub fn iter(&self) -> std::slice::Iter<'_, Option<SignatureBytes>> {
        self.0.iter()
    }

    /// Get a reference to the `Option<SignatureBytes>` at position `pos`, if `pos` is in range.
    pub fn get(&self, pos: usize) -> Option<&Option<SignatureBytes>> {
        self.0.get(pos)
    }

    /// Set the value at `pos` in this `SignatureSet` to be `signature`. Out-of-range positions are
    /// ignored.
    pub(crate) fn set(&mut self, pos: usize, signature: Option<SignatureBytes>) {
        if let Some(slot) = self.0.get_mut(pos) {
            *slot = signature
        }
    }

    /// Get the length of the inner vector, which equals the size of the corresponding validator set
    /// (not the number of signatures).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether the inner vector is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Count the signatures (`Some` values) in this `SignatureSet`.
    pub fn count(&self) -> usize {
        self.0.iter().filter(|sig| sig.is_some()).count()
    }
}

/// View number. Starts at 0 (the genesis view) and only ever increases for a correct replica.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    /// Create a new `ViewNumber` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the initial `ViewNumber`, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the inner `u64` of this `ViewNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the view immediately preceding this one, or view 0 if this is view 0.
    pub const fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Saturates at `u64::MAX`. Views are read off the wire, so a peer can send any value.
impl Add<u64> for ViewNumber {
    type Output = ViewNumber;

    fn add(self, rhs: u64) -> Self::Output {
        ViewNumber(self.0.saturating_add(rhs))
    }
}

/// Wall-clock time at which a block was produced, in milliseconds since the Unix Epoch.
///
/// Informational only: timestamps are not part of the block hash and are never used in safety
/// decisions.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new `Timestamp` wrapping `millis`.
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get the current time as a `Timestamp`. Clocks set before the Unix Epoch read as 0.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or_default();
        Self(millis)
    }

    /// Get the inner `u64` value of this `Timestamp`.
    pub const fn millis(&self) -> u64 {
        self.0
    }
}
