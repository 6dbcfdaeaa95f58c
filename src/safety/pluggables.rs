/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable persistence of [`SafetyData`].
//!
//! The event handler only ever talks to a [`Persister`]. Library users that already have a
//! key-value store can instead implement [`KVStore`] for it and wrap it in a [`KVPersister`], which
//! lays the safety data out under three keys and writes all three in a single [`WriteBatch`].

use std::{
    fmt::{self, Display, Formatter},
    io,
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{hotstuff::types::QuorumCertificate, types::data_types::ViewNumber};

use super::safety_data::SafetyData;

/// Durable storage for [`SafetyData`].
pub trait Persister: Send + 'static {
    /// Durably store `safety_data`, replacing whatever was stored before. Must not return `Ok` until
    /// the data would survive a crash.
    fn save_safety_data(&mut self, safety_data: &SafetyData) -> Result<(), PersistenceError>;

    /// Load the stored safety data. `Ok(None)` means nothing was ever stored.
    fn load_safety_data(&self) -> Result<Option<SafetyData>, PersistenceError>;
}

pub trait KVStore: KVGet + Send + 'static {
    type WriteBatch: WriteBatch;

    /// Atomically apply every operation in `wb`.
    fn write(&mut self, wb: Self::WriteBatch) -> io::Result<()>;
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
}

/// Byte-prefixes that specify where each safety variable is stored in the user-provided key-value
/// store.
pub mod paths {
    pub const HIGHEST_VOTED_VIEW: [u8; 2] = [0, 0];
    pub const LOCKED_QC: [u8; 2] = [0, 1];
    pub const HIGHEST_ACKNOWLEDGED_QC: [u8; 2] = [0, 2];
}

/// Identifies a safety variable in error reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    HighestVotedView,
    LockedQC,
    HighestAcknowledgedQC,
}

impl Key {
    fn path(&self) -> &'static [u8] {
        match self {
            Key::HighestVotedView => &paths::HIGHEST_VOTED_VIEW,
            Key::LockedQC => &paths::LOCKED_QC,
            Key::HighestAcknowledgedQC => &paths::HIGHEST_ACKNOWLEDGED_QC,
        }
    }
}

/// [`Persister`] over any [`KVStore`].
pub struct KVPersister<K: KVStore> {
    kv_store: K,
}

impl<K: KVStore> KVPersister<K> {
    pub fn new(kv_store: K) -> Self {
        Self { kv_store }
    }

    fn read<T: BorshDeserialize>(&self, key: Key) -> Result<Option<T>, PersistenceError> {
        match self.kv_store.get(key.path()) {
            None => Ok(None),
            Some(bytes) => T::deserialize(&mut bytes.as_slice())
                .map(Some)
                .map_err(|source| PersistenceError::DeserializeValueError { key, source }),
        }
    }
}

impl<K: KVStore> Persister for KVPersister<K> {
    fn save_safety_data(&mut self, safety_data: &SafetyData) -> Result<(), PersistenceError> {
        let mut wb = K::WriteBatch::new();
        wb.set(
            Key::HighestVotedView.path(),
            &safety_data.highest_voted_view.try_to_vec()?,
        );
        wb.set(Key::LockedQC.path(), &safety_data.locked_qc.try_to_vec()?);
        wb.set(
            Key::HighestAcknowledgedQC.path(),
            &safety_data.highest_acknowledged_qc.try_to_vec()?,
        );
        self.kv_store.write(wb)?;
        Ok(())
    }

    fn load_safety_data(&self) -> Result<Option<SafetyData>, PersistenceError> {
        let highest_voted_view = self.read::<ViewNumber>(Key::HighestVotedView)?;
        let locked_qc = self.read::<QuorumCertificate>(Key::LockedQC)?;
        let highest_acknowledged_qc = self.read::<QuorumCertificate>(Key::HighestAcknowledgedQC)?;

        match (highest_voted_view, locked_qc, highest_acknowledged_qc) {
            (None, None, None) => Ok(None),
            (Some(highest_voted_view), Some(locked_qc), Some(highest_acknowledged_qc)) => {
                Ok(Some(SafetyData {
                    highest_voted_view,
                    locked_qc,
                    highest_acknowledged_qc,
                }))
            }
            (None, _, _) => Err(PersistenceError::ValueExpectedButNotFound {
                key: Key::HighestVotedView,
            }),
            (_, None, _) => Err(PersistenceError::ValueExpectedButNotFound { key: Key::LockedQC }),
            (_, _, None) => Err(PersistenceError::ValueExpectedButNotFound {
                key: Key::HighestAcknowledgedQC,
            }),
        }
    }
}

/// Error when reading or writing safety data.
#[derive(Debug)]
pub enum PersistenceError {
    /// The storage backend failed to write or encode the data.
    Io(io::Error),

    DeserializeValueError { key: Key, source: io::Error },

    /// Some, but not all, of the safety variables are stored.
    ValueExpectedButNotFound { key: Key },
}

impl From<io::Error> for PersistenceError {
    fn from(value: io::Error) -> Self {
        PersistenceError::Io(value)
    }
}

impl Display for PersistenceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Io(err) => write!(f, "failed to persist safety data: {}", err),
            PersistenceError::DeserializeValueError { key, source } => {
                write!(f, "failed to deserialize {:?}: {}", key, source)
            }
            PersistenceError::ValueExpectedButNotFound { key } => {
                write!(f, "safety data is incomplete: {:?} is missing", key)
            }
        }
    }
}

impl std::error::Error for PersistenceError {}
