/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replica's entire safety memory: what must survive a restart so that it never votes twice in a
//! view or against its lock.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    hotstuff::types::QuorumCertificate,
    types::{block::Block, data_types::ViewNumber},
};

/// Process-local persisted state consulted by the [safety rules](super::rules).
///
/// `highest_voted_view` and `locked_qc.view` never decrease. Every update is computed by a pure
/// function in [`rules`](super::rules) and persisted before any message that depends on it is sent.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SafetyData {
    /// The highest view this replica has voted in.
    pub highest_voted_view: ViewNumber,

    /// The QC this replica refuses to contradict.
    pub locked_qc: QuorumCertificate,

    /// The highest QC this replica has seen and validated. It is the parent of this replica's next
    /// proposal and is carried in its timeout votes.
    pub highest_acknowledged_qc: QuorumCertificate,
}

impl SafetyData {
    /// The safety data of a replica that has never voted on the chain starting at `genesis`.
    pub fn new(genesis: &Block) -> Self {
        let genesis_qc = QuorumCertificate::for_genesis(genesis);
        Self {
            highest_voted_view: ViewNumber::init(),
            locked_qc: genesis_qc.clone(),
            highest_acknowledged_qc: genesis_qc,
        }
    }
}
