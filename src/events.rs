/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events a replica emits, for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Events are published
//! by the algorithm thread and delivered to the handlers registered in the
//! [`ReplicaSpec`](crate::replica::ReplicaSpec) by the event bus thread, so a slow handler never
//! delays consensus.

use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use ed25519_dalek::VerifyingKey;

use crate::event_handler::{MalformedInput, SafetyViolation};
use crate::hotstuff::{
    messages::{Proposal, Vote},
    types::QuorumCertificate,
};
use crate::pacemaker::{
    messages::{ProgressCertificate, TimeoutVote},
    types::TimeoutCertificate,
};
use crate::types::{
    block::Block,
    data_types::{BlockHeight, CryptoHash, ViewNumber},
};

pub enum Event {
    // Events that change the block tree or the safety data.
    InsertBlock(InsertBlockEvent),
    FinalizeBlock(FinalizeBlockEvent),
    PruneBlock(PruneBlockEvent),
    UpdateHighestQC(UpdateHighestQCEvent),
    UpdateLockedQC(UpdateLockedQCEvent),
    // Events that involve broadcasting or sending a message.
    Propose(ProposeEvent),
    Vote(VoteEvent),
    TimeoutVote(TimeoutVoteEvent),
    // Events that involve receiving a message.
    ReceiveProposal(ReceiveProposalEvent),
    ReceiveVote(ReceiveVoteEvent),
    ReceiveTimeoutVote(ReceiveTimeoutVoteEvent),
    ReceiveCertificateSync(ReceiveCertificateSyncEvent),
    // View progression.
    StartView(StartViewEvent),
    ViewTimeout(ViewTimeoutEvent),
    CollectQC(CollectQCEvent),
    CollectTC(CollectTCEvent),
    // Rejections and failures.
    RejectInput(RejectInputEvent),
    SafetyViolation(SafetyViolationEvent),
    Halt(HaltEvent),
}

impl Event {
    /// Send the event to the event bus, if there is one. Events are dropped once the event bus has
    /// shut down.
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A block was inserted into the block tree.
pub struct InsertBlockEvent {
    pub timestamp: SystemTime,
    pub block: Block,
}

/// A block became final. Emitted once per block, oldest first.
pub struct FinalizeBlockEvent {
    pub timestamp: SystemTime,
    pub block: CryptoHash,
    pub height: BlockHeight,
    pub view: ViewNumber,
}

/// A block that conflicts with a finalized block was removed from the block tree.
pub struct PruneBlockEvent {
    pub timestamp: SystemTime,
    pub block: CryptoHash,
}

pub struct UpdateHighestQCEvent {
    pub timestamp: SystemTime,
    pub highest_qc: QuorumCertificate,
}

pub struct UpdateLockedQCEvent {
    pub timestamp: SystemTime,
    pub locked_qc: QuorumCertificate,
}

pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub proposal: Proposal,
}

pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub vote: Vote,
}

pub struct TimeoutVoteEvent {
    pub timestamp: SystemTime,
    pub timeout_vote: TimeoutVote,
}

pub struct ReceiveProposalEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub proposal: Proposal,
}

pub struct ReceiveVoteEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub vote: Vote,
}

pub struct ReceiveTimeoutVoteEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub timeout_vote: TimeoutVote,
}

pub struct ReceiveCertificateSyncEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub certificate: ProgressCertificate,
}

pub struct StartViewEvent {
    pub timestamp: SystemTime,
    pub leader: VerifyingKey,
    pub view: ViewNumber,
}

pub struct ViewTimeoutEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub timeout: Duration,
}

pub struct CollectQCEvent {
    pub timestamp: SystemTime,
    pub quorum_certificate: QuorumCertificate,
}

pub struct CollectTCEvent {
    pub timestamp: SystemTime,
    pub timeout_certificate: TimeoutCertificate,
}

/// An input was dropped without changing any state.
pub struct RejectInputEvent {
    pub timestamp: SystemTime,
    pub origin: Option<VerifyingKey>,
    pub reason: MalformedInput,
}

/// A peer produced evidence of misbehavior. Meant for alerting.
pub struct SafetyViolationEvent {
    pub timestamp: SystemTime,
    pub origin: Option<VerifyingKey>,
    pub violation: SafetyViolation,
}

/// The replica stopped participating in consensus after a local failure.
pub struct HaltEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub reason: String,
}
