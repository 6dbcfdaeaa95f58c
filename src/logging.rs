/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the replica's
//! [configuration](crate::replica::Configuration).
//!
//! The crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceiveProposal](crate::events::ReceiveProposalEvent) is printed:
//!
//! ```text
//! ReceiveProposal, 1701329264, Id5u7f6, fNGCJyk, 4, 7
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the public key of the
//!   origin of the proposal.
//! - The fourth value is the first seven characters of the Base64 encoding of the hash of the proposed
//!   block.
//! - The fifth value is the height of the proposed block, and the sixth its view.
//!
//! Rejections, safety violations and halts are additionally logged at the `warn` and `error` levels.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;

use crate::{events::*, pacemaker::messages::ProgressCertificate};

// Names of each event in PascalCase for printing:
pub const INSERT_BLOCK: &str = "InsertBlock";
pub const FINALIZE_BLOCK: &str = "FinalizeBlock";
pub const PRUNE_BLOCK: &str = "PruneBlock";
pub const UPDATE_HIGHEST_QC: &str = "UpdateHighestQC";
pub const UPDATE_LOCKED_QC: &str = "UpdateLockedQC";

pub const PROPOSE: &str = "Propose";
pub const VOTE: &str = "Vote";
pub const TIMEOUT_VOTE: &str = "TimeoutVote";

pub const RECEIVE_PROPOSAL: &str = "ReceiveProposal";
pub const RECEIVE_VOTE: &str = "ReceiveVote";
pub const RECEIVE_TIMEOUT_VOTE: &str = "ReceiveTimeoutVote";
pub const RECEIVE_CERTIFICATE_SYNC: &str = "ReceiveCertificateSync";

pub const START_VIEW: &str = "StartView";
pub const VIEW_TIMEOUT: &str = "ViewTimeout";
pub const COLLECT_QC: &str = "CollectQC";
pub const COLLECT_TC: &str = "CollectTC";

pub const REJECT_INPUT: &str = "RejectInput";
pub const SAFETY_VIOLATION: &str = "SafetyViolation";
pub const HALT: &str = "Halt";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for InsertBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |insert_block_event: &InsertBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                INSERT_BLOCK,
                secs_since_unix_epoch(insert_block_event.timestamp),
                first_seven_base64_chars(&insert_block_event.block.hash.bytes()),
                insert_block_event.block.height,
                insert_block_event.block.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for FinalizeBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |finalize_block_event: &FinalizeBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                FINALIZE_BLOCK,
                secs_since_unix_epoch(finalize_block_event.timestamp),
                first_seven_base64_chars(&finalize_block_event.block.bytes()),
                finalize_block_event.height,
                finalize_block_event.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for PruneBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |prune_block_event: &PruneBlockEvent| {
            log::info!(
                "{}, {}, {}",
                PRUNE_BLOCK,
                secs_since_unix_epoch(prune_block_event.timestamp),
                first_seven_base64_chars(&prune_block_event.block.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for UpdateHighestQCEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |update_highest_qc_event: &UpdateHighestQCEvent| {
            log::info!(
                "{}, {}, {}, {}",
                UPDATE_HIGHEST_QC,
                secs_since_unix_epoch(update_highest_qc_event.timestamp),
                first_seven_base64_chars(&update_highest_qc_event.highest_qc.block.bytes()),
                update_highest_qc_event.highest_qc.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for UpdateLockedQCEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |update_locked_qc_event: &UpdateLockedQCEvent| {
            log::info!(
                "{}, {}, {}, {}",
                UPDATE_LOCKED_QC,
                secs_since_unix_epoch(update_locked_qc_event.timestamp),
                first_seven_base64_chars(&update_locked_qc_event.locked_qc.block.bytes()),
                update_locked_qc_event.locked_qc.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(propose_event.timestamp),
                first_seven_base64_chars(&propose_event.proposal.block.hash.bytes()),
                propose_event.proposal.block.height,
                propose_event.proposal.block.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for VoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |vote_event: &VoteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                VOTE,
                secs_since_unix_epoch(vote_event.timestamp),
                first_seven_base64_chars(&vote_event.vote.block.bytes()),
                vote_event.vote.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for TimeoutVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |timeout_vote_event: &TimeoutVoteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                TIMEOUT_VOTE,
                secs_since_unix_epoch(timeout_vote_event.timestamp),
                timeout_vote_event.timeout_vote.view,
                timeout_vote_event.timeout_vote.highest_qc.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_proposal_event: &ReceiveProposalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PROPOSAL,
                secs_since_unix_epoch(receive_proposal_event.timestamp),
                first_seven_base64_chars(&receive_proposal_event.origin.to_bytes()),
                first_seven_base64_chars(&receive_proposal_event.proposal.block.hash.bytes()),
                receive_proposal_event.proposal.block.height,
                receive_proposal_event.proposal.block.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_vote_event: &ReceiveVoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_VOTE,
                secs_since_unix_epoch(receive_vote_event.timestamp),
                first_seven_base64_chars(&receive_vote_event.origin.to_bytes()),
                first_seven_base64_chars(&receive_vote_event.vote.block.bytes()),
                receive_vote_event.vote.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveTimeoutVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_timeout_vote_event: &ReceiveTimeoutVoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_TIMEOUT_VOTE,
                secs_since_unix_epoch(receive_timeout_vote_event.timestamp),
                first_seven_base64_chars(&receive_timeout_vote_event.origin.to_bytes()),
                receive_timeout_vote_event.timeout_vote.view,
                receive_timeout_vote_event.timeout_vote.highest_qc.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveCertificateSyncEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_certificate_sync_event: &ReceiveCertificateSyncEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_CERTIFICATE_SYNC,
                secs_since_unix_epoch(receive_certificate_sync_event.timestamp),
                first_seven_base64_chars(&receive_certificate_sync_event.origin.to_bytes()),
                progress_certificate_info(&receive_certificate_sync_event.certificate)
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_view_event: &StartViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_VIEW,
                secs_since_unix_epoch(start_view_event.timestamp),
                first_seven_base64_chars(&start_view_event.leader.to_bytes()),
                start_view_event.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for ViewTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |view_timeout_event: &ViewTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {:?}",
                VIEW_TIMEOUT,
                secs_since_unix_epoch(view_timeout_event.timestamp),
                view_timeout_event.view,
                view_timeout_event.timeout
            )
        };
        Box::new(logger)
    }
}

impl Logger for CollectQCEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |collect_qc_event: &CollectQCEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COLLECT_QC,
                secs_since_unix_epoch(collect_qc_event.timestamp),
                first_seven_base64_chars(&collect_qc_event.quorum_certificate.block.bytes()),
                collect_qc_event.quorum_certificate.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for CollectTCEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |collect_tc_event: &CollectTCEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COLLECT_TC,
                secs_since_unix_epoch(collect_tc_event.timestamp),
                collect_tc_event.timeout_certificate.view,
                collect_tc_event.timeout_certificate.highest_qc_view()
            )
        };
        Box::new(logger)
    }
}

impl Logger for RejectInputEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reject_input_event: &RejectInputEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                REJECT_INPUT,
                secs_since_unix_epoch(reject_input_event.timestamp),
                origin_info(&reject_input_event.origin),
                reject_input_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for SafetyViolationEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |safety_violation_event: &SafetyViolationEvent| {
            log::error!(
                "{}, {}, {}, {}",
                SAFETY_VIOLATION,
                secs_since_unix_epoch(safety_violation_event.timestamp),
                origin_info(&safety_violation_event.origin),
                safety_violation_event.violation
            )
        };
        Box::new(logger)
    }
}

impl Logger for HaltEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |halt_event: &HaltEvent| {
            log::error!(
                "{}, {}, {}, {}",
                HALT,
                secs_since_unix_epoch(halt_event.timestamp),
                halt_event.view,
                halt_event.reason
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

// Clocks set before the Unix Epoch print as 0.
fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

fn origin_info(origin: &Option<ed25519_dalek::VerifyingKey>) -> String {
    match origin {
        Some(origin) => first_seven_base64_chars(&origin.to_bytes()),
        None => String::from("self"),
    }
}

fn progress_certificate_info(certificate: &ProgressCertificate) -> String {
    match certificate {
        ProgressCertificate::QuorumCertificate(qc) => format!(
            "Quorum Certificate, view: {}, block: {}, no. of signatures: {}",
            qc.view,
            first_seven_base64_chars(&qc.block.bytes()),
            qc.signatures.count()
        ),
        ProgressCertificate::TimeoutCertificate(tc) => format!(
            "Timeout Certificate, view: {}, highest QC view: {}",
            tc.view,
            tc.highest_qc_view()
        ),
    }
}
