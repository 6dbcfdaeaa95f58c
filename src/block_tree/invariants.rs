/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Rules and predicates that help with maintaining the invariant properties of the Block Tree.
//!
//! The methods in this module fall into two categories:
//! 1. **Whether**: [`safe_to_vote`] checks whether a block may receive this replica's vote, given the
//!    replica's locked QC.
//! 2. **What**: [`qc_to_lock`] and [`block_to_finalize`] decide what state updates seeing a QC should
//!    cause.
//!
//! # Locking
//!
//! Before a block is finalized, its branch must first be locked by a quorum. The locked QC only ever
//! moves to a higher view ([`update_lock`](crate::safety::rules::update_lock) enforces this), and a
//! replica only votes for blocks that satisfy the lock. The check comprises two clauses joined by an
//! "or":
//! 1. **Safety clause**: the block extends `locked_qc.block`, *or*
//! 2. **Liveness clause**: `block.justify.view` is greater than `locked_qc.view`.
//!
//! Without the liveness clause, replicas that locked on a QC that the rest of the network never saw
//! would be stuck forever on an abandoned branch. A QC with a higher view proves that a quorum has
//! moved on, which is enough to release the lock.
//!
//! # Finalizing
//!
//! Under the default [`CommitRule::ThreeChain`], a block is finalized when it heads a chain of three
//! QCs with *consecutive* views: `qc3.view == qc2.view + 1 == qc1.view + 2`, where `qc3` certifies
//! `b3`, `b3.justify == qc2` certifies `b2`, and `b2.justify == qc1` certifies `b1`. `b1` is then
//! finalized, together with all of its not-yet-finalized ancestors.
//!
//! Merely increasing views are not enough. If `qc2` and `qc3` had views 5 and 7, a quorum could have
//! locked on a conflicting block in view 6, so nothing could be said about what a quorum is locked on.
//!
//! [`CommitRule::TwoChain`] finalizes one QC earlier (`b2` on seeing `qc3`, i.e. `qc.block.justify`
//! on seeing `qc`) and correspondingly locks on every QC directly.

use crate::{
    hotstuff::types::QuorumCertificate,
    types::{block::Block, data_types::CryptoHash},
};

use super::forks::BlockTree;

/// The chain of consecutive-view QCs that finalizes a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitRule {
    /// Lock on `qc`, finalize `qc.block.justify.block` when the two QCs have consecutive views.
    TwoChain,

    /// Lock on `qc.block.justify`, finalize `qc.block.justify.block.justify.block` when the three QCs
    /// have consecutive views.
    #[default]
    ThreeChain,
}

/// Check whether voting for `block` respects `locked_qc`.
///
/// # Conditional checks
///
/// `safe_to_vote` returns `true` in case either of the following predicates is `true`:
/// 1. `block.justify.view` is (strictly) greater than `locked_qc.view`.
/// 2. `block` extends from `locked_qc.block`.
///
/// # Precondition
///
/// `block.justify` is a correct QC.
pub(crate) fn safe_to_vote(block: &Block, locked_qc: &QuorumCertificate, block_tree: &BlockTree) -> bool {
    /* 1 */
    block.justify.view > locked_qc.view ||
    /* 2 */ extends_locked_block(block, locked_qc, block_tree)
}

fn extends_locked_block(block: &Block, locked_qc: &QuorumCertificate, block_tree: &BlockTree) -> bool {
    if block.justify.block == locked_qc.block || block_tree.extends(&block.justify.block, &locked_qc.block) {
        return true;
    }

    // A lock at or below the finalized root that is no longer in the tree lies on the finalized prefix,
    // which every block in the tree extends.
    !block_tree.contains(&locked_qc.block)
        && locked_qc.view <= block_tree.root().view
        && block_tree.contains(&block.justify.block)
}

/// Get the QC (if any) that should become the locked QC after the replica sees `qc`, before comparing
/// it against the current lock.
///
/// |`commit_rule`|QC to lock|
/// |---|---|
/// |`TwoChain`|`qc`|
/// |`ThreeChain`|`qc.block.justify`|
///
/// Returns `None` for a genesis QC, or if `qc.block` is not in the tree.
pub(crate) fn qc_to_lock(qc: &QuorumCertificate, block_tree: &BlockTree) -> Option<QuorumCertificate> {
    if qc.is_genesis_qc() {
        return None;
    }

    match block_tree.commit_rule() {
        CommitRule::TwoChain => Some(qc.clone()),
        CommitRule::ThreeChain => block_tree.get(&qc.block).map(|block| block.justify.clone()),
    }
}

/// Get the block in `block_tree` (if any) that, along with all of its non-finalized predecessors,
/// should be finalized after the replica sees `qc`.
///
/// Returns `None` if the QCs leading up to `qc` do not have consecutive views, if any block on the
/// way is unknown, or if the block is already finalized.
pub(crate) fn block_to_finalize(qc: &QuorumCertificate, block_tree: &BlockTree) -> Option<CryptoHash> {
    if qc.is_genesis_qc() {
        return None;
    }

    let head = block_tree.get(&qc.block)?;
    let parent_justify = &head.justify;
    if parent_justify.is_genesis_qc() || qc.view != parent_justify.view + 1 {
        return None;
    }

    let candidate = match block_tree.commit_rule() {
        CommitRule::TwoChain => block_tree.get(&parent_justify.block)?,
        CommitRule::ThreeChain => {
            let parent = block_tree.get(&parent_justify.block)?;
            let grandparent_justify = &parent.justify;
            if grandparent_justify.is_genesis_qc()
                || parent_justify.view != grandparent_justify.view + 1
            {
                return None;
            }
            block_tree.get(&grandparent_justify.block)?
        }
    };

    // Check whether the candidate block has been finalized already.
    if candidate.height > block_tree.root().height {
        Some(candidate.hash)
    } else {
        None
    }
}
