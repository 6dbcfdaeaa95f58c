/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pure decision functions over [`SafetyData`].
//!
//! None of these functions mutate anything. Each returns the `SafetyData` that results from taking
//! the action, and the caller persists it before acting.

use crate::{
    block_tree::forks::BlockTree,
    hotstuff::types::QuorumCertificate,
    types::{block::Block, data_types::ViewNumber},
};

use super::safety_data::SafetyData;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteDecision {
    /// Voting is permitted. Persist the contained `SafetyData` before sending the vote.
    Vote(SafetyData),
    Reject(VoteRejection),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteRejection {
    /// This replica already voted in `block.view` or a later view.
    AlreadyVoted { highest_voted_view: ViewNumber },

    NotCurrentView { current_view: ViewNumber, block_view: ViewNumber },

    /// The block has not been inserted into the block tree.
    UnknownBlock,

    /// The block neither extends the locked block nor carries a QC newer than the lock.
    Unsafe { locked_view: ViewNumber, justify_view: ViewNumber },
}

impl VoteRejection {
    /// Whether this rejection is evidence of a misbehaving proposer rather than a late or duplicate
    /// message.
    pub fn is_violation(&self) -> bool {
        matches!(self, VoteRejection::Unsafe { .. })
    }
}

/// Decide whether to vote for `block` in `current_view`.
///
/// # Conditional checks
///
/// Voting is permitted in case all of the following predicates are `true`:
/// 1. `block.view == current_view`.
/// 2. `block.view > safety_data.highest_voted_view`.
/// 3. `block_tree` contains `block`.
/// 4. `block_tree.is_safe_to_vote(block, safety_data.locked_qc)`.
pub fn decide_vote(
    safety_data: &SafetyData,
    block: &Block,
    current_view: ViewNumber,
    block_tree: &BlockTree,
) -> VoteDecision {
    /* 1 */
    if block.view != current_view {
        return VoteDecision::Reject(VoteRejection::NotCurrentView {
            current_view,
            block_view: block.view,
        });
    }

    /* 2 */
    if block.view <= safety_data.highest_voted_view {
        return VoteDecision::Reject(VoteRejection::AlreadyVoted {
            highest_voted_view: safety_data.highest_voted_view,
        });
    }

    /* 3 */
    if !block_tree.contains(&block.hash) {
        return VoteDecision::Reject(VoteRejection::UnknownBlock);
    }

    /* 4 */
    if !block_tree.is_safe_to_vote(block, &safety_data.locked_qc) {
        return VoteDecision::Reject(VoteRejection::Unsafe {
            locked_view: safety_data.locked_qc.view,
            justify_view: block.justify.view,
        });
    }

    VoteDecision::Vote(SafetyData {
        highest_voted_view: block.view,
        ..safety_data.clone()
    })
}

/// Get the `SafetyData` with an updated lock, if seeing `qc` moves the lock to a strictly higher view.
pub fn update_lock(
    safety_data: &SafetyData,
    qc: &QuorumCertificate,
    block_tree: &BlockTree,
) -> Option<SafetyData> {
    let qc_to_lock = block_tree.qc_to_lock(qc)?;
    if qc_to_lock.view > safety_data.locked_qc.view {
        Some(SafetyData {
            locked_qc: qc_to_lock,
            ..safety_data.clone()
        })
    } else {
        None
    }
}

/// Get the `SafetyData` with `qc` as the highest acknowledged QC, if `qc` is higher than the current
/// one.
pub fn acknowledge_qc(safety_data: &SafetyData, qc: &QuorumCertificate) -> Option<SafetyData> {
    if qc.view > safety_data.highest_acknowledged_qc.view {
        Some(SafetyData {
            highest_acknowledged_qc: qc.clone(),
            ..safety_data.clone()
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block_tree::invariants::CommitRule,
        types::data_types::{ChainID, CryptoHash, SignatureSet, Timestamp},
    };

    const CHAIN: ChainID = ChainID::new(9);

    fn qc_for(block: &Block) -> QuorumCertificate {
        if block.is_genesis() {
            return QuorumCertificate::for_genesis(block);
        }
        QuorumCertificate {
            chain_id: CHAIN,
            view: block.view,
            block: block.hash,
            signatures: SignatureSet::new(4),
        }
    }

    fn child(parent: &Block, view: u64, salt: u8) -> Block {
        Block::new(
            ViewNumber::new(view),
            qc_for(parent),
            CryptoHash::new([salt; 32]),
            parent.height + 1,
            CHAIN,
            Timestamp::new(0),
        )
    }

    #[test]
    fn votes_at_most_once_per_view() {
        let genesis = Block::genesis(CHAIN);
        let mut tree = BlockTree::new(genesis.clone(), CommitRule::ThreeChain);
        let safety_data = SafetyData::new(&genesis);

        let first = child(&genesis, 1, 1);
        let second = child(&genesis, 1, 2);
        tree.add_block(first.clone()).unwrap();
        tree.add_block(second.clone()).unwrap();

        let after_first = match decide_vote(&safety_data, &first, ViewNumber::new(1), &tree) {
            VoteDecision::Vote(updated) => updated,
            other => panic!("expected a vote, got {:?}", other),
        };
        assert_eq!(after_first.highest_voted_view, ViewNumber::new(1));

        assert_eq!(
            decide_vote(&after_first, &second, ViewNumber::new(1), &tree),
            VoteDecision::Reject(VoteRejection::AlreadyVoted {
                highest_voted_view: ViewNumber::new(1)
            })
        );
        assert_eq!(
            decide_vote(&after_first, &first, ViewNumber::new(1), &tree),
            VoteDecision::Reject(VoteRejection::AlreadyVoted {
                highest_voted_view: ViewNumber::new(1)
            })
        );
    }

    #[test]
    fn only_known_blocks_of_the_current_view_get_votes() {
        let genesis = Block::genesis(CHAIN);
        let tree = BlockTree::new(genesis.clone(), CommitRule::ThreeChain);
        let safety_data = SafetyData::new(&genesis);

        let b1 = child(&genesis, 1, 1);
        assert!(matches!(
            decide_vote(&safety_data, &b1, ViewNumber::new(2), &tree),
            VoteDecision::Reject(VoteRejection::NotCurrentView { .. })
        ));
        assert_eq!(
            decide_vote(&safety_data, &b1, ViewNumber::new(1), &tree),
            VoteDecision::Reject(VoteRejection::UnknownBlock)
        );
    }

    #[test]
    fn lock_at_view_five_is_overridden_by_qc_at_view_nine() {
        let genesis = Block::genesis(CHAIN);
        let mut tree = BlockTree::new(genesis.clone(), CommitRule::ThreeChain);

        let a1 = child(&genesis, 1, 1);
        let a5 = child(&a1, 5, 5);
        let b8 = child(&a1, 8, 8);
        let b9 = child(&b8, 9, 9);
        for block in [&a1, &a5, &b8, &b9] {
            tree.add_block(block.clone()).unwrap();
        }

        let safety_data = SafetyData {
            highest_voted_view: ViewNumber::new(5),
            locked_qc: qc_for(&a5),
            highest_acknowledged_qc: qc_for(&a5),
        };

        let conflicting_stale = child(&a1, 6, 6);
        tree.add_block(conflicting_stale.clone()).unwrap();
        assert!(matches!(
            decide_vote(&safety_data, &conflicting_stale, ViewNumber::new(6), &tree),
            VoteDecision::Reject(VoteRejection::Unsafe { .. })
        ));

        let b10 = child(&b9, 10, 10);
        tree.add_block(b10.clone()).unwrap();
        assert!(matches!(
            decide_vote(&safety_data, &b10, ViewNumber::new(10), &tree),
            VoteDecision::Vote(_)
        ));
    }

    #[test]
    fn lock_and_highest_qc_only_move_forward() {
        let genesis = Block::genesis(CHAIN);
        let mut tree = BlockTree::new(genesis.clone(), CommitRule::ThreeChain);
        let b1 = child(&genesis, 1, 1);
        let b2 = child(&b1, 2, 2);
        let b3 = child(&b2, 3, 3);
        for block in [&b1, &b2, &b3] {
            tree.add_block(block.clone()).unwrap();
        }

        let safety_data = SafetyData::new(&genesis);

        // Seeing qc2 locks on b2.justify, i.e. qc1.
        let locked = update_lock(&safety_data, &qc_for(&b2), &tree).unwrap();
        assert_eq!(locked.locked_qc, qc_for(&b1));

        // Seeing qc1 afterwards would lock on the genesis QC, which is lower.
        assert!(update_lock(&locked, &qc_for(&b1), &tree).is_none());

        let acknowledged = acknowledge_qc(&locked, &qc_for(&b3)).unwrap();
        assert_eq!(acknowledged.highest_acknowledged_qc, qc_for(&b3));
        assert!(acknowledge_qc(&acknowledged, &qc_for(&b2)).is_none());
    }
}
