/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The in-memory tree of non-finalized blocks, rooted at the last finalized block.
//!
//! Main type: [`BlockTree`].

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::{self, Display, Formatter},
};

use crate::{
    hotstuff::types::QuorumCertificate,
    types::{
        block::Block,
        data_types::{BlockHeight, ChainID, CryptoHash, ViewNumber},
    },
};

use super::invariants::{self, CommitRule};

/// Upper bound on the number of QCs waiting for their blocks.
const MAX_BUFFERED_QCS: usize = 256;

/// A forest of blocks keyed by hash, pruned down to the descendants of the last finalized block.
///
/// Every block in the tree except the root was inserted through [`add_block`](Self::add_block), and
/// so satisfies, relative to its parent `p`:
/// - `block.justify.block == p.hash` and `block.justify.view == p.view`,
/// - `block.view > p.view`,
/// - `block.height == p.height + 1`.
pub struct BlockTree {
    blocks: HashMap<CryptoHash, Block>,
    children: HashMap<CryptoHash, Vec<CryptoHash>>,
    blocks_at_view: BTreeMap<ViewNumber, Vec<CryptoHash>>,
    root: Block,
    buffered_qcs: HashMap<CryptoHash, QuorumCertificate>,
    commit_rule: CommitRule,
}

/// What [`BlockTree::add_block`] did with an acceptable block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddBlockOutcome {
    Accepted(InsertedBlock),

    /// The block is already in the tree. Nothing changed.
    AlreadyKnown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InsertedBlock {
    pub hash: CryptoHash,

    /// A different block already in the tree with the same view. Two blocks in one view can only come
    /// from an equivocating leader.
    pub equivocates_with: Option<CryptoHash>,
}

/// Reasons a block is refused by [`BlockTree::add_block`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockRejection {
    /// `block.hash` is not the hash of the block's contents.
    IncorrectHash,

    WrongChain { expected: ChainID, found: ChainID },

    /// The block certified by `block.justify` is not in the tree, either because it has not arrived
    /// yet or because it was pruned.
    UnknownParent { parent: CryptoHash },

    /// `block.justify.view` differs from the parent's view.
    QcViewMismatch { parent_view: ViewNumber, qc_view: ViewNumber },

    NonIncreasingView { parent_view: ViewNumber, view: ViewNumber },

    BadHeight { expected: BlockHeight, found: BlockHeight },
}

impl Display for BlockRejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BlockRejection::IncorrectHash => write!(f, "block hash does not match its contents"),
            BlockRejection::WrongChain { expected, found } => {
                write!(f, "block is for chain {}, expected chain {}", found, expected)
            }
            BlockRejection::UnknownParent { .. } => write!(f, "parent block is unknown"),
            BlockRejection::QcViewMismatch { parent_view, qc_view } => write!(
                f,
                "justify has view {} but parent has view {}",
                qc_view, parent_view
            ),
            BlockRejection::NonIncreasingView { parent_view, view } => write!(
                f,
                "block view {} is not greater than parent view {}",
                view, parent_view
            ),
            BlockRejection::BadHeight { expected, found } => {
                write!(f, "block height {} should be {}", found, expected)
            }
        }
    }
}

/// Blocks finalized by a single call to [`BlockTree::try_finalize`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finalized {
    /// Newly finalized blocks, oldest first. The last one is the new root.
    pub blocks: Vec<Block>,

    /// Hashes of the blocks that were removed because they conflict with the newly finalized blocks.
    pub pruned: Vec<CryptoHash>,
}

impl BlockTree {
    /// Create a tree containing only `root`, which is taken to be finalized.
    pub fn new(root: Block, commit_rule: CommitRule) -> Self {
        let mut blocks_at_view = BTreeMap::new();
        blocks_at_view.insert(root.view, vec![root.hash]);
        let mut blocks = HashMap::new();
        blocks.insert(root.hash, root.clone());

        Self {
            blocks,
            children: HashMap::new(),
            blocks_at_view,
            root,
            buffered_qcs: HashMap::new(),
            commit_rule,
        }
    }

    /// Insert `block` as a child of the block its `justify` certifies.
    pub fn add_block(&mut self, block: Block) -> Result<AddBlockOutcome, BlockRejection> {
        if !block.is_correct() {
            return Err(BlockRejection::IncorrectHash);
        }
        let chain_id = self.root().chain_id;
        if block.chain_id != chain_id {
            return Err(BlockRejection::WrongChain {
                expected: chain_id,
                found: block.chain_id,
            });
        }
        if self.contains(&block.hash) {
            return Ok(AddBlockOutcome::AlreadyKnown);
        }

        let parent = self
            .blocks
            .get(&block.justify.block)
            .ok_or(BlockRejection::UnknownParent {
                parent: block.justify.block,
            })?;
        if block.justify.view != parent.view {
            return Err(BlockRejection::QcViewMismatch {
                parent_view: parent.view,
                qc_view: block.justify.view,
            });
        }
        if block.view <= parent.view {
            return Err(BlockRejection::NonIncreasingView {
                parent_view: parent.view,
                view: block.view,
            });
        }
        if block.height != parent.height + 1 {
            return Err(BlockRejection::BadHeight {
                expected: parent.height + 1,
                found: block.height,
            });
        }

        let hash = block.hash;
        let same_view = self.blocks_at_view.entry(block.view).or_default();
        let equivocates_with = same_view.first().copied();
        same_view.push(hash);
        self.children.entry(block.justify.block).or_default().push(hash);
        self.blocks.insert(hash, block);

        Ok(AddBlockOutcome::Accepted(InsertedBlock {
            hash,
            equivocates_with,
        }))
    }

    pub fn contains(&self, hash: &CryptoHash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn get(&self, hash: &CryptoHash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    /// Get the last finalized block.
    pub fn root(&self) -> &Block {
        &self.root
    }

    pub fn commit_rule(&self) -> CommitRule {
        self.commit_rule
    }

    /// Get the number of blocks in the tree, including the root.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Get the hashes of the blocks in the tree that have the given `view`.
    pub fn blocks_at_view(&self, view: ViewNumber) -> &[CryptoHash] {
        self.blocks_at_view
            .get(&view)
            .map(|hashes| hashes.as_slice())
            .unwrap_or(&[])
    }

    /// Check whether `descendant` is, or is reachable by following `justify` links from, a block whose
    /// parent chain passes through `ancestor`. A block extends itself.
    pub fn extends(&self, descendant: &CryptoHash, ancestor: &CryptoHash) -> bool {
        let ancestor_height = match self.blocks.get(ancestor) {
            Some(block) => block.height,
            None => return false,
        };

        let mut cursor = self.blocks.get(descendant);
        while let Some(block) = cursor {
            if block.hash == *ancestor {
                return true;
            }
            if block.height <= ancestor_height {
                return false;
            }
            cursor = self.blocks.get(&block.justify.block);
        }
        false
    }

    /// Check whether voting for `block` respects `locked_qc`. See
    /// [`safe_to_vote`](invariants::safe_to_vote).
    pub fn is_safe_to_vote(&self, block: &Block, locked_qc: &QuorumCertificate) -> bool {
        invariants::safe_to_vote(block, locked_qc, self)
    }

    /// Get the QC that seeing `qc` makes lockable. See [`qc_to_lock`](invariants::qc_to_lock).
    pub fn qc_to_lock(&self, qc: &QuorumCertificate) -> Option<QuorumCertificate> {
        invariants::qc_to_lock(qc, self)
    }

    /// Finalize the block that `qc` completes a commit chain for, along with all of its non-finalized
    /// ancestors, then re-root the tree at it and prune every block that does not descend from it.
    pub fn try_finalize(&mut self, qc: &QuorumCertificate) -> Option<Finalized> {
        let new_root = invariants::block_to_finalize(qc, self)?;

        // Walk down from the new root to the old one, collecting the newly finalized blocks.
        let mut finalized_hashes = Vec::new();
        let mut cursor = new_root;
        while cursor != self.root.hash {
            finalized_hashes.push(cursor);
            cursor = self.blocks.get(&cursor)?.justify.block;
        }
        finalized_hashes.reverse();

        let keep = self.descendants_of(&new_root);
        let finalized_set: HashSet<CryptoHash> = finalized_hashes.iter().copied().collect();
        let removed: Vec<CryptoHash> = self
            .blocks
            .keys()
            .filter(|hash| !keep.contains(*hash))
            .copied()
            .collect();

        let mut finalized_blocks: HashMap<CryptoHash, Block> = HashMap::new();
        let mut pruned = Vec::new();
        for hash in removed {
            if let Some(block) = self.blocks.remove(&hash) {
                self.children.remove(&hash);
                if finalized_set.contains(&hash) {
                    finalized_blocks.insert(hash, block);
                } else if hash != self.root.hash {
                    pruned.push(hash);
                }
            }
        }
        // The new root is kept in the tree, but it is also one of the finalized blocks.
        let root = self.blocks.get(&new_root)?.clone();
        finalized_blocks.insert(new_root, root.clone());

        let root_view = root.view;
        self.root = root;
        for hashes in self.blocks_at_view.values_mut() {
            hashes.retain(|hash| keep.contains(hash));
        }
        self.blocks_at_view.retain(|view, hashes| *view >= root_view && !hashes.is_empty());
        self.buffered_qcs.retain(|_, qc| qc.view > root_view);

        let blocks = finalized_hashes
            .iter()
            .filter_map(|hash| finalized_blocks.remove(hash))
            .collect();
        Some(Finalized { blocks, pruned })
    }

    /// Hold on to `qc`, whose block is not in the tree yet, until the block arrives.
    ///
    /// QCs for views at or below the root's are dropped, since their blocks can never be inserted.
    pub fn buffer_qc(&mut self, qc: QuorumCertificate) {
        if self.contains(&qc.block) || qc.view <= self.root().view {
            return;
        }
        if self.buffered_qcs.len() >= MAX_BUFFERED_QCS && !self.buffered_qcs.contains_key(&qc.block) {
            let lowest = self
                .buffered_qcs
                .iter()
                .min_by_key(|(_, buffered)| buffered.view)
                .map(|(hash, buffered)| (*hash, buffered.view));
            match lowest {
                Some((hash, view)) if view < qc.view => {
                    self.buffered_qcs.remove(&hash);
                }
                _ => return,
            }
        }
        self.buffered_qcs.insert(qc.block, qc);
    }

    /// Take the buffered QC for `block`, if there is one.
    pub fn take_buffered_qc(&mut self, block: &CryptoHash) -> Option<QuorumCertificate> {
        self.buffered_qcs.remove(block)
    }

    pub fn buffered_qcs(&self) -> usize {
        self.buffered_qcs.len()
    }

    fn descendants_of(&self, hash: &CryptoHash) -> HashSet<CryptoHash> {
        let mut descendants = HashSet::new();
        let mut stack = vec![*hash];
        while let Some(hash) = stack.pop() {
            if descendants.insert(hash) {
                if let Some(children) = self.children.get(&hash) {
                    stack.extend(children.iter().copied());
                }
            }
        }
        descendants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::data_types::{SignatureSet, Timestamp};

    const CHAIN: ChainID = ChainID::new(5);

    /// A QC for `block`. The block tree never checks signatures.
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
            Timestamp::new(view),
        )
    }

    fn accept(tree: &mut BlockTree, block: &Block) {
        match tree.add_block(block.clone()) {
            Ok(AddBlockOutcome::Accepted(_)) => (),
            other => panic!("expected block at view {} to be accepted, got {:?}", block.view, other),
        }
    }

    #[test]
    fn add_block_enforces_parent_view_and_height() {
        let genesis = Block::genesis(CHAIN);
        let mut tree = BlockTree::new(genesis.clone(), CommitRule::ThreeChain);

        let b1 = child(&genesis, 1, 1);
        accept(&mut tree, &b1);
        assert_eq!(tree.add_block(b1.clone()), Ok(AddBlockOutcome::AlreadyKnown));

        let orphan_parent = child(&b1, 2, 2);
        let orphan = child(&orphan_parent, 3, 3);
        assert_eq!(
            tree.add_block(orphan),
            Err(BlockRejection::UnknownParent { parent: orphan_parent.hash })
        );

        let stale = child(&b1, 1, 4);
        assert!(matches!(tree.add_block(stale), Err(BlockRejection::NonIncreasingView { .. })));

        let mut tall = child(&b1, 2, 5);
        tall.height = BlockHeight::new(7);
        tall.hash = Block::hash(tall.view, &tall.justify, &tall.payload_hash, tall.height, tall.chain_id);
        assert!(matches!(tree.add_block(tall), Err(BlockRejection::BadHeight { .. })));

        let mut lying_qc = child(&b1, 2, 6);
        lying_qc.justify.view = ViewNumber::new(0);
        lying_qc.hash = Block::hash(
            lying_qc.view,
            &lying_qc.justify,
            &lying_qc.payload_hash,
            lying_qc.height,
            lying_qc.chain_id,
        );
        assert!(matches!(tree.add_block(lying_qc), Err(BlockRejection::QcViewMismatch { .. })));

        let mut tampered = child(&b1, 2, 7);
        tampered.payload_hash = CryptoHash::new([8; 32]);
        assert_eq!(tree.add_block(tampered), Err(BlockRejection::IncorrectHash));

        let foreign = Block::new(
            ViewNumber::new(2),
            qc_for(&b1),
            CryptoHash::new([9; 32]),
            BlockHeight::new(2),
            ChainID::new(6),
            Timestamp::new(0),
        );
        assert!(matches!(tree.add_block(foreign), Err(BlockRejection::WrongChain { .. })));

        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn second_block_in_a_view_is_reported() {
        let genesis = Block::genesis(CHAIN);
        let mut tree = BlockTree::new(genesis.clone(), CommitRule::ThreeChain);

        let first = child(&genesis, 1, 1);
        let second = child(&genesis, 1, 2);
        accept(&mut tree, &first);
        match tree.add_block(second) {
            Ok(AddBlockOutcome::Accepted(inserted)) => {
                assert_eq!(inserted.equivocates_with, Some(first.hash))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tree.blocks_at_view(ViewNumber::new(1)).len(), 2);
    }

    #[test]
    fn three_consecutive_qcs_finalize_the_first_block() {
        let genesis = Block::genesis(CHAIN);
        let mut tree = BlockTree::new(genesis.clone(), CommitRule::ThreeChain);

        let b1 = child(&genesis, 1, 1);
        let b2 = child(&b1, 2, 2);
        let b3 = child(&b2, 3, 3);
        for block in [&b1, &b2, &b3] {
            accept(&mut tree, block);
        }

        assert!(tree.try_finalize(&qc_for(&b1)).is_none());
        assert!(tree.try_finalize(&qc_for(&b2)).is_none());

        let finalized = tree.try_finalize(&qc_for(&b3)).unwrap();
        assert_eq!(finalized.blocks, vec![b1.clone()]);
        assert_eq!(tree.root().hash, b1.hash);
        assert!(!tree.contains(&genesis.hash));

        // Seeing the same QC again finalizes nothing new.
        assert!(tree.try_finalize(&qc_for(&b3)).is_none());
    }

    #[test]
    fn non_consecutive_views_do_not_finalize_until_a_consecutive_chain_appears() {
        let genesis = Block::genesis(CHAIN);
        let mut tree = BlockTree::new(genesis.clone(), CommitRule::ThreeChain);

        // Views 1, 2, 4: the gap at view 3 breaks the chain.
        let b1 = child(&genesis, 1, 1);
        let b2 = child(&b1, 2, 2);
        let b4 = child(&b2, 4, 4);
        let b5 = child(&b4, 5, 5);
        let b6 = child(&b5, 6, 6);
        for block in [&b1, &b2, &b4, &b5, &b6] {
            accept(&mut tree, block);
        }

        assert!(tree.try_finalize(&qc_for(&b4)).is_none());
        assert!(tree.try_finalize(&qc_for(&b5)).is_none());

        // qc6 <- qc5 <- qc4 finalizes b4 and, with it, its non-finalized ancestors b1 and b2.
        let finalized = tree.try_finalize(&qc_for(&b6)).unwrap();
        let hashes: Vec<CryptoHash> = finalized.blocks.iter().map(|b| b.hash).collect();
        assert_eq!(hashes, vec![b1.hash, b2.hash, b4.hash]);
    }

    #[test]
    fn two_chain_rule_finalizes_one_qc_earlier() {
        let genesis = Block::genesis(CHAIN);
        let mut tree = BlockTree::new(genesis.clone(), CommitRule::TwoChain);

        let b1 = child(&genesis, 1, 1);
        let b2 = child(&b1, 2, 2);
        accept(&mut tree, &b1);
        accept(&mut tree, &b2);

        assert_eq!(tree.qc_to_lock(&qc_for(&b2)), Some(qc_for(&b2)));
        let finalized = tree.try_finalize(&qc_for(&b2)).unwrap();
        assert_eq!(finalized.blocks, vec![b1]);
    }

    #[test]
    fn finalizing_at_height_ten_prunes_siblings() {
        let genesis = Block::genesis(CHAIN);
        let mut tree = BlockTree::new(genesis.clone(), CommitRule::ThreeChain);

        let mut chain = vec![genesis.clone()];
        for view in 1..=12 {
            let block = child(chain.last().unwrap(), view, view as u8);
            accept(&mut tree, &block);
            chain.push(block);
        }

        // A fork off height 8 and one off height 9.
        let fork_a = child(&chain[8], 20, 100);
        let fork_b = child(&chain[9], 21, 101);
        accept(&mut tree, &fork_a);
        accept(&mut tree, &fork_b);

        // qc12 <- qc11 <- qc10 finalizes the block at height 10.
        let finalized = tree.try_finalize(&qc_for(&chain[12])).unwrap();
        assert_eq!(finalized.blocks.len(), 10);
        assert_eq!(tree.root().height, BlockHeight::new(10));
        assert!(finalized.pruned.contains(&fork_a.hash));
        assert!(finalized.pruned.contains(&fork_b.hash));
        assert_eq!(tree.len(), 3);

        for pruned_parent in [&fork_a, &fork_b, &chain[9]] {
            let late = child(pruned_parent, 30, 102);
            assert_eq!(
                tree.add_block(late),
                Err(BlockRejection::UnknownParent { parent: pruned_parent.hash })
            );
        }
    }

    #[test]
    fn higher_qc_overrides_a_conflicting_lock() {
        let genesis = Block::genesis(CHAIN);
        let mut tree = BlockTree::new(genesis.clone(), CommitRule::ThreeChain);

        // Branch A locks at view 5.
        let a1 = child(&genesis, 1, 1);
        let a5 = child(&a1, 5, 5);
        accept(&mut tree, &a1);
        accept(&mut tree, &a5);
        let locked_qc = qc_for(&a5);

        // Branch B gets a QC at view 9 without passing through a5.
        let b8 = child(&a1, 8, 8);
        let b9 = child(&b8, 9, 9);
        accept(&mut tree, &b8);
        accept(&mut tree, &b9);

        let on_branch_b = child(&b9, 10, 10);
        assert!(tree.is_safe_to_vote(&on_branch_b, &locked_qc));

        // A conflicting block whose QC is not newer than the lock is refused.
        let stale_conflict = child(&a1, 6, 6);
        assert!(!tree.is_safe_to_vote(&stale_conflict, &locked_qc));

        // Extending the locked block is always fine.
        let on_branch_a = child(&a5, 7, 7);
        assert!(tree.is_safe_to_vote(&on_branch_a, &locked_qc));
    }

    #[test]
    fn buffered_qcs_wait_for_their_blocks() {
        let genesis = Block::genesis(CHAIN);
        let mut tree = BlockTree::new(genesis.clone(), CommitRule::ThreeChain);

        let b1 = child(&genesis, 1, 1);
        tree.buffer_qc(qc_for(&b1));
        assert_eq!(tree.buffered_qcs(), 1);

        accept(&mut tree, &b1);
        assert_eq!(tree.take_buffered_qc(&b1.hash), Some(qc_for(&b1)));
        assert_eq!(tree.take_buffered_qc(&b1.hash), None);

        // QCs for blocks already known are not buffered.
        tree.buffer_qc(qc_for(&b1));
        assert_eq!(tree.buffered_qcs(), 0);
    }
}
