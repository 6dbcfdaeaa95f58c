/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Block Tree: the set of known, non-finalized blocks and their ancestry, together with the
//! locking and finalization rules evaluated against it.
//!
//! [`BlockTree`](forks::BlockTree) is owned by the
//! [`ConsensusState`](crate::event_handler::ConsensusState) and is only ever mutated from the event
//! handler's processing step. It never evaluates safety or finalization against a block it does not
//! know: QCs for blocks that have not arrived yet are
//! [buffered](forks::BlockTree::buffer_qc) until they do.

pub mod forks;

pub mod invariants;
