/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! View synchronization and leader selection.
//!
//! ## Views and deadlines
//!
//! The [`Pacemaker`](implementation::Pacemaker) is always in exactly one view, together with a
//! deadline for it. A replica leaves view `v` in one of two ways:
//! 1. It sees a [`QuorumCertificate`](crate::hotstuff::types::QuorumCertificate) for a view `>= v`,
//!    which proves that progress was made. The replica moves to the view after the QC and the next
//!    deadline is one base timeout away.
//! 2. It sees a [`TimeoutCertificate`](types::TimeoutCertificate) for a view `>= v`, which proves that
//!    a quorum gave up. The replica moves to the view after the TC, and the next deadline is further
//!    away than the last one (exponential backoff, up to a cap).
//!
//! When the deadline passes without either, the replica broadcasts a
//! [`TimeoutVote`](messages::TimeoutVote) for its current view, carrying the highest QC it knows.
//! Timeout votes from a quorum form a TC. The TC carries the highest QC among its votes, which the
//! next leader extends.
//!
//! ## Leader selection
//!
//! The leader of each view is chosen with the Interleaved Weighted Round Robin algorithm
//! ([`select_leader`](implementation::select_leader)): over a stretch of `total_power` consecutive
//! views, every validator leads exactly `power` of them, and leaders are interleaved rather than
//! grouped.

pub mod implementation;

pub mod messages;

pub mod types;
