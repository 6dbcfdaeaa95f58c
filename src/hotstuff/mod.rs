/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The voting round of a view: the leader's [proposal](messages::Proposal), replicas'
//! [votes](messages::Vote), and their aggregation into [quorum certificates](types::QuorumCertificate).
//!
//! A replica that receives a proposal for its current view votes for it if the
//! [safety rules](crate::safety::rules) allow, and sends the vote to the leader of the *next* view.
//! That leader feeds the votes into its [`VoteAggregator`](vote_aggregator::VoteAggregator); once a
//! quorum has voted for the same block, the resulting QC becomes the `justify` of its own proposal.

pub mod messages;

pub mod types;

pub mod vote_aggregator;
