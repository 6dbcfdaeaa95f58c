/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The safety and liveness core of a HotStuff-family Byzantine Fault Tolerant consensus protocol.
//!
//! A set of validators with known public keys and voting powers agree on a single growing chain of
//! blocks, tolerating up to one third of the total voting power being arbitrarily faulty. This crate
//! offers:
//! 1. A [block tree](block_tree) that stores every fork the replica has seen and finalizes blocks
//!    under a configurable commit rule,
//! 2. Pure [safety rules](safety) backed by durable [safety data](safety::safety_data::SafetyData),
//! 3. [Vote aggregation](hotstuff::vote_aggregator) into quorum certificates,
//! 4. A [pacemaker] with capped exponential view timeouts, timeout votes, and timeout certificates,
//! 5. An [event handler](event_handler) that composes all of the above, and
//! 6. A [replica](replica) builder that runs the event handler on its own thread, fed by pluggable
//!    [networking], a [crypto gateway](crypto), and the [application contracts](app).
//!
//! Consensus state is owned by exactly one thread. Vote signatures are checked by a bounded pool of
//! worker threads before they reach it.

pub mod app;

pub mod block_tree;

pub mod crypto;

pub mod event_handler;

pub mod events;

pub mod hotstuff;

pub mod networking;

pub mod pacemaker;

pub mod replica;

pub mod safety;

pub mod types;

pub(crate) mod algorithm;

pub(crate) mod event_bus;

pub(crate) mod logging;

pub(crate) mod verification;
