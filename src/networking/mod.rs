/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer (P2P) networking.
//!
//! The core makes no assumption about delivery: messages may be duplicated, delayed, reordered, or
//! lost. The [`Network`](network::Network) implementation only has to move [`Message`]s between
//! replicas without blocking.
//!
//! [`Message`]: messages::Message

pub mod network;

pub mod messages;

pub(crate) mod receiving;

pub(crate) mod sending;
