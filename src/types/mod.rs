/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of the consensus core.
//!
//! Other types and traits, specific to single components, can be found in the "types" submodules
//! of their components, e.g., [`crate::hotstuff::types`].

pub mod block;

pub mod collectors;

pub mod crypto_primitives;

pub mod data_types;

pub mod signed_messages;

pub mod validator_set;
