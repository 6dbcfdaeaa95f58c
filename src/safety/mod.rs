/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Safety Rules: the only code that decides whether this replica may vote, and the persistence of the
//! state those decisions depend on.
//!
//! The rules in [`rules`] are pure. They take the current [`SafetyData`](safety_data::SafetyData) and
//! return the updated value; the event handler [persists](pluggables::Persister) it before sending any
//! vote that depends on it. A replica that cannot persist stops voting.

pub mod pluggables;

pub mod rules;

pub mod safety_data;
