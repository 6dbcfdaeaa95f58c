/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Network`] trait.

use ed25519_dalek::VerifyingKey;

use crate::types::validator_set::ValidatorSet;

use super::messages::Message;

pub trait Network: Clone + Send {
    /// Inform the network provider of the validator set on wake-up.
    fn init_validator_set(&mut self, validator_set: ValidatorSet);

    /// Send a message to all peers (including this replica itself, if the provider loops back)
    /// without blocking.
    fn broadcast(&mut self, message: Message);

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: VerifyingKey, message: Message);

    /// Receive a message from any peer. Returns immediately with a `None` if no message is available
    /// now.
    fn recv(&mut self) -> Option<(VerifyingKey, Message)>;
}
