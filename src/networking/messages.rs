/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumerations around every message variant exchanged between replicas.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    hotstuff::messages::{HotStuffMessage, Proposal, Vote},
    pacemaker::messages::{PacemakerMessage, TimeoutVote},
    types::data_types::{ChainID, ViewNumber},
};

/// All message variants sent over the [`Network`](super::network::Network).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// See: [`HotStuffMessage`].
    HotStuffMessage(HotStuffMessage),

    /// See: [`PacemakerMessage`].
    PacemakerMessage(PacemakerMessage),
}

impl Message {
    /// Get the `chain_id` field of the inner message.
    pub fn chain_id(&self) -> ChainID {
        match self {
            Message::HotStuffMessage(msg) => msg.chain_id(),
            Message::PacemakerMessage(msg) => msg.chain_id(),
        }
    }

    /// Get the `view` field of the inner message.
    pub fn view(&self) -> ViewNumber {
        match self {
            Message::HotStuffMessage(msg) => msg.view(),
            Message::PacemakerMessage(msg) => msg.view(),
        }
    }
}

impl From<HotStuffMessage> for Message {
    fn from(value: HotStuffMessage) -> Self {
        Message::HotStuffMessage(value)
    }
}

impl From<PacemakerMessage> for Message {
    fn from(value: PacemakerMessage) -> Self {
        Message::PacemakerMessage(value)
    }
}

impl From<Proposal> for Message {
    fn from(value: Proposal) -> Self {
        Message::HotStuffMessage(HotStuffMessage::Proposal(value))
    }
}

impl From<Vote> for Message {
    fn from(value: Vote) -> Self {
        Message::HotStuffMessage(HotStuffMessage::Vote(value))
    }
}

impl From<TimeoutVote> for Message {
    fn from(value: TimeoutVote) -> Self {
        Message::PacemakerMessage(PacemakerMessage::TimeoutVote(value))
    }
}
