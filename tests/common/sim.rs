/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A deterministic, single-threaded cluster of replicas.
//!
//! Every replica's [`ConsensusState`] and [`EventHandler`] are driven directly by the test. Messages
//! sent over the [`SimNetwork`] land on a shared wire, and the test decides when (and in which order)
//! each is delivered. Time is virtual: the clock only moves when the test asks it to, and then it
//! jumps straight to the earliest pacemaker deadline.

use std::{
    collections::VecDeque,
    sync::{
        mpsc::{self, Receiver},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use ed25519_dalek::{SigningKey, VerifyingKey};
use hotstuff_core::{
    app::{FinalizationSink, PayloadSource},
    block_tree::invariants::CommitRule,
    crypto::{Ed25519Gateway, SigningAlgorithm},
    event_handler::{ConsensusState, EventHandler, Input},
    events::Event,
    networking::{messages::Message, network::Network},
    pacemaker::implementation::{select_leader, PacemakerConfiguration},
    safety::{
        pluggables::{KVPersister, Persister},
        safety_data::SafetyData,
    },
    types::{
        block::Block,
        data_types::{ChainID, CryptoHash, Power, ViewNumber},
        validator_set::ValidatorSet,
    },
};

use super::mem_db::MemDB;

pub(crate) const CHAIN_ID: ChainID = ChainID::new(0);

#[derive(Clone, Debug)]
pub(crate) struct Envelope {
    pub(crate) from: VerifyingKey,
    pub(crate) to: VerifyingKey,
    pub(crate) message: Message,
}

type Wire = Arc<Mutex<VecDeque<Envelope>>>;

/// A [`Network`] that appends every outgoing message to the shared wire.
#[derive(Clone)]
pub(crate) struct SimNetwork {
    me: VerifyingKey,
    peers: Vec<VerifyingKey>,
    wire: Wire,
}

impl Network for SimNetwork {
    fn init_validator_set(&mut self, _: ValidatorSet) {}

    fn broadcast(&mut self, message: Message) {
        let mut wire = self.wire.lock().unwrap();
        for peer in self.peers.iter().filter(|peer| **peer != self.me) {
            wire.push_back(Envelope {
                from: self.me,
                to: *peer,
                message: message.clone(),
            });
        }
    }

    fn send(&mut self, peer: VerifyingKey, message: Message) {
        self.wire.lock().unwrap().push_back(Envelope {
            from: self.me,
            to: peer,
            message,
        });
    }

    fn recv(&mut self) -> Option<(VerifyingKey, Message)> {
        None
    }
}

/// Fills every block with a distinct payload hash.
pub(crate) struct CountingPayloads {
    next: u64,
}

impl PayloadSource for CountingPayloads {
    fn build_payload(&mut self, _parent: &Block) -> CryptoHash {
        self.next += 1;
        payload(self.next)
    }
}

pub(crate) fn payload(n: u64) -> CryptoHash {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&n.to_le_bytes());
    CryptoHash::new(bytes)
}

/// Remembers every block it is told about.
pub(crate) struct RecordingSink {
    finalized: Arc<Mutex<Vec<Block>>>,
}

impl FinalizationSink for RecordingSink {
    fn on_finalized(&mut self, block: &Block) {
        self.finalized.lock().unwrap().push(block.clone())
    }
}

pub(crate) type SimHandler =
    EventHandler<SimNetwork, Ed25519Gateway, KVPersister<MemDB>, CountingPayloads, RecordingSink>;

pub(crate) struct SimReplica {
    pub(crate) key: VerifyingKey,
    pub(crate) state: ConsensusState,
    pub(crate) handler: SimHandler,
    pub(crate) db: MemDB,
    signing_key: SigningKey,
    finalized: Arc<Mutex<Vec<Block>>>,
    event_subscriber: Receiver<Event>,
    events: Vec<Event>,
}

impl SimReplica {
    fn handle(&mut self, input: Input, now: Instant) {
        let _ = self.handler.handle(&mut self.state, input, now);
        self.settle(now);
    }

    /// Let the replica process its own proposals until it has none left.
    fn settle(&mut self, now: Instant) {
        while self.handler.has_deferred() {
            if self.handler.resume(&mut self.state, now).is_err() {
                return;
            }
        }
    }

    /// Every block this replica finalized, in the order the sink was told about them.
    pub(crate) fn finalized(&self) -> Vec<Block> {
        self.finalized.lock().unwrap().clone()
    }

    /// Every event this replica published so far.
    pub(crate) fn events(&mut self) -> &[Event] {
        self.events.extend(self.event_subscriber.try_iter());
        &self.events
    }
}

pub(crate) struct Sim {
    pub(crate) replicas: Vec<SimReplica>,
    pub(crate) validator_set: ValidatorSet,
    pub(crate) genesis: Block,
    pacemaker_config: PacemakerConfiguration,
    wire: Wire,
    epoch: Instant,
    elapsed: Duration,
}

impl Sim {
    /// Create `n` replicas with equal power. Replica `i` signs with the key seeded by `i + 1`.
    pub(crate) fn new(n: u8, pacemaker_config: PacemakerConfiguration) -> Sim {
        let signing_keys: Vec<SigningKey> =
            (1..=n).map(|seed| SigningKey::from_bytes(&[seed; 32])).collect();
        let validator_set: ValidatorSet = signing_keys
            .iter()
            .map(|key| (key.verifying_key(), Power::new(1)))
            .collect();
        let genesis = Block::genesis(CHAIN_ID);

        let mut sim = Sim {
            replicas: Vec::new(),
            validator_set,
            genesis,
            pacemaker_config,
            wire: Arc::new(Mutex::new(VecDeque::new())),
            epoch: Instant::now(),
            elapsed: Duration::ZERO,
        };
        for signing_key in signing_keys {
            let safety_data = SafetyData::new(&sim.genesis);
            let replica = sim.build_replica(signing_key, MemDB::new(), safety_data);
            sim.replicas.push(replica);
        }
        sim
    }

    fn build_replica(&self, signing_key: SigningKey, db: MemDB, safety_data: SafetyData) -> SimReplica {
        let key = signing_key.verifying_key();
        let finalized = Arc::new(Mutex::new(Vec::new()));
        let (event_publisher, event_subscriber) = mpsc::channel();
        let state = ConsensusState::new(
            self.genesis.clone(),
            safety_data,
            self.validator_set.clone(),
            self.pacemaker_config,
            CommitRule::ThreeChain,
            self.now(),
        )
        .unwrap();
        let handler = EventHandler::new(
            Ed25519Gateway::new(signing_key.clone(), SigningAlgorithm::Ed25519),
            SimNetwork {
                me: key,
                peers: self.validator_set.validators().copied().collect(),
                wire: self.wire.clone(),
            },
            KVPersister::new(db.clone()),
            CountingPayloads { next: 0 },
            RecordingSink {
                finalized: finalized.clone(),
            },
            Some(event_publisher),
        );
        SimReplica {
            key,
            state,
            handler,
            db,
            signing_key,
            finalized,
            event_subscriber,
            events: Vec::new(),
        }
    }

    /// Replace replica `index` with a fresh process that keeps only what its store holds, and start
    /// it.
    pub(crate) fn restart(&mut self, index: usize) {
        let db = self.replicas[index].db.clone();
        let safety_data = KVPersister::new(db.clone())
            .load_safety_data()
            .unwrap()
            .unwrap_or_else(|| SafetyData::new(&self.genesis));
        let signing_key = self.replicas[index].signing_key.clone();
        let now = self.now();

        let mut replica = self.build_replica(signing_key, db, safety_data);
        let _ = replica.handler.start(&mut replica.state, now);
        replica.settle(now);
        self.replicas[index] = replica;
    }

    /// A gateway that signs as replica `index`.
    pub(crate) fn gateway(&self, index: usize) -> Ed25519Gateway {
        Ed25519Gateway::new(self.replicas[index].signing_key.clone(), SigningAlgorithm::Ed25519)
    }

    pub(crate) fn now(&self) -> Instant {
        self.epoch + self.elapsed
    }

    /// Enter the first view on every replica.
    pub(crate) fn start(&mut self) {
        let now = self.now();
        for replica in self.replicas.iter_mut() {
            let _ = replica.handler.start(&mut replica.state, now);
            replica.settle(now);
        }
    }

    pub(crate) fn leader(&self, view: u64) -> VerifyingKey {
        select_leader(ViewNumber::new(view), &self.validator_set)
    }

    pub(crate) fn index_of(&self, key: &VerifyingKey) -> usize {
        self.replicas
            .iter()
            .position(|replica| replica.key == *key)
            .unwrap()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.wire.lock().unwrap().len()
    }

    /// Take the message at `position` off the wire without delivering it.
    pub(crate) fn take(&mut self, position: usize) -> Option<Envelope> {
        self.wire.lock().unwrap().remove(position)
    }

    /// Take every message on the wire that `filter` selects, leaving the rest in order.
    pub(crate) fn take_where(&mut self, filter: impl Fn(&Envelope) -> bool) -> Vec<Envelope> {
        let mut wire = self.wire.lock().unwrap();
        let (taken, kept): (Vec<Envelope>, Vec<Envelope>) = wire.drain(..).partition(|envelope| filter(envelope));
        wire.extend(kept);
        taken
    }

    /// Hand `envelope` to its addressee.
    pub(crate) fn deliver(&mut self, envelope: Envelope) {
        let now = self.now();
        let index = self.index_of(&envelope.to);
        self.replicas[index].handle(Input::from_message(envelope.from, envelope.message), now);
    }

    /// Deliver the message at `position`. Returns `false` if there is none.
    pub(crate) fn deliver_at(&mut self, position: usize) -> bool {
        match self.take(position) {
            Some(envelope) => {
                self.deliver(envelope);
                true
            }
            None => false,
        }
    }

    /// Move the clock to the earliest deadline among the running replicas, and fire the timeouts
    /// of every replica whose deadline has passed.
    pub(crate) fn advance_to_next_deadline(&mut self) {
        let next_deadline = self
            .replicas
            .iter()
            .filter(|replica| !replica.state.is_halted())
            .map(|replica| replica.state.pacemaker().view_info().deadline)
            .min();
        if let Some(deadline) = next_deadline {
            self.elapsed = self.elapsed.max(deadline.saturating_duration_since(self.epoch));
        }

        let now = self.now();
        for replica in self.replicas.iter_mut() {
            if replica.state.pacemaker().is_timed_out(now) {
                replica.handle(Input::TimeoutFired, now);
            }
        }
    }

    /// Deliver messages in the order they were sent, and let the clock run whenever the wire is
    /// empty, until `done` holds or `max_steps` steps were taken. Returns whether `done` held.
    pub(crate) fn run_until(&mut self, max_steps: usize, done: impl Fn(&Sim) -> bool) -> bool {
        for _ in 0..max_steps {
            if done(self) {
                return true;
            }
            if !self.deliver_at(0) {
                self.advance_to_next_deadline();
            }
        }
        done(self)
    }
}
