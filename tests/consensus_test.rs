/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Scenario tests that drive clusters of replicas through the deterministic simulator in
//! [`common::sim`], with a virtual clock and a test-controlled message order.

mod common;

use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use hotstuff_core::{
    block_tree::forks::BlockRejection,
    event_handler::{EventHandlerError, Input, MalformedInput, SafetyViolation},
    events::{
        Event, FinalizeBlockEvent, RejectInputEvent, SafetyViolationEvent, VoteEvent,
    },
    hotstuff::{
        messages::{HotStuffMessage, Proposal, Vote},
        types::QuorumCertificate,
    },
    networking::messages::Message,
    pacemaker::{implementation::PacemakerConfiguration, messages::TimeoutVote},
    safety::pluggables::{KVPersister, Persister},
    types::{
        block::Block,
        data_types::{BlockHeight, Timestamp, ViewNumber},
    },
};
use log::LevelFilter;
use rand::{rngs::StdRng, Rng, SeedableRng};

use common::{
    logging::setup_logger,
    sim::{payload, Envelope, Sim, CHAIN_ID},
};

fn short_timeouts() -> PacemakerConfiguration {
    PacemakerConfiguration {
        base_view_timeout: Duration::from_secs(1),
        max_view_timeout: Duration::from_secs(8),
        timeout_backoff_factor: 2,
    }
}

fn proposal_in(envelope: &Envelope) -> Option<&Proposal> {
    match &envelope.message {
        Message::HotStuffMessage(HotStuffMessage::Proposal(proposal)) => Some(proposal),
        _ => None,
    }
}

/// A proposal for the same view and parent as `proposal`, but a different block.
fn twin_of(proposal: &Proposal, salt: u64) -> Proposal {
    let block = &proposal.block;
    Proposal {
        block: Block::new(
            block.view,
            block.justify.clone(),
            payload(u64::MAX - salt),
            block.height,
            CHAIN_ID,
            Timestamp::now(),
        ),
        ..proposal.clone()
    }
}

/// Every replica's finalized blocks form a chain growing out of genesis, and of any two replicas,
/// one's chain is a prefix of the other's.
fn assert_chains_consistent(sim: &Sim) {
    let chains: Vec<Vec<Block>> = sim.replicas.iter().map(|replica| replica.finalized()).collect();

    for chain in &chains {
        let mut parent = sim.genesis.hash;
        for (i, block) in chain.iter().enumerate() {
            assert_eq!(block.height, BlockHeight::new(i as u64 + 1));
            assert_eq!(block.parent(), parent);
            parent = block.hash;
        }
    }

    for a in &chains {
        for b in &chains {
            let common = a.len().min(b.len());
            let a_hashes: Vec<_> = a[..common].iter().map(|block| block.hash).collect();
            let b_hashes: Vec<_> = b[..common].iter().map(|block| block.hash).collect();
            assert_eq!(a_hashes, b_hashes);
        }
    }
}

#[test]
fn three_consecutive_qcs_finalize_the_first_block_exactly_once() {
    setup_logger(LevelFilter::Warn);

    let mut sim = Sim::new(4, PacemakerConfiguration::default());
    sim.start();

    // Nobody sees the QC for view 3 before the leader of view 4 collects it.
    assert!(sim.run_until(1_000, |sim| sim
        .replicas
        .iter()
        .any(|replica| !replica.finalized().is_empty())));

    let collector = sim.index_of(&sim.leader(4));
    for (i, replica) in sim.replicas.iter().enumerate() {
        let finalized = replica.finalized();
        if i == collector {
            assert_eq!(finalized.len(), 1);
            assert_eq!(finalized[0].view, ViewNumber::new(1));
            assert_eq!(finalized[0].height, BlockHeight::new(1));
            assert_eq!(finalized[0].parent(), sim.genesis.hash);
            assert_eq!(replica.state.highest_qc().view, ViewNumber::new(3));
        } else {
            assert!(finalized.is_empty());
        }
    }
    let first_block = sim.replicas[collector].finalized()[0].hash;

    assert!(sim.run_until(10_000, |sim| sim
        .replicas
        .iter()
        .all(|replica| replica.finalized().len() >= 5)));

    for replica in sim.replicas.iter_mut() {
        assert_eq!(
            replica
                .finalized()
                .iter()
                .filter(|block| block.hash == first_block)
                .count(),
            1
        );
        let finalize_events = replica
            .events()
            .iter()
            .filter(|event| {
                matches!(event, Event::FinalizeBlock(FinalizeBlockEvent { block, .. }) if *block == first_block)
            })
            .count();
        assert_eq!(finalize_events, 1);
    }
    assert_chains_consistent(&sim);
}

#[test]
fn a_replica_votes_once_per_view_even_when_the_leader_equivocates() {
    setup_logger(LevelFilter::Warn);

    let mut sim = Sim::new(4, PacemakerConfiguration::default());
    sim.start();

    let leader = sim.leader(1);
    let next_leader = sim.leader(2);
    let target = sim
        .replicas
        .iter()
        .map(|replica| replica.key)
        .find(|key| *key != leader && *key != next_leader)
        .unwrap();

    let mut to_target = sim.take_where(|envelope| envelope.to == target);
    assert_eq!(to_target.len(), 1);
    let original = to_target.remove(0);
    let proposal = proposal_in(&original).unwrap().clone();
    let twin = twin_of(&proposal, 0);

    sim.deliver(original.clone());
    sim.deliver(original);
    sim.deliver(Envelope {
        from: leader,
        to: target,
        message: twin.clone().into(),
    });

    let index = sim.index_of(&target);
    let replica = &mut sim.replicas[index];

    // The second block is kept as evidence, but gets no vote.
    assert!(replica.state.block_tree().contains(&proposal.block.hash));
    assert!(replica.state.block_tree().contains(&twin.block.hash));
    assert_eq!(
        replica.state.safety_data().highest_voted_view,
        ViewNumber::new(1)
    );
    let stored = KVPersister::new(replica.db.clone())
        .load_safety_data()
        .unwrap()
        .unwrap();
    assert_eq!(stored.highest_voted_view, ViewNumber::new(1));

    let events = replica.events();
    let votes: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Vote(VoteEvent { vote, .. }) => Some(vote.block),
            _ => None,
        })
        .collect();
    assert_eq!(votes, vec![proposal.block.hash]);

    assert!(events.iter().any(|event| matches!(
        event,
        Event::SafetyViolation(SafetyViolationEvent {
            origin: Some(origin),
            violation: SafetyViolation::DoubleProposal { view, first, second },
            ..
        }) if *origin == leader
            && *view == ViewNumber::new(1)
            && *first == proposal.block.hash
            && *second == twin.block.hash
    )));
}

#[test]
fn proposals_from_anyone_but_the_leader_are_rejected() {
    setup_logger(LevelFilter::Warn);

    let mut sim = Sim::new(4, PacemakerConfiguration::default());
    sim.start();

    let leader = sim.leader(1);
    let impostor = sim.leader(2);
    let target = sim
        .replicas
        .iter()
        .map(|replica| replica.key)
        .find(|key| *key != leader && *key != impostor)
        .unwrap();

    let envelope = sim
        .take_where(|envelope| envelope.to == target)
        .remove(0);
    let forged = Envelope {
        from: impostor,
        ..envelope
    };
    sim.deliver(forged);

    let index = sim.index_of(&target);
    let replica = &mut sim.replicas[index];
    assert_eq!(replica.state.block_tree().len(), 1);
    assert!(replica.events().iter().any(|event| matches!(
        event,
        Event::RejectInput(RejectInputEvent {
            reason: MalformedInput::NotLeader { .. },
            ..
        })
    )));
    assert!(!replica
        .events()
        .iter()
        .any(|event| matches!(event, Event::Vote(_))));
}

#[test]
fn a_replica_that_cannot_persist_its_vote_halts() {
    setup_logger(LevelFilter::Warn);

    let mut sim = Sim::new(4, short_timeouts());
    sim.start();

    let leader = sim.leader(1);
    let broken = sim
        .replicas
        .iter()
        .map(|replica| replica.key)
        .find(|key| *key != leader)
        .unwrap();
    let index = sim.index_of(&broken);
    sim.replicas[index].db.break_disk();

    for envelope in sim.take_where(|envelope| envelope.to == broken) {
        sim.deliver(envelope);
    }

    let now = sim.now();
    let replica = &mut sim.replicas[index];
    assert!(replica.state.is_halted());
    assert_eq!(
        replica.state.safety_data().highest_voted_view,
        ViewNumber::init()
    );
    assert!(replica
        .events()
        .iter()
        .any(|event| matches!(event, Event::Halt(_))));
    assert!(!replica
        .events()
        .iter()
        .any(|event| matches!(event, Event::Vote(_))));
    assert!(matches!(
        replica
            .handler
            .handle(&mut replica.state, Input::TimeoutFired, now),
        Err(EventHandlerError::Halted)
    ));
    assert!(sim.take_where(|envelope| envelope.from == broken).is_empty());

    // The other three keep moving through views without it.
    assert!(sim.run_until(20_000, |sim| sim
        .replicas
        .iter()
        .filter(|replica| replica.key != broken)
        .all(|replica| replica.state.current_view() >= ViewNumber::new(6))));
    assert!(sim
        .replicas
        .iter()
        .filter(|replica| replica.key != broken)
        .all(|replica| !replica.state.is_halted()));
}

#[test]
fn a_partitioned_replica_catches_up_on_views() {
    setup_logger(LevelFilter::Warn);

    let mut sim = Sim::new(4, short_timeouts());
    sim.start();

    let isolated = sim.leader(3);
    for _ in 0..3_000 {
        let _ = sim.take_where(|envelope| envelope.to == isolated);
        if !sim.deliver_at(0) {
            sim.advance_to_next_deadline();
        }
    }
    let others_view = sim
        .replicas
        .iter()
        .filter(|replica| replica.key != isolated)
        .map(|replica| replica.state.current_view())
        .min()
        .unwrap();
    let index = sim.index_of(&isolated);
    assert!(sim.replicas[index].state.current_view() < others_view);

    assert!(sim.run_until(20_000, |sim| {
        sim.replicas[sim.index_of(&isolated)].state.current_view() >= others_view
    }));
    assert!(!sim.replicas[index].state.is_halted());
    assert_chains_consistent(&sim);
}

#[test]
fn an_equivocating_leader_cannot_split_finalized_chains() {
    setup_logger(LevelFilter::Warn);

    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sim = Sim::new(4, short_timeouts());
        let byzantine = sim.replicas[0].key;
        let fooled: Vec<VerifyingKey> = vec![sim.replicas[1].key, sim.replicas[3].key];
        sim.start();

        for _ in 0..4_000 {
            let in_flight = sim.in_flight();
            if in_flight == 0 {
                sim.advance_to_next_deadline();
                continue;
            }

            let mut envelope = sim.take(rng.gen_range(0, in_flight.min(3))).unwrap();
            if envelope.from == byzantine && fooled.contains(&envelope.to) {
                if let Some(proposal) = proposal_in(&envelope) {
                    let twin = twin_of(proposal, proposal.block.view.int());
                    envelope.message = twin.into();
                }
            }
            sim.deliver(envelope);
        }

        assert!(
            sim.replicas
                .iter()
                .any(|replica| !replica.finalized().is_empty()),
            "no block finalized with seed {}",
            seed
        );
        assert!(sim.replicas.iter().all(|replica| !replica.state.is_halted()));
        assert_chains_consistent(&sim);
        for replica in sim.replicas.iter_mut() {
            assert!(!replica.events().iter().any(|event| matches!(
                event,
                Event::SafetyViolation(SafetyViolationEvent {
                    violation: SafetyViolation::ConflictingQuorumCertificates { .. },
                    ..
                })
            )));
        }
    }
}

#[test]
fn a_restarted_replica_resumes_after_its_last_vote_and_never_votes_in_that_view_again() {
    setup_logger(LevelFilter::Warn);

    let mut sim = Sim::new(4, PacemakerConfiguration::default());
    sim.start();

    let leader = sim.leader(1);
    let next_leader = sim.leader(2);
    let target = sim
        .replicas
        .iter()
        .map(|replica| replica.key)
        .find(|key| *key != leader && *key != next_leader)
        .unwrap();
    let index = sim.index_of(&target);

    let original = sim.take_where(|envelope| envelope.to == target).remove(0);
    sim.deliver(original.clone());
    assert!(sim.replicas[index]
        .events()
        .iter()
        .any(|event| matches!(event, Event::Vote(_))));
    let _ = sim.take_where(|envelope| envelope.from == target);

    sim.restart(index);

    let stored = KVPersister::new(sim.replicas[index].db.clone())
        .load_safety_data()
        .unwrap()
        .unwrap();
    assert_eq!(stored.highest_voted_view, ViewNumber::new(1));
    let replica = &sim.replicas[index];
    assert_eq!(
        replica.state.current_view(),
        stored
            .highest_voted_view
            .max(stored.highest_acknowledged_qc.view)
            + 1
    );
    assert_eq!(replica.state.current_view(), ViewNumber::new(2));

    // The proposal it already voted for arrives again, twice.
    sim.deliver(original.clone());
    sim.deliver(original);

    let replica = &mut sim.replicas[index];
    assert!(!replica.state.is_halted());
    assert!(!replica
        .events()
        .iter()
        .any(|event| matches!(event, Event::Vote(_))));
    assert_eq!(
        replica.state.safety_data().highest_voted_view,
        ViewNumber::new(1)
    );
    assert!(sim
        .take_where(|envelope| envelope.from == target
            && matches!(envelope.message, Message::HotStuffMessage(HotStuffMessage::Vote(_))))
        .is_empty());
}

#[test]
fn votes_for_the_last_possible_view_are_dropped() {
    setup_logger(LevelFilter::Warn);

    let mut sim = Sim::new(4, short_timeouts());
    sim.start();

    let sender = sim.replicas[1].key;
    let receiver = sim.replicas[0].key;
    let gateway = sim.gateway(1);
    let last_view = ViewNumber::new(u64::MAX);
    let messages: Vec<Message> = vec![
        Vote::new(&gateway, CHAIN_ID, last_view, payload(1)).unwrap().into(),
        TimeoutVote::new(
            &gateway,
            CHAIN_ID,
            last_view,
            QuorumCertificate::for_genesis(&sim.genesis),
        )
        .unwrap()
        .into(),
    ];
    for message in messages {
        sim.deliver(Envelope {
            from: sender,
            to: receiver,
            message,
        });
    }

    let replica = &sim.replicas[0];
    assert!(!replica.state.is_halted());
    assert_eq!(replica.state.current_view(), ViewNumber::new(1));

    // Consensus carries on as if nothing happened.
    assert!(sim.run_until(10_000, |sim| sim
        .replicas
        .iter()
        .all(|replica| replica.finalized().len() >= 2)));
    assert_chains_consistent(&sim);
}

#[test]
fn the_justify_of_a_rejected_block_still_counts() {
    setup_logger(LevelFilter::Warn);

    let mut sim = Sim::new(4, PacemakerConfiguration::default());
    sim.start();

    let first_leader = sim.leader(1);
    let second_leader = sim.leader(2);
    let target = sim
        .replicas
        .iter()
        .map(|replica| replica.key)
        .find(|key| *key != first_leader && *key != second_leader)
        .unwrap();
    let index = sim.index_of(&target);

    // Run until the leader of view 2 sends its proposal, which carries the QC for view 1.
    let envelope = loop {
        let mut found = sim.take_where(|envelope| {
            envelope.to == target
                && proposal_in(envelope).map_or(false, |proposal| proposal.block.view == ViewNumber::new(2))
        });
        if let Some(envelope) = found.pop() {
            break envelope;
        }
        assert!(sim.deliver_at(0));
    };
    assert_eq!(sim.replicas[index].state.current_view(), ViewNumber::new(1));

    let proposal = proposal_in(&envelope).unwrap().clone();
    let justify = proposal.block.justify.clone();
    assert_eq!(justify.view, ViewNumber::new(1));
    let misnumbered = Proposal {
        block: Block::new(
            proposal.block.view,
            justify.clone(),
            payload(999),
            BlockHeight::new(7),
            CHAIN_ID,
            Timestamp::now(),
        ),
        ..proposal
    };
    sim.deliver(Envelope {
        message: misnumbered.into(),
        ..envelope
    });

    let replica = &mut sim.replicas[index];
    assert!(replica.events().iter().any(|event| matches!(
        event,
        Event::RejectInput(RejectInputEvent {
            reason: MalformedInput::IncorrectBlock(BlockRejection::BadHeight { .. }),
            ..
        })
    )));
    assert_eq!(replica.state.highest_qc(), &justify);
    assert_eq!(replica.state.safety_data().highest_acknowledged_qc, justify);
    assert_eq!(replica.state.current_view(), ViewNumber::new(2));
}
