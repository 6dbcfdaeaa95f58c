/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The top-level consensus state machine.
//!
//! All of a replica's consensus state lives in one explicitly owned [`ConsensusState`]: the block
//! tree, the safety data, the pacemaker, the vote aggregator, and the per-view [`ViewPhase`]. The
//! [`EventHandler`] is the only thing that mutates it, one [`Input`] at a time, through
//! [`handle`](EventHandler::handle). The algorithm thread calls `handle` in a loop, but the handler
//! does not care which thread drives it, so tests drive it directly with a virtual clock.
//!
//! ## Processing an input
//!
//! Every input is processed to completion before the next one is looked at. Messages that this
//! replica addresses to itself (its own vote when it is the next leader, its own timeout vote) are
//! not sent through the network but appended to an internal queue that is drained before `handle`
//! returns. This keeps the recursion depth constant.
//!
//! The replica's own proposal is held back until the next call to [`handle`](EventHandler::handle)
//! or [`resume`](EventHandler::resume). In a network where this replica alone forms a quorum, every
//! vote immediately forms a QC and every QC starts a new view, so draining everything would never
//! end. Drivers call `resume` whenever [`has_deferred`](EventHandler::has_deferred) says so.
//!
//! ## Failure semantics
//!
//! 1. Inputs that are malformed (wrong chain, bad signature, unknown parent, invalid certificate,
//!    sender is not the leader) are dropped without changing any state, and reported through a
//!    [`RejectInputEvent`](crate::events::RejectInputEvent).
//! 2. Inputs that prove some peer misbehaved (an equivocating vote, two proposals in one view, two
//!    QCs for different blocks in one view, a proposal that would make correct replicas break their
//!    lock) are also dropped, and reported through a
//!    [`SafetyViolationEvent`](crate::events::SafetyViolationEvent).
//! 3. Failing to sign a vote or to persist [`SafetyData`] is a [`FatalLocalFailure`]. The handler
//!    marks the state as halted, emits a [`HaltEvent`](crate::events::HaltEvent), and refuses every
//!    subsequent input with [`EventHandlerError::Halted`].

use std::{
    collections::{BTreeMap, VecDeque},
    fmt::{self, Display, Formatter},
    sync::mpsc::Sender,
    time::{Instant, SystemTime},
};

use ed25519_dalek::VerifyingKey;

use crate::{
    app::{FinalizationSink, PayloadSource},
    block_tree::{
        forks::{AddBlockOutcome, BlockRejection, BlockTree},
        invariants::CommitRule,
    },
    crypto::{CryptoError, CryptoGateway},
    events::*,
    hotstuff::{
        messages::{HotStuffMessage, Proposal, Vote},
        types::QuorumCertificate,
        vote_aggregator::{AddVoteOutcome, EquivocationEvidence, VoteAggregator},
    },
    logging::first_seven_base64_chars,
    networking::{messages::Message, network::Network, sending::SenderHandle},
    pacemaker::{
        implementation::{
            CollectTimeoutOutcome, Pacemaker, PacemakerConfiguration, PacemakerError, ViewChange,
        },
        messages::{PacemakerMessage, ProgressCertificate, TimeoutVote},
        types::TimeoutCertificate,
    },
    safety::{
        pluggables::{PersistenceError, Persister},
        rules::{acknowledge_qc, decide_vote, update_lock, VoteDecision},
        safety_data::SafetyData,
    },
    types::{
        block::Block,
        data_types::{ChainID, CryptoHash, Timestamp, ViewNumber},
        signed_messages::{Certificate, Verified},
        validator_set::ValidatorSet,
    },
};

/// Everything the [`EventHandler`] can be asked to process.
#[derive(Clone, Debug)]
pub enum Input {
    Proposal {
        origin: VerifyingKey,
        proposal: Proposal,
    },

    /// A vote whose signature has not been checked yet.
    Vote { origin: VerifyingKey, vote: Vote },

    /// A vote whose signature was checked by the verification pool.
    VerifiedVote {
        origin: VerifyingKey,
        vote: Verified<Vote>,
    },

    /// A vote that failed verification in the verification pool.
    InvalidVote { origin: VerifyingKey, vote: Vote },

    TimeoutVote {
        origin: VerifyingKey,
        timeout_vote: TimeoutVote,
    },

    /// A certificate sent out of band to help this replica catch up.
    CertificateSync {
        origin: VerifyingKey,
        certificate: ProgressCertificate,
    },

    /// The clock passed the pacemaker's deadline, as far as the caller can tell. The handler checks
    /// the deadline again, so spurious firings are harmless.
    TimeoutFired,
}

impl Input {
    /// Convert a message received from `origin` into an input.
    pub fn from_message(origin: VerifyingKey, message: Message) -> Input {
        match message {
            Message::HotStuffMessage(HotStuffMessage::Proposal(proposal)) => {
                Input::Proposal { origin, proposal }
            }
            Message::HotStuffMessage(HotStuffMessage::Vote(vote)) => Input::Vote { origin, vote },
            Message::PacemakerMessage(PacemakerMessage::TimeoutVote(timeout_vote)) => {
                Input::TimeoutVote {
                    origin,
                    timeout_vote,
                }
            }
            Message::PacemakerMessage(PacemakerMessage::CertificateSync(certificate_sync)) => {
                Input::CertificateSync {
                    origin,
                    certificate: certificate_sync.certificate,
                }
            }
        }
    }
}

/// Where in the current view the replica is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewPhase {
    WaitingForProposal,

    /// This replica voted in the current view. `as_leader` is true if it is also the one collecting
    /// the votes, i.e., it leads the next view.
    WaitingForVotes { as_leader: bool },

    /// This replica timed out in the current view and will not vote in it anymore.
    ViewChanging,
}

/// The complete consensus state of a replica.
pub struct ConsensusState {
    chain_id: ChainID,
    validator_set: ValidatorSet,
    genesis: CryptoHash,
    block_tree: BlockTree,
    safety_data: SafetyData,
    pacemaker: Pacemaker,
    votes: VoteAggregator,
    phase: ViewPhase,
    highest_qc: QuorumCertificate,
    highest_tc: Option<TimeoutCertificate>,
    certified: BTreeMap<ViewNumber, CryptoHash>,
    proposed_view: Option<ViewNumber>,
    halted: bool,
}

impl ConsensusState {
    /// Create the state of a replica whose block tree is rooted at `genesis` and that resumes from
    /// `safety_data`.
    ///
    /// The replica starts in the view after the higher of the highest view it voted in and the view
    /// of its highest acknowledged QC.
    pub fn new(
        genesis: Block,
        safety_data: SafetyData,
        validator_set: ValidatorSet,
        pacemaker_config: PacemakerConfiguration,
        commit_rule: CommitRule,
        now: Instant,
    ) -> Result<ConsensusState, PacemakerError> {
        let chain_id = genesis.chain_id;
        let start_view = safety_data
            .highest_voted_view
            .max(safety_data.highest_acknowledged_qc.view)
            + 1;
        let pacemaker = Pacemaker::new(
            pacemaker_config,
            chain_id,
            validator_set.clone(),
            start_view,
            now,
        )?;
        let mut votes = VoteAggregator::new(chain_id, validator_set.clone());
        votes.prune_below(start_view.prev());

        Ok(ConsensusState {
            chain_id,
            votes,
            validator_set,
            genesis: genesis.hash,
            block_tree: BlockTree::new(genesis, commit_rule),
            highest_qc: safety_data.highest_acknowledged_qc.clone(),
            safety_data,
            pacemaker,
            phase: ViewPhase::WaitingForProposal,
            highest_tc: None,
            certified: BTreeMap::new(),
            proposed_view: None,
            halted: false,
        })
    }

    pub fn chain_id(&self) -> ChainID {
        self.chain_id
    }

    pub fn validator_set(&self) -> &ValidatorSet {
        &self.validator_set
    }

    pub fn current_view(&self) -> ViewNumber {
        self.pacemaker.current_view()
    }

    pub fn phase(&self) -> ViewPhase {
        self.phase
    }

    pub fn safety_data(&self) -> &SafetyData {
        &self.safety_data
    }

    pub fn block_tree(&self) -> &BlockTree {
        &self.block_tree
    }

    pub fn pacemaker(&self) -> &Pacemaker {
        &self.pacemaker
    }

    /// Get the highest-viewed valid QC this replica has seen, whether or not it has the block.
    pub fn highest_qc(&self) -> &QuorumCertificate {
        &self.highest_qc
    }

    pub fn highest_tc(&self) -> Option<&TimeoutCertificate> {
        self.highest_tc.as_ref()
    }

    /// Whether a fatal local failure stopped this replica's participation in consensus.
    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

/// Why an input was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    Malformed(MalformedInput),
    Violation(SafetyViolation),
}

/// Inputs that are invalid on their face. They carry no evidence of misbehavior, since a correct
/// peer on a slow link could have sent them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MalformedInput {
    WrongChain { expected: ChainID, found: ChainID },
    InvalidSignature,
    NotAValidator,

    /// The proposal did not come from the leader of its view.
    NotLeader { view: ViewNumber },

    /// The block tree refused the proposed block.
    IncorrectBlock(BlockRejection),

    /// A QC or TC is not signed by a quorum, or is internally inconsistent.
    InvalidCertificate { view: ViewNumber },
}

impl Display for MalformedInput {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MalformedInput::WrongChain { expected, found } => {
                write!(f, "message is for chain {}, expected chain {}", found, expected)
            }
            MalformedInput::InvalidSignature => write!(f, "invalid signature"),
            MalformedInput::NotAValidator => write!(f, "signer is not a validator"),
            MalformedInput::NotLeader { view } => {
                write!(f, "proposer is not the leader of view {}", view)
            }
            MalformedInput::IncorrectBlock(rejection) => write!(f, "{}", rejection),
            MalformedInput::InvalidCertificate { view } => {
                write!(f, "invalid certificate for view {}", view)
            }
        }
    }
}

/// Evidence that some peer is faulty or adversarial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SafetyViolation {
    EquivocatingVote(EquivocationEvidence),

    /// The leader of `view` proposed two different blocks.
    DoubleProposal {
        view: ViewNumber,
        first: CryptoHash,
        second: CryptoHash,
    },

    /// Two quorums certified different blocks in the same view. With at most `f` faulty replicas this
    /// is impossible, so seeing it means the fault threshold was exceeded.
    ConflictingQuorumCertificates {
        view: ViewNumber,
        first: CryptoHash,
        second: CryptoHash,
    },

    /// The proposed block neither extends this replica's locked block nor carries a newer QC.
    UnsafeProposal {
        view: ViewNumber,
        locked_view: ViewNumber,
        justify_view: ViewNumber,
    },
}

impl Display for SafetyViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SafetyViolation::EquivocatingVote(evidence) => write!(
                f,
                "{} voted for both {} and {} in view {}",
                first_seven_base64_chars(&evidence.voter),
                first_seven_base64_chars(&evidence.first.block.bytes()),
                first_seven_base64_chars(&evidence.second.block.bytes()),
                evidence.view
            ),
            SafetyViolation::DoubleProposal {
                view,
                first,
                second,
            } => write!(
                f,
                "leader of view {} proposed both {} and {}",
                view,
                first_seven_base64_chars(&first.bytes()),
                first_seven_base64_chars(&second.bytes())
            ),
            SafetyViolation::ConflictingQuorumCertificates {
                view,
                first,
                second,
            } => write!(
                f,
                "quorum certificates for both {} and {} in view {}",
                first_seven_base64_chars(&first.bytes()),
                first_seven_base64_chars(&second.bytes()),
                view
            ),
            SafetyViolation::UnsafeProposal {
                view,
                locked_view,
                justify_view,
            } => write!(
                f,
                "proposal in view {} justified by view {} does not respect lock at view {}",
                view, justify_view, locked_view
            ),
        }
    }
}

/// Local failures after which this replica must stop voting.
#[derive(Debug)]
pub enum FatalLocalFailure {
    Persistence(PersistenceError),
    Signing(CryptoError),

    /// Aggregating a quorum of verified votes failed.
    Aggregation(CryptoError),
}

impl From<PersistenceError> for FatalLocalFailure {
    fn from(value: PersistenceError) -> Self {
        FatalLocalFailure::Persistence(value)
    }
}

impl Display for FatalLocalFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FatalLocalFailure::Persistence(err) => write!(f, "{}", err),
            FatalLocalFailure::Signing(err) => write!(f, "failed to sign: {}", err),
            FatalLocalFailure::Aggregation(err) => write!(f, "failed to aggregate votes: {}", err),
        }
    }
}

impl std::error::Error for FatalLocalFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FatalLocalFailure::Persistence(err) => Some(err),
            FatalLocalFailure::Signing(err) | FatalLocalFailure::Aggregation(err) => Some(err),
        }
    }
}

/// Error returned by [`EventHandler::handle`] and [`EventHandler::start`].
#[derive(Debug)]
pub enum EventHandlerError {
    /// Processing the input hit a fatal local failure. The state is now halted.
    Fatal(FatalLocalFailure),

    /// The state was already halted. The input was not processed.
    Halted,
}

impl From<FatalLocalFailure> for EventHandlerError {
    fn from(value: FatalLocalFailure) -> Self {
        EventHandlerError::Fatal(value)
    }
}

impl Display for EventHandlerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EventHandlerError::Fatal(failure) => write!(f, "fatal local failure: {}", failure),
            EventHandlerError::Halted => write!(f, "replica is halted"),
        }
    }
}

impl std::error::Error for EventHandlerError {}

/// Drives a [`ConsensusState`] through its inputs.
///
/// The handler owns this replica's collaborators: the crypto gateway holding its key, a handle to
/// the network, the persister, the payload source, and the finalization sink.
pub struct EventHandler<
    N: Network,
    C: CryptoGateway,
    P: Persister,
    S: PayloadSource,
    F: FinalizationSink,
> {
    crypto: C,
    sender: SenderHandle<N>,
    persister: P,
    payload_source: S,
    finalization_sink: F,
    event_publisher: Option<Sender<Event>>,
    pending: VecDeque<Input>,
    deferred_proposal: Option<Input>,
}

impl<N, C, P, S, F> EventHandler<N, C, P, S, F>
where
    N: Network,
    C: CryptoGateway,
    P: Persister,
    S: PayloadSource,
    F: FinalizationSink,
{
    pub fn new(
        crypto: C,
        network: N,
        persister: P,
        payload_source: S,
        finalization_sink: F,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            crypto,
            sender: SenderHandle::new(network),
            persister,
            payload_source,
            finalization_sink,
            event_publisher,
            pending: VecDeque::new(),
            deferred_proposal: None,
        }
    }

    pub fn crypto(&self) -> &C {
        &self.crypto
    }

    pub fn persister(&self) -> &P {
        &self.persister
    }

    pub fn payload_source(&self) -> &S {
        &self.payload_source
    }

    pub fn finalization_sink(&self) -> &F {
        &self.finalization_sink
    }

    /// Enter the state's current view: emit a `StartView` event and, if this replica is its leader,
    /// propose.
    pub fn start(&mut self, state: &mut ConsensusState, now: Instant) -> Result<(), EventHandlerError> {
        if state.halted {
            return Err(EventHandlerError::Halted);
        }

        let view = state.current_view();
        let mut result = self.enter_view(state, view);
        if result.is_ok() {
            result = self.drain_pending(state, now);
        }
        self.halt_on_failure(state, result)
    }

    /// Process `input`, along with every message this replica sends itself as a consequence.
    ///
    /// The exception is this replica's own proposal: it is broadcast right away, but processed
    /// locally only by the next call to `handle` or [`resume`](Self::resume). Otherwise a replica
    /// that forms quorums on its own would never return from this call.
    pub fn handle(
        &mut self,
        state: &mut ConsensusState,
        input: Input,
        now: Instant,
    ) -> Result<(), EventHandlerError> {
        if state.halted {
            return Err(EventHandlerError::Halted);
        }

        if let Some(proposal) = self.deferred_proposal.take() {
            self.pending.push_back(proposal);
        }
        self.pending.push_back(input);
        let result = self.drain_pending(state, now);
        self.halt_on_failure(state, result)
    }

    /// Check whether this replica has a proposal of its own that it has yet to process.
    pub fn has_deferred(&self) -> bool {
        self.deferred_proposal.is_some()
    }

    /// Process this replica's own proposal, if one is waiting.
    pub fn resume(&mut self, state: &mut ConsensusState, now: Instant) -> Result<(), EventHandlerError> {
        if state.halted {
            return Err(EventHandlerError::Halted);
        }

        match self.deferred_proposal.take() {
            Some(proposal) => {
                self.pending.push_back(proposal);
                let result = self.drain_pending(state, now);
                self.halt_on_failure(state, result)
            }
            None => Ok(()),
        }
    }

    fn drain_pending(&mut self, state: &mut ConsensusState, now: Instant) -> Result<(), FatalLocalFailure> {
        while let Some(input) = self.pending.pop_front() {
            match input {
                Input::Proposal { origin, proposal } => {
                    self.on_receive_proposal(state, origin, proposal, now)?
                }
                Input::Vote { origin, vote } => {
                    self.on_receive_vote(state, origin, vote, false, now)?
                }
                Input::VerifiedVote { origin, vote } => {
                    self.on_receive_vote(state, origin, vote.into_inner(), true, now)?
                }
                Input::InvalidVote { origin, vote } => self.on_invalid_vote(state, origin, vote),
                Input::TimeoutVote {
                    origin,
                    timeout_vote,
                } => self.on_receive_timeout_vote(state, origin, timeout_vote, now)?,
                Input::CertificateSync {
                    origin,
                    certificate,
                } => self.on_receive_certificate_sync(state, origin, certificate, now)?,
                Input::TimeoutFired => self.on_timeout(state, now)?,
            }
        }
        Ok(())
    }

    fn halt_on_failure(
        &mut self,
        state: &mut ConsensusState,
        result: Result<(), FatalLocalFailure>,
    ) -> Result<(), EventHandlerError> {
        match result {
            Ok(()) => Ok(()),
            Err(failure) => {
                self.pending.clear();
                self.deferred_proposal = None;
                state.halted = true;
                log::error!(
                    "Halting in view {} after a fatal local failure: {}",
                    state.current_view(),
                    failure
                );
                Event::Halt(HaltEvent {
                    timestamp: SystemTime::now(),
                    view: state.current_view(),
                    reason: failure.to_string(),
                })
                .publish(&self.event_publisher);
                Err(EventHandlerError::Fatal(failure))
            }
        }
    }

    /// Process a proposal.
    ///
    /// # Steps
    ///
    /// 1. Check that the proposal is for this chain and comes from the leader of its view.
    /// 2. If it carries a timeout certificate, validate it and process it.
    /// 3. Validate `block.justify`, then insert the block into the block tree.
    /// 4. Process `block.justify`, even if the block itself was refused.
    /// 5. Vote for the block if it is safe to.
    /// 6. Process the QC for the block, if one arrived before the block did.
    fn on_receive_proposal(
        &mut self,
        state: &mut ConsensusState,
        origin: VerifyingKey,
        proposal: Proposal,
        now: Instant,
    ) -> Result<(), FatalLocalFailure> {
        Event::ReceiveProposal(ReceiveProposalEvent {
            timestamp: SystemTime::now(),
            origin,
            proposal: proposal.clone(),
        })
        .publish(&self.event_publisher);

        let Proposal {
            chain_id,
            block,
            last_view_tc,
        } = proposal;

        // 1. Check the chain and the proposer.
        if chain_id != state.chain_id {
            self.reject(
                Some(origin),
                MalformedInput::WrongChain {
                    expected: state.chain_id,
                    found: chain_id,
                },
            );
            return Ok(());
        }
        if state.pacemaker.leader(block.view) != origin {
            self.reject(Some(origin), MalformedInput::NotLeader { view: block.view });
            return Ok(());
        }

        // 2. Advance through the timeout certificate that took the leader into its view.
        if let Some(tc) = last_view_tc {
            if !self.is_valid_tc(state, &tc) {
                self.reject(Some(origin), MalformedInput::InvalidCertificate { view: tc.view });
                return Ok(());
            }
            self.process_tc(state, tc, now)?;
        }

        // 3. Insert the block.
        if !self.is_valid_qc(state, &block.justify) {
            self.reject(
                Some(origin),
                MalformedInput::InvalidCertificate {
                    view: block.justify.view,
                },
            );
            return Ok(());
        }
        match state.block_tree.add_block(block.clone()) {
            Ok(AddBlockOutcome::Accepted(inserted)) => {
                Event::InsertBlock(InsertBlockEvent {
                    timestamp: SystemTime::now(),
                    block: block.clone(),
                })
                .publish(&self.event_publisher);

                if let Some(first) = inserted.equivocates_with {
                    self.reject(
                        Some(origin),
                        SafetyViolation::DoubleProposal {
                            view: block.view,
                            first,
                            second: inserted.hash,
                        },
                    );
                }
            }
            Ok(AddBlockOutcome::AlreadyKnown) => return Ok(()),
            Err(rejection) => {
                // The justify is valid even though the block is not, so it still updates the lock
                // and can move this replica's view forward.
                self.reject(Some(origin), MalformedInput::IncorrectBlock(rejection));
                return self.process_qc(state, block.justify, now);
            }
        }

        // 4. Process the justify.
        self.process_qc(state, block.justify.clone(), now)?;

        // 5. Vote.
        self.vote(state, origin, &block)?;

        // 6. Release a QC that was waiting for this block.
        if let Some(qc) = state.block_tree.take_buffered_qc(&block.hash) {
            self.process_qc(state, qc, now)?;
        }

        Ok(())
    }

    fn vote(
        &mut self,
        state: &mut ConsensusState,
        proposer: VerifyingKey,
        block: &Block,
    ) -> Result<(), FatalLocalFailure> {
        if state.phase == ViewPhase::ViewChanging {
            return Ok(());
        }

        let current_view = state.current_view();
        match decide_vote(&state.safety_data, block, current_view, &state.block_tree) {
            VoteDecision::Vote(safety_data) => {
                // Sign, then persist, then send.
                let vote = Vote::new(&self.crypto, state.chain_id, block.view, block.hash)
                    .map_err(FatalLocalFailure::Signing)?;
                self.persister.save_safety_data(&safety_data)?;
                state.safety_data = safety_data;

                Event::Vote(VoteEvent {
                    timestamp: SystemTime::now(),
                    vote: vote.clone(),
                })
                .publish(&self.event_publisher);

                let me = self.crypto.public_key();
                let next_leader = state.pacemaker.leader(block.view + 1);
                if next_leader == me {
                    self.pending.push_back(Input::VerifiedVote {
                        origin: me,
                        vote: Verified::new(vote),
                    });
                } else {
                    self.sender.send(next_leader, vote);
                }
                state.phase = ViewPhase::WaitingForVotes {
                    as_leader: next_leader == me,
                };
            }
            VoteDecision::Reject(rejection) if rejection.is_violation() => {
                self.reject(
                    Some(proposer),
                    SafetyViolation::UnsafeProposal {
                        view: block.view,
                        locked_view: state.safety_data.locked_qc.view,
                        justify_view: block.justify.view,
                    },
                );
            }
            VoteDecision::Reject(rejection) => {
                log::debug!("Not voting for block in view {}: {:?}", block.view, rejection);
            }
        }
        Ok(())
    }

    fn on_receive_vote(
        &mut self,
        state: &mut ConsensusState,
        origin: VerifyingKey,
        vote: Vote,
        verified: bool,
        now: Instant,
    ) -> Result<(), FatalLocalFailure> {
        Event::ReceiveVote(ReceiveVoteEvent {
            timestamp: SystemTime::now(),
            origin,
            vote: vote.clone(),
        })
        .publish(&self.event_publisher);

        if state.pacemaker.leader(vote.view + 1) != self.crypto.public_key() {
            log::debug!("Ignoring vote for view {}: not the next leader", vote.view);
            return Ok(());
        }

        let found_chain = vote.chain_id;
        let found_view = vote.view;
        let outcome = if verified {
            state.votes.add_verified_vote(Verified::new(vote), &self.crypto)
        } else {
            state.votes.add_vote(vote, &self.crypto)
        }
        .map_err(FatalLocalFailure::Aggregation)?;

        match outcome {
            AddVoteOutcome::FormedQC(qc) => {
                Event::CollectQC(CollectQCEvent {
                    timestamp: SystemTime::now(),
                    quorum_certificate: qc.clone(),
                })
                .publish(&self.event_publisher);
                self.process_qc(state, qc, now)?;
            }
            AddVoteOutcome::Equivocation(evidence) => {
                self.reject(Some(origin), SafetyViolation::EquivocatingVote(evidence))
            }
            AddVoteOutcome::InvalidSignature => {
                self.reject(Some(origin), MalformedInput::InvalidSignature)
            }
            AddVoteOutcome::NotAValidator => self.reject(Some(origin), MalformedInput::NotAValidator),
            AddVoteOutcome::WrongChain => self.reject(
                Some(origin),
                MalformedInput::WrongChain {
                    expected: state.chain_id,
                    found: found_chain,
                },
            ),
            AddVoteOutcome::TooFarAhead => {
                log::debug!("Ignoring vote for view {}: too far ahead of view {}", found_view, state.current_view())
            }
            AddVoteOutcome::Stored
            | AddVoteOutcome::DuplicateIgnored
            | AddVoteOutcome::AlreadyCertified
            | AddVoteOutcome::Stale => (),
        }
        Ok(())
    }

    fn on_invalid_vote(&mut self, state: &ConsensusState, origin: VerifyingKey, vote: Vote) {
        let reason = if state.validator_set.get_by_bytes(&vote.voter).is_some() {
            MalformedInput::InvalidSignature
        } else {
            MalformedInput::NotAValidator
        };
        self.reject(Some(origin), reason);
    }

    /// The pacemaker's deadline passed: sign a timeout vote for the current view carrying the highest
    /// QC, stop voting in the view, and broadcast the timeout vote.
    fn on_timeout(&mut self, state: &mut ConsensusState, now: Instant) -> Result<(), FatalLocalFailure> {
        if !state.pacemaker.is_timed_out(now) {
            return Ok(());
        }

        let view = state.current_view();
        Event::ViewTimeout(ViewTimeoutEvent {
            timestamp: SystemTime::now(),
            view,
            timeout: state.pacemaker.view_timeout(),
        })
        .publish(&self.event_publisher);

        let timeout_vote = state
            .pacemaker
            .on_timeout(&state.highest_qc, &self.crypto, now)
            .map_err(FatalLocalFailure::Signing)?;

        // Giving up on a view counts as voting in it, so that a late proposal never gets a vote, even
        // after a restart.
        if state.safety_data.highest_voted_view < view {
            let safety_data = SafetyData {
                highest_voted_view: view,
                ..state.safety_data.clone()
            };
            self.persister.save_safety_data(&safety_data)?;
            state.safety_data = safety_data;
        }
        state.phase = ViewPhase::ViewChanging;

        Event::TimeoutVote(TimeoutVoteEvent {
            timestamp: SystemTime::now(),
            timeout_vote: timeout_vote.clone(),
        })
        .publish(&self.event_publisher);

        self.sender.broadcast(timeout_vote.clone());
        self.pending.push_back(Input::TimeoutVote {
            origin: self.crypto.public_key(),
            timeout_vote,
        });
        Ok(())
    }

    fn on_receive_timeout_vote(
        &mut self,
        state: &mut ConsensusState,
        origin: VerifyingKey,
        timeout_vote: TimeoutVote,
        now: Instant,
    ) -> Result<(), FatalLocalFailure> {
        Event::ReceiveTimeoutVote(ReceiveTimeoutVoteEvent {
            timestamp: SystemTime::now(),
            origin,
            timeout_vote: timeout_vote.clone(),
        })
        .publish(&self.event_publisher);

        if timeout_vote.chain_id != state.chain_id {
            self.reject(
                Some(origin),
                MalformedInput::WrongChain {
                    expected: state.chain_id,
                    found: timeout_vote.chain_id,
                },
            );
            return Ok(());
        }

        // The sender is behind. Help it catch up instead of collecting its vote.
        if timeout_vote.view < state.current_view() {
            if origin != self.crypto.public_key() {
                self.sync_lagging_peer(state, origin, timeout_vote.view);
            }
            return Ok(());
        }

        let highest_qc = timeout_vote.highest_qc.clone();
        if highest_qc.view >= timeout_vote.view
            || !self.is_valid_qc(state, &highest_qc)
        {
            self.reject(
                Some(origin),
                MalformedInput::InvalidCertificate {
                    view: highest_qc.view,
                },
            );
            return Ok(());
        }

        let outcome = state
            .pacemaker
            .collect_timeout_vote(timeout_vote, &self.crypto)
            .map_err(FatalLocalFailure::Aggregation)?;
        match outcome {
            CollectTimeoutOutcome::InvalidSignature => {
                self.reject(Some(origin), MalformedInput::InvalidSignature);
                return Ok(());
            }
            CollectTimeoutOutcome::NotAValidator => {
                self.reject(Some(origin), MalformedInput::NotAValidator);
                return Ok(());
            }
            CollectTimeoutOutcome::WrongChain | CollectTimeoutOutcome::Stale => return Ok(()),
            CollectTimeoutOutcome::FormedTC(tc) => {
                Event::CollectTC(CollectTCEvent {
                    timestamp: SystemTime::now(),
                    timeout_certificate: tc.clone(),
                })
                .publish(&self.event_publisher);
                self.process_tc(state, tc, now)?;
            }
            CollectTimeoutOutcome::Stored
            | CollectTimeoutOutcome::Duplicate
            | CollectTimeoutOutcome::AlreadyCertified
            | CollectTimeoutOutcome::TooFarAhead => (),
        }

        // The signer vouched for the QC it carries, and the QC checks out on its own.
        self.process_qc(state, highest_qc, now)
    }

    fn on_receive_certificate_sync(
        &mut self,
        state: &mut ConsensusState,
        origin: VerifyingKey,
        certificate: ProgressCertificate,
        now: Instant,
    ) -> Result<(), FatalLocalFailure> {
        Event::ReceiveCertificateSync(ReceiveCertificateSyncEvent {
            timestamp: SystemTime::now(),
            origin,
            certificate: certificate.clone(),
        })
        .publish(&self.event_publisher);

        if certificate.chain_id() != state.chain_id {
            self.reject(
                Some(origin),
                MalformedInput::WrongChain {
                    expected: state.chain_id,
                    found: certificate.chain_id(),
                },
            );
            return Ok(());
        }

        match certificate {
            ProgressCertificate::QuorumCertificate(qc) => {
                if !self.is_valid_qc(state, &qc) {
                    self.reject(Some(origin), MalformedInput::InvalidCertificate { view: qc.view });
                    return Ok(());
                }
                self.process_qc(state, qc, now)
            }
            ProgressCertificate::TimeoutCertificate(tc) => {
                if !self.is_valid_tc(state, &tc) {
                    self.reject(Some(origin), MalformedInput::InvalidCertificate { view: tc.view });
                    return Ok(());
                }
                self.process_tc(state, tc, now)
            }
        }
    }

    /// Send `peer`, which is stuck in `view`, the certificate that takes it furthest.
    fn sync_lagging_peer(&mut self, state: &ConsensusState, peer: VerifyingKey, view: ViewNumber) {
        let certificate: ProgressCertificate = match &state.highest_tc {
            Some(tc) if tc.view > state.highest_qc.view => tc.clone().into(),
            _ => state.highest_qc.clone().into(),
        };
        if certificate.view() >= view {
            self.sender
                .send(peer, PacemakerMessage::certificate_sync(certificate));
        }
    }

    /// Update the safety data, the block tree, and the view in response to a valid QC.
    fn process_qc(
        &mut self,
        state: &mut ConsensusState,
        qc: QuorumCertificate,
        now: Instant,
    ) -> Result<(), FatalLocalFailure> {
        if !self.observe_qc(state, &qc)? {
            return Ok(());
        }
        if let Some(view_change) = state.pacemaker.on_qc_formed(&qc, now) {
            self.on_view_change(state, view_change)?;
        }
        Ok(())
    }

    /// Apply the consequences of a valid QC that do not involve changing views. Returns `false` if
    /// the QC should not be acted upon at all.
    fn observe_qc(
        &mut self,
        state: &mut ConsensusState,
        qc: &QuorumCertificate,
    ) -> Result<bool, FatalLocalFailure> {
        if qc.is_genesis_qc() {
            return Ok(false);
        }

        // 1. Check for a conflicting QC in the same view.
        if qc.view > state.block_tree.root().view {
            match state.certified.get(&qc.view) {
                Some(first) if *first != qc.block => {
                    let first = *first;
                    self.reject(
                        None,
                        SafetyViolation::ConflictingQuorumCertificates {
                            view: qc.view,
                            first,
                            second: qc.block,
                        },
                    );
                    return Ok(false);
                }
                Some(_) => (),
                None => {
                    state.certified.insert(qc.view, qc.block);
                }
            }
        }
        if qc.view > state.highest_qc.view {
            state.highest_qc = qc.clone();
        }

        // 2. Hold on to QCs whose blocks have not arrived yet.
        if !state.block_tree.contains(&qc.block) {
            state.block_tree.buffer_qc(qc.clone());
            return Ok(true);
        }

        // 3. Update the highest acknowledged QC and the lock.
        let acknowledged = acknowledge_qc(&state.safety_data, qc);
        let base = acknowledged.as_ref().unwrap_or(&state.safety_data);
        let locked = update_lock(base, qc, &state.block_tree);
        let updated = locked.clone().or_else(|| acknowledged.clone());
        if let Some(safety_data) = updated {
            self.persister.save_safety_data(&safety_data)?;
            state.safety_data = safety_data;
        }
        if acknowledged.is_some() {
            Event::UpdateHighestQC(UpdateHighestQCEvent {
                timestamp: SystemTime::now(),
                highest_qc: state.safety_data.highest_acknowledged_qc.clone(),
            })
            .publish(&self.event_publisher);
        }
        if locked.is_some() {
            Event::UpdateLockedQC(UpdateLockedQCEvent {
                timestamp: SystemTime::now(),
                locked_qc: state.safety_data.locked_qc.clone(),
            })
            .publish(&self.event_publisher);
        }

        // 4. Finalize.
        if let Some(finalized) = state.block_tree.try_finalize(qc) {
            for block in &finalized.blocks {
                self.finalization_sink.on_finalized(block);
                Event::FinalizeBlock(FinalizeBlockEvent {
                    timestamp: SystemTime::now(),
                    block: block.hash,
                    height: block.height,
                    view: block.view,
                })
                .publish(&self.event_publisher);
            }
            for block in finalized.pruned {
                Event::PruneBlock(PruneBlockEvent {
                    timestamp: SystemTime::now(),
                    block,
                })
                .publish(&self.event_publisher);
            }
            let root_view = state.block_tree.root().view;
            state.certified = state.certified.split_off(&(root_view + 1));
        }

        Ok(true)
    }

    /// Record `tc`, apply the QC it carries, and move to the view after it.
    fn process_tc(
        &mut self,
        state: &mut ConsensusState,
        tc: TimeoutCertificate,
        now: Instant,
    ) -> Result<(), FatalLocalFailure> {
        if state
            .highest_tc
            .as_ref()
            .map_or(true, |highest_tc| tc.view > highest_tc.view)
        {
            state.highest_tc = Some(tc.clone());
        }
        self.observe_qc(state, &tc.highest_qc)?;
        if let Some(view_change) = state.pacemaker.on_tc_formed(&tc, now) {
            self.on_view_change(state, view_change)?;
        }
        Ok(())
    }

    fn is_valid_qc(&self, state: &ConsensusState, qc: &QuorumCertificate) -> bool {
        qc.chain_id == state.chain_id
            && qc.is_correct(&state.validator_set, &self.crypto, &state.genesis)
    }

    fn is_valid_tc(&self, state: &ConsensusState, tc: &TimeoutCertificate) -> bool {
        tc.chain_id == state.chain_id
            && tc.highest_qc.view < tc.view
            && tc.is_correctly_signed(&state.validator_set, &self.crypto)
            && self.is_valid_qc(state, &tc.highest_qc)
    }

    fn on_view_change(
        &mut self,
        state: &mut ConsensusState,
        view_change: ViewChange,
    ) -> Result<(), FatalLocalFailure> {
        // Votes for the view just left can still complete a QC.
        state.votes.prune_below(view_change.new.prev());
        self.enter_view(state, view_change.new)
    }

    fn enter_view(&mut self, state: &mut ConsensusState, view: ViewNumber) -> Result<(), FatalLocalFailure> {
        state.phase = ViewPhase::WaitingForProposal;

        let leader = state.pacemaker.leader(view);
        Event::StartView(StartViewEvent {
            timestamp: SystemTime::now(),
            leader,
            view,
        })
        .publish(&self.event_publisher);

        if leader == self.crypto.public_key() && state.proposed_view.map_or(true, |proposed| proposed < view) {
            self.propose(state, view);
        }
        Ok(())
    }

    /// Build a block on top of the block certified by the highest acknowledged QC, broadcast it, and
    /// hold it back for processing by this replica.
    fn propose(&mut self, state: &mut ConsensusState, view: ViewNumber) {
        let parent_qc = state.safety_data.highest_acknowledged_qc.clone();
        let parent = match state.block_tree.get(&parent_qc.block) {
            Some(parent) => parent.clone(),
            None => {
                log::warn!(
                    "Cannot propose in view {}: block certified by the highest QC is not in the block tree",
                    view
                );
                return;
            }
        };

        let payload_hash = self.payload_source.build_payload(&parent);
        let block = Block::new(
            view,
            parent_qc.clone(),
            payload_hash,
            parent.height + 1,
            state.chain_id,
            Timestamp::now(),
        );
        let last_view_tc = state
            .highest_tc
            .as_ref()
            .filter(|tc| tc.view + 1 == view && parent_qc.view + 1 != view)
            .cloned();
        let proposal = Proposal {
            chain_id: state.chain_id,
            block,
            last_view_tc,
        };
        state.proposed_view = Some(view);

        Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            proposal: proposal.clone(),
        })
        .publish(&self.event_publisher);

        self.sender.broadcast(proposal.clone());
        self.deferred_proposal = Some(Input::Proposal {
            origin: self.crypto.public_key(),
            proposal,
        });
    }

    /// Drop an input, reporting why. Nothing in `state` changes.
    fn reject(&self, origin: Option<VerifyingKey>, rejection: impl Into<Rejection>) {
        match rejection.into() {
            Rejection::Malformed(reason) => Event::RejectInput(RejectInputEvent {
                timestamp: SystemTime::now(),
                origin,
                reason,
            }),
            Rejection::Violation(violation) => Event::SafetyViolation(SafetyViolationEvent {
                timestamp: SystemTime::now(),
                origin,
                violation,
            }),
        }
        .publish(&self.event_publisher);
    }
}

impl From<MalformedInput> for Rejection {
    fn from(value: MalformedInput) -> Self {
        Rejection::Malformed(value)
    }
}

impl From<SafetyViolation> for Rejection {
    fn from(value: SafetyViolation) -> Self {
        Rejection::Violation(value)
    }
}
