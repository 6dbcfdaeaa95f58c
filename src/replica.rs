/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a replica.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](ReplicaSpec) with:
//!   1. `ReplicaSpec::builder` to construct a `ReplicaSpecBuilder`,
//!   2. The setters of the `ReplicaSpecBuilder`, and
//!   3. The `ReplicaSpecBuilder::build` method to construct a [`ReplicaSpec`],
//! - The function to [start](ReplicaSpec::start) a [`Replica`] given its specification,
//! - [The type](Replica) which keeps the replica alive.
//!
//! ## Starting a replica
//!
//! ```ignore
//! let configuration = Configuration::builder()
//!     .me(signing_key)
//!     .chain_id(ChainID::new(0))
//!     .base_view_timeout(Duration::from_secs(1))
//!     .log_events(true)
//!     .build();
//!
//! let replica = ReplicaSpec::builder()
//!     .network(network)
//!     .persister(KVPersister::new(kv_store))
//!     .payload_source(mempool)
//!     .finalization_sink(FinalizationSinks::new().with(executor).with(archiver))
//!     .validator_set(validator_set)
//!     .configuration(configuration)
//!     .on_finalize_block(finalize_block_handler)
//!     .on_safety_violation(alert_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//!
//! - `.network(...)`
//! - `.persister(...)`
//! - `.payload_source(...)`
//! - `.finalization_sink(...)`
//! - `.validator_set(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! `.genesis(...)` sets the block the block tree is rooted at. By default, this is
//! [`Block::genesis`] of the configured chain.
//!
//! The remaining optional setters register user-defined event handlers for events from
//! [`crate::events`], one per event type: `.on_insert_block(...)`, `.on_finalize_block(...)`,
//! `.on_prune_block(...)`, and so on up to `.on_halt(...)`.
//!
//! ## Threads
//!
//! A running replica has up to four kinds of threads: the poller thread, the verification pool's
//! worker threads, the [algorithm thread](crate::algorithm), and, if any event handlers are
//! registered or `log_events` is set, the event bus thread. Dropping the [`Replica`] stops all of
//! them.

use std::{
    fmt::{self, Display, Formatter},
    sync::mpsc::{self, Sender},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::{
    algorithm::Algorithm,
    app::{FinalizationSink, PayloadSource},
    block_tree::invariants::CommitRule,
    crypto::{Ed25519Gateway, SigningAlgorithm},
    event_bus::*,
    event_handler::{ConsensusState, EventHandler},
    events::*,
    networking::{network::Network, receiving::start_polling},
    pacemaker::implementation::{PacemakerConfiguration, PacemakerError},
    safety::{
        pluggables::{PersistenceError, Persister},
        safety_data::SafetyData,
    },
    types::{
        block::Block,
        data_types::ChainID,
        validator_set::ValidatorSet,
    },
    verification::VerifierPool,
};

/// Stores the user-defined parameters required to start the replica.
///
/// ## Chain ID
///
/// The chain ID is included in blocks, votes, and certificates so that replicas never mistake
/// messages meant for one blockchain for those of another. Operating a validator in two chains with
/// the same chain ID and the same key lets a peer replay its votes across them.
///
/// ## View timeouts
///
/// The timeout of a view is `base_view_timeout * timeout_backoff_factor^n`, capped at
/// `max_view_timeout`, where `n` is the number of consecutive views that ended without a QC.
///
/// ## Log Events
///
/// The crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.chain_id(...)`
    - `.log_events(...)`

    Optional:
    - `.signing_algorithm(...)`
    - `.commit_rule(...)`
    - `.base_view_timeout(...)`
    - `.max_view_timeout(...)`
    - `.timeout_backoff_factor(...)`
    - `.verification_workers(...)`
    - `.verification_queue_capacity(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the replica's signing key, used to sign votes and timeout votes. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the chain ID of the blockchain. Required."))]
    pub chain_id: ChainID,
    #[builder(default, setter(doc = "Set how strictly signatures are verified. Defaults to `Ed25519`."))]
    pub signing_algorithm: SigningAlgorithm,
    #[builder(default, setter(doc = "Set the rule for finalizing blocks. Defaults to `ThreeChain`."))]
    pub commit_rule: CommitRule,
    #[builder(
        default = Duration::from_secs(2),
        setter(doc = "Set the timeout of a view that follows a successful view. Defaults to 2 seconds.")
    )]
    pub base_view_timeout: Duration,
    #[builder(
        default = Duration::from_secs(60),
        setter(doc = "Set the upper bound of the view timeout. Defaults to 60 seconds.")
    )]
    pub max_view_timeout: Duration,
    #[builder(
        default = 2,
        setter(doc = "Set the factor the view timeout grows by after each view that times out. Defaults to 2.")
    )]
    pub timeout_backoff_factor: u32,
    #[builder(
        default = 2,
        setter(doc = "Set the number of threads that check vote signatures. Defaults to 2.")
    )]
    pub verification_workers: usize,
    #[builder(
        default = 1024,
        setter(doc = "Set how many votes can wait for verification before the algorithm thread checks them itself. Defaults to 1024.")
    )]
    pub verification_queue_capacity: usize,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

impl Configuration {
    fn pacemaker_config(&self) -> PacemakerConfiguration {
        PacemakerConfiguration {
            base_view_timeout: self.base_view_timeout,
            max_view_timeout: self.max_view_timeout,
            timeout_backoff_factor: self.timeout_backoff_factor,
        }
    }
}

/// Stores all necessary parameters and trait implementations required to run the [`Replica`].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ReplicaSpec]. On the builder call the following methods to construct a valid [ReplicaSpec].

    Required:
    - `.network(...)`
    - `.persister(...)`
    - `.payload_source(...)`
    - `.finalization_sink(...)`
    - `.validator_set(...)`
    - `.configuration(...)`

    Optional:
    - `.genesis(...)`
    - `.on_insert_block(...)`
    - `.on_finalize_block(...)`
    - `.on_prune_block(...)`
    - `.on_update_highest_qc(...)`
    - `.on_update_locked_qc(...)`
    - `.on_propose(...)`
    - `.on_vote(...)`
    - `.on_timeout_vote(...)`
    - `.on_receive_proposal(...)`
    - `.on_receive_vote(...)`
    - `.on_receive_timeout_vote(...)`
    - `.on_receive_certificate_sync(...)`
    - `.on_start_view(...)`
    - `.on_view_timeout(...)`
    - `.on_collect_qc(...)`
    - `.on_collect_tc(...)`
    - `.on_reject_input(...)`
    - `.on_safety_violation(...)`
    - `.on_halt(...)`
"))]
pub struct ReplicaSpec<
    N: Network + 'static,
    P: Persister,
    S: PayloadSource,
    F: FinalizationSink,
> {
    // Required parameters
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the durable store of the replica's safety data. The argument must implement the [Persister](crate::safety::pluggables::Persister) trait. Required."))]
    persister: P,
    #[builder(setter(doc = "Set the source of payloads for the blocks this replica proposes. Required."))]
    payload_source: S,
    #[builder(setter(doc = "Set the collaborator that is told about every finalized block. Use [FinalizationSinks](crate::app::FinalizationSinks) to notify several in a fixed order. Required."))]
    finalization_sink: F,
    #[builder(setter(doc = "Set the validators and their voting powers. Required."))]
    validator_set: ValidatorSet,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a replica. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(strip_option, doc = "Set the block the block tree is rooted at on a fresh start. Optional."))]
    genesis: Option<Block>,
    #[builder(default, setter(transform = |handler: impl Fn(&InsertBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InsertBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is inserted into the block tree. Optional."))]
    on_insert_block: Option<HandlerPtr<InsertBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FinalizeBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FinalizeBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is finalized. Optional."))]
    on_finalize_block: Option<HandlerPtr<FinalizeBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PruneBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PruneBlockEvent>),
    doc = "Register a handler closure to be invoked after a conflicting block is pruned from the block tree. Optional."))]
    on_prune_block: Option<HandlerPtr<PruneBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UpdateHighestQCEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UpdateHighestQCEvent>),
    doc = "Register a handler closure to be invoked after the replica updates its highest acknowledged QC. Optional."))]
    on_update_highest_qc: Option<HandlerPtr<UpdateHighestQCEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UpdateLockedQCEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UpdateLockedQCEvent>),
    doc = "Register a handler closure to be invoked after the replica updates its locked QC. Optional."))]
    on_update_locked_qc: Option<HandlerPtr<UpdateLockedQCEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a proposal. Optional."))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&VoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<VoteEvent>),
    doc = "Register a handler closure to be invoked after the replica votes. Optional."))]
    on_vote: Option<HandlerPtr<VoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TimeoutVoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TimeoutVoteEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a timeout vote. Optional."))]
    on_timeout_vote: Option<HandlerPtr<TimeoutVoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveProposalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveProposalEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a proposal. Optional."))]
    on_receive_proposal: Option<HandlerPtr<ReceiveProposalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveVoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveVoteEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a vote. Optional."))]
    on_receive_vote: Option<HandlerPtr<ReceiveVoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveTimeoutVoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveTimeoutVoteEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a timeout vote. Optional."))]
    on_receive_timeout_vote: Option<HandlerPtr<ReceiveTimeoutVoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveCertificateSyncEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveCertificateSyncEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a certificate from a peer helping it catch up. Optional."))]
    on_receive_certificate_sync: Option<HandlerPtr<ReceiveCertificateSyncEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartViewEvent>),
    doc = "Register a handler closure to be invoked after the replica enters a new view. Optional."))]
    on_start_view: Option<HandlerPtr<StartViewEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ViewTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ViewTimeoutEvent>),
    doc = "Register a handler closure to be invoked after the replica's view times out. Optional."))]
    on_view_timeout: Option<HandlerPtr<ViewTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CollectQCEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CollectQCEvent>),
    doc = "Register a handler closure to be invoked after the replica collects a new quorum certificate. Optional."))]
    on_collect_qc: Option<HandlerPtr<CollectQCEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CollectTCEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CollectTCEvent>),
    doc = "Register a handler closure to be invoked after the replica collects a new timeout certificate. Optional."))]
    on_collect_tc: Option<HandlerPtr<CollectTCEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RejectInputEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RejectInputEvent>),
    doc = "Register a handler closure to be invoked after the replica drops a malformed message. Optional."))]
    on_reject_input: Option<HandlerPtr<RejectInputEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SafetyViolationEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SafetyViolationEvent>),
    doc = "Register a handler closure to be invoked after the replica detects evidence of a faulty peer. Optional."))]
    on_safety_violation: Option<HandlerPtr<SafetyViolationEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&HaltEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<HaltEvent>),
    doc = "Register a handler closure to be invoked after the replica stops participating in consensus because of a local failure. Optional."))]
    on_halt: Option<HandlerPtr<HaltEvent>>,
}

impl<N, P, S, F> ReplicaSpec<N, P, S, F>
where
    N: Network + 'static,
    P: Persister,
    S: PayloadSource,
    F: FinalizationSink,
{
    /// Starts all threads and channels associated with running a replica, and returns the handles to
    /// them in a [`Replica`] struct.
    ///
    /// Fails if the stored safety data cannot be read, if the validator set has no voting power, or if
    /// the configured view timeouts are zero.
    pub fn start(mut self) -> Result<Replica, StartReplicaError> {
        let chain_id = self.configuration.chain_id;
        let genesis = self.genesis.take().unwrap_or_else(|| Block::genesis(chain_id));
        if genesis.chain_id != chain_id {
            return Err(StartReplicaError::GenesisChainMismatch {
                expected: chain_id,
                found: genesis.chain_id,
            });
        }

        // Absent safety data means this replica never voted.
        let safety_data = self
            .persister
            .load_safety_data()?
            .unwrap_or_else(|| SafetyData::new(&genesis));
        let state = ConsensusState::new(
            genesis,
            safety_data,
            self.validator_set.clone(),
            self.configuration.pacemaker_config(),
            self.configuration.commit_rule,
            Instant::now(),
        )?;

        self.network.init_validator_set(self.validator_set.clone());

        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            self.on_insert_block,
            self.on_finalize_block,
            self.on_prune_block,
            self.on_update_highest_qc,
            self.on_update_locked_qc,
            self.on_propose,
            self.on_vote,
            self.on_timeout_vote,
            self.on_receive_proposal,
            self.on_receive_vote,
            self.on_receive_timeout_vote,
            self.on_receive_certificate_sync,
            self.on_start_view,
            self.on_view_timeout,
            self.on_collect_qc,
            self.on_collect_tc,
            self.on_reject_input,
            self.on_safety_violation,
            self.on_halt,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };
        let (event_bus_shutdown, event_bus_shutdown_receiver) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };
        let event_bus = match (event_subscriber, event_bus_shutdown_receiver) {
            (Some(event_subscriber), Some(shutdown_signal)) => Some(start_event_bus(
                event_handlers,
                event_subscriber,
                shutdown_signal,
            )),
            _ => None,
        };

        let crypto = Ed25519Gateway::new(
            self.configuration.me.clone(),
            self.configuration.signing_algorithm,
        );

        let (inputs, input_queue) = mpsc::channel();
        let verifier_pool = VerifierPool::start(
            crypto.clone(),
            self.validator_set,
            self.configuration.verification_workers,
            self.configuration.verification_queue_capacity,
            inputs.clone(),
        );

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller = start_polling(
            self.network.clone(),
            inputs,
            verifier_pool.submitter(),
            poller_shutdown_receiver,
        );

        let event_handler = EventHandler::new(
            crypto,
            self.network,
            self.persister,
            self.payload_source,
            self.finalization_sink,
            event_publisher,
        );
        let (algorithm_shutdown, algorithm_shutdown_receiver) = mpsc::channel();
        let algorithm =
            Algorithm::new(state, event_handler, input_queue, algorithm_shutdown_receiver).start();

        Ok(Replica {
            poller: Some(poller),
            poller_shutdown,
            verifier_pool: Some(verifier_pool),
            algorithm: Some(algorithm),
            algorithm_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// Reasons [`ReplicaSpec::start`] can fail.
#[derive(Debug)]
pub enum StartReplicaError {
    Persistence(PersistenceError),
    Pacemaker(PacemakerError),
    GenesisChainMismatch { expected: ChainID, found: ChainID },
}

impl From<PersistenceError> for StartReplicaError {
    fn from(value: PersistenceError) -> Self {
        StartReplicaError::Persistence(value)
    }
}

impl From<PacemakerError> for StartReplicaError {
    fn from(value: PacemakerError) -> Self {
        StartReplicaError::Pacemaker(value)
    }
}

impl Display for StartReplicaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StartReplicaError::Persistence(err) => write!(f, "cannot load safety data: {}", err),
            StartReplicaError::Pacemaker(err) => write!(f, "cannot start pacemaker: {}", err),
            StartReplicaError::GenesisChainMismatch { expected, found } => write!(
                f,
                "genesis block is for chain {}, but the replica is configured for chain {}",
                found, expected
            ),
        }
    }
}

impl std::error::Error for StartReplicaError {}

/// A handle to the background threads of a replica. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct Replica {
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    verifier_pool: Option<VerifierPool>,
    algorithm: Option<JoinHandle<()>>,
    algorithm_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Drop for Replica {
    fn drop(&mut self) {
        // The order matters. The poller holds a handle to the verification pool, so it must stop
        // before the pool can drain. The algorithm thread publishes events until it stops, so the
        // event bus goes last.

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }

        if let Some(mut verifier_pool) = self.verifier_pool.take() {
            verifier_pool.shutdown();
        }

        let _ = self.algorithm_shutdown.send(());
        if let Some(algorithm) = self.algorithm.take() {
            let _ = algorithm.join();
        }

        if let Some(shutdown) = &self.event_bus_shutdown {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }
    }
}
