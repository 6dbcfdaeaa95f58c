/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of the Pacemaker.
//!
//! Main type: [`Pacemaker`].

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    time::{Duration, Instant},
};

use crate::{
    crypto::{CryptoError, CryptoGateway},
    hotstuff::types::QuorumCertificate,
    pacemaker::{messages::TimeoutVote, types::{TimeoutCertificate, TimeoutVoteCollector}},
    types::{
        collectors::{Collected, Collector},
        crypto_primitives::VerifyingKey,
        data_types::{ChainID, ViewNumber},
        signed_messages::{SignedMessage, Verified},
        validator_set::ValidatorSet,
    },
};

/// How far above the current view a timeout vote's view may be for the vote to be collected.
pub const TIMEOUT_VIEWS_AHEAD: u64 = 2;

/// Timing parameters of the [`Pacemaker`].
///
/// The timeout of a view is `min(base_view_timeout * timeout_backoff_factor^n, max_view_timeout)`,
/// where `n` is the number of consecutive views that ended with a timeout certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacemakerConfiguration {
    pub base_view_timeout: Duration,
    pub max_view_timeout: Duration,
    pub timeout_backoff_factor: u32,
}

impl Default for PacemakerConfiguration {
    fn default() -> Self {
        Self {
            base_view_timeout: Duration::from_secs(2),
            max_view_timeout: Duration::from_secs(60),
            timeout_backoff_factor: 2,
        }
    }
}

/// Immutable snapshot of the Pacemaker's state: the current view and when it times out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewInfo {
    pub view: ViewNumber,
    pub deadline: Instant,
}

impl ViewInfo {
    /// Create a new `ViewInfo` instance containing the provided parameters.
    pub(crate) fn new(view: ViewNumber, deadline: Instant) -> Self {
        Self { view, deadline }
    }

    /// Return a given [`ViewInfo`] with updated deadline.
    pub(crate) fn with_new_deadline(&self, new_deadline: Instant) -> Self {
        Self {
            view: self.view,
            deadline: new_deadline,
        }
    }
}

/// What moved the Pacemaker into a new view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewChangeReason {
    QuorumCertificate,
    TimeoutCertificate,
}

/// Returned by [`Pacemaker::on_qc_formed`] and [`Pacemaker::on_tc_formed`] when the current view
/// advanced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewChange {
    pub previous: ViewNumber,
    pub new: ViewNumber,
    pub reason: ViewChangeReason,
}

/// What happened to a timeout vote handed to [`Pacemaker::collect_timeout_vote`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectTimeoutOutcome {
    Stored,
    Duplicate,
    FormedTC(TimeoutCertificate),
    AlreadyCertified,
    InvalidSignature,
    NotAValidator,

    /// The timeout vote is for a view older than the current view.
    Stale,

    /// The timeout vote is for a view more than [`TIMEOUT_VIEWS_AHEAD`] views above the current
    /// view. It is not collected.
    TooFarAhead,

    WrongChain,
}

/// Owner of the current view and of view-change timing.
///
/// The Pacemaker is the only component that moves the current view, and it only ever moves it
/// forward: to `qc.view + 1` on a QC and to `tc.view + 1` on a TC. A timeout on its own never
/// advances the view. It only produces a timeout vote and re-arms the deadline, so that the vote is
/// re-broadcast if no certificate shows up.
pub struct Pacemaker {
    config: PacemakerConfiguration,
    chain_id: ChainID,
    validator_set: ValidatorSet,
    view_info: ViewInfo,
    consecutive_timeouts: u32,
    last_view_tc: Option<TimeoutCertificate>,
    timeout_collectors: BTreeMap<ViewNumber, TimeoutVoteCollector>,
}

impl Pacemaker {
    /// Create a `Pacemaker` in `start_view`, whose first deadline is one base timeout after `now`.
    pub fn new(
        config: PacemakerConfiguration,
        chain_id: ChainID,
        validator_set: ValidatorSet,
        start_view: ViewNumber,
        now: Instant,
    ) -> Result<Self, PacemakerError> {
        if validator_set.total_power().int() == 0 {
            return Err(PacemakerError::NoVotingPower);
        }
        if config.timeout_backoff_factor == 0 || config.base_view_timeout.is_zero() {
            return Err(PacemakerError::InvalidTimeouts);
        }

        Ok(Self {
            view_info: ViewInfo::new(start_view, now + config.base_view_timeout.min(config.max_view_timeout)),
            config,
            chain_id,
            validator_set,
            consecutive_timeouts: 0,
            last_view_tc: None,
            timeout_collectors: BTreeMap::new(),
        })
    }

    pub fn current_view(&self) -> ViewNumber {
        self.view_info.view
    }

    /// Query the Pacemaker for its current `ViewInfo`.
    pub fn view_info(&self) -> &ViewInfo {
        &self.view_info
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now >= self.view_info.deadline
    }

    /// Get the timeout of the current view, taking the backoff into account.
    pub fn view_timeout(&self) -> Duration {
        self.config
            .timeout_backoff_factor
            .checked_pow(self.consecutive_timeouts)
            .and_then(|factor| self.config.base_view_timeout.checked_mul(factor))
            .map_or(self.config.max_view_timeout, |timeout| {
                timeout.min(self.config.max_view_timeout)
            })
    }

    /// Get the leader of `view`.
    pub fn leader(&self, view: ViewNumber) -> VerifyingKey {
        select_leader(view, &self.validator_set)
    }

    /// Get the timeout certificate through which the current view was entered, if any.
    pub fn last_view_tc(&self) -> Option<&TimeoutCertificate> {
        self.last_view_tc.as_ref()
    }

    /// Move to `qc.view + 1` if `qc.view` is not behind the current view, resetting the backoff.
    pub fn on_qc_formed(&mut self, qc: &QuorumCertificate, now: Instant) -> Option<ViewChange> {
        if qc.view < self.view_info.view {
            return None;
        }
        self.consecutive_timeouts = 0;
        self.last_view_tc = None;
        Some(self.enter_view(qc.view + 1, ViewChangeReason::QuorumCertificate, now))
    }

    /// Move to `tc.view + 1` if `tc.view` is not behind the current view, growing the backoff.
    pub fn on_tc_formed(&mut self, tc: &TimeoutCertificate, now: Instant) -> Option<ViewChange> {
        if tc.view < self.view_info.view {
            return None;
        }
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
        self.last_view_tc = Some(tc.clone());
        Some(self.enter_view(tc.view + 1, ViewChangeReason::TimeoutCertificate, now))
    }

    /// Sign a timeout vote for the current view carrying `highest_qc`, and re-arm the deadline.
    pub fn on_timeout<C: CryptoGateway>(
        &mut self,
        highest_qc: &QuorumCertificate,
        crypto: &C,
        now: Instant,
    ) -> Result<TimeoutVote, CryptoError> {
        let timeout_vote = TimeoutVote::new(
            crypto,
            self.chain_id,
            self.view_info.view,
            highest_qc.clone(),
        )?;
        self.view_info = self.view_info.with_new_deadline(now + self.view_timeout());
        Ok(timeout_vote)
    }

    /// Verify and collect a timeout vote. The caller is responsible for validating
    /// `timeout_vote.highest_qc`.
    ///
    /// Collectors are kept only for the current view and the [`TIMEOUT_VIEWS_AHEAD`] views above it.
    pub fn collect_timeout_vote<C: CryptoGateway>(
        &mut self,
        timeout_vote: TimeoutVote,
        crypto: &C,
    ) -> Result<CollectTimeoutOutcome, CryptoError> {
        let signer = match self.validator_set.get_by_bytes(&timeout_vote.voter) {
            Some(signer) => *signer,
            None => return Ok(CollectTimeoutOutcome::NotAValidator),
        };
        if !timeout_vote.is_correct(crypto, &signer) {
            return Ok(CollectTimeoutOutcome::InvalidSignature);
        }
        self.collect_verified_timeout_vote(Verified::new(timeout_vote), crypto)
    }

    fn collect_verified_timeout_vote<C: CryptoGateway>(
        &mut self,
        timeout_vote: Verified<TimeoutVote>,
        crypto: &C,
    ) -> Result<CollectTimeoutOutcome, CryptoError> {
        let timeout_vote = timeout_vote.into_inner();
        if timeout_vote.chain_id != self.chain_id {
            return Ok(CollectTimeoutOutcome::WrongChain);
        }
        if timeout_vote.view < self.view_info.view {
            return Ok(CollectTimeoutOutcome::Stale);
        }
        if timeout_vote.view > self.view_info.view + TIMEOUT_VIEWS_AHEAD {
            return Ok(CollectTimeoutOutcome::TooFarAhead);
        }
        let signer = match self.validator_set.get_by_bytes(&timeout_vote.voter) {
            Some(signer) => *signer,
            None => return Ok(CollectTimeoutOutcome::NotAValidator),
        };

        let chain_id = self.chain_id;
        let validator_set = &self.validator_set;
        let collector = self
            .timeout_collectors
            .entry(timeout_vote.view)
            .or_insert_with(|| {
                TimeoutVoteCollector::new(chain_id, timeout_vote.view, validator_set.clone())
            });

        let outcome = match collector.collect(&signer, timeout_vote, crypto)? {
            Collected::Stored => CollectTimeoutOutcome::Stored,
            Collected::Duplicate | Collected::Conflicting(_) => CollectTimeoutOutcome::Duplicate,
            Collected::Certified(tc) => CollectTimeoutOutcome::FormedTC(tc),
            Collected::AlreadyCertified => CollectTimeoutOutcome::AlreadyCertified,
        };
        Ok(outcome)
    }

    fn enter_view(&mut self, view: ViewNumber, reason: ViewChangeReason, now: Instant) -> ViewChange {
        let previous = self.view_info.view;
        self.view_info = ViewInfo::new(view, now + self.view_timeout());
        self.timeout_collectors = self.timeout_collectors.split_off(&view);
        ViewChange {
            previous,
            new: view,
            reason,
        }
    }
}

/// Reasons a [`Pacemaker`] cannot be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacemakerError {
    /// The validator set has no members, or all of its members have zero power.
    NoVotingPower,

    /// The base timeout is zero, or the backoff factor is zero.
    InvalidTimeouts,
}

impl Display for PacemakerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PacemakerError::NoVotingPower => write!(f, "validator set has no voting power"),
            PacemakerError::InvalidTimeouts => write!(f, "view timeouts must be positive"),
        }
    }
}

impl std::error::Error for PacemakerError {}

/// Deterministically select a replica in `validator_set` to become the leader of `view` using the
/// [Interleaved WRR](https://en.wikipedia.org/wiki/Weighted_round_robin#Interleaved_WRR) algorithm.
///
/// # Panics
///
/// `validator_set` must have a non-zero total power. [`Pacemaker::new`] checks this.
pub fn select_leader(view: ViewNumber, validator_set: &ValidatorSet) -> VerifyingKey {
    let validators_and_powers = validator_set.validators_and_powers();
    // Length of the abstract array.
    let p_total = validator_set.total_power().int();
    // Index in the abstract array.
    let index = (view.int() as u128) % p_total;
    // Max. power among the validators.
    let p_max = validators_and_powers
        .iter()
        .map(|(_, power)| power.int())
        .max()
        .unwrap_or(0);

    let mut counter = 0;

    // Search for a validator at given index in the abstract array of leaders.
    for threshold in 1..=p_max {
        for (validator, power) in &validators_and_powers {
            if power.int() >= threshold {
                if counter == index {
                    return *validator;
                }
                counter += 1
            }
        }
    }

    unreachable!("Cannot select a leader: validator set has no voting power")
}
