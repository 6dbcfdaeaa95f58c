/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bounded pool of threads that check vote signatures off the algorithm thread.
//!
//! The poller thread submits every received [`Vote`] to the pool's work queue. A fixed number of
//! worker threads take votes off the queue, check them against the validator set with the
//! [`CryptoGateway`], and push the result back into the algorithm thread's input queue as either
//! [`Input::VerifiedVote`] or [`Input::InvalidVote`]. Checking a signature reads nothing but the
//! vote and the validator set, so workers never touch [`ConsensusState`](crate::event_handler::ConsensusState).
//!
//! The work queue is a `sync_channel` with a fixed capacity. When it is full, [`VoteSubmitter::submit`]
//! hands the vote back so that the caller can let the algorithm thread check it inline instead.
//!
//! Shutting the pool down closes the work queue and joins every worker. Workers finish the jobs that
//! are already queued before they exit.

use std::{
    sync::{
        mpsc::{self, Receiver, Sender, SyncSender, TrySendError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use ed25519_dalek::VerifyingKey;

use crate::{
    crypto::CryptoGateway,
    event_handler::Input,
    hotstuff::messages::Vote,
    types::{
        signed_messages::{SignedMessage, Verified},
        validator_set::ValidatorSet,
    },
};

struct VerificationJob {
    origin: VerifyingKey,
    vote: Vote,
}

/// Handle for submitting votes to a [`VerifierPool`].
#[derive(Clone)]
pub(crate) struct VoteSubmitter {
    jobs: SyncSender<VerificationJob>,
}

impl VoteSubmitter {
    /// Queue `vote` for verification. Returns the vote back if the queue is full or the pool has shut
    /// down.
    pub(crate) fn submit(&self, origin: VerifyingKey, vote: Vote) -> Result<(), Vote> {
        self.jobs
            .try_send(VerificationJob { origin, vote })
            .map_err(|err| match err {
                TrySendError::Full(job) | TrySendError::Disconnected(job) => job.vote,
            })
    }
}

pub(crate) struct VerifierPool {
    jobs: Option<SyncSender<VerificationJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl VerifierPool {
    /// Start `workers` worker threads that share a work queue holding up to `queue_capacity` votes.
    /// Verdicts are sent to `results`.
    pub(crate) fn start<C: CryptoGateway>(
        crypto: C,
        validator_set: ValidatorSet,
        workers: usize,
        queue_capacity: usize,
        results: Sender<Input>,
    ) -> VerifierPool {
        let (jobs, queue) = mpsc::sync_channel(queue_capacity);
        let queue = Arc::new(Mutex::new(queue));
        let validator_set = Arc::new(validator_set);

        let workers = (0..workers.max(1))
            .map(|_| {
                start_worker(
                    crypto.clone(),
                    validator_set.clone(),
                    queue.clone(),
                    results.clone(),
                )
            })
            .collect();

        VerifierPool {
            jobs: Some(jobs),
            workers,
        }
    }

    /// Get a handle for submitting votes, or `None` if the pool has shut down.
    pub(crate) fn submitter(&self) -> Option<VoteSubmitter> {
        self.jobs.as_ref().map(|jobs| VoteSubmitter { jobs: jobs.clone() })
    }

    /// Close the work queue and wait for every worker to drain it and exit.
    ///
    /// Workers only exit once every [`VoteSubmitter`] is dropped too, so drop those first.
    pub(crate) fn shutdown(&mut self) {
        self.jobs = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for VerifierPool {
    fn drop(&mut self) {
        self.shutdown()
    }
}

fn start_worker<C: CryptoGateway>(
    crypto: C,
    validator_set: Arc<ValidatorSet>,
    queue: Arc<Mutex<Receiver<VerificationJob>>>,
    results: Sender<Input>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        // Hold the lock only while taking a job, so that workers check signatures concurrently.
        let job = match queue.lock() {
            Ok(queue) => queue.recv(),
            Err(_) => return,
        };
        let VerificationJob { origin, vote } = match job {
            Ok(job) => job,
            Err(_) => return,
        };

        let verdict = match validator_set.get_by_bytes(&vote.voter) {
            Some(signer) if vote.is_correct(&crypto, signer) => Input::VerifiedVote {
                origin,
                vote: Verified::new(vote),
            },
            _ => Input::InvalidVote { origin, vote },
        };
        if results.send(verdict).is_err() {
            return;
        }
    })
}
