/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The algorithm thread: the single consumer of a replica's input queue.
//!
//! The algorithm thread owns the replica's [`ConsensusState`] and its [`EventHandler`]. It is the
//! only thread that ever touches either, so every state transition happens in the order in which
//! inputs come off the queue. The poller thread and the verification pool only ever push onto the
//! queue.
//!
//! ## The loop
//!
//! After [entering](EventHandler::start) the starting view, the thread repeats the following until
//! it receives a shutdown signal:
//! 1. Let the event handler [process its own proposal](EventHandler::resume), if it has one.
//! 2. Wait for the next input, but no longer than until the pacemaker's deadline (and never longer
//!    than [`POLL_INTERVAL`], so that shutdown signals are noticed promptly).
//! 3. Hand the input to the event handler.
//! 4. If the deadline has passed, hand the event handler an [`Input::TimeoutFired`].
//!
//! Once the event handler halts after a fatal local failure, the thread keeps draining the queue so
//! that its producers never block, but processes nothing until it is shut down.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    app::{FinalizationSink, PayloadSource},
    crypto::CryptoGateway,
    event_handler::{ConsensusState, EventHandler, EventHandlerError, Input},
    networking::network::Network,
    safety::pluggables::Persister,
};

/// Upper bound on how long the thread waits for an input before checking for a shutdown signal.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct Algorithm<
    N: Network + 'static,
    C: CryptoGateway,
    P: Persister,
    S: PayloadSource,
    F: FinalizationSink,
> {
    state: ConsensusState,
    event_handler: EventHandler<N, C, P, S, F>,
    inputs: Receiver<Input>,
    shutdown_signal: Receiver<()>,
}

impl<N, C, P, S, F> Algorithm<N, C, P, S, F>
where
    N: Network + 'static,
    C: CryptoGateway,
    P: Persister,
    S: PayloadSource,
    F: FinalizationSink,
{
    pub(crate) fn new(
        state: ConsensusState,
        event_handler: EventHandler<N, C, P, S, F>,
        inputs: Receiver<Input>,
        shutdown_signal: Receiver<()>,
    ) -> Self {
        Self {
            state,
            event_handler,
            inputs,
            shutdown_signal,
        }
    }

    /// Start the algorithm thread.
    pub(crate) fn start(self) -> JoinHandle<()> {
        thread::spawn(move || self.execute())
    }

    fn execute(mut self) {
        let _ = self.event_handler.start(&mut self.state, Instant::now());

        loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => (),
            }

            if !self.state.is_halted() && self.event_handler.has_deferred() {
                let result = self.event_handler.resume(&mut self.state, Instant::now());
                self.on_result(result);
            }

            let wait = if self.state.is_halted() {
                POLL_INTERVAL
            } else if self.event_handler.has_deferred() {
                Duration::ZERO
            } else {
                let deadline = self.state.pacemaker().view_info().deadline;
                deadline
                    .saturating_duration_since(Instant::now())
                    .min(POLL_INTERVAL)
            };

            match self.inputs.recv_timeout(wait) {
                Ok(input) => self.handle(input),
                Err(RecvTimeoutError::Timeout) => (),
                // The producers are gone, but the replica may still time out and make progress
                // through its own messages until it is shut down.
                Err(RecvTimeoutError::Disconnected) => thread::sleep(wait),
            }

            if !self.state.is_halted() && self.state.pacemaker().is_timed_out(Instant::now()) {
                self.handle(Input::TimeoutFired);
            }
        }
    }

    fn handle(&mut self, input: Input) {
        let result = self.event_handler.handle(&mut self.state, input, Instant::now());
        self.on_result(result);
    }

    fn on_result(&self, result: Result<(), EventHandlerError>) {
        match result {
            Ok(()) | Err(EventHandlerError::Halted) => (),
            // Already reported through a Halt event.
            Err(EventHandlerError::Fatal(failure)) => {
                log::debug!("Algorithm thread idling after: {}", failure)
            }
        }
    }
}
