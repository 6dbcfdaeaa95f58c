/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which fires the handlers registered for each [`Event`].

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// How long the event bus waits for an event before checking for shutdown again.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handler lists, one per event type. Handlers for the same event type fire in the order they were
/// registered: the built-in logger (if enabled) first, then the user's handler.
#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) insert_block_handlers: Vec<HandlerPtr<InsertBlockEvent>>,
    pub(crate) finalize_block_handlers: Vec<HandlerPtr<FinalizeBlockEvent>>,
    pub(crate) prune_block_handlers: Vec<HandlerPtr<PruneBlockEvent>>,
    pub(crate) update_highest_qc_handlers: Vec<HandlerPtr<UpdateHighestQCEvent>>,
    pub(crate) update_locked_qc_handlers: Vec<HandlerPtr<UpdateLockedQCEvent>>,
    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) vote_handlers: Vec<HandlerPtr<VoteEvent>>,
    pub(crate) timeout_vote_handlers: Vec<HandlerPtr<TimeoutVoteEvent>>,
    pub(crate) receive_proposal_handlers: Vec<HandlerPtr<ReceiveProposalEvent>>,
    pub(crate) receive_vote_handlers: Vec<HandlerPtr<ReceiveVoteEvent>>,
    pub(crate) receive_timeout_vote_handlers: Vec<HandlerPtr<ReceiveTimeoutVoteEvent>>,
    pub(crate) receive_certificate_sync_handlers: Vec<HandlerPtr<ReceiveCertificateSyncEvent>>,
    pub(crate) start_view_handlers: Vec<HandlerPtr<StartViewEvent>>,
    pub(crate) view_timeout_handlers: Vec<HandlerPtr<ViewTimeoutEvent>>,
    pub(crate) collect_qc_handlers: Vec<HandlerPtr<CollectQCEvent>>,
    pub(crate) collect_tc_handlers: Vec<HandlerPtr<CollectTCEvent>>,
    pub(crate) reject_input_handlers: Vec<HandlerPtr<RejectInputEvent>>,
    pub(crate) safety_violation_handlers: Vec<HandlerPtr<SafetyViolationEvent>>,
    pub(crate) halt_handlers: Vec<HandlerPtr<HaltEvent>>,
}

fn register<T: Logger>(handlers: &mut Vec<HandlerPtr<T>>, log_events: bool, user_handler: Option<HandlerPtr<T>>) {
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(handler) = user_handler {
        handlers.push(handler);
    }
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        insert_block_handler: Option<HandlerPtr<InsertBlockEvent>>,
        finalize_block_handler: Option<HandlerPtr<FinalizeBlockEvent>>,
        prune_block_handler: Option<HandlerPtr<PruneBlockEvent>>,
        update_highest_qc_handler: Option<HandlerPtr<UpdateHighestQCEvent>>,
        update_locked_qc_handler: Option<HandlerPtr<UpdateLockedQCEvent>>,
        propose_handler: Option<HandlerPtr<ProposeEvent>>,
        vote_handler: Option<HandlerPtr<VoteEvent>>,
        timeout_vote_handler: Option<HandlerPtr<TimeoutVoteEvent>>,
        receive_proposal_handler: Option<HandlerPtr<ReceiveProposalEvent>>,
        receive_vote_handler: Option<HandlerPtr<ReceiveVoteEvent>>,
        receive_timeout_vote_handler: Option<HandlerPtr<ReceiveTimeoutVoteEvent>>,
        receive_certificate_sync_handler: Option<HandlerPtr<ReceiveCertificateSyncEvent>>,
        start_view_handler: Option<HandlerPtr<StartViewEvent>>,
        view_timeout_handler: Option<HandlerPtr<ViewTimeoutEvent>>,
        collect_qc_handler: Option<HandlerPtr<CollectQCEvent>>,
        collect_tc_handler: Option<HandlerPtr<CollectTCEvent>>,
        reject_input_handler: Option<HandlerPtr<RejectInputEvent>>,
        safety_violation_handler: Option<HandlerPtr<SafetyViolationEvent>>,
        halt_handler: Option<HandlerPtr<HaltEvent>>,
    ) -> EventHandlers {
        let mut handlers = EventHandlers::default();
        register(&mut handlers.insert_block_handlers, log_events, insert_block_handler);
        register(&mut handlers.finalize_block_handlers, log_events, finalize_block_handler);
        register(&mut handlers.prune_block_handlers, log_events, prune_block_handler);
        register(&mut handlers.update_highest_qc_handlers, log_events, update_highest_qc_handler);
        register(&mut handlers.update_locked_qc_handlers, log_events, update_locked_qc_handler);
        register(&mut handlers.propose_handlers, log_events, propose_handler);
        register(&mut handlers.vote_handlers, log_events, vote_handler);
        register(&mut handlers.timeout_vote_handlers, log_events, timeout_vote_handler);
        register(&mut handlers.receive_proposal_handlers, log_events, receive_proposal_handler);
        register(&mut handlers.receive_vote_handlers, log_events, receive_vote_handler);
        register(&mut handlers.receive_timeout_vote_handlers, log_events, receive_timeout_vote_handler);
        register(&mut handlers.receive_certificate_sync_handlers, log_events, receive_certificate_sync_handler);
        register(&mut handlers.start_view_handlers, log_events, start_view_handler);
        register(&mut handlers.view_timeout_handlers, log_events, view_timeout_handler);
        register(&mut handlers.collect_qc_handlers, log_events, collect_qc_handler);
        register(&mut handlers.collect_tc_handlers, log_events, collect_tc_handler);
        register(&mut handlers.reject_input_handlers, log_events, reject_input_handler);
        register(&mut handlers.safety_violation_handlers, log_events, safety_violation_handler);
        register(&mut handlers.halt_handlers, log_events, halt_handler);
        handlers
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.insert_block_handlers.is_empty()
            && self.finalize_block_handlers.is_empty()
            && self.prune_block_handlers.is_empty()
            && self.update_highest_qc_handlers.is_empty()
            && self.update_locked_qc_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.vote_handlers.is_empty()
            && self.timeout_vote_handlers.is_empty()
            && self.receive_proposal_handlers.is_empty()
            && self.receive_vote_handlers.is_empty()
            && self.receive_timeout_vote_handlers.is_empty()
            && self.receive_certificate_sync_handlers.is_empty()
            && self.start_view_handlers.is_empty()
            && self.view_timeout_handlers.is_empty()
            && self.collect_qc_handlers.is_empty()
            && self.collect_tc_handlers.is_empty()
            && self.reject_input_handlers.is_empty()
            && self.safety_violation_handlers.is_empty()
            && self.halt_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        fn fire<T>(handlers: &[HandlerPtr<T>], event: &T) {
            handlers.iter().for_each(|handler| handler(event))
        }

        match event {
            Event::InsertBlock(event) => fire(&self.insert_block_handlers, &event),
            Event::FinalizeBlock(event) => fire(&self.finalize_block_handlers, &event),
            Event::PruneBlock(event) => fire(&self.prune_block_handlers, &event),
            Event::UpdateHighestQC(event) => fire(&self.update_highest_qc_handlers, &event),
            Event::UpdateLockedQC(event) => fire(&self.update_locked_qc_handlers, &event),
            Event::Propose(event) => fire(&self.propose_handlers, &event),
            Event::Vote(event) => fire(&self.vote_handlers, &event),
            Event::TimeoutVote(event) => fire(&self.timeout_vote_handlers, &event),
            Event::ReceiveProposal(event) => fire(&self.receive_proposal_handlers, &event),
            Event::ReceiveVote(event) => fire(&self.receive_vote_handlers, &event),
            Event::ReceiveTimeoutVote(event) => fire(&self.receive_timeout_vote_handlers, &event),
            Event::ReceiveCertificateSync(event) => {
                fire(&self.receive_certificate_sync_handlers, &event)
            }
            Event::StartView(event) => fire(&self.start_view_handlers, &event),
            Event::ViewTimeout(event) => fire(&self.view_timeout_handlers, &event),
            Event::CollectQC(event) => fire(&self.collect_qc_handlers, &event),
            Event::CollectTC(event) => fire(&self.collect_tc_handlers, &event),
            Event::RejectInput(event) => fire(&self.reject_input_handlers, &event),
            Event::SafetyViolation(event) => fire(&self.safety_violation_handlers, &event),
            Event::Halt(event) => fire(&self.halt_handlers, &event),
        }
    }
}

/// Spawn the event bus thread, which fires handlers for every event received from
/// `event_subscriber` until it receives a shutdown signal.
///
/// Events still queued when the shutdown signal arrives are fired before the thread exits.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                event_subscriber
                    .try_iter()
                    .for_each(|event| event_handlers.fire_handlers(event));
                return;
            }
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // All publishers are gone. Wait for the shutdown signal.
            Err(RecvTimeoutError::Disconnected) => {
                let _ = shutdown_signal.recv();
                return;
            }
        }
    })
}
