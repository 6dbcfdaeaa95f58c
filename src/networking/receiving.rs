/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions for receiving messages from the P2P network.

use std::{
    sync::mpsc::{Receiver, Sender, TryRecvError},
    thread::{self, JoinHandle},
};

use crate::{
    event_handler::Input,
    hotstuff::messages::HotStuffMessage,
    verification::VoteSubmitter,
};

use super::{messages::Message, network::Network};

/// Spawn the poller thread, which polls the [`Network`] for messages and feeds them into the
/// algorithm thread's input queue.
///
/// Votes take a detour: they are handed to the verification pool through `verifier`, which pushes
/// them into the input queue once their signatures are checked. If there is no pool, or its queue is
/// full, votes go into the input queue unverified and the algorithm thread checks them itself.
///
/// The thread exits when it receives a shutdown signal, or when the input queue is closed.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    inputs: Sender<Input>,
    verifier: Option<VoteSubmitter>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        if let Some((origin, msg)) = network.recv() {
            let input = match (msg, &verifier) {
                (Message::HotStuffMessage(HotStuffMessage::Vote(vote)), Some(verifier)) => {
                    match verifier.submit(origin, vote) {
                        Ok(()) => continue,
                        Err(vote) => Input::Vote { origin, vote },
                    }
                }
                (msg, _) => Input::from_message(origin, msg),
            };
            if inputs.send(input).is_err() {
                return;
            }
        } else {
            thread::yield_now()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{CryptoGateway, Ed25519Gateway, SigningAlgorithm},
        hotstuff::messages::Vote,
        networking::messages::Message,
        types::{
            crypto_primitives::{SigningKey, VerifyingKey},
            data_types::{ChainID, CryptoHash, ViewNumber},
            validator_set::ValidatorSet,
        },
    };
    use std::{
        collections::VecDeque,
        sync::{mpsc, Arc, Mutex},
        time::Duration,
    };

    #[derive(Clone)]
    struct QueueNetwork {
        inbox: Arc<Mutex<VecDeque<(VerifyingKey, Message)>>>,
    }

    impl Network for QueueNetwork {
        fn init_validator_set(&mut self, _: ValidatorSet) {}
        fn broadcast(&mut self, _: Message) {}
        fn send(&mut self, _: VerifyingKey, _: Message) {}
        fn recv(&mut self) -> Option<(VerifyingKey, Message)> {
            self.inbox.lock().unwrap().pop_front()
        }
    }

    #[test]
    fn votes_fall_back_to_the_input_queue_without_a_verifier() {
        let voter = Ed25519Gateway::new(SigningKey::from_bytes(&[9; 32]), SigningAlgorithm::Ed25519);
        let vote = Vote::new(&voter, ChainID::new(0), ViewNumber::new(1), CryptoHash::new([0; 32])).unwrap();
        let network = QueueNetwork {
            inbox: Arc::new(Mutex::new(VecDeque::from(vec![(
                voter.public_key(),
                Message::from(vote.clone()),
            )]))),
        };

        let (inputs, input_queue) = mpsc::channel();
        let (shutdown, shutdown_signal) = mpsc::channel();
        let poller = start_polling(network, inputs, None, shutdown_signal);

        match input_queue.recv_timeout(Duration::from_secs(5)) {
            Ok(Input::Vote { origin, vote: received }) => {
                assert_eq!(origin, voter.public_key());
                assert_eq!(received, vote);
            }
            _ => panic!("expected an unverified vote"),
        }

        shutdown.send(()).unwrap();
        poller.join().unwrap();
    }
}
