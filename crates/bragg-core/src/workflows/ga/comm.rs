use crate::engine::error::EngineError;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::{Arc, Barrier};

/// Point-to-point and collective messaging between a fixed group of worker threads.
///
/// Every ordered pair of ranks has its own channel, so messages between two ranks arrive in the
/// order they were sent regardless of traffic from other ranks.
pub struct Communicator<M> {
    rank: usize,
    size: usize,
    outgoing: Vec<Sender<M>>,
    incoming: Vec<Receiver<M>>,
    barrier: Arc<Barrier>,
}

impl<M: Clone + Send> Communicator<M> {
    /// One communicator per rank, indexed by rank.
    pub fn create(size: usize) -> Vec<Self> {
        let mut outgoing: Vec<Vec<Sender<M>>> =
            (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut incoming: Vec<Vec<Receiver<M>>> =
            (0..size).map(|_| Vec::with_capacity(size)).collect();
        for from in 0..size {
            for to in 0..size {
                let (tx, rx) = unbounded();
                outgoing[from].push(tx);
                incoming[to].push(rx);
            }
        }
        let barrier = Arc::new(Barrier::new(size.max(1)));
        outgoing
            .into_iter()
            .zip(incoming)
            .enumerate()
            .map(|(rank, (outgoing, incoming))| Self {
                rank,
                size,
                outgoing,
                incoming,
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn barrier(&self) {
        self.barrier.wait();
    }

    pub fn send(&self, to: usize, message: M) -> Result<(), EngineError> {
        let channel = self
            .outgoing
            .get(to)
            .ok_or_else(|| EngineError::Communication(format!("no rank {to}")))?;
        channel.send(message).map_err(|_| {
            EngineError::Communication(format!("rank {to} is no longer receiving"))
        })
    }

    pub fn recv(&self, from: usize) -> Result<M, EngineError> {
        let channel = self
            .incoming
            .get(from)
            .ok_or_else(|| EngineError::Communication(format!("no rank {from}")))?;
        channel
            .recv()
            .map_err(|_| EngineError::Communication(format!("rank {from} hung up")))
    }

    /// Delivers `message` from `root` to every rank. Only the root's `message` is used.
    pub fn broadcast(&self, root: usize, message: Option<M>) -> Result<M, EngineError> {
        if self.rank != root {
            return self.recv(root);
        }
        let message = message.ok_or_else(|| {
            EngineError::Communication(format!("root {root} has nothing to broadcast"))
        })?;
        for to in (0..self.size).filter(|&to| to != root) {
            self.send(to, message.clone())?;
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn gather_and_broadcast_across_threads() {
        let comms = Communicator::<usize>::create(4);
        let results: Vec<usize> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .iter()
                .map(|comm| {
                    scope.spawn(move || {
                        comm.barrier();
                        comm.send(0, comm.rank() * 10).unwrap();
                        if comm.rank() == 0 {
                            let sum = (0..comm.size()).map(|r| comm.recv(r).unwrap()).sum();
                            comm.broadcast(0, Some(sum)).unwrap()
                        } else {
                            comm.broadcast(0, None).unwrap()
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, vec![60; 4]);
    }

    #[test]
    fn messages_between_a_pair_keep_their_order() {
        let comms = Communicator::<u8>::create(2);
        for value in 0..5 {
            comms[1].send(0, value).unwrap();
        }
        let received: Vec<u8> = (0..5).map(|_| comms[0].recv(1).unwrap()).collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn broadcast_root_without_payload_is_an_error() {
        let comms = Communicator::<u8>::create(1);
        assert!(matches!(
            comms[0].broadcast(0, None),
            Err(EngineError::Communication(_))
        ));
    }
}
