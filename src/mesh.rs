//! In-memory substrate: every peer is a thread, every channel a crossbeam
//! queue.
//!
//! This is the substrate used by the test suite and by single-host runs
//! that emulate a distributed job, in the same spirit as running one peer
//! per thread under an MPI shim. Delivery is reliable and FIFO per
//! (sender, channel) pair, which is exactly the contract
//! [`Substrate`](crate::substrate::Substrate) asks for.

use std::collections::VecDeque;

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::comm::Comm;
use crate::error::{CommError, SubstrateError};
use crate::substrate::{Channel, Substrate};

type Packet = (u32, Vec<u8>);

/// One peer's attachment to an in-memory mesh. Created in bulk by
/// [`create`] or [`with_nodes`] and moved into the peer's thread.
pub struct MeshEndpoint {
    rank: usize,
    size: usize,
    node_width: usize,
    tx: Vec<[Sender<Packet>; Channel::COUNT]>,
    rx: [Receiver<Packet>; Channel::COUNT],
    stash: [VecDeque<Packet>; Channel::COUNT],
    unpolled_sends: [usize; Channel::COUNT],
}

/// Builds a fully connected mesh of `peers` endpoints on a single node.
pub fn create(peers: usize) -> Vec<MeshEndpoint> {
    with_nodes(1, peers)
}

/// Builds a mesh of `nodes * node_width` peers blocked onto `nodes` nodes,
/// for exercising locality-aware routing on one host.
pub fn with_nodes(nodes: usize, node_width: usize) -> Vec<MeshEndpoint> {
    assert!(nodes > 0 && node_width > 0, "mesh must have peers");
    let size = nodes * node_width;

    let mut txs = Vec::with_capacity(size);
    let mut rxs = Vec::with_capacity(size);
    for _ in 0..size {
        let (user_tx, user_rx) = unbounded();
        let (barrier_tx, barrier_rx) = unbounded();
        let (collective_tx, collective_rx) = unbounded();
        txs.push([user_tx, barrier_tx, collective_tx]);
        rxs.push([user_rx, barrier_rx, collective_rx]);
    }

    rxs.into_iter()
        .enumerate()
        .map(|(rank, rx)| MeshEndpoint {
            rank,
            size,
            node_width,
            tx: txs.clone(),
            rx,
            stash: Default::default(),
            unpolled_sends: [0; Channel::COUNT],
        })
        .collect()
}

/// Runs `f` once per peer, each on its own thread with its own
/// communicator, and joins them all. This is the process-launch analogue
/// for in-memory jobs; the communicator's final barrier runs when `f`
/// returns and the communicator drops.
pub fn launch<F>(peers: usize, f: F) -> Result<(), CommError>
where
    F: Fn(&Comm) -> Result<(), CommError> + Send + Sync,
{
    std::thread::scope(|scope| {
        let handles: Vec<_> = create(peers)
            .into_iter()
            .map(|endpoint| {
                let f = &f;
                scope.spawn(move || -> Result<(), CommError> {
                    let comm = Comm::new(endpoint)?;
                    f(&comm)
                })
            })
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        Ok(())
    })
}

impl MeshEndpoint {
    fn stashed(&mut self, from: usize, channel: Channel) -> Option<Vec<u8>> {
        let stash = &mut self.stash[channel.index()];
        let at = stash.iter().position(|(src, _)| *src as usize == from)?;
        stash.remove(at).map(|(_, bytes)| bytes)
    }
}

impl Substrate for MeshEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn ranks_per_node(&self) -> usize {
        self.node_width
    }

    fn send(&mut self, to: usize, channel: Channel, bytes: Vec<u8>) -> Result<(), SubstrateError> {
        self.tx[to][channel.index()]
            .send((self.rank as u32, bytes))
            .map_err(|_| SubstrateError::Disconnected { peer: to })?;
        self.unpolled_sends[channel.index()] += 1;
        Ok(())
    }

    fn try_recv(&mut self, channel: Channel) -> Result<Option<Vec<u8>>, SubstrateError> {
        if let Some((_, bytes)) = self.stash[channel.index()].pop_front() {
            return Ok(Some(bytes));
        }
        match self.rx[channel.index()].try_recv() {
            Ok((_, bytes)) => Ok(Some(bytes)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SubstrateError::Closed),
        }
    }

    fn recv_from(&mut self, from: usize, channel: Channel) -> Result<Vec<u8>, SubstrateError> {
        if let Some(bytes) = self.stashed(from, channel) {
            return Ok(bytes);
        }
        loop {
            let packet = self.rx[channel.index()]
                .recv()
                .map_err(|_| SubstrateError::Disconnected { peer: from })?;
            if packet.0 as usize == from {
                return Ok(packet.1);
            }
            self.stash[channel.index()].push_back(packet);
        }
    }

    fn has_pending(&mut self, channel: Channel) -> bool {
        !self.stash[channel.index()].is_empty() || !self.rx[channel.index()].is_empty()
    }

    fn poll_completed_sends(&mut self, channel: Channel) -> Result<usize, SubstrateError> {
        Ok(std::mem::take(&mut self.unpolled_sends[channel.index()]))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delivers_across_channels_independently() {
        let mut peers = create(2);
        let mut b = peers.pop().unwrap();
        let mut a = peers.pop().unwrap();

        a.send(1, Channel::User, vec![1]).unwrap();
        a.send(1, Channel::Barrier, vec![2]).unwrap();
        assert_eq!(b.try_recv(Channel::Collective).unwrap(), None);
        assert_eq!(b.try_recv(Channel::User).unwrap(), Some(vec![1]));
        assert_eq!(b.recv_from(0, Channel::Barrier).unwrap(), vec![2]);
        assert_eq!(a.poll_completed_sends(Channel::User).unwrap(), 1);
        assert_eq!(a.poll_completed_sends(Channel::User).unwrap(), 0);
        assert_eq!(a.poll_completed_sends(Channel::Barrier).unwrap(), 1);
    }

    #[test]
    fn recv_from_stashes_other_senders() {
        let mut peers = with_nodes(1, 3);
        let mut c = peers.pop().unwrap();
        let mut b = peers.pop().unwrap();
        let mut a = peers.pop().unwrap();

        b.send(2, Channel::Collective, vec![10]).unwrap();
        a.send(2, Channel::Collective, vec![20]).unwrap();

        // Wait for rank 0 even though rank 1's packet arrives first.
        assert_eq!(c.recv_from(0, Channel::Collective).unwrap(), vec![20]);
        assert!(c.has_pending(Channel::Collective));
        assert_eq!(c.recv_from(1, Channel::Collective).unwrap(), vec![10]);
        assert!(!c.has_pending(Channel::Collective));
    }
}
