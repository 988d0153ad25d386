//! The reliable message-passing layer the communicator is built on.
//!
//! The core never talks to a network directly. It assumes a substrate that
//! can deliver byte messages reliably between any pair of peers and asks for
//! nothing else: no ordering across channels, no collectives, no membership
//! changes. Three logically independent channels exist over the same peer
//! set so that user traffic, the barrier count reduction, and the remaining
//! collectives can never interleave.

use crate::error::SubstrateError;

/// One of the three independent communication planes between a peer pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Active-message traffic: flushed send buffers full of invocations.
    User,
    /// The quiescence barrier's count reduction.
    Barrier,
    /// `cf_barrier` and the user-facing reductions.
    Collective,
}

impl Channel {
    pub(crate) const COUNT: usize = 3;

    pub(crate) fn index(self) -> usize {
        match self {
            Channel::User => 0,
            Channel::Barrier => 1,
            Channel::Collective => 2,
        }
    }
}

/// A fixed peer group with reliable point-to-point delivery.
///
/// Implementations must deliver every accepted message exactly once, in
/// submission order per (sender, channel) pair. `send` must not block on the
/// receiver making progress. A lost peer is a lost job: implementations
/// report it as an error and the communicator treats it as fatal.
pub trait Substrate: Send {
    /// This peer's index in `[0, size)`.
    fn rank(&self) -> usize;

    /// Number of peers in the group.
    fn size(&self) -> usize;

    /// Peers per node, for the locality layout. Ranks are blocked onto
    /// nodes: ranks `[k * ranks_per_node, (k + 1) * ranks_per_node)` share
    /// node `k`.
    fn ranks_per_node(&self) -> usize;

    /// Submit a message for delivery. Ownership of the bytes transfers to
    /// the substrate; completion is observed through
    /// [`poll_completed_sends`](Substrate::poll_completed_sends).
    fn send(&mut self, to: usize, channel: Channel, bytes: Vec<u8>) -> Result<(), SubstrateError>;

    /// Non-blocking poll for the next delivered message on a channel.
    fn try_recv(&mut self, channel: Channel) -> Result<Option<Vec<u8>>, SubstrateError>;

    /// Blocking receive of the next message from a specific peer on a
    /// channel. Messages from other peers arriving meanwhile are queued, not
    /// dropped.
    fn recv_from(&mut self, from: usize, channel: Channel) -> Result<Vec<u8>, SubstrateError>;

    /// Whether a delivered message is waiting on the channel.
    fn has_pending(&mut self, channel: Channel) -> bool;

    /// Number of sends on `channel` confirmed transmitted since the last
    /// poll of that channel.
    fn poll_completed_sends(&mut self, channel: Channel) -> Result<usize, SubstrateError>;
}
