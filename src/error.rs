use crate::env::ConfigError;
use crate::wire::WireError;

/// Failure of the underlying message-passing layer.
///
/// There is no recovery from any of these: a peer that cannot reach the
/// rest of the group cannot finish the job.
#[derive(thiserror::Error, Debug)]
pub enum SubstrateError {
    /// A specific peer has gone away.
    #[error("peer {peer} disconnected")]
    Disconnected { peer: usize },

    /// The peer group has been torn down.
    #[error("peer group closed")]
    Closed,
}

/// Errors surfaced by communicator operations.
#[derive(thiserror::Error, Debug)]
pub enum CommError {
    /// The substrate reported a transport failure. Fatal to the job.
    #[error("substrate failure: {0}")]
    Substrate(#[from] SubstrateError),

    /// Rejected tunable combination at construction.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A received message is inconsistent with the wire format. Fatal.
    #[error("corrupt message: {0}")]
    Corrupt(#[from] WireError),

    /// Unicast destination out of range, or equal to the sending rank.
    #[error("invalid unicast destination {dest} from rank {from} ({size} peers)")]
    InvalidRank {
        from: usize,
        dest: usize,
        size: usize,
    },

    /// The argument serializer failed. The communicator stays open; nothing
    /// was enqueued for the failing invocation.
    #[error("failed to serialize arguments for {name}")]
    Serialize {
        name: &'static str,
        #[source]
        source: bincode::Error,
    },

    /// The handler type was never announced with [`remote!`](crate::remote).
    #[error("{name} is not registered; add `starling::remote!({name});`")]
    Unregistered { name: &'static str },

    /// A shared handle did not resolve on this peer.
    #[error("shared handle {id} does not resolve to a {expected}")]
    UnknownHandle { id: u32, expected: &'static str },

    /// Operation on a communicator that already ran its final barrier.
    #[error("communicator is closed")]
    Closed,
}
