//! Asynchronous active-message communication core for bulk-synchronous
//! data-parallel programs over a fixed set of peers.
//!
//! The central object is the [`Comm`]: clients enqueue fire-and-forget
//! remote invocations with [`Comm::async_call`], and a global quiescence
//! [`Comm::barrier`] returns only once every invocation, including those
//! spawned transitively by dispatched handlers, has been executed
//! somewhere in the job. Invocations bound for the same next hop accumulate
//! in per-peer send buffers, and a locality-aware [`router`] can cap how
//! many peers each process directly messages on large clusters.
//!
//! # Handlers
//! A remotely invocable operation is a zero-sized type implementing
//! [`RemoteFn`], announced once with [`remote!`]. Handler state cannot
//! travel: everything an invocation needs goes into its serialized
//! arguments, and objects replicated on every peer are reached through
//! [`SharedHandle`]s rather than addresses.
//!
//! # Execution model
//! Single-threaded and cooperative, per peer. No call blocks waiting for a
//! specific message, and dispatch happens opportunistically inside every
//! communicator entry point. Handlers may enqueue further invocations, but
//! nothing they enqueue is dispatched recursively.
//!
//! The communicator runs over any reliable all-to-all
//! [`substrate`](substrate::Substrate); the [`mesh`] module provides the
//! in-memory one used by the tests, where every peer is a thread.

pub(crate) mod stats;
#[cfg(test)]
pub(crate) mod test;
pub(crate) mod wire;

pub mod comm;
pub mod env;
pub mod error;
pub mod handle;
pub mod layout;
pub mod mesh;
pub mod registry;
pub mod router;
pub mod substrate;

pub use comm::Comm;
pub use env::CommConfig;
pub use error::CommError;
pub use handle::SharedHandle;
pub use registry::RemoteFn;
pub use router::RoutingMode;
pub use stats::StatsSnapshot;
pub use wire::{ArgReader, WireError};

// Re-exported for the `remote!` macro expansion.
#[doc(hidden)]
pub use inventory;
