//! The communicator: fire-and-forget remote invocation, the progress
//! engine, and the quiescence barrier.
//!
//! One [`Comm`] exists per peer and is shared by every client subsystem on
//! that peer. Scheduling is single-threaded and cooperative: invocations
//! are dispatched only while the owning thread is inside a communicator
//! call, and every entry point opportunistically drains the receive queue,
//! so message processing advances without a dedicated thread. Handlers may
//! enqueue further invocations while being dispatched; the progress engine
//! refuses re-entry, which keeps deeply nested dispatch chains off the
//! stack.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::rc::Rc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zerocopy::AsBytes;

use crate::env::CommConfig;
use crate::error::CommError;
use crate::handle::{HandleRegistry, SharedHandle};
use crate::layout::Layout;
use crate::registry::{self, LambdaRegistry, RemoteFn};
use crate::router::Router;
use crate::stats::{CommStats, StatsSnapshot};
use crate::substrate::{Channel, Substrate};
use crate::wire::{self, ArgReader, Segment, SegmentHeader, WireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommState {
    Open,
    Draining,
    Closed,
}

/// One next-hop's accumulating buffer. `segment_at` points at the header
/// of the segment currently open for coalescing; it is only meaningful
/// while `current_dest` is set.
struct SendBuffer {
    bytes: Vec<u8>,
    current_dest: Option<u32>,
    segment_at: usize,
}

impl SendBuffer {
    const fn idle() -> Self {
        Self {
            bytes: Vec::new(),
            current_dest: None,
            segment_at: 0,
        }
    }
}

struct SendState {
    buffers: Vec<SendBuffer>,
    /// Recycled byte buffers, fed by completed receives.
    free: Vec<Vec<u8>>,
    /// Byte lengths of flushed messages not yet confirmed transmitted,
    /// oldest first.
    inflight: VecDeque<usize>,
    outstanding_bytes: usize,
}

impl SendState {
    /// Appends one invocation for `dest` to the buffer of `hop`, opening a
    /// new segment unless the buffer's open segment already addresses
    /// `dest`. `write` must append the lambda id followed by the packed
    /// arguments; if it fails, the buffer is restored to its previous
    /// state.
    fn append(
        &mut self,
        hop: usize,
        dest: u32,
        write: impl FnOnce(&mut Vec<u8>) -> Result<(), CommError>,
    ) -> Result<(), CommError> {
        let buffer = &mut self.buffers[hop];
        let previous_dest = buffer.current_dest;
        let previous_segment = buffer.segment_at;

        if buffer.current_dest != Some(dest) {
            buffer.segment_at = buffer.bytes.len();
            buffer
                .bytes
                .extend_from_slice(SegmentHeader::new(dest, 0).as_bytes());
            buffer.current_dest = Some(dest);
        }

        let body_start = buffer.bytes.len();
        if let Err(err) = write(&mut buffer.bytes) {
            let rewind = if buffer.segment_at == previous_segment && previous_dest == Some(dest) {
                body_start
            } else {
                buffer.segment_at
            };
            buffer.bytes.truncate(rewind);
            buffer.current_dest = previous_dest;
            buffer.segment_at = previous_segment;
            return Err(err);
        }

        let body_len = buffer.bytes.len() - buffer.segment_at - wire::HEADER_LEN;
        wire::patch_body_len(&mut buffer.bytes, buffer.segment_at, body_len as u32);
        Ok(())
    }

    /// Re-enqueues a transit segment verbatim, header included. The
    /// segment stays open so invocations for the same destination coalesce
    /// onto it.
    fn append_transit(&mut self, hop: usize, dest: u32, raw: &[u8]) {
        let buffer = &mut self.buffers[hop];
        buffer.segment_at = buffer.bytes.len();
        buffer.bytes.extend_from_slice(raw);
        buffer.current_dest = Some(dest);
    }
}

/// Envelope carried by broadcast relays: the tree root plus the user
/// handler's arguments.
#[derive(Serialize, Deserialize)]
pub struct BcastEnvelope<A> {
    root: u32,
    args: A,
}

/// Internal handler that re-forwards a broadcast down the tree before
/// running the user handler locally. Registered automatically for every
/// type announced with [`remote!`](crate::remote).
pub struct BcastRelay<F>(PhantomData<F>);

impl<F: RemoteFn> RemoteFn for BcastRelay<F> {
    type Args = BcastEnvelope<F::Args>;

    fn invoke(comm: &Comm, envelope: BcastEnvelope<F::Args>) -> Result<(), CommError> {
        comm.relay_to_children::<F>(&envelope)?;
        F::invoke(comm, envelope.args)
    }
}

type PreBarrierCallback = Box<dyn FnOnce(&Comm) -> Result<(), CommError>>;

/// The asynchronous active-message communicator.
///
/// Deliberately `!Sync`: each peer's communicator belongs to one thread,
/// and interior mutability through `Cell`/`RefCell` is what lets handlers
/// enqueue new work while they are being dispatched.
pub struct Comm {
    substrate: RefCell<Box<dyn Substrate>>,
    config: CommConfig,
    layout: Layout,
    router: Router,
    registry: &'static LambdaRegistry,
    rank: usize,
    size: usize,
    send: RefCell<SendState>,
    sent_count: Cell<u64>,
    recv_count: Cell<u64>,
    in_progress: Cell<bool>,
    state: Cell<CommState>,
    pre_barrier: RefCell<VecDeque<PreBarrierCallback>>,
    handles: HandleRegistry,
    stats: RefCell<CommStats>,
}

impl Comm {
    /// Adopts an existing peer group with tunables from the process
    /// environment.
    pub fn new(substrate: impl Substrate + 'static) -> Result<Self, CommError> {
        let config = CommConfig::from_env(substrate.rank());
        Self::with_config(substrate, config)
    }

    /// Adopts an existing peer group with explicit tunables, bypassing the
    /// environment.
    pub fn with_config(
        substrate: impl Substrate + 'static,
        config: CommConfig,
    ) -> Result<Self, CommError> {
        config.validate()?;
        let rank = substrate.rank();
        let size = substrate.size();
        let layout = Layout::blocked(size, substrate.ranks_per_node());
        let router = Router::new(config.routing, layout);
        // Forces handler collection, so a bad registration aborts every
        // peer here rather than misdispatching later.
        let registry = registry::global();

        if config.welcome && rank == 0 {
            tracing::info!(
                peers = size,
                nodes = layout.node_count(),
                handlers = registry.len(),
                routing = ?config.routing,
                buffer_capacity = config.buffer_capacity,
                total_send_budget = config.total_send_budget,
                irecv_count = config.irecv_count,
                "communicator up"
            );
        }

        Ok(Self {
            substrate: RefCell::new(Box::new(substrate)),
            send: RefCell::new(SendState {
                buffers: (0..size).map(|_| SendBuffer::idle()).collect(),
                free: Vec::new(),
                inflight: VecDeque::new(),
                outstanding_bytes: 0,
            }),
            stats: RefCell::new(CommStats::new(size)),
            sent_count: Cell::new(0),
            recv_count: Cell::new(0),
            in_progress: Cell::new(false),
            state: Cell::new(CommState::Open),
            pre_barrier: RefCell::new(VecDeque::new()),
            handles: HandleRegistry::default(),
            config,
            layout,
            router,
            registry,
            rank,
            size,
        })
    }

    /// This peer's rank in `[0, size)`.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of peers in the job.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this peer is rank 0.
    pub fn rank0(&self) -> bool {
        self.rank == 0
    }

    /// Locality coordinates of the peer set.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The active next-hop selector.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The frozen tunables this communicator runs with.
    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    /// A copy of this rank's statistics counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.borrow().snapshot()
    }

    /// Zeroes the statistics counters. The quiescence counters the barrier
    /// relies on are unaffected.
    pub fn stats_reset(&self) {
        self.stats.borrow_mut().reset();
    }

    /// Enqueues `F(args)` for execution on `dest`.
    ///
    /// The invocation is appended to the send buffer of the router-selected
    /// next hop; the buffer is flushed once it crosses the configured
    /// capacity, and when too many flushed bytes are still unacknowledged
    /// the call runs the progress engine until the backlog drains. There is
    /// no ordering guarantee between two `async_call`s, even to the same
    /// destination.
    pub fn async_call<F: RemoteFn>(&self, dest: usize, _f: F, args: F::Args) -> Result<(), CommError> {
        self.ensure_usable()?;
        self.check_unicast_dest(dest)?;
        self.progress()?;
        let id = self.registry.id_of::<F>()?;
        self.enqueue_with(dest, |bytes| {
            bytes.extend_from_slice(&id.to_ne_bytes());
            bincode::serialize_into(&mut *bytes, &args).map_err(|source| CommError::Serialize {
                name: std::any::type_name::<F>(),
                source,
            })
        })?;
        self.enforce_send_budget()
    }

    /// Enqueues `F(args)` for execution exactly once on every peer,
    /// including the caller, along a k-ary relay tree rooted here. Every
    /// tree edge is an ordinary invocation, so the barrier's counting
    /// argument covers broadcasts with no special cases.
    pub fn async_bcast<F: RemoteFn>(&self, _f: F, args: F::Args) -> Result<(), CommError> {
        self.ensure_usable()?;
        self.progress()?;
        let envelope = BcastEnvelope {
            root: self.rank as u32,
            args,
        };
        self.relay_to_children::<F>(&envelope)?;
        F::invoke(self, envelope.args)
    }

    /// Enqueues `F(args)` for execution on each listed destination,
    /// serializing the arguments once. Equivalent to repeated
    /// [`async_call`](Comm::async_call) with shared packing.
    pub fn async_mcast<F: RemoteFn>(
        &self,
        dests: &[usize],
        _f: F,
        args: F::Args,
    ) -> Result<(), CommError> {
        self.ensure_usable()?;
        for &dest in dests {
            self.check_unicast_dest(dest)?;
        }
        self.progress()?;
        let id = self.registry.id_of::<F>()?;
        let packed = bincode::serialize(&args).map_err(|source| CommError::Serialize {
            name: std::any::type_name::<F>(),
            source,
        })?;
        for &dest in dests {
            self.enqueue_with(dest, |bytes| {
                bytes.extend_from_slice(&id.to_ne_bytes());
                bytes.extend_from_slice(&packed);
                Ok(())
            })?;
        }
        self.enforce_send_budget()
    }

    /// Registers a callback to run on the next [`barrier`](Comm::barrier)
    /// entry, before the quiescence loop. Callbacks are consumed in FIFO
    /// order and may enqueue new invocations, at the cost of additional
    /// barrier iterations.
    pub fn register_pre_barrier_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Comm) -> Result<(), CommError> + 'static,
    {
        self.pre_barrier.borrow_mut().push_back(Box::new(callback));
    }

    /// Blocks until every invocation sent anywhere in the job has been
    /// dispatched, including invocations spawned transitively by dispatched
    /// handlers.
    ///
    /// The loop alternates local quiescence (flush everything, drain
    /// everything) with a global reduction of the sent/received counters on
    /// the dedicated barrier channel. A message can still slip in between a
    /// peer's local snapshot and the reduction; the totals then disagree
    /// and the loop runs another iteration, which is also what makes work
    /// enqueued by pre-barrier callbacks converge.
    pub fn barrier(&self) -> Result<(), CommError> {
        self.ensure_usable()?;
        loop {
            loop {
                let callback = self.pre_barrier.borrow_mut().pop_front();
                match callback {
                    Some(callback) => callback(self)?,
                    None => break,
                }
            }

            loop {
                self.flush_all()?;
                self.progress()?;
                if self.locally_quiet()? {
                    break;
                }
            }

            self.stats.borrow_mut().record_barrier_iteration();
            let local = (self.sent_count.get(), self.recv_count.get());
            let (global_sent, global_received) =
                self.tree_allreduce(Channel::Barrier, local, |a, b| (a.0 + b.0, a.1 + b.1))?;
            if global_sent == global_received {
                return Ok(());
            }
        }
    }

    /// Synchronizes control flow only: returns once every peer has called
    /// it. No send buffer is flushed and no message is drained, so the
    /// quiescence counters are untouched.
    pub fn cf_barrier(&self) -> Result<(), CommError> {
        self.ensure_usable()?;
        self.tree_allreduce(Channel::Collective, (), |_, _| ())
    }

    /// Reduces `value` across all peers with `merge` and returns the result
    /// on every peer. Runs on the collective channel, orthogonal to barrier
    /// state. `merge` must be associative and agree across peers; it
    /// receives no communicator on purpose, so no message can be enqueued
    /// from inside a reduction.
    pub fn all_reduce<T, F>(&self, value: T, merge: F) -> Result<T, CommError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(T, T) -> T,
    {
        self.ensure_usable()?;
        self.progress()?;
        self.tree_allreduce(Channel::Collective, value, merge)
    }

    /// Sum of `value` over all peers.
    pub fn all_reduce_sum<T>(&self, value: T) -> Result<T, CommError>
    where
        T: Serialize + DeserializeOwned + std::ops::Add<Output = T>,
    {
        self.all_reduce(value, |a, b| a + b)
    }

    /// Minimum of `value` over all peers.
    pub fn all_reduce_min<T>(&self, value: T) -> Result<T, CommError>
    where
        T: Serialize + DeserializeOwned + Ord,
    {
        self.all_reduce(value, T::min)
    }

    /// Maximum of `value` over all peers.
    pub fn all_reduce_max<T>(&self, value: T) -> Result<T, CommError>
    where
        T: Serialize + DeserializeOwned + Ord,
    {
        self.all_reduce(value, T::max)
    }

    /// Registers this peer's replica of a logically shared object and
    /// returns a handle that can travel as an invocation argument.
    ///
    /// Collective: every peer must call this in the same order with the
    /// same type, which is verified with a reduction. A disagreement means
    /// handles would silently resolve to the wrong objects, so it panics.
    pub fn make_shared_handle<T: 'static>(
        &self,
        object: Rc<RefCell<T>>,
    ) -> Result<SharedHandle<T>, CommError> {
        self.ensure_usable()?;
        let id = self.handles.register(object);
        let mine = Some((id, std::any::type_name::<T>().to_string()));
        let agreed = self.all_reduce(mine, |a, b| match (a, b) {
            (Some(x), Some(y)) if x == y => Some(x),
            _ => None,
        })?;
        if agreed.is_none() {
            panic!(
                "shared handle creation out of order: rank {} registered {} as handle {}",
                self.rank,
                std::any::type_name::<T>(),
                id
            );
        }
        Ok(SharedHandle::new(id))
    }

    /// Resolves a handle to this peer's replica.
    pub fn resolve<T: 'static>(&self, handle: SharedHandle<T>) -> Result<Rc<RefCell<T>>, CommError> {
        self.handles
            .resolve(handle.id())
            .ok_or(CommError::UnknownHandle {
                id: handle.id(),
                expected: std::any::type_name::<T>(),
            })
    }

    fn ensure_usable(&self) -> Result<(), CommError> {
        if self.state.get() == CommState::Closed {
            return Err(CommError::Closed);
        }
        Ok(())
    }

    fn check_unicast_dest(&self, dest: usize) -> Result<(), CommError> {
        if dest >= self.size || dest == self.rank {
            return Err(CommError::InvalidRank {
                from: self.rank,
                dest,
                size: self.size,
            });
        }
        Ok(())
    }

    fn relay_to_children<F: RemoteFn>(
        &self,
        envelope: &BcastEnvelope<F::Args>,
    ) -> Result<(), CommError> {
        let children = self.router.bcast_children(envelope.root as usize, self.rank);
        if children.is_empty() {
            return Ok(());
        }
        let id = self.registry.id_of::<BcastRelay<F>>()?;
        let packed = bincode::serialize(envelope).map_err(|source| CommError::Serialize {
            name: std::any::type_name::<F>(),
            source,
        })?;
        for child in children {
            self.enqueue_with(child, |bytes| {
                bytes.extend_from_slice(&id.to_ne_bytes());
                bytes.extend_from_slice(&packed);
                Ok(())
            })?;
        }
        self.enforce_send_budget()
    }

    fn enqueue_with(
        &self,
        dest: usize,
        write: impl FnOnce(&mut Vec<u8>) -> Result<(), CommError>,
    ) -> Result<(), CommError> {
        let hop = self.router.next_hop(self.rank, dest);
        self.send.borrow_mut().append(hop, dest as u32, write)?;
        self.sent_count.set(self.sent_count.get() + 1);
        self.stats.borrow_mut().record_invocation_sent();
        self.flush_if_full(hop)
    }

    fn flush_if_full(&self, hop: usize) -> Result<(), CommError> {
        let full = self.send.borrow().buffers[hop].bytes.len() >= self.config.buffer_capacity;
        if full {
            self.flush_next_hop(hop)?;
        }
        Ok(())
    }

    fn flush_next_hop(&self, hop: usize) -> Result<(), CommError> {
        let bytes;
        let outstanding;
        {
            let send = &mut *self.send.borrow_mut();
            if send.buffers[hop].bytes.is_empty() {
                return Ok(());
            }
            let replacement = send.free.pop().unwrap_or_default();
            let buffer = &mut send.buffers[hop];
            bytes = std::mem::replace(&mut buffer.bytes, replacement);
            buffer.current_dest = None;
            buffer.segment_at = 0;
            send.inflight.push_back(bytes.len());
            send.outstanding_bytes += bytes.len();
            outstanding = send.outstanding_bytes;
        }
        let len = bytes.len();
        self.substrate.borrow_mut().send(hop, Channel::User, bytes)?;
        self.stats.borrow_mut().record_flush(hop, len, outstanding);
        Ok(())
    }

    fn flush_all(&self) -> Result<(), CommError> {
        let pending: Vec<usize> = {
            let send = self.send.borrow();
            send.buffers
                .iter()
                .enumerate()
                .filter(|(_, buffer)| !buffer.bytes.is_empty())
                .map(|(hop, _)| hop)
                .collect()
        };
        for hop in pending {
            self.flush_next_hop(hop)?;
        }
        Ok(())
    }

    fn enforce_send_budget(&self) -> Result<(), CommError> {
        if self.in_progress.get() {
            // Called from inside a dispatched handler: progress cannot
            // re-enter, so spinning here would never drain anything.
            return Ok(());
        }
        let budget = self.config.total_send_budget;
        if self.send.borrow().outstanding_bytes <= budget {
            return Ok(());
        }
        let low_water = budget / 2;
        while self.send.borrow().outstanding_bytes > low_water {
            self.progress()?;
        }
        Ok(())
    }

    /// One cooperative step: drain completed receives (bounded by the
    /// irecv credit), dispatch or forward their segments, and retire
    /// confirmed sends. Refuses re-entry.
    pub(crate) fn progress(&self) -> Result<bool, CommError> {
        if self.in_progress.get() {
            return Ok(false);
        }
        self.in_progress.set(true);
        let started = Instant::now();
        let result = self.progress_step();
        self.stats.borrow_mut().record_progress_time(started.elapsed());
        self.in_progress.set(false);
        result
    }

    fn progress_step(&self) -> Result<bool, CommError> {
        let mut worked = false;

        for _ in 0..self.config.irecv_count {
            let message = self.substrate.borrow_mut().try_recv(Channel::User)?;
            let Some(bytes) = message else { break };
            self.deliver(bytes)?;
            worked = true;
        }

        let completed = self
            .substrate
            .borrow_mut()
            .poll_completed_sends(Channel::User)?;
        if completed > 0 {
            let send = &mut *self.send.borrow_mut();
            for _ in 0..completed {
                if let Some(len) = send.inflight.pop_front() {
                    send.outstanding_bytes -= len;
                }
            }
            worked = true;
        }

        Ok(worked)
    }

    fn deliver(&self, bytes: Vec<u8>) -> Result<(), CommError> {
        let mut at = 0;
        while at < bytes.len() {
            let segment = Segment::parse(&bytes[at..])?;
            if segment.final_dest as usize >= self.size {
                return Err(WireError::BadDestination {
                    dest: segment.final_dest,
                }
                .into());
            }
            if segment.final_dest as usize == self.rank {
                self.dispatch_segment(segment.body)?;
            } else {
                self.forward_segment(&segment)?;
            }
            at += segment.len();
        }
        self.recycle(bytes);
        Ok(())
    }

    fn dispatch_segment(&self, body: &[u8]) -> Result<(), CommError> {
        let mut reader = ArgReader::new(body);
        while reader.remaining() > 0 {
            let id = reader.read_lambda_id()?;
            let entry = self
                .registry
                .entry(id)
                .ok_or(WireError::UnknownLambda { id })?;
            self.recv_count.set(self.recv_count.get() + 1);
            self.stats.borrow_mut().record_invocation_dispatched();
            entry.invoke(self, &mut reader)?;
        }
        Ok(())
    }

    fn forward_segment(&self, segment: &Segment<'_>) -> Result<(), CommError> {
        let dest = segment.final_dest as usize;
        let hop = self.router.next_hop(self.rank, dest);
        self.send
            .borrow_mut()
            .append_transit(hop, segment.final_dest, segment.raw);
        self.stats.borrow_mut().record_segment_forwarded();
        self.flush_if_full(hop)
    }

    fn recycle(&self, mut bytes: Vec<u8>) {
        let send = &mut *self.send.borrow_mut();
        if send.free.len() < self.config.irecv_count && bytes.capacity() <= self.config.irecv_size {
            bytes.clear();
            send.free.push(bytes);
        }
    }

    fn locally_quiet(&self) -> Result<bool, CommError> {
        let quiet = {
            let send = self.send.borrow();
            send.inflight.is_empty() && send.buffers.iter().all(|buffer| buffer.bytes.is_empty())
        };
        Ok(quiet && !self.substrate.borrow_mut().has_pending(Channel::User))
    }

    /// Binomial-tree reduce to rank 0 followed by a binomial broadcast of
    /// the result. The substrate only offers point-to-point delivery, so
    /// the communicator owns the collective algorithm.
    fn tree_allreduce<T, F>(&self, channel: Channel, value: T, mut merge: F) -> Result<T, CommError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(T, T) -> T,
    {
        let n = self.size;
        let r = self.rank;
        let mut acc = value;

        let mut mask = 1usize;
        while mask < n {
            if r & mask != 0 {
                self.send_collective(r - mask, channel, &acc)?;
                break;
            }
            let child = r + mask;
            if child < n {
                let received = self.recv_collective::<T>(child, channel)?;
                acc = merge(acc, received);
            }
            mask <<= 1;
        }

        if r != 0 {
            let parent = r & (r - 1);
            acc = self.recv_collective::<T>(parent, channel)?;
        }
        let highest = if r == 0 {
            n.next_power_of_two()
        } else {
            r & r.wrapping_neg()
        };
        let mut m = highest >> 1;
        while m > 0 {
            let child = r + m;
            if child < n {
                self.send_collective(child, channel, &acc)?;
            }
            m >>= 1;
        }

        Ok(acc)
    }

    fn send_collective<T: Serialize>(
        &self,
        to: usize,
        channel: Channel,
        value: &T,
    ) -> Result<(), CommError> {
        let bytes = bincode::serialize(value).map_err(|source| CommError::Serialize {
            name: std::any::type_name::<T>(),
            source,
        })?;
        self.substrate.borrow_mut().send(to, channel, bytes)?;
        Ok(())
    }

    fn recv_collective<T: DeserializeOwned>(
        &self,
        from: usize,
        channel: Channel,
    ) -> Result<T, CommError> {
        let bytes = self.substrate.borrow_mut().recv_from(from, channel)?;
        Ok(bincode::deserialize(&bytes).map_err(WireError::Decode)?)
    }
}

impl Drop for Comm {
    fn drop(&mut self) {
        if self.state.get() != CommState::Open {
            return;
        }
        self.state.set(CommState::Draining);
        if let Err(error) = self.barrier() {
            tracing::error!(%error, rank = self.rank, "final drain barrier failed");
        }
        self.handles.clear();
        self.state.set(CommState::Closed);
    }
}
