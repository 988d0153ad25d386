//! Per-rank communication statistics.
//!
//! Everything here is plain arithmetic on storage allocated at
//! construction; the progress path must never allocate, so the per-peer
//! vectors are sized up front and `reset` zeroes them in place.

use std::time::Duration;

#[derive(Debug)]
pub(crate) struct CommStats {
    bytes_to_peer: Vec<u64>,
    messages_to_peer: Vec<u64>,
    invocations_sent: u64,
    invocations_dispatched: u64,
    segments_forwarded: u64,
    buffer_flushes: u64,
    barrier_iterations: u64,
    max_outstanding_bytes: u64,
    progress_time: Duration,
}

impl CommStats {
    pub fn new(size: usize) -> Self {
        Self {
            bytes_to_peer: vec![0; size],
            messages_to_peer: vec![0; size],
            invocations_sent: 0,
            invocations_dispatched: 0,
            segments_forwarded: 0,
            buffer_flushes: 0,
            barrier_iterations: 0,
            max_outstanding_bytes: 0,
            progress_time: Duration::ZERO,
        }
    }

    pub fn reset(&mut self) {
        self.bytes_to_peer.fill(0);
        self.messages_to_peer.fill(0);
        self.invocations_sent = 0;
        self.invocations_dispatched = 0;
        self.segments_forwarded = 0;
        self.buffer_flushes = 0;
        self.barrier_iterations = 0;
        self.max_outstanding_bytes = 0;
        self.progress_time = Duration::ZERO;
    }

    #[inline]
    pub fn record_invocation_sent(&mut self) {
        self.invocations_sent += 1;
    }

    #[inline]
    pub fn record_invocation_dispatched(&mut self) {
        self.invocations_dispatched += 1;
    }

    #[inline]
    pub fn record_segment_forwarded(&mut self) {
        self.segments_forwarded += 1;
    }

    #[inline]
    pub fn record_flush(&mut self, to: usize, bytes: usize, outstanding: usize) {
        self.bytes_to_peer[to] += bytes as u64;
        self.messages_to_peer[to] += 1;
        self.buffer_flushes += 1;
        self.max_outstanding_bytes = self.max_outstanding_bytes.max(outstanding as u64);
    }

    #[inline]
    pub fn record_barrier_iteration(&mut self) {
        self.barrier_iterations += 1;
    }

    #[inline]
    pub fn record_progress_time(&mut self, elapsed: Duration) {
        self.progress_time += elapsed;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_to_peer: self.bytes_to_peer.clone(),
            messages_to_peer: self.messages_to_peer.clone(),
            invocations_sent: self.invocations_sent,
            invocations_dispatched: self.invocations_dispatched,
            segments_forwarded: self.segments_forwarded,
            buffer_flushes: self.buffer_flushes,
            barrier_iterations: self.barrier_iterations,
            max_outstanding_bytes: self.max_outstanding_bytes,
            progress_time: self.progress_time,
        }
    }
}

/// A point-in-time copy of one rank's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Flushed bytes per directly messaged peer.
    pub bytes_to_peer: Vec<u64>,
    /// Flushed messages per directly messaged peer.
    pub messages_to_peer: Vec<u64>,
    /// Invocations appended on this rank.
    pub invocations_sent: u64,
    /// Invocations dispatched on this rank.
    pub invocations_dispatched: u64,
    /// Transit segments re-enqueued for another hop.
    pub segments_forwarded: u64,
    /// Send-buffer flushes.
    pub buffer_flushes: u64,
    /// Quiescence loop iterations across all barriers.
    pub barrier_iterations: u64,
    /// High-water mark of outstanding send bytes.
    pub max_outstanding_bytes: u64,
    /// Total time spent inside the progress engine.
    pub progress_time: Duration,
}

impl StatsSnapshot {
    /// Peers this rank flushed at least one message to.
    pub fn peers_messaged(&self) -> usize {
        self.messages_to_peer.iter().filter(|&&n| n > 0).count()
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "invocations: {} sent, {} dispatched, {} segments forwarded",
            self.invocations_sent, self.invocations_dispatched, self.segments_forwarded
        )?;
        writeln!(
            f,
            "sends: {} flushes to {} peers, {} bytes, high water {} bytes",
            self.buffer_flushes,
            self.peers_messaged(),
            self.bytes_to_peer.iter().sum::<u64>(),
            self.max_outstanding_bytes
        )?;
        write!(
            f,
            "progress: {:?} total, {} barrier iterations",
            self.progress_time, self.barrier_iterations
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reset_zeroes_in_place() {
        let mut stats = CommStats::new(4);
        stats.record_invocation_sent();
        stats.record_flush(2, 128, 128);
        stats.record_segment_forwarded();
        assert_eq!(stats.snapshot().peers_messaged(), 1);

        stats.reset();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot, CommStats::new(4).snapshot());
        assert_eq!(snapshot.bytes_to_peer.len(), 4);
    }

    #[test]
    fn tracks_outstanding_high_water() {
        let mut stats = CommStats::new(2);
        stats.record_flush(1, 100, 100);
        stats.record_flush(1, 100, 200);
        stats.record_flush(1, 100, 50);
        assert_eq!(stats.snapshot().max_outstanding_bytes, 200);
    }
}
