//! Next-hop selection.
//!
//! The router decides, for a logical final destination, which peer this
//! process should physically hand a message to. In [`RoutingMode::Direct`]
//! the answer is always the destination itself. In
//! [`RoutingMode::NodeGroup`] every message takes at most one intermediate
//! hop: the sender hands it to the peer on its own node whose local rank
//! matches the destination's local rank, and that lane peer forwards it
//! across nodes. The payoff is a bounded set of directly messaged peers,
//! which bounds the number of send buffers a process keeps.

use crate::layout::Layout;

/// Next-hop selection scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// Every peer messages every other peer directly.
    Direct,
    /// Messages cross nodes only between peers with matching local ranks.
    NodeGroup,
}

/// Chooses physical next hops and shapes the broadcast tree.
#[derive(Debug, Clone, Copy)]
pub struct Router {
    mode: RoutingMode,
    layout: Layout,
}

impl Router {
    pub(crate) fn new(mode: RoutingMode, layout: Layout) -> Self {
        Self { mode, layout }
    }

    /// The active routing mode.
    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// The peer `from` should hand a message for `dest` to. Never returns
    /// `from` itself: when the node-group rule would select the sender (the
    /// destination shares its local rank, or the lane slot does not exist on
    /// this node), the message goes straight to the destination.
    pub fn next_hop(&self, from: usize, dest: usize) -> usize {
        match self.mode {
            RoutingMode::Direct => dest,
            RoutingMode::NodeGroup => {
                if self.layout.is_local(from, dest) {
                    return dest;
                }
                match self
                    .layout
                    .rank_of(self.layout.node_of(from), self.layout.local_of(dest))
                {
                    Some(lane) if lane != from => lane,
                    _ => dest,
                }
            }
        }
    }

    /// Arity of the broadcast tree.
    pub fn bcast_fanout(&self) -> usize {
        match self.mode {
            RoutingMode::Direct => 2,
            RoutingMode::NodeGroup => self.layout.node_width().max(2),
        }
    }

    /// Children of `rank` in the k-ary broadcast tree rooted at `root`.
    pub fn bcast_children(&self, root: usize, rank: usize) -> Vec<usize> {
        let n = self.layout.size();
        let k = self.bcast_fanout();
        let rel = (rank + n - root) % n;
        (1..=k)
            .map(|i| rel * k + i)
            .take_while(|&child| child < n)
            .map(|child| (child + root) % n)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn router(mode: RoutingMode, size: usize, width: usize) -> Router {
        Router::new(mode, Layout::blocked(size, width))
    }

    #[test]
    fn direct_mode_is_identity() {
        let r = router(RoutingMode::Direct, 8, 4);
        for dest in 0..8 {
            assert_eq!(r.next_hop(3, dest), dest);
        }
    }

    #[test]
    fn node_group_intra_node_is_direct() {
        let r = router(RoutingMode::NodeGroup, 8, 4);
        assert_eq!(r.next_hop(1, 3), 3);
        assert_eq!(r.next_hop(5, 4), 4);
    }

    #[test]
    fn node_group_cross_node_uses_lane_peer() {
        let r = router(RoutingMode::NodeGroup, 8, 4);
        // 0 -> 6 goes through the local peer with 6's local rank.
        assert_eq!(r.next_hop(0, 6), 2);
        // The lane peer itself crosses directly.
        assert_eq!(r.next_hop(2, 6), 6);
        // Matching local rank skips the intermediate hop.
        assert_eq!(r.next_hop(1, 5), 5);
    }

    #[test]
    fn node_group_missing_lane_slot_falls_back_to_direct() {
        // 6 peers over width 4: node 1 only has local ranks 0 and 1.
        let r = router(RoutingMode::NodeGroup, 6, 4);
        assert_eq!(r.next_hop(4, 3), 3);
    }

    // Messages for peers on this node never leave it, and the set of
    // distinct next hops stays within the fanout bound.
    #[test]
    fn node_group_bounds_distinct_hops() {
        let size = 8;
        let width = 4;
        let r = router(RoutingMode::NodeGroup, size, width);
        let layout = Layout::blocked(size, width);
        for from in 0..size {
            let mut hops = std::collections::BTreeSet::new();
            for dest in (0..size).filter(|&d| d != from) {
                let hop = r.next_hop(from, dest);
                assert_ne!(hop, from);
                if layout.is_local(from, dest) {
                    assert_eq!(hop, dest);
                }
                hops.insert(hop);
                // A forwarded message reaches its destination in one more hop.
                if hop != dest {
                    assert_eq!(r.next_hop(hop, dest), dest);
                }
            }
            let bound = layout.node_width().max(layout.node_count());
            assert!(
                hops.len() <= bound,
                "rank {from} messages {} distinct peers, bound {bound}",
                hops.len()
            );
        }
    }

    #[test]
    fn bcast_tree_covers_all_peers_once() {
        for mode in [RoutingMode::Direct, RoutingMode::NodeGroup] {
            for size in [1, 2, 5, 8, 13] {
                let r = router(mode, size, 4);
                for root in [0, size - 1, size / 2] {
                    let mut seen = vec![false; size];
                    seen[root] = true;
                    let mut frontier = vec![root];
                    while let Some(rank) = frontier.pop() {
                        for child in r.bcast_children(root, rank) {
                            assert!(!seen[child], "{child} visited twice");
                            seen[child] = true;
                            frontier.push(child);
                        }
                    }
                    assert!(seen.iter().all(|&v| v), "tree misses peers");
                }
            }
        }
    }
}
