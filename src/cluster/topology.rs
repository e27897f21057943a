//! Deterministic overlay computed from `(rank, world_size)`: a binary
//! reduction tree plus a ring for pipelined streaming. Both endpoints of
//! every edge derive the same plan, so no negotiation is needed beyond the
//! listener table.

use crate::types::Rank;

/// Role tag carried in the per-connection handshake.
pub(crate) const LINK_ROLE_TREE: u8 = 0;
pub(crate) const LINK_ROLE_RING: u8 = 1;

/// The set of links a rank must establish for one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Topology {
    /// Tree neighbors in ascending rank order.
    pub(crate) tree_peers: Vec<Rank>,
    /// Position of the parent within `tree_peers` (`None` at the root).
    pub(crate) parent_pos: Option<usize>,
    /// Ring predecessor / successor (`None` when `world_size == 1`).
    pub(crate) ring_prev: Option<Rank>,
    pub(crate) ring_next: Option<Rank>,
}

impl Topology {
    pub(crate) fn new(rank: Rank, world_size: u32) -> Self {
        assert!(rank < world_size, "rank out of range");
        if world_size == 1 {
            return Self {
                tree_peers: Vec::new(),
                parent_pos: None,
                ring_prev: None,
                ring_next: None,
            };
        }

        let parent = if rank == 0 { None } else { Some((rank - 1) / 2) };
        let mut tree_peers: Vec<Rank> = Vec::new();
        if let Some(p) = parent {
            tree_peers.push(p);
        }
        for child in [2 * rank + 1, 2 * rank + 2] {
            if child < world_size {
                tree_peers.push(child);
            }
        }
        tree_peers.sort_unstable();
        let parent_pos = parent.map(|p| {
            tree_peers
                .iter()
                .position(|&q| q == p)
                .expect("parent is a tree peer")
        });

        Self {
            tree_peers,
            parent_pos,
            ring_prev: Some((rank + world_size - 1) % world_size),
            ring_next: Some((rank + 1) % world_size),
        }
    }

    /// Whether this rank dials the given tree peer (children dial parents).
    pub(crate) fn dials_tree(&self, rank: Rank, peer: Rank) -> bool {
        // the parent has the smaller rank in a binary heap layout
        peer < rank
    }
}
