//! Ring broadcast: the root streams its buffer to the next ring neighbor
//! and every node forwards it on, store-and-forward pipelined, until the
//! rank just before the root.

use crate::collective::ring::ring_passing;
use crate::transport::{pair_mut, LinkRecord, LinkResult};
use crate::types::Rank;

/// In-place broadcast of `buf` from `root` to all ranks over the ring.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn try_broadcast(
    links: &mut [LinkRecord],
    ring_prev: usize,
    ring_next: usize,
    rank: Rank,
    world_size: u32,
    root: Rank,
    buf: &mut [u8],
) -> LinkResult<()> {
    if world_size <= 1 || buf.is_empty() {
        return Ok(());
    }
    let size = buf.len();
    let is_root = rank == root;
    let next_is_root = (rank + 1) % world_size == root;

    // the root's bytes are all "already received"; the last node in the
    // chain forwards nothing
    let (read_ptr, read_end) = if is_root { (size, size) } else { (0, size) };
    let write_end = if next_is_root && !is_root { 0 } else { size };

    let (prev, next) = pair_mut(links, ring_prev, ring_next);
    ring_passing(buf, read_ptr, read_end, 0, write_end, prev, next).await
}
