//! Point-to-point link layer: non-blocking TCP byte streams with transfer
//! cursors, a per-link pass-through ring buffer, and the in-band reset
//! marker scanner.

mod link;

pub(crate) use link::{LinkError, LinkRecord, LinkResult, RESET_ACK, RESET_SYNC};

/// Borrow two distinct elements of a slice mutably.
///
/// Panics if `a == b` or either index is out of bounds.
pub(crate) fn pair_mut<T>(v: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert_ne!(a, b, "pair_mut requires distinct indices");
    if a < b {
        let (lo, hi) = v.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = v.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}
