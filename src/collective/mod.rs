//! Collective primitives over the link overlay: tree allreduce, ring
//! broadcast, generic up-down message passing, and pipelined ring
//! store-and-forward streaming.

pub(crate) mod allreduce;
pub(crate) mod broadcast;
pub(crate) mod msg_passing;
pub(crate) mod ring;

/// Folds `src` into `dst` element-wise over the whole slice:
/// `dst[i] = op(dst[i], src[i])`. Both slices have identical length.
pub type ReduceFunction = dyn Fn(&[u8], &mut [u8]) + Sync;
