//! Tree allreduce: fold child contributions upward, broadcast the reduced
//! result back down.
//!
//! Whole-buffer exchanges keep the algorithm simple; the bandwidth-optimal
//! variants live behind the same error surface and can be swapped in
//! per-size later. Any link fault aborts with a transient error and the
//! recovery loop re-agrees before retrying.

use crate::collective::ReduceFunction;
use crate::transport::{LinkRecord, LinkResult};

/// In-place allreduce over the tree links. After success `buf` holds the
/// identical reduced bytes on every rank.
pub(crate) async fn try_allreduce(
    links: &mut [LinkRecord],
    parent: Option<usize>,
    buf: &mut [u8],
    reducer: &ReduceFunction,
) -> LinkResult<()> {
    if links.is_empty() {
        return Ok(());
    }
    let mut scratch = vec![0u8; buf.len()];

    // gather: fold in each child subtree
    for i in 0..links.len() {
        if Some(i) != parent {
            links[i].recv_exact(&mut scratch).await?;
            reducer(&scratch, buf);
        }
    }
    // exchange with the parent; the root already holds the global result
    if let Some(p) = parent {
        links[p].send_all(buf).await?;
        links[p].recv_exact(buf).await?;
    }
    // scatter the result back down
    for i in 0..links.len() {
        if Some(i) != parent {
            links[i].send_all(buf).await?;
        }
    }
    Ok(())
}
