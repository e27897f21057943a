//! Recovery routing: decide, for every node, where a missing payload
//! should come from and which tree edges must carry it onward.
//!
//! Two message-passing sweeps over the tree. The first computes, per
//! outgoing edge, the hop distance to the nearest payload holder together
//! with that holder's reported size; the second propagates per-edge data
//! requests back along the chosen shortest paths.

use crate::collective::msg_passing::Wire;
use crate::engine::base::BaseEngine;
use crate::transport::LinkResult;

/// What part this node plays in a recovery transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoverKind {
    /// Holds the payload and can source it.
    HaveData,
    /// Needs the payload delivered into a local buffer.
    RequestData,
    /// Neither holds nor needs it; may still forward.
    PassData,
}

/// The routing decision for this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Routing {
    /// Payload size agreed across the overlay.
    pub(crate) size: usize,
    /// Tree-link index to receive the payload from (`None` for holders).
    pub(crate) recv_link: Option<usize>,
    /// Per-tree-link flags: this node must send the payload there.
    pub(crate) req_in: Vec<bool>,
}

const INF_HOPS: u32 = u32::MAX;

/// Message of the distance sweep: hops to the nearest holder, plus that
/// holder's payload size. 12 bytes little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DistMsg {
    hops: u32,
    size: u64,
}

impl Wire for DistMsg {
    const SIZE: usize = 12;
    fn encode(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.hops.to_le_bytes());
        out[4..].copy_from_slice(&self.size.to_le_bytes());
    }
    fn decode(buf: &[u8]) -> Self {
        Self {
            hops: u32::from_le_bytes(buf[..4].try_into().expect("4-byte hops")),
            size: u64::from_le_bytes(buf[4..].try_into().expect("8-byte size")),
        }
    }
}

/// Distance fold: a holder reports one hop on every edge; anyone else
/// relays the best finite distance among the *other* incoming edges.
fn shortest_dist(node: &(bool, u64), inbox: &[DistMsg], out_index: usize) -> DistMsg {
    if node.0 {
        return DistMsg {
            hops: 1,
            size: node.1,
        };
    }
    let mut best = DistMsg {
        hops: INF_HOPS,
        size: 0,
    };
    for (i, m) in inbox.iter().enumerate() {
        if i == out_index || m.hops == INF_HOPS {
            continue;
        }
        if m.hops.saturating_add(1) < best.hops {
            best = DistMsg {
                hops: m.hops + 1,
                size: m.size,
            };
        }
    }
    best
}

/// Request fold: emit a request on the best-link edge iff this node needs
/// the payload itself or any other edge already requested it through us.
fn data_request(node: &(bool, Option<usize>), inbox: &[u8], out_index: usize) -> u8 {
    let (request_data, best_link) = *node;
    if Some(out_index) == best_link {
        if request_data {
            return 1;
        }
        for (i, &r) in inbox.iter().enumerate() {
            if i != out_index && r != 0 {
                return 1;
            }
        }
    }
    0
}

/// Decide the recovery routing for this node.
///
/// `size` must be the payload size when the node is a holder; for other
/// roles it is adopted from the holders' reports. Holders disagreeing on
/// the size, or an overlay with no reachable holder, are unrecoverable
/// logic faults and abort the process.
pub(crate) async fn try_decide_routing(
    base: &mut BaseEngine,
    kind: RecoverKind,
    size: usize,
) -> LinkResult<Routing> {
    let mut size = size;
    let rank = base.rank;
    let init = DistMsg {
        hops: INF_HOPS,
        size: 0,
    };
    let (dist_in, _dist_out) = base
        .msg_passing(
            &(kind == RecoverKind::HaveData, size as u64),
            init,
            shortest_dist,
        )
        .await?;

    let best_link = if kind == RecoverKind::HaveData {
        None
    } else {
        let mut best: Option<usize> = None;
        for (i, m) in dist_in.iter().enumerate() {
            if m.hops == INF_HOPS {
                continue;
            }
            assert!(
                best.is_none() || size as u64 == m.size,
                "[{rank}] Allreduce size inconsistent: hops={}, size={size}, reporting={}",
                m.hops,
                m.size
            );
            if best.is_none() || m.hops < dist_in[best.expect("just checked")].hops {
                best = Some(i);
                size = m.size as usize;
            }
        }
        assert!(
            best.is_some(),
            "[{rank}] too many nodes down, cannot recover"
        );
        best
    };

    let (req_in, req_out) = base
        .msg_passing(
            &(kind == RecoverKind::RequestData, best_link),
            0u8,
            data_request,
        )
        .await?;

    let mut flags = vec![false; req_in.len()];
    for i in 0..req_in.len() {
        flags[i] = req_in[i] != 0;
        if req_out[i] != 0 {
            assert_eq!(req_in[i], 0, "a tree edge cannot carry data both ways");
            assert_eq!(Some(i), best_link, "request emitted off the chosen route");
        }
    }

    Ok(Routing {
        size,
        recv_link: best_link,
        req_in: flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::bootstrap_local;
    use crate::config::EngineConfig;
    use crate::engine::TenaxEngine;

    async fn routing_on(
        engines: Vec<TenaxEngine>,
        roles: Vec<(RecoverKind, usize)>,
    ) -> Vec<tokio::task::JoinHandle<Routing>> {
        engines
            .into_iter()
            .zip(roles)
            .map(|(mut eng, (kind, size))| {
                tokio::spawn(async move {
                    try_decide_routing(eng.base_mut(), kind, size).await.unwrap()
                })
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_holder_star() {
        let (_seed, engines) = bootstrap_local(3, EngineConfig::default()).await.unwrap();
        // tree for world 3: edges 0-1 and 0-2
        let roles = vec![
            (RecoverKind::HaveData, 512),
            (RecoverKind::RequestData, 0),
            (RecoverKind::RequestData, 0),
        ];
        let handles = routing_on(engines, roles).await;
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        // the holder receives from nowhere and serves both edges
        assert_eq!(out[0].recv_link, None);
        assert_eq!(out[0].req_in, vec![true, true]);
        assert_eq!(out[0].size, 512);
        // requesters receive on their only edge and forward nothing
        for r in &out[1..] {
            assert_eq!(r.recv_link, Some(0));
            assert_eq!(r.req_in, vec![false]);
            assert_eq!(r.size, 512);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pass_through_node_on_route() {
        let (_seed, engines) = bootstrap_local(4, EngineConfig::default()).await.unwrap();
        // tree for world 4: edges 0-1, 0-2, 1-3; holder at 3, requester at 2,
        // so the payload must pass through 1 and 0.
        let roles = vec![
            (RecoverKind::PassData, 0),
            (RecoverKind::PassData, 0),
            (RecoverKind::RequestData, 0),
            (RecoverKind::HaveData, 256),
        ];
        let handles = routing_on(engines, roles).await;
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        // rank 0 links: [1, 2]; receives from 1, forwards to 2
        assert_eq!(out[0].recv_link, Some(0));
        assert_eq!(out[0].req_in, vec![false, true]);
        // rank 1 links: [0, 3]; receives from 3, forwards to 0
        assert_eq!(out[1].recv_link, Some(1));
        assert_eq!(out[1].req_in, vec![true, false]);
        // rank 2 links: [0]; receives, forwards nothing
        assert_eq!(out[2].recv_link, Some(0));
        assert_eq!(out[2].req_in, vec![false]);
        // rank 3 links: [1]; sources the payload
        assert_eq!(out[3].recv_link, None);
        assert_eq!(out[3].req_in, vec![true]);
        // everyone agreed on the size, and no receiver re-requests its own
        // receive edge
        for r in &out {
            assert_eq!(r.size, 256);
            if let Some(rl) = r.recv_link {
                assert!(!r.req_in[rl]);
            }
        }
        // a pass node on the route forwards at least once
        assert!(out[0].req_in.iter().any(|&b| b));
        assert!(out[1].req_in.iter().any(|&b| b));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_inconsistent_sizes_abort() {
        let (_seed, engines) = bootstrap_local(3, EngineConfig::default()).await.unwrap();
        // two holders disagreeing on the payload size: the requester at the
        // junction must abort
        let roles = vec![
            (RecoverKind::RequestData, 0),
            (RecoverKind::HaveData, 1024),
            (RecoverKind::HaveData, 2048),
        ];
        let handles = routing_on(engines, roles).await;
        let mut handles = handles.into_iter();
        let first = handles.next().expect("rank 0 handle");
        let err = first.await.expect_err("rank 0 must panic");
        assert!(err.is_panic());
        let panic = err.into_panic();
        let msg = panic
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_default();
        assert!(
            msg.contains("Allreduce size inconsistent"),
            "unexpected panic message: {msg}"
        );
        // the holders' passes fail once rank 0 is gone; outcome irrelevant
        for h in handles {
            let _ = h.await;
        }
    }
}
