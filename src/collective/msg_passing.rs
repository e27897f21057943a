//! Generic two-pass message passing over the reduction tree.
//!
//! Each tree edge carries one fixed-width message in each direction. The
//! up pass flows from the leaves to the root, the down pass back out. The
//! fold for an outgoing edge `e` sees the messages of every other edge:
//! by the time `out[e]` is computed, `in[i]` has arrived for all `i != e`.
//! This is the primitive behind recovery routing: shortest distance to a
//! payload holder, then per-edge data requests.

use crate::transport::{LinkRecord, LinkResult};

/// Fixed-width little-endian wire codec for message-passing values.
pub(crate) trait Wire: Copy {
    const SIZE: usize;
    fn encode(&self, out: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

impl Wire for u8 {
    const SIZE: usize = 1;
    fn encode(&self, out: &mut [u8]) {
        out[0] = *self;
    }
    fn decode(buf: &[u8]) -> Self {
        buf[0]
    }
}

/// Run one up-down pass over the tree links.
///
/// `links` is the tree-link slice, `parent` the parent's index within it
/// (`None` at the root). Returns `(inbox, outbox)`: the message received
/// and sent on each edge. Slots never exchanged (the parent slot of a
/// fold at the root, for example) hold `init`.
pub(crate) async fn msg_passing<V, M, F>(
    links: &mut [LinkRecord],
    parent: Option<usize>,
    node_value: &V,
    init: M,
    func: F,
) -> LinkResult<(Vec<M>, Vec<M>)>
where
    M: Wire,
    F: Fn(&V, &[M], usize) -> M,
{
    let n = links.len();
    let mut inbox = vec![init; n];
    let mut outbox = vec![init; n];

    // up pass: collect from every child edge
    for i in 0..n {
        if Some(i) != parent {
            inbox[i] = recv_msg(&mut links[i]).await?;
        }
    }
    if let Some(p) = parent {
        outbox[p] = func(node_value, &inbox, p);
        send_msg(&mut links[p], &outbox[p]).await?;
        inbox[p] = recv_msg(&mut links[p]).await?;
    }
    // down pass: answer every child edge
    for i in 0..n {
        if Some(i) != parent {
            outbox[i] = func(node_value, &inbox, i);
            send_msg(&mut links[i], &outbox[i]).await?;
        }
    }
    Ok((inbox, outbox))
}

async fn send_msg<M: Wire>(link: &mut LinkRecord, msg: &M) -> LinkResult<()> {
    let mut buf = vec![0u8; M::SIZE];
    msg.encode(&mut buf);
    link.send_all(&buf).await
}

async fn recv_msg<M: Wire>(link: &mut LinkRecord) -> LinkResult<M> {
    let mut buf = vec![0u8; M::SIZE];
    link.recv_exact(&mut buf).await?;
    Ok(M::decode(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::link_pair;

    // Two nodes, one edge: distance-style fold where each node reports
    // whether it holds a token.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct Hops(u32);

    impl Wire for Hops {
        const SIZE: usize = 4;
        fn encode(&self, out: &mut [u8]) {
            out.copy_from_slice(&self.0.to_le_bytes());
        }
        fn decode(buf: &[u8]) -> Self {
            Hops(u32::from_le_bytes(buf.try_into().unwrap()))
        }
    }

    #[tokio::test]
    async fn test_two_node_pass() {
        let (a, b) = link_pair().await;

        let fold = |has: &bool, inbox: &[Hops], out: usize| {
            if *has {
                return Hops(1);
            }
            let mut best = Hops(u32::MAX);
            for (i, m) in inbox.iter().enumerate() {
                if i != out && m.0 != u32::MAX && m.0 + 1 < best.0 {
                    best = Hops(m.0 + 1);
                }
            }
            best
        };

        // node A is the root and holds the token; node B is its child.
        let root = tokio::spawn(async move {
            let mut links = vec![a];
            let (inbox, outbox) =
                msg_passing(&mut links, None, &true, Hops(u32::MAX), fold)
                    .await
                    .unwrap();
            (inbox, outbox)
        });
        let child = tokio::spawn(async move {
            let mut links = vec![b];
            let (inbox, outbox) =
                msg_passing(&mut links, Some(0), &false, Hops(u32::MAX), fold)
                    .await
                    .unwrap();
            (inbox, outbox)
        });

        let (r_in, r_out) = root.await.unwrap();
        let (c_in, c_out) = child.await.unwrap();
        // child saw the holder one hop away; root saw no holder through the child
        assert_eq!(c_in[0], Hops(1));
        assert_eq!(c_out[0], Hops(u32::MAX));
        assert_eq!(r_in[0], Hops(u32::MAX));
        assert_eq!(r_out[0], Hops(1));
    }
}
