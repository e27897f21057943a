//! Streaming payload recovery along the routes picked by the routing
//! sweeps. One readiness loop drives every link concurrently; the role
//! decides what each wakeup does.
//!
//! A holder fans the payload out from its own buffer; a requester fills
//! its buffer and may forward bytes it has already received; a pass node
//! streams through a bounded ring buffer, so its memory stays
//! O(buffer_size) no matter how large the payload is. Forward progress on
//! any edge is capped by what has actually arrived: a byte is never sent
//! before it has been received.

use crate::transport::{pair_mut, LinkError, LinkRecord, LinkResult};
use futures::future::select_all;
use tokio::io::Interest;

/// Tagged role of this node in a recovery transfer, carrying the buffer
/// the role needs.
pub(crate) enum RecoverRole<'a> {
    HaveData(&'a [u8]),
    RequestData(&'a mut [u8]),
    PassData,
}

/// Drive the transfer to completion over the tree links.
///
/// `recv_link` and `req_in` come from the routing decision; `buffer_size`
/// bounds the pass-through ring.
pub(crate) async fn try_recover_data(
    links: &mut [LinkRecord],
    mut role: RecoverRole<'_>,
    size: usize,
    recv_link: Option<usize>,
    req_in: &[bool],
    buffer_size: usize,
) -> LinkResult<()> {
    if links.is_empty() || size == 0 {
        return Ok(());
    }
    assert_eq!(req_in.len(), links.len(), "request flags per tree link");

    let mut sends_any = false;
    for (i, &r) in req_in.iter().enumerate() {
        if r {
            assert!(Some(i) != recv_link, "receive edge cannot also send");
            sends_any = true;
        }
    }
    // nothing to provide and nothing to receive
    if !sends_any && !matches!(role, RecoverRole::RequestData(_)) {
        return Ok(());
    }
    assert!(
        recv_link.is_some() || matches!(role, RecoverRole::HaveData(_)),
        "receiving role without a receive edge"
    );

    for l in links.iter_mut() {
        l.reset_size();
    }
    if matches!(role, RecoverRole::PassData) {
        let p = recv_link.expect("pass node receives");
        links[p].init_buffer(buffer_size.min(size).max(1));
    }
    if let RecoverRole::RequestData(buf) = &role {
        assert_eq!(buf.len(), size, "recovered result size mismatch");
    }

    let n = links.len();
    loop {
        // build this iteration's watch set
        let mut watch: Vec<(usize, Interest)> = Vec::new();
        let mut finished = true;
        if let Some(p) = recv_link {
            if links[p].size_read != size {
                finished = false;
                // a pass node with a full ring waits on its writers instead
                let headroom = if matches!(role, RecoverRole::PassData) {
                    let mut min_write = size;
                    for i in 0..n {
                        if req_in[i] {
                            min_write = min_write.min(links[i].size_write);
                        }
                    }
                    min_write + links[p].buffer_len() > links[p].size_read
                } else {
                    true
                };
                if headroom {
                    watch.push((p, Interest::READABLE));
                }
            }
        }
        let received = recv_link.map(|p| links[p].size_read);
        for i in 0..n {
            if req_in[i] && links[i].size_write != size {
                finished = false;
                // holders can always push; everyone else only once bytes
                // beyond the peer's cursor have arrived
                let can_write = match role {
                    RecoverRole::HaveData(_) => true,
                    _ => received.expect("receiving role has a receive edge")
                        != links[i].size_write,
                };
                if can_write {
                    watch.push((i, Interest::WRITABLE));
                }
            }
        }
        if finished {
            return Ok(());
        }

        // park until any watched link is ready
        {
            let futs: Vec<_> = watch
                .iter()
                .map(|&(i, interest)| {
                    let sock = links[i].socket();
                    Box::pin(async move { (i, sock.ready(interest).await) })
                })
                .collect();
            let ((idx, res), _, rest) = select_all(futs).await;
            drop(rest);
            if res.is_err() {
                links[idx].close();
                return Err(LinkError::SockError);
            }
        }

        // attempt progress everywhere; would-block attempts are no-ops
        match &mut role {
            RecoverRole::RequestData(buf) => {
                let p = recv_link.expect("requester receives");
                links[p].read_to_array(buf, size)?;
                let received = links[p].size_read;
                for i in 0..n {
                    if req_in[i] && links[i].size_write < received {
                        links[i].write_from_array(buf, received)?;
                    }
                }
            }
            RecoverRole::HaveData(buf) => {
                for i in 0..n {
                    if req_in[i] && links[i].size_write != size {
                        links[i].write_from_array(buf, size)?;
                    }
                }
            }
            RecoverRole::PassData => {
                let p = recv_link.expect("pass node receives");
                // the ring may only advance past what the slowest writer
                // has already sent
                let mut min_write = size;
                for i in 0..n {
                    if req_in[i] {
                        min_write = min_write.min(links[i].size_write);
                    }
                }
                assert!(min_write <= links[p].size_read, "ring cursor out of bounds");
                links[p].read_to_ring_buffer(min_write, size)?;
                for i in 0..n {
                    if !req_in[i] {
                        continue;
                    }
                    let (dst, src) = pair_mut(links, i, p);
                    if src.size_read != dst.size_write {
                        let blen = src.buffer_len();
                        let start = dst.size_write % blen;
                        let nwrite = (blen - start).min(src.size_read - dst.size_write);
                        let sent = dst.try_write_raw(src.ring_chunk(start, nwrite))?;
                        dst.size_write += sent;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::link_pair;

    #[tokio::test]
    async fn test_zero_size_is_noop() {
        let mut links: Vec<LinkRecord> = Vec::new();
        try_recover_data(&mut links, RecoverRole::PassData, 0, None, &[], 64)
            .await
            .unwrap();

        let (a, b) = link_pair().await;
        let mut links = vec![a];
        try_recover_data(
            &mut links,
            RecoverRole::HaveData(&[]),
            0,
            None,
            &[false],
            64,
        )
        .await
        .unwrap();
        drop(b);
    }

    #[tokio::test]
    async fn test_idle_role_exits_without_io() {
        let (a, b) = link_pair().await;
        // a pass node nobody requested anything from
        let mut links = vec![a];
        try_recover_data(&mut links, RecoverRole::PassData, 1024, Some(0), &[false], 64)
            .await
            .unwrap();
        drop(b);
    }

    #[tokio::test]
    async fn test_holder_to_requester() {
        let (a, b) = link_pair().await;
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
        let size = payload.len();

        let holder = {
            let payload = payload.clone();
            tokio::spawn(async move {
                let mut links = vec![a];
                try_recover_data(
                    &mut links,
                    RecoverRole::HaveData(&payload),
                    size,
                    None,
                    &[true],
                    64,
                )
                .await
                .unwrap();
            })
        };
        let requester = tokio::spawn(async move {
            let mut links = vec![b];
            let mut buf = vec![0u8; size];
            try_recover_data(
                &mut links,
                RecoverRole::RequestData(&mut buf),
                size,
                Some(0),
                &[false],
                64,
            )
            .await
            .unwrap();
            buf
        });

        holder.await.unwrap();
        assert_eq!(requester.await.unwrap(), payload);
    }

    // holder → pass → requester, with a ring buffer far smaller than the
    // payload so the pass node must wrap repeatedly
    #[tokio::test]
    async fn test_pass_through_small_ring() {
        let (h_out, p_in) = link_pair().await;
        let (p_out, r_in) = link_pair().await;
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 199) as u8).collect();
        let size = payload.len();

        let holder = {
            let payload = payload.clone();
            tokio::spawn(async move {
                let mut links = vec![h_out];
                try_recover_data(
                    &mut links,
                    RecoverRole::HaveData(&payload),
                    size,
                    None,
                    &[true],
                    128,
                )
                .await
                .unwrap();
            })
        };
        let pass = tokio::spawn(async move {
            // link 0 receives from the holder, link 1 serves the requester
            let mut links = vec![p_in, p_out];
            try_recover_data(
                &mut links,
                RecoverRole::PassData,
                size,
                Some(0),
                &[false, true],
                128,
            )
            .await
            .unwrap();
        });
        let requester = tokio::spawn(async move {
            let mut links = vec![r_in];
            let mut buf = vec![0u8; size];
            try_recover_data(
                &mut links,
                RecoverRole::RequestData(&mut buf),
                size,
                Some(0),
                &[false],
                128,
            )
            .await
            .unwrap();
            buf
        });

        holder.await.unwrap();
        pass.await.unwrap();
        assert_eq!(requester.await.unwrap(), payload);
    }

    // a requester in the middle of the route both receives and forwards
    #[tokio::test]
    async fn test_requester_forwards_downstream() {
        let (h_out, mid_in) = link_pair().await;
        let (mid_out, tail_in) = link_pair().await;
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 127) as u8).collect();
        let size = payload.len();

        let holder = {
            let payload = payload.clone();
            tokio::spawn(async move {
                let mut links = vec![h_out];
                try_recover_data(
                    &mut links,
                    RecoverRole::HaveData(&payload),
                    size,
                    None,
                    &[true],
                    64,
                )
                .await
                .unwrap();
            })
        };
        let mid = tokio::spawn(async move {
            let mut links = vec![mid_in, mid_out];
            let mut buf = vec![0u8; size];
            try_recover_data(
                &mut links,
                RecoverRole::RequestData(&mut buf),
                size,
                Some(0),
                &[false, true],
                64,
            )
            .await
            .unwrap();
            buf
        });
        let tail = tokio::spawn(async move {
            let mut links = vec![tail_in];
            let mut buf = vec![0u8; size];
            try_recover_data(
                &mut links,
                RecoverRole::RequestData(&mut buf),
                size,
                Some(0),
                &[false],
                64,
            )
            .await
            .unwrap();
            buf
        });

        holder.await.unwrap();
        assert_eq!(mid.await.unwrap(), payload);
        assert_eq!(tail.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_dead_peer_is_sock_error() {
        let (a, b) = link_pair().await;
        drop(a);
        let mut links = vec![b];
        let mut buf = vec![0u8; 128];
        let err = try_recover_data(
            &mut links,
            RecoverRole::RequestData(&mut buf),
            128,
            Some(0),
            &[false],
            64,
        )
        .await
        .unwrap_err();
        assert_eq!(err, LinkError::SockError);
    }
}
