//! Out-of-band-style link reset: after a fault, purge whatever half-sent
//! bytes are still in flight on every surviving link so both ends of each
//! stream are aligned again.
//!
//! Three phases per link (see `RESET_SYNC` / `RESET_ACK` for the wire
//! bytes): emit the sync marker, drain inbound bytes until the peer's
//! marker has been consumed, then exchange one acknowledgement byte in
//! each direction. Peers that closed mid-protocol leave their link bad and
//! the whole reset reports `SockError`.

use crate::transport::{LinkError, LinkRecord, LinkResult, RESET_ACK, RESET_SYNC};
use futures::future::select_all;
use tokio::io::Interest;

pub(crate) async fn try_reset_links(links: &mut [LinkRecord]) -> LinkResult<()> {
    for l in links.iter_mut() {
        l.reset_size();
        l.reset_scanner();
    }

    // phase 1: push the sync marker out on every live link
    loop {
        let mut pending = Vec::new();
        for (i, l) in links.iter().enumerate() {
            if !l.is_bad() && l.size_write < RESET_SYNC.len() {
                pending.push(i);
            }
        }
        if pending.is_empty() {
            break;
        }
        for &i in &pending {
            // a failed write marks the link bad; filtered next round
            let _ = links[i].write_from_array(&RESET_SYNC, RESET_SYNC.len());
        }
        let still: Vec<usize> = pending
            .into_iter()
            .filter(|&i| !links[i].is_bad() && links[i].size_write < RESET_SYNC.len())
            .collect();
        if still.is_empty() {
            continue;
        }
        wait_any(links, &still, Interest::WRITABLE).await;
    }

    // phase 2: discard inbound bytes until each peer's marker arrives
    let mut drained: Vec<bool> = links.iter().map(|l| l.is_bad()).collect();
    loop {
        let mut pending = Vec::new();
        for (i, l) in links.iter().enumerate() {
            if !drained[i] && !l.is_bad() {
                pending.push(i);
            }
        }
        if pending.is_empty() {
            break;
        }
        for &i in &pending {
            match links[i].try_drain() {
                Ok(true) => drained[i] = true,
                Ok(false) => {}
                Err(_) => drained[i] = true,
            }
        }
        let still: Vec<usize> = pending
            .into_iter()
            .filter(|&i| !drained[i] && !links[i].is_bad())
            .collect();
        if still.is_empty() {
            continue;
        }
        wait_any(links, &still, Interest::READABLE).await;
    }

    // phase 3: acknowledge in both directions
    for l in links.iter_mut() {
        if !l.is_bad() && l.send_all(&[RESET_ACK]).await.is_err() {
            l.close();
        }
    }
    for l in links.iter_mut() {
        if l.is_bad() {
            continue;
        }
        let mut ack = [0u8; 1];
        match l.recv_exact(&mut ack).await {
            Ok(()) => assert_eq!(ack[0], RESET_ACK, "wrong reset acknowledgement byte"),
            Err(_) => l.close(),
        }
    }

    if links.iter().any(|l| l.is_bad()) {
        Err(LinkError::SockError)
    } else {
        Ok(())
    }
}

/// Block until any of the given links is ready for `interest`. Readiness
/// errors close the link; the caller's next round filters it out.
async fn wait_any(links: &mut [LinkRecord], indices: &[usize], interest: Interest) {
    let (idx, res) = {
        let futs: Vec<_> = indices
            .iter()
            .map(|&i| {
                let sock = links[i].socket();
                Box::pin(async move { (i, sock.ready(interest).await) })
            })
            .collect();
        let ((idx, res), _, rest) = select_all(futs).await;
        drop(rest);
        (idx, res)
    };
    if res.is_err() {
        links[idx].close();
    }
}
