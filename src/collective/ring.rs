//! Pipelined store-and-forward streaming on the ring overlay.
//!
//! `buf[0..read_ptr)` is already present locally; `[read_ptr, read_end)`
//! arrives from the previous ring link while `[write_ptr, write_end)`
//! streams to the next link. A byte is never forwarded before it has been
//! received: `write_ptr <= read_ptr` holds at every step.

use crate::transport::{LinkError, LinkRecord, LinkResult};
use tokio::io::Interest;

enum ReadySide {
    Read,
    Write,
}

/// Stream bytes through this node's position on the ring.
///
/// Requires `read_ptr <= read_end`, `write_ptr <= write_end`,
/// `write_end <= read_end` and `write_ptr <= read_ptr`.
pub(crate) async fn ring_passing(
    buf: &mut [u8],
    mut read_ptr: usize,
    read_end: usize,
    mut write_ptr: usize,
    write_end: usize,
    prev: &mut LinkRecord,
    next: &mut LinkRecord,
) -> LinkResult<()> {
    if read_end == 0 {
        return Ok(());
    }
    assert!(read_ptr <= read_end, "read cursor out of range");
    assert!(write_ptr <= write_end, "write cursor out of range");
    assert!(write_end <= read_end, "cannot send bytes that never arrive");
    assert!(write_ptr <= read_ptr, "cannot send a byte not yet received");

    loop {
        let watch_read = read_ptr != read_end;
        let watch_write = write_ptr < read_ptr && write_ptr != write_end;
        if !watch_read && write_ptr == write_end {
            break;
        }

        let side = {
            let rsock = prev.socket();
            let wsock = next.socket();
            tokio::select! {
                r = rsock.ready(Interest::READABLE), if watch_read => {
                    r.map(|_| ReadySide::Read)
                }
                w = wsock.ready(Interest::WRITABLE), if watch_write => {
                    w.map(|_| ReadySide::Write)
                }
            }
        };

        match side {
            Ok(ReadySide::Read) => {
                let n = prev.try_read_scan(&mut buf[read_ptr..read_end])?;
                read_ptr += n;
            }
            Ok(ReadySide::Write) => {
                let nsend = (write_end - write_ptr).min(read_ptr - write_ptr);
                let n = next.try_write_raw(&buf[write_ptr..write_ptr + nsend])?;
                write_ptr += n;
            }
            Err(_) => {
                prev.close();
                next.close();
                return Err(LinkError::SockError);
            }
        }

        debug_assert!(write_ptr <= read_ptr && read_ptr <= read_end);
        debug_assert!(write_ptr <= write_end);
    }
    Ok(())
}
