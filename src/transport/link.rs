use crate::types::Rank;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;

/// Transient fault classification for a collective in flight.
///
/// `SockError` is a closed peer or a non-retryable I/O error; `GetExcept`
/// means the reset sync marker was observed in-stream: the peer has begun
/// a link reset. Both collapse the current operation and drive recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkError {
    SockError,
    GetExcept,
}

pub(crate) type LinkResult<T> = std::result::Result<T, LinkError>;

/// In-band sync marker for the link reset protocol. Replaces the TCP
/// urgent-mode byte of classic implementations: after a fault, each side
/// emits the marker and drains inbound bytes until it has consumed one.
/// A marker observed outside a reset drain surfaces as [`LinkError::GetExcept`].
pub(crate) const RESET_SYNC: [u8; 8] = [0x5F, 0x54, 0x4E, 0x58, 0x97, 0x13, 0xC4, 0x7E];

/// Acknowledgement byte exchanged in both directions after the drain.
pub(crate) const RESET_ACK: u8 = 0x61;

/// Streaming matcher for [`RESET_SYNC`].
///
/// The marker's first byte does not recur inside the pattern, so the
/// failure transition on a mismatch is simply "restart, possibly at 1".
#[derive(Debug, Default)]
pub(crate) struct MarkScanner {
    matched: usize,
}

impl MarkScanner {
    /// Feed a chunk of inbound bytes. Returns `Some(i)` where `i` is the
    /// offset just past the final marker byte if a complete marker was
    /// consumed within `bytes`.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Option<usize> {
        for (i, &b) in bytes.iter().enumerate() {
            if b == RESET_SYNC[self.matched] {
                self.matched += 1;
                if self.matched == RESET_SYNC.len() {
                    self.matched = 0;
                    return Some(i + 1);
                }
            } else if b == RESET_SYNC[0] {
                self.matched = 1;
            } else {
                self.matched = 0;
            }
        }
        None
    }

    pub(crate) fn reset(&mut self) {
        self.matched = 0;
    }
}

/// One point-to-point link: an owned non-blocking TCP stream plus the
/// transfer state the recovery loops operate on.
///
/// `size_read` / `size_write` are per-operation cursors (reset via
/// [`LinkRecord::reset_size`]); `buffer` is the store-and-forward ring used
/// when this node passes a payload through without keeping it.
pub(crate) struct LinkRecord {
    pub(crate) peer: Rank,
    sock: Option<TcpStream>,
    pub(crate) size_read: usize,
    pub(crate) size_write: usize,
    buffer: Vec<u8>,
    scanner: MarkScanner,
    /// Bytes read past a drained reset marker, handed back to the next read.
    pending: Vec<u8>,
}

impl LinkRecord {
    pub(crate) fn new(peer: Rank, sock: TcpStream) -> Self {
        Self {
            peer,
            sock: Some(sock),
            size_read: 0,
            size_write: 0,
            buffer: Vec::new(),
            scanner: MarkScanner::default(),
            pending: Vec::new(),
        }
    }

    pub(crate) fn is_bad(&self) -> bool {
        self.sock.is_none()
    }

    pub(crate) fn close(&mut self) {
        self.sock = None;
    }

    /// The underlying stream, for readiness watching. Panics on a closed
    /// link; callers filter bad links out of every watch set.
    pub(crate) fn socket(&self) -> &TcpStream {
        self.sock.as_ref().expect("watched link is closed")
    }

    /// Wait until the link is ready for `interest`. I/O errors close the
    /// link and report `SockError`.
    pub(crate) async fn watch(&mut self, interest: Interest) -> LinkResult<Ready> {
        let sock = self.sock.as_ref().ok_or(LinkError::SockError)?;
        match sock.ready(interest).await {
            Ok(ready) => Ok(ready),
            Err(_) => {
                self.close();
                Err(LinkError::SockError)
            }
        }
    }

    pub(crate) fn reset_size(&mut self) {
        self.size_read = 0;
        self.size_write = 0;
    }

    pub(crate) fn reset_scanner(&mut self) {
        self.scanner.reset();
        self.pending.clear();
    }

    /// Ensure the pass-through ring buffer holds exactly `n` bytes.
    pub(crate) fn init_buffer(&mut self, n: usize) {
        self.buffer.clear();
        self.buffer.resize(n, 0);
    }

    pub(crate) fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// A contiguous chunk of the ring buffer, for forwarding.
    pub(crate) fn ring_chunk(&self, start: usize, len: usize) -> &[u8] {
        &self.buffer[start..start + len]
    }

    /// One non-blocking read into `dst`, scanned for the reset marker.
    ///
    /// Returns the number of bytes read (0 on would-block), `SockError` on
    /// EOF or I/O error (closing the link), `GetExcept` if the marker
    /// completed inside the received bytes.
    pub(crate) fn try_read_scan(&mut self, dst: &mut [u8]) -> LinkResult<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        if !self.pending.is_empty() {
            let n = self.pending.len().min(dst.len());
            dst[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            // pushed-back bytes were already scanned
            return Ok(n);
        }
        let sock = self.sock.as_ref().ok_or(LinkError::SockError)?;
        match sock.try_read(dst) {
            Ok(0) => {
                self.close();
                Err(LinkError::SockError)
            }
            Ok(n) => {
                if self.scanner.feed(&dst[..n]).is_some() {
                    Err(LinkError::GetExcept)
                } else {
                    Ok(n)
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(_) => {
                self.close();
                Err(LinkError::SockError)
            }
        }
    }

    /// One non-blocking write of `src`. Returns bytes written (0 on
    /// would-block), `SockError` on I/O error (closing the link).
    pub(crate) fn try_write_raw(&mut self, src: &[u8]) -> LinkResult<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let sock = self.sock.as_ref().ok_or(LinkError::SockError)?;
        match sock.try_write(src) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(_) => {
                self.close();
                Err(LinkError::SockError)
            }
        }
    }

    /// Cursor-tracked read: fill `dst[size_read..max_size]` by one
    /// non-blocking read, advancing `size_read`.
    pub(crate) fn read_to_array(&mut self, dst: &mut [u8], max_size: usize) -> LinkResult<()> {
        if self.size_read == max_size {
            return Ok(());
        }
        let start = self.size_read;
        let n = self.try_read_scan(&mut dst[start..max_size])?;
        self.size_read += n;
        Ok(())
    }

    /// Cursor-tracked write: send from `src[size_write..max_size]` by one
    /// non-blocking write, advancing `size_write`.
    pub(crate) fn write_from_array(&mut self, src: &[u8], max_size: usize) -> LinkResult<()> {
        if self.size_write == max_size {
            return Ok(());
        }
        let n = self.try_write_raw(&src[self.size_write..max_size])?;
        self.size_write += n;
        Ok(())
    }

    /// Cursor-tracked ring read for pass-through streaming: read into the
    /// ring at `size_read % buffer_len`, bounded by the headroom left above
    /// the slowest writer (`protect_min`) and by `max_size` total bytes.
    pub(crate) fn read_to_ring_buffer(
        &mut self,
        protect_min: usize,
        max_size: usize,
    ) -> LinkResult<()> {
        debug_assert!(protect_min <= self.size_read);
        let blen = self.buffer.len();
        let headroom = protect_min + blen - self.size_read;
        let nmax = headroom.min(max_size - self.size_read);
        if nmax == 0 {
            return Ok(());
        }
        let start = self.size_read % blen;
        let n_contig = nmax.min(blen - start);
        let mut buffer = std::mem::take(&mut self.buffer);
        let res = self.try_read_scan(&mut buffer[start..start + n_contig]);
        self.buffer = buffer;
        self.size_read += res?;
        Ok(())
    }

    /// Await-based write of the whole of `src`.
    pub(crate) async fn send_all(&mut self, src: &[u8]) -> LinkResult<()> {
        let mut sent = 0;
        while sent < src.len() {
            self.watch(Interest::WRITABLE).await?;
            sent += self.try_write_raw(&src[sent..])?;
        }
        Ok(())
    }

    /// Await-based read filling the whole of `dst`, marker-scanned.
    pub(crate) async fn recv_exact(&mut self, dst: &mut [u8]) -> LinkResult<()> {
        let mut got = 0;
        while got < dst.len() {
            self.watch(Interest::READABLE).await?;
            got += self.try_read_scan(&mut dst[got..])?;
        }
        Ok(())
    }

    /// Reset-drain step: read and discard inbound bytes until the sync
    /// marker has been consumed. Returns `Ok(true)` once the marker is
    /// reached; bytes following the marker in the same segment are pushed
    /// back for the next read. EOF closes the link quietly (the reset
    /// protocol reports it at the end).
    pub(crate) fn try_drain(&mut self) -> LinkResult<bool> {
        if !self.pending.is_empty() {
            let stash = std::mem::take(&mut self.pending);
            if let Some(past) = self.scanner.feed(&stash) {
                self.pending.extend_from_slice(&stash[past..]);
                return Ok(true);
            }
            return Ok(false);
        }
        let sock = match self.sock.as_ref() {
            Some(s) => s,
            None => return Ok(false),
        };
        let mut scratch = [0u8; 4096];
        match sock.try_read(&mut scratch) {
            Ok(0) => {
                self.close();
                Ok(false)
            }
            Ok(n) => {
                if let Some(past) = self.scanner.feed(&scratch[..n]) {
                    self.pending.extend_from_slice(&scratch[past..n]);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(_) => {
                self.close();
                Ok(false)
            }
        }
    }
}

impl std::fmt::Debug for LinkRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkRecord")
            .field("peer", &self.peer)
            .field("bad", &self.is_bad())
            .field("size_read", &self.size_read)
            .field("size_write", &self.size_write)
            .finish()
    }
}
