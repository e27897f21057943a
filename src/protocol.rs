//! Control messages for the rendezvous protocol.
//!
//! Collective payloads do NOT flow through this module: data-plane words
//! (action summaries, routing messages) are hand-packed fixed-width
//! little-endian values written straight onto the links. Only the seed
//! handshake uses framed rkyv messages.

use crate::error::{Result, TenaxError};
use crate::types::Rank;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound for a framed control message. The link table for even very
/// large clusters stays well below this.
const MAX_FRAME: usize = 1 << 20;

/// Messages exchanged with the seed node during link formation.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub(crate) enum ClusterMessage {
    /// Worker registration for the current link epoch. `rank` is `None` on
    /// first join (the seed assigns one) and the worker's stable rank on
    /// every re-registration after a fault.
    Join {
        protocol_version: u16,
        rank: Option<Rank>,
        listen_addr: String,
    },

    /// The seed's reply once all ranks have registered: the complete
    /// listener table for this epoch.
    Table {
        epoch: u64,
        rank: Rank,
        world_size: u32,
        peers: Vec<(Rank, String)>,
    },
}

/// Write a `[len: u32 LE][rkyv payload]` frame.
pub(crate) async fn send_message(stream: &mut TcpStream, msg: &ClusterMessage) -> Result<()> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| TenaxError::EncodeFailed(e.to_string()))?;
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one `[len: u32 LE][rkyv payload]` frame.
pub(crate) async fn recv_message(stream: &mut TcpStream) -> Result<ClusterMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(TenaxError::DecodeFailed(format!(
            "control frame too large: {len} bytes"
        )));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    rkyv::from_bytes::<ClusterMessage, rkyv::rancor::Error>(&payload)
        .map_err(|e| TenaxError::DecodeFailed(e.to_string()))
}
