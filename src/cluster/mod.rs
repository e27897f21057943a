//! Cluster formation: the seed rendezvous service, the deterministic
//! overlay topology, and an in-process bootstrap helper for tests and
//! single-machine runs.

mod seed;
pub(crate) mod topology;

pub use seed::SeedNode;

use crate::config::EngineConfig;
use crate::engine::TenaxEngine;
use crate::error::{Result, TenaxError};
use std::net::SocketAddr;

/// Handle to a locally spawned seed task. Dropping it stops the seed.
pub struct SeedHandle {
    addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl SeedHandle {
    /// Address restarted workers should rendezvous at.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for SeedHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn a seed on an ephemeral localhost port and connect `world_size`
/// engines to it, all inside the current runtime.
///
/// Engines come back in rank order. Keep the returned [`SeedHandle`] alive
/// for as long as any engine may need to rebuild links.
pub async fn bootstrap_local(
    world_size: u32,
    config: EngineConfig,
) -> Result<(SeedHandle, Vec<TenaxEngine>)> {
    let seed = SeedNode::bind("127.0.0.1:0", world_size).await?;
    let addr = seed.local_addr()?;
    let task = tokio::spawn(seed.run());
    let seed_handle = SeedHandle { addr, task };

    let mut joins = Vec::new();
    for _ in 0..world_size {
        let cfg = config.clone();
        joins.push(tokio::spawn(async move {
            TenaxEngine::connect(addr, None, cfg).await
        }));
    }

    let mut engines = Vec::with_capacity(world_size as usize);
    for j in joins {
        engines.push(j.await.map_err(|e| {
            TenaxError::transport_with_source("bootstrap worker task panicked", e)
        })??);
    }
    engines.sort_by_key(|e| e.rank());
    Ok((seed_handle, engines))
}
