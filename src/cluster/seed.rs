//! The seed node: a tiny rendezvous service that turns rank registrations
//! into link tables.
//!
//! Link formation proceeds in *epochs*. In each epoch the seed collects one
//! registration per rank (a listener address) and, once all ranks of the
//! configured world are present, replies to every member with the complete
//! table. Workers rebuild their neighbor links from the table; after any
//! fault the survivors (and the restarted rank) simply register for the
//! next epoch. The seed holds no collective state and can outlive any
//! number of worker incarnations.

use crate::error::{Result, TenaxError};
use crate::protocol::{recv_message, send_message, ClusterMessage};
use crate::types::{Rank, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// The rendezvous service. Bind it, then drive [`SeedNode::run`] on a task.
pub struct SeedNode {
    listener: TcpListener,
    world_size: u32,
}

impl SeedNode {
    /// Bind a seed node for a cluster of `world_size` ranks.
    pub async fn bind(addr: &str, world_size: u32) -> Result<Self> {
        if world_size == 0 {
            return Err(TenaxError::InvalidRank {
                rank: 0,
                world_size,
            });
        }
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            world_size,
        })
    }

    /// The address workers should connect to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve link epochs forever (or until the task is dropped).
    pub async fn run(self) {
        let mut epoch: u64 = 0;
        let mut next_fresh_rank: Rank = 0;
        loop {
            if let Err(e) = self
                .serve_epoch(epoch, &mut next_fresh_rank)
                .await
            {
                tracing::warn!(epoch, error = %e, "seed epoch aborted, restarting");
            }
            epoch += 1;
        }
    }

    /// Collect one registration per rank, then publish the table.
    async fn serve_epoch(&self, epoch: u64, next_fresh_rank: &mut Rank) -> Result<()> {
        let mut members: HashMap<Rank, (String, TcpStream)> = HashMap::new();

        while members.len() < self.world_size as usize {
            let (mut conn, remote) = self.listener.accept().await?;
            conn.set_nodelay(true).ok();
            let join = match tokio::time::timeout(
                std::time::Duration::from_secs(5),
                recv_message(&mut conn),
            )
            .await
            {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => {
                    tracing::debug!(%remote, error = %e, "dropping malformed registration");
                    continue;
                }
                Err(_) => {
                    tracing::debug!(%remote, "registration timed out");
                    continue;
                }
            };
            let (protocol_version, rank, listen_addr) = match join {
                ClusterMessage::Join {
                    protocol_version,
                    rank,
                    listen_addr,
                } => (protocol_version, rank, listen_addr),
                other => {
                    tracing::debug!(%remote, "expected Join, got {other:?}");
                    continue;
                }
            };
            if protocol_version != PROTOCOL_VERSION {
                tracing::warn!(
                    %remote,
                    local = PROTOCOL_VERSION,
                    remote_version = protocol_version,
                    "rejecting worker with mismatched protocol"
                );
                continue;
            }
            let rank = match rank {
                Some(r) if r < self.world_size => r,
                Some(r) => {
                    tracing::warn!(rank = r, world_size = self.world_size, "rank out of range");
                    continue;
                }
                None => {
                    if *next_fresh_rank >= self.world_size {
                        tracing::warn!("no free ranks left for unranked joiner");
                        continue;
                    }
                    let r = *next_fresh_rank;
                    *next_fresh_rank += 1;
                    r
                }
            };
            // a retrying worker replaces its stale registration
            members.insert(rank, (listen_addr, conn));
            tracing::info!(
                epoch,
                rank,
                joined = members.len(),
                expected = self.world_size,
                "worker registered"
            );
        }

        let mut peers: Vec<(Rank, String)> = members
            .iter()
            .map(|(&r, (addr, _))| (r, addr.clone()))
            .collect();
        peers.sort_unstable_by_key(|&(r, _)| r);

        for (rank, (_, mut conn)) in members {
            let table = ClusterMessage::Table {
                epoch,
                rank,
                world_size: self.world_size,
                peers: peers.clone(),
            };
            if let Err(e) = send_message(&mut conn, &table).await {
                // the worker will re-register next epoch
                tracing::warn!(rank, error = %e, "failed to publish table");
            }
        }
        tracing::info!(epoch, world_size = self.world_size, "link table published");
        Ok(())
    }
}
