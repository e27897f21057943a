//! The non-robust collective core: owns the link vector, rebuilds it
//! through the seed after faults, and exposes the tree/ring collective
//! primitives the recovery layer drives.

use crate::cluster::topology::{Topology, LINK_ROLE_RING, LINK_ROLE_TREE};
use crate::collective::msg_passing::{msg_passing, Wire};
use crate::collective::{allreduce, broadcast, ReduceFunction};
use crate::config::EngineConfig;
use crate::error::{Result, TenaxError};
use crate::protocol::{recv_message, send_message, ClusterMessage};
use crate::transport::{LinkRecord, LinkResult};
use crate::types::{Rank, PROTOCOL_VERSION};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// One epoch's worth of established links.
struct LinkSet {
    links: Vec<LinkRecord>,
    num_tree_links: usize,
    parent_index: Option<usize>,
    ring_prev: Option<usize>,
    ring_next: Option<usize>,
}

pub(crate) struct BaseEngine {
    pub(crate) rank: Rank,
    pub(crate) world_size: u32,
    seed_addr: SocketAddr,
    config: EngineConfig,
    pub(crate) links: Vec<LinkRecord>,
    pub(crate) num_tree_links: usize,
    pub(crate) parent_index: Option<usize>,
    ring_prev: Option<usize>,
    ring_next: Option<usize>,
    /// Ring-buffer size for pass-through streaming; runtime-tunable via
    /// `set_param("reduce_buffer_size", ..)`.
    pub(crate) reduce_buffer_size: usize,
}

impl BaseEngine {
    /// Register with the seed and establish the first set of links.
    pub(crate) async fn connect(
        seed_addr: SocketAddr,
        rank: Option<Rank>,
        config: EngineConfig,
    ) -> Result<Self> {
        let buffer_size = config.buffer_size;
        let (rank, world_size, epoch, set) = rendezvous_once(seed_addr, rank, &config).await?;
        tracing::info!(rank, world_size, epoch, "joined cluster");
        Ok(Self {
            rank,
            world_size,
            seed_addr,
            config,
            links: set.links,
            num_tree_links: set.num_tree_links,
            parent_index: set.parent_index,
            ring_prev: set.ring_prev,
            ring_next: set.ring_next,
            reduce_buffer_size: buffer_size,
        })
    }

    pub(crate) fn close_all_links(&mut self) {
        for l in &mut self.links {
            l.close();
        }
        self.links.clear();
        self.num_tree_links = 0;
        self.parent_index = None;
        self.ring_prev = None;
        self.ring_next = None;
    }

    /// Rebuild every link through the seed. Retries forever: recovery from
    /// a transient fault must not give up while the job is alive.
    pub(crate) async fn reconnect_links(&mut self, reason: &str) {
        self.close_all_links();
        loop {
            match rendezvous_once(self.seed_addr, Some(self.rank), &self.config).await {
                Ok((_, _, epoch, set)) => {
                    tracing::info!(rank = self.rank, epoch, reason, "links rebuilt");
                    self.links = set.links;
                    self.num_tree_links = set.num_tree_links;
                    self.parent_index = set.parent_index;
                    self.ring_prev = set.ring_prev;
                    self.ring_next = set.ring_next;
                    return;
                }
                Err(e) => {
                    tracing::warn!(rank = self.rank, reason, error = %e, "link rebuild failed, retrying");
                    tokio::time::sleep(self.config.reconnect_backoff).await;
                }
            }
        }
    }

    pub(crate) fn tree_links_mut(&mut self) -> &mut [LinkRecord] {
        let n = self.num_tree_links;
        &mut self.links[..n]
    }

    /// In-place allreduce over the tree. `buf` is identical on every rank
    /// afterwards.
    pub(crate) async fn try_allreduce(
        &mut self,
        buf: &mut [u8],
        reducer: &ReduceFunction,
    ) -> LinkResult<()> {
        let parent = self.parent_index;
        allreduce::try_allreduce(self.tree_links_mut(), parent, buf, reducer).await
    }

    /// Stream `buf` from `root` to everyone around the ring.
    pub(crate) async fn try_broadcast(&mut self, buf: &mut [u8], root: Rank) -> LinkResult<()> {
        if self.world_size <= 1 {
            return Ok(());
        }
        let (prev, next) = (
            self.ring_prev.expect("ring link present"),
            self.ring_next.expect("ring link present"),
        );
        broadcast::try_broadcast(
            &mut self.links,
            prev,
            next,
            self.rank,
            self.world_size,
            root,
            buf,
        )
        .await
    }

    /// Two-pass up-down message passing over the tree links.
    pub(crate) async fn msg_passing<V, M, F>(
        &mut self,
        node_value: &V,
        init: M,
        func: F,
    ) -> LinkResult<(Vec<M>, Vec<M>)>
    where
        M: Wire,
        F: Fn(&V, &[M], usize) -> M,
    {
        let parent = self.parent_index;
        msg_passing(self.tree_links_mut(), parent, node_value, init, func).await
    }

    /// Base-engine parameters. Unknown keys are ignored.
    pub(crate) fn set_param(&mut self, name: &str, val: &str) {
        if name == "reduce_buffer_size" {
            if let Ok(n) = val.parse::<usize>() {
                self.reduce_buffer_size = n.max(1);
                return;
            }
        }
        tracing::debug!(name, val, "ignoring unknown engine parameter");
    }

    pub(crate) fn shutdown(&mut self) {
        self.close_all_links();
    }
}

/// One registration round: bind a listener, register it with the seed,
/// receive the table, establish all neighbor links.
async fn rendezvous_once(
    seed_addr: SocketAddr,
    rank: Option<Rank>,
    config: &EngineConfig,
) -> Result<(Rank, u32, u64, LinkSet)> {
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let listen_addr = listener.local_addr()?.to_string();

    let mut seed = TcpStream::connect(seed_addr).await?;
    seed.set_nodelay(true).ok();
    send_message(
        &mut seed,
        &ClusterMessage::Join {
            protocol_version: PROTOCOL_VERSION,
            rank,
            listen_addr,
        },
    )
    .await?;

    let table = tokio::time::timeout(config.rendezvous_timeout, recv_message(&mut seed))
        .await
        .map_err(|_| TenaxError::RendezvousTimeout { epoch: 0 })??;
    let (epoch, rank, world_size, peers) = match table {
        ClusterMessage::Table {
            epoch,
            rank,
            world_size,
            peers,
        } => (epoch, rank, world_size, peers),
        other => {
            return Err(TenaxError::DecodeFailed(format!(
                "expected Table, got {other:?}"
            )))
        }
    };

    let addrs: HashMap<Rank, String> = peers.into_iter().collect();
    let topo = Topology::new(rank, world_size);
    let set = tokio::time::timeout(
        config.connect_timeout,
        establish_links(rank, &topo, &addrs, listener),
    )
    .await
    .map_err(|_| TenaxError::ClusterFormationTimeout {
        joined: 0,
        expected: world_size,
    })??;
    Ok((rank, world_size, epoch, set))
}

/// Dial lower-numbered neighbors and the ring successor while accepting
/// everyone who dials us, then assemble the epoch's link vector: tree
/// links first (ascending peer rank), then ring prev, then ring next.
async fn establish_links(
    rank: Rank,
    topo: &Topology,
    addrs: &HashMap<Rank, String>,
    listener: TcpListener,
) -> Result<LinkSet> {
    let mut dial_targets: Vec<(Rank, u8)> = Vec::new();
    let mut expect_accept: HashSet<(Rank, u8)> = HashSet::new();
    for &p in &topo.tree_peers {
        if topo.dials_tree(rank, p) {
            dial_targets.push((p, LINK_ROLE_TREE));
        } else {
            expect_accept.insert((p, LINK_ROLE_TREE));
        }
    }
    if let Some(next) = topo.ring_next {
        dial_targets.push((next, LINK_ROLE_RING));
    }
    if let Some(prev) = topo.ring_prev {
        expect_accept.insert((prev, LINK_ROLE_RING));
    }

    let dialing = async {
        let mut out: HashMap<(Rank, u8), TcpStream> = HashMap::new();
        for &(peer, role) in &dial_targets {
            let addr = addrs.get(&peer).ok_or(TenaxError::InvalidRank {
                rank: peer,
                world_size: addrs.len() as u32,
            })?;
            let mut stream =
                TcpStream::connect(addr)
                    .await
                    .map_err(|e| TenaxError::ConnectionFailed {
                        rank: peer,
                        reason: e.to_string(),
                    })?;
            stream.set_nodelay(true).ok();
            let mut hello = [0u8; 5];
            hello[..4].copy_from_slice(&rank.to_le_bytes());
            hello[4] = role;
            tokio::io::AsyncWriteExt::write_all(&mut stream, &hello)
                .await
                .map_err(|e| TenaxError::ConnectionFailed {
                    rank: peer,
                    reason: e.to_string(),
                })?;
            out.insert((peer, role), stream);
        }
        Ok::<_, TenaxError>(out)
    };

    let accepting = async {
        let mut out: HashMap<(Rank, u8), TcpStream> = HashMap::new();
        let mut missing = expect_accept.clone();
        while !missing.is_empty() {
            let (mut stream, remote) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            let mut hello = [0u8; 5];
            if tokio::io::AsyncReadExt::read_exact(&mut stream, &mut hello)
                .await
                .is_err()
            {
                continue;
            }
            let peer = u32::from_le_bytes(hello[..4].try_into().expect("4-byte rank"));
            let key = (peer, hello[4]);
            if missing.remove(&key) {
                out.insert(key, stream);
            } else {
                tracing::debug!(%remote, peer, role = hello[4], "dropping unexpected link");
            }
        }
        Ok::<_, TenaxError>(out)
    };

    let (dialed, accepted) = tokio::try_join!(dialing, accepting)?;

    let take = |map: &mut HashMap<(Rank, u8), TcpStream>, key: (Rank, u8)| {
        map.remove(&key).expect("established link present")
    };
    let (mut dialed, mut accepted) = (dialed, accepted);

    let mut links = Vec::new();
    for &p in &topo.tree_peers {
        let stream = if topo.dials_tree(rank, p) {
            take(&mut dialed, (p, LINK_ROLE_TREE))
        } else {
            take(&mut accepted, (p, LINK_ROLE_TREE))
        };
        links.push(LinkRecord::new(p, stream));
    }
    let num_tree_links = links.len();
    let mut ring_prev = None;
    let mut ring_next = None;
    if let Some(prev) = topo.ring_prev {
        ring_prev = Some(links.len());
        links.push(LinkRecord::new(prev, take(&mut accepted, (prev, LINK_ROLE_RING))));
    }
    if let Some(next) = topo.ring_next {
        ring_next = Some(links.len());
        links.push(LinkRecord::new(next, take(&mut dialed, (next, LINK_ROLE_RING))));
    }

    Ok(LinkSet {
        links,
        num_tree_links,
        parent_index: topo.parent_pos,
        ring_prev,
        ring_next,
    })
}
