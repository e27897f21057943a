//! The fault-tolerant engine: sequence-numbered collectives with a
//! replicated result buffer, cluster-wide agreement before every step, and
//! transparent replay of whatever a restarted rank is missing.

pub(crate) mod action;
pub(crate) mod base;
pub(crate) mod recovery;
pub(crate) mod resbuf;
pub(crate) mod reset;
pub(crate) mod routing;

use crate::collective::ReduceFunction;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::reduce::reduce_slice;
use crate::transport::LinkResult;
use crate::types::{DataType, Rank, ReduceOp};
use action::{ActionSummary, MAX_SEQ};
use base::BaseEngine;
use recovery::{try_recover_data, RecoverRole};
use resbuf::{retained, ResultBuffer};
use routing::{try_decide_routing, RecoverKind};
use std::net::SocketAddr;

/// A model that can be checkpointed by the engine.
///
/// The engine treats the serialized form as an opaque blob; it only
/// prefixes a version number and replicates the bytes across ranks on
/// demand. Per-rank local state is deliberately not checkpointable: the
/// API carries exactly one globally-replicated model.
pub trait Checkpointable: Send + Sync {
    /// Append the serialized model to `out`.
    fn save(&self, out: &mut Vec<u8>);
    /// Restore the model from bytes produced by `save`.
    fn load(&mut self, bytes: &[u8]);
}

/// One rank's engine handle.
///
/// Not thread-safe by design: a single task drives all collectives for
/// its rank, and every public entry point takes `&mut self`. Collective
/// calls block until the whole cluster agrees and the operation (or its
/// recovery) completes; transient link faults are absorbed internally and
/// never surface to the caller.
pub struct TenaxEngine {
    base: BaseEngine,
    resbuf: ResultBuffer,
    seq_counter: u32,
    version_number: u32,
    global_checkpoint: Vec<u8>,
    result_buffer_round: u32,
}

impl TenaxEngine {
    /// Join the cluster at `seed_addr`. Pass `rank = None` on first start
    /// (the seed assigns one) and the previously assigned rank when
    /// rejoining after a restart.
    pub async fn connect(
        seed_addr: SocketAddr,
        rank: Option<Rank>,
        config: EngineConfig,
    ) -> Result<Self> {
        let base = BaseEngine::connect(seed_addr, rank, config).await?;
        Ok(Self {
            base,
            resbuf: ResultBuffer::new(),
            seq_counter: 0,
            version_number: 0,
            global_checkpoint: Vec::new(),
            result_buffer_round: 1,
        })
    }

    pub fn rank(&self) -> Rank {
        self.base.rank
    }

    pub fn world_size(&self) -> u32 {
        self.base.world_size
    }

    /// Version of the latest completed checkpoint; 0 before any exists.
    pub fn version_number(&self) -> u32 {
        self.version_number
    }

    /// Ordinal of the next collective within the current checkpoint epoch.
    pub fn sequence_number(&self) -> u32 {
        self.seq_counter
    }

    /// Engine parameters, last write wins:
    /// - `result_buffer_round`: retention stride for the result buffer.
    /// - `result_replicate`: replicas per result; sets the stride to
    ///   `max(world_size / result_replicate, 1)`.
    ///
    /// Other names go to the base engine.
    pub fn set_param(&mut self, name: &str, val: &str) {
        match name {
            "result_buffer_round" => {
                if let Ok(n) = val.parse::<u32>() {
                    self.result_buffer_round = n.max(1);
                }
            }
            "result_replicate" => {
                if let Ok(n) = val.parse::<u32>() {
                    self.result_buffer_round = (self.base.world_size / n.max(1)).max(1);
                }
            }
            _ => self.base.set_param(name, val),
        }
    }

    /// In-place allreduce of `buf` interpreted as `dtype` elements.
    /// After return, `buf` holds the element-wise reduction of every
    /// rank's contribution, with identical bytes on every rank.
    pub async fn allreduce(&mut self, buf: &mut [u8], dtype: DataType, op: ReduceOp) {
        let elem = dtype.size_in_bytes();
        assert_eq!(buf.len() % elem, 0, "buffer not a whole number of {dtype}");
        let count = buf.len() / elem;
        let reducer = move |src: &[u8], dst: &mut [u8]| reduce_slice(dst, src, count, dtype, op);
        self.allreduce_with(buf, elem, count, &reducer).await;
    }

    /// In-place allreduce with a caller-supplied reducer folding whole
    /// slices (`dst = op(dst, src)`).
    pub async fn allreduce_with(
        &mut self,
        buf: &mut [u8],
        type_nbytes: usize,
        count: usize,
        reducer: &ReduceFunction,
    ) {
        assert_eq!(
            buf.len(),
            type_nbytes * count,
            "buffer length must equal type_nbytes * count"
        );
        let mut recovered = self
            .recover_exec(Some(&mut *buf), 0, self.seq_counter)
            .await;
        self.apply_retention();
        self.resbuf.alloc_temp(type_nbytes, count);
        loop {
            if recovered {
                self.resbuf.temp_mut().copy_from_slice(buf);
                break;
            }
            // reduce on the staged copy so a failed pass never leaves a
            // half-reduced caller buffer
            self.resbuf.temp_mut().copy_from_slice(buf);
            let res = {
                let Self { base, resbuf, .. } = self;
                base.try_allreduce(resbuf.temp_mut(), reducer).await
            };
            if self.check_and_recover(res).await {
                buf.copy_from_slice(self.resbuf.temp_mut());
                break;
            }
            recovered = self.recover_exec(Some(&mut *buf), 0, self.seq_counter).await;
        }
        self.resbuf.push_temp(self.seq_counter, type_nbytes, count);
        self.seq_counter += 1;
    }

    /// Copy `buf` from `root` to every rank, in place.
    pub async fn broadcast(&mut self, buf: &mut [u8], root: Rank) {
        assert!(
            root < self.base.world_size,
            "broadcast root {} out of range",
            root
        );
        let total = buf.len();
        let mut recovered = self
            .recover_exec(Some(&mut *buf), 0, self.seq_counter)
            .await;
        self.apply_retention();
        self.resbuf.alloc_temp(1, total);
        loop {
            if recovered {
                self.resbuf.temp_mut().copy_from_slice(buf);
                break;
            }
            let res = self.base.try_broadcast(buf, root).await;
            if self.check_and_recover(res).await {
                self.resbuf.temp_mut().copy_from_slice(buf);
                break;
            }
            recovered = self.recover_exec(Some(&mut *buf), 0, self.seq_counter).await;
        }
        self.resbuf.push_temp(self.seq_counter, 1, total);
        self.seq_counter += 1;
    }

    /// Commit a checkpoint: all ranks agree, the version number advances,
    /// the model is serialized into the in-memory checkpoint blob, and the
    /// sequence epoch restarts.
    pub async fn checkpoint(&mut self, model: &dyn Checkpointable) {
        let done = self
            .recover_exec(None, ActionSummary::CHECK_POINT, MAX_SEQ)
            .await;
        assert!(done, "checkpoint round must complete");
        self.version_number += 1;
        self.global_checkpoint.clear();
        self.global_checkpoint
            .extend_from_slice(&self.version_number.to_le_bytes());
        model.save(&mut self.global_checkpoint);
        self.resbuf.clear();
        self.seq_counter = 0;
        let done = self
            .recover_exec(None, ActionSummary::CHECK_ACK, MAX_SEQ)
            .await;
        assert!(done, "checkpoint ack round must complete");
    }

    /// Load the latest checkpoint into `model` and return its version.
    ///
    /// Returns 0 when no checkpoint exists anywhere in the cluster; the
    /// model is untouched and the caller should initialize it fresh.
    pub async fn load_checkpoint(&mut self, model: &mut dyn Checkpointable) -> u32 {
        if self
            .recover_exec(None, ActionSummary::LOAD_CHECK, MAX_SEQ)
            .await
        {
            self.resbuf.clear();
            self.seq_counter = 0;
            if self.global_checkpoint.len() < 4 {
                self.version_number = 0;
                return 0;
            }
            self.version_number = u32::from_le_bytes(
                self.global_checkpoint[..4]
                    .try_into()
                    .expect("4-byte version prefix"),
            );
            if self.version_number == 0 {
                return 0;
            }
            model.load(&self.global_checkpoint[4..]);
            let done = self
                .recover_exec(None, ActionSummary::CHECK_ACK, MAX_SEQ)
                .await;
            assert!(done, "checkpoint ack round must complete");
            self.version_number
        } else {
            // nobody has a checkpoint: a fresh start for everyone
            self.resbuf.clear();
            self.seq_counter = 0;
            0
        }
    }

    /// Flush engine state with a synthetic checkpoint round, then close
    /// all links.
    pub async fn shutdown(mut self) {
        let done = self
            .recover_exec(None, ActionSummary::CHECK_POINT, MAX_SEQ)
            .await;
        assert!(done, "shutdown checkpoint round must complete");
        self.resbuf.clear();
        self.seq_counter = 0;
        let done = self
            .recover_exec(None, ActionSummary::CHECK_ACK, MAX_SEQ)
            .await;
        assert!(done, "shutdown ack round must complete");
        // align every surviving stream before teardown so peers observe a
        // clean close instead of a mid-payload reset
        let _ = reset::try_reset_links(&mut self.base.links).await;
        self.base.shutdown();
    }

    #[cfg(test)]
    pub(crate) fn base_mut(&mut self) -> &mut BaseEngine {
        &mut self.base
    }

    /// Drop the previous result if it falls outside this rank's retention
    /// slot. Runs before each new operation is staged, so the most recent
    /// result is always still available for lagging peers.
    fn apply_retention(&mut self) {
        if let Some(last) = self.resbuf.last_seqno() {
            if !retained(last, self.base.rank, self.result_buffer_round) {
                self.resbuf.drop_last();
            }
        }
    }

    /// `true` iff `res` is success. Otherwise tear down every link,
    /// rebuild through the seed, and report `false` so the caller retries.
    async fn check_and_recover(&mut self, res: LinkResult<()>) -> bool {
        match res {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    rank = self.base.rank,
                    error = ?e,
                    "collective failed, rebuilding links"
                );
                self.base.reconnect_links("recover").await;
                false
            }
        }
    }

    /// The engine's synchronization point. Reduce an action summary across
    /// all ranks, then either run the recovery the cluster agreed on or
    /// release the caller to execute its own action.
    ///
    /// Returns `true` when the requested action was completed by recovery
    /// (`buf` already holds the result where applicable); `false` when the
    /// cluster agrees this is the newest not-yet-executed step.
    async fn recover_exec(&mut self, mut buf: Option<&mut [u8]>, flag: u8, seqno: u32) -> bool {
        if flag != 0 {
            assert_eq!(
                seqno, MAX_SEQ,
                "special actions must not carry a sequence number"
            );
        }
        let req = ActionSummary::new(flag, seqno);
        loop {
            let mut word = req.pack().to_le_bytes();
            let res = self
                .base
                .try_allreduce(&mut word, &ActionSummary::reduce_bytes)
                .await;
            if !self.check_and_recover(res).await {
                continue;
            }
            let act = ActionSummary::unpack(u64::from_le_bytes(word));

            if act.check_ack() {
                if act.check_point() {
                    assert!(
                        !act.diff_seq(),
                        "checkpoint and its ack cannot coincide with pending operations"
                    );
                    if req.check_point() {
                        return true;
                    }
                } else if act.load_check() {
                    let res = self.try_load_checkpoint(req.load_check()).await;
                    if !self.check_and_recover(res).await {
                        continue;
                    }
                    if req.load_check() {
                        return true;
                    }
                } else if req.check_ack() {
                    return true;
                }
                // someone else's request is still incomplete; next round
            } else if act.check_point() {
                if act.diff_seq() {
                    assert_ne!(act.min_seqno(), MAX_SEQ, "pending operation without seqno");
                    let requester = req.min_seqno() == act.min_seqno();
                    let res = self
                        .try_get_result(buf.as_deref_mut(), act.min_seqno(), requester)
                        .await;
                    if !self.check_and_recover(res).await {
                        continue;
                    }
                    if requester {
                        return true;
                    }
                } else if req.check_point() {
                    return true;
                }
            } else if act.load_check() {
                if !act.diff_seq() {
                    // everyone asked to load at once: nothing to load from
                    return false;
                }
                let res = self.try_load_checkpoint(req.load_check()).await;
                if !self.check_and_recover(res).await {
                    continue;
                }
                if req.load_check() {
                    return true;
                }
            } else {
                assert_ne!(act.min_seqno(), MAX_SEQ, "pending operation without seqno");
                if act.diff_seq() {
                    let requester = req.min_seqno() == act.min_seqno();
                    let res = self
                        .try_get_result(buf.as_deref_mut(), act.min_seqno(), requester)
                        .await;
                    if !self.check_and_recover(res).await {
                        continue;
                    }
                    if requester {
                        return true;
                    }
                } else {
                    // every rank is at the same step: execute it
                    return false;
                }
            }
        }
    }

    /// Collaborative retrieval of the result of `seqno`. Requesters fill
    /// `buf`; holders serve from the result buffer; everyone else passes
    /// bytes through as routed.
    async fn try_get_result(
        &mut self,
        buf: Option<&mut [u8]>,
        seqno: u32,
        requester: bool,
    ) -> LinkResult<()> {
        let kind = if requester {
            RecoverKind::RequestData
        } else if self.resbuf.query(seqno).is_some() {
            RecoverKind::HaveData
        } else {
            RecoverKind::PassData
        };
        let size = match kind {
            RecoverKind::RequestData => buf.as_ref().map_or(0, |b| b.len()),
            RecoverKind::HaveData => self.resbuf.query(seqno).expect("holder has entry").len(),
            RecoverKind::PassData => 0,
        };
        let routing = try_decide_routing(&mut self.base, kind, size).await?;
        assert_ne!(routing.size, 0, "a zero-size result cannot be recovered");

        let Self { base, resbuf, .. } = self;
        let buffer_size = base.reduce_buffer_size;
        let role = match kind {
            RecoverKind::HaveData => {
                RecoverRole::HaveData(resbuf.query(seqno).expect("holder has entry"))
            }
            RecoverKind::RequestData => {
                RecoverRole::RequestData(buf.expect("requester carries a buffer"))
            }
            RecoverKind::PassData => RecoverRole::PassData,
        };
        let n = base.num_tree_links;
        try_recover_data(
            &mut base.links[..n],
            role,
            routing.size,
            routing.recv_link,
            &routing.req_in,
            buffer_size,
        )
        .await
    }

    /// Collaborative checkpoint transfer: requesters receive the blob,
    /// everyone else serves their copy.
    async fn try_load_checkpoint(&mut self, requester: bool) -> LinkResult<()> {
        let kind = if requester {
            RecoverKind::RequestData
        } else {
            RecoverKind::HaveData
        };
        let size = self.global_checkpoint.len();
        let routing = try_decide_routing(&mut self.base, kind, size).await?;
        if requester {
            self.global_checkpoint.resize(routing.size, 0);
        }
        if routing.size == 0 {
            return Ok(());
        }

        let Self {
            base,
            global_checkpoint,
            ..
        } = self;
        let buffer_size = base.reduce_buffer_size;
        let role = if requester {
            RecoverRole::RequestData(&mut global_checkpoint[..])
        } else {
            RecoverRole::HaveData(&global_checkpoint[..])
        };
        let n = base.num_tree_links;
        try_recover_data(
            &mut base.links[..n],
            role,
            routing.size,
            routing.recv_link,
            &routing.req_in,
            buffer_size,
        )
        .await
    }
}
