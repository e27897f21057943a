//! In-memory store of recent collective results, keyed by sequence number.
//!
//! Retention is sparse: each rank keeps only the seqnos in its retention
//! slot (`seqno % round == rank % round`), so with a round derived from
//! the replication factor every result survives on roughly
//! `result_replicate` ranks. The buffer is cleared wholesale on every
//! checkpoint boundary.

use crate::types::Rank;
use std::collections::HashMap;

#[derive(Debug)]
struct ResultEntry {
    seqno: u32,
    type_nbytes: usize,
    count: usize,
    data: Vec<u8>,
}

/// Whether `rank` must retain the result of `seqno` under the given round.
pub(crate) fn retained(seqno: u32, rank: Rank, round: u32) -> bool {
    seqno % round == rank % round
}

#[derive(Debug, Default)]
pub(crate) struct ResultBuffer {
    entries: Vec<ResultEntry>,
    index: HashMap<u32, usize>,
    temp: Option<ResultEntry>,
}

impl ResultBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve the staging slot for the operation in flight. Exactly one
    /// reservation may be outstanding.
    pub(crate) fn alloc_temp(&mut self, type_nbytes: usize, count: usize) -> &mut [u8] {
        assert!(
            self.temp.is_none(),
            "a staged result is already outstanding"
        );
        self.temp = Some(ResultEntry {
            seqno: 0,
            type_nbytes,
            count,
            data: vec![0u8; type_nbytes * count],
        });
        self.temp_mut()
    }

    /// The staged region reserved by `alloc_temp`.
    pub(crate) fn temp_mut(&mut self) -> &mut [u8] {
        &mut self
            .temp
            .as_mut()
            .expect("no staged result outstanding")
            .data
    }

    /// Commit the staged region as the result of `seqno`.
    pub(crate) fn push_temp(&mut self, seqno: u32, type_nbytes: usize, count: usize) {
        let mut entry = self.temp.take().expect("no staged result outstanding");
        assert_eq!(
            (entry.type_nbytes, entry.count),
            (type_nbytes, count),
            "staged result shape changed between alloc and push"
        );
        entry.seqno = seqno;
        self.index.insert(seqno, self.entries.len());
        self.entries.push(entry);
    }

    /// The stored bytes for `seqno`, if this rank holds them.
    pub(crate) fn query(&self, seqno: u32) -> Option<&[u8]> {
        self.index
            .get(&seqno)
            .map(|&i| self.entries[i].data.as_slice())
    }

    /// Seqno of the most recently committed entry.
    pub(crate) fn last_seqno(&self) -> Option<u32> {
        self.entries.last().map(|e| e.seqno)
    }

    /// Drop the most recently committed entry.
    pub(crate) fn drop_last(&mut self) {
        if let Some(entry) = self.entries.pop() {
            self.index.remove(&entry.seqno);
        }
    }

    /// Drop everything, including any staged reservation.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.temp = None;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_push_query() {
        let mut buf = ResultBuffer::new();
        let temp = buf.alloc_temp(4, 3);
        temp.copy_from_slice(&[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
        buf.push_temp(0, 4, 3);
        assert_eq!(buf.last_seqno(), Some(0));
        assert_eq!(buf.query(0).unwrap()[0], 1);
        assert!(buf.query(1).is_none());
    }

    #[test]
    fn test_drop_last_then_reuse_seqno_slot() {
        let mut buf = ResultBuffer::new();
        buf.alloc_temp(1, 2).copy_from_slice(&[9, 9]);
        buf.push_temp(0, 1, 2);
        buf.alloc_temp(1, 2).copy_from_slice(&[7, 7]);
        buf.push_temp(1, 1, 2);
        buf.drop_last();
        assert_eq!(buf.last_seqno(), Some(0));
        assert!(buf.query(1).is_none());
        assert_eq!(buf.query(0).unwrap(), &[9, 9]);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut buf = ResultBuffer::new();
        buf.alloc_temp(1, 1).copy_from_slice(&[5]);
        buf.push_temp(0, 1, 1);
        buf.alloc_temp(1, 1);
        buf.clear();
        assert_eq!(buf.last_seqno(), None);
        assert!(buf.query(0).is_none());
        // the staged slot is free again
        buf.alloc_temp(1, 1);
    }

    #[test]
    #[should_panic(expected = "already outstanding")]
    fn test_double_alloc_panics() {
        let mut buf = ResultBuffer::new();
        buf.alloc_temp(1, 1);
        buf.alloc_temp(1, 1);
    }

    #[test]
    fn test_retention_sparsity() {
        // W ranks, N ops: every rank keeps ceil-ish N/round entries and every
        // seqno survives on exactly W/round ranks when round divides W.
        let world = 4u32;
        let round = 2u32;
        let n_ops = 10u32;

        let mut per_rank: Vec<ResultBuffer> = (0..world).map(|_| ResultBuffer::new()).collect();
        for seq in 0..n_ops {
            for (rank, buf) in per_rank.iter_mut().enumerate() {
                // the engine drops the previous entry before staging the next
                if let Some(last) = buf.last_seqno() {
                    if !retained(last, rank as Rank, round) {
                        buf.drop_last();
                    }
                }
                buf.alloc_temp(1, 1).copy_from_slice(&[seq as u8]);
                buf.push_temp(seq, 1, 1);
            }
        }
        // after the loop the very last entry may still be pending its drop
        for (rank, buf) in per_rank.iter_mut().enumerate() {
            if let Some(last) = buf.last_seqno() {
                if !retained(last, rank as Rank, round) {
                    buf.drop_last();
                }
            }
        }

        for (rank, buf) in per_rank.iter().enumerate() {
            let expected = (0..n_ops)
                .filter(|&s| retained(s, rank as Rank, round))
                .count();
            assert_eq!(buf.len(), expected, "rank {rank}");
        }
        for seq in 0..n_ops {
            let holders = per_rank.iter().filter(|b| b.query(seq).is_some()).count();
            assert_eq!(holders as u32, world / round, "seqno {seq}");
        }
    }

    #[test]
    fn test_retained_round_one_keeps_all() {
        for seq in 0..20 {
            for rank in 0..6 {
                assert!(retained(seq, rank, 1));
            }
        }
    }
}
