//! The per-round action summary: a packed word every rank contributes to a
//! tree allreduce so the cluster agrees on what happens next.
//!
//! Wire layout (one little-endian `u64`): bits 0–2 carry the special-action
//! flags, bit 3 records whether the merged operands disagreed on their
//! sequence number, bits 4–34 carry the 31-bit sequence number.

/// Sentinel sequence number meaning "no pending normal operation".
pub(crate) const MAX_SEQ: u32 = 0x7FFF_FFFF;

const FLAG_MASK: u64 = 0b111;
const DIFF_BIT: u64 = 1 << 3;
const SEQ_SHIFT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActionSummary {
    flags: u8,
    diff_seq: bool,
    seqno: u32,
}

impl ActionSummary {
    pub(crate) const LOAD_CHECK: u8 = 1;
    pub(crate) const CHECK_POINT: u8 = 2;
    pub(crate) const CHECK_ACK: u8 = 4;

    pub(crate) fn new(flags: u8, seqno: u32) -> Self {
        assert!(flags <= 7, "unknown action flag bits");
        assert!(seqno <= MAX_SEQ, "sequence number exceeds 31 bits");
        Self {
            flags,
            diff_seq: false,
            seqno,
        }
    }

    pub(crate) fn load_check(&self) -> bool {
        self.flags & Self::LOAD_CHECK != 0
    }

    pub(crate) fn check_point(&self) -> bool {
        self.flags & Self::CHECK_POINT != 0
    }

    pub(crate) fn check_ack(&self) -> bool {
        self.flags & Self::CHECK_ACK != 0
    }

    pub(crate) fn diff_seq(&self) -> bool {
        self.diff_seq
    }

    pub(crate) fn min_seqno(&self) -> u32 {
        self.seqno
    }

    /// Associative, commutative merge of two summaries: OR the flags, take
    /// the minimum seqno, and remember whether any two merged operands
    /// carried different pending seqnos.
    pub(crate) fn reduce(a: Self, b: Self) -> Self {
        let min = a.seqno.min(b.seqno);
        Self {
            flags: a.flags | b.flags,
            diff_seq: a.diff_seq || b.diff_seq || (a.seqno != b.seqno && min != MAX_SEQ),
            seqno: min,
        }
    }

    pub(crate) fn pack(&self) -> u64 {
        (self.flags as u64 & FLAG_MASK)
            | if self.diff_seq { DIFF_BIT } else { 0 }
            | ((self.seqno as u64) << SEQ_SHIFT)
    }

    pub(crate) fn unpack(word: u64) -> Self {
        Self {
            flags: (word & FLAG_MASK) as u8,
            diff_seq: word & DIFF_BIT != 0,
            seqno: ((word >> SEQ_SHIFT) as u32) & MAX_SEQ,
        }
    }

    /// Reducer over raw little-endian words, in the shape the base
    /// allreduce expects.
    pub(crate) fn reduce_bytes(src: &[u8], dst: &mut [u8]) {
        for (s, d) in src.chunks_exact(8).zip(dst.chunks_exact_mut(8)) {
            let a = Self::unpack(u64::from_le_bytes(d[..8].try_into().expect("8-byte word")));
            let b = Self::unpack(u64::from_le_bytes(s.try_into().expect("8-byte word")));
            d.copy_from_slice(&Self::reduce(b, a).pack().to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<ActionSummary> {
        let mut out = Vec::new();
        for flags in 0..=7u8 {
            for &seq in &[0u32, 1, 5, 6, 1000, MAX_SEQ - 1, MAX_SEQ] {
                out.push(ActionSummary::new(flags, seq));
            }
        }
        // summaries that already carry the diff bit from earlier merges
        let mut diffed = ActionSummary::new(0, 3);
        diffed.diff_seq = true;
        out.push(diffed);
        out
    }

    #[test]
    fn test_reducer_commutative() {
        for &a in &samples() {
            for &b in &samples() {
                assert_eq!(
                    ActionSummary::reduce(a, b),
                    ActionSummary::reduce(b, a),
                    "reduce({a:?}, {b:?})"
                );
            }
        }
    }

    #[test]
    fn test_reducer_associative() {
        let s = samples();
        for &a in &s {
            for &b in &s {
                for &c in &s {
                    let left = ActionSummary::reduce(ActionSummary::reduce(a, b), c);
                    let right = ActionSummary::reduce(a, ActionSummary::reduce(b, c));
                    assert_eq!(left, right, "assoc failed for {a:?}, {b:?}, {c:?}");
                }
            }
        }
    }

    #[test]
    fn test_diff_seq_semantics() {
        // all idle: no difference
        let idle = ActionSummary::new(0, MAX_SEQ);
        assert!(!ActionSummary::reduce(idle, idle).diff_seq());
        // one pending, one idle: difference
        let pending = ActionSummary::new(0, 5);
        let merged = ActionSummary::reduce(pending, idle);
        assert!(merged.diff_seq());
        assert_eq!(merged.min_seqno(), 5);
        // same pending seqno everywhere: no difference
        assert!(!ActionSummary::reduce(pending, pending).diff_seq());
        // two different pending seqnos: difference, minimum wins
        let later = ActionSummary::new(0, 6);
        let merged = ActionSummary::reduce(pending, later);
        assert!(merged.diff_seq());
        assert_eq!(merged.min_seqno(), 5);
    }

    #[test]
    fn test_flag_or() {
        let a = ActionSummary::new(ActionSummary::LOAD_CHECK, MAX_SEQ);
        let b = ActionSummary::new(ActionSummary::CHECK_ACK, MAX_SEQ);
        let m = ActionSummary::reduce(a, b);
        assert!(m.load_check());
        assert!(m.check_ack());
        assert!(!m.check_point());
    }

    #[test]
    fn test_pack_roundtrip() {
        for &s in &samples() {
            assert_eq!(ActionSummary::unpack(s.pack()), s);
        }
    }

    #[test]
    fn test_wire_is_little_endian() {
        let s = ActionSummary::new(ActionSummary::CHECK_POINT, 1);
        // flags=2, seqno=1: word = 2 | (1 << 4) = 0x12
        assert_eq!(s.pack().to_le_bytes(), [0x12, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_reduce_bytes_matches_reduce() {
        for &a in &samples() {
            for &b in &samples() {
                let mut dst = a.pack().to_le_bytes().to_vec();
                let src = b.pack().to_le_bytes().to_vec();
                ActionSummary::reduce_bytes(&src, &mut dst);
                let got = ActionSummary::unpack(u64::from_le_bytes(dst.try_into().unwrap()));
                assert_eq!(got, ActionSummary::reduce(a, b));
            }
        }
    }
}
