//! In-flight submission bookkeeping.

use std::collections::VecDeque;

use virtring_shmem::SharedRegion;

/// Whether stream position `a` is at or past `b`, judged against the producer position `cur`.
///
/// Seqnos are 32-bit byte positions that wrap. Both `a` and `b` are assumed to lie in the
/// window of at most 2^32 bytes that ends at `cur`; the one closer to `cur` is the later one.
pub fn seqno_ge(cur: u32, a: u32, b: u32) -> bool {
    if a >= b {
        cur >= a || cur < b
    } else {
        cur >= a && cur < b
    }
}

/// Wraparound-aware comparison for the roundtrip counter, which has no producer position.
pub fn roundtrip_seqno_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// One submission the remote may still be reading.
#[derive(Debug)]
pub struct PendingSubmit {
    /// Ring position right after the submission's last byte.
    pub seqno: u32,
    /// Regions referenced by the submission; released on retirement.
    pub shmems: Vec<SharedRegion>,
}

#[derive(Debug, Default)]
pub struct SubmitTracker {
    pending: VecDeque<PendingSubmit>,
}

impl SubmitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, seqno: u32, shmems: Vec<SharedRegion>) {
        self.pending.push_back(PendingSubmit { seqno, shmems });
    }

    /// Drop every submission the remote has consumed, i.e. whose seqno `head` has reached.
    /// Returns how many were retired.
    pub fn retire(&mut self, cur: u32, head: u32) -> usize {
        let mut retired = 0;
        while let Some(front) = self.pending.front() {
            if !seqno_ge(cur, head, front.seqno) {
                break;
            }
            self.pending.pop_front();
            retired += 1;
        }
        retired
    }

    pub fn retire_all(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingSubmit> {
        self.pending.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn seqno_ge_without_wrap() {
        assert!(seqno_ge(100, 100, 50));
        assert!(seqno_ge(100, 50, 50));
        assert!(!seqno_ge(100, 50, 80));
    }

    #[test]
    fn seqno_ge_across_wrap() {
        let cur = 20;
        let before_wrap = u32::MAX - 10;
        assert!(seqno_ge(cur, 10, before_wrap));
        assert!(!seqno_ge(cur, before_wrap, 10));
        assert!(seqno_ge(cur, before_wrap, before_wrap));
    }

    #[test]
    fn roundtrip_comparison_wraps() {
        assert!(roundtrip_seqno_ge(5, 5));
        assert!(roundtrip_seqno_ge(1, u32::MAX));
        assert!(!roundtrip_seqno_ge(u32::MAX, 1));
    }

    #[test]
    fn retire_stops_at_first_unconsumed() {
        let mut t = SubmitTracker::new();
        t.push(10, Vec::new());
        t.push(20, Vec::new());
        t.push(30, Vec::new());

        assert_eq!(t.retire(30, 5), 0);
        assert_eq!(t.retire(30, 20), 2);
        assert_eq!(t.len(), 1);
        assert_eq!(t.iter().next().unwrap().seqno, 30);
        assert_eq!(t.retire_all(), 1);
        assert!(t.is_empty());
    }

    proptest! {
        #[test]
        fn retirement_follows_issue_order_across_wrap(
            start in (u32::MAX - 4096)..=u32::MAX,
            sizes in proptest::collection::vec(1u32..512, 1..32),
            consumed in 0usize..32,
        ) {
            let mut t = SubmitTracker::new();
            let mut cur = start;
            let mut seqnos = Vec::new();
            for size in &sizes {
                cur = cur.wrapping_add(*size);
                t.push(cur, Vec::new());
                seqnos.push(cur);
            }

            // The remote has consumed exactly the first `k` submissions.
            let k = consumed.min(seqnos.len());
            let head = if k == 0 { start } else { seqnos[k - 1] };
            prop_assert_eq!(t.retire(cur, head), k);

            let left: Vec<u32> = t.iter().map(|p| p.seqno).collect();
            prop_assert_eq!(left, seqnos[k..].to_vec());
        }
    }
}
