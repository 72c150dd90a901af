//! Per-connection ring buffer of recently delivered envelopes, enabling
//! client-requested gap recovery.

use std::collections::VecDeque;

use crate::envelope::Envelope;

/// Retains the most recent `capacity` envelopes by `seq`.
///
/// Replay is reactive: the server never pushes missed messages on its own,
/// it only answers range queries the client initiates after noticing a gap.
pub struct ReplayBuffer {
    capacity: usize,
    buf: VecDeque<Envelope>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: VecDeque::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, env: Envelope) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(env);
    }

    /// Returns envelopes whose `seq` falls in `[from, to]`, in seq order.
    ///
    /// If `from` is older than the buffer's current floor, the response is
    /// truncated to what remains — the client infers truncation from a
    /// response shorter than `to - from + 1`.
    pub fn get_range(&self, from: u64, to: u64) -> Vec<Envelope> {
        self.buf
            .iter()
            .filter(|e| e.seq >= from && e.seq <= to)
            .cloned()
            .collect()
    }

    pub fn floor(&self) -> Option<u64> {
        self.buf.front().map(|e| e.seq)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeType;
    use serde_json::json;

    fn env(seq: u64) -> Envelope {
        let mut e = Envelope::new(EnvelopeType::PriceUpdate, Some("token.BTC".into()), "n".into(), json!({}));
        e.seq = seq;
        e
    }

    #[test]
    fn retains_only_the_most_recent_k() {
        let mut buf = ReplayBuffer::new(3);
        for seq in 0..5 {
            buf.add(env(seq));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.floor(), Some(2));
    }

    #[test]
    fn get_range_returns_seq_ordered_intersection() {
        let mut buf = ReplayBuffer::new(100);
        for seq in 0..10 {
            buf.add(env(seq));
        }
        let got = buf.get_range(3, 6);
        let seqs: Vec<u64> = got.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6]);
    }

    #[test]
    fn get_range_truncates_below_floor() {
        let mut buf = ReplayBuffer::new(3);
        for seq in 0..5 {
            buf.add(env(seq));
        }
        // floor is 2; asking for 0..=4 can only yield 2,3,4
        let got = buf.get_range(0, 4);
        let seqs: Vec<u64> = got.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn empty_buffer_returns_empty_range() {
        let buf = ReplayBuffer::new(10);
        assert!(buf.get_range(0, 100).is_empty());
    }
}
