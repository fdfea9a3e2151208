//! Unacknowledged patch packets awaiting their ack.
//!
//! Uses index separation:
//! - HeapRb keeps send order as lightweight metadata (seq + slab key)
//! - Slab stores the encoded datagrams
//!
//! Acked entries leave the slab immediately; their stale metadata is
//! skipped and compacted on the next retransmit scan.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ringbuf::{traits::*, HeapRb};
use slab::Slab;

#[derive(Debug, Clone, Copy)]
struct PendingMeta {
    seq: u32,
    slab_key: usize,
}

#[derive(Debug)]
struct PendingPacket {
    seq: u32,
    datagram: Bytes,
    first_sent: Instant,
    last_sent: Instant,
    retries: u8,
}

/// What a retransmit scan decided
#[derive(Debug, Default)]
pub struct RetransmitPlan {
    /// Datagrams to send again, oldest first
    pub resend: Vec<(u32, Bytes)>,
    /// Sequence numbers given up on
    pub expired: Vec<u32>,
}

pub struct InFlight {
    index: HeapRb<PendingMeta>,
    storage: Slab<PendingPacket>,
    capacity: usize,
    overflow_count: u64,
    acked_count: u64,
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("pending", &self.storage.len())
            .field("capacity", &self.capacity)
            .field("overflow", &self.overflow_count)
            .finish()
    }
}

impl InFlight {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            index: HeapRb::new(capacity),
            storage: Slab::with_capacity(capacity),
            capacity,
            overflow_count: 0,
            acked_count: 0,
        }
    }

    /// Track a sent datagram; a full buffer forgets the oldest entry
    pub fn push(&mut self, seq: u32, datagram: Bytes, now: Instant) {
        if self.index.is_full() {
            self.compact();
        }
        if self.index.is_full() {
            if let Some(old) = self.index.try_pop() {
                if self.storage.try_remove(old.slab_key).is_some() {
                    self.overflow_count += 1;
                }
            }
        }
        let slab_key = self.storage.insert(PendingPacket {
            seq,
            datagram,
            first_sent: now,
            last_sent: now,
            retries: 0,
        });
        let _ = self.index.try_push(PendingMeta { seq, slab_key });
    }

    /// Drop the entry for `seq`; returns the round trip since first send
    pub fn ack(&mut self, seq: u32, now: Instant) -> Option<Duration> {
        let key = self
            .index
            .iter()
            .find(|meta| meta.seq == seq && self.storage.get(meta.slab_key).is_some_and(|p| p.seq == seq))
            .map(|meta| meta.slab_key)?;
        let packet = self.storage.remove(key);
        self.acked_count += 1;
        Some(now.saturating_duration_since(packet.first_sent))
    }

    /// Collect packets unacked for `timeout` since their last send.
    ///
    /// Packets already resent `max_retries` times are dropped instead.
    pub fn due(&mut self, now: Instant, timeout: Duration, max_retries: u8) -> RetransmitPlan {
        let mut plan = RetransmitPlan::default();
        let metas: Vec<PendingMeta> = self.index.pop_iter().collect();
        for meta in metas {
            let Some(packet) = self.storage.get_mut(meta.slab_key) else {
                continue;
            };
            if packet.seq != meta.seq {
                continue;
            }
            if now.saturating_duration_since(packet.last_sent) >= timeout {
                if packet.retries >= max_retries {
                    plan.expired.push(meta.seq);
                    self.storage.remove(meta.slab_key);
                    continue;
                }
                packet.retries += 1;
                packet.last_sent = now;
                plan.resend.push((meta.seq, packet.datagram.clone()));
            }
            let _ = self.index.try_push(meta);
        }
        plan
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    pub fn acked_count(&self) -> u64 {
        self.acked_count
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.storage.clear();
    }

    fn compact(&mut self) {
        let remaining: Vec<PendingMeta> = self
            .index
            .pop_iter()
            .filter(|m| self.storage.get(m.slab_key).is_some_and(|p| p.seq == m.seq))
            .collect();
        for m in remaining {
            let _ = self.index.try_push(m);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(seq: u32) -> Bytes {
        Bytes::from(seq.to_be_bytes().to_vec())
    }

    #[test]
    fn ack_removes_and_reports_rtt() {
        let start = Instant::now();
        let mut inflight = InFlight::new(8);
        inflight.push(1, datagram(1), start);
        inflight.push(2, datagram(2), start);
        let rtt = inflight.ack(1, start + Duration::from_millis(5)).unwrap();
        assert_eq!(rtt, Duration::from_millis(5));
        assert!(inflight.ack(1, start).is_none());
        assert_eq!(inflight.len(), 1);
    }

    #[test]
    fn retransmits_then_expires() {
        let start = Instant::now();
        let timeout = Duration::from_millis(10);
        let mut inflight = InFlight::new(8);
        inflight.push(7, datagram(7), start);

        assert!(inflight.due(start + Duration::from_millis(5), timeout, 2).resend.is_empty());
        let plan = inflight.due(start + timeout, timeout, 2);
        assert_eq!(plan.resend.len(), 1);
        assert_eq!(plan.resend[0].0, 7);
        let plan = inflight.due(start + timeout * 2, timeout, 2);
        assert_eq!(plan.resend.len(), 1);
        let plan = inflight.due(start + timeout * 3, timeout, 2);
        assert!(plan.resend.is_empty());
        assert_eq!(plan.expired, vec![7]);
        assert!(inflight.is_empty());
    }

    #[test]
    fn full_buffer_forgets_oldest() {
        let now = Instant::now();
        let mut inflight = InFlight::new(2);
        inflight.push(1, datagram(1), now);
        inflight.push(2, datagram(2), now);
        inflight.push(3, datagram(3), now);
        assert_eq!(inflight.overflow_count(), 1);
        assert!(inflight.ack(1, now).is_none());
        assert!(inflight.ack(3, now).is_some());
    }

    #[test]
    fn acked_slots_are_reused_without_overflow() {
        let now = Instant::now();
        let mut inflight = InFlight::new(2);
        for seq in 0..10 {
            inflight.push(seq, datagram(seq), now);
            inflight.ack(seq, now);
        }
        assert_eq!(inflight.overflow_count(), 0);
        assert_eq!(inflight.acked_count(), 10);
    }
}
