//! # Shaped Egress Queue
//!
//! A per-subscriber leaky bucket (§4.E): a priority queue of framed packets
//! (ordered per [`crate::wire::Packet`]'s `Ord`) plus the two-number shaper
//! state `(U, T)` — "at time `T`, utilization was `U` bytes" — that decides
//! *when* the packet at the top of the queue may be released.
//!
//! The queue never sends anything itself; it only answers "what would be
//! next" and "when can it go", and is told afterwards that a send happened
//! via [`EgressQueue::pop`]. The owning relay drives the socket.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use quanta::Instant;

use crate::stats::QueueCounters;
use crate::wire::Packet;

/// Wraps a [`Packet`] with its insertion sequence so that, per §5's ordering
/// guarantee, packets of equal priority drain in FIFO order rather than an
/// arbitrary heap-stable order.
struct Entry {
    packet: Packet,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.packet == other.packet && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher packet priority first; within equal priority, lower seq
        // (earlier insertion) first — so reverse seq for the max-heap.
        self.packet.cmp(&other.packet).then_with(|| Reverse(self.seq).cmp(&Reverse(other.seq)))
    }
}

/// A per-subscriber leaky bucket: capacity `buffer_size` bytes, drain rate
/// `bits_per_second` (tracked internally as bytes/sec).
pub struct EgressQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    utilization: f64,
    utilization_tp: Instant,
    bytes_per_second: f64,
    buffer_size: f64,
    counters: QueueCounters,
}

impl EgressQueue {
    /// `kbps` is the subscriber's shaper rate in kilobits/sec (as carried on
    /// the wire by `CONTROL.SUBSCRIBE`); `buffer_size` is the bucket
    /// capacity in bytes (`NETWORK_BUFFER_SIZE` in this profile).
    pub fn new(kbps: u32, buffer_size: u64, now: Instant) -> Self {
        EgressQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
            utilization: 0.0,
            utilization_tp: now,
            bytes_per_second: kbps as f64 * 1000.0 / 8.0,
            buffer_size: buffer_size as f64,
            counters: QueueCounters::default(),
        }
    }

    /// Bytes/packets queued and released on this subscriber's queue so far
    /// (§3 "Ambient data"); diagnostics only, never consulted by admission.
    pub fn counters(&self) -> &QueueCounters {
        &self.counters
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// `push` — enqueue one packet (§4.E). Caller is responsible for arming
    /// the single-shot timer when this transitions the queue from empty.
    pub fn push(&mut self, packet: Packet) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.counters.record_queued(packet.len());
        self.heap.push(Entry { packet, seq });
    }

    /// The admission test: given `bytes` more queued now, when could they be
    /// released without exceeding the bucket? Never earlier than `T`.
    fn when_can_send(&self, bytes: usize) -> Instant {
        let excess = self.utilization + bytes as f64 - self.buffer_size;
        if excess <= 0.0 {
            self.utilization_tp
        } else {
            let delay = Duration::from_secs_f64(excess / self.bytes_per_second);
            self.utilization_tp + delay
        }
    }

    /// `when_can_pop` — `None` ("+∞") if empty, else the release time of the
    /// packet currently at the top of the queue.
    pub fn when_can_pop(&self) -> Option<Instant> {
        self.heap.peek().map(|e| self.when_can_send(e.packet.len()))
    }

    /// Drains the bucket up to `now` and adds `bytes` of new usage.
    fn did_send(&mut self, now: Instant, bytes: usize) {
        assert!(
            now >= self.utilization_tp,
            "ClockWentBackwards: monotonic clock regressed in egress queue"
        );
        let elapsed = (now - self.utilization_tp).as_secs_f64();
        let drained = self.utilization - elapsed * self.bytes_per_second;
        self.utilization = drained.max(0.0) + bytes as f64;
        self.utilization_tp = now;
    }

    /// `pop(now)` — pop the top packet, record the send against the bucket,
    /// and hand the caller the encoded bytes to put on the wire. Panics
    /// (`PopFromEmpty`, an internal invariant violation, not a recoverable
    /// condition) if the queue is empty; callers must check
    /// [`Self::when_can_pop`] first.
    pub fn pop(&mut self, now: Instant) -> Packet {
        let entry = self.heap.pop().expect("PopFromEmpty: egress queue popped while empty");
        self.did_send(now, entry.packet.len());
        self.counters.record_released(entry.packet.len());
        entry.packet
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_per_second
    }

    pub fn buffer_size(&self) -> f64 {
        self.buffer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Header;
    use bytes::Bytes;
    use quanta::Clock;

    fn now() -> Instant {
        Clock::new().now()
    }

    fn stream_packet(channel_id: u32, packet_index: u32, payload_len: usize) -> Packet {
        Packet::new(
            Header::Stream { channel_id, packet_index },
            Bytes::from(vec![0u8; payload_len]),
        )
    }

    fn control_packet(channel_id: u32) -> Packet {
        Packet::new(
            Header::Control {
                action: crate::wire::ControlAction::Subscribe,
                channel_id,
                kbps: 100,
            },
            Bytes::new(),
        )
    }

    #[test]
    fn empty_queue_has_infinite_pop_time() {
        let q = EgressQueue::new(1000, 5000, now());
        assert!(q.when_can_pop().is_none());
    }

    #[test]
    fn admits_immediately_when_under_capacity() {
        let t0 = now();
        let q = EgressQueue::new(8000, 5000, t0);
        // excess = 0 + 100 - 5000 < 0 -> now
        assert_eq!(q.when_can_send(100), t0);
    }

    #[test]
    fn delays_when_over_capacity() {
        let t0 = now();
        let mut q = EgressQueue::new(8000, 100, t0); // 1000 bytes/sec
        q.did_send(t0, 100); // fill the bucket exactly
        let when = q.when_can_send(50);
        // excess = 100 + 50 - 100 = 50 bytes -> 50/1000s = 50ms
        assert!(when > t0);
        assert!(when <= t0 + Duration::from_millis(60));
    }

    #[test]
    fn pop_advances_utilization_and_drains_over_time() {
        let t0 = now();
        let mut q = EgressQueue::new(8000, 100, t0);
        q.push(stream_packet(1, 0, 50));
        assert_eq!(q.when_can_pop(), Some(t0));
        let pkt = q.pop(t0);
        assert_eq!(pkt.packet_type(), crate::wire::PacketType::Stream);

        // Immediately after, the bucket holds the packet's framed size.
        q.push(stream_packet(1, 1, 100));
        let when = q.when_can_pop().unwrap();
        assert!(when >= t0);

        // After enough elapsed time the bucket has drained and the next
        // packet is admitted sooner.
        let later = t0 + Duration::from_secs(1);
        let pkt2 = q.pop(later);
        assert_eq!(pkt2.header, Header::Stream { channel_id: 1, packet_index: 1 });
    }

    #[test]
    #[should_panic(expected = "ClockWentBackwards")]
    fn clock_regression_aborts() {
        let t0 = now();
        let mut q = EgressQueue::new(8000, 100, t0);
        q.push(stream_packet(1, 0, 10));
        let _ = q.pop(t0);
        let earlier = t0 - Duration::from_millis(1);
        q.push(stream_packet(1, 1, 10));
        let _ = q.pop(earlier);
    }

    #[test]
    #[should_panic(expected = "PopFromEmpty")]
    fn pop_from_empty_aborts() {
        let t0 = now();
        let mut q = EgressQueue::new(1000, 5000, t0);
        let _ = q.pop(t0);
    }

    #[test]
    fn priority_ordering_preserved_through_the_queue() {
        let t0 = now();
        let mut q = EgressQueue::new(100_000_000, 5_000_000, t0);
        q.push(stream_packet(1, 0, 10));
        q.push(control_packet(1));
        // CONTROL has the higher enumerant, so it must pop first even
        // though STREAM was pushed first.
        let first = q.pop(t0);
        assert_eq!(first.packet_type(), crate::wire::PacketType::Control);
        let second = q.pop(t0);
        assert_eq!(second.packet_type(), crate::wire::PacketType::Stream);
    }

    #[test]
    fn counters_track_queued_and_released_bytes() {
        let t0 = now();
        let mut q = EgressQueue::new(8000, 5000, t0);
        q.push(stream_packet(1, 0, 50));
        q.push(stream_packet(1, 1, 50));
        assert_eq!(q.counters().packets_queued, 2);
        let _ = q.pop(t0);
        assert_eq!(q.counters().packets_released, 1);
        assert!(q.counters().bytes_released > 0);
    }

    #[test]
    fn equal_priority_packets_drain_fifo() {
        let t0 = now();
        let mut q = EgressQueue::new(100_000_000, 5_000_000, t0);
        q.push(stream_packet(1, 0, 10));
        q.push(stream_packet(1, 1, 10));
        q.push(stream_packet(1, 2, 10));
        let first = q.pop(t0);
        let second = q.pop(t0);
        let third = q.pop(t0);
        assert_eq!(first.header, Header::Stream { channel_id: 1, packet_index: 0 });
        assert_eq!(second.header, Header::Stream { channel_id: 1, packet_index: 1 });
        assert_eq!(third.header, Header::Stream { channel_id: 1, packet_index: 2 });
    }

    #[test]
    fn rate_ceiling_bounds_bytes_released_over_interval() {
        let t0 = now();
        let mut q = EgressQueue::new(8000, 1000, t0); // 1000 bytes/sec
        for i in 0..200u32 {
            q.push(stream_packet(1, i, 50));
        }
        let t1 = t0 + Duration::from_secs(2);
        let mut released = 0u64;
        loop {
            match q.when_can_pop() {
                Some(when) if when <= t1 => {
                    let pkt = q.pop(when.max(t0));
                    released += pkt.len() as u64;
                }
                _ => break,
            }
        }
        // buffer_size + R * (t1 - t0) = 1000 + 1000*2 = 3000
        assert!(released <= 3000, "released {released} exceeded the shaper ceiling");
    }
}
