//! # Relay / Router
//!
//! Per-channel subscription table, packet classification, and the
//! decode→re-encode feedback loop between the block/stream engines and the
//! shaped egress queues (§4.F). This module holds all relay state; it is
//! driven by a single caller (the CLI's I/O task) that owns the socket and
//! never touches this state from more than one place at a time (§5).
//!
//! The relay never sends bytes itself — it reports what happened as
//! [`RelayEvents`] and leaves the actual `send_to`/timer scheduling to the
//! caller, matching the "relay owns all queues, queues don't own the relay"
//! shape from §9.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use quanta::Instant;
use tracing::{debug, trace, warn};

use crate::block::{redundancy_count, Block};
use crate::constants::NETWORK_BUFFER_SIZE;
use crate::error::RelayError;
use crate::shaper::EgressQueue;
use crate::stats::RelayStats;
use crate::stream::Stream;
use crate::wire::{ControlAction, Header, Packet, PacketType};

/// An ordered `peer -> EgressQueue` mapping, per §3: "Late subscriptions
/// overwrite earlier ones for the same endpoint" but otherwise preserve
/// join order. A `Vec` is the idiomatic choice at the subscriber counts a
/// single relay channel sees in this profile; no external ordered-map
/// dependency is pulled in for it.
#[derive(Default)]
struct SubscriberTable {
    entries: Vec<(SocketAddr, EgressQueue)>,
}

impl SubscriberTable {
    fn insert(&mut self, peer: SocketAddr, queue: EgressQueue) {
        if let Some(slot) = self.entries.iter_mut().find(|(p, _)| *p == peer) {
            slot.1 = queue;
        } else {
            self.entries.push((peer, queue));
        }
    }

    fn remove(&mut self, peer: SocketAddr) {
        self.entries.retain(|(p, _)| *p != peer);
    }

    fn get_mut(&mut self, peer: SocketAddr) -> Option<&mut EgressQueue> {
        self.entries.iter_mut().find(|(p, _)| *p == peer).map(|(_, q)| q)
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut (SocketAddr, EgressQueue)> {
        self.entries.iter_mut()
    }

    fn peers(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.entries.iter().map(|(p, _)| *p)
    }
}

/// What happened as a result of feeding one inbound datagram to the relay.
#[derive(Default)]
pub struct RelayEvents {
    /// Bytes to send right away, bypassing the shaper — only ever `STREAM_ACK`
    /// replies (§4.F, §9 "Open question — ACK scheduling for streams").
    pub immediate: Vec<(SocketAddr, Bytes)>,
    /// `(channel_id, peer)` pairs whose egress queue received at least one
    /// new packet; the caller should re-arm that queue's release timer.
    pub touched: Vec<(u32, SocketAddr)>,
}

/// All relay state: blocks, streams, and per-channel subscriptions.
/// §9 resolves the block/stream table question in favor of two flat maps
/// keyed by `(channel, block_id)` and `channel` respectively, since a
/// channel may carry both a block and a stream concurrently.
pub struct Relay {
    blocks: HashMap<(u32, u32), Block>,
    streams: HashMap<u32, Stream>,
    subscriptions: HashMap<u32, SubscriberTable>,
    /// Optional test hook (§4.F): drop every `lose_every`-th `BLOCK`/`STREAM`
    /// packet deterministically. `0` disables it.
    lose_every: u32,
    loss_counter: u64,
    stats: RelayStats,
}

impl Relay {
    pub fn new(lose_every: u32) -> Self {
        Relay {
            blocks: HashMap::new(),
            streams: HashMap::new(),
            subscriptions: HashMap::new(),
            lose_every,
            loss_counter: 0,
            stats: RelayStats::new(),
        }
    }

    /// Aggregate counters for logging/diagnostics (§3 "Ambient data"); never
    /// consulted by the decode or admission paths above.
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Direct access to one subscriber's queue, for the I/O task to poll
    /// `when_can_pop`/`pop` against after a `touched` notification.
    pub fn egress_queue_mut(&mut self, channel_id: u32, peer: SocketAddr) -> Option<&mut EgressQueue> {
        self.subscriptions.get_mut(&channel_id).and_then(|t| t.get_mut(peer))
    }

    /// Every `(channel, peer)` pair currently subscribed, for iterating all
    /// queues (e.g. at relay shutdown, or to rearm every timer on startup).
    pub fn all_queues(&mut self) -> impl Iterator<Item = (u32, SocketAddr, &mut EgressQueue)> {
        self.subscriptions.iter_mut().flat_map(|(&channel_id, table)| {
            table.iter_mut().map(move |(peer, queue)| (channel_id, *peer, queue))
        })
    }

    fn should_simulate_loss(&mut self) -> bool {
        if self.lose_every == 0 {
            return false;
        }
        self.loss_counter += 1;
        self.loss_counter % self.lose_every as u64 == 0
    }

    fn enqueue_to_subscribers(&mut self, channel_id: u32, packets: &[Packet], events: &mut RelayEvents) {
        let Some(table) = self.subscriptions.get_mut(&channel_id) else {
            return;
        };
        let mut touched = std::collections::HashSet::new();
        for packet in packets {
            for (peer, queue) in table.iter_mut() {
                queue.push(packet.clone());
                touched.insert(*peer);
            }
        }
        events.touched.extend(touched.into_iter().map(|peer| (channel_id, peer)));
    }

    /// Feed one inbound datagram to the relay (§4.F). `src` is the sending
    /// peer (used as the subscription key and as the ACK destination);
    /// `now` timestamps any egress queue created by a fresh subscription.
    pub fn handle_packet(
        &mut self,
        src: SocketAddr,
        bytes: Bytes,
        now: Instant,
    ) -> Result<RelayEvents, RelayError> {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                self.stats.packets.dropped_bad_packet += 1;
                return Err(err.into());
            }
        };
        let mut events = RelayEvents::default();

        match packet.packet_type() {
            PacketType::Control => {
                self.stats.packets.control_admitted += 1;
                self.handle_control(src, packet, now);
            }
            PacketType::Block => {
                self.stats.packets.block_admitted += 1;
                self.handle_block(src, packet, &mut events);
            }
            PacketType::Stream => {
                self.stats.packets.stream_admitted += 1;
                self.handle_stream(src, packet, &mut events);
            }
            PacketType::StreamAck => {
                self.stats.packets.stream_ack_admitted += 1;
                self.handle_stream_ack(packet);
            }
        }

        Ok(events)
    }

    fn handle_control(&mut self, src: SocketAddr, packet: Packet, now: Instant) {
        let Header::Control { action, channel_id, kbps } = packet.header else {
            unreachable!("classified as Control");
        };
        match action {
            ControlAction::Subscribe => {
                debug!(channel_id, kbps, peer = %src, "subscribe");
                let queue = EgressQueue::new(kbps, NETWORK_BUFFER_SIZE, now);
                self.subscriptions.entry(channel_id).or_default().insert(src, queue);
            }
            ControlAction::Unsubscribe => {
                debug!(channel_id, peer = %src, "unsubscribe");
                if let Some(table) = self.subscriptions.get_mut(&channel_id) {
                    table.remove(src);
                }
            }
        }
    }

    fn handle_block(&mut self, _src: SocketAddr, packet: Packet, events: &mut RelayEvents) {
        let Header::Block { channel_id, block_id, block_size, packet_index } = packet.header else {
            unreachable!("classified as Block");
        };

        if self.should_simulate_loss() {
            trace!(channel_id, block_id, packet_index, "simulated loss, dropping");
            self.stats.packets.dropped_simulated_loss += 1;
            return;
        }

        let block = self
            .blocks
            .entry((channel_id, block_id))
            .or_insert_with(|| Block::from_size(block_size));

        let original = Packet::new(
            Header::Block { channel_id, block_id, block_size, packet_index },
            packet.payload.clone(),
        );
        let mut outbound = vec![original];

        let just_decoded = block.process_symbol(&packet.payload, packet_index);
        if just_decoded {
            self.stats.blocks_decoded += 1;
            let n = block.n_original();
            let count = redundancy_count(n);
            match block.take_unseen_prefix(count) {
                Ok(symbols) => {
                    for (payload, index) in symbols {
                        outbound.push(Packet::new(
                            Header::Block { channel_id, block_id, block_size, packet_index: index },
                            payload,
                        ));
                    }
                }
                Err(err) => {
                    warn!(channel_id, block_id, %err, "redundancy symbol generation failed");
                    self.stats.packets.dropped_bad_symbol += 1;
                }
            }
        }

        self.enqueue_to_subscribers(channel_id, &outbound, events);
    }

    fn handle_stream(&mut self, src: SocketAddr, packet: Packet, events: &mut RelayEvents) {
        let Header::Stream { channel_id, packet_index } = packet.header else {
            unreachable!("classified as Stream");
        };

        if self.should_simulate_loss() {
            trace!(channel_id, packet_index, "simulated loss, dropping");
            self.stats.packets.dropped_simulated_loss += 1;
            return;
        }

        let is_new_stream = !self.streams.contains_key(&channel_id);
        let stream = self.streams.entry(channel_id).or_insert_with(Stream::new);
        if is_new_stream {
            self.stats.streams_active += 1;
        }
        stream.decoder.process_symbol(packet.payload, packet_index);

        let ack = Packet::new(Header::StreamAck { channel_id }, stream.decoder.generate_ack());
        events.immediate.push((src, ack.encode().freeze()));

        while let Some(chunk) = stream.decoder.get_chunk() {
            stream.encoder.queue_chunk(chunk);
        }

        let mut outbound = Vec::new();
        while stream.encoder.has_data() {
            let (payload, index) = stream
                .encoder
                .get_symbol()
                .expect("has_data() guarantees get_symbol() succeeds");
            outbound.push(Packet::new(Header::Stream { channel_id, packet_index: index }, payload));
        }

        self.enqueue_to_subscribers(channel_id, &outbound, events);
    }

    fn handle_stream_ack(&mut self, packet: Packet) {
        let Header::StreamAck { channel_id } = packet.header else {
            unreachable!("classified as StreamAck");
        };
        if let Some(stream) = self.streams.get_mut(&channel_id) {
            stream.encoder.process_ack(&packet.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ControlAction;
    use quanta::Clock;
    use std::net::{IpAddr, Ipv4Addr};

    fn now() -> Instant {
        Clock::new().now()
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn subscribe(relay: &mut Relay, channel_id: u32, peer: SocketAddr, kbps: u32) {
        let packet = Packet::new(
            Header::Control { action: ControlAction::Subscribe, channel_id, kbps },
            Bytes::new(),
        );
        relay.handle_packet(peer, packet.encode().freeze(), now()).unwrap();
    }

    #[test]
    fn subscribe_then_block_publish_enqueues_original_and_redundancy() {
        let mut relay = Relay::new(0);
        let sub = peer(9001);
        subscribe(&mut relay, 123, sub, 2000);

        let payload = Bytes::from(vec![b'j'; 1300]);
        let packet = Packet::new(
            Header::Block { channel_id: 123, block_id: 456, block_size: 1300, packet_index: 0 },
            payload,
        );
        let events = relay.handle_packet(peer(9999), packet.encode().freeze(), now()).unwrap();
        assert_eq!(events.touched, vec![(123, sub)]);

        let queue = relay.egress_queue_mut(123, sub).unwrap();
        // The original packet plus the redundancy re-emission prefix.
        assert!(queue.len() >= 1);
    }

    #[test]
    fn unknown_packet_type_is_bad_packet() {
        let mut relay = Relay::new(0);
        let mut bytes = bytes::BytesMut::new();
        use bytes::BufMut;
        bytes.put_u32_ne(0); // version
        bytes.put_u32_ne(99); // bogus type
        let err = relay.handle_packet(peer(1), bytes.freeze(), now()).unwrap_err();
        assert!(matches!(err, RelayError::Codec(_)));
    }

    #[test]
    fn stream_ack_is_sent_immediately_and_bypasses_enqueue() {
        let mut relay = Relay::new(0);
        let src = peer(5000);
        let packet = Packet::new(
            Header::Stream { channel_id: 1, packet_index: 0 },
            Bytes::from_static(b"chunk"),
        );
        let events = relay.handle_packet(src, packet.encode().freeze(), now()).unwrap();
        assert_eq!(events.immediate.len(), 1);
        assert_eq!(events.immediate[0].0, src);
    }

    #[test]
    fn unsubscribe_removes_peer_from_future_enqueues() {
        let mut relay = Relay::new(0);
        let sub = peer(9002);
        subscribe(&mut relay, 7, sub, 500);

        let unsub = Packet::new(
            Header::Control { action: ControlAction::Unsubscribe, channel_id: 7, kbps: 0 },
            Bytes::new(),
        );
        relay.handle_packet(sub, unsub.encode().freeze(), now()).unwrap();

        let stream_pkt = Packet::new(
            Header::Stream { channel_id: 7, packet_index: 0 },
            Bytes::from_static(b"x"),
        );
        let events = relay.handle_packet(peer(1), stream_pkt.encode().freeze(), now()).unwrap();
        assert!(events.touched.is_empty());
    }

    #[test]
    fn resubscribe_replaces_queue_and_discards_prior_contents() {
        let mut relay = Relay::new(0);
        let sub = peer(9003);
        subscribe(&mut relay, 3, sub, 100);

        let stream_pkt = Packet::new(
            Header::Stream { channel_id: 3, packet_index: 0 },
            Bytes::from_static(b"x"),
        );
        relay.handle_packet(peer(1), stream_pkt.encode().freeze(), now()).unwrap();
        assert!(relay.egress_queue_mut(3, sub).unwrap().len() > 0);

        subscribe(&mut relay, 3, sub, 2000);
        assert_eq!(relay.egress_queue_mut(3, sub).unwrap().len(), 0);
    }

    #[test]
    fn simulated_loss_drops_every_nth_block_packet() {
        let mut relay = Relay::new(3);
        let sub = peer(9004);
        subscribe(&mut relay, 1, sub, 2000);

        let mut delivered = 0usize;
        for i in 0..6u32 {
            let packet = Packet::new(
                Header::Block { channel_id: 1, block_id: 1, block_size: 10, packet_index: i },
                Bytes::from_static(b"x"),
            );
            let events = relay.handle_packet(peer(1), packet.encode().freeze(), now()).unwrap();
            if !events.touched.is_empty() {
                delivered += 1;
            }
        }
        // Every 3rd of 6 packets is dropped -> 4 delivered.
        assert_eq!(delivered, 4);
    }
}
