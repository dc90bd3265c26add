//! # Packet Codec
//!
//! Header variants, framing, and the priority order used by the shaped
//! egress queue. All headers share a 64-bit prefix `(version: u32, type:
//! u32)`. Endianness is host-native by design — this is an experimental
//! profile, not a production wire format, and native endianness is made
//! explicit (via [`bytes`]' `_ne` accessors) rather than left to struct
//! layout.

use std::cmp::Reverse;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// Maximum size of any single UDP datagram this relay sends or accepts.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Wire version this profile speaks. Any other value is rejected.
pub const VERSION: u32 = 0;

const PREFIX_LEN: usize = 8; // version: u32 + type: u32

/// Packet type discriminant. Ordering here **is** the shaped queue's
/// cross-type priority: a larger enumerant drains before a smaller one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum PacketType {
    Stream = 0,
    Block = 1,
    StreamAck = 2,
    Control = 3,
}

impl PacketType {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(PacketType::Stream),
            1 => Some(PacketType::Block),
            2 => Some(PacketType::StreamAck),
            3 => Some(PacketType::Control),
            _ => None,
        }
    }
}

/// Action carried by a `CONTROL` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlAction {
    Unsubscribe = 0,
    Subscribe = 1,
}

impl ControlAction {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ControlAction::Unsubscribe),
            1 => Some(ControlAction::Subscribe),
            _ => None,
        }
    }
}

/// The per-variant header fields, already parsed out of the wire prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Block {
        channel_id: u32,
        block_id: u32,
        block_size: u32,
        packet_index: u32,
    },
    Stream {
        channel_id: u32,
        packet_index: u32,
    },
    StreamAck {
        channel_id: u32,
    },
    Control {
        action: ControlAction,
        channel_id: u32,
        kbps: u32,
    },
}

impl Header {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Header::Block { .. } => PacketType::Block,
            Header::Stream { .. } => PacketType::Stream,
            Header::StreamAck { .. } => PacketType::StreamAck,
            Header::Control { .. } => PacketType::Control,
        }
    }

    pub fn channel_id(&self) -> u32 {
        match self {
            Header::Block { channel_id, .. }
            | Header::Stream { channel_id, .. }
            | Header::StreamAck { channel_id, .. }
            | Header::Control { channel_id, .. } => *channel_id,
        }
    }

    fn encoded_len(&self) -> usize {
        PREFIX_LEN
            + match self {
                Header::Block { .. } => 16,
                Header::Stream { .. } => 8,
                Header::StreamAck { .. } => 4,
                Header::Control { .. } => 12,
            }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_ne(VERSION);
        buf.put_u32_ne(self.packet_type() as u32);
        match self {
            Header::Block {
                channel_id,
                block_id,
                block_size,
                packet_index,
            } => {
                buf.put_u32_ne(*channel_id);
                buf.put_u32_ne(*block_id);
                buf.put_u32_ne(*block_size);
                buf.put_u32_ne(*packet_index);
            }
            Header::Stream {
                channel_id,
                packet_index,
            } => {
                buf.put_u32_ne(*channel_id);
                buf.put_u32_ne(*packet_index);
            }
            Header::StreamAck { channel_id } => {
                buf.put_u32_ne(*channel_id);
            }
            Header::Control {
                action,
                channel_id,
                kbps,
            } => {
                buf.put_u32_ne(*action as u32);
                buf.put_u32_ne(*channel_id);
                buf.put_u32_ne(*kbps);
            }
        }
    }
}

/// A fully-framed packet: header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: Header, payload: Bytes) -> Self {
        Packet { header, payload }
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type()
    }

    pub fn len(&self) -> usize {
        self.header.encoded_len() + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.len());
        self.header.write(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        if buf.len() < PREFIX_LEN {
            return Err(CodecError::BadPacket("shorter than header prefix"));
        }
        let version = buf.get_u32_ne();
        if version != VERSION {
            return Err(CodecError::BadPacket("unsupported version"));
        }
        let raw_type = buf.get_u32_ne();
        let packet_type =
            PacketType::from_u32(raw_type).ok_or(CodecError::BadPacket("unknown packet type"))?;

        let header = match packet_type {
            PacketType::Block => {
                if buf.len() < 16 {
                    return Err(CodecError::BadPacket("truncated BLOCK header"));
                }
                Header::Block {
                    channel_id: buf.get_u32_ne(),
                    block_id: buf.get_u32_ne(),
                    block_size: buf.get_u32_ne(),
                    packet_index: buf.get_u32_ne(),
                }
            }
            PacketType::Stream => {
                if buf.len() < 8 {
                    return Err(CodecError::BadPacket("truncated STREAM header"));
                }
                Header::Stream {
                    channel_id: buf.get_u32_ne(),
                    packet_index: buf.get_u32_ne(),
                }
            }
            PacketType::StreamAck => {
                if buf.len() < 4 {
                    return Err(CodecError::BadPacket("truncated STREAM_ACK header"));
                }
                Header::StreamAck {
                    channel_id: buf.get_u32_ne(),
                }
            }
            PacketType::Control => {
                if buf.len() < 12 {
                    return Err(CodecError::BadPacket("truncated CONTROL header"));
                }
                let action = ControlAction::from_u32(buf.get_u32_ne())
                    .ok_or(CodecError::BadPacket("unknown control action"))?;
                Header::Control {
                    action,
                    channel_id: buf.get_u32_ne(),
                    kbps: buf.get_u32_ne(),
                }
            }
        };

        Ok(Packet {
            header,
            payload: buf,
        })
    }

    /// The key used for the shaped egress queue's priority order (§4.D,
    /// §8.7): by packet type first (larger enumerant drains first), then —
    /// within `BLOCK` only — by ascending `packet_index` (earlier indices
    /// drain first, hence the `Reverse` so a smaller index sorts greater).
    fn priority_key(&self) -> (u32, Reverse<u32>) {
        let index = match &self.header {
            Header::Block { packet_index, .. } => *packet_index,
            _ => 0,
        };
        (self.packet_type() as u32, Reverse(index))
    }
}

impl PartialOrd for Packet {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Packet {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority_key().cmp(&other.priority_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(any::<u8>(), 0..=512)
    }

    fn header_strategy() -> impl Strategy<Value = Header> {
        prop_oneof![
            (any::<u32>(), any::<u32>(), any::<u32>(), any::<u32>()).prop_map(
                |(channel_id, block_id, block_size, packet_index)| Header::Block {
                    channel_id,
                    block_id,
                    block_size,
                    packet_index,
                }
            ),
            (any::<u32>(), any::<u32>()).prop_map(|(channel_id, packet_index)| Header::Stream {
                channel_id,
                packet_index,
            }),
            any::<u32>().prop_map(|channel_id| Header::StreamAck { channel_id }),
            (any::<bool>(), any::<u32>(), any::<u32>()).prop_map(
                |(subscribe, channel_id, kbps)| Header::Control {
                    action: if subscribe {
                        ControlAction::Subscribe
                    } else {
                        ControlAction::Unsubscribe
                    },
                    channel_id,
                    kbps,
                }
            ),
        ]
    }

    proptest! {
        #[test]
        fn round_trip(header in header_strategy(), payload in payload_strategy()) {
            let packet = Packet::new(header.clone(), Bytes::from(payload.clone()));
            let encoded = packet.encode().freeze();
            let decoded = Packet::decode(encoded).unwrap();
            prop_assert_eq!(decoded.header, header);
            prop_assert_eq!(decoded.payload.to_vec(), payload);
        }
    }

    #[test]
    fn rejects_short_buffer() {
        let err = Packet::decode(Bytes::from_static(&[0, 0, 0])).unwrap_err();
        assert!(matches!(err, CodecError::BadPacket(_)));
    }

    #[test]
    fn rejects_nonzero_version() {
        let mut buf = BytesMut::new();
        buf.put_u32_ne(1);
        buf.put_u32_ne(PacketType::Stream as u32);
        buf.put_u32_ne(0);
        buf.put_u32_ne(0);
        let err = Packet::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, CodecError::BadPacket(_)));
    }

    #[test]
    fn priority_orders_by_type_then_block_index_ascending() {
        let ack = Packet::new(Header::StreamAck { channel_id: 1 }, Bytes::new());
        let control = Packet::new(
            Header::Control {
                action: ControlAction::Subscribe,
                channel_id: 1,
                kbps: 100,
            },
            Bytes::new(),
        );
        let stream = Packet::new(
            Header::Stream {
                channel_id: 1,
                packet_index: 0,
            },
            Bytes::new(),
        );
        let block_low = Packet::new(
            Header::Block {
                channel_id: 1,
                block_id: 1,
                block_size: 10,
                packet_index: 0,
            },
            Bytes::new(),
        );
        let block_high = Packet::new(
            Header::Block {
                channel_id: 1,
                block_id: 1,
                block_size: 10,
                packet_index: 5,
            },
            Bytes::new(),
        );

        assert!(control > ack);
        assert!(ack > block_high);
        assert!(block_high > stream);
        // Within BLOCK, the earlier index must be the greater priority key
        // so it pops first from a max-heap.
        assert!(block_low > block_high);
    }
}
