//! Fixed constants for this experimental profile. A production variant
//! would negotiate most of these; here they are compile-time fixed.

use crate::wire::MAX_PACKET_SIZE;

/// Size of a `BLOCK` header: 8-byte prefix + 4 u32 fields.
const BLOCK_HEADER_LEN: usize = 8 + 16;

/// Largest original/redundancy symbol payload a `BLOCK` packet carries.
pub const MAX_BLOCK_PAYLOAD: usize = MAX_PACKET_SIZE - BLOCK_HEADER_LEN;

/// Re-emission multiplier after a block decodes for the first time:
/// `round(n * REDUNDANCY)` symbols are pushed to every subscriber.
pub const REDUNDANCY: f64 = 1.3;

/// FEC symbols per original chunk in the stream engine's interleaving rule,
/// expressed as `FEC_RATIO = numerator / denominator` (recovery/original).
pub const FEC_RATIO_NUM: u32 = 2;
pub const FEC_RATIO_DEN: u32 = 5;

/// Sentinel index marking a stream recovery symbol (never a valid original
/// index).
pub const FEC_INDEX: u32 = u32::MAX;

/// Shaper buffer capacity, in bytes, for every egress queue in this profile.
pub const NETWORK_BUFFER_SIZE: u64 = 5000;

/// Size of a `STREAM` header: 8-byte prefix + 2 u32 fields.
const STREAM_HEADER_LEN: usize = 8 + 8;

/// Largest chunk payload a `STREAM` packet carries.
pub const MAX_STREAM_PAYLOAD: usize = MAX_PACKET_SIZE - STREAM_HEADER_LEN;

/// Chunks kept in the stream encoder's coding window even without an ACK;
/// bounds memory for a stream no receiver ever acknowledges.
pub const STREAM_WINDOW_CAPACITY: usize = 128;
