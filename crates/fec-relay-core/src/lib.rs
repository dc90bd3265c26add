//! # fec-relay-core
//!
//! Core of a UDP pub/sub relay that delivers bounded blocks and continuous
//! streams under packet loss, using forward error correction instead of
//! retransmission: blocks use a rateless fountain code, streams use a
//! GF(256) random linear network code over a sliding window with
//! ACK-driven recovery. Each subscriber's outbound traffic is paced through
//! a leaky-bucket shaper configured with a per-subscriber bit rate.
//!
//! ## Crate structure
//!
//! - [`wire`] — Packet header variants, framing, shaped-queue priority order
//! - [`block`] — Per-block decode state and on-demand symbol generation
//! - [`stream`] — Ordered chunk pipeline, FEC interleaving, ACK handling
//! - [`shaper`] — Per-subscriber leaky-bucket egress queue
//! - [`relay`] — Channel subscription table and decode→re-encode dispatch
//! - [`stats`] — Aggregate relay counters, for logging/diagnostics only
//! - [`error`] — Error taxonomy (`RelayError`, `CodecError`)
//! - [`constants`] — Fixed constants for this experimental wire profile

pub mod block;
pub mod constants;
pub mod error;
pub mod relay;
pub mod shaper;
pub mod stats;
pub mod stream;
pub mod wire;
