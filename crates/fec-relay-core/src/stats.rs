//! # Relay Statistics
//!
//! Per-relay aggregate counters (§3 "Ambient data"): packets admitted or
//! dropped per kind, and bytes queued/released per egress queue. Exported
//! as a plain `serde::Serialize` struct for logging and diagnostics only —
//! never consulted by decode or admission logic, so a bug in stats
//! accounting can never change relay behavior.

use serde::Serialize;

/// Packets classified and admitted or dropped, broken down by the reason a
/// drop happened (§7's `BadPacket`/`BadSymbol` taxonomy).
#[derive(Debug, Clone, Default, Serialize)]
pub struct PacketCounters {
    pub block_admitted: u64,
    pub stream_admitted: u64,
    pub stream_ack_admitted: u64,
    pub control_admitted: u64,
    pub dropped_bad_packet: u64,
    pub dropped_bad_symbol: u64,
    pub dropped_simulated_loss: u64,
}

/// Bytes queued onto and released from a single subscriber's egress queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounters {
    pub bytes_queued: u64,
    pub bytes_released: u64,
    pub packets_queued: u64,
    pub packets_released: u64,
}

impl QueueCounters {
    pub fn record_queued(&mut self, bytes: usize) {
        self.bytes_queued += bytes as u64;
        self.packets_queued += 1;
    }

    pub fn record_released(&mut self, bytes: usize) {
        self.bytes_released += bytes as u64;
        self.packets_released += 1;
    }
}

/// Top-level relay stats, aggregated across every channel and subscriber.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    pub packets: PacketCounters,
    pub blocks_decoded: u64,
    pub streams_active: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }
}
