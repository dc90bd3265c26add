//! # Stream Engine
//!
//! Bidirectional ordered chunk pipeline with FEC-ratio-paced symbol
//! generation and ACK handling (§4.C). The FEC codec underneath is a
//! GF(256) random linear network code over a sliding window — the
//! idiomatic Rust shape of "convolutional/sliding-window code with
//! ACK-driven recovery": every repair symbol carries the coefficients it
//! was combined with, so the decoder can solve for an unknown original once
//! enough independent combinations (or the original itself) have arrived.

use std::collections::{BTreeMap, VecDeque};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::constants::{FEC_INDEX, FEC_RATIO_DEN, FEC_RATIO_NUM, MAX_STREAM_PAYLOAD, STREAM_WINDOW_CAPACITY};
use crate::error::CodecError;

// ─── GF(256) arithmetic ─────────────────────────────────────────────────────

mod gf256 {
    use once_cell::sync::Lazy;

    const PRIMITIVE_POLY: u16 = 0x11D;

    struct Tables {
        exp: [u8; 512],
        log: [u8; 256],
    }

    static TABLES: Lazy<Tables> = Lazy::new(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255usize {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= PRIMITIVE_POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        Tables { exp, log }
    });

    pub fn mul(a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        let t = &*TABLES;
        t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
    }

    pub fn div(a: u8, b: u8) -> u8 {
        assert!(b != 0, "division by zero in GF(256)");
        if a == 0 {
            return 0;
        }
        let t = &*TABLES;
        let diff = (t.log[a as usize] as i32 - t.log[b as usize] as i32).rem_euclid(255);
        t.exp[diff as usize]
    }
}

// ─── Wire encoding for a coded symbol ───────────────────────────────────────

/// Internal per-symbol representation used for GF-linear combination: a
/// 2-byte length prefix (so an original's exact length survives a pure-FEC
/// recovery) followed by the payload, zero-padded to a fixed capacity.
fn to_padded(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + MAX_STREAM_PAYLOAD);
    out.put_u16_ne(data.len() as u16);
    out.extend_from_slice(data);
    out.resize(2 + MAX_STREAM_PAYLOAD, 0);
    out
}

fn from_padded(padded: &[u8]) -> Bytes {
    let len = u16::from_ne_bytes([padded[0], padded[1]]) as usize;
    Bytes::copy_from_slice(&padded[2..2 + len])
}

fn gf_combine(coeffs: &[u8], rows: &[&[u8]]) -> Vec<u8> {
    let mut out = vec![0u8; 2 + MAX_STREAM_PAYLOAD];
    for (coeff, row) in coeffs.iter().zip(rows) {
        if *coeff == 0 {
            continue;
        }
        for (o, b) in out.iter_mut().zip(row.iter()) {
            *o ^= gf256::mul(*coeff, *b);
        }
    }
    out
}

// ─── Codec adapter: encoder side ────────────────────────────────────────────

struct WindowEntry {
    index: u32,
    padded: Vec<u8>,
}

/// The stream codec's encoder half (§4.A): assigns indices, carries the
/// coding window, and mints FEC repair symbols from it.
pub struct StreamCodecEncoder {
    window: VecDeque<WindowEntry>,
    next_index: u32,
}

impl StreamCodecEncoder {
    pub fn new() -> Self {
        StreamCodecEncoder {
            window: VecDeque::new(),
            next_index: 0,
        }
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Assigns the next index and keeps the chunk in the coding window.
    pub fn add_chunk(&mut self, data: Bytes) -> u32 {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        self.window.push_back(WindowEntry {
            index,
            padded: to_padded(&data),
        });
        while self.window.len() > STREAM_WINDOW_CAPACITY {
            self.window.pop_front();
        }
        index
    }

    /// A GF(256) random linear combination of everything currently in the
    /// window, framed as `[window_start:u32][window_len:u32][coeffs:
    /// window_len][combined: 2+MAX_STREAM_PAYLOAD]`.
    pub fn generate_fec(&self) -> Bytes {
        let window_start = self.window.front().map(|e| e.index).unwrap_or(self.next_index);
        let mut rng = rand::rng();
        let coeffs: Vec<u8> = self
            .window
            .iter()
            .map(|_| loop {
                let c = rng.random::<u8>();
                if c != 0 {
                    break c;
                }
            })
            .collect();
        let rows: Vec<&[u8]> = self.window.iter().map(|e| e.padded.as_slice()).collect();
        let combined = gf_combine(&coeffs, &rows);

        let mut buf = BytesMut::with_capacity(8 + coeffs.len() + combined.len());
        buf.put_u32_ne(window_start);
        buf.put_u32_ne(self.window.len() as u32);
        buf.extend_from_slice(&coeffs);
        buf.extend_from_slice(&combined);
        buf.freeze()
    }

    /// Evicts window entries the receiver has definitely already delivered.
    pub fn acknowledge(&mut self, receiver_expects: u32) {
        while self
            .window
            .front()
            .map(|e| e.index < receiver_expects)
            .unwrap_or(false)
        {
            self.window.pop_front();
        }
    }
}

impl Default for StreamCodecEncoder {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Codec adapter: decoder side ────────────────────────────────────────────

/// A repair symbol not yet reducible to a single unknown.
struct PendingRow {
    /// Remaining unresolved terms: absolute index -> coefficient.
    unknowns: BTreeMap<u32, u8>,
    /// The running combined value, with all known contributions already
    /// subtracted out.
    combined: Vec<u8>,
}

/// The stream codec's decoder half (§4.A): accumulates originals and
/// repair symbols, reducing repair rows against whatever originals are
/// already known until they resolve to a single unknown.
pub struct StreamCodecDecoder {
    known: BTreeMap<u32, Bytes>,
    pending_rows: Vec<PendingRow>,
    fresh: Vec<(u32, Bytes)>,
}

impl StreamCodecDecoder {
    pub fn new() -> Self {
        StreamCodecDecoder {
            known: BTreeMap::new(),
            pending_rows: Vec::new(),
            fresh: Vec::new(),
        }
    }

    pub fn add_original(&mut self, data: Bytes, index: u32) {
        if self.known.contains_key(&index) {
            return; // idempotent duplicate
        }
        self.insert_known(index, data);
    }

    pub fn add_recovery(&mut self, bytes: &[u8]) {
        let mut buf = bytes;
        if buf.len() < 8 {
            return; // malformed, drop silently — codec-level corruption isolation
        }
        let window_start = buf.get_u32_ne();
        let window_len = buf.get_u32_ne() as usize;
        if buf.len() < window_len + 2 + MAX_STREAM_PAYLOAD {
            return;
        }
        let coeffs = &buf[..window_len];
        let mut combined = buf[window_len..window_len + 2 + MAX_STREAM_PAYLOAD].to_vec();

        let mut unknowns = BTreeMap::new();
        for (i, &coeff) in coeffs.iter().enumerate() {
            if coeff == 0 {
                continue;
            }
            let index = window_start.wrapping_add(i as u32);
            match self.known.get(&index) {
                Some(data) => {
                    let padded = to_padded(data);
                    for (c, k) in combined.iter_mut().zip(padded.iter()) {
                        *c ^= gf256::mul(coeff, *k);
                    }
                }
                None => {
                    unknowns.insert(index, coeff);
                }
            }
        }

        if unknowns.is_empty() {
            return; // fully explained by what we already know
        }
        self.pending_rows.push(PendingRow { unknowns, combined });
        self.reduce_pending();
    }

    fn insert_known(&mut self, index: u32, data: Bytes) {
        self.known.insert(index, data.clone());
        self.fresh.push((index, data));
        self.reduce_pending();
    }

    /// Re-scans pending rows: substitutes any now-known term, and solves any
    /// row left with exactly one unknown.
    fn reduce_pending(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            let mut solved = Vec::new();
            for row in &mut self.pending_rows {
                let known_now: Vec<u32> = row
                    .unknowns
                    .keys()
                    .copied()
                    .filter(|i| self.known.contains_key(i))
                    .collect();
                for index in known_now {
                    if let Some(coeff) = row.unknowns.remove(&index) {
                        let padded = to_padded(&self.known[&index]);
                        for (c, k) in row.combined.iter_mut().zip(padded.iter()) {
                            *c ^= gf256::mul(coeff, *k);
                        }
                        changed = true;
                    }
                }
                if row.unknowns.len() == 1 {
                    let (&index, &coeff) = row.unknowns.iter().next().unwrap();
                    let mut solved_padded = vec![0u8; row.combined.len()];
                    for (o, c) in solved_padded.iter_mut().zip(row.combined.iter()) {
                        *o = gf256::div(*c, coeff);
                    }
                    solved.push((index, from_padded(&solved_padded)));
                }
            }
            for (index, data) in solved {
                if !self.known.contains_key(&index) {
                    self.known.insert(index, data.clone());
                    self.fresh.push((index, data));
                    changed = true;
                }
            }
            self.pending_rows.retain(|r| !r.unknowns.is_empty());
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.fresh.is_empty()
    }

    pub fn drain_new_originals(&mut self) -> Vec<(u32, Bytes)> {
        std::mem::take(&mut self.fresh)
    }

    pub fn get_original(&self, index: u32) -> Option<&Bytes> {
        self.known.get(&index)
    }

    /// Cumulative ACK: the smallest index not yet known, encoded as a plain
    /// `u32` native-endian payload.
    pub fn generate_ack(&self, floor: u32) -> Bytes {
        let mut next = floor;
        while self.known.contains_key(&next) {
            next = next.wrapping_add(1);
        }
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32_ne(next);
        buf.freeze()
    }
}

impl Default for StreamCodecDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Stream Engine (§4.C) ───────────────────────────────────────────────────

/// A hint about how caught-up the receiver is; informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityLevel {
    UnderRatio,
    AtRatio,
    AllAcked,
}

/// The outgoing half of a stream: pending chunks, the codec, and the
/// segment counters that interleave FEC symbols among originals.
pub struct StreamEncoder {
    codec: StreamCodecEncoder,
    pending: VecDeque<Bytes>,
    receiver_expects: u32,
    /// 1-based position within the current segment of `d` chunks; `0`
    /// before the first chunk is ever sent.
    seg_chunk1: u32,
    /// Position within the current segment's `f` FEC symbols.
    seg_fec: u32,
}

impl StreamEncoder {
    pub fn new() -> Self {
        StreamEncoder {
            codec: StreamCodecEncoder::new(),
            pending: VecDeque::new(),
            receiver_expects: 0,
            seg_chunk1: 0,
            seg_fec: 0,
        }
    }

    pub fn queue_chunk(&mut self, data: Bytes) {
        self.pending.push_back(data);
    }

    fn is_fec_next(&self) -> bool {
        let d = FEC_RATIO_DEN as f64;
        let f = FEC_RATIO_NUM as f64;
        let threshold = ((self.seg_fec as f64 + 1.0) * d / f).ceil() as u32;
        self.seg_chunk1 == threshold
    }

    pub fn has_data(&self) -> bool {
        !self.pending.is_empty() || self.is_fec_next()
    }

    /// Emits the next symbol per the interleaving rule, or `None` if
    /// nothing is due (callers should check [`Self::has_data`] first).
    pub fn get_symbol(&mut self) -> Option<(Bytes, u32)> {
        if self.is_fec_next() {
            self.seg_fec = (self.seg_fec + 1) % FEC_RATIO_NUM;
            return Some((self.codec.generate_fec(), FEC_INDEX));
        }
        let chunk = self.pending.pop_front()?;
        let index = self.codec.add_chunk(chunk.clone());
        self.seg_chunk1 = if self.seg_chunk1 == FEC_RATIO_DEN {
            1
        } else {
            self.seg_chunk1 + 1
        };
        Some((chunk, index))
    }

    /// Takes the codec's reply and folds it into `receiver_expects`,
    /// never letting it decrease — the reference implementation leaves
    /// out-of-order ACK handling as an open question; this profile commits
    /// to "take the maximum" (see `DESIGN.md`).
    pub fn process_ack(&mut self, ack: &Bytes) -> u32 {
        let mut buf: &[u8] = ack;
        let reply = if buf.len() >= 4 { buf.get_u32_ne() } else { self.receiver_expects };
        self.receiver_expects = self.receiver_expects.max(reply);
        self.codec.acknowledge(self.receiver_expects);
        self.receiver_expects
    }

    /// `seg_chunk1 == 0` only ever holds before the very first symbol is
    /// ever emitted, so it can't stand in for "at a segment boundary" —
    /// `seg_chunk1` otherwise cycles `1..=FEC_RATIO_DEN` and returns to
    /// `FEC_RATIO_DEN` exactly when a segment's `d` originals (and thus that
    /// segment's `f` FEC symbols, interleaved before the last of them) have
    /// all been emitted.
    pub fn reliability_level(&self) -> ReliabilityLevel {
        if self.receiver_expects == self.codec.next_index() {
            ReliabilityLevel::AllAcked
        } else if self.seg_chunk1 == FEC_RATIO_DEN {
            ReliabilityLevel::AtRatio
        } else {
            ReliabilityLevel::UnderRatio
        }
    }

    pub fn next_index(&self) -> u32 {
        self.codec.next_index()
    }
}

impl Default for StreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// The incoming half of a stream: codec decoder, delivery cursor, and an
/// ordered buffer of originals waiting for their turn.
pub struct StreamDecoder {
    codec: StreamCodecDecoder,
    next_index: u32,
    buffer: BTreeMap<u32, Bytes>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        StreamDecoder {
            codec: StreamCodecDecoder::new(),
            next_index: 0,
            buffer: BTreeMap::new(),
        }
    }

    pub fn process_symbol(&mut self, data: Bytes, index: u32) {
        if index == FEC_INDEX {
            self.codec.add_recovery(&data);
        } else {
            self.codec.add_original(data.clone(), index);
            if index >= self.next_index {
                self.buffer.insert(index, data);
            }
        }

        while self.codec.is_ready() {
            for (idx, chunk) in self.codec.drain_new_originals() {
                if idx >= self.next_index {
                    self.buffer.insert(idx, chunk);
                }
            }
        }
    }

    pub fn has_data(&self) -> bool {
        matches!(self.buffer.keys().next(), Some(&k) if k == self.next_index)
    }

    pub fn get_chunk(&mut self) -> Option<Bytes> {
        if !self.has_data() {
            return None;
        }
        let chunk = self.buffer.remove(&self.next_index);
        self.next_index = self.next_index.wrapping_add(1);
        chunk
    }

    pub fn generate_ack(&self) -> Bytes {
        self.codec.generate_ack(self.next_index)
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-channel bidirectional stream (§3): an encoder for the outgoing
/// direction and a decoder for the incoming one.
pub struct Stream {
    pub encoder: StreamEncoder,
    pub decoder: StreamDecoder,
}

impl Stream {
    pub fn new() -> Self {
        Stream {
            encoder: StreamEncoder::new(),
            decoder: StreamDecoder::new(),
        }
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}
