//! # Block Engine
//!
//! Per-block decode state, tracking of already-seen symbol indices, and
//! on-demand generation of original + redundant symbols (§4.B).
//!
//! The rateless block code itself is [`raptorq`] — any sufficient subset of
//! `n + ε` symbols reconstructs the block, matching §8.1. Original symbols
//! never touch the codec at all: they are sliced directly out of the
//! decoded buffer, exactly as the reference implementation does; only
//! indices `>= n` ask the codec to mint a fresh redundancy symbol.

use bytes::Bytes;
use raptorq::{Decoder, Encoder, EncodingPacket, ObjectTransmissionInformation, PayloadId};

use crate::constants::{MAX_BLOCK_PAYLOAD, REDUNDANCY};
use crate::error::CodecError;

/// `n = ceil(block_size / MAX_BLOCK_PAYLOAD)`.
pub fn n_original(block_size: u32) -> u32 {
    ((block_size as u64 + MAX_BLOCK_PAYLOAD as u64 - 1) / MAX_BLOCK_PAYLOAD as u64) as u32
}

/// `round(n * REDUNDANCY)`, the re-emission count after a fresh decode.
pub fn redundancy_count(n: u32) -> usize {
    (n as f64 * REDUNDANCY).round() as usize
}

/// The block codec adapter (§4.A). Starts life either as an encoder (full
/// data known up front) or a decoder (only `block_size` known); once a
/// decoder recovers the full block it upgrades to an encoder so further
/// `get_symbol` calls succeed.
enum BlockCodec {
    Encoding {
        encoder: Encoder,
        n_original: u32,
        /// Repair packets generated so far, indexed by `esi - n_original`.
        repair_cache: Vec<EncodingPacket>,
    },
    Decoding {
        decoder: Decoder,
        oti: ObjectTransmissionInformation,
        n_original: u32,
    },
}

impl BlockCodec {
    fn from_data(data: &[u8]) -> Self {
        let encoder = Encoder::with_defaults(data, MAX_BLOCK_PAYLOAD as u16);
        BlockCodec::Encoding {
            encoder,
            n_original: n_original(data.len() as u32),
            repair_cache: Vec::new(),
        }
    }

    fn from_size(block_size: u32) -> Self {
        let oti = ObjectTransmissionInformation::new(block_size as u64, MAX_BLOCK_PAYLOAD as u16, 1, 1, 8);
        let decoder = Decoder::new(oti);
        BlockCodec::Decoding {
            decoder,
            oti,
            n_original: n_original(block_size),
        }
    }

    fn n_original(&self) -> u32 {
        match self {
            BlockCodec::Encoding { n_original, .. } => *n_original,
            BlockCodec::Decoding { n_original, .. } => *n_original,
        }
    }

    /// `index` must be `>= n_original`. Pure function of codec state: the
    /// cache only ever grows, and a given index always yields the same
    /// bytes once generated.
    fn redundancy_symbol(&mut self, index: u32) -> Result<Bytes, CodecError> {
        match self {
            BlockCodec::Encoding {
                encoder,
                n_original,
                repair_cache,
            } => {
                let repair_index = (index - *n_original) as usize;
                while repair_cache.len() <= repair_index {
                    let want = (repair_cache.len() + 1) as u32;
                    *repair_cache = encoder
                        .get_encoded_packets(want)
                        .into_iter()
                        .filter(|p| p.payload_id().encoding_symbol_id() >= *n_original)
                        .collect();
                }
                Ok(Bytes::copy_from_slice(repair_cache[repair_index].data()))
            }
            BlockCodec::Decoding { .. } => Err(CodecError::BadSymbol(
                "cannot generate a redundancy symbol before the block has decoded",
            )),
        }
    }

    /// Feed one symbol (original or redundancy) to the decoder. Returns the
    /// fully recovered block the first time enough symbols have arrived.
    fn process_symbol(&mut self, payload: &[u8], index: u32) -> Option<Bytes> {
        match self {
            BlockCodec::Decoding { decoder, oti, .. } => {
                let mut data = payload.to_vec();
                data.resize(oti.symbol_size() as usize, 0);
                let packet = EncodingPacket::new(PayloadId::new(0, index), data);
                decoder.decode(packet).map(Bytes::from)
            }
            BlockCodec::Encoding { .. } => None,
        }
    }

    fn upgrade_to_encoder(&mut self, data: &[u8]) {
        *self = BlockCodec::from_data(data);
    }
}

/// One block's decode state: the byte buffer, the seen-symbol bitmap, and
/// the codec adapter (§3, §4.B).
pub struct Block {
    block_size: u32,
    decoded: Bytes,
    symbols_seen: Vec<bool>,
    codec: BlockCodec,
}

impl Block {
    /// Construct as an encoder: the full block is already known (e.g. the
    /// publisher role). `symbols_seen` starts all-`false` here — nothing has
    /// been sent to anyone yet — so `unseen_symbols`/`take_unseen_prefix`
    /// walk index `0` upward and hand out the `n` originals before ever
    /// touching the codec for a repair symbol, exactly as a fresh publish
    /// burst should (originals first, repair as the redundancy top-up).
    pub fn from_data(data: Bytes) -> Self {
        let codec = BlockCodec::from_data(&data);
        let n = codec.n_original();
        Block {
            block_size: data.len() as u32,
            decoded: data,
            symbols_seen: vec![false; n as usize],
            codec,
        }
    }

    /// Construct as a decoder: only the size is known, content arrives
    /// symbol by symbol. Initial `symbols_seen` length mirrors the
    /// reference profile's "some redundancy" headroom: `block_size /
    /// MAX_BLOCK_PAYLOAD * 2` (still subject to double-and-floor growth).
    pub fn from_size(block_size: u32) -> Self {
        let initial_len = (block_size as usize / MAX_BLOCK_PAYLOAD) * 2;
        Block {
            block_size,
            decoded: Bytes::new(),
            symbols_seen: vec![false; initial_len],
            codec: BlockCodec::from_size(block_size),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn n_original(&self) -> u32 {
        self.codec.n_original()
    }

    /// `None` until the first successful decode (or if constructed as an
    /// encoder, `Some` immediately).
    pub fn decoded_data(&self) -> Option<&Bytes> {
        if self.decoded.is_empty() {
            None
        } else {
            Some(&self.decoded)
        }
    }

    /// Feed one symbol. Returns `true` the first time this call completes
    /// the block (§8.1, §8.2). Idempotent: once decoded, always `false` and
    /// never mutates `decoded` again.
    pub fn process_symbol(&mut self, payload: &[u8], index: u32) -> bool {
        if !self.decoded.is_empty() {
            return false;
        }

        if index as usize >= self.symbols_seen.len() {
            let new_len = std::cmp::max(index as usize + 1, self.symbols_seen.len() * 2);
            self.symbols_seen.resize(new_len, false);
        }
        self.symbols_seen[index as usize] = true;

        if let Some(full) = self.codec.process_symbol(payload, index) {
            self.codec.upgrade_to_encoder(&full);
            self.decoded = full;
            return true;
        }
        false
    }

    /// A restartable, infinite-in-the-tail generator over unseen symbol
    /// indices in ascending order (§4.B).
    pub fn unseen_symbols(&mut self) -> BlockGenerator<'_> {
        BlockGenerator {
            block: self,
            index: 0,
        }
    }

    /// Bounded prefix convenience wrapper: the `n` symbols the relay
    /// re-emits after a decode, or the initial publish burst.
    pub fn take_unseen_prefix(&mut self, n: usize) -> Result<Vec<(Bytes, u32)>, CodecError> {
        let mut gen = self.unseen_symbols();
        (0..n).map(|_| gen.next_symbol()).collect()
    }
}

/// Single-pass iterator over a [`Block`]'s unseen symbol indices.
pub struct BlockGenerator<'a> {
    block: &'a mut Block,
    index: u32,
}

impl<'a> BlockGenerator<'a> {
    pub fn next_symbol(&mut self) -> Result<(Bytes, u32), CodecError> {
        while (self.index as usize) < self.block.symbols_seen.len()
            && self.block.symbols_seen[self.index as usize]
        {
            self.index += 1;
        }
        let index = self.index;
        self.index += 1;

        let n = self.block.n_original();
        if index < n {
            let decoded = self
                .block
                .decoded_data()
                .ok_or(CodecError::BadSymbol("no decoded data available yet"))?;
            let start = index as usize * MAX_BLOCK_PAYLOAD;
            let end = std::cmp::min(self.block.block_size as usize, start + MAX_BLOCK_PAYLOAD);
            Ok((decoded.slice(start..end), index))
        } else {
            Ok((self.block.codec.redundancy_symbol(index)?, index))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize, byte: u8) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn n_original_counts_full_and_partial_tail() {
        assert_eq!(n_original(MAX_BLOCK_PAYLOAD as u32), 1);
        assert_eq!(n_original(MAX_BLOCK_PAYLOAD as u32 + 1), 2);
        assert_eq!(n_original(1777), 2);
    }

    #[test]
    fn redundancy_count_rounds() {
        assert_eq!(redundancy_count(2), 3); // round(2 * 1.3) = round(2.6) = 3
        assert_eq!(redundancy_count(10), 13);
    }

    #[test]
    fn round_trip_single_original_symbol_block() {
        let data = sample(500, b'j');
        let mut encoder = Block::from_data(data.clone());
        let n = encoder.n_original();
        assert_eq!(n, 1);

        let symbols = encoder.take_unseen_prefix(redundancy_count(n)).unwrap();

        let mut decoder = Block::from_size(500);
        let mut done = false;
        for (payload, index) in symbols {
            if decoder.process_symbol(&payload, index) {
                done = true;
                break;
            }
        }
        assert!(done, "decoder should recover from n + redundancy symbols");
        assert_eq!(decoder.decoded_data().unwrap().as_ref(), data.as_ref());
    }

    #[test]
    fn round_trip_multi_symbol_block_with_loss() {
        let data = sample(1777, b'j');
        let mut encoder = Block::from_data(data.clone());
        let n = encoder.n_original();
        assert_eq!(n, 2);

        // n + redundancy symbols, but drop one original to force use of a
        // repair symbol.
        let symbols = encoder.take_unseen_prefix(redundancy_count(n) + 2).unwrap();

        let mut decoder = Block::from_size(1777);
        let mut done = false;
        for (i, (payload, index)) in symbols.into_iter().enumerate() {
            if i == 0 {
                continue; // simulate loss of the first original
            }
            if decoder.process_symbol(&payload, index) {
                done = true;
                break;
            }
        }
        assert!(done);
        assert_eq!(decoder.decoded_data().unwrap().as_ref(), data.as_ref());
    }

    #[test]
    fn idempotent_after_decode() {
        let data = sample(500, b'x');
        let mut encoder = Block::from_data(data.clone());
        let symbols = encoder.take_unseen_prefix(4).unwrap();

        let mut decoder = Block::from_size(500);
        let mut decode_count = 0;
        for (payload, index) in &symbols {
            if decoder.process_symbol(payload, *index) {
                decode_count += 1;
            }
        }
        assert_eq!(decode_count, 1);

        // Further symbols must not change decoded_data nor report success.
        let before = decoder.decoded_data().unwrap().clone();
        for (payload, index) in &symbols {
            assert!(!decoder.process_symbol(payload, *index));
        }
        assert_eq!(decoder.decoded_data().unwrap(), &before);
    }

    #[test]
    fn symbols_seen_grows_double_and_floor() {
        let mut block = Block::from_size(4000); // initial_len = 4000/1376*2 = 4
        block.process_symbol(&[0u8; 1376], 0);
        // index 10 exceeds len 4: new_len = max(11, 8) = 11
        block.process_symbol(&[0u8; 1376], 10);
        assert!(block.symbols_seen.len() >= 11);
    }
}
