//! LZMA2 chunk-framing tests with genuinely range-coded payloads.
//!
//! The test encoder below produces real LZMA chunks restricted to literals,
//! short matches (distance 1..=4, length 2..=9), rep0 matches and short
//! reps, with the fixed properties lc=3 lp=0 pb=2. That is enough to drive
//! every decoder path that matters here: both literal coders, the length
//! and distance trees, the rep machinery, chunk resets and solid chunks,
//! and the exact compressed-size accounting.

use std::io::Read;

use xzdec::{decode_lzma2, Lzma2Reader, DICT_SIZE_MIN};

const PROB_INIT: u16 = 1024;
const STATES: usize = 12;
const POS_STATES: usize = 4;
const PROPS_BYTE: u8 = 93; // lc = 3, lp = 0, pb = 2

struct RangeEncoder {
    low: u64,
    range: u32,
    cache_size: u32,
    cache: u8,
    out: Vec<u8>,
}

impl RangeEncoder {
    fn new() -> Self {
        Self {
            low: 0,
            range: 0xFFFFFFFF,
            cache_size: 1,
            cache: 0,
            out: Vec::new(),
        }
    }

    fn shift_low(&mut self) {
        let low_hi = (self.low >> 32) as i32;
        if low_hi != 0 || self.low < 0xFF00_0000u64 {
            let mut temp = self.cache;
            loop {
                self.out.push((temp as i32 + low_hi) as u8);
                temp = 0xFF;
                self.cache_size -= 1;
                if self.cache_size == 0 {
                    break;
                }
            }
            self.cache = (self.low >> 24) as u8;
        }
        self.cache_size += 1;
        self.low = (self.low & 0x00FF_FFFF) << 8;
    }

    fn encode_bit(&mut self, prob: &mut u16, bit: u32) {
        let bound = (self.range >> 11) * (*prob as u32);
        if bit == 0 {
            self.range = bound;
            *prob += (2048 - *prob) >> 5;
        } else {
            self.low += bound as u64;
            self.range -= bound;
            *prob -= *prob >> 5;
        }
        if self.range & 0xFF00_0000 == 0 {
            self.range <<= 8;
            self.shift_low();
        }
    }

    fn encode_bit_tree(&mut self, probs: &mut [u16], symbol: u32) {
        let mut index = 1usize;
        let mut mask = probs.len() as u32;
        loop {
            mask >>= 1;
            let bit = symbol & mask;
            self.encode_bit(&mut probs[index], u32::from(bit != 0));
            index <<= 1;
            if bit != 0 {
                index |= 1;
            }
            if mask == 1 {
                break;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        for _ in 0..5 {
            self.shift_low();
        }
        self.out
    }
}

struct Model {
    literal: Vec<[u16; 0x300]>,
    is_match: [[u16; POS_STATES]; STATES],
    is_rep: [u16; STATES],
    is_rep0: [u16; STATES],
    is_rep0_long: [[u16; POS_STATES]; STATES],
    match_len_choice: [u16; 2],
    match_len_low: [[u16; 8]; POS_STATES],
    rep_len_choice: [u16; 2],
    rep_len_low: [[u16; 8]; POS_STATES],
    dist_slots: [[u16; 64]; 4],
    state: usize,
    rep0: u32,
}

impl Model {
    fn new() -> Self {
        Self {
            literal: vec![[PROB_INIT; 0x300]; 8],
            is_match: [[PROB_INIT; POS_STATES]; STATES],
            is_rep: [PROB_INIT; STATES],
            is_rep0: [PROB_INIT; STATES],
            is_rep0_long: [[PROB_INIT; POS_STATES]; STATES],
            match_len_choice: [PROB_INIT; 2],
            match_len_low: [[PROB_INIT; 8]; POS_STATES],
            rep_len_choice: [PROB_INIT; 2],
            rep_len_low: [[PROB_INIT; 8]; POS_STATES],
            dist_slots: [[PROB_INIT; 64]; 4],
            state: 0,
            rep0: 0,
        }
    }
}

#[derive(Clone, Copy)]
enum Op {
    Lit(u8),
    Match { dist: u32, len: u32 },
    Rep { len: u32 },
    ShortRep,
}

#[derive(Clone, Copy, PartialEq)]
enum Reset {
    Dict,
    StateProps,
    State,
    Solid,
}

/// Builds LZMA2 chunk sequences while mirroring the decoder's dictionary in
/// `shadow`, which doubles as the expected output.
struct TestEncoder {
    model: Model,
    shadow: Vec<u8>,
}

impl TestEncoder {
    fn new() -> Self {
        Self {
            model: Model::new(),
            shadow: Vec::new(),
        }
    }

    fn lzma_chunk(&mut self, reset: Reset, ops: &[Op]) -> Vec<u8> {
        let control_base = match reset {
            Reset::Dict => {
                self.model = Model::new();
                self.shadow.clear();
                0xE0
            }
            Reset::StateProps => {
                self.model = Model::new();
                0xC0
            }
            Reset::State => {
                self.model = Model::new();
                0xA0
            }
            Reset::Solid => 0x80,
        };

        let start = self.shadow.len();
        let mut rc = RangeEncoder::new();
        for op in ops {
            self.encode_op(&mut rc, *op);
        }
        let compressed = rc.finish();

        let uncomp = self.shadow.len() - start;
        assert!(uncomp > 0 && uncomp <= 1 << 21);
        assert!(compressed.len() <= 1 << 16);

        let size_bits = (uncomp - 1) as u32;
        let mut chunk = vec![control_base | (size_bits >> 16) as u8];
        chunk.extend_from_slice(&(size_bits as u16).to_be_bytes());
        chunk.extend_from_slice(&((compressed.len() - 1) as u16).to_be_bytes());
        if matches!(reset, Reset::Dict | Reset::StateProps) {
            chunk.push(PROPS_BYTE);
        }
        chunk.extend_from_slice(&compressed);
        chunk
    }

    fn uncompressed_chunk(&mut self, reset_dict: bool, data: &[u8]) -> Vec<u8> {
        if reset_dict {
            self.shadow.clear();
        }
        self.shadow.extend_from_slice(data);
        let mut chunk = vec![if reset_dict { 0x01 } else { 0x02 }];
        chunk.extend_from_slice(&((data.len() - 1) as u16).to_be_bytes());
        chunk.extend_from_slice(data);
        chunk
    }

    fn encode_op(&mut self, rc: &mut RangeEncoder, op: Op) {
        let pos_state = self.shadow.len() & 3;
        let state = self.model.state;
        match op {
            Op::Lit(byte) => {
                rc.encode_bit(&mut self.model.is_match[state][pos_state], 0);
                self.encode_literal(rc, byte);
            }
            Op::Match { dist, len } => {
                assert!((1..=4).contains(&dist) && (2..=9).contains(&len));
                rc.encode_bit(&mut self.model.is_match[state][pos_state], 1);
                rc.encode_bit(&mut self.model.is_rep[state], 0);
                rc.encode_bit(&mut self.model.match_len_choice[0], 0);
                rc.encode_bit_tree(&mut self.model.match_len_low[pos_state], len - 2);
                self.model.rep0 = dist - 1;
                let dist_state = (len as usize - 2).min(3);
                rc.encode_bit_tree(&mut self.model.dist_slots[dist_state], self.model.rep0);
                self.model.state = if state < 7 { 7 } else { 10 };
                self.copy_match(len as usize);
            }
            Op::Rep { len } => {
                assert!((2..=9).contains(&len));
                rc.encode_bit(&mut self.model.is_match[state][pos_state], 1);
                rc.encode_bit(&mut self.model.is_rep[state], 1);
                rc.encode_bit(&mut self.model.is_rep0[state], 0);
                rc.encode_bit(&mut self.model.is_rep0_long[state][pos_state], 1);
                rc.encode_bit(&mut self.model.rep_len_choice[0], 0);
                rc.encode_bit_tree(&mut self.model.rep_len_low[pos_state], len - 2);
                self.model.state = if state < 7 { 8 } else { 11 };
                self.copy_match(len as usize);
            }
            Op::ShortRep => {
                rc.encode_bit(&mut self.model.is_match[state][pos_state], 1);
                rc.encode_bit(&mut self.model.is_rep[state], 1);
                rc.encode_bit(&mut self.model.is_rep0[state], 0);
                rc.encode_bit(&mut self.model.is_rep0_long[state][pos_state], 0);
                self.model.state = if state < 7 { 9 } else { 11 };
                self.copy_match(1);
            }
        }
    }

    fn encode_literal(&mut self, rc: &mut RangeEncoder, byte: u8) {
        let prev = self.shadow.last().copied().unwrap_or(0);
        let probs = &mut self.model.literal[(prev >> 5) as usize];

        if self.model.state < 7 {
            let mut symbol = 1usize;
            for i in (0..8).rev() {
                let bit = u32::from((byte >> i) & 1);
                rc.encode_bit(&mut probs[symbol], bit);
                symbol = (symbol << 1) | bit as usize;
            }
        } else {
            let dist = self.model.rep0 as usize;
            let mut match_byte = self.shadow[self.shadow.len() - dist - 1] as u32;
            let mut offset = 0x100u32;
            let mut symbol = 1u32;
            for i in (0..8).rev() {
                match_byte <<= 1;
                let match_bit = match_byte & offset;
                let bit = u32::from((byte >> i) & 1);
                rc.encode_bit(&mut probs[(offset + match_bit + symbol) as usize], bit);
                symbol = (symbol << 1) | bit;
                offset &= 0u32.wrapping_sub(bit) ^ !match_bit;
            }
        }

        self.model.state = match self.model.state {
            0..=3 => 0,
            4..=9 => self.model.state - 3,
            other => other - 6,
        };
        self.shadow.push(byte);
    }

    fn copy_match(&mut self, len: usize) {
        let dist = self.model.rep0 as usize;
        for _ in 0..len {
            let byte = self.shadow[self.shadow.len() - dist - 1];
            self.shadow.push(byte);
        }
    }
}

fn lits(data: &[u8]) -> Vec<Op> {
    data.iter().map(|&byte| Op::Lit(byte)).collect()
}

fn decode(stream: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut reader = Lzma2Reader::new(stream, DICT_SIZE_MIN, None);
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

#[test]
fn literal_only_chunk() {
    let mut enc = TestEncoder::new();
    let mut stream = enc.lzma_chunk(
        Reset::Dict,
        &lits(b"the quick brown fox jumps over the lazy dog"),
    );
    stream.push(0x00);
    assert_eq!(decode(&stream).unwrap(), enc.shadow);
}

#[test]
fn literal_probabilities_adapt() {
    // A few hundred skewed bytes force repeated renormalization and real
    // probability movement in both coders.
    let payload: Vec<u8> = (0..600u32)
        .map(|i| match i % 7 {
            0 | 1 | 2 => b'a',
            3 | 4 => b'b',
            _ => (i * 13 % 251) as u8,
        })
        .collect();

    let mut enc = TestEncoder::new();
    let mut stream = enc.lzma_chunk(Reset::Dict, &lits(&payload));
    stream.push(0x00);
    assert_eq!(decode(&stream).unwrap(), payload);
}

#[test]
fn matches_reps_and_matched_literals() {
    let mut ops = lits(b"abc");
    ops.push(Op::Match { dist: 3, len: 6 });
    ops.push(Op::Lit(b'x')); // decoded through the matched-literal coder
    ops.push(Op::Rep { len: 4 });
    ops.push(Op::ShortRep);
    ops.push(Op::Lit(b'z'));
    ops.push(Op::Match { dist: 1, len: 9 });
    ops.extend(lits(b"tail"));

    let mut enc = TestEncoder::new();
    let mut stream = enc.lzma_chunk(Reset::Dict, &ops);
    stream.push(0x00);
    let expected = enc.shadow.clone();
    assert_eq!(decode(&stream).unwrap(), expected);
}

#[test]
fn solid_chunk_preserves_probabilities_and_dictionary() {
    let mut enc = TestEncoder::new();
    let mut stream = enc.lzma_chunk(Reset::Dict, &lits(b"solid state "));

    let mut ops = lits(b"more ");
    // References "solid state " from the previous chunk.
    ops.push(Op::Match { dist: 4, len: 4 });
    stream.extend(enc.lzma_chunk(Reset::Solid, &ops));
    stream.push(0x00);

    let expected = enc.shadow.clone();
    assert_eq!(decode(&stream).unwrap(), expected);
}

#[test]
fn state_reset_keeps_dictionary() {
    let mut enc = TestEncoder::new();
    let mut stream = enc.lzma_chunk(Reset::Dict, &lits(b"abcd"));

    let mut ops = vec![Op::Match { dist: 4, len: 4 }];
    ops.extend(lits(b"!"));
    stream.extend(enc.lzma_chunk(Reset::State, &ops));
    stream.push(0x00);

    let expected = enc.shadow.clone();
    assert_eq!(decode(&stream).unwrap(), b"abcdabcd!");
    assert_eq!(expected, b"abcdabcd!");
}

#[test]
fn dict_reset_between_chunks() {
    let mut enc = TestEncoder::new();
    let mut stream = enc.lzma_chunk(Reset::Dict, &lits(b"first"));
    stream.extend(enc.lzma_chunk(Reset::Dict, &lits(b"second")));
    stream.push(0x00);

    assert_eq!(decode(&stream).unwrap(), b"firstsecond");
}

#[test]
fn uncompressed_chunk_feeds_the_dictionary() {
    let mut enc = TestEncoder::new();
    let mut stream = enc.uncompressed_chunk(true, b"raw bytes ");

    let mut ops = vec![Op::Match { dist: 4, len: 4 }];
    ops.extend(lits(b"end"));
    stream.extend(enc.lzma_chunk(Reset::StateProps, &ops));
    stream.push(0x00);

    let expected = enc.shadow.clone();
    assert_eq!(decode(&stream).unwrap(), expected);
    assert_eq!(&expected[..10], b"raw bytes ");
}

#[test]
fn mixed_uncompressed_chunk_in_the_middle() {
    let mut enc = TestEncoder::new();
    let mut stream = enc.lzma_chunk(Reset::Dict, &lits(b"head/"));
    stream.extend(enc.uncompressed_chunk(false, b"middle/"));
    stream.extend(enc.lzma_chunk(Reset::StateProps, &lits(b"tail")));
    stream.push(0x00);

    assert_eq!(decode(&stream).unwrap(), b"head/middle/tail");
}

#[test]
fn small_read_buffers_match_read_to_end() {
    let mut ops = lits(b"chunked reading ");
    ops.push(Op::Match { dist: 4, len: 8 });
    ops.extend(lits(b"end"));

    let mut enc = TestEncoder::new();
    let mut stream = enc.lzma_chunk(Reset::Dict, &ops);
    stream.push(0x00);
    let expected = enc.shadow.clone();

    let mut reader = Lzma2Reader::new(stream.as_slice(), DICT_SIZE_MIN, None);
    let mut out = Vec::new();
    let mut buf = [0u8; 3];
    loop {
        let n = reader.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert_eq!(out, expected);
}

#[test]
fn first_chunk_must_reset_dictionary() {
    let mut enc = TestEncoder::new();
    let mut stream = enc.lzma_chunk(Reset::State, &lits(b"x"));
    stream.push(0x00);
    let err = decode(&stream).unwrap_err();
    assert!(err.to_string().contains("reset"));

    let mut enc = TestEncoder::new();
    let mut stream = enc.uncompressed_chunk(false, b"x");
    stream.push(0x00);
    assert!(decode(&stream).is_err());
}

#[test]
fn preset_dictionary_lifts_the_reset_requirement() {
    let preset = b"preset dictionary contents";
    let mut enc = TestEncoder::new();
    enc.shadow.extend_from_slice(preset);

    let mut ops = vec![Op::Match { dist: 1, len: 2 }];
    ops.extend(lits(b"+tail"));
    let mut stream = enc.lzma_chunk(Reset::StateProps, &ops);
    stream.push(0x00);

    let mut reader = Lzma2Reader::new(stream.as_slice(), DICT_SIZE_MIN, Some(preset));
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    assert_eq!(out, enc.shadow[preset.len()..]);
}

#[test]
fn lzma_chunk_without_properties_is_rejected() {
    let mut enc = TestEncoder::new();
    let mut stream = enc.uncompressed_chunk(true, b"ab");
    stream.extend(enc.lzma_chunk(Reset::Solid, &lits(b"cd")));
    stream.push(0x00);
    let err = decode(&stream).unwrap_err();
    assert!(err.to_string().contains("propert"));
}

#[test]
fn reserved_control_bytes_are_rejected() {
    for control in [0x03u8, 0x10, 0x7F] {
        let err = decode(&[control]).unwrap_err();
        assert!(err.to_string().contains("control byte"), "{control:#x}");
    }
}

#[test]
fn invalid_properties_byte_is_rejected() {
    // lc = 4, lp = 1 violates lc + lp <= 4.
    let props = 1 * 9 + 4;
    let stream = [0xE0, 0x00, 0x00, 0x00, 0x04, props, 0, 0, 0, 0, 0, 0x00];
    assert!(decode(&stream).is_err());
}

#[test]
fn compressed_size_must_be_consumed_exactly() {
    let mut enc = TestEncoder::new();
    let mut stream = enc.lzma_chunk(Reset::Dict, &lits(b"exact"));

    // Inflate the declared compressed size by one: the decoder now owns one
    // byte it will never consume.
    let comp = u16::from_be_bytes([stream[3], stream[4]]);
    let fixed = (comp + 1).to_be_bytes();
    stream[3] = fixed[0];
    stream[4] = fixed[1];
    stream.push(0x00); // swallowed as the phantom compressed byte
    stream.push(0x00); // terminator

    let err = decode(&stream).unwrap_err();
    assert!(err.to_string().contains("consumed"));
}

#[test]
fn truncated_chunk_fails() {
    let mut enc = TestEncoder::new();
    let stream = enc.lzma_chunk(Reset::Dict, &lits(b"whole chunk"));
    for cut in [1, 3, 5, stream.len() - 2] {
        assert!(decode(&stream[..cut]).is_err(), "cut at {cut} must fail");
    }
}

#[test]
fn one_shot_decode_checks_the_declared_size() {
    let mut enc = TestEncoder::new();
    let mut stream = enc.lzma_chunk(Reset::Dict, &lits(b"sized"));
    stream.push(0x00);

    assert_eq!(decode_lzma2(&stream, 0, Some(5)).unwrap(), b"sized");
    assert_eq!(decode_lzma2(&stream, 0, None).unwrap(), b"sized");
    assert!(decode_lzma2(&stream, 0, Some(6)).is_err());
    assert!(decode_lzma2(&stream, 41, None).is_err());
}
