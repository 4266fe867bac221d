//! Streaming decoder for the XZ container format and its LZMA / LZMA2
//! payloads, including the BCJ branch-conversion filters (x86, ARM,
//! ARM Thumb, ARM64, PowerPC, SPARC, IA-64) and the Delta filter.
//!
//! This crate only decompresses. The main entry points are:
//!
//! - [`XzReader`] / [`decode_xz`] for complete `.xz` files, including
//!   multi-block and concatenated multi-stream inputs.
//! - [`XzStreamDecoder`] when the input arrives in chunks that are pushed
//!   into the decoder instead of being pulled through [`Read`].
//! - [`Lzma2Reader`] / [`decode_lzma2`] for raw LZMA2 chunk streams.
//! - [`LzmaReader`] / [`decode_lzma`] for `.lzma` files and raw LZMA1.
//! - [`filter`] for using the BCJ and Delta filters on their own.
//!
//! All decoders are plain [`std::io::Read`] adapters and process their input
//! incrementally with memory bounded by the declared dictionary size.
//!
//! The probability model layout and the decoder state machine follow the
//! tukaani "XZ for Java" lineage.

mod decoder;
mod lz;
mod lzma2_reader;
mod lzma_reader;
mod range_dec;
mod state;
mod xz;

pub mod filter;

pub(crate) use std::io::{Error, Read};

pub use lzma2_reader::{get_memory_usage as lzma2_get_memory_usage, Lzma2Reader};
pub use lzma_reader::{
    get_memory_usage as lzma_get_memory_usage,
    get_memory_usage_by_props as lzma_get_memory_usage_by_props, LzmaReader,
};
use state::*;
pub use xz::{CheckType, XzReader, XzStreamDecoder};

/// Result type of the crate.
pub type Result<T> = std::io::Result<T>;

/// The minimal size of a dictionary.
pub const DICT_SIZE_MIN: u32 = 4096;

/// The maximal size of a dictionary.
pub const DICT_SIZE_MAX: u32 = u32::MAX & !15_u32;

/// Largest dictionary the XZ and LZMA2 entry points are willing to allocate.
///
/// LZMA2 can declare dictionaries up to 4 GiB; anything above this limit is
/// rejected with an out-of-memory error instead of being allocated.
pub const DICT_SIZE_LIMIT: u32 = 1 << 30;

const LOW_SYMBOLS: usize = 1 << 3;
const MID_SYMBOLS: usize = 1 << 3;
const HIGH_SYMBOLS: usize = 1 << 8;

const POS_STATES_MAX: usize = 1 << 4;
const MATCH_LEN_MIN: usize = 2;

const DIST_STATES: usize = 4;
const DIST_SLOTS: usize = 1 << 6;
const DIST_MODEL_START: usize = 4;
const DIST_MODEL_END: usize = 14;

const ALIGN_BITS: usize = 4;
const ALIGN_SIZE: usize = 1 << ALIGN_BITS;

const REPS: usize = 4;

const SHIFT_BITS: u32 = 8;
const TOP_VALUE: u32 = 0x0100_0000;
const BIT_MODEL_TOTAL_BITS: u32 = 11;
const BIT_MODEL_TOTAL: u32 = 1 << BIT_MODEL_TOTAL_BITS;
const PROB_INIT: u16 = (BIT_MODEL_TOTAL / 2) as u16;
const MOVE_BITS: u32 = 5;
const DIST_SPECIAL_INDEX: [usize; 10] = [0, 2, 4, 8, 12, 20, 28, 44, 60, 92];
const DIST_SPECIAL_END: [usize; 10] = [2, 4, 8, 12, 20, 28, 44, 60, 92, 124];

#[derive(Debug)]
pub(crate) struct LzmaCoder {
    pub(crate) pos_mask: u32,
    pub(crate) reps: [i32; REPS],
    pub(crate) state: State,
    pub(crate) is_match: [[u16; POS_STATES_MAX]; STATES],
    pub(crate) is_rep: [u16; STATES],
    pub(crate) is_rep0: [u16; STATES],
    pub(crate) is_rep1: [u16; STATES],
    pub(crate) is_rep2: [u16; STATES],
    pub(crate) is_rep0_long: [[u16; POS_STATES_MAX]; STATES],
    pub(crate) dist_slots: [[u16; DIST_SLOTS]; DIST_STATES],
    dist_special: [u16; 124],
    dist_align: [u16; ALIGN_SIZE],
}

pub(crate) fn get_dist_state(len: u32) -> u32 {
    (if (len as usize) < DIST_STATES + MATCH_LEN_MIN {
        len as usize - MATCH_LEN_MIN
    } else {
        DIST_STATES - 1
    }) as u32
}

impl LzmaCoder {
    pub(crate) fn new(pb: usize) -> Self {
        let mut c = Self {
            pos_mask: (1 << pb) - 1,
            reps: Default::default(),
            state: Default::default(),
            is_match: Default::default(),
            is_rep: Default::default(),
            is_rep0: Default::default(),
            is_rep1: Default::default(),
            is_rep2: Default::default(),
            is_rep0_long: Default::default(),
            dist_slots: [[Default::default(); DIST_SLOTS]; DIST_STATES],
            dist_special: [Default::default(); 124],
            dist_align: Default::default(),
        };
        c.reset();
        c
    }

    pub(crate) fn reset(&mut self) {
        self.reps = [0; REPS];
        self.state.reset();
        for ele in self.is_match.iter_mut() {
            init_probs(ele);
        }
        init_probs(&mut self.is_rep);
        init_probs(&mut self.is_rep0);
        init_probs(&mut self.is_rep1);
        init_probs(&mut self.is_rep2);

        for ele in self.is_rep0_long.iter_mut() {
            init_probs(ele);
        }
        for ele in self.dist_slots.iter_mut() {
            init_probs(ele);
        }
        init_probs(&mut self.dist_special);
        init_probs(&mut self.dist_align);
    }

    #[inline(always)]
    pub(crate) fn get_dist_special(&mut self, i: usize) -> &mut [u16] {
        &mut self.dist_special[DIST_SPECIAL_INDEX[i]..DIST_SPECIAL_END[i]]
    }

    #[inline(always)]
    pub(crate) fn dist_align(&mut self) -> &mut [u16] {
        &mut self.dist_align
    }
}

#[inline(always)]
pub(crate) fn init_probs(probs: &mut [u16]) {
    probs.fill(PROB_INIT);
}

#[derive(Debug)]
pub(crate) struct LiteralCoder {
    lc: u32,
    literal_pos_mask: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LiteralSubCoder {
    pub(crate) probs: [u16; 0x300],
}

impl LiteralSubCoder {
    pub(crate) fn new() -> Self {
        let probs = [PROB_INIT; 0x300];
        Self { probs }
    }

    pub(crate) fn reset(&mut self) {
        self.probs = [PROB_INIT; 0x300];
    }
}

impl LiteralCoder {
    pub(crate) fn new(lc: u32, lp: u32) -> Self {
        Self {
            lc,
            literal_pos_mask: (1 << lp) - 1,
        }
    }

    pub(crate) fn get_sub_coder_index(&self, prev_byte: u32, pos: u32) -> u32 {
        let low = prev_byte >> (8 - self.lc);
        let high = (pos & self.literal_pos_mask) << self.lc;
        low + high
    }
}

#[derive(Debug)]
pub(crate) struct LengthCoder {
    pub(crate) choice: [u16; 2],
    pub(crate) low: [[u16; LOW_SYMBOLS]; POS_STATES_MAX],
    pub(crate) mid: [[u16; MID_SYMBOLS]; POS_STATES_MAX],
    pub(crate) high: [u16; HIGH_SYMBOLS],
}

impl LengthCoder {
    pub(crate) fn new() -> Self {
        Self {
            choice: Default::default(),
            low: Default::default(),
            mid: Default::default(),
            high: [0; HIGH_SYMBOLS],
        }
    }

    pub(crate) fn reset(&mut self) {
        init_probs(&mut self.choice);
        for ele in self.low.iter_mut() {
            init_probs(ele);
        }
        for ele in self.mid.iter_mut() {
            init_probs(ele);
        }
        init_probs(&mut self.high);
    }
}

pub(crate) trait ByteReader {
    fn read_u8(&mut self) -> Result<u8>;

    fn read_u16_be(&mut self) -> Result<u16>;

    fn read_u32(&mut self) -> Result<u32>;

    fn read_u32_be(&mut self) -> Result<u32>;

    fn read_u64(&mut self) -> Result<u64>;
}

impl<T: Read> ByteReader for T {
    #[inline(always)]
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    #[inline(always)]
    fn read_u16_be(&mut self) -> Result<u16> {
        let mut buf = [0; 2];
        self.read_exact(buf.as_mut())?;
        Ok(u16::from_be_bytes(buf))
    }

    #[inline(always)]
    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0; 4];
        self.read_exact(buf.as_mut())?;
        Ok(u32::from_le_bytes(buf))
    }

    #[inline(always)]
    fn read_u32_be(&mut self) -> Result<u32> {
        let mut buf = [0; 4];
        self.read_exact(buf.as_mut())?;
        Ok(u32::from_be_bytes(buf))
    }

    #[inline(always)]
    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0; 8];
        self.read_exact(buf.as_mut())?;
        Ok(u64::from_le_bytes(buf))
    }
}

#[inline(always)]
fn error_invalid_input(msg: &'static str) -> Error {
    Error::new(std::io::ErrorKind::InvalidInput, msg)
}

#[inline(always)]
fn error_invalid_data(msg: &'static str) -> Error {
    Error::new(std::io::ErrorKind::InvalidData, msg)
}

#[inline(always)]
fn error_out_of_memory(msg: &'static str) -> Error {
    Error::new(std::io::ErrorKind::OutOfMemory, msg)
}

#[inline(always)]
fn error_unsupported(msg: &'static str) -> Error {
    Error::new(std::io::ErrorKind::Unsupported, msg)
}

#[inline(always)]
fn copy_error(error: &Error) -> Error {
    Error::new(error.kind(), error.to_string())
}

/// Decodes a complete XZ file held in memory.
///
/// Accepts multi-block streams and any number of concatenated streams
/// separated by 4-byte-aligned zero padding. The decoded payloads are
/// returned as one contiguous buffer.
pub fn decode_xz(data: &[u8]) -> Result<Vec<u8>> {
    let mut reader = XzReader::new(data);
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Decodes a raw LZMA1 stream described by the classic 5-byte properties
/// (one `lc/lp/pb` byte followed by the little-endian dictionary size).
///
/// `uncomp_size` is the exact number of bytes to produce; pass `u64::MAX`
/// when the stream is terminated by an end marker instead.
pub fn decode_lzma(data: &[u8], props: &[u8; 5], uncomp_size: u64) -> Result<Vec<u8>> {
    let dict_size = u32::from_le_bytes([props[1], props[2], props[3], props[4]]);
    let mut reader = LzmaReader::new_with_props(data, uncomp_size, props[0], dict_size, None)?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    if uncomp_size != u64::MAX && out.len() as u64 != uncomp_size {
        return Err(error_invalid_data("decoded size differs from declared size"));
    }
    Ok(out)
}

/// Decodes a raw LZMA2 chunk stream. `dict_prop` is the one-byte dictionary
/// size encoding from the XZ filter properties.
///
/// When `uncomp_size` is given, the decoded length is checked against it.
pub fn decode_lzma2(data: &[u8], dict_prop: u8, uncomp_size: Option<u64>) -> Result<Vec<u8>> {
    let dict_size = lzma2_reader::dict_size_from_prop(dict_prop)?;
    if dict_size > DICT_SIZE_LIMIT {
        return Err(error_out_of_memory("dictionary size exceeds the 1 GiB limit"));
    }
    let mut reader = Lzma2Reader::new(data, dict_size, None);
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    if let Some(expected) = uncomp_size {
        if out.len() as u64 != expected {
            return Err(error_invalid_data("decoded size differs from declared size"));
        }
    }
    Ok(out)
}
