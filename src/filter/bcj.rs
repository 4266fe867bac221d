//! Branch/Call/Jump filters for executables of different architectures.
//!
//! A BCJ encoder rewrites relative branch targets into pseudo-absolute
//! addresses so that identical call sites compress well; decoding reverses
//! the rewrite. All filters are in-place buffer transforms that process as
//! many whole instruction words as the buffer holds and report how far they
//! got; the caller carries the unprocessed tail into the next call.

mod arm;
mod ia64;
mod ppc;
mod sparc;
mod x86;

use crate::{copy_error, Error, Read, Result};

pub(crate) struct BcjFilter {
    is_encoder: bool,
    pos: usize,
    prev_mask: u32,
    filter: FilterFn,
}

type FilterFn = fn(filter: &mut BcjFilter, buf: &mut [u8]) -> usize;

impl BcjFilter {
    /// Transforms the leading part of `buf` in place and returns how many
    /// bytes were fully processed.
    #[inline]
    pub(crate) fn code(&mut self, buf: &mut [u8]) -> usize {
        let filter = self.filter;
        filter(self, buf)
    }
}

/// Applies the x86 BCJ decode transform to a complete buffer.
pub fn decode_x86(buf: &mut [u8]) {
    BcjFilter::new_x86(0, false).code(buf);
}

/// Applies the ARM BCJ decode transform to a complete buffer.
pub fn decode_arm(buf: &mut [u8]) {
    BcjFilter::new_arm(0, false).code(buf);
}

/// Applies the ARM Thumb BCJ decode transform to a complete buffer.
pub fn decode_arm_thumb(buf: &mut [u8]) {
    BcjFilter::new_arm_thumb(0, false).code(buf);
}

/// Applies the ARM64 BCJ decode transform to a complete buffer.
pub fn decode_arm64(buf: &mut [u8]) {
    BcjFilter::new_arm64(0, false).code(buf);
}

/// Applies the PowerPC BCJ decode transform to a complete buffer.
pub fn decode_ppc(buf: &mut [u8]) {
    BcjFilter::new_ppc(0, false).code(buf);
}

/// Applies the SPARC BCJ decode transform to a complete buffer.
pub fn decode_sparc(buf: &mut [u8]) {
    BcjFilter::new_sparc(0, false).code(buf);
}

/// Applies the IA-64 BCJ decode transform to a complete buffer.
pub fn decode_ia64(buf: &mut [u8]) {
    BcjFilter::new_ia64(0, false).code(buf);
}

const FILTER_BUF_SIZE: usize = 4096;

/// Streaming BCJ decoder.
///
/// Reads filtered bytes from the inner reader, un-filters them and serves
/// the result. Bytes that do not yet form a complete instruction word stay
/// buffered until more input arrives; at end of input they are passed
/// through unchanged.
pub struct BcjReader<R> {
    inner: R,
    filter: BcjFilter,
    state: FilterState,
    err: Option<Error>,
}

#[derive(Debug, Default)]
struct FilterState {
    filter_buf: Vec<u8>,
    pos: usize,
    filtered: usize,
    unfiltered: usize,
    end_reached: bool,
}

impl<R> BcjReader<R> {
    fn new(inner: R, filter: BcjFilter) -> Self {
        Self {
            inner,
            filter,
            state: FilterState {
                filter_buf: vec![0; FILTER_BUF_SIZE],
                ..Default::default()
            },
            err: None,
        }
    }

    /// Unwraps the reader, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }

    #[inline]
    pub fn new_x86(inner: R, start_pos: usize) -> Self {
        Self::new(inner, BcjFilter::new_x86(start_pos, false))
    }

    #[inline]
    pub fn new_arm(inner: R, start_pos: usize) -> Self {
        Self::new(inner, BcjFilter::new_arm(start_pos, false))
    }

    #[inline]
    pub fn new_arm_thumb(inner: R, start_pos: usize) -> Self {
        Self::new(inner, BcjFilter::new_arm_thumb(start_pos, false))
    }

    #[inline]
    pub fn new_arm64(inner: R, start_pos: usize) -> Self {
        Self::new(inner, BcjFilter::new_arm64(start_pos, false))
    }

    #[inline]
    pub fn new_ppc(inner: R, start_pos: usize) -> Self {
        Self::new(inner, BcjFilter::new_ppc(start_pos, false))
    }

    #[inline]
    pub fn new_sparc(inner: R, start_pos: usize) -> Self {
        Self::new(inner, BcjFilter::new_sparc(start_pos, false))
    }

    #[inline]
    pub fn new_ia64(inner: R, start_pos: usize) -> Self {
        Self::new(inner, BcjFilter::new_ia64(start_pos, false))
    }
}

impl<R: Read> Read for BcjReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(e) = self.err.as_ref() {
            return Err(copy_error(e));
        }
        let mut len = buf.len();
        let mut state = std::mem::take(&mut self.state);
        let mut off = 0;
        let mut size = 0;

        loop {
            // Copy already-filtered data into the caller's buffer.
            if state.filtered > 0 {
                let copy_size = state.filtered.min(len);
                let pos = state.pos;
                buf[off..(off + copy_size)]
                    .copy_from_slice(&state.filter_buf[pos..(pos + copy_size)]);
                state.pos += copy_size;
                state.filtered -= copy_size;
                off += copy_size;
                len -= copy_size;
                size += copy_size;
            }

            // When the window reaches the end of filter_buf, move the
            // pending bytes to the front so the buffer can be refilled.
            if state.pos + state.filtered + state.unfiltered == FILTER_BUF_SIZE {
                state.filter_buf.rotate_left(state.pos);
                state.pos = 0;
            }

            if len == 0 || state.end_reached {
                self.state = state;
                return Ok(size);
            }

            debug_assert_eq!(state.filtered, 0);

            // Pull more data behind the unfiltered remainder.
            let start = state.pos + state.filtered + state.unfiltered;
            let in_size = match self.inner.read(&mut state.filter_buf[start..]) {
                Ok(size) => size,
                Err(e) => {
                    self.err = Some(copy_error(&e));
                    self.state = state;
                    return Err(e);
                }
            };

            if in_size == 0 {
                // End of input: whatever is left can never form a complete
                // instruction word and is passed through unchanged.
                state.end_reached = true;
                state.filtered = state.unfiltered;
                state.unfiltered = 0;
            } else {
                state.unfiltered += in_size;
                state.filtered = self
                    .filter
                    .code(&mut state.filter_buf[state.pos..(state.pos + state.unfiltered)]);
                debug_assert!(state.filtered <= state.unfiltered);
                state.unfiltered -= state.filtered;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    /// Deterministic noise, avoiding values that look like branch opcodes so
    /// planted instruction sites stay isolated.
    fn synth(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed;
        (0..len)
            .map(|_| {
                x = x.wrapping_mul(1664525).wrapping_add(1013904223);
                let b = (x >> 24) as u8;
                if b == 0xE8 || b == 0xE9 || b == 0xEB {
                    0x55
                } else {
                    b
                }
            })
            .collect()
    }

    fn chunked_decode(encoded: &[u8], mut reader: BcjReader<&[u8]>, chunk: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(encoded.len());
        let mut buf = vec![0u8; chunk];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn round_trip<M>(
        data: &[u8],
        encode: fn(usize, bool) -> BcjFilter,
        make_reader: M,
        one_shot: fn(&mut [u8]),
    ) where
        M: for<'a> Fn(&'a [u8], usize) -> BcjReader<&'a [u8]>,
    {
        let mut encoded = data.to_vec();
        encode(0, true).code(&mut encoded);
        assert_ne!(&encoded[..], data, "filter did not convert anything");

        // Streaming decode in deliberately awkward chunk sizes.
        for chunk in [1usize, 7, 64, 4096] {
            let reader = make_reader(&encoded, 0);
            assert_eq!(chunked_decode(&encoded, reader, chunk), data);
        }

        // One-shot decode.
        let mut decoded = encoded.clone();
        one_shot(&mut decoded);
        assert_eq!(&decoded[..], data);
    }

    #[test]
    fn x86_round_trip() {
        let mut data = synth(4096 * 3 + 3, 7);
        // Plant CALL/JMP sites with small displacements (high byte 0x00).
        for i in (0..data.len() - 16).step_by(64) {
            data[i] = if i % 128 == 0 { 0xE8 } else { 0xE9 };
            data[i + 4] = 0x00;
        }
        round_trip(
            &data,
            BcjFilter::new_x86,
            |inner, start| BcjReader::new_x86(inner, start),
            decode_x86,
        );
    }

    #[test]
    fn x86_converts_known_call() {
        // CALL with displacement 0x10 at offset 0: the encoder rewrites the
        // displacement to 0x10 + 0 + 5.
        let mut buf = vec![0xE8, 0x10, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90, 0x90, 0x90];
        BcjFilter::new_x86(0, true).code(&mut buf);
        assert_eq!(&buf[..5], &[0xE8, 0x15, 0x00, 0x00, 0x00]);
        decode_x86(&mut buf);
        assert_eq!(&buf[..5], &[0xE8, 0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn x86_dense_call_sites_one_shot() {
        // Adjacent candidates exercise the false-positive mask.
        let mut data = synth(512, 11);
        for i in (0..data.len() - 10).step_by(3) {
            data[i] = 0xE8;
        }
        let mut encoded = data.clone();
        BcjFilter::new_x86(0, true).code(&mut encoded);
        let mut decoded = encoded.clone();
        decode_x86(&mut decoded);
        assert_eq!(decoded, data);
    }

    #[test]
    fn arm_round_trip() {
        let mut data = synth(4096 + 32, 13);
        for i in (0..data.len() - 4).step_by(16) {
            data[i + 3] = 0xEB;
        }
        round_trip(
            &data,
            BcjFilter::new_arm,
            |inner, start| BcjReader::new_arm(inner, start),
            decode_arm,
        );
    }

    #[test]
    fn arm_thumb_round_trip() {
        let mut data = synth(4096 + 18, 17);
        for i in (0..data.len() - 4).step_by(26) {
            data[i + 1] = 0xF3;
            data[i + 3] = 0xFB;
        }
        round_trip(
            &data,
            BcjFilter::new_arm_thumb,
            |inner, start| BcjReader::new_arm_thumb(inner, start),
            decode_arm_thumb,
        );
    }

    #[test]
    fn arm64_round_trip() {
        let mut data = synth(4096 + 64, 19);
        for i in (0..data.len() - 4).step_by(32) {
            // BL with a small positive offset.
            data[i + 3] = 0x94;
            data[i + 2] = 0x00;
        }
        round_trip(
            &data,
            BcjFilter::new_arm64,
            |inner, start| BcjReader::new_arm64(inner, start),
            decode_arm64,
        );
    }

    #[test]
    fn ppc_round_trip() {
        let mut data = synth(4096 + 8, 23);
        for i in (0..data.len() - 4).step_by(20) {
            data[i] = 0x48;
            data[i + 3] = (data[i + 3] & 0xFC) | 1;
        }
        round_trip(
            &data,
            BcjFilter::new_ppc,
            |inner, start| BcjReader::new_ppc(inner, start),
            decode_ppc,
        );
    }

    #[test]
    fn sparc_round_trip() {
        let mut data = synth(4096 + 12, 29);
        for i in (0..data.len() - 4).step_by(24) {
            data[i] = 0x40;
            data[i + 1] &= 0x3F;
        }
        round_trip(
            &data,
            BcjFilter::new_sparc,
            |inner, start| BcjReader::new_sparc(inner, start),
            decode_sparc,
        );
    }

    #[test]
    fn ia64_round_trip() {
        let mut data = synth(4096 + 48, 31);
        for i in (0..data.len() - 16).step_by(64) {
            // Template 0x16 marks all three slots as branch slots. Shape
            // slot 0 into a relative branch: opcode 5 in instruction bits
            // 37..40 (bundle bits 42..45) and zeros in instruction bits
            // 9..11 (bundle bits 14..16). The immediate stays random.
            data[i] = 0x16;
            data[i + 1] &= 0x3F;
            data[i + 2] &= 0xFE;
            data[i + 5] = (data[i + 5] & 0xC3) | 0x14;
        }
        round_trip(
            &data,
            BcjFilter::new_ia64,
            |inner, start| BcjReader::new_ia64(inner, start),
            decode_ia64,
        );
    }

    #[test]
    fn tail_shorter_than_instruction_passes_through() {
        let data = [0xE8u8, 0x01, 0x02];
        let mut reader = BcjReader::new_x86(&data[..], 0);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(&out[..], &data[..]);
    }
}
