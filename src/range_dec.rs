use std::io::ErrorKind;

use crate::{
    error_invalid_data, ByteReader, Error, Read, Result, BIT_MODEL_TOTAL, BIT_MODEL_TOTAL_BITS,
    MOVE_BITS, SHIFT_BITS, TOP_VALUE,
};

/// Binary range decoder.
///
/// The stream form (`new_stream`) pulls bytes from the inner reader on
/// demand and is used for LZMA1. The buffered form (`new_buffer` +
/// `prepare`) holds one LZMA2 chunk at a time and can tell whether the
/// chunk's compressed bytes were consumed exactly.
#[derive(Debug)]
pub(crate) struct RangeDecoder<R> {
    inner: R,
    range: u32,
    code: u32,
}

impl RangeDecoder<RangeDecoderBuffer> {
    pub(crate) fn new_buffer(len: usize) -> Self {
        Self {
            inner: RangeDecoderBuffer::new(len - 5),
            code: 0,
            range: 0,
        }
    }

    /// Loads the next chunk into the buffer and re-initializes the coder
    /// state. `len` is the chunk's compressed size including the five
    /// initialization bytes.
    pub(crate) fn prepare<R: Read>(&mut self, mut reader: R, len: usize) -> Result<()> {
        if len < 5 {
            return Err(error_invalid_data("compressed chunk shorter than 5 bytes"));
        }

        let b = reader.read_u8()?;
        if b != 0x00 {
            return Err(error_invalid_data("range coder first byte is not zero"));
        }
        self.code = reader.read_u32_be()?;
        self.range = 0xFFFFFFFFu32;

        // The chunk goes into the tail of the buffer so that the buffer end
        // always marks the chunk end.
        let len = len - 5;
        let pos = self.inner.buf.len() - len;
        self.inner.pos = pos;
        reader.read_exact(&mut self.inner.buf[pos..])
    }

    /// True when the chunk's bytes were consumed exactly and the coder
    /// ended in the flushed state.
    #[inline]
    pub(crate) fn is_finished(&self) -> bool {
        self.inner.pos == self.inner.buf.len() && self.code == 0
    }
}

impl<R: Read> RangeDecoder<R> {
    pub(crate) fn new_stream(mut inner: R) -> Result<Self> {
        let b = inner.read_u8()?;
        if b != 0x00 {
            return Err(error_invalid_data("range coder first byte is not zero"));
        }
        let code = inner.read_u32_be()?;
        Ok(Self {
            inner,
            code,
            range: 0xFFFFFFFFu32,
        })
    }

    pub(crate) fn is_stream_finished(&self) -> bool {
        self.code == 0
    }

    pub(crate) fn normalize(&mut self) -> Result<()> {
        if self.range < TOP_VALUE {
            let b = self.inner.read_u8()? as u32;
            self.code = (self.code << SHIFT_BITS) | b;
            self.range <<= SHIFT_BITS;
        }
        Ok(())
    }

    pub(crate) fn decode_bit(&mut self, prob: &mut u16) -> Result<i32> {
        self.normalize()?;
        let bound = (self.range >> BIT_MODEL_TOTAL_BITS) * (*prob as u32);

        if self.code < bound {
            self.range = bound;
            *prob += (BIT_MODEL_TOTAL as u16 - *prob) >> (MOVE_BITS as u16);
            Ok(0)
        } else {
            self.range -= bound;
            self.code -= bound;
            *prob -= *prob >> (MOVE_BITS as u16);
            Ok(1)
        }
    }

    pub(crate) fn decode_bit_tree(&mut self, probs: &mut [u16]) -> Result<i32> {
        let mut symbol = 1;
        loop {
            symbol = (symbol << 1) | self.decode_bit(&mut probs[symbol as usize])?;
            if symbol >= probs.len() as i32 {
                break;
            }
        }
        Ok(symbol - probs.len() as i32)
    }

    pub(crate) fn decode_reverse_bit_tree(&mut self, probs: &mut [u16]) -> Result<i32> {
        let mut symbol = 1;
        let mut i = 0;
        let mut result = 0;
        loop {
            let bit = self.decode_bit(&mut probs[symbol as usize])?;
            symbol = (symbol << 1) | bit;
            result |= bit << i;
            i += 1;
            if symbol >= probs.len() as i32 {
                break;
            }
        }
        Ok(result)
    }

    pub(crate) fn decode_direct_bits(&mut self, count: u32) -> Result<i32> {
        let mut result = 0u32;
        for _ in 0..count {
            self.normalize()?;
            self.range >>= 1;
            let t = (self.code.wrapping_sub(self.range)) >> 31;
            self.code -= self.range & (t.wrapping_sub(1));
            result = (result << 1) | (1u32.wrapping_sub(t));
        }
        Ok(result as _)
    }
}

pub(crate) struct RangeDecoderBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl RangeDecoderBuffer {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            buf: vec![0; len],
            pos: len,
        }
    }
}

impl Read for RangeDecoderBuffer {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos == self.buf.len() {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                "read past the end of the compressed chunk",
            ));
        }
        let len = buf.len().min(self.buf.len() - self.pos);
        buf[..len].copy_from_slice(&self.buf[self.pos..self.pos + len]);
        self.pos += len;
        Ok(len)
    }
}
