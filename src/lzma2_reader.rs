use crate::{
    copy_error, decoder::LzmaDecoder, error_invalid_data, error_invalid_input, lz::LzDecoder,
    range_dec::{RangeDecoder, RangeDecoderBuffer},
    ByteReader, Error, Read, Result,
};

/// Upper bound of an LZMA2 chunk's compressed size.
pub const COMPRESSED_SIZE_MAX: u32 = 1 << 16;

/// Calculates the memory usage in KiB required for LZMA2 decompression.
#[inline]
pub fn get_memory_usage(dict_size: u32) -> u32 {
    40 + COMPRESSED_SIZE_MAX / 1024 + get_dict_size(dict_size) / 1024
}

#[inline]
fn get_dict_size(dict_size: u32) -> u32 {
    // Rounded up so the cyclic buffer stays congruent with the position
    // contexts; clamping first keeps the 4 GiB - 1 encoding from wrapping.
    (dict_size.min(crate::DICT_SIZE_MAX) + 15) & !15
}

/// Decodes the one-byte LZMA2 dictionary-size property from the XZ filter
/// properties. `40` encodes the full 4 GiB - 1; larger values are invalid.
pub(crate) fn dict_size_from_prop(prop: u8) -> Result<u32> {
    if prop > 40 {
        return Err(error_invalid_input("invalid LZMA2 dictionary size property"));
    }
    Ok(if prop == 40 {
        u32::MAX
    } else {
        (2 | (prop & 1) as u32) << (prop / 2 + 11)
    })
}

/// A single-threaded LZMA2 decompressor.
///
/// # Examples
/// ```
/// use std::io::Read;
///
/// use xzdec::{Lzma2Reader, DICT_SIZE_MIN};
///
/// let compressed: Vec<u8> = vec![
///     1, 0, 12, 72, 101, 108, 108, 111, 44, 32, 119, 111, 114, 108, 100, 33, 0,
/// ];
/// let mut reader = Lzma2Reader::new(compressed.as_slice(), DICT_SIZE_MIN, None);
/// let mut decompressed = Vec::new();
/// reader.read_to_end(&mut decompressed).unwrap();
/// assert_eq!(&decompressed[..], b"Hello, world!");
/// ```
pub struct Lzma2Reader<R> {
    inner: R,
    lz: LzDecoder,
    rc: RangeDecoder<RangeDecoderBuffer>,
    lzma: Option<LzmaDecoder>,
    uncompressed_size: usize,
    is_lzma_chunk: bool,
    need_dict_reset: bool,
    need_props: bool,
    end_reached: bool,
    error: Option<Error>,
}

impl<R> Lzma2Reader<R> {
    /// Unwraps the reader, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Lzma2Reader<R> {
    /// Create a new LZMA2 reader.
    ///
    /// `dict_size` is the dictionary size in bytes. With a non-empty
    /// `preset_dict` the first chunk may reference the preset bytes and is
    /// not required to reset the dictionary.
    pub fn new(inner: R, dict_size: u32, preset_dict: Option<&[u8]>) -> Self {
        let has_preset = preset_dict.map(|dict| !dict.is_empty()).unwrap_or(false);
        let lz = LzDecoder::new(get_dict_size(dict_size) as _, preset_dict);
        let rc = RangeDecoder::new_buffer(COMPRESSED_SIZE_MAX as _);
        Self {
            inner,
            lz,
            rc,
            lzma: None,
            uncompressed_size: 0,
            is_lzma_chunk: false,
            need_dict_reset: !has_preset,
            need_props: true,
            end_reached: false,
            error: None,
        }
    }

    // ### LZMA2 control byte
    //
    //  Control byte    | Chunk type      | Action
    //  --------------- | --------------- | ----------------------------
    //  0x00            | End of stream   | Terminates the LZMA2 stream.
    //  0x01            | Uncompressed    | Resets dictionary.
    //  0x02            | Uncompressed    | Preserves dictionary.
    //  0x03 - 0x7F     | Reserved        | Invalid stream.
    //  0x80 - 0x9F     | LZMA            | No resets.
    //  0xA0 - 0xBF     | LZMA            | Resets state.
    //  0xC0 - 0xDF     | LZMA            | Resets state, new props.
    //  0xE0 - 0xFF     | LZMA            | Resets state, props and dict.
    fn decode_chunk_header(&mut self) -> Result<()> {
        let control = self.inner.read_u8()?;

        if control == 0x00 {
            self.end_reached = true;
            return Ok(());
        }

        if (0x03..0x80).contains(&control) {
            return Err(error_invalid_data("reserved LZMA2 control byte"));
        }

        if control >= 0xE0 || control == 0x01 {
            self.need_props = true;
            self.need_dict_reset = false;
            self.lz.reset();
        } else if self.need_dict_reset {
            return Err(error_invalid_data(
                "first LZMA2 chunk must reset the dictionary",
            ));
        }

        if control >= 0x80 {
            self.is_lzma_chunk = true;
            self.uncompressed_size = ((control & 0x1F) as usize) << 16;
            self.uncompressed_size += self.inner.read_u16_be()? as usize + 1;
            let compressed_size = self.inner.read_u16_be()? as usize + 1;

            if control >= 0xC0 {
                // Reset props and state by re-creating the decoder.
                self.need_props = false;
                self.decode_props()?;
            } else if self.need_props {
                return Err(error_invalid_data("LZMA2 chunk without properties"));
            } else if control >= 0xA0 {
                if let Some(lzma) = self.lzma.as_mut() {
                    lzma.reset()
                }
            }

            self.rc.prepare(&mut self.inner, compressed_size)?;
        } else {
            self.is_lzma_chunk = false;
            self.uncompressed_size = self.inner.read_u16_be()? as usize + 1;
        }
        Ok(())
    }

    fn decode_props(&mut self) -> Result<()> {
        let props = self.inner.read_u8()?;
        if props > (4 * 5 + 4) * 9 + 8 {
            return Err(error_invalid_input("invalid LZMA2 properties byte"));
        }
        let pb = props / (9 * 5);
        let props = props - pb * 9 * 5;
        let lp = props / 9;
        let lc = props - lp * 9;
        if lc + lp > 4 {
            return Err(error_invalid_input("lc + lp must not exceed 4"));
        }
        self.lzma = Some(LzmaDecoder::new(lc as _, lp as _, pb as _));

        Ok(())
    }

    fn read_decode(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(error) = &self.error {
            return Err(copy_error(error));
        }
        if self.end_reached {
            return Ok(0);
        }

        let mut size = 0;
        let mut len = buf.len();
        let mut off = 0;
        while len > 0 {
            if self.uncompressed_size == 0 {
                self.decode_chunk_header()?;
                if self.end_reached {
                    return Ok(size);
                }
            }

            let copy_size_max = self.uncompressed_size.min(len);
            if !self.is_lzma_chunk {
                self.lz.copy_uncompressed(&mut self.inner, copy_size_max)?;
            } else {
                self.lz.set_limit(copy_size_max);
                if let Some(lzma) = self.lzma.as_mut() {
                    lzma.decode(&mut self.lz, &mut self.rc)?;
                }
            }

            let copied_size = self.lz.flush(buf, off);
            off += copied_size;
            len -= copied_size;
            size += copied_size;
            self.uncompressed_size -= copied_size;
            if self.uncompressed_size == 0 && (!self.rc.is_finished() || self.lz.has_pending()) {
                return Err(error_invalid_data(
                    "compressed size of the chunk was not consumed exactly",
                ));
            }
        }
        Ok(size)
    }
}

impl<R: Read> Read for Lzma2Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.read_decode(buf) {
            Ok(size) => Ok(size),
            Err(error) => {
                self.error = Some(copy_error(&error));
                Err(error)
            }
        }
    }
}
