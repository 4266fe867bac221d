//! XZ container format decoding.

mod reader;
mod stream;

pub use reader::XzReader;
use sha2::Digest;
pub use stream::XzStreamDecoder;

use crate::{
    error_invalid_data, error_unsupported, lzma2_reader::dict_size_from_prop, ByteReader, Read,
    Result,
};

pub(crate) const CRC32: crc::Crc<u32, crc::Table<16>> =
    crc::Crc::<u32, crc::Table<16>>::new(&crc::CRC_32_ISO_HDLC);
pub(crate) const CRC64: crc::Crc<u64, crc::Table<16>> =
    crc::Crc::<u64, crc::Table<16>>::new(&crc::CRC_64_XZ);

/// XZ stream magic bytes: 0xFD, '7', 'z', 'X', 'Z', 0x00
pub(crate) const XZ_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];

/// XZ stream footer magic bytes.
pub(crate) const XZ_FOOTER_MAGIC: [u8; 2] = [b'Y', b'Z'];

/// Supported checksum types in XZ format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckType {
    /// No checksum
    None = 0x00,
    /// CRC32
    Crc32 = 0x01,
    /// CRC64
    Crc64 = 0x04,
    /// SHA-256
    Sha256 = 0x0A,
}

impl CheckType {
    pub(crate) fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(CheckType::None),
            0x01 => Ok(CheckType::Crc32),
            0x04 => Ok(CheckType::Crc64),
            0x0A => Ok(CheckType::Sha256),
            _ => Err(error_unsupported("unsupported XZ check type")),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum FilterType {
    Delta,
    BcjX86,
    BcjPpc,
    BcjIa64,
    BcjArm,
    BcjArmThumb,
    BcjSparc,
    BcjArm64,
    Lzma2,
}

impl TryFrom<u64> for FilterType {
    type Error = ();

    fn try_from(value: u64) -> core::result::Result<Self, Self::Error> {
        match value {
            0x03 => Ok(FilterType::Delta),
            0x04 => Ok(FilterType::BcjX86),
            0x05 => Ok(FilterType::BcjPpc),
            0x06 => Ok(FilterType::BcjIa64),
            0x07 => Ok(FilterType::BcjArm),
            0x08 => Ok(FilterType::BcjArmThumb),
            0x09 => Ok(FilterType::BcjSparc),
            0x0A => Ok(FilterType::BcjArm64),
            0x21 => Ok(FilterType::Lzma2),
            _ => Err(()),
        }
    }
}

/// XZ index record containing block metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexRecord {
    pub(crate) unpadded_size: u64,
    pub(crate) uncompressed_size: u64,
}

/// Reads an XZ multibyte integer (little-endian base-128, at most nine
/// bytes for 63 bits), appending the raw bytes to `raw`.
pub(crate) fn read_multibyte_integer<R: Read>(reader: &mut R, raw: &mut Vec<u8>) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;
        raw.push(byte);

        if shift >= 63 {
            return Err(error_invalid_data("XZ multibyte integer too large"));
        }

        result |= ((byte & 0x7F) as u64) << shift;
        shift += 7;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }
    }
}

/// Parses a multibyte integer from a slice, advancing `pos`.
fn parse_multibyte_integer(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    while let Some(&byte) = data.get(*pos) {
        *pos += 1;

        if shift >= 63 {
            return Err(error_invalid_data("XZ multibyte integer too large"));
        }

        result |= ((byte & 0x7F) as u64) << shift;
        shift += 7;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }
    }

    Err(error_invalid_data("incomplete XZ multibyte integer"))
}

/// The two stream-flag bytes with the decoded check type.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamHeader {
    pub(crate) check_type: CheckType,
    pub(crate) flags: [u8; 2],
}

impl StreamHeader {
    pub(crate) fn parse<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 12];
        reader.read_exact(&mut header)?;
        Self::from_bytes(&header)
    }

    pub(crate) fn from_bytes(header: &[u8; 12]) -> Result<Self> {
        if header[..6] != XZ_MAGIC {
            return Err(error_invalid_data("invalid XZ stream magic"));
        }

        let flags = [header[6], header[7]];
        if flags[0] != 0 || flags[1] & 0xF0 != 0 {
            return Err(error_unsupported("reserved XZ stream flags"));
        }
        let check_type = CheckType::from_byte(flags[1] & 0x0F)?;

        let crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if CRC32.checksum(&flags) != crc {
            return Err(error_invalid_data("stream header CRC32 mismatch"));
        }

        Ok(Self { check_type, flags })
    }
}

/// A parsed block header: declared sizes and the filter chain in the order
/// it was applied during encoding (LZMA2 last).
#[derive(Debug, Clone)]
pub(crate) struct BlockHeader {
    pub(crate) header_size: u32,
    pub(crate) compressed_size: Option<u64>,
    pub(crate) uncompressed_size: Option<u64>,
    pub(crate) filters: Vec<(FilterType, u32)>,
}

impl BlockHeader {
    /// Parses a block header, or returns `None` when the index indicator
    /// is found in its place.
    pub(crate) fn parse<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let size_byte = reader.read_u8()?;
        if size_byte == 0x00 {
            // Index indicator: no more blocks in this stream.
            return Ok(None);
        }

        let header_size = (size_byte as u32 + 1) * 4;
        let mut body = vec![0u8; header_size as usize - 1];
        reader.read_exact(&mut body)?;

        let crc_pos = body.len() - 4;
        let crc = u32::from_le_bytes([
            body[crc_pos],
            body[crc_pos + 1],
            body[crc_pos + 2],
            body[crc_pos + 3],
        ]);
        let mut digest = CRC32.digest();
        digest.update(&[size_byte]);
        digest.update(&body[..crc_pos]);
        if digest.finalize() != crc {
            return Err(error_invalid_data("block header CRC32 mismatch"));
        }

        // Everything before the CRC; truncated fields error instead of
        // running into the checksum bytes.
        let content = &body[..crc_pos];

        let flags = content[0];
        if flags & 0x3C != 0 {
            return Err(error_unsupported("reserved block header flags"));
        }
        let num_filters = (flags & 0x03) as usize + 1;

        let mut pos = 1;
        let compressed_size = if flags & 0x40 != 0 {
            Some(non_zero_size(parse_multibyte_integer(content, &mut pos)?)?)
        } else {
            None
        };
        let uncompressed_size = if flags & 0x80 != 0 {
            Some(parse_multibyte_integer(content, &mut pos)?)
        } else {
            None
        };

        let mut filters = Vec::with_capacity(num_filters);
        for _ in 0..num_filters {
            let id = parse_multibyte_integer(content, &mut pos)?;
            let filter_type =
                FilterType::try_from(id).map_err(|_| error_unsupported("unsupported filter ID"))?;
            let props_size = parse_multibyte_integer(content, &mut pos)? as usize;
            let props = content
                .get(pos..pos + props_size)
                .ok_or_else(|| error_invalid_data("block header too small for filter properties"))?;
            pos += props_size;

            let property = match filter_type {
                FilterType::Lzma2 => {
                    if props_size != 1 {
                        return Err(error_invalid_data("invalid LZMA2 filter properties"));
                    }
                    dict_size_from_prop(props[0])?
                }
                FilterType::Delta => {
                    if props_size != 1 {
                        return Err(error_invalid_data("invalid Delta filter properties"));
                    }
                    props[0] as u32 + 1
                }
                _ => match props_size {
                    0 => 0,
                    4 => u32::from_le_bytes([props[0], props[1], props[2], props[3]]),
                    _ => return Err(error_invalid_data("invalid BCJ filter properties")),
                },
            };

            filters.push((filter_type, property));
        }

        // The filter chain must end with LZMA2 and use it nowhere else.
        let lzma2_last = matches!(filters.last(), Some((FilterType::Lzma2, _)));
        let lzma2_count = filters
            .iter()
            .filter(|(filter, _)| *filter == FilterType::Lzma2)
            .count();
        if !lzma2_last || lzma2_count != 1 {
            return Err(error_invalid_data("block filter chain must end with LZMA2"));
        }

        if content[pos..].iter().any(|&byte| byte != 0) {
            return Err(error_invalid_data("non-zero block header padding"));
        }

        Ok(Some(Self {
            header_size,
            compressed_size,
            uncompressed_size,
            filters,
        }))
    }
}

fn non_zero_size(value: u64) -> Result<u64> {
    if value == 0 {
        return Err(error_invalid_data("declared compressed size is zero"));
    }
    Ok(value)
}

/// Handles checksum calculation for the different XZ check types.
pub(crate) enum ChecksumCalculator {
    None,
    Crc32(crc::Digest<'static, u32, crc::Table<16>>),
    Crc64(crc::Digest<'static, u64, crc::Table<16>>),
    Sha256(sha2::Sha256),
}

impl ChecksumCalculator {
    pub(crate) fn new(check_type: CheckType) -> Self {
        match check_type {
            CheckType::None => Self::None,
            CheckType::Crc32 => Self::Crc32(CRC32.digest()),
            CheckType::Crc64 => Self::Crc64(CRC64.digest()),
            CheckType::Sha256 => Self::Sha256(sha2::Sha256::new()),
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        match self {
            ChecksumCalculator::None => {}
            ChecksumCalculator::Crc32(crc) => crc.update(data),
            ChecksumCalculator::Crc64(crc) => crc.update(data),
            ChecksumCalculator::Sha256(sha) => sha.update(data),
        }
    }

    pub(crate) fn checksum_size(&self) -> usize {
        match self {
            ChecksumCalculator::None => 0,
            ChecksumCalculator::Crc32(_) => 4,
            ChecksumCalculator::Crc64(_) => 8,
            ChecksumCalculator::Sha256(_) => 32,
        }
    }

    pub(crate) fn verify(&self, expected: &[u8]) -> bool {
        match self {
            ChecksumCalculator::None => true,
            ChecksumCalculator::Crc32(crc) => {
                if expected.len() != 4 {
                    return false;
                }
                let expected =
                    u32::from_le_bytes([expected[0], expected[1], expected[2], expected[3]]);
                crc.clone().finalize() == expected
            }
            ChecksumCalculator::Crc64(crc) => {
                if expected.len() != 8 {
                    return false;
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(expected);
                crc.clone().finalize() == u64::from_le_bytes(bytes)
            }
            ChecksumCalculator::Sha256(sha) => {
                if expected.len() != 32 {
                    return false;
                }
                let digest = sha.clone().finalize();
                &digest[..] == expected
            }
        }
    }
}
