use std::{cell::Cell, rc::Rc};

use super::{
    read_multibyte_integer, BlockHeader, ChecksumCalculator, FilterType, IndexRecord,
    StreamHeader, CRC32, XZ_FOOTER_MAGIC,
};
use crate::{
    error_invalid_data, error_out_of_memory,
    filter::{bcj::BcjReader, delta::DeltaReader},
    ByteReader, Lzma2Reader, Read, Result, DICT_SIZE_LIMIT,
};

/// Counts every byte pulled from the wrapped reader. The count is shared
/// with the [`XzReader`] so padding and size bookkeeping survive while the
/// reader is buried under a filter chain.
struct BaseReader<R> {
    inner: R,
    bytes_read: Rc<Cell<u64>>,
}

impl<R> BaseReader<R> {
    fn new(inner: R, bytes_read: Rc<Cell<u64>>) -> Self {
        Self { inner, bytes_read }
    }

    fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for BaseReader<R> {
    #[inline(always)]
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let read_size = self.inner.read(buf)?;
        self.bytes_read.set(self.bytes_read.get() + read_size as u64);
        Ok(read_size)
    }
}

/// Caps reads at the block's declared compressed size.
struct BoundedReader<R> {
    inner: R,
    position: u64,
    limit: u64,
}

impl<R> BoundedReader<R> {
    fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            position: 0,
            limit,
        }
    }

    fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.position >= self.limit {
            return Ok(0);
        }

        let left = (self.limit - self.position).min(buf.len() as u64) as usize;
        let read_size = self.inner.read(&mut buf[..left])?;
        self.position += read_size as u64;
        Ok(read_size)
    }
}

/// One block's decoder pipeline as a tagged sum.
///
/// Between blocks the chain is just the counted base reader; for a block it
/// is rebuilt as LZMA2 innermost with the declared preprocessing filters
/// stacked on top, and unwound back to the base once the block is done.
enum ChainReader<R> {
    Base(BaseReader<R>),
    Bounded(BoundedReader<Box<ChainReader<R>>>),
    Delta(DeltaReader<Box<ChainReader<R>>>),
    Bcj(BcjReader<Box<ChainReader<R>>>),
    Lzma2(Lzma2Reader<Box<ChainReader<R>>>),
}

impl<R: Read> ChainReader<R> {
    fn into_base(self) -> BaseReader<R> {
        let mut chain = self;
        loop {
            chain = match chain {
                ChainReader::Base(base) => return base,
                ChainReader::Bounded(reader) => *reader.into_inner(),
                ChainReader::Delta(reader) => *reader.into_inner(),
                ChainReader::Bcj(reader) => *reader.into_inner(),
                ChainReader::Lzma2(reader) => *reader.into_inner(),
            };
        }
    }
}

impl<R: Read> Read for ChainReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            ChainReader::Base(reader) => reader.read(buf),
            ChainReader::Bounded(reader) => reader.read(buf),
            ChainReader::Delta(reader) => reader.read(buf),
            ChainReader::Bcj(reader) => reader.read(buf),
            ChainReader::Lzma2(reader) => reader.read(buf),
        }
    }
}

/// Streaming XZ decoder.
///
/// Iterates the blocks of a stream, decodes each through its declared
/// filter chain and verifies block checksums, the index and the footer.
/// Concatenated streams separated by 4-byte-aligned zero padding are
/// decoded back to back.
pub struct XzReader<R> {
    chain: Option<ChainReader<R>>,
    stream_header: Option<StreamHeader>,
    block_header: Option<BlockHeader>,
    check: Option<ChecksumCalculator>,
    records: Vec<IndexRecord>,
    bytes_read: Rc<Cell<u64>>,
    block_compressed_start: u64,
    block_uncompressed: u64,
    in_block: bool,
    finished: bool,
}

impl<R: Read> XzReader<R> {
    /// Creates a new XZ reader.
    pub fn new(inner: R) -> Self {
        let bytes_read = Rc::new(Cell::new(0));
        Self {
            chain: Some(ChainReader::Base(BaseReader::new(
                inner,
                Rc::clone(&bytes_read),
            ))),
            stream_header: None,
            block_header: None,
            check: None,
            records: Vec::new(),
            bytes_read,
            block_compressed_start: 0,
            block_uncompressed: 0,
            in_block: false,
            finished: false,
        }
    }

    /// Consumes the reader and returns the wrapped reader.
    pub fn into_inner(mut self) -> R {
        self.chain
            .take()
            .expect("chain not set")
            .into_base()
            .into_inner()
    }

    fn chain_mut(&mut self) -> &mut ChainReader<R> {
        self.chain.as_mut().expect("chain not set")
    }

    /// Parses the next block header and stacks up the block's filter chain.
    /// Returns `false` when the index indicator is found instead.
    fn prepare_next_block(&mut self) -> Result<bool> {
        let Some(header) = BlockHeader::parse(self.chain_mut())? else {
            return Ok(false);
        };

        for &(filter, property) in &header.filters {
            if filter == FilterType::Lzma2 && property > DICT_SIZE_LIMIT {
                return Err(error_out_of_memory("dictionary size exceeds the 1 GiB limit"));
            }
        }

        let base = self.chain.take().expect("chain not set").into_base();
        self.block_compressed_start = self.bytes_read.get();

        let mut chain = match header.compressed_size {
            Some(size) => {
                ChainReader::Bounded(BoundedReader::new(Box::new(ChainReader::Base(base)), size))
            }
            None => ChainReader::Base(base),
        };

        // Decoding applies the chain in reverse declaration order: LZMA2
        // first, then the preprocessing filters.
        for &(filter, property) in header.filters.iter().rev() {
            let inner = Box::new(chain);
            chain = match filter {
                FilterType::Lzma2 => ChainReader::Lzma2(Lzma2Reader::new(inner, property, None)),
                FilterType::Delta => {
                    ChainReader::Delta(DeltaReader::new(inner, property as usize))
                }
                FilterType::BcjX86 => ChainReader::Bcj(BcjReader::new_x86(inner, property as _)),
                FilterType::BcjPpc => ChainReader::Bcj(BcjReader::new_ppc(inner, property as _)),
                FilterType::BcjIa64 => ChainReader::Bcj(BcjReader::new_ia64(inner, property as _)),
                FilterType::BcjArm => ChainReader::Bcj(BcjReader::new_arm(inner, property as _)),
                FilterType::BcjArmThumb => {
                    ChainReader::Bcj(BcjReader::new_arm_thumb(inner, property as _))
                }
                FilterType::BcjSparc => {
                    ChainReader::Bcj(BcjReader::new_sparc(inner, property as _))
                }
                FilterType::BcjArm64 => {
                    ChainReader::Bcj(BcjReader::new_arm64(inner, property as _))
                }
            };
        }

        self.chain = Some(chain);
        let check_type = self
            .stream_header
            .as_ref()
            .expect("stream header not set")
            .check_type;
        self.check = Some(ChecksumCalculator::new(check_type));
        self.block_header = Some(header);
        self.block_uncompressed = 0;
        self.in_block = true;
        Ok(true)
    }

    /// Unwinds the finished block, validates its sizes, padding and check
    /// field, and records it for index verification.
    fn finish_block(&mut self) -> Result<()> {
        let base = self.chain.take().expect("chain not set").into_base();
        self.chain = Some(ChainReader::Base(base));
        self.in_block = false;

        let header = self.block_header.take().expect("block header not set");
        let compressed_size = self.bytes_read.get() - self.block_compressed_start;
        if let Some(declared) = header.compressed_size {
            if declared != compressed_size {
                return Err(error_invalid_data(
                    "compressed size differs from block header",
                ));
            }
        }
        if let Some(declared) = header.uncompressed_size {
            if declared != self.block_uncompressed {
                return Err(error_invalid_data(
                    "uncompressed size differs from block header",
                ));
            }
        }

        self.consume_padding()?;

        let calc = self.check.take().expect("checksum calculator not set");
        let checksum_size = calc.checksum_size();
        let mut checksum = [0u8; 32];
        self.chain_mut().read_exact(&mut checksum[..checksum_size])?;
        if !calc.verify(&checksum[..checksum_size]) {
            return Err(error_invalid_data("invalid block checksum"));
        }

        self.records.push(IndexRecord {
            unpadded_size: header.header_size as u64 + compressed_size + checksum_size as u64,
            uncompressed_size: self.block_uncompressed,
        });
        Ok(())
    }

    /// Consumes zero bytes until the input returns to 4-byte alignment.
    fn consume_padding(&mut self) -> Result<()> {
        let padding = ((4 - (self.bytes_read.get() % 4)) % 4) as usize;
        if padding == 0 {
            return Ok(());
        }

        let mut pad = [0u8; 3];
        self.chain_mut().read_exact(&mut pad[..padding])?;
        if pad[..padding].iter().any(|&byte| byte != 0) {
            return Err(error_invalid_data("non-zero block padding"));
        }
        Ok(())
    }

    /// Reads the stream index and footer, checking both against the blocks
    /// that were actually decoded. The index indicator byte has already
    /// been consumed.
    fn read_index_and_footer(&mut self) -> Result<()> {
        let mut raw = Vec::new();
        let count = read_multibyte_integer(self.chain_mut(), &mut raw)?;
        if count != self.records.len() as u64 {
            return Err(error_invalid_data("index record count mismatch"));
        }

        for i in 0..self.records.len() {
            let unpadded_size = read_multibyte_integer(self.chain_mut(), &mut raw)?;
            let uncompressed_size = read_multibyte_integer(self.chain_mut(), &mut raw)?;
            let record = &self.records[i];
            if unpadded_size != record.unpadded_size
                || uncompressed_size != record.uncompressed_size
            {
                return Err(error_invalid_data("index does not match decoded blocks"));
            }
        }

        let padding = (4 - ((1 + raw.len()) % 4)) % 4;
        let mut pad = [0u8; 3];
        self.chain_mut().read_exact(&mut pad[..padding])?;
        if pad[..padding].iter().any(|&byte| byte != 0) {
            return Err(error_invalid_data("non-zero index padding"));
        }

        let mut digest = CRC32.digest();
        digest.update(&[0x00]);
        digest.update(&raw);
        digest.update(&pad[..padding]);
        let crc = self.chain_mut().read_u32()?;
        if digest.finalize() != crc {
            return Err(error_invalid_data("index CRC32 mismatch"));
        }

        let index_size = (1 + raw.len() + padding + 4) as u64;

        let mut footer = [0u8; 12];
        self.chain_mut().read_exact(&mut footer)?;
        if footer[10..12] != XZ_FOOTER_MAGIC {
            return Err(error_invalid_data("invalid stream footer magic"));
        }
        let stored_crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        if CRC32.checksum(&footer[4..10]) != stored_crc {
            return Err(error_invalid_data("stream footer CRC32 mismatch"));
        }
        let backward_size =
            (u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]) as u64 + 1) * 4;
        if backward_size != index_size {
            return Err(error_invalid_data("backward size does not match index"));
        }
        let header = self.stream_header.as_ref().expect("stream header not set");
        if footer[8..10] != header.flags {
            return Err(error_invalid_data("stream footer flags mismatch"));
        }

        Ok(())
    }

    /// Skips stream padding and starts the next concatenated stream.
    /// Returns `false` at the end of the input.
    fn begin_next_stream(&mut self) -> Result<bool> {
        loop {
            let mut quad = [0u8; 4];
            let got = read_full(self.chain_mut(), &mut quad)?;
            if got == 0 {
                return Ok(false);
            }
            if got < 4 {
                return Err(error_invalid_data("truncated stream padding"));
            }
            if quad == [0u8; 4] {
                // Stream padding comes in zeroed 4-byte units.
                continue;
            }

            let mut header = [0u8; 12];
            header[..4].copy_from_slice(&quad);
            self.chain_mut().read_exact(&mut header[4..])?;
            self.stream_header = Some(StreamHeader::from_bytes(&header)?);
            self.records.clear();
            return Ok(true);
        }
    }
}

/// Reads until `buf` is full or the reader is exhausted, returning the
/// number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

impl<R: Read> Read for XzReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.finished {
            return Ok(0);
        }

        if self.stream_header.is_none() {
            self.stream_header = Some(StreamHeader::parse(self.chain_mut())?);
        }

        loop {
            if self.in_block {
                let read_size = self.chain_mut().read(buf)?;
                if read_size > 0 {
                    if let Some(calc) = self.check.as_mut() {
                        calc.update(&buf[..read_size]);
                    }
                    self.block_uncompressed += read_size as u64;
                    return Ok(read_size);
                }
                self.finish_block()?;
            } else if !self.prepare_next_block()? {
                self.read_index_and_footer()?;
                if !self.begin_next_stream()? {
                    self.finished = true;
                    return Ok(0);
                }
            }
        }
    }
}
