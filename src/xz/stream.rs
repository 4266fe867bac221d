use crate::{decode_xz, Result};

/// Push-style XZ decoder for input that arrives in chunks.
///
/// The XZ index lives at the end of a stream, so this decoder accumulates
/// everything it is given and decodes once [`finish`](Self::finish) is
/// called. Any decode error surfaces at `finish`; output produced for any
/// chunk partitioning is identical to a one-shot [`decode_xz`] of the
/// concatenated input.
///
/// # Examples
/// ```no_run
/// use xzdec::XzStreamDecoder;
///
/// # fn demo(chunks: &[Vec<u8>]) -> std::io::Result<Vec<u8>> {
/// let mut decoder = XzStreamDecoder::new();
/// let mut out = Vec::new();
/// for chunk in chunks {
///     out.extend(decoder.push(chunk)?);
/// }
/// out.extend(decoder.finish()?);
/// # Ok(out)
/// # }
/// ```
#[derive(Default)]
pub struct XzStreamDecoder {
    buffer: Vec<u8>,
}

impl XzStreamDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of compressed input.
    ///
    /// Returns the decoded bytes that became available, which may be empty;
    /// this implementation defers all decoding to [`finish`](Self::finish).
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        Ok(Vec::new())
    }

    /// Signals the end of input and returns the remaining decoded bytes.
    pub fn finish(self) -> Result<Vec<u8>> {
        decode_xz(&self.buffer)
    }
}
