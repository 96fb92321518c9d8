//! Compression Operations

use crate::Compression;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::io::{Read, Write};
use tracing::instrument;
use zstd::stream::{read::Decoder as ZstdDecoder, write::Encoder as ZstdEncoder};

// Blobs are written once per build at most and read back far more often, so
// neither tier goes anywhere near the slow end of zstd's range.
const ZSTD_FAST_LEVEL: i32 = 1;
const ZSTD_DEFAULT_LEVEL: i32 = 3;

impl Compression {
    fn level(&self) -> Option<i32> {
        match self {
            Compression::None => None,
            Compression::ZstdFast => Some(ZSTD_FAST_LEVEL),
            Compression::Zstd => Some(ZSTD_DEFAULT_LEVEL),
        }
    }

    /// Compress a byte slice in memory.
    ///
    /// # Examples
    ///
    /// ```
    /// use kosh_compress::Compression;
    ///
    /// let data = b"Hello, world!";
    /// let compressed = Compression::Zstd.compress(data).unwrap();
    /// assert_ne!(compressed, data);
    /// ```
    pub fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        self.compress_into(input, &mut output)?;
        Ok(output)
    }

    /// Decompress a byte slice in memory.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use kosh_compress::Compression;
    ///
    /// let original = b"Hello, world!";
    /// let compressed = Compression::ZstdFast.compress(original).unwrap();
    /// let decompressed = Compression::ZstdFast.decompress(&compressed).unwrap();
    /// assert_eq!(decompressed, original);
    /// ```
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        self.decompress_into(input, &mut output)?;
        Ok(output)
    }

    #[instrument(skip(input, output), fields(
        format = %self,
        input_size = input.len(),
        output_size
    ))]
    pub fn compress_into(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        let size = match self.level() {
            None => {
                output.extend_from_slice(input);
                input.len()
            },
            Some(level) => {
                let mut encoder = ZstdEncoder::new(&mut *output, level).or_raise(|| ErrorKind::Encoder)?;
                encoder.write_all(input).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?;
                output.len()
            },
        };
        tracing::Span::current().record("output_size", size);
        Ok(size)
    }

    #[instrument(skip(input, output), fields(
        format = %self,
        input_size = input.len(),
        output_size
    ))]
    pub fn decompress_into(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        let size = match self {
            Compression::None => {
                output.extend_from_slice(input);
                input.len()
            },
            Compression::ZstdFast | Compression::Zstd => {
                let mut decoder = ZstdDecoder::new(input).or_raise(|| ErrorKind::Encoder)?;
                decoder.read_to_end(output).or_raise(|| ErrorKind::InvalidData)?
            },
        };
        tracing::Span::current().record("output_size", size);
        Ok(size)
    }
}
